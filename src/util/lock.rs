//! Lock acquisition that survives poisoning.
//!
//! Every shared structure in this crate is left consistent between statements,
//! so a panic in another holder never leaves half-applied state behind. The
//! guard is recovered and the event is logged instead of propagating the panic.

use std::sync::{
    Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use tracing::warn;

fn recover<G>(
    poisoned: PoisonError<G>,
    owner: &'static str,
    op: &'static str,
    lock_kind: &'static str,
) -> G {
    warn!(
        op,
        owner,
        lock_kind,
        result = "poisoned_recovered",
        "Recovered from poisoned lock"
    );
    poisoned.into_inner()
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    owner: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock()
        .unwrap_or_else(|poisoned| recover(poisoned, owner, op, "mutex.lock"))
}

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    owner: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    lock.read()
        .unwrap_or_else(|poisoned| recover(poisoned, owner, op, "rwlock.read"))
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    owner: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    lock.write()
        .unwrap_or_else(|poisoned| recover(poisoned, owner, op, "rwlock.write"))
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn mutex_lock_recovers_after_panic() {
        let lock = Mutex::new(vec![1]);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let mut guard = lock.lock().expect("lock should be acquired");
            guard.push(2);
            panic!("poison the mutex");
        }));

        assert!(lock.is_poisoned());
        let guard = mutex_lock(&lock, "tests", "recover");
        assert_eq!(*guard, vec![1, 2]);
    }

    #[test]
    fn rw_write_recovers_after_panic() {
        let lock = RwLock::new(0_u32);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.write().expect("lock should be acquired");
            panic!("poison the rwlock");
        }));

        *rw_write(&lock, "tests", "recover") += 1;
        assert_eq!(*rw_read(&lock, "tests", "recover"), 1);
    }
}
