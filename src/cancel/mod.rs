//! Named, revocable cancellation tokens.
//!
//! The registry maps a token name to the live [`CancellationToken`] for that
//! name. Requests opt into a group by naming it in the `cancel-token` header;
//! revoking the name cancels every request bound to the current token and
//! installs a fresh one, so later requests under the same name run normally.

mod layer;

use dashmap::DashMap;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::handler::CancelBinding;

pub use layer::CancelOnToken;

/// Name of the token revoked when the analyst's working interval changes.
pub const CANCEL_ON_INTERVAL_CLOSE: &str = "CANCEL_ON_INTERVAL_CLOSE";

const METRIC_TOKEN_REVOKED: &str = "precache_token_revoked_total";

/// Process-wide table of cancellation tokens, one live token per name.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    tokens: DashMap<String, CancellationToken>,
}

impl CancellationRegistry {
    /// Build a registry with an armed token for each name.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens = names
            .into_iter()
            .map(|name| (name.into(), CancellationToken::new()))
            .collect();
        Self { tokens }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tokens.contains_key(name)
    }

    /// The live token for `name`.
    pub fn token(&self, name: &str) -> Option<CancellationToken> {
        self.tokens.get(name).map(|token| token.clone())
    }

    /// Bind a request to the live token for `name`. Unknown names yield `None`.
    pub fn bind(&self, name: &str) -> Option<CancelBinding> {
        self.tokens.get(name).map(|entry| CancelBinding {
            name: entry.key().clone(),
            token: entry.value().clone(),
        })
    }

    /// Cancel everything bound to `name` and re-arm it with a fresh token.
    ///
    /// Returns false, doing nothing, when `name` is not registered.
    pub fn revoke(&self, name: &str) -> bool {
        let Some(mut slot) = self.tokens.get_mut(name) else {
            debug!(token = name, "revoke ignored for unknown token");
            return false;
        };
        let revoked = std::mem::replace(&mut *slot, CancellationToken::new());
        drop(slot);

        revoked.cancel();
        counter!(METRIC_TOKEN_REVOKED, "token" => name.to_string()).increment(1);
        info!(token = name, "cancellation token revoked and re-armed");
        true
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tokens.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}
