//! A speculative pre-cache proxy.
//!
//! Requests pass through [`cancel::CancelOnToken`], then
//! [`precache::PreCache`], then the upstream network handler. Priming requests
//! are scheduled on a [`queue::PriorityTaskQueue`]; real requests consume the
//! primed result once.

pub mod cancel;
pub mod config;
pub mod error;
pub mod handler;
pub mod infra;
pub mod precache;
pub mod queue;
mod util;
