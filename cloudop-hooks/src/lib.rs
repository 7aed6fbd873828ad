//! Lifecycle hooks for resource transitions.
//!
//! A transition (create, update, delete) may call any number of
//! independently-authored extension handlers. Their responses are collected in
//! a [`HookResponseTracker`] that lives for exactly one transition and reduces
//! them to one retry interval and one blocking message.
//!
//! # Example
//!
//! ```ignore
//! use cloudop_hooks::{Hook, HookDecision, HookRequest, HookResponseTracker, HookRuntime};
//!
//! let mut tracker = HookResponseTracker::new();
//! runtime
//!     .track_all(&HookRequest::new(Hook::BeforeDelete, "rg-1/vnet-1"), &mut tracker)
//!     .await?;
//!
//! if let HookDecision::Blocked { retry_after, message } = tracker.decision() {
//!     return requeue(retry_after, message);
//! }
//! ```

mod catalog;
mod error;
mod response;
mod runtime;
mod tracker;

pub use catalog::Hook;
pub use error::HookError;
pub use response::{HookResponse, ResponseStatus};
pub use runtime::{DEFAULT_HOOK_TIMEOUT, ExtensionHandler, HookRequest, HookRuntime};
pub use tracker::{HookDecision, HookResponseTracker};
