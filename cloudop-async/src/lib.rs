//! Asynchronous provider operations for level-triggered reconcilers.
//!
//! Provider operations (create, update, delete) run for minutes while each
//! reconciliation pass is a fresh, short call. This crate keeps the in-flight
//! operation in the owning resource's status and resumes polling it on the
//! next pass instead of blocking.
//!
//! # Architecture
//!
//! ```text
//! AsyncReconciler::create_resource(spec)
//!     ├── store.get_operation(key)        // pending descriptor? → poll it
//!     │       ├── client.is_done(d)       // false → Reconciled::Pending
//!     │       └── client.result(d, kind)  // true  → clear, Reconciled::Ready
//!     └── client.get(spec)                // no descriptor → diff observed state
//!             └── client.create_or_update_async(spec, existing)
//!                     └── store.set_operation(key, d)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use cloudop_async::{AsyncReconciler, MemoryStatusStore, Reconciled, ReconcilerConfig};
//!
//! let store = Arc::new(MemoryStatusStore::new());
//! let reconciler = AsyncReconciler::new(client, store, "vnets", ReconcilerConfig::default());
//!
//! match reconciler.create_resource(&spec).await? {
//!     Reconciled::Ready(vnet) => info!("vnet ready: {:?}", vnet),
//!     Reconciled::Pending { requeue_after, .. } => requeue(requeue_after),
//! }
//! ```

pub mod client;
pub mod error;
pub mod future;
pub mod reconciler;
pub mod status;

pub use client::{CreateOutcome, Creator, Deleter, FutureHandler, ResourceSpec};
pub use error::{ClientError, ReconcileError, StoreError};
pub use future::{OperationDescriptor, OperationKind, PollTarget, RequestMethod, ResourceKey};
pub use reconciler::{AsyncReconciler, OperationPhase, Reconciled, Reconciler, ReconcilerConfig};
pub use status::{
    ConditionStatus, MemoryStatusStore, OperationCondition, OperationStatusStore, ResourceStatus,
};
