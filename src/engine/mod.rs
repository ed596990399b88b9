// src/engine/mod.rs

//! Reconciliation engine.
//!
//! The scheduling semantics live in plain methods on [`ControllerState`],
//! which never do IO:
//! - [`scheduler`]: mark/sweep pass over the queue.
//! - [`completion`]: what happens when a reconciler returns.
//! - [`mutations`]: catalog changes made through the public API.
//!
//! [`Controller`] wraps the state in a lock and [`runtime`] is the async
//! shell: the event loop, reconciler tasks and shutdown.

pub mod completion;
pub mod context;
pub mod controller;
pub mod invocation;
pub mod mutations;
pub mod runtime;
pub mod scheduler;
pub mod state;
pub mod timeline;

pub use completion::Completion;
pub use context::ReconcileContext;
pub use controller::Controller;
pub use invocation::InvocationHandle;
pub use scheduler::Launch;
pub use state::ControllerState;
pub use timeline::Timeline;
