//! kfn reconcile: one convergence pass per Function.
//!
//! A pass loads the Function, resolves the desired ConfigMap, Service and
//! Deployment, binds them to the Function, then fetches, diffs and
//! creates/updates each child in that order before settling the status phase.
//! The engine never deletes children and never retries internally; errors and
//! requeue requests go back to whatever delivered the trigger.

#![forbid(unsafe_code)]

pub mod drift;
mod engine;
mod error;
pub mod status;

pub use engine::{Outcome, PassContext, Reconciler, ReconcilerConfig};
pub use error::{Error, Op, Result};
