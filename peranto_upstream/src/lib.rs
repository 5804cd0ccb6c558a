//! Resilient access to the upstream identity API
//!
//! This crate is the outbound half of the proxy. It manages the service
//! token used to call the upstream identity API, retries transient
//! failures with jittered exponential backoff, and layers an idempotent
//! reconciliation engine on top so that resource creation and role
//! assignment converge when replayed.
//!
//! The actual HTTP exchange sits behind [`transport::UpstreamTransport`];
//! the `reqwest` feature supplies the production implementation.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod braids;
mod client;
mod error;
pub mod reconcile;
pub mod retry;
pub mod token;
pub mod transport;

pub use braids::{AccessToken, AccessTokenRef, ClientSecret, ClientSecretRef};
pub use client::ResilientClient;
pub use error::UpstreamError;
pub use reconcile::{
    ExistingPolicy, Reconciled, ReconciliationEngine, ResourceKind, RoleReconciliation, SetOp,
};
