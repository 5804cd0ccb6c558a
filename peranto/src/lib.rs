//! Core authentication and caching for a multi-tenant identity proxy
//!
//! This crate contains the tenant-aware heart of the proxy: strongly-typed
//! identifiers, a clock-driven credential cache, per-tenant signing-key
//! resolution, and the bearer token verification pipeline that turns an
//! `Authorization` header into an authenticated [`Principal`].
//!
//! Everything here is transport-agnostic. HTTP enters the picture only at
//! the edges: [`problem`] renders typed errors into response documents,
//! and the optional `reqwest` feature supplies an HTTP-backed
//! [`resolver::KeySetSource`].

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

pub mod cache;
mod claims;
mod error;
mod ids;
mod principal;
pub mod problem;
pub mod resolver;
pub mod verifier;

pub use claims::TokenClaims;
pub use error::{AuthError, BoxError};
pub use ids::{
    ClientId, ClientIdRef, CorrelationId, CorrelationIdRef, Email, EmailRef, RoleId, RoleIdRef,
    RoleName, RoleNameRef, TenantDomain, TenantDomainRef, TenantId, TenantIdRef, UserId, UserIdRef,
};
pub use principal::Principal;
pub use problem::{Problem, ProblemKind};
pub use verifier::{ClientRegistry, TokenVerifier};
