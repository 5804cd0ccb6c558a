//! Durable per-tenant seat accounting
//!
//! Tenants purchase a fixed number of seats; this crate tracks how many
//! are in use and refuses reservations beyond the limit. The in-memory
//! [`SeatLedger`] is the authority while the service runs, with every
//! change persisted through a [`store::SeatStore`] before it takes effect.

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

mod error;
mod ledger;
pub mod store;

pub use error::{SeatError, SeatStoreError};
pub use ledger::{Availability, SeatLedger};
pub use store::{MemorySeatStore, SeatRecord, SeatStore};

#[cfg(feature = "file")]
pub use store::FileSeatStore;
