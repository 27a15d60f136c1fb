//! Leases of unique temporary identifiers from a bounded 32-bit space.
//!
//! A [`Bank`] hands out identifiers together with a time-to-live and a
//! capability token; the token gates release and deadline resets, and an
//! expired lease is reclaimed exactly as if its holder had released it.
//! All state lives on a single mediator thread and every operation is one
//! blocking request/reply round-trip, so concurrent callers observe a
//! linearizable history without any lock around the state itself.
//!
//! Identifiers are recycled most-recently-released first; fresh ones are
//! drawn from a rising watermark. Memory grows with the high-water mark of
//! distinct identifiers ever leased and is released on shutdown.

mod bank;
mod entry;
mod error;
mod expiry;
mod token;

pub use bank::{Bank, Lease};
pub use entry::{LeaseId, Token};
pub use error::BankError;
