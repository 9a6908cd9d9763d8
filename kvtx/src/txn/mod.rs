//! The transaction coordinator: lock, save, verify, apply, commit,
//! rollback, and the contention resolution that makes the protocol
//! tolerate a coordinator crashing at any point.

mod core;

pub use self::core::Transaction;
