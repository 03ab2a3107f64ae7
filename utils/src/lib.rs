//! Shared infrastructure utilities for fanout.
//!
//! Cross-cutting helpers that don't belong in the domain-pure `fanout-types`
//! crate. Currently crash-safe file persistence (temp file + rename) used by the
//! JSON-backed state store.

pub mod atomic_write;

pub use atomic_write::{
    AtomicWriteOptions, FileSyncPolicy, PersistMode, atomic_write, atomic_write_with_options,
    recover_bak_file,
};
