//! # Error Taxonomy
//!
//! This module defines `StoreError`, the typed error kinds surfaced by every
//! fallible PinDB operation. Call sites build reports with `eyre` so errors
//! carry context (file path, offset, operation), while the kind stays
//! recoverable through `Report::downcast_ref::<StoreError>()`.
//!
//! ## Kinds
//!
//! | Kind | When |
//! |------|------|
//! | `Io` | An underlying syscall failed (open, mmap, msync, ftruncate). |
//! | `Full` | The primary file cannot hold the next allocation. |
//! | `RedoFull` | The redo log cannot hold the next record. Reported as `Full` at the public boundary. |
//! | `Closed` | Operation attempted after `close()`. |
//! | `Proxies` | `close()` attempted while non-root proxies are live. |
//! | `Type` | Wrong type assigned to a slot, unordered skip-list element, or mismatched edge endpoint. |
//! | `KeyNotFound` | Absent key in a hash table or skip list without default semantics. |
//! | `Value` | Bad parameters to a type definition or constructor. |
//! | `Corruption` | Bad magic, no clean header, or an undecodable type descriptor on open. |
//!
//! `Io`, `Full` and `Corruption` are never recovered locally; `Type`,
//! `KeyNotFound` and `Value` are user errors and leave the store unchanged.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage file is full")]
    Full,

    #[error("redo log is full")]
    RedoFull,

    #[error("store is closed")]
    Closed,

    #[error("cannot close: {0} proxies still alive")]
    Proxies(usize),

    #[error("type error: {0}")]
    Type(String),

    #[error("key not found")]
    KeyNotFound,

    #[error("invalid value: {0}")]
    Value(String),

    #[error("corrupted store: {0}")]
    Corruption(String),
}

impl StoreError {
    /// Kind carried by a report, if the report originated in this taxonomy.
    pub fn of(report: &eyre::Report) -> Option<&StoreError> {
        report.downcast_ref::<StoreError>()
    }
}

pub(crate) fn type_err(msg: impl Into<String>) -> eyre::Report {
    StoreError::Type(msg.into()).into()
}

pub(crate) fn value_err(msg: impl Into<String>) -> eyre::Report {
    StoreError::Value(msg.into()).into()
}

pub(crate) fn corrupt(msg: impl Into<String>) -> eyre::Report {
    StoreError::Corruption(msg.into()).into()
}

pub(crate) fn io_err(e: std::io::Error) -> eyre::Report {
    StoreError::Io(e).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_survives_eyre_wrapping() {
        let report: eyre::Report = StoreError::Full.into();
        let report = report.wrap_err("while appending an agent");

        assert!(matches!(StoreError::of(&report), Some(StoreError::Full)));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let report: eyre::Report = StoreError::from(io).into();

        assert!(matches!(StoreError::of(&report), Some(StoreError::Io(_))));
    }
}
