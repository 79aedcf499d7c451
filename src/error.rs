//! # Error Types
//!
//! This module provides the error types used throughout the crate. It defines
//! a central error type `AvbError` that encapsulates all possible failure
//! families the clock-domain, packet-engine, and engine layers can raise.
//!
//! ## Example Usage
//!
//! ```rust
//! use avb_streamhandler::error::{Result, AvbError};
//!
//! fn set_drift_compensation_ppm(ppm: i32) -> Result<f64> {
//!     if !(-1_000_000..=1_000_000).contains(&ppm) {
//!         return Err(AvbError::InvalidParam("drift compensation out of range"));
//!     }
//!     Ok(1.0 + ppm as f64 / 1_000_000.0)
//! }
//! ```

use std::num::ParseIntError;
use thiserror::Error;

/// Primary error type for the crate.
///
/// Transient per-packet failures (a malformed receive frame, a stale
/// sequence number) are absorbed into diagnostics counters and stream state
/// rather than raised here; `AvbError` is reserved for failures at the
/// control-plane / initialization boundary.
#[derive(Error, Debug)]
pub enum AvbError {
    /// Argument fails a precondition: null/zero where positive is required,
    /// an id already in use, a client mismatch, a ppm value out of range.
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// Wire or local format combination that is not wired up (non-SAF16
    /// audio, a CRF pull value other than flat).
    #[error("unsupported format: {0}")]
    UnsupportedFormat(&'static str),

    /// Feature recognized but not implemented (dynamic SRP assignment,
    /// test-tone sourced from a file).
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// Operation attempted before init or after cleanup.
    #[error("not initialized")]
    NotInitialized,

    /// A required external resource was absent or misbehaved (NIC attach,
    /// PTP proxy creation, clock-driver plugin load).
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// Heap exhaustion for a stream, packet pool, filter buffer, or
    /// descriptor FIFO allocation.
    #[error("not enough memory")]
    NotEnoughMemory,

    /// Duplicate client registration, or reinit of an already-initialized
    /// component.
    #[error("already in use")]
    AlreadyInUse,

    /// Per-class sequencer capacity reached.
    #[error("no space left")]
    NoSpaceLeft,

    /// A bounded wait elapsed without the expected event.
    #[error("operation timed out")]
    Timeout,

    /// A cooperating task failed to start.
    #[error("thread start failed")]
    ThreadStartFailed,

    /// A cooperating task failed to stop within its cancellation window.
    #[error("thread stop failed")]
    ThreadStopFailed,

    /// A collaborator callback (clock driver, NIC transport) returned an
    /// error of its own.
    #[error("callback error: {0}")]
    CallbackError(String),

    /// A required reference was unexpectedly absent.
    #[error("null pointer access")]
    NullPointerAccess,

    /// I/O errors surfaced from configuration loading or a NIC transport.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors that occur parsing an integer configuration value.
    #[error("parse int error: {0}")]
    ParseInt(#[from] ParseIntError),
}

/// A specialized Result type for crate operations.
pub type Result<T> = std::result::Result<T, AvbError>;
