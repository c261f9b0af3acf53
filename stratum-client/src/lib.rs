//! Client session for Stratum mining pools.
//!
//! The [`stratum`] module holds the protocol: wire messages, the job decoder,
//! listener fan-out and the [`stratum::Session`] state machine. [`config`]
//! reads session settings, and [`tracing`] sets up logging for binaries.

pub mod config;
pub mod error;
pub mod stratum;
pub mod tracing;

pub use error::{Error, Result};
