//! Stratum pool client.
//!
//! Pools speak newline-delimited JSON-RPC over TCP. This module provides a
//! [`Session`] that dials a pool, performs the `mining.authorize` /
//! `mining.subscribe` handshake, turns `mining.notify` jobs into [`Work`],
//! submits solved shares, and reconnects on its own when the pool goes away.
//!
//! # Protocol Overview
//!
//! - **Client requests**: mining.authorize, mining.subscribe, submit,
//!   mining.ping
//! - **Server notifications**: mining.notify (new work), mining.set_difficulty
//! - **Server responses**: results for client requests (boolean, array, or a
//!   `[code, message, traceback]` error)
//!
//! # Usage
//!
//! ```rust,ignore
//! use stratum_client::stratum::{Session, SessionConfig};
//!
//! let session = Session::new(SessionConfig::default());
//! let (work_tx, mut work_rx) = mpsc::channel(16);
//! session.register_work_listener(work_tx);
//!
//! session.connect("stratum+tcp://pool.example.com:3333").await?;
//! session.authorize("worker", "x").await?;
//!
//! while let Some(work) = work_rx.recv().await {
//!     // hash, then:
//!     session.submit_work(&Arc::new(work.with_nonce(nonce)), &hash_hex).await?;
//! }
//! ```

mod connection;
mod listeners;
mod messages;
mod session;
mod work;

pub use connection::strip_scheme;
pub use listeners::{ListenerKey, SubmitEvent};
pub use messages::{
    Method, Notification, Request, Response, StratumError, StratumErrorCode, Subscribe,
    SubmitParams,
};
pub use session::{
    ReconnectPolicy, Session, SessionConfig, SubmissionStats, DEFAULT_RECONNECT_INITIAL_DELAY,
    DEFAULT_RECONNECT_RETRY_DELAY,
};
pub use work::{
    bin_to_hex, blob_from_hex, difficulty_for_target, hex_to_bin, target_for_difficulty,
    target_from_hex, Work, MAX_BLOB_LEN, MIN_BLOB_LEN, NONCE_LEN, NONCE_OFFSET, WORK_DATA_LEN,
};
