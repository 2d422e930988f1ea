//! Command protocol layer for bench test instruments.
//!
//! This library turns typed requests ("set the carrier to 433.5 MHz",
//! "measure DC volts on the 10 V range") into each instrument's exact command
//! text, decodes the replies, and manages the per-instrument session: one
//! exclusively owned transport, a connect handshake, cached parameter values
//! with dirty flags, and an optional minimum spacing between commands for
//! instruments that drop input when driven too fast.
//!
//! - [`protocol`]: dialect codecs (units, rounding, measurement requests,
//!   status words, fixed-width state records)
//! - [`cache`] and [`dispatch`]: stale-value cache and dispatch gate
//! - [`session`]: transport ownership, locking and the connect handshake
//! - [`adapters`]: dummy, telnet, serial/Prologix and VISA transports
//! - [`instrument`]: concrete drivers and capability traits
//! - [`config`] and [`logging`]: figment configuration and tracing setup

pub mod adapters;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod protocol;
pub mod session;

pub use error::{InstrError, InstrResult};
