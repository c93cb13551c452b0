#![cfg_attr(docsrs, feature(doc_cfg))]
//! # seplosbms_lib
//!
//! This crate provides a library for interacting with Seplos BMS (Battery Management System)
//! packs over their ASCII framed RS485 protocol.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `seplosbms` command-line tool.
//!
//! ### Client Features
//! - `tokio-serial-async`: Enables [`connector::SeplosBms::new`], opening a serial port with `tokio-serial`.
//!   Without it the connector works on any `AsyncRead + AsyncWrite` stream.
//!
//! ### Utility Features
//! - `protocol_serde`: Enables `serde` support for the decoded samples.
//! - `bin-dependencies`: Enables all features required by the `seplosbms` binary executable.

/// Contains error types for the library.
mod error;
/// Bounded per device sample history.
pub mod history;
/// Defines the communication protocol for Seplos BMS.
pub mod protocol;

/// Asynchronous connector polling all packs on the bus.
pub mod connector;

pub use error::Error;
