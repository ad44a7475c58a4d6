// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Bulk Data Exchange (BDX) chunked binary transfer support
//!
//! This crate implements the client (downloading) side of the BDX
//! protocol: a wire codec, a pure protocol sub-session, and a
//! downloader engine that couples the sub-session to an image sink
//! and an outbound messenger.
//!
//! The crate performs no I/O and keeps no clock of its own; the
//! surrounding platform delivers inbound messages and timer expiry
//! through the [`Downloader`] entry points.

use thiserror::Error;

pub mod downloader;
pub mod proto;
pub mod transfer;

pub use downloader::{BdxMessenger, Downloader, DownloaderState, ImageSink};
pub use proto::StatusCode;
pub use transfer::{OutputEvent, TransferInitData, TransferSession};

/// BDX error type
#[derive(Error, Debug)]
pub enum Error {
    /// Inbound message could not be decoded
    #[error("BDX decode error: {0}")]
    Decode(&'static str),
    /// A length-prefixed field exceeds its fixed capacity
    #[error("insufficient space")]
    NoSpace,
    /// Operation is not legal in the current state
    #[error("incorrect state for operation")]
    IncorrectState,
    /// The peer ended the transfer with a status report
    #[error("peer status report: {0:?}")]
    StatusReport(StatusCode),
    /// Image sink rejected data or failed to prepare
    #[error("image sink failure")]
    Sink,
    /// The messenger failed to transmit
    #[error("message send failure")]
    Send,
    /// Internal protocol error (unexpected message, counter regression,
    /// event storm)
    #[error("internal transfer error")]
    Internal,
}

/// BDX result type
pub type Result<T> = core::result::Result<T, Error>;
