// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

//! OTA software update requestor
//!
//! Client-side orchestration of a multi-phase firmware update:
//! discover that a newer image exists on a provider, download it over
//! a BDX transfer, coordinate applying it with a policy driver, and
//! notify the provider once the new image runs.
//!
//! The crate is driven entirely from a single serialized callback
//! queue owned by the platform. Collaborators (session layer, policy
//! driver, image sink, persistent store) are expressed as traits in
//! [`platform`] and passed into each call.

use thiserror::Error;

pub mod persist;
pub mod platform;
pub mod requestor;
pub mod types;
pub mod uri;

pub use platform::{OtaDriver, Platform, SessionClient, Store, StoreError, StoreKey};
pub use requestor::Requestor;
pub use types::*;
pub use uri::UriError;

/// OTA requestor error type
#[derive(Error, Debug)]
pub enum Error {
    /// No provider is configured or offered by the driver
    #[error("no update provider available")]
    ProviderNotFound,
    /// Operation is not legal in the current update state
    #[error("incorrect state for operation")]
    IncorrectState,
    /// Duplicate fabric entry or provider list at capacity
    #[error("provider list constraint violation")]
    ConstraintViolation,
    /// Locator peer identity does not match the responding provider
    #[error("locator names a different node than the provider")]
    WrongNode,
    /// The cached peer session is no longer valid
    #[error("peer session is no longer valid")]
    InvalidSession,
    /// Session establishment failed
    #[error("session establishment failed")]
    SessionEstablishment,
    /// Malformed or incomplete response from the provider
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    /// A field exceeds its fixed capacity
    #[error("field exceeds fixed capacity")]
    NoSpace,
    /// Locator parse failure
    #[error("locator error: {0}")]
    Uri(#[from] uri::UriError),
    /// Transfer engine failure
    #[error("transfer error: {0}")]
    Bdx(#[from] bdx::Error),
    /// Internal error
    #[error("internal error")]
    Internal,
}

/// OTA requestor result type
pub type Result<T> = core::result::Result<T, Error>;
