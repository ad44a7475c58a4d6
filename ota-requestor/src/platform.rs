// SPDX-License-Identifier: MIT OR Apache-2.0

//! Collaborator contracts
//!
//! One trait per external collaborator, each polymorphic over exactly
//! the operations the requestor needs, with no shared base. The
//! platform bundles concrete implementations into a [`Platform`] for
//! each call into the requestor.

use core::time::Duration;

use thiserror::Error;

use crate::types::{
    AnnounceReason, IdleReason, NodeId, ProviderLocation, QueryImageRequest,
    RetryDecision, UpdateDescription, UpdateNotFoundReason, UpdateToken,
};
use crate::Result;

/// Session layer: establishes secure sessions to providers and sends
/// application-layer requests and BDX frames over them.
///
/// Session establishment completes asynchronously; the platform
/// reports the outcome through
/// [`Requestor::on_session_established`](crate::Requestor::on_session_established)
/// or [`Requestor::on_session_error`](crate::Requestor::on_session_error).
/// Responses to the sent requests arrive through the corresponding
/// `Requestor::on_*_response` entry points.
pub trait SessionClient {
    /// Begin establishing (or locating a cached) session to a provider.
    fn establish_session(&mut self, provider: ProviderLocation) -> Result<()>;

    /// Drop any cached session to the given peer so the next attempt
    /// re-establishes it.
    fn expire_session(&mut self, node: NodeId);

    /// Send a QueryImage request on the current session.
    fn query_image(&mut self, req: &QueryImageRequest) -> Result<()>;

    /// Send an ApplyUpdateRequest on the current session.
    fn apply_update(&mut self, token: &UpdateToken, new_version: u32)
        -> Result<()>;

    /// Send a NotifyUpdateApplied on the current session. No response
    /// is expected.
    fn notify_update_applied(
        &mut self,
        token: &UpdateToken,
        version: u32,
    ) -> Result<()>;

    /// Send a framed BDX message on the current session (the transfer
    /// bridge's outbound path).
    fn send_bdx_message(&mut self, payload: &[u8], expect_response: bool)
        -> Result<()>;
}

/// Policy driver: decides whether and when to query, download and
/// apply, and observes lifecycle transitions.
pub trait OtaDriver {
    /// An applicable update was located. The driver decides when to
    /// call back into `download_update` (or the consent-delayed
    /// variant).
    fn update_available(&mut self, desc: &UpdateDescription, delay: Duration);

    /// A query produced no update. For [`UpdateNotFoundReason::Busy`]
    /// the returned decision selects between a delayed retry and
    /// giving up.
    fn update_not_found(
        &mut self,
        reason: UpdateNotFoundReason,
        delay: Duration,
    ) -> RetryDecision;

    /// Whether local policy may grant consent without asking the user.
    fn can_consent(&mut self) -> bool {
        false
    }

    /// Largest BDX block the platform wants to receive.
    fn max_download_block_size(&mut self) -> u16 {
        1024
    }

    /// Next provider candidate when none is explicitly configured.
    fn next_provider(&mut self) -> Option<ProviderLocation> {
        None
    }

    /// The provider granted the apply; the platform proceeds to boot
    /// the new image.
    fn update_confirmed(&mut self, delay: Duration);

    /// The provider deferred the apply.
    fn update_suspended(&mut self, delay: Duration);

    /// The provider abandoned the update.
    fn update_discontinued(&mut self);

    /// The update cycle was cancelled locally.
    fn update_cancelled(&mut self);

    /// The transfer finished; the driver decides when to apply.
    fn update_downloaded(&mut self);

    /// The machine entered `Idle`.
    fn handle_idle_enter(&mut self, reason: IdleReason);

    /// The machine left `Idle`.
    fn handle_idle_exit(&mut self);

    /// Delay policy for a provider announcement that is not urgent.
    fn announced_query_delay(&mut self, reason: AnnounceReason) -> Duration;

    /// Arrange for `trigger_immediate_query` to run after `delay` on
    /// the platform work queue.
    fn schedule_query(&mut self, delay: Duration);
}

/// Keys for the requestor's durable fields, each independently
/// clearable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreKey {
    /// Current provider location
    ProviderLocation,
    /// Update token for the in-flight update
    UpdateToken,
    /// Current update state
    UpdateState,
    /// Target software version of the in-flight update
    TargetVersion,
    /// Default provider list
    DefaultProviders,
}

impl StoreKey {
    /// Stable key name for storage backends.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProviderLocation => "ota/provider",
            Self::UpdateToken => "ota/token",
            Self::UpdateState => "ota/state",
            Self::TargetVersion => "ota/target-version",
            Self::DefaultProviders => "ota/default-providers",
        }
    }
}

/// Storage failure. `NotFound` is a distinguished, non-fatal outcome;
/// anything else is logged and otherwise ignored by the requestor.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// The key has no stored value
    #[error("key not found")]
    NotFound,
    /// Backend failure
    #[error("storage backend failure")]
    Failed,
}

/// Persistent key/value store for requestor resumption state.
pub trait Store {
    /// Store a value under a key.
    fn store(&mut self, key: StoreKey, value: &[u8])
        -> core::result::Result<(), StoreError>;

    /// Load a value into `buf`, returning the stored length.
    fn load(
        &mut self,
        key: StoreKey,
        buf: &mut [u8],
    ) -> core::result::Result<usize, StoreError>;

    /// Remove a stored value. Clearing an absent key is not an error.
    fn clear(&mut self, key: StoreKey) -> core::result::Result<(), StoreError>;
}

/// Collaborator set passed into each requestor operation.
pub struct Platform<'a> {
    /// Policy driver
    pub driver: &'a mut dyn OtaDriver,
    /// Session layer
    pub session: &'a mut dyn SessionClient,
    /// Image sink receiving downloaded bytes
    pub sink: &'a mut dyn bdx::ImageSink,
    /// Persistent store
    pub store: &'a mut dyn Store,
}
