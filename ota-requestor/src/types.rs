// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common types for the update requestor.

use core::fmt;
use core::time::Duration;

use num_derive::FromPrimitive;

use bdx::proto::MAX_FILE_DESIGNATOR;

/// Fabric index, scoping a provider entry to one fabric.
pub type FabricIndex = u8;
/// Application endpoint on the provider node.
pub type EndpointId = u16;

/// Maximum update token length. Oversized tokens are rejected,
/// never truncated.
pub const MAX_UPDATE_TOKEN: usize = 32;
/// Bound on the default-provider list, one entry per fabric.
pub const MAX_DEFAULT_PROVIDERS: usize = 8;

/// Update token issued by the provider, echoed back on apply/notify.
pub type UpdateToken = heapless::Vec<u8, MAX_UPDATE_TOKEN>;
/// Path identifying the image file on the provider.
pub type FileDesignator = heapless::Vec<u8, MAX_FILE_DESIGNATOR>;
/// Per-fabric default providers, used when none is explicitly set.
pub type DefaultProviderList =
    heapless::Vec<ProviderLocation, MAX_DEFAULT_PROVIDERS>;

/// Operational node identifier of a peer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(pub u64);

impl NodeId {
    const OPERATIONAL_MAX: u64 = 0xFFFF_FFEF_FFFF_FFFF;

    /// Whether this is a valid operational node identifier.
    pub const fn is_operational(&self) -> bool {
        self.0 >= 1 && self.0 <= Self::OPERATIONAL_MAX
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Requestor update lifecycle state.
///
/// Exactly one value is active at a time; transitions are performed
/// only by the requestor state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum UpdateState {
    /// No update cycle in progress
    Idle = 0,
    /// QueryImage sent, awaiting response
    Querying = 1,
    /// Provider busy, retry pending per driver policy
    DelayedOnQuery = 2,
    /// BDX transfer in progress
    Downloading = 3,
    /// Awaiting user consent before transfer
    DelayedOnUserConsent = 4,
    /// ApplyUpdateRequest sent or proceed granted
    Applying = 5,
    /// Provider deferred the apply
    DelayedOnApply = 6,
    /// Reverting to the previous image
    RollingBack = 7,
}

/// Why the machine entered `Idle`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IdleReason {
    /// Unattributed failure
    Unknown,
    /// Normal completion or cancellation
    Success,
    /// The peer session was no longer valid
    InvalidSession,
}

/// Why a state transition happened, for observability.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChangeReason {
    /// Cause unknown
    Unknown,
    /// Normal progress
    Success,
    /// A failure occurred
    Failure,
    /// A timeout fired
    TimeOut,
    /// The provider requested a delay
    DelayByProvider,
}

/// The counterparty for an in-flight update.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProviderLocation {
    /// Provider node identifier
    pub node_id: NodeId,
    /// Endpoint hosting the provider role
    pub endpoint: EndpointId,
    /// Fabric this entry belongs to
    pub fabric_index: FabricIndex,
}

/// Static device identity used to populate QueryImage requests.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    /// Vendor identifier
    pub vendor_id: u16,
    /// Product identifier
    pub product_id: u16,
    /// Currently running software version
    pub software_version: u32,
    /// Hardware version, if known
    pub hardware_version: Option<u16>,
    /// ISO 3166-1 alpha-2 location code, if configured
    pub location: Option<[u8; 2]>,
}

/// Transfer protocols a requestor can offer in a QueryImage.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DownloadProtocol {
    /// Synchronous BDX, the only protocol this client implements
    BdxSynchronous,
}

/// Protocols offered in every QueryImage sent by this requestor.
pub const SUPPORTED_PROTOCOLS: &[DownloadProtocol] =
    &[DownloadProtocol::BdxSynchronous];

/// QueryImage request payload handed to the session layer.
#[derive(Clone, Debug)]
pub struct QueryImageRequest {
    /// Vendor identifier
    pub vendor_id: u16,
    /// Product identifier
    pub product_id: u16,
    /// Currently running software version
    pub software_version: u32,
    /// Hardware version, if known
    pub hardware_version: Option<u16>,
    /// Location code, if configured
    pub location: Option<[u8; 2]>,
    /// Transfer protocols the requestor can use
    pub protocols_supported: &'static [DownloadProtocol],
    /// Whether local policy can grant consent on the user's behalf
    pub requestor_can_consent: bool,
}

/// Provider's answer to a QueryImage.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueryStatus {
    /// An image newer than the reported version is available
    UpdateAvailable,
    /// Provider is busy; retry later
    Busy,
    /// No applicable image
    NotAvailable,
    /// Provider cannot serve any protocol the requestor supports
    DownloadProtocolNotSupported,
}

/// Decoded QueryImage response fields.
#[derive(Clone, Debug, Default)]
pub struct QueryImageResponse {
    /// Response status. `None` models an unrecognized status value.
    pub status: Option<QueryStatus>,
    /// Provider-requested delay before the next action
    pub delayed_action_time: Option<Duration>,
    /// Locator for the image, present when an update is available
    pub image_uri: Option<String>,
    /// Version of the offered image
    pub software_version: Option<u32>,
    /// Human-readable version of the offered image
    pub software_version_string: Option<String>,
    /// Token to echo back on apply/notify
    pub update_token: Option<Vec<u8>>,
    /// Whether the provider requires user consent
    pub user_consent_needed: bool,
    /// Opaque provider metadata
    pub metadata_for_requestor: Option<Vec<u8>>,
}

/// Action directive in an ApplyUpdateResponse.
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum ApplyAction {
    /// Apply the image now
    Proceed = 0,
    /// Wait and re-request after the delay
    AwaitNextAction = 1,
    /// Abandon this update
    Discontinue = 2,
}

/// Provider's answer to an ApplyUpdateRequest.
///
/// `action` is kept raw so an unrecognized directive can be treated
/// as a failure rather than silently mapped.
#[derive(Clone, Copy, Debug)]
pub struct ApplyUpdateResponse {
    /// Raw action directive, see [`ApplyAction`]
    pub action: u8,
    /// Delay before the next action
    pub delayed_action_time: Duration,
}

/// Reason carried by an AnnounceOTAProvider command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AnnounceReason {
    /// Provider exists; no knowledge of an update
    SimpleAnnouncement,
    /// An update is available
    UpdateAvailable,
    /// An update must be applied as soon as possible
    UrgentUpdateAvailable,
}

/// Inbound AnnounceOTAProvider command fields.
#[derive(Clone, Debug)]
pub struct ProviderAnnouncement {
    /// Announced provider location
    pub provider: ProviderLocation,
    /// Announcing vendor
    pub vendor_id: u16,
    /// Announcement urgency
    pub reason: AnnounceReason,
    /// Opaque metadata
    pub metadata: Option<Vec<u8>>,
}

/// Why a query produced no update.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpdateNotFoundReason {
    /// Provider answered busy
    Busy,
    /// Provider has no applicable image
    NotAvailable,
    /// Offered version is not newer than the running version
    UpToDate,
}

/// Driver's verdict after a retriable failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    /// Keep the cycle alive; the driver will retry
    Retry,
    /// Retries exhausted; return to idle
    GiveUp,
}

/// An update image located by a successful query.
#[derive(Clone, Debug)]
pub struct UpdateDescription {
    /// Node the locator points at; must equal the responding provider
    pub provider_node: NodeId,
    /// Image path on the provider
    pub file_designator: FileDesignator,
    /// Version of the offered image
    pub software_version: u32,
    /// Human-readable version
    pub software_version_string: Option<String>,
    /// Token to echo back on apply/notify
    pub update_token: UpdateToken,
    /// Whether user consent is required before download
    pub user_consent_needed: bool,
    /// Opaque provider metadata
    pub metadata_for_requestor: Option<Vec<u8>>,
}

/// Diagnostic event recorded on every download error and every
/// error-path transition into idle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DownloadErrorEvent {
    /// Version being downloaded when the error occurred
    pub software_version: u32,
    /// Bytes the image sink had written
    pub bytes_downloaded: u64,
    /// Percent complete, if the total length was known
    pub percent_complete: Option<u8>,
}
