// SPDX-License-Identifier: MIT OR Apache-2.0

//! OTA requestor state machine
//!
//! [`Requestor`] owns the update lifecycle for one device: querying a
//! provider for a newer image, downloading it over BDX, coordinating
//! the apply with the policy driver, and notifying the provider once
//! the new image runs.
//!
//! All entry points run on the platform's serialized callback queue,
//! so the machine takes no locks. Collaborators arrive bundled in a
//! [`Platform`] per call; the requestor keeps no references between
//! calls.
//!
//! At most one update cycle is in flight. Session establishment is
//! asynchronous: operations that need a session record a pending
//! action and send their request from
//! [`Requestor::on_session_established`].

use core::time::Duration;

use log::{debug, info, warn};

use bdx::proto::MIN_BLOCK_SIZE;
use bdx::{DownloaderState, StatusCode, TransferInitData};

use crate::persist;
use crate::platform::{Platform, SessionClient, Store};
use crate::types::{
    AnnounceReason, ApplyAction, DefaultProviderList, DeviceInfo,
    DownloadErrorEvent, FabricIndex, FileDesignator, IdleReason,
    ProviderAnnouncement, ProviderLocation, QueryImageRequest,
    QueryImageResponse, QueryStatus, RetryDecision, UpdateDescription,
    UpdateNotFoundReason, UpdateState, UpdateToken, ApplyUpdateResponse,
};
use crate::{Error, Result};

use num_traits::FromPrimitive;

/// Delay applied when the provider requests one without naming it.
pub const DEFAULT_DELAYED_ACTION: Duration = Duration::from_secs(120);

/// Shortest token a provider may issue.
const MIN_UPDATE_TOKEN: usize = 8;

/// Request deferred until the session to the provider is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingAction {
    Query,
    Download,
    ApplyUpdate,
    NotifyApplied,
}

/// Adapts the session layer's framed send to the transfer engine's
/// outbound messenger.
struct TransferBridge<'a> {
    session: &'a mut dyn SessionClient,
}

impl bdx::BdxMessenger for TransferBridge<'_> {
    fn send_message(
        &mut self,
        payload: &[u8],
        expect_response: bool,
    ) -> bdx::Result<()> {
        self.session
            .send_bdx_message(payload, expect_response)
            .map_err(|e| {
                debug!("session layer failed to send transfer frame: {e}");
                bdx::Error::Send
            })
    }
}

/// The update requestor state machine.
pub struct Requestor {
    state: UpdateState,
    device: DeviceInfo,
    provider: Option<ProviderLocation>,
    default_providers: DefaultProviderList,
    update_token: UpdateToken,
    file_designator: FileDesignator,
    target_version: u32,
    pending: Option<PendingAction>,
    downloader: bdx::Downloader,
    last_error: Option<DownloadErrorEvent>,
}

impl Requestor {
    /// Constructs an idle requestor for the given device identity.
    ///
    /// `device.software_version` must be the version currently
    /// running; it gates offered updates and is reported on notify.
    pub fn new(device: DeviceInfo) -> Self {
        Self {
            state: UpdateState::Idle,
            device,
            provider: None,
            default_providers: DefaultProviderList::new(),
            update_token: UpdateToken::new(),
            file_designator: FileDesignator::new(),
            target_version: 0,
            pending: None,
            downloader: bdx::Downloader::new(),
            last_error: None,
        }
    }

    /// Restore persisted state after a restart and return the
    /// resulting update state.
    ///
    /// Only an interrupted apply survives a restart. When the machine
    /// resumes in [`UpdateState::Applying`] with the target version
    /// running, the platform is expected to call
    /// [`notify_update_applied`](Self::notify_update_applied) once it
    /// has confirmed the new image.
    pub fn init(&mut self, p: &mut Platform) -> UpdateState {
        let rec = persist::load_record(p.store);
        self.default_providers = rec.default_providers;

        match rec.state {
            UpdateState::Applying | UpdateState::DelayedOnApply => {
                if rec.state == UpdateState::Applying
                    && rec.target_version != self.device.software_version
                {
                    warn!(
                        "restarted running version {} while applying {}",
                        self.device.software_version, rec.target_version
                    );
                    self.clear_update_memory(p.store);
                    persist::save_state(p.store, UpdateState::Idle);
                    return self.state;
                }
                info!("resuming {:?} after restart", rec.state);
                self.provider = rec.provider;
                self.update_token = rec.update_token;
                self.target_version = rec.target_version;
                self.state = rec.state;
            }
            UpdateState::Idle => (),
            s => {
                // Query and transfer progress does not survive a
                // restart.
                debug!("discarding persisted {s:?} state");
                self.clear_update_memory(p.store);
                persist::save_state(p.store, UpdateState::Idle);
            }
        }
        self.state
    }

    /// Current update state.
    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// State of the transfer engine.
    pub fn download_state(&self) -> DownloaderState {
        self.downloader.state()
    }

    /// Provider for the in-flight update cycle, if any.
    pub fn provider(&self) -> Option<ProviderLocation> {
        self.provider
    }

    /// Version currently running.
    pub fn current_version(&self) -> u32 {
        self.device.software_version
    }

    /// Version of the in-flight update, 0 when none.
    pub fn target_version(&self) -> u32 {
        self.target_version
    }

    /// Most recent download error event, if any.
    pub fn last_download_error(&self) -> Option<DownloadErrorEvent> {
        self.last_error
    }

    /// Transfer progress while downloading, if the total length is
    /// known.
    pub fn progress(&self, sink: &dyn bdx::ImageSink) -> Option<u8> {
        if self.state == UpdateState::Downloading {
            sink.percent_complete()
        } else {
            None
        }
    }

    /// Configured default providers.
    pub fn default_providers(&self) -> &DefaultProviderList {
        &self.default_providers
    }

    /// Add a per-fabric default provider. At most one entry per
    /// fabric.
    pub fn add_default_provider(
        &mut self,
        store: &mut dyn Store,
        provider: ProviderLocation,
    ) -> Result<()> {
        if self
            .default_providers
            .iter()
            .any(|e| e.fabric_index == provider.fabric_index)
        {
            return Err(Error::ConstraintViolation);
        }
        self.default_providers
            .push(provider)
            .map_err(|_| Error::ConstraintViolation)?;
        persist::save_default_providers(store, &self.default_providers);
        Ok(())
    }

    /// Remove the default providers for one fabric, or all of them.
    pub fn clear_default_providers(
        &mut self,
        store: &mut dyn Store,
        fabric: Option<FabricIndex>,
    ) {
        match fabric {
            Some(f) => self.default_providers.retain(|e| e.fabric_index != f),
            None => self.default_providers.clear(),
        }
        persist::save_default_providers(store, &self.default_providers);
    }

    /// Begin an update cycle by querying a provider for a newer
    /// image.
    ///
    /// Provider selection order: the default provider for `fabric`
    /// when given, then a previously announced provider, then the
    /// first default entry, then the driver.
    pub fn trigger_immediate_query(
        &mut self,
        p: &mut Platform,
        fabric: Option<FabricIndex>,
    ) -> Result<()> {
        match self.state {
            UpdateState::Idle | UpdateState::DelayedOnQuery => (),
            _ => return Err(Error::IncorrectState),
        }

        let provider = match fabric {
            Some(f) => self
                .default_providers
                .iter()
                .find(|e| e.fabric_index == f)
                .copied(),
            None => self
                .provider
                .or_else(|| self.default_providers.first().copied()),
        };
        let provider = provider
            .or_else(|| p.driver.next_provider())
            .ok_or(Error::ProviderNotFound)?;

        info!("querying provider {} for an update", provider.node_id);
        self.provider = Some(provider);
        persist::save_provider(p.store, Some(&provider));
        self.set_state(p, UpdateState::Querying);
        self.connect(p, PendingAction::Query)
    }

    /// Inbound AnnounceOTAProvider command.
    ///
    /// Records the announced provider and asks the driver to schedule
    /// a query; urgent announcements query immediately. Ignored while
    /// a cycle is in flight.
    pub fn handle_announce_provider(
        &mut self,
        p: &mut Platform,
        ann: &ProviderAnnouncement,
    ) -> Result<()> {
        if self.state != UpdateState::Idle {
            debug!("ignoring provider announcement in {:?}", self.state);
            return Err(Error::IncorrectState);
        }
        if !ann.provider.node_id.is_operational() {
            return Err(Error::Protocol("announced node id is not operational"));
        }

        info!(
            "provider {} announced ({:?})",
            ann.provider.node_id, ann.reason
        );
        self.provider = Some(ann.provider);
        persist::save_provider(p.store, Some(&ann.provider));

        let delay = match ann.reason {
            AnnounceReason::UrgentUpdateAvailable => Duration::ZERO,
            r => p.driver.announced_query_delay(r),
        };
        p.driver.schedule_query(delay);
        Ok(())
    }

    /// Outcome of session establishment: send whichever request was
    /// deferred.
    pub fn on_session_established(&mut self, p: &mut Platform) {
        let Some(action) = self.pending.take() else {
            debug!("session established with nothing pending");
            return;
        };

        match action {
            PendingAction::Query => {
                let req = QueryImageRequest {
                    vendor_id: self.device.vendor_id,
                    product_id: self.device.product_id,
                    software_version: self.device.software_version,
                    hardware_version: self.device.hardware_version,
                    location: self.device.location,
                    protocols_supported: crate::types::SUPPORTED_PROTOCOLS,
                    requestor_can_consent: p.driver.can_consent(),
                };
                if let Err(e) = p.session.query_image(&req) {
                    self.record_error(p, e);
                }
            }
            PendingAction::Download => {
                let block =
                    p.driver.max_download_block_size().max(MIN_BLOCK_SIZE);
                let init = TransferInitData {
                    file_designator: self.file_designator.clone(),
                    max_block_size: block,
                };
                let r = self
                    .downloader
                    .set_parameters(init, bdx::downloader::DEFAULT_TIMEOUT)
                    .and_then(|()| {
                        self.downloader.begin_prepare_download(p.sink)
                    });
                if let Err(e) = r {
                    self.record_error(p, e.into());
                }
            }
            PendingAction::ApplyUpdate => {
                if let Err(e) =
                    p.session.apply_update(&self.update_token, self.target_version)
                {
                    self.record_error(p, e);
                }
            }
            PendingAction::NotifyApplied => {
                let version = self.device.software_version;
                // The notify is fire-and-forget; the cycle completes
                // either way.
                if let Err(e) =
                    p.session.notify_update_applied(&self.update_token, version)
                {
                    debug!("notify delivery failed: {e}");
                }
                info!("software version {version} is now running");
                self.reset_to_idle(p, IdleReason::Success);
            }
        }
    }

    /// Session establishment failed.
    pub fn on_session_error(&mut self, p: &mut Platform, err: Error) {
        self.pending = None;
        self.record_error(p, err);
    }

    /// Provider's response to the QueryImage request.
    pub fn on_query_image_response(
        &mut self,
        p: &mut Platform,
        resp: &QueryImageResponse,
    ) -> Result<()> {
        if self.state != UpdateState::Querying {
            return Err(Error::IncorrectState);
        }
        let delay = resp.delayed_action_time.unwrap_or(DEFAULT_DELAYED_ACTION);

        match resp.status {
            Some(QueryStatus::UpdateAvailable) => {
                if let Err(e) = self.accept_offer(p, resp, delay) {
                    self.record_error(p, e);
                }
            }
            Some(QueryStatus::Busy) => {
                info!("provider busy, next query in {delay:?}");
                match p
                    .driver
                    .update_not_found(UpdateNotFoundReason::Busy, delay)
                {
                    RetryDecision::Retry => {
                        self.set_state(p, UpdateState::DelayedOnQuery)
                    }
                    RetryDecision::GiveUp => {
                        self.reset_to_idle(p, IdleReason::Success)
                    }
                }
            }
            Some(QueryStatus::NotAvailable) => {
                info!("provider has no applicable image");
                let _ = p
                    .driver
                    .update_not_found(UpdateNotFoundReason::NotAvailable, delay);
                self.reset_to_idle(p, IdleReason::Success);
            }
            Some(QueryStatus::DownloadProtocolNotSupported) => {
                self.record_error(
                    p,
                    Error::Protocol("no common download protocol"),
                );
            }
            None => {
                self.record_error(p, Error::Protocol("unrecognized query status"))
            }
        }
        Ok(())
    }

    /// The QueryImage exchange failed.
    pub fn on_query_image_failure(&mut self, p: &mut Platform, err: Error) {
        if self.state != UpdateState::Querying {
            debug!("query failure in {:?} ignored", self.state);
            return;
        }
        self.record_error(p, err);
    }

    fn accept_offer(
        &mut self,
        p: &mut Platform,
        resp: &QueryImageResponse,
        delay: Duration,
    ) -> Result<()> {
        let provider = self.provider.ok_or(Error::Internal)?;

        let uri = resp
            .image_uri
            .as_deref()
            .ok_or(Error::Protocol("update offered without an image URI"))?;
        let (node, designator) = crate::uri::parse(uri)?;
        if node != provider.node_id {
            return Err(Error::WrongNode);
        }

        let version = resp
            .software_version
            .ok_or(Error::Protocol("update offered without a version"))?;
        if version <= self.device.software_version {
            info!(
                "offered version {version} is not newer than running {}",
                self.device.software_version
            );
            let _ = p
                .driver
                .update_not_found(UpdateNotFoundReason::UpToDate, delay);
            self.reset_to_idle(p, IdleReason::Success);
            return Ok(());
        }

        let raw = resp
            .update_token
            .as_deref()
            .ok_or(Error::Protocol("update offered without a token"))?;
        if raw.len() < MIN_UPDATE_TOKEN {
            return Err(Error::Protocol("update token too short"));
        }
        let token = UpdateToken::from_slice(raw).map_err(|()| Error::NoSpace)?;

        self.update_token = token;
        self.target_version = version;
        self.file_designator = designator;
        persist::save_token(p.store, &self.update_token);
        persist::save_target_version(p.store, version);

        let desc = UpdateDescription {
            provider_node: node,
            file_designator: self.file_designator.clone(),
            software_version: version,
            software_version_string: resp.software_version_string.clone(),
            update_token: self.update_token.clone(),
            user_consent_needed: resp.user_consent_needed,
            metadata_for_requestor: resp.metadata_for_requestor.clone(),
        };
        info!("update to version {version} available from {node}");
        p.driver.update_available(&desc, delay);
        Ok(())
    }

    /// Begin downloading a previously offered image.
    pub fn download_update(&mut self, p: &mut Platform) -> Result<()> {
        match self.state {
            UpdateState::Querying | UpdateState::DelayedOnUserConsent => (),
            _ => return Err(Error::IncorrectState),
        }
        if self.update_token.is_empty() || self.target_version == 0 {
            return Err(Error::IncorrectState);
        }

        self.set_state(p, UpdateState::Downloading);
        self.connect(p, PendingAction::Download)
    }

    /// Park the cycle awaiting user consent before downloading.
    pub fn download_update_delayed_on_user_consent(
        &mut self,
        p: &mut Platform,
    ) -> Result<()> {
        if self.state != UpdateState::Querying {
            return Err(Error::IncorrectState);
        }
        self.set_state(p, UpdateState::DelayedOnUserConsent);
        Ok(())
    }

    /// Completion callback for image storage preparation.
    pub fn on_image_prepared(
        &mut self,
        p: &mut Platform,
        status: bdx::Result<()>,
    ) -> Result<()> {
        if self.state != UpdateState::Downloading {
            return Err(Error::IncorrectState);
        }
        let failed = status.is_err();
        {
            let mut bridge = TransferBridge {
                session: &mut *p.session,
            };
            self.downloader
                .on_prepared_for_download(p.sink, &mut bridge, status)?;
        }
        if failed {
            self.record_error(p, Error::Protocol("image storage unavailable"));
        } else if self.downloader.state() == DownloaderState::Idle {
            // The drain tore the transfer down (e.g. the ReceiveInit
            // send failed).
            self.record_error(p, Error::Protocol("transfer aborted"));
        }
        Ok(())
    }

    /// Inbound half of the transfer bridge: a raw BDX frame arrived
    /// on the provider session.
    pub fn on_transfer_message(
        &mut self,
        p: &mut Platform,
        payload: &[u8],
    ) -> Result<()> {
        if self.state != UpdateState::Downloading {
            return Err(Error::IncorrectState);
        }
        {
            let mut bridge = TransferBridge {
                session: &mut *p.session,
            };
            self.downloader
                .on_message_received(p.sink, &mut bridge, payload)?;
        }
        match self.downloader.state() {
            DownloaderState::Complete => {
                info!(
                    "download of version {} complete, {} bytes",
                    self.target_version,
                    p.sink.bytes_downloaded()
                );
                p.driver.update_downloaded();
            }
            DownloaderState::Idle => {
                self.record_error(p, Error::Protocol("transfer aborted"));
            }
            _ => (),
        }
        Ok(())
    }

    /// Request the next block once the sink has drained the previous
    /// one.
    pub fn fetch_next_data(&mut self, p: &mut Platform) -> Result<()> {
        if self.state != UpdateState::Downloading {
            return Err(Error::IncorrectState);
        }
        {
            let mut bridge = TransferBridge {
                session: &mut *p.session,
            };
            self.downloader.fetch_next_data(p.sink, &mut bridge)?;
        }
        if self.downloader.state() == DownloaderState::Idle {
            self.record_error(p, Error::Protocol("transfer aborted"));
        }
        Ok(())
    }

    /// The transfer's no-progress timer expired.
    pub fn on_download_timeout(&mut self, p: &mut Platform) {
        if self.state != UpdateState::Downloading {
            debug!("download timeout in {:?} ignored", self.state);
            return;
        }
        self.downloader.on_download_timeout(p.sink);
        self.record_error(p, Error::Protocol("download timed out"));
    }

    /// Ask the provider for permission to apply the downloaded image.
    ///
    /// The full resumption record is persisted before the request is
    /// sent, since a granted apply is expected to restart the device.
    pub fn apply_update(&mut self, p: &mut Platform) -> Result<()> {
        match self.state {
            UpdateState::Downloading | UpdateState::DelayedOnApply => (),
            _ => return Err(Error::IncorrectState),
        }
        if self.downloader.state() != DownloaderState::Complete
            && self.state == UpdateState::Downloading
        {
            return Err(Error::IncorrectState);
        }

        self.set_state(p, UpdateState::Applying);
        let rec = persist::RequestorRecord {
            provider: self.provider,
            update_token: self.update_token.clone(),
            state: UpdateState::Applying,
            target_version: self.target_version,
            default_providers: self.default_providers.clone(),
        };
        persist::save_record(p.store, &rec);

        self.connect(p, PendingAction::ApplyUpdate)
    }

    /// Provider's response to the ApplyUpdateRequest.
    pub fn on_apply_update_response(
        &mut self,
        p: &mut Platform,
        resp: &ApplyUpdateResponse,
    ) -> Result<()> {
        if self.state != UpdateState::Applying {
            return Err(Error::IncorrectState);
        }

        match ApplyAction::from_u8(resp.action) {
            Some(ApplyAction::Proceed) => {
                info!("apply granted, proceeding in {:?}", resp.delayed_action_time);
                p.driver.update_confirmed(resp.delayed_action_time);
            }
            Some(ApplyAction::AwaitNextAction) => {
                info!("apply deferred for {:?}", resp.delayed_action_time);
                p.driver.update_suspended(resp.delayed_action_time);
                self.set_state(p, UpdateState::DelayedOnApply);
            }
            Some(ApplyAction::Discontinue) => {
                info!("provider discontinued the update");
                p.driver.update_discontinued();
                self.reset_to_idle(p, IdleReason::Success);
            }
            None => {
                self.record_error(
                    p,
                    Error::Protocol("unrecognized apply action"),
                );
            }
        }
        Ok(())
    }

    /// The ApplyUpdateRequest exchange failed.
    pub fn on_apply_update_failure(&mut self, p: &mut Platform, err: Error) {
        if self.state != UpdateState::Applying {
            debug!("apply failure in {:?} ignored", self.state);
            return;
        }
        self.record_error(p, err);
    }

    /// Report the new image running and complete the cycle.
    ///
    /// Called by the platform after a restart into the new image (see
    /// [`init`](Self::init)). The machine returns to idle whether or
    /// not the notify is delivered.
    pub fn notify_update_applied(&mut self, p: &mut Platform) -> Result<()> {
        if self.state != UpdateState::Applying {
            return Err(Error::IncorrectState);
        }
        self.connect(p, PendingAction::NotifyApplied)
    }

    /// Cancel the in-flight update cycle.
    ///
    /// Aborts any running transfer (sending a status report to the
    /// peer), discards update memory and returns to idle. A no-op
    /// while idle.
    pub fn cancel_image_update(&mut self, p: &mut Platform) {
        if self.state == UpdateState::Idle {
            return;
        }
        self.pending = None;
        p.driver.update_cancelled();
        self.reset_to_idle(p, IdleReason::Success);
    }

    /// Establish (or reuse) a session to the current provider,
    /// deferring `action` until it is up.
    fn connect(&mut self, p: &mut Platform, action: PendingAction) -> Result<()> {
        let provider = self.provider.ok_or(Error::ProviderNotFound)?;
        self.pending = Some(action);
        if let Err(e) = p.session.establish_session(provider) {
            self.pending = None;
            self.record_error(p, e);
            return Err(Error::SessionEstablishment);
        }
        Ok(())
    }

    /// Funnel for every error path: record a download error event and
    /// reset the cycle.
    fn record_error(&mut self, p: &mut Platform, cause: Error) {
        warn!("update cycle failed in {:?}: {cause}", self.state);
        self.last_error = Some(DownloadErrorEvent {
            software_version: self.target_version,
            bytes_downloaded: p.sink.bytes_downloaded(),
            percent_complete: p.sink.percent_complete(),
        });

        let reason = if matches!(cause, Error::InvalidSession) {
            if let Some(provider) = self.provider {
                p.session.expire_session(provider.node_id);
            }
            IdleReason::InvalidSession
        } else {
            IdleReason::Unknown
        };
        self.reset_to_idle(p, reason);
    }

    /// Abandon the cycle: tear down any transfer, clear update memory
    /// and enter idle.
    fn reset_to_idle(&mut self, p: &mut Platform, reason: IdleReason) {
        if self.downloader.state() != DownloaderState::Idle {
            let mut bridge = TransferBridge {
                session: &mut *p.session,
            };
            self.downloader
                .end_download(p.sink, &mut bridge, StatusCode::Unknown);
        }
        self.pending = None;
        self.clear_update_memory(p.store);

        if self.state != UpdateState::Idle {
            debug!("update state {:?} -> Idle ({reason:?})", self.state);
            self.state = UpdateState::Idle;
            persist::save_state(p.store, self.state);
            p.driver.handle_idle_enter(reason);
        }
    }

    fn clear_update_memory(&mut self, store: &mut dyn Store) {
        self.provider = None;
        self.update_token.clear();
        self.file_designator.clear();
        self.target_version = 0;
        persist::save_provider(store, None);
        persist::save_token(store, &self.update_token);
        persist::save_target_version(store, 0);
    }

    /// Transition to a non-idle state.
    fn set_state(&mut self, p: &mut Platform, new: UpdateState) {
        debug_assert_ne!(new, UpdateState::Idle);
        if new == self.state {
            return;
        }
        debug!("update state {:?} -> {new:?}", self.state);
        if self.state == UpdateState::Idle {
            p.driver.handle_idle_exit();
        }
        self.state = new;
        persist::save_state(p.store, new);
    }
}
