// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end requestor tests against mock collaborators.

use std::collections::HashMap;
use std::time::Duration;

use bdx::proto::{Message, CONTROL_RECEIVER_DRIVE};
use bdx::DownloaderState;

use ota_requestor::platform::{Platform, Store, StoreError, StoreKey};
use ota_requestor::{
    uri, AnnounceReason, DeviceInfo, Error, IdleReason, NodeId, OtaDriver,
    ProviderAnnouncement, ProviderLocation, QueryImageRequest,
    QueryImageResponse, QueryStatus, Requestor, RetryDecision,
    SessionClient, UpdateDescription, UpdateNotFoundReason, UpdateState,
    UpdateToken, ApplyUpdateResponse,
};

fn start_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const RUNNING_VERSION: u32 = 100;
const OFFERED_VERSION: u32 = 101;
const PROVIDER_NODE: u64 = 0x11;

fn device() -> DeviceInfo {
    DeviceInfo {
        vendor_id: 0xfff1,
        product_id: 0x8001,
        software_version: RUNNING_VERSION,
        hardware_version: Some(1),
        location: None,
    }
}

fn provider() -> ProviderLocation {
    ProviderLocation {
        node_id: NodeId(PROVIDER_NODE),
        endpoint: 0,
        fabric_index: 1,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DriverEvent {
    Available(u32),
    NotFound(UpdateNotFoundReason),
    Confirmed,
    Suspended,
    Discontinued,
    Cancelled,
    Downloaded,
    IdleEnter(IdleReason),
    IdleExit,
    ScheduleQuery(Duration),
}

struct MockDriver {
    events: Vec<DriverEvent>,
    busy_decision: RetryDecision,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            busy_decision: RetryDecision::Retry,
        }
    }
}

impl OtaDriver for MockDriver {
    fn update_available(&mut self, desc: &UpdateDescription, _delay: Duration) {
        self.events
            .push(DriverEvent::Available(desc.software_version));
    }

    fn update_not_found(
        &mut self,
        reason: UpdateNotFoundReason,
        _delay: Duration,
    ) -> RetryDecision {
        self.events.push(DriverEvent::NotFound(reason));
        self.busy_decision
    }

    fn max_download_block_size(&mut self) -> u16 {
        256
    }

    fn update_confirmed(&mut self, _delay: Duration) {
        self.events.push(DriverEvent::Confirmed);
    }

    fn update_suspended(&mut self, _delay: Duration) {
        self.events.push(DriverEvent::Suspended);
    }

    fn update_discontinued(&mut self) {
        self.events.push(DriverEvent::Discontinued);
    }

    fn update_cancelled(&mut self) {
        self.events.push(DriverEvent::Cancelled);
    }

    fn update_downloaded(&mut self) {
        self.events.push(DriverEvent::Downloaded);
    }

    fn handle_idle_enter(&mut self, reason: IdleReason) {
        self.events.push(DriverEvent::IdleEnter(reason));
    }

    fn handle_idle_exit(&mut self) {
        self.events.push(DriverEvent::IdleExit);
    }

    fn announced_query_delay(&mut self, _reason: AnnounceReason) -> Duration {
        Duration::from_secs(30)
    }

    fn schedule_query(&mut self, delay: Duration) {
        self.events.push(DriverEvent::ScheduleQuery(delay));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionEvent {
    Establish(NodeId),
    Expire(NodeId),
    Query,
    Apply(u32),
    Notify(u32),
}

#[derive(Default)]
struct MockSession {
    events: Vec<SessionEvent>,
    frames: Vec<Vec<u8>>,
    fail_bdx: bool,
}

impl SessionClient for MockSession {
    fn establish_session(
        &mut self,
        provider: ProviderLocation,
    ) -> ota_requestor::Result<()> {
        self.events.push(SessionEvent::Establish(provider.node_id));
        Ok(())
    }

    fn expire_session(&mut self, node: NodeId) {
        self.events.push(SessionEvent::Expire(node));
    }

    fn query_image(
        &mut self,
        _req: &QueryImageRequest,
    ) -> ota_requestor::Result<()> {
        self.events.push(SessionEvent::Query);
        Ok(())
    }

    fn apply_update(
        &mut self,
        _token: &UpdateToken,
        new_version: u32,
    ) -> ota_requestor::Result<()> {
        self.events.push(SessionEvent::Apply(new_version));
        Ok(())
    }

    fn notify_update_applied(
        &mut self,
        _token: &UpdateToken,
        version: u32,
    ) -> ota_requestor::Result<()> {
        self.events.push(SessionEvent::Notify(version));
        Ok(())
    }

    fn send_bdx_message(
        &mut self,
        payload: &[u8],
        _expect_response: bool,
    ) -> ota_requestor::Result<()> {
        if self.fail_bdx {
            return Err(Error::Internal);
        }
        self.frames.push(payload.to_vec());
        Ok(())
    }
}

impl MockSession {
    fn last_frame(&self) -> Message<'_> {
        let raw = self.frames.last().expect("no frame sent");
        Message::parse(raw).expect("unparseable frame")
    }
}

#[derive(Default)]
struct MockSink {
    data: Vec<u8>,
    prepared: bool,
    finalized: bool,
    aborted: bool,
}

impl bdx::ImageSink for MockSink {
    fn prepare_download(&mut self) -> bdx::Result<()> {
        self.prepared = true;
        Ok(())
    }

    fn process_block(&mut self, data: &[u8]) -> bdx::Result<()> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn finalize(&mut self) -> bdx::Result<()> {
        self.finalized = true;
        Ok(())
    }

    fn abort(&mut self) -> bdx::Result<()> {
        self.aborted = true;
        self.data.clear();
        Ok(())
    }

    fn bytes_downloaded(&self) -> u64 {
        self.data.len() as u64
    }

    fn percent_complete(&self) -> Option<u8> {
        None
    }
}

#[derive(Default)]
struct MemStore {
    map: HashMap<&'static str, Vec<u8>>,
}

impl Store for MemStore {
    fn store(
        &mut self,
        key: StoreKey,
        value: &[u8],
    ) -> Result<(), StoreError> {
        self.map.insert(key.name(), value.to_vec());
        Ok(())
    }

    fn load(
        &mut self,
        key: StoreKey,
        buf: &mut [u8],
    ) -> Result<usize, StoreError> {
        let v = self.map.get(key.name()).ok_or(StoreError::NotFound)?;
        buf[..v.len()].copy_from_slice(v);
        Ok(v.len())
    }

    fn clear(&mut self, key: StoreKey) -> Result<(), StoreError> {
        self.map.remove(key.name());
        Ok(())
    }
}

#[derive(Default)]
struct Fixture {
    driver: MockDriver,
    session: MockSession,
    sink: MockSink,
    store: MemStore,
}

macro_rules! plat {
    ($f:ident) => {
        &mut Platform {
            driver: &mut $f.driver,
            session: &mut $f.session,
            sink: &mut $f.sink,
            store: &mut $f.store,
        }
    };
}

fn offer() -> QueryImageResponse {
    QueryImageResponse {
        status: Some(QueryStatus::UpdateAvailable),
        image_uri: Some(
            uri::encode(NodeId(PROVIDER_NODE), "fw/app-v101.bin").unwrap(),
        ),
        software_version: Some(OFFERED_VERSION),
        update_token: Some(vec![0xab; 16]),
        ..Default::default()
    }
}

/// Drive a fixture to the Querying state with the query sent.
fn querying(f: &mut Fixture) -> Requestor {
    let mut r = Requestor::new(device());
    r.add_default_provider(&mut f.store, provider()).unwrap();
    r.trigger_immediate_query(plat!(f), Some(1)).unwrap();
    assert_eq!(r.state(), UpdateState::Querying);
    r.on_session_established(plat!(f));
    assert!(f.session.events.contains(&SessionEvent::Query));
    r
}

/// Drive a fixture through a complete, accepted transfer.
fn downloaded(f: &mut Fixture) -> Requestor {
    let mut r = querying(f);
    r.on_query_image_response(plat!(f), &offer()).unwrap();
    r.download_update(plat!(f)).unwrap();
    assert_eq!(r.state(), UpdateState::Downloading);
    r.on_session_established(plat!(f));
    assert!(f.sink.prepared);
    r.on_image_prepared(plat!(f), Ok(())).unwrap();

    // ReceiveInit went out; accept it and serve two blocks.
    assert!(matches!(f.session.last_frame(), Message::ReceiveInit { .. }));
    let accept = Message::ReceiveAccept {
        control: CONTROL_RECEIVER_DRIVE,
        max_block_size: 256,
        length: 512,
    }
    .encode()
    .unwrap();
    r.on_transfer_message(plat!(f), &accept).unwrap();
    assert_eq!(
        f.session.last_frame(),
        Message::BlockQuery { block_counter: 0 }
    );

    let b0 = Message::Block {
        block_counter: 0,
        data: &[1; 256],
    }
    .encode()
    .unwrap();
    r.on_transfer_message(plat!(f), &b0).unwrap();
    r.fetch_next_data(plat!(f)).unwrap();
    assert_eq!(
        f.session.last_frame(),
        Message::BlockQuery { block_counter: 1 }
    );

    let b1 = Message::BlockEof {
        block_counter: 1,
        data: &[2; 256],
    }
    .encode()
    .unwrap();
    r.on_transfer_message(plat!(f), &b1).unwrap();

    assert_eq!(
        f.session.last_frame(),
        Message::BlockAckEof { block_counter: 1 }
    );
    assert!(f.sink.finalized);
    assert_eq!(f.sink.data.len(), 512);
    assert_eq!(r.download_state(), DownloaderState::Complete);
    assert!(f.driver.events.contains(&DriverEvent::Downloaded));
    r
}

#[test]
fn full_update_cycle() {
    start_log();
    let mut f = Fixture::default();
    let mut r = downloaded(&mut f);

    r.apply_update(plat!(f)).unwrap();
    assert_eq!(r.state(), UpdateState::Applying);
    r.on_session_established(plat!(f));
    assert!(f
        .session
        .events
        .contains(&SessionEvent::Apply(OFFERED_VERSION)));

    r.on_apply_update_response(
        plat!(f),
        &ApplyUpdateResponse {
            action: 0, // Proceed
            delayed_action_time: Duration::ZERO,
        },
    )
    .unwrap();
    assert!(f.driver.events.contains(&DriverEvent::Confirmed));
    assert_eq!(r.state(), UpdateState::Applying);

    // Restart into the new image: a fresh machine resumes from the
    // persisted record and notifies the provider.
    let mut new_device = device();
    new_device.software_version = OFFERED_VERSION;
    let mut r2 = Requestor::new(new_device);
    assert_eq!(r2.init(plat!(f)), UpdateState::Applying);

    r2.notify_update_applied(plat!(f)).unwrap();
    r2.on_session_established(plat!(f));
    assert!(f
        .session
        .events
        .contains(&SessionEvent::Notify(OFFERED_VERSION)));
    assert_eq!(r2.state(), UpdateState::Idle);
    assert!(f
        .driver
        .events
        .contains(&DriverEvent::IdleEnter(IdleReason::Success)));
    assert!(!f.store.map.contains_key(StoreKey::UpdateToken.name()));
}

#[test]
fn query_without_provider_fails() {
    start_log();
    let mut f = Fixture::default();
    let mut r = Requestor::new(device());
    assert!(matches!(
        r.trigger_immediate_query(plat!(f), None),
        Err(Error::ProviderNotFound)
    ));
    assert_eq!(r.state(), UpdateState::Idle);
}

#[test]
fn busy_provider_respects_driver_decision() {
    start_log();
    let busy = QueryImageResponse {
        status: Some(QueryStatus::Busy),
        delayed_action_time: Some(Duration::from_secs(60)),
        ..Default::default()
    };

    let mut f = Fixture::default();
    let mut r = querying(&mut f);
    r.on_query_image_response(plat!(f), &busy).unwrap();
    assert_eq!(r.state(), UpdateState::DelayedOnQuery);
    assert!(f
        .driver
        .events
        .contains(&DriverEvent::NotFound(UpdateNotFoundReason::Busy)));

    // A delayed retry is allowed to query again.
    r.trigger_immediate_query(plat!(f), Some(1)).unwrap();
    assert_eq!(r.state(), UpdateState::Querying);

    let mut f = Fixture::default();
    f.driver.busy_decision = RetryDecision::GiveUp;
    let mut r = querying(&mut f);
    r.on_query_image_response(plat!(f), &busy).unwrap();
    assert_eq!(r.state(), UpdateState::Idle);
}

#[test]
fn not_available_returns_to_idle() {
    start_log();
    let mut f = Fixture::default();
    let mut r = querying(&mut f);
    let resp = QueryImageResponse {
        status: Some(QueryStatus::NotAvailable),
        ..Default::default()
    };
    r.on_query_image_response(plat!(f), &resp).unwrap();
    assert_eq!(r.state(), UpdateState::Idle);
    assert!(f
        .driver
        .events
        .contains(&DriverEvent::NotFound(UpdateNotFoundReason::NotAvailable)));
    assert!(f
        .driver
        .events
        .contains(&DriverEvent::IdleEnter(IdleReason::Success)));
    assert!(r.last_download_error().is_none());
}

#[test]
fn locator_naming_other_node_is_rejected() {
    start_log();
    let mut f = Fixture::default();
    let mut r = querying(&mut f);

    let mut resp = offer();
    resp.image_uri = Some(uri::encode(NodeId(0x22), "fw/app.bin").unwrap());
    r.on_query_image_response(plat!(f), &resp).unwrap();

    assert_eq!(r.state(), UpdateState::Idle);
    assert!(r.last_download_error().is_some());
    assert!(!f
        .driver
        .events
        .iter()
        .any(|e| matches!(e, DriverEvent::Available(_))));
}

#[test]
fn offered_version_must_be_newer() {
    start_log();
    let mut f = Fixture::default();
    let mut r = querying(&mut f);

    let mut resp = offer();
    resp.software_version = Some(RUNNING_VERSION);
    r.on_query_image_response(plat!(f), &resp).unwrap();

    assert_eq!(r.state(), UpdateState::Idle);
    assert!(f
        .driver
        .events
        .contains(&DriverEvent::NotFound(UpdateNotFoundReason::UpToDate)));
    // Not an error path.
    assert!(r.last_download_error().is_none());
    assert_eq!(r.target_version(), 0);
}

#[test]
fn short_update_token_is_rejected() {
    start_log();
    let mut f = Fixture::default();
    let mut r = querying(&mut f);

    let mut resp = offer();
    resp.update_token = Some(vec![1, 2, 3]);
    r.on_query_image_response(plat!(f), &resp).unwrap();
    assert_eq!(r.state(), UpdateState::Idle);
    assert!(r.last_download_error().is_some());
}

#[test]
fn invalid_session_expires_cached_peer() {
    start_log();
    let mut f = Fixture::default();
    let mut r = querying(&mut f);

    r.on_query_image_failure(plat!(f), Error::InvalidSession);
    assert_eq!(r.state(), UpdateState::Idle);
    assert!(f
        .session
        .events
        .contains(&SessionEvent::Expire(NodeId(PROVIDER_NODE))));
    assert!(f
        .driver
        .events
        .contains(&DriverEvent::IdleEnter(IdleReason::InvalidSession)));
}

#[test]
fn cancel_mid_download_aborts_transfer() {
    start_log();
    let mut f = Fixture::default();
    let mut r = querying(&mut f);
    r.on_query_image_response(plat!(f), &offer()).unwrap();
    r.download_update(plat!(f)).unwrap();
    r.on_session_established(plat!(f));
    r.on_image_prepared(plat!(f), Ok(())).unwrap();

    let accept = Message::ReceiveAccept {
        control: CONTROL_RECEIVER_DRIVE,
        max_block_size: 256,
        length: 0,
    }
    .encode()
    .unwrap();
    r.on_transfer_message(plat!(f), &accept).unwrap();

    r.cancel_image_update(plat!(f));
    assert_eq!(r.state(), UpdateState::Idle);
    assert_eq!(r.download_state(), DownloaderState::Idle);
    assert!(f.sink.aborted);
    assert!(matches!(f.session.last_frame(), Message::StatusReport { .. }));
    assert!(f.driver.events.contains(&DriverEvent::Cancelled));
    assert_eq!(r.target_version(), 0);
    assert!(!f.store.map.contains_key(StoreKey::UpdateToken.name()));

    // Cancelling again is a no-op.
    let cancelled = f
        .driver
        .events
        .iter()
        .filter(|e| **e == DriverEvent::Cancelled)
        .count();
    r.cancel_image_update(plat!(f));
    assert_eq!(
        f.driver
            .events
            .iter()
            .filter(|e| **e == DriverEvent::Cancelled)
            .count(),
        cancelled
    );
}

#[test]
fn download_timeout_discards_partial_data() {
    start_log();
    let mut f = Fixture::default();
    let mut r = querying(&mut f);
    r.on_query_image_response(plat!(f), &offer()).unwrap();
    r.download_update(plat!(f)).unwrap();
    r.on_session_established(plat!(f));
    r.on_image_prepared(plat!(f), Ok(())).unwrap();

    let accept = Message::ReceiveAccept {
        control: CONTROL_RECEIVER_DRIVE,
        max_block_size: 256,
        length: 0,
    }
    .encode()
    .unwrap();
    r.on_transfer_message(plat!(f), &accept).unwrap();
    let b0 = Message::Block {
        block_counter: 0,
        data: &[1; 100],
    }
    .encode()
    .unwrap();
    r.on_transfer_message(plat!(f), &b0).unwrap();

    let frames = f.session.frames.len();
    r.on_download_timeout(plat!(f));
    assert_eq!(r.state(), UpdateState::Idle);
    assert!(f.sink.aborted);
    assert!(f.sink.data.is_empty());
    // Timeout never contacts the peer.
    assert_eq!(f.session.frames.len(), frames);
    assert!(r.last_download_error().is_some());
}

#[test]
fn peer_abort_fails_the_cycle() {
    start_log();
    let mut f = Fixture::default();
    let mut r = querying(&mut f);
    r.on_query_image_response(plat!(f), &offer()).unwrap();
    r.download_update(plat!(f)).unwrap();
    r.on_session_established(plat!(f));
    r.on_image_prepared(plat!(f), Ok(())).unwrap();

    let status = Message::StatusReport {
        status: bdx::StatusCode::FileDesignatorUnknown,
    }
    .encode()
    .unwrap();
    r.on_transfer_message(plat!(f), &status).unwrap();

    assert_eq!(r.state(), UpdateState::Idle);
    assert!(r.last_download_error().is_some());
    assert!(!f.sink.finalized);
}

#[test]
fn send_failure_fails_the_cycle() {
    start_log();
    let mut f = Fixture::default();
    let mut r = querying(&mut f);
    r.on_query_image_response(plat!(f), &offer()).unwrap();
    r.download_update(plat!(f)).unwrap();
    r.on_session_established(plat!(f));
    assert!(f.sink.prepared);

    // The ReceiveInit cannot be delivered.
    f.session.fail_bdx = true;
    r.on_image_prepared(plat!(f), Ok(())).unwrap();

    assert_eq!(r.state(), UpdateState::Idle);
    assert_eq!(r.download_state(), DownloaderState::Idle);
    assert!(f.sink.aborted);
    assert!(f.session.frames.is_empty());
    assert!(r.last_download_error().is_some());
    assert!(f
        .driver
        .events
        .contains(&DriverEvent::IdleEnter(IdleReason::Unknown)));
}

#[test]
fn send_failure_mid_transfer_fails_the_cycle() {
    start_log();
    let mut f = Fixture::default();
    let mut r = querying(&mut f);
    r.on_query_image_response(plat!(f), &offer()).unwrap();
    r.download_update(plat!(f)).unwrap();
    r.on_session_established(plat!(f));
    r.on_image_prepared(plat!(f), Ok(())).unwrap();

    let accept = Message::ReceiveAccept {
        control: CONTROL_RECEIVER_DRIVE,
        max_block_size: 256,
        length: 512,
    }
    .encode()
    .unwrap();
    r.on_transfer_message(plat!(f), &accept).unwrap();
    let b0 = Message::Block {
        block_counter: 0,
        data: &[1; 256],
    }
    .encode()
    .unwrap();
    r.on_transfer_message(plat!(f), &b0).unwrap();

    // The next BlockQuery cannot be delivered.
    f.session.fail_bdx = true;
    r.fetch_next_data(plat!(f)).unwrap();

    assert_eq!(r.state(), UpdateState::Idle);
    assert_eq!(r.download_state(), DownloaderState::Idle);
    assert!(f.sink.aborted);
    assert!(f.sink.data.is_empty());
    assert!(r.last_download_error().is_some());
}

#[test]
fn apply_persists_record_before_response() {
    start_log();
    let mut f = Fixture::default();
    let mut r = downloaded(&mut f);

    r.apply_update(plat!(f)).unwrap();
    // Everything needed to resume after a restart is durable before
    // the provider answers.
    assert_eq!(
        f.store.map.get(StoreKey::UpdateState.name()).unwrap(),
        &vec![UpdateState::Applying as u8]
    );
    assert_eq!(
        f.store.map.get(StoreKey::UpdateToken.name()).unwrap(),
        &vec![0xab; 16]
    );
    assert_eq!(
        f.store.map.get(StoreKey::TargetVersion.name()).unwrap(),
        &OFFERED_VERSION.to_le_bytes().to_vec()
    );
    assert!(f.store.map.contains_key(StoreKey::ProviderLocation.name()));
}

#[test]
fn apply_deferred_then_discontinued() {
    start_log();
    let mut f = Fixture::default();
    let mut r = downloaded(&mut f);
    r.apply_update(plat!(f)).unwrap();
    r.on_session_established(plat!(f));

    r.on_apply_update_response(
        plat!(f),
        &ApplyUpdateResponse {
            action: 1, // AwaitNextAction
            delayed_action_time: Duration::from_secs(60),
        },
    )
    .unwrap();
    assert_eq!(r.state(), UpdateState::DelayedOnApply);
    assert!(f.driver.events.contains(&DriverEvent::Suspended));

    // Re-request after the delay.
    r.apply_update(plat!(f)).unwrap();
    assert_eq!(r.state(), UpdateState::Applying);
    r.on_session_established(plat!(f));

    r.on_apply_update_response(
        plat!(f),
        &ApplyUpdateResponse {
            action: 2, // Discontinue
            delayed_action_time: Duration::ZERO,
        },
    )
    .unwrap();
    assert_eq!(r.state(), UpdateState::Idle);
    assert!(f.driver.events.contains(&DriverEvent::Discontinued));
}

#[test]
fn unknown_apply_action_is_a_failure() {
    start_log();
    let mut f = Fixture::default();
    let mut r = downloaded(&mut f);
    r.apply_update(plat!(f)).unwrap();
    r.on_session_established(plat!(f));

    r.on_apply_update_response(
        plat!(f),
        &ApplyUpdateResponse {
            action: 0x7f,
            delayed_action_time: Duration::ZERO,
        },
    )
    .unwrap();
    assert_eq!(r.state(), UpdateState::Idle);
    assert!(r.last_download_error().is_some());
}

#[test]
fn announce_schedules_query() {
    start_log();
    let mut f = Fixture::default();
    let mut r = Requestor::new(device());

    let ann = ProviderAnnouncement {
        provider: provider(),
        vendor_id: 0xfff1,
        reason: AnnounceReason::UrgentUpdateAvailable,
        metadata: None,
    };
    r.handle_announce_provider(plat!(f), &ann).unwrap();
    assert!(f
        .driver
        .events
        .contains(&DriverEvent::ScheduleQuery(Duration::ZERO)));

    let mut ann = ann;
    ann.reason = AnnounceReason::SimpleAnnouncement;

    // Announcements are ignored while a cycle is in flight.
    r.trigger_immediate_query(plat!(f), None).unwrap();
    assert!(matches!(
        r.handle_announce_provider(plat!(f), &ann),
        Err(Error::IncorrectState)
    ));
}

#[test]
fn one_default_provider_per_fabric() {
    start_log();
    let mut f = Fixture::default();
    let mut r = Requestor::new(device());

    r.add_default_provider(&mut f.store, provider()).unwrap();
    let mut dup = provider();
    dup.node_id = NodeId(0x99);
    assert!(matches!(
        r.add_default_provider(&mut f.store, dup),
        Err(Error::ConstraintViolation)
    ));

    let mut other = provider();
    other.fabric_index = 2;
    r.add_default_provider(&mut f.store, other).unwrap();
    assert_eq!(r.default_providers().len(), 2);

    r.clear_default_providers(&mut f.store, Some(1));
    assert_eq!(r.default_providers().len(), 1);
    assert_eq!(r.default_providers()[0].fabric_index, 2);
}

#[test]
fn interrupted_download_does_not_resume() {
    start_log();
    let mut f = Fixture::default();
    f.store
        .store(StoreKey::UpdateState, &[UpdateState::Downloading as u8])
        .unwrap();
    f.store
        .store(StoreKey::TargetVersion, &OFFERED_VERSION.to_le_bytes())
        .unwrap();

    let mut r = Requestor::new(device());
    assert_eq!(r.init(plat!(f)), UpdateState::Idle);
    assert_eq!(r.target_version(), 0);
    assert_eq!(
        f.store.map.get(StoreKey::UpdateState.name()).unwrap(),
        &vec![UpdateState::Idle as u8]
    );
}

#[test]
fn restart_with_wrong_version_abandons_apply() {
    start_log();
    let mut f = Fixture::default();
    f.store
        .store(StoreKey::UpdateState, &[UpdateState::Applying as u8])
        .unwrap();
    f.store
        .store(StoreKey::TargetVersion, &OFFERED_VERSION.to_le_bytes())
        .unwrap();
    f.store.store(StoreKey::UpdateToken, &[0xab; 16]).unwrap();

    // Still running the old version: the apply did not take.
    let mut r = Requestor::new(device());
    assert_eq!(r.init(plat!(f)), UpdateState::Idle);
    assert!(!f.store.map.contains_key(StoreKey::UpdateToken.name()));
}
