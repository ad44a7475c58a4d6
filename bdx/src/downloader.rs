// SPDX-License-Identifier: MIT OR Apache-2.0

//! BDX downloader engine
//!
//! [`Downloader`] drives a single receiver-driven transfer: it owns
//! the [`TransferSession`] sub-session and translates its pending
//! output into [`ImageSink`] calls and outbound sends through a
//! [`BdxMessenger`]. Collaborators are passed per call; the engine
//! holds no references between callbacks.

use core::time::Duration;

use log::{debug, trace, warn};

use crate::proto::StatusCode;
use crate::transfer::{OutputEvent, TransferInitData, TransferSession};
use crate::{Error, Result};

/// Bound on synchronous pump iterations per driving call.
///
/// A misbehaving peer that floods the sub-session with events must not
/// cause unbounded synchronous work; exceeding the bound aborts the
/// transfer.
pub const MAX_DRAIN_EVENTS: usize = 32;

/// Default no-progress window for a transfer.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Destination for downloaded image bytes.
///
/// `prepare_download` may complete asynchronously; the platform
/// reports the outcome through
/// [`Downloader::on_prepared_for_download`].
pub trait ImageSink {
    /// Pre-allocate/erase storage for an incoming image.
    fn prepare_download(&mut self) -> Result<()>;
    /// Write one block of image data.
    fn process_block(&mut self, data: &[u8]) -> Result<()>;
    /// Commit a fully transferred image.
    fn finalize(&mut self) -> Result<()>;
    /// Discard partial data.
    fn abort(&mut self) -> Result<()>;
    /// Bytes written so far.
    fn bytes_downloaded(&self) -> u64;
    /// Percent complete, if the total length is known.
    fn percent_complete(&self) -> Option<u8>;
}

/// Outbound half of the transfer bridge: sends framed BDX payloads
/// over the message exchange.
pub trait BdxMessenger {
    /// Transmit one framed message. `expect_response` arms the
    /// exchange-layer response timeout.
    fn send_message(&mut self, payload: &[u8], expect_response: bool) -> Result<()>;
}

/// Downloader engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloaderState {
    /// No transfer in progress.
    Idle,
    /// Waiting for the image sink to prepare storage.
    Preparing,
    /// Transfer running.
    InProgress,
    /// Final acknowledgement sent; image finalized.
    Complete,
}

/// Client-side BDX transfer engine.
#[derive(Debug)]
pub struct Downloader {
    state: DownloaderState,
    params: Option<TransferInitData>,
    session: TransferSession,
    timeout: Duration,
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Downloader {
    /// Constructs an idle downloader.
    pub fn new() -> Self {
        Self {
            state: DownloaderState::Idle,
            params: None,
            session: TransferSession::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Current engine state.
    pub fn state(&self) -> DownloaderState {
        self.state
    }

    /// The no-progress window the platform should arm its BDX timer
    /// with.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Store negotiated transfer parameters. Only legal while idle,
    /// and required before [`begin_prepare_download`](Self::begin_prepare_download).
    pub fn set_parameters(
        &mut self,
        init: TransferInitData,
        timeout: Duration,
    ) -> Result<()> {
        if self.state != DownloaderState::Idle {
            return Err(Error::IncorrectState);
        }
        self.params = Some(init);
        self.timeout = timeout;
        Ok(())
    }

    /// Ask the image sink to prepare storage and move to `Preparing`.
    ///
    /// Does not contact the peer. Fails with no side effects if a
    /// transfer is already in flight or no parameters are set.
    pub fn begin_prepare_download(
        &mut self,
        sink: &mut dyn ImageSink,
    ) -> Result<()> {
        if self.state != DownloaderState::Idle {
            return Err(Error::IncorrectState);
        }
        if self.params.is_none() {
            return Err(Error::IncorrectState);
        }

        sink.prepare_download()?;
        self.state = DownloaderState::Preparing;
        Ok(())
    }

    /// Completion callback for [`ImageSink::prepare_download`].
    ///
    /// On success the transfer starts: the sub-session queues its
    /// ReceiveInit and the pump sends it.
    pub fn on_prepared_for_download(
        &mut self,
        sink: &mut dyn ImageSink,
        messenger: &mut dyn BdxMessenger,
        status: Result<()>,
    ) -> Result<()> {
        if self.state != DownloaderState::Preparing {
            return Err(Error::IncorrectState);
        }

        if let Err(e) = status {
            debug!("image sink failed to prepare: {e}");
            self.session.reset();
            self.state = DownloaderState::Idle;
            return Ok(());
        }

        // params checked at begin_prepare_download
        let params = self.params.clone().ok_or(Error::Internal)?;
        self.session.start(&params)?;
        self.state = DownloaderState::InProgress;
        self.drain(sink, messenger);
        Ok(())
    }

    /// Proactively request the next block.
    ///
    /// Called by the platform once the sink has consumed the previous
    /// block.
    pub fn fetch_next_data(
        &mut self,
        sink: &mut dyn ImageSink,
        messenger: &mut dyn BdxMessenger,
    ) -> Result<()> {
        if self.state != DownloaderState::InProgress {
            return Err(Error::IncorrectState);
        }
        self.session.prepare_block_query()?;
        self.drain(sink, messenger);
        Ok(())
    }

    /// Inbound half of the transfer bridge: deliver a raw BDX message.
    pub fn on_message_received(
        &mut self,
        sink: &mut dyn ImageSink,
        messenger: &mut dyn BdxMessenger,
        payload: &[u8],
    ) -> Result<()> {
        if self.state != DownloaderState::InProgress {
            return Err(Error::IncorrectState);
        }
        self.session.handle_message(payload);
        self.drain(sink, messenger);
        Ok(())
    }

    /// No-progress timer expiry. Acts only while a transfer is in
    /// progress: discards partial data and returns to idle without
    /// contacting the peer.
    pub fn on_download_timeout(&mut self, sink: &mut dyn ImageSink) {
        if self.state != DownloaderState::InProgress {
            trace!("download timeout ignored in {:?}", self.state);
            return;
        }
        warn!("BDX transfer timed out");
        self.local_abort(sink);
    }

    /// End the transfer.
    ///
    /// There is no graceful close for this role: ending while in
    /// progress always sends `status` to the peer as an abort and
    /// discards partial data.
    pub fn end_download(
        &mut self,
        sink: &mut dyn ImageSink,
        messenger: &mut dyn BdxMessenger,
        status: StatusCode,
    ) {
        match self.state {
            DownloaderState::Idle => (),
            DownloaderState::InProgress => {
                self.abort_transfer(sink, messenger, status);
            }
            DownloaderState::Preparing => {
                // The sink owns prepared storage until finalize or
                // abort; release it.
                self.session.reset();
                let _ = sink.abort();
                self.state = DownloaderState::Idle;
            }
            DownloaderState::Complete => {
                self.session.reset();
                self.state = DownloaderState::Idle;
            }
        }
        self.params = None;
    }

    /// Send an abort status to the peer, discard partial data, reset.
    fn abort_transfer(
        &mut self,
        sink: &mut dyn ImageSink,
        messenger: &mut dyn BdxMessenger,
        status: StatusCode,
    ) {
        self.session.abort(status);
        if let OutputEvent::MsgToSend { payload, .. } = self.session.poll_output()
        {
            if let Err(e) = messenger.send_message(&payload, false) {
                debug!("failed to send abort status: {e}");
            }
        }
        let _ = sink.abort();
        self.session.reset();
        self.state = DownloaderState::Idle;
    }

    /// Discard partial data and reset without contacting the peer.
    fn local_abort(&mut self, sink: &mut dyn ImageSink) {
        self.session.reset();
        let _ = sink.abort();
        self.state = DownloaderState::Idle;
    }

    /// Run the sub-session's pending output to quiescence.
    ///
    /// Not re-entrant; each driving call enters this at most once.
    fn drain(&mut self, sink: &mut dyn ImageSink, messenger: &mut dyn BdxMessenger) {
        for _ in 0..MAX_DRAIN_EVENTS {
            match self.session.poll_output() {
                OutputEvent::None => return,
                OutputEvent::AcceptReceived {
                    max_block_size,
                    length,
                } => {
                    trace!(
                        "transfer accepted, block size {max_block_size}, length {length}"
                    );
                    if self.session.prepare_block_query().is_err() {
                        self.local_abort(sink);
                        return;
                    }
                }
                OutputEvent::MsgToSend {
                    payload,
                    ack_eof,
                    expect_response,
                } => {
                    if let Err(e) = messenger.send_message(&payload, expect_response)
                    {
                        warn!("BDX send failure: {e}");
                        self.local_abort(sink);
                        return;
                    }
                    if ack_eof {
                        self.state = DownloaderState::Complete;
                    }
                }
                OutputEvent::BlockReceived { data, eof } => {
                    if let Err(e) = sink.process_block(&data) {
                        warn!("image sink rejected block: {e}");
                        self.abort_transfer(
                            sink,
                            messenger,
                            StatusCode::TransferFailedUnknownError,
                        );
                        return;
                    }
                    if eof {
                        if self.session.prepare_block_ack_eof().is_err() {
                            self.local_abort(sink);
                            return;
                        }
                        if let Err(e) = sink.finalize() {
                            warn!("image finalize failed: {e}");
                            self.local_abort(sink);
                            return;
                        }
                    }
                }
                OutputEvent::StatusReceived(code) => {
                    warn!("transfer ended by peer status {code:?}");
                    self.local_abort(sink);
                    return;
                }
                OutputEvent::InternalError => {
                    warn!("transfer sub-session internal error");
                    self.local_abort(sink);
                    return;
                }
            }
        }

        warn!("BDX output pump exceeded {MAX_DRAIN_EVENTS} events, aborting");
        self.local_abort(sink);
    }
}
