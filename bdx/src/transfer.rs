// SPDX-License-Identifier: MIT OR Apache-2.0

//! BDX transfer sub-session
//!
//! [`TransferSession`] holds pure protocol state for a single
//! receiver-driven transfer. It performs no I/O: driving calls queue
//! pending output events which the owner repeatedly collects via
//! [`TransferSession::poll_output`] and dispatches.

use std::collections::VecDeque;

use log::{debug, trace};

use crate::proto::{
    Message, StatusCode, CONTROL_RECEIVER_DRIVE, MAX_FILE_DESIGNATOR,
};
use crate::{Error, Result};

/// Parameters negotiated before a transfer begins.
#[derive(Debug, Clone)]
pub struct TransferInitData {
    /// Path identifying the file on the sender. Fixed capacity;
    /// oversized designators must be rejected by the caller.
    pub file_designator: heapless::Vec<u8, MAX_FILE_DESIGNATOR>,
    /// Largest block this client will accept.
    pub max_block_size: u16,
}

/// A pending output event from the sub-session.
#[derive(Debug)]
pub enum OutputEvent {
    /// Nothing pending.
    None,
    /// The sender accepted the transfer.
    AcceptReceived {
        /// Negotiated block size
        max_block_size: u16,
        /// Total transfer length, 0 if indefinite
        length: u64,
    },
    /// A framed message ready to transmit.
    MsgToSend {
        /// Encoded message payload
        payload: Vec<u8>,
        /// True when this is the final end-of-file acknowledgement
        ack_eof: bool,
        /// Whether the exchange should await a response
        expect_response: bool,
    },
    /// A block of transfer data arrived.
    BlockReceived {
        /// Block payload
        data: Vec<u8>,
        /// True when this block is marked end-of-file
        eof: bool,
    },
    /// The peer reported an error status.
    StatusReceived(StatusCode),
    /// Unrecoverable protocol violation.
    InternalError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    InitSent,
    Transferring,
    Done,
}

/// Protocol state for a single receiver-driven transfer.
#[derive(Debug)]
pub struct TransferSession {
    state: SessionState,
    proposed_block_size: u16,
    negotiated_block_size: u16,
    file_designator: heapless::Vec<u8, MAX_FILE_DESIGNATOR>,
    /// Count of blocks accepted so far; also the counter carried by
    /// the next BlockQuery. Never decreases within a transfer.
    block_counter: u32,
    eof_seen: bool,
    output: VecDeque<OutputEvent>,
}

impl Default for TransferSession {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferSession {
    /// Constructs an idle sub-session.
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            proposed_block_size: 0,
            negotiated_block_size: 0,
            file_designator: heapless::Vec::new(),
            block_counter: 0,
            eof_seen: false,
            output: VecDeque::new(),
        }
    }

    /// Begin a transfer, queueing the outbound ReceiveInit.
    ///
    /// Only legal while idle.
    pub fn start(&mut self, init: &TransferInitData) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(Error::IncorrectState);
        }

        self.file_designator = init.file_designator.clone();
        self.proposed_block_size = init.max_block_size;

        let payload = Message::ReceiveInit {
            proposed_control: CONTROL_RECEIVER_DRIVE,
            max_block_size: init.max_block_size,
            file_designator: &self.file_designator,
        }
        .encode()?;

        self.output.push_back(OutputEvent::MsgToSend {
            payload,
            ack_eof: false,
            expect_response: true,
        });
        self.state = SessionState::InitSent;
        Ok(())
    }

    /// Feed a raw inbound message into the sub-session.
    ///
    /// Decode failures are logged and swallowed; protocol violations
    /// queue an [`OutputEvent::InternalError`].
    pub fn handle_message(&mut self, payload: &[u8]) {
        let msg = match Message::parse(payload) {
            Ok(m) => m,
            Err(e) => {
                debug!("dropping undecodable BDX message: {e}");
                return;
            }
        };

        match msg {
            Message::ReceiveAccept {
                control,
                max_block_size,
                length,
            } => self.accept_in(control, max_block_size, length),
            Message::Block {
                block_counter,
                data,
            } => self.block_in(block_counter, data, false),
            Message::BlockEof {
                block_counter,
                data,
            } => self.block_in(block_counter, data, true),
            Message::StatusReport { status } => {
                debug!("peer status report {status:?}");
                self.output.push_back(OutputEvent::StatusReceived(status));
            }
            m => {
                debug!("unexpected BDX message for receiver role: {m:?}");
                self.output.push_back(OutputEvent::InternalError);
            }
        }
    }

    fn accept_in(&mut self, control: u8, max_block_size: u16, length: u64) {
        if self.state != SessionState::InitSent {
            debug!("ReceiveAccept outside init");
            self.output.push_back(OutputEvent::InternalError);
            return;
        }
        if control & CONTROL_RECEIVER_DRIVE == 0
            || max_block_size == 0
            || max_block_size > self.proposed_block_size
        {
            debug!(
                "unacceptable transfer terms: control {control:#x} block {max_block_size}"
            );
            self.output.push_back(OutputEvent::InternalError);
            return;
        }

        self.negotiated_block_size = max_block_size;
        self.state = SessionState::Transferring;
        self.output.push_back(OutputEvent::AcceptReceived {
            max_block_size,
            length,
        });
    }

    fn block_in(&mut self, counter: u32, data: &[u8], eof: bool) {
        if self.state != SessionState::Transferring {
            debug!("block outside transfer");
            self.output.push_back(OutputEvent::InternalError);
            return;
        }
        if self.eof_seen {
            trace!("dropping block after EOF");
            return;
        }
        if counter.wrapping_add(1) == self.block_counter {
            // Retransmission of the previous block.
            trace!("dropping duplicate block {counter}");
            return;
        }
        if counter != self.block_counter {
            debug!(
                "block counter {counter}, expected {}",
                self.block_counter
            );
            self.output.push_back(OutputEvent::InternalError);
            return;
        }
        if data.len() > usize::from(self.negotiated_block_size) {
            debug!("oversized block of {} bytes", data.len());
            self.output.push_back(OutputEvent::InternalError);
            return;
        }

        self.block_counter = self.block_counter.wrapping_add(1);
        self.eof_seen = eof;
        self.output.push_back(OutputEvent::BlockReceived {
            data: data.to_vec(),
            eof,
        });
    }

    /// Queue a BlockQuery for the next block.
    pub fn prepare_block_query(&mut self) -> Result<()> {
        if self.state != SessionState::Transferring || self.eof_seen {
            return Err(Error::IncorrectState);
        }
        let payload = Message::BlockQuery {
            block_counter: self.block_counter,
        }
        .encode()?;
        self.output.push_back(OutputEvent::MsgToSend {
            payload,
            ack_eof: false,
            expect_response: true,
        });
        Ok(())
    }

    /// Queue the final end-of-file acknowledgement.
    pub fn prepare_block_ack_eof(&mut self) -> Result<()> {
        if self.state != SessionState::Transferring || !self.eof_seen {
            return Err(Error::IncorrectState);
        }
        let payload = Message::BlockAckEof {
            block_counter: self.block_counter.wrapping_sub(1),
        }
        .encode()?;
        self.output.push_back(OutputEvent::MsgToSend {
            payload,
            ack_eof: true,
            expect_response: false,
        });
        self.state = SessionState::Done;
        Ok(())
    }

    /// Abort the transfer, discarding pending output and queueing a
    /// StatusReport for the peer.
    pub fn abort(&mut self, status: StatusCode) {
        self.output.clear();
        let report = Message::StatusReport { status }.encode();
        match report {
            Ok(payload) => self.output.push_back(OutputEvent::MsgToSend {
                payload,
                ack_eof: false,
                expect_response: false,
            }),
            Err(e) => debug!("failed to encode abort status: {e}"),
        }
        self.state = SessionState::Idle;
        self.block_counter = 0;
        self.eof_seen = false;
    }

    /// Pull the next pending output event.
    pub fn poll_output(&mut self) -> OutputEvent {
        self.output.pop_front().unwrap_or(OutputEvent::None)
    }

    /// Drop all state and pending output, returning to idle.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Block size negotiated by the accept, 0 before acceptance.
    pub fn negotiated_block_size(&self) -> u16 {
        self.negotiated_block_size
    }

    /// Count of blocks accepted so far.
    pub fn block_counter(&self) -> u32 {
        self.block_counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> TransferSession {
        let mut s = TransferSession::new();
        let init = TransferInitData {
            file_designator: heapless::Vec::from_slice(b"fw/app.bin").unwrap(),
            max_block_size: 256,
        };
        s.start(&init).unwrap();
        // Drain the ReceiveInit send.
        assert!(matches!(
            s.poll_output(),
            OutputEvent::MsgToSend { ack_eof: false, .. }
        ));
        s
    }

    fn accept(s: &mut TransferSession) {
        let accept = Message::ReceiveAccept {
            control: CONTROL_RECEIVER_DRIVE,
            max_block_size: 256,
            length: 0,
        }
        .encode()
        .unwrap();
        s.handle_message(&accept);
        assert!(matches!(s.poll_output(), OutputEvent::AcceptReceived { .. }));
    }

    #[test]
    fn start_twice_fails() {
        let mut s = started();
        let init = TransferInitData {
            file_designator: heapless::Vec::new(),
            max_block_size: 64,
        };
        assert!(matches!(s.start(&init), Err(Error::IncorrectState)));
    }

    #[test]
    fn duplicate_block_dropped_counter_regression_fatal() {
        let mut s = started();
        accept(&mut s);

        let b0 = Message::Block {
            block_counter: 0,
            data: &[1, 2, 3],
        }
        .encode()
        .unwrap();
        s.handle_message(&b0);
        assert!(matches!(
            s.poll_output(),
            OutputEvent::BlockReceived { eof: false, .. }
        ));

        // Retransmission of block 0 is tolerated silently.
        s.handle_message(&b0);
        assert!(matches!(s.poll_output(), OutputEvent::None));

        // A jump past the expected counter is fatal.
        let b9 = Message::Block {
            block_counter: 9,
            data: &[4],
        }
        .encode()
        .unwrap();
        s.handle_message(&b9);
        assert!(matches!(s.poll_output(), OutputEvent::InternalError));
    }

    #[test]
    fn block_before_accept_is_protocol_error() {
        let mut s = started();
        let b0 = Message::Block {
            block_counter: 0,
            data: &[1],
        }
        .encode()
        .unwrap();
        s.handle_message(&b0);
        assert!(matches!(s.poll_output(), OutputEvent::InternalError));
    }

    #[test]
    fn eof_then_ack_terminates() {
        let mut s = started();
        accept(&mut s);

        let eof = Message::BlockEof {
            block_counter: 0,
            data: &[7],
        }
        .encode()
        .unwrap();
        s.handle_message(&eof);
        assert!(matches!(
            s.poll_output(),
            OutputEvent::BlockReceived { eof: true, .. }
        ));

        s.prepare_block_ack_eof().unwrap();
        match s.poll_output() {
            OutputEvent::MsgToSend {
                payload, ack_eof, ..
            } => {
                assert!(ack_eof);
                assert_eq!(
                    Message::parse(&payload).unwrap(),
                    Message::BlockAckEof { block_counter: 0 }
                );
            }
            e => panic!("unexpected event {e:?}"),
        }

        // No further queries after completion.
        assert!(s.prepare_block_query().is_err());
    }

    #[test]
    fn abort_discards_pending_and_queues_status() {
        let mut s = started();
        accept(&mut s);
        s.prepare_block_query().unwrap();

        s.abort(StatusCode::Unknown);
        match s.poll_output() {
            OutputEvent::MsgToSend { payload, .. } => assert_eq!(
                Message::parse(&payload).unwrap(),
                Message::StatusReport {
                    status: StatusCode::Unknown
                }
            ),
            e => panic!("unexpected event {e:?}"),
        }
        assert!(matches!(s.poll_output(), OutputEvent::None));
    }

    #[test]
    fn undecodable_message_is_swallowed() {
        let mut s = started();
        accept(&mut s);
        s.handle_message(&[0xff, 0xff]);
        assert!(matches!(s.poll_output(), OutputEvent::None));
    }
}
