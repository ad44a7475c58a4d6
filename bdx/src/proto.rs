// SPDX-License-Identifier: MIT OR Apache-2.0

//! BDX wire message codec
//!
//! Framing is a one-byte message type followed by little-endian
//! fields. Variable-length fields (file designator, block data) are
//! prefixed with a 16-bit length.

use log::trace;

use nom::{
    combinator::{all_consuming, map, map_opt},
    multi::length_data,
    number::complete::{le_u16, le_u32, le_u64, le_u8},
    sequence::tuple,
    IResult,
};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::{Error, Result};

/// Maximum file designator length accepted or sent.
pub const MAX_FILE_DESIGNATOR: usize = 256;

/// Smallest block size the client will propose or accept.
pub const MIN_BLOCK_SIZE: u16 = 64;

/// Transfer control bit: the receiver drives the transfer by
/// requesting each block explicitly.
pub const CONTROL_RECEIVER_DRIVE: u8 = 0x01;
/// Transfer control bit: the sender streams blocks unsolicited.
/// Not supported by this client role.
pub const CONTROL_SENDER_DRIVE: u8 = 0x02;

/// BDX message type discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum MsgType {
    /// Receiver-initiated transfer request
    ReceiveInit = 0x01,
    /// Sender's acceptance of a ReceiveInit
    ReceiveAccept = 0x02,
    /// Explicit request for the next block
    BlockQuery = 0x03,
    /// A block of transfer data
    Block = 0x04,
    /// The final block of transfer data
    BlockEof = 0x05,
    /// Acknowledgement of the final block
    BlockAckEof = 0x06,
    /// Error/abort status from either side
    StatusReport = 0x07,
}

/// BDX status codes carried by StatusReport messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum StatusCode {
    Ok = 0x0000,
    LengthTooLarge = 0x0012,
    BadMessageContents = 0x0017,
    BadBlockCounter = 0x0018,
    UnexpectedMessage = 0x0019,
    TransferFailedUnknownError = 0x001f,
    TransferMethodNotSupported = 0x0050,
    FileDesignatorUnknown = 0x0052,
    Unknown = 0x005f,
}

/// A decoded BDX message, borrowing payload bytes from the input.
#[derive(Debug, PartialEq, Eq)]
pub enum Message<'a> {
    /// Receiver-initiated transfer request
    ReceiveInit {
        /// Proposed transfer control bits
        proposed_control: u8,
        /// Largest block the receiver will accept
        max_block_size: u16,
        /// Path identifying the file on the sender
        file_designator: &'a [u8],
    },
    /// Sender's acceptance, carrying the negotiated parameters
    ReceiveAccept {
        /// Chosen transfer control bits
        control: u8,
        /// Negotiated block size
        max_block_size: u16,
        /// Total transfer length, 0 if indefinite
        length: u64,
    },
    /// Request for the block with the given counter
    BlockQuery {
        /// Counter of the requested block
        block_counter: u32,
    },
    /// A non-final data block
    Block {
        /// Counter of this block
        block_counter: u32,
        /// Block payload
        data: &'a [u8],
    },
    /// The final data block
    BlockEof {
        /// Counter of this block
        block_counter: u32,
        /// Block payload, may be empty
        data: &'a [u8],
    },
    /// Acknowledgement of the final block
    BlockAckEof {
        /// Counter of the acknowledged block
        block_counter: u32,
    },
    /// Error/abort status
    StatusReport {
        /// Reported status
        status: StatusCode,
    },
}

impl<'a> Message<'a> {
    /// Decode a BDX message.
    ///
    /// The entire input must be consumed; trailing bytes are a decode
    /// error.
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        let (_, msg) = all_consuming(Self::parse_inner)(buf).map_err(|e| {
            trace!("bdx decode failure: {e:?}");
            Error::Decode("malformed BDX message")
        })?;
        Ok(msg)
    }

    fn parse_inner(buf: &'a [u8]) -> IResult<&'a [u8], Self> {
        let (r, typ) = map_opt(le_u8, MsgType::from_u8)(buf)?;
        match typ {
            MsgType::ReceiveInit => map(
                tuple((le_u8, le_u16, length_data(le_u16))),
                |(proposed_control, max_block_size, file_designator)| {
                    Self::ReceiveInit {
                        proposed_control,
                        max_block_size,
                        file_designator,
                    }
                },
            )(r),
            MsgType::ReceiveAccept => map(
                tuple((le_u8, le_u16, le_u64)),
                |(control, max_block_size, length)| Self::ReceiveAccept {
                    control,
                    max_block_size,
                    length,
                },
            )(r),
            MsgType::BlockQuery => {
                map(le_u32, |block_counter| Self::BlockQuery { block_counter })(r)
            }
            MsgType::Block => map(
                tuple((le_u32, length_data(le_u16))),
                |(block_counter, data)| Self::Block {
                    block_counter,
                    data,
                },
            )(r),
            MsgType::BlockEof => map(
                tuple((le_u32, length_data(le_u16))),
                |(block_counter, data)| Self::BlockEof {
                    block_counter,
                    data,
                },
            )(r),
            MsgType::BlockAckEof => map(le_u32, |block_counter| {
                Self::BlockAckEof { block_counter }
            })(r),
            MsgType::StatusReport => map(map_opt(le_u16, StatusCode::from_u16), |status| {
                Self::StatusReport { status }
            })(r),
        }
    }

    /// Encode this message into a framed payload.
    ///
    /// Length-prefixed fields larger than a 16-bit length are rejected
    /// with [`Error::NoSpace`], never truncated.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(16);
        match self {
            Self::ReceiveInit {
                proposed_control,
                max_block_size,
                file_designator,
            } => {
                out.push(MsgType::ReceiveInit as u8);
                out.push(*proposed_control);
                out.extend_from_slice(&max_block_size.to_le_bytes());
                push_prefixed(&mut out, file_designator)?;
            }
            Self::ReceiveAccept {
                control,
                max_block_size,
                length,
            } => {
                out.push(MsgType::ReceiveAccept as u8);
                out.push(*control);
                out.extend_from_slice(&max_block_size.to_le_bytes());
                out.extend_from_slice(&length.to_le_bytes());
            }
            Self::BlockQuery { block_counter } => {
                out.push(MsgType::BlockQuery as u8);
                out.extend_from_slice(&block_counter.to_le_bytes());
            }
            Self::Block {
                block_counter,
                data,
            } => {
                out.push(MsgType::Block as u8);
                out.extend_from_slice(&block_counter.to_le_bytes());
                push_prefixed(&mut out, data)?;
            }
            Self::BlockEof {
                block_counter,
                data,
            } => {
                out.push(MsgType::BlockEof as u8);
                out.extend_from_slice(&block_counter.to_le_bytes());
                push_prefixed(&mut out, data)?;
            }
            Self::BlockAckEof { block_counter } => {
                out.push(MsgType::BlockAckEof as u8);
                out.extend_from_slice(&block_counter.to_le_bytes());
            }
            Self::StatusReport { status } => {
                out.push(MsgType::StatusReport as u8);
                out.extend_from_slice(&(*status as u16).to_le_bytes());
            }
        }
        Ok(out)
    }
}

fn push_prefixed(out: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len()).map_err(|_| Error::NoSpace)?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(data);
    Ok(())
}
