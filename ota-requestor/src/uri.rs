// SPDX-License-Identifier: MIT OR Apache-2.0

//! Image locator parsing
//!
//! A query response locates its image with a compact URI of the form
//! `bdx://<16-hex-node-id>/<file-designator>`. Parsing is a pure
//! function; each validation step fails fast with a distinct error
//! and the output is never partially populated.

use log::trace;

use nom::{
    bytes::complete::{tag, take},
    IResult,
};
use thiserror::Error;

use crate::types::{FileDesignator, NodeId};

/// Scheme prefix for BDX-served images.
pub const SCHEME: &str = "bdx://";

const NODE_ID_HEX_LEN: usize = 16;
const SEPARATOR: &str = "/";

/// Shortest well-formed locator: scheme, node id, separator, and a
/// one-byte designator.
pub const MIN_URI_LEN: usize =
    SCHEME.len() + NODE_ID_HEX_LEN + SEPARATOR.len() + 1;

/// Locator parse failure, one kind per validation step.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriError {
    /// Input shorter than the minimum valid locator
    #[error("locator shorter than {MIN_URI_LEN} bytes")]
    InvalidLength,
    /// Scheme prefix mismatch
    #[error("locator scheme is not `{SCHEME}`")]
    InvalidScheme,
    /// Node id field is not 16 hex digits naming an operational node
    #[error("locator destination is not an operational node id")]
    InvalidDestination,
    /// Separator between node id and path missing
    #[error("locator path separator missing")]
    MissingSeparator,
    /// File designator exceeds the fixed output capacity
    #[error("file designator exceeds capacity")]
    NoSpace,
}

type Step<'a> = IResult<&'a [u8], &'a [u8], ()>;

fn scheme(i: &[u8]) -> Step<'_> {
    tag(SCHEME.as_bytes())(i)
}

fn node_hex(i: &[u8]) -> Step<'_> {
    take(NODE_ID_HEX_LEN)(i)
}

fn separator(i: &[u8]) -> Step<'_> {
    tag(SEPARATOR.as_bytes())(i)
}

/// Parse a locator into its peer identity and file designator.
pub fn parse(uri: &str) -> Result<(NodeId, FileDesignator), UriError> {
    let input = uri.as_bytes();
    if input.len() < MIN_URI_LEN {
        return Err(UriError::InvalidLength);
    }

    let (r, _) = scheme(input).map_err(|_| UriError::InvalidScheme)?;

    let (r, hex) = node_hex(r).map_err(|_| UriError::InvalidDestination)?;
    let node = decode_node_id(hex)?;

    let (designator, _) = separator(r).map_err(|_| UriError::MissingSeparator)?;

    // Fixed-capacity copy; reject rather than truncate.
    let designator =
        FileDesignator::from_slice(designator).map_err(|()| UriError::NoSpace)?;

    Ok((node, designator))
}

fn decode_node_id(hex: &[u8]) -> Result<NodeId, UriError> {
    // from_str_radix tolerates a sign prefix; the field must be hex
    // digits only.
    if !hex.iter().all(u8::is_ascii_hexdigit) {
        return Err(UriError::InvalidDestination);
    }
    let s = core::str::from_utf8(hex).map_err(|_| UriError::InvalidDestination)?;
    let v = u64::from_str_radix(s, 16).map_err(|e| {
        trace!("locator node id decode failure: {e}");
        UriError::InvalidDestination
    })?;
    let node = NodeId(v);
    if !node.is_operational() {
        return Err(UriError::InvalidDestination);
    }
    Ok(node)
}

/// Encode a locator from a peer identity and designator.
pub fn encode(node: NodeId, designator: &str) -> Result<String, UriError> {
    if !node.is_operational() {
        return Err(UriError::InvalidDestination);
    }
    if designator.is_empty() || designator.len() > FileDesignator::new().capacity()
    {
        return Err(UriError::NoSpace);
    }
    Ok(format!("{SCHEME}{node}{SEPARATOR}{designator}"))
}
