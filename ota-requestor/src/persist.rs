// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resumption-state persistence
//!
//! Serializes the requestor's durable fields through the [`Store`]
//! collaborator. Persistence is best effort: a missing key yields the
//! field default, and any other storage failure is logged and
//! otherwise ignored.

use log::{debug, warn};

use nom::{
    combinator::{all_consuming, map},
    multi::length_count,
    number::complete::{le_u16, le_u32, le_u64, le_u8},
    sequence::tuple,
    IResult,
};
use num_traits::FromPrimitive;

use crate::platform::{Store, StoreError, StoreKey};
use crate::types::{
    DefaultProviderList, NodeId, ProviderLocation, UpdateState, UpdateToken,
    MAX_DEFAULT_PROVIDERS, MAX_UPDATE_TOKEN,
};

const PROVIDER_LEN: usize = 11;
const PROVIDER_LIST_LEN: usize = 1 + MAX_DEFAULT_PROVIDERS * PROVIDER_LEN;

/// The durable subset of requestor state.
#[derive(Debug, Clone)]
pub struct RequestorRecord {
    /// Provider for the in-flight update, if any
    pub provider: Option<ProviderLocation>,
    /// Update token for the in-flight update
    pub update_token: UpdateToken,
    /// State at the last persist
    pub state: UpdateState,
    /// Target version of the in-flight update, 0 when none
    pub target_version: u32,
    /// Per-fabric default providers
    pub default_providers: DefaultProviderList,
}

impl Default for RequestorRecord {
    fn default() -> Self {
        Self {
            provider: None,
            update_token: UpdateToken::new(),
            state: UpdateState::Idle,
            target_version: 0,
            default_providers: DefaultProviderList::new(),
        }
    }
}

fn parse_provider(i: &[u8]) -> IResult<&[u8], ProviderLocation> {
    map(tuple((le_u64, le_u16, le_u8)), |(n, endpoint, fabric_index)| {
        ProviderLocation {
            node_id: NodeId(n),
            endpoint,
            fabric_index,
        }
    })(i)
}

fn encode_provider(p: &ProviderLocation) -> [u8; PROVIDER_LEN] {
    let mut out = [0u8; PROVIDER_LEN];
    out[..8].copy_from_slice(&p.node_id.0.to_le_bytes());
    out[8..10].copy_from_slice(&p.endpoint.to_le_bytes());
    out[10] = p.fabric_index;
    out
}

fn load_bytes<'b>(
    store: &mut dyn Store,
    key: StoreKey,
    buf: &'b mut [u8],
) -> Option<&'b [u8]> {
    match store.load(key, buf) {
        Ok(n) => Some(&buf[..n]),
        Err(StoreError::NotFound) => None,
        Err(e) => {
            warn!("failed to load {}: {e}", key.name());
            None
        }
    }
}

fn best_effort(res: core::result::Result<(), StoreError>, key: StoreKey) {
    match res {
        Ok(()) | Err(StoreError::NotFound) => (),
        Err(e) => warn!("failed to persist {}: {e}", key.name()),
    }
}

/// Load the full record, defaulting each absent or unreadable field.
pub fn load_record(store: &mut dyn Store) -> RequestorRecord {
    let mut rec = RequestorRecord::default();

    let mut buf = [0u8; PROVIDER_LIST_LEN];

    if let Some(raw) = load_bytes(store, StoreKey::ProviderLocation, &mut buf) {
        match all_consuming(parse_provider)(raw) {
            Ok((_, p)) => rec.provider = Some(p),
            Err(_) => debug!("discarding malformed persisted provider"),
        }
    }

    if let Some(raw) = load_bytes(store, StoreKey::UpdateToken, &mut buf) {
        match UpdateToken::from_slice(raw) {
            Ok(t) => rec.update_token = t,
            Err(()) => debug!("discarding oversized persisted token"),
        }
    }

    if let Some(raw) = load_bytes(store, StoreKey::UpdateState, &mut buf) {
        match raw {
            [b] => match UpdateState::from_u8(*b) {
                Some(s) => rec.state = s,
                None => debug!("discarding unknown persisted state {b}"),
            },
            _ => debug!("discarding malformed persisted state"),
        }
    }

    if let Some(raw) = load_bytes(store, StoreKey::TargetVersion, &mut buf) {
        match all_consuming(le_u32::<_, nom::error::Error<&[u8]>>)(raw) {
            Ok((_, v)) => rec.target_version = v,
            Err(_) => debug!("discarding malformed persisted target version"),
        }
    }

    if let Some(raw) = load_bytes(store, StoreKey::DefaultProviders, &mut buf) {
        match all_consuming(length_count(le_u8, parse_provider))(raw) {
            Ok((_, list)) => {
                for p in list {
                    if rec.default_providers.push(p).is_err() {
                        debug!("persisted provider list exceeds capacity");
                        break;
                    }
                }
            }
            Err(_) => debug!("discarding malformed persisted provider list"),
        }
    }

    rec
}

/// Persist (or clear) the current provider location.
pub fn save_provider(store: &mut dyn Store, provider: Option<&ProviderLocation>) {
    let key = StoreKey::ProviderLocation;
    match provider {
        Some(p) => best_effort(store.store(key, &encode_provider(p)), key),
        None => best_effort(store.clear(key), key),
    }
}

/// Persist the update token; an empty token clears the entry.
pub fn save_token(store: &mut dyn Store, token: &UpdateToken) {
    let key = StoreKey::UpdateToken;
    if token.is_empty() {
        best_effort(store.clear(key), key);
    } else {
        best_effort(store.store(key, token), key);
    }
}

/// Persist the current update state.
pub fn save_state(store: &mut dyn Store, state: UpdateState) {
    best_effort(
        store.store(StoreKey::UpdateState, &[state as u8]),
        StoreKey::UpdateState,
    );
}

/// Persist the target software version.
pub fn save_target_version(store: &mut dyn Store, version: u32) {
    best_effort(
        store.store(StoreKey::TargetVersion, &version.to_le_bytes()),
        StoreKey::TargetVersion,
    );
}

/// Persist the default provider list.
pub fn save_default_providers(store: &mut dyn Store, list: &DefaultProviderList) {
    let mut out = Vec::with_capacity(1 + list.len() * PROVIDER_LEN);
    out.push(list.len() as u8);
    for p in list {
        out.extend_from_slice(&encode_provider(p));
    }
    best_effort(
        store.store(StoreKey::DefaultProviders, &out),
        StoreKey::DefaultProviders,
    );
}

/// Persist every durable field. Used unconditionally before an apply,
/// since applying is expected to restart the device.
pub fn save_record(store: &mut dyn Store, rec: &RequestorRecord) {
    save_provider(store, rec.provider.as_ref());
    save_token(store, &rec.update_token);
    save_state(store, rec.state);
    save_target_version(store, rec.target_version);
    save_default_providers(store, &rec.default_providers);
}

// Token fits every buffer above.
const _: () = assert!(MAX_UPDATE_TOKEN <= PROVIDER_LIST_LEN);
