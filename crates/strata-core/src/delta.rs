//! Delta byte layout
//!
//! A delta is written as a sequence of bincode values, in this order:
//!
//! 1. `next_reference_id: u32`
//! 2. [`DeltaMetadata`]
//! 3. `object_count: u32`, then `object_count` reference plans
//! 4. the object payload as one length-prefixed byte block
//! 5. undistributed envelopes
//! 6. `subscriber_count: u32`, then that many subscriber snapshots
//! 7. message-manager state
//!
//! Every delta carries all sections, but only the last delta of a sequence is
//! read past the payload (see [`ReadMode`]).

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::codec::{GraphReader, ReferencePlan, WireEnvelope, WireRoot, WireSubscriber};
use crate::envelope::{Envelope, SubscriberState};
use crate::error::{Result, StreamIntegrityError};
use crate::identity::IdentityTable;
use crate::object::ObjectHandle;
use crate::types::PersistenceReference;

/// Version of the layout written by this build
pub const FORMAT_VERSION: u16 = 1;

/// Upper bound on capacity reserved from a count read off the wire
const MAX_PREALLOCATE: usize = 1024;

/// Versioned header block of a delta
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaMetadata {
    pub format_version: u16,
    pub agent: String,
    /// Commit time, milliseconds since the Unix epoch
    pub saved_at_ms: i64,
    /// Whether this delta is a full snapshot that made older deltas obsolete
    pub consolidated: bool,
    /// BLAKE3 hash of the object payload
    pub payload_checksum: [u8; 32],
    /// Runtime participant checkpoints by participant name
    pub runtime: BTreeMap<String, Vec<u8>>,
}

impl DeltaMetadata {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            agent: agent.into(),
            saved_at_ms: Utc::now().timestamp_millis(),
            consolidated: false,
            payload_checksum: [0; 32],
            runtime: BTreeMap::new(),
        }
    }

    pub fn saved_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.saved_at_ms).single()
    }
}

/// Sections after the payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaTail {
    pub undistributed: Vec<WireEnvelope>,
    pub subscribers: Vec<WireSubscriber>,
    pub message_state: Option<Vec<u8>>,
}

/// A delta in wire form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaRecord {
    pub next_reference_id: u32,
    pub metadata: DeltaMetadata,
    pub plans: Vec<ReferencePlan>,
    pub roots: Vec<WireRoot>,
    /// Present when the delta was read in [`ReadMode::Final`], or is about to be written
    pub tail: Option<DeltaTail>,
}

/// How far into a delta to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Object graph only
    Intermediate,
    /// Object graph and trailing sections
    Final,
}

/// Header and raw payload, before the payload is decoded
struct RawDelta {
    next_reference_id: u32,
    metadata: DeltaMetadata,
    plans: Vec<ReferencePlan>,
    payload: Vec<u8>,
}

/// Write `record` in delta layout. The payload checksum is computed here;
/// whatever `record.metadata.payload_checksum` holds is ignored.
pub fn write_delta<W: Write>(out: &mut W, record: &DeltaRecord) -> Result<()> {
    let payload = bincode::serialize(&record.roots)?;
    let mut metadata = record.metadata.clone();
    metadata.payload_checksum = *blake3::hash(&payload).as_bytes();

    bincode::serialize_into(&mut *out, &record.next_reference_id)?;
    bincode::serialize_into(&mut *out, &metadata)?;
    bincode::serialize_into(&mut *out, &(record.plans.len() as u32))?;
    for plan in &record.plans {
        bincode::serialize_into(&mut *out, plan)?;
    }
    bincode::serialize_into(&mut *out, &payload)?;

    let empty = DeltaTail::default();
    let tail = record.tail.as_ref().unwrap_or(&empty);
    bincode::serialize_into(&mut *out, &tail.undistributed)?;
    bincode::serialize_into(&mut *out, &(tail.subscribers.len() as u32))?;
    for subscriber in &tail.subscribers {
        bincode::serialize_into(&mut *out, subscriber)?;
    }
    bincode::serialize_into(&mut *out, &tail.message_state)?;
    out.flush()?;
    Ok(())
}

fn read_raw<R: Read>(input: &mut R) -> Result<RawDelta> {
    let next_reference_id: u32 = bincode::deserialize_from(&mut *input)?;
    let metadata: DeltaMetadata = bincode::deserialize_from(&mut *input)?;
    if metadata.format_version != FORMAT_VERSION {
        return Err(StreamIntegrityError::UnsupportedFormat(metadata.format_version).into());
    }

    let count: u32 = bincode::deserialize_from(&mut *input)?;
    let mut plans = Vec::with_capacity((count as usize).min(MAX_PREALLOCATE));
    for _ in 0..count {
        let plan: ReferencePlan = bincode::deserialize_from(&mut *input)?;
        plans.push(plan);
    }
    let payload: Vec<u8> = bincode::deserialize_from(&mut *input)?;

    Ok(RawDelta {
        next_reference_id,
        metadata,
        plans,
        payload,
    })
}

/// Read delta number `delta` from `input`
pub fn read_delta<R: Read>(
    input: &mut R,
    delta: u32,
    mode: ReadMode,
    verify_checksum: bool,
) -> Result<DeltaRecord> {
    let raw = read_raw(input)?;
    if verify_checksum && *blake3::hash(&raw.payload).as_bytes() != raw.metadata.payload_checksum {
        return Err(StreamIntegrityError::ChecksumMismatch(delta).into());
    }

    let roots: Vec<WireRoot> = bincode::deserialize(&raw.payload)?;
    if roots.len() != raw.plans.len() {
        return Err(StreamIntegrityError::ObjectCountMismatch {
            declared: raw.plans.len(),
            actual: roots.len(),
        }
        .into());
    }

    let tail = match mode {
        ReadMode::Intermediate => None,
        ReadMode::Final => Some(read_tail(input)?),
    };

    Ok(DeltaRecord {
        next_reference_id: raw.next_reference_id,
        metadata: raw.metadata,
        plans: raw.plans,
        roots,
        tail,
    })
}

fn read_tail<R: Read>(input: &mut R) -> Result<DeltaTail> {
    let undistributed: Vec<WireEnvelope> = bincode::deserialize_from(&mut *input)?;
    let count: u32 = bincode::deserialize_from(&mut *input)?;
    let mut subscribers = Vec::with_capacity((count as usize).min(MAX_PREALLOCATE));
    for _ in 0..count {
        let subscriber: WireSubscriber = bincode::deserialize_from(&mut *input)?;
        subscribers.push(subscriber);
    }
    let message_state: Option<Vec<u8>> = bincode::deserialize_from(&mut *input)?;
    Ok(DeltaTail {
        undistributed,
        subscribers,
        message_state,
    })
}

/// Live state produced by replaying one delta
#[derive(Debug, Default)]
pub struct ReplayedDelta {
    /// Objects written in the delta, in write order
    pub objects: Vec<ObjectHandle>,
    pub undistributed: Vec<Envelope>,
    pub subscriber_states: Vec<SubscriberState>,
    pub message_state: Option<Vec<u8>>,
    pub runtime: BTreeMap<String, Vec<u8>>,
}

impl DeltaRecord {
    /// Merge this delta into `table`, overwriting objects it already holds
    pub fn replay(self, table: &mut IdentityTable) -> Result<ReplayedDelta> {
        table.set_next_id(self.next_reference_id);
        let mut reader = GraphReader::new(table);
        let objects = reader.read_roots(self.roots, &self.plans)?;

        let mut replayed = ReplayedDelta {
            objects,
            runtime: self.metadata.runtime,
            ..ReplayedDelta::default()
        };
        if let Some(tail) = self.tail {
            replayed.undistributed = tail
                .undistributed
                .into_iter()
                .map(|e| reader.read_envelope(e))
                .collect::<std::result::Result<_, _>>()?;
            replayed.subscriber_states = tail
                .subscribers
                .into_iter()
                .map(|s| reader.read_subscriber(s))
                .collect::<std::result::Result<_, _>>()?;
            replayed.message_state = tail.message_state;
        }
        Ok(replayed)
    }

    /// Reference ids of the objects written in this delta
    pub fn references(&self) -> Vec<PersistenceReference> {
        self.plans
            .iter()
            .filter_map(|plan| plan.first().copied().flatten())
            .collect()
    }
}

/// What a delta holds, decoded without an identity table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaSummary {
    pub delta: u32,
    pub format_version: u16,
    pub agent: String,
    pub saved_at_ms: i64,
    pub consolidated: bool,
    pub next_reference_id: u32,
    pub object_count: usize,
    pub payload_bytes: usize,
    pub payload_checksum: [u8; 32],
    pub checksum_valid: bool,
    pub references: Vec<PersistenceReference>,
    /// Written objects per kind
    pub kinds: BTreeMap<String, usize>,
    pub runtime_participants: Vec<String>,
}

/// Summarize delta number `delta`
pub fn inspect_delta<R: Read>(input: &mut R, delta: u32) -> Result<DeltaSummary> {
    let raw = read_raw(input)?;
    let checksum_valid = *blake3::hash(&raw.payload).as_bytes() == raw.metadata.payload_checksum;

    let mut kinds = BTreeMap::new();
    if checksum_valid {
        let roots: Vec<WireRoot> = bincode::deserialize(&raw.payload)?;
        for root in &roots {
            *kinds.entry(root.object.kind.clone()).or_insert(0) += 1;
        }
    }

    Ok(DeltaSummary {
        delta,
        format_version: raw.metadata.format_version,
        agent: raw.metadata.agent,
        saved_at_ms: raw.metadata.saved_at_ms,
        consolidated: raw.metadata.consolidated,
        next_reference_id: raw.next_reference_id,
        object_count: raw.plans.len(),
        payload_bytes: raw.payload.len(),
        payload_checksum: raw.metadata.payload_checksum,
        checksum_valid,
        references: raw
            .plans
            .iter()
            .filter_map(|plan| plan.first().copied().flatten())
            .collect(),
        kinds,
        runtime_participants: raw.metadata.runtime.into_keys().collect(),
    })
}
