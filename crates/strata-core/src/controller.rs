//! Delta controller: persist, rehydrate, consolidate, roll back
//!
//! One controller owns one agent's identity table and sequence numbers. Every
//! call to [`DeltaController::persist`] turns one epoch of envelopes into one
//! delta, written under a single backend transaction:
//!
//! ```text
//! Idle ──persist──▶ Collecting ──▶ Writing ──┬──▶ Committed
//!                                            └──▶ Aborted
//! ```
//!
//! Only objects touched by the epoch, plus whatever they newly reach, are
//! written. Every `consolidation_period` deltas the controller writes a full
//! snapshot instead and drops the deltas it supersedes.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::codec::{encode_write_set, WireEnvelope, WireSubscriber};
use crate::config::PersistenceConfig;
use crate::delta::{self, DeltaMetadata, DeltaRecord, DeltaTail, ReadMode, ReplayedDelta};
use crate::envelope::{Envelope, SubscriberState};
use crate::error::{PersistenceError, Result};
use crate::identity::IdentityTable;
use crate::object::ObjectHandle;
use crate::repair::repair_links;
use crate::storage::DeltaStore;
use crate::types::{PersistenceReference, SequenceNumbers};

/// Runtime component whose opaque state travels with each delta
pub trait RuntimeParticipant: Send + Sync {
    /// Unique among the participants of one controller
    fn name(&self) -> &str;

    fn checkpoint(&self) -> Result<Vec<u8>>;

    fn restore(&self, state: &[u8]) -> Result<()>;
}

/// Where the controller is in the current epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochPhase {
    Idle,
    Collecting,
    Writing,
    Committed,
    Aborted,
}

/// Everything the agent hands over for one delta
#[derive(Debug, Clone, Default)]
pub struct Epoch {
    /// Envelopes published during the epoch
    pub envelopes: Vec<Envelope>,
    /// Envelopes published but not yet delivered to subscribers
    pub undistributed: Vec<Envelope>,
    pub subscriber_states: Vec<SubscriberState>,
    /// Opaque message-manager state
    pub message_state: Option<Vec<u8>>,
}

impl Epoch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_envelope(mut self, envelope: Envelope) -> Self {
        self.envelopes.push(envelope);
        self
    }

    pub fn with_undistributed(mut self, envelope: Envelope) -> Self {
        self.undistributed.push(envelope);
        self
    }

    pub fn with_subscriber(mut self, state: SubscriberState) -> Self {
        self.subscriber_states.push(state);
        self
    }

    pub fn with_message_state(mut self, state: Vec<u8>) -> Self {
        self.message_state = Some(state);
        self
    }
}

/// Result of a committed delta
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistOutcome {
    pub delta: u32,
    /// Objects written in full, in write order
    pub written: Vec<PersistenceReference>,
    /// Objects left out because they could not be serialized
    pub skipped: Vec<PersistenceReference>,
    /// Range superseded by this delta, if it consolidated
    pub consolidated: Option<SequenceNumbers>,
    /// Sequence numbers after the commit
    pub sequence: SequenceNumbers,
    /// Whether every live object was written
    pub full: bool,
}

/// What rehydration hands back to the agent besides the live objects
#[derive(Debug, Default)]
pub struct RehydratedState {
    pub undistributed: Vec<Envelope>,
    pub subscriber_states: Vec<SubscriberState>,
    pub message_state: Option<Vec<u8>>,
    pub sequence: SequenceNumbers,
    /// Number of active objects emitted
    pub active: usize,
    /// Number of back-pointers repaired
    pub repaired: usize,
}

struct ControllerState {
    table: IdentityTable,
    sequence: Option<SequenceNumbers>,
    /// No delta has been committed by this run yet
    fresh_run: bool,
    /// Write-set of the last aborted delta
    retry: Vec<ObjectHandle>,
    poisoned: bool,
    phase: EpochPhase,
}

impl ControllerState {
    fn new() -> Self {
        Self {
            table: IdentityTable::new(),
            sequence: None,
            fresh_run: true,
            retry: Vec::new(),
            poisoned: false,
            phase: EpochPhase::Idle,
        }
    }
}

/// Wire form of a delta before it reaches the backend
struct PreparedDelta {
    record: DeltaRecord,
    /// Whether the delta supersedes the ones before it
    consolidated: bool,
    write_set: Vec<PersistenceReference>,
    written: Vec<PersistenceReference>,
    skipped: Vec<PersistenceReference>,
}

/// Persistence controller for one agent
pub struct DeltaController<S: DeltaStore> {
    agent: String,
    store: S,
    config: PersistenceConfig,
    participants: RwLock<Vec<Arc<dyn RuntimeParticipant>>>,
    state: Mutex<ControllerState>,
}

impl<S: DeltaStore> DeltaController<S> {
    pub fn new(agent: impl Into<String>, store: S, config: PersistenceConfig) -> Self {
        Self {
            agent: agent.into(),
            store,
            config,
            participants: RwLock::new(Vec::new()),
            state: Mutex::new(ControllerState::new()),
        }
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    /// Sequence numbers as last read or committed, if known yet
    pub fn sequence_numbers(&self) -> Option<SequenceNumbers> {
        self.state.lock().sequence
    }

    pub fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned
    }

    pub fn phase(&self) -> EpochPhase {
        self.state.lock().phase
    }

    /// Register a participant. A participant with the same name is replaced.
    pub fn register_participant(&self, participant: Arc<dyn RuntimeParticipant>) {
        let mut participants = self.participants.write();
        participants.retain(|p| p.name() != participant.name());
        participants.push(participant);
    }

    /// Reference id of `object`, if the controller tracks it
    pub fn reference_of(&self, object: &ObjectHandle) -> Option<PersistenceReference> {
        self.state.lock().table.find(object).map(|a| a.reference())
    }

    /// Run `f` against the identity table
    pub fn with_identity_table<R>(&self, f: impl FnOnce(&IdentityTable) -> R) -> R {
        f(&self.state.lock().table)
    }

    /// Write one epoch as the next delta.
    ///
    /// Either the delta and the new sequence numbers are committed together,
    /// or nothing is written and [`PersistenceError::TransactionAborted`] is
    /// returned; the next call retries the same delta number.
    pub fn persist(&self, mut epoch: Epoch) -> Result<PersistOutcome> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.poisoned {
            return Err(PersistenceError::Poisoned(self.agent.clone()));
        }

        let sequence = match state.sequence {
            Some(sequence) => sequence,
            None => {
                let sequence = self.store.read_sequence_numbers()?.unwrap_or_default();
                state.sequence = Some(sequence);
                sequence
            }
        };
        // Ids minted by this table would collide with those already on disk.
        if state.fresh_run && !sequence.is_empty() {
            return Err(PersistenceError::NotRehydrated {
                agent: self.agent.clone(),
                sequence,
            });
        }
        state.phase = EpochPhase::Collecting;
        let delta = sequence.current;

        let period = self.config.consolidation_period;
        let consolidating =
            period > 0 && sequence.current > sequence.first && sequence.current % period == 0;
        let full = state.fresh_run || consolidating;

        if full {
            for association in state.table.iter_mut() {
                association.mark();
            }
        }
        for object in std::mem::take(&mut state.retry) {
            state.table.find_or_create(&object).mark();
        }

        epoch.envelopes.retain(Envelope::is_persistable);
        epoch.undistributed.retain(Envelope::is_persistable);

        for envelope in &epoch.envelopes {
            for tuple in envelope.tuples() {
                let target = tuple.action().target_state();
                for object in tuple.objects() {
                    let association = state.table.find_or_create(object);
                    association.set_state(target);
                    association.mark();
                }
            }
        }
        let implied = schedule_implied(&mut state.table, &epoch, full);
        tracing::debug!(
            agent = %self.agent,
            delta,
            full,
            implied,
            "Write-set collected"
        );

        state.phase = EpochPhase::Writing;
        let prepared = match self.prepare(&state.table, &epoch, consolidating) {
            Ok(prepared) => prepared,
            Err(err) => {
                let write_set = state.table.marked();
                return Err(self.abort(state, delta, write_set, err));
            }
        };

        let (first, cleanup) = if prepared.consolidated {
            (sequence.current, Some(sequence.first..sequence.current))
        } else {
            (sequence.first, None)
        };
        let retain = SequenceNumbers::new(first, delta + 1);
        if let Err(err) = self.write(&prepared.record, delta, sequence, retain) {
            return Err(self.abort(state, delta, prepared.write_set, err));
        }

        for reference in &prepared.written {
            if let Some(association) = state.table.get_mut(*reference) {
                association.set_persisted();
            }
        }
        state.table.clear_marks();
        state.sequence = Some(retain);
        state.fresh_run = false;
        let purged = state.table.purge();
        if let Some(range) = cleanup.clone() {
            self.cleanup(range);
        }
        state.phase = EpochPhase::Committed;

        tracing::info!(
            agent = %self.agent,
            delta,
            written = prepared.written.len(),
            skipped = prepared.skipped.len(),
            purged,
            consolidated = prepared.consolidated,
            "Delta committed"
        );

        Ok(PersistOutcome {
            delta,
            written: prepared.written,
            skipped: prepared.skipped,
            consolidated: cleanup.map(|range| SequenceNumbers::new(range.start, range.end)),
            sequence: retain,
            full,
        })
    }

    /// Serialize the scheduled objects and the epoch's trailing sections
    fn prepare(
        &self,
        table: &IdentityTable,
        epoch: &Epoch,
        consolidating: bool,
    ) -> Result<PreparedDelta> {
        let write_set = table.marked();
        let encoded = encode_write_set(table, &write_set);
        for (reference, err) in &encoded.skipped {
            tracing::warn!(
                agent = %self.agent,
                reference = %reference,
                error = %err,
                "Skipping object that cannot be serialized"
            );
        }

        // A skipped object that was persisted earlier is still written as a
        // reference, so the deltas defining it must stay.
        let held_back: Vec<PersistenceReference> = encoded
            .skipped
            .iter()
            .map(|(reference, _)| *reference)
            .filter(|reference| table.get(*reference).is_some_and(|a| a.is_persisted()))
            .collect();
        let consolidating = if consolidating && !held_back.is_empty() {
            tracing::warn!(
                agent = %self.agent,
                skipped = ?held_back,
                "Postponing consolidation: skipped objects are only defined by older deltas"
            );
            false
        } else {
            consolidating
        };

        let mut writer = encoded.writer;
        let mut undistributed: Vec<WireEnvelope> = Vec::with_capacity(epoch.undistributed.len());
        for envelope in &epoch.undistributed {
            match writer.write_envelope(envelope) {
                Ok(wire) => undistributed.push(wire),
                Err(err) => {
                    tracing::warn!(agent = %self.agent, error = %err, "Skipping undistributed envelope")
                }
            }
        }
        let mut subscribers: Vec<WireSubscriber> = Vec::with_capacity(epoch.subscriber_states.len());
        for state in &epoch.subscriber_states {
            match writer.write_subscriber(state) {
                Ok(wire) => subscribers.push(wire),
                Err(err) => tracing::warn!(
                    agent = %self.agent,
                    subscriber = %state.subscriber,
                    error = %err,
                    "Skipping subscriber state"
                ),
            }
        }

        let mut metadata = DeltaMetadata::new(self.agent.clone());
        metadata.consolidated = consolidating;
        metadata.runtime = self.checkpoint_participants()?;

        Ok(PreparedDelta {
            record: DeltaRecord {
                next_reference_id: table.next_id(),
                metadata,
                plans: encoded.plans,
                roots: encoded.roots,
                tail: Some(DeltaTail {
                    undistributed,
                    subscribers,
                    message_state: epoch.message_state.clone(),
                }),
            },
            consolidated: consolidating,
            write_set,
            written: encoded.written,
            skipped: encoded.skipped.into_iter().map(|(r, _)| r).collect(),
        })
    }

    fn checkpoint_participants(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut runtime = BTreeMap::new();
        for participant in self.participants.read().iter() {
            runtime.insert(participant.name().to_string(), participant.checkpoint()?);
        }
        Ok(runtime)
    }

    /// One backend transaction for delta `delta`
    fn write(
        &self,
        record: &DeltaRecord,
        delta: u32,
        previous: SequenceNumbers,
        retain: SequenceNumbers,
    ) -> Result<()> {
        let mut output = self.store.open_output(delta)?;
        if let Err(err) = delta::write_delta(&mut output, record) {
            if let Err(abort_err) = self.store.abort_output(previous, output) {
                tracing::warn!(agent = %self.agent, delta, error = %abort_err, "Abort failed");
            }
            return Err(err);
        }
        self.store.close_output(retain, output)
    }

    fn abort(
        &self,
        state: &mut ControllerState,
        delta: u32,
        write_set: Vec<PersistenceReference>,
        err: PersistenceError,
    ) -> PersistenceError {
        state.retry = write_set
            .into_iter()
            .filter_map(|reference| state.table.resolve(reference))
            .collect();
        state.table.clear_marks();
        state.phase = EpochPhase::Aborted;
        tracing::warn!(
            agent = %self.agent,
            delta,
            retry = state.retry.len(),
            error = %err,
            "Delta aborted"
        );
        PersistenceError::TransactionAborted {
            delta,
            source: Box::new(err),
        }
    }

    fn cleanup(&self, range: Range<u32>) {
        match self.store.cleanup_deltas(range.clone()) {
            Ok(()) => tracing::debug!(agent = %self.agent, ?range, "Superseded deltas removed"),
            Err(err) => tracing::warn!(
                agent = %self.agent,
                ?range,
                error = %err,
                "Failed to remove superseded deltas"
            ),
        }
    }

    /// Rebuild the agent's state from the committed deltas.
    ///
    /// Every object still active is added to `output`. Returns `None` when
    /// nothing was ever committed. A failure while replaying poisons the
    /// controller: every later call fails until [`clear`](Self::clear).
    pub fn rehydrate(&self, output: &mut Envelope) -> Result<Option<RehydratedState>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.poisoned {
            return Err(PersistenceError::Poisoned(self.agent.clone()));
        }

        let Some(sequence) = self.store.read_sequence_numbers()? else {
            return Ok(None);
        };
        state.sequence = Some(sequence);
        let Some(last) = sequence.last() else {
            return Ok(None);
        };

        state.table.begin_rehydration();
        let mut final_delta = ReplayedDelta::default();
        for delta in sequence.iter() {
            let mode = if delta == last {
                ReadMode::Final
            } else {
                ReadMode::Intermediate
            };
            match self.replay(&mut state.table, delta, mode) {
                Ok(replayed) if mode == ReadMode::Final => final_delta = replayed,
                Ok(_) => {}
                Err(err) => {
                    state.table.end_rehydration();
                    return Err(self.poison(state, delta, err));
                }
            }
        }

        if let Err(err) = self.restore_participants(&final_delta.runtime) {
            state.table.end_rehydration();
            return Err(self.poison(state, last, err));
        }

        // Keeps every object read alive until the active set is handed over.
        let read = state.table.end_rehydration();
        let active: Vec<ObjectHandle> = state
            .table
            .iter()
            .filter(|a| a.is_active())
            .filter_map(|a| a.object())
            .collect();
        for object in &active {
            output.add(object);
        }
        let repaired = repair_links(&active, &self.config.link_rules);
        drop(read);
        let purged = state.table.purge();

        state.fresh_run = false;
        state.phase = EpochPhase::Idle;

        tracing::info!(
            agent = %self.agent,
            deltas = sequence.len(),
            active = active.len(),
            repaired,
            purged,
            next_id = state.table.next_id(),
            "Rehydration complete"
        );

        Ok(Some(RehydratedState {
            undistributed: final_delta.undistributed,
            subscriber_states: final_delta.subscriber_states,
            message_state: final_delta.message_state,
            sequence,
            active: active.len(),
            repaired,
        }))
    }

    fn replay(&self, table: &mut IdentityTable, delta: u32, mode: ReadMode) -> Result<ReplayedDelta> {
        let mut input = self.store.open_input(delta)?;
        let record = delta::read_delta(&mut input, delta, mode, self.config.verify_checksums)?;
        self.store.close_input(delta, input)?;
        tracing::debug!(
            agent = %self.agent,
            delta,
            objects = record.roots.len(),
            ?mode,
            "Replaying delta"
        );
        record.replay(table)
    }

    fn restore_participants(&self, runtime: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        for participant in self.participants.read().iter() {
            match runtime.get(participant.name()) {
                Some(bytes) => participant.restore(bytes)?,
                None => tracing::debug!(
                    agent = %self.agent,
                    participant = participant.name(),
                    "No checkpoint for participant"
                ),
            }
        }
        Ok(())
    }

    fn poison(&self, state: &mut ControllerState, delta: u32, err: PersistenceError) -> PersistenceError {
        state.poisoned = true;
        state.phase = EpochPhase::Aborted;
        tracing::error!(
            agent = %self.agent,
            delta,
            error = %err,
            "Rehydration failed; agent must not continue"
        );
        PersistenceError::RehydrationFailed {
            delta,
            source: Box::new(err),
        }
    }

    /// Delete all persisted state and start over.
    ///
    /// Also lifts poisoning and forgets every tracked object, so ids are
    /// minted from zero again.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.store.delete_all()?;
        *state = ControllerState::new();
        tracing::info!(agent = %self.agent, "Persisted state cleared");
        Ok(())
    }
}

/// Schedule objects the write-set depends on.
///
/// Starting from the scheduled objects and every object named by the
/// undistributed envelopes and subscriber queues, follow references and
/// schedule each object that is not yet durable (any object, on a full
/// snapshot). Only scheduled objects are descended into: an unscheduled
/// durable object is not rewritten, so its contents are not needed.
fn schedule_implied(table: &mut IdentityTable, epoch: &Epoch, full: bool) -> usize {
    let mut pending: Vec<ObjectHandle> = table
        .iter()
        .filter(|a| a.is_marked())
        .filter_map(|a| a.object())
        .collect();
    pending.extend(epoch.undistributed.iter().flat_map(|e| e.objects()).cloned());
    pending.extend(
        epoch
            .subscriber_states
            .iter()
            .flat_map(|s| s.objects())
            .cloned(),
    );

    let mut visited = HashSet::new();
    let mut scheduled = 0;
    while let Some(object) = pending.pop() {
        if !visited.insert(object.key()) {
            continue;
        }
        let association = table.find_or_create(&object);
        if !association.is_marked() && (full || !association.is_persisted()) && association.mark() {
            scheduled += 1;
        }
        if association.is_marked() {
            pending.extend(object.references());
        }
    }
    scheduled
}

impl<S: DeltaStore> fmt::Debug for DeltaController<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DeltaController")
            .field("agent", &self.agent)
            .field("sequence", &state.sequence)
            .field("phase", &state.phase)
            .field("poisoned", &state.poisoned)
            .field("tracked", &state.table.len())
            .finish_non_exhaustive()
    }
}
