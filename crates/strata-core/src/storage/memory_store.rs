//! In-process backend
//!
//! Clones share state, so a test can drop a controller, open a new one over a
//! clone of the same store, and observe a restart.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::{self, Cursor, Write};
use std::ops::Range;
use std::sync::Arc;

use crate::error::{PersistenceError, Result};
use crate::storage::DeltaStore;
use crate::types::SequenceNumbers;

#[derive(Debug, Default)]
struct MemoryState {
    deltas: BTreeMap<u32, Vec<u8>>,
    sequence: Option<SequenceNumbers>,
    /// Byte budget for the next opened output
    fail_after: Option<usize>,
}

/// Deltas kept in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

/// Buffered delta, committed on close
#[derive(Debug)]
pub struct MemoryOutput {
    delta: u32,
    buffer: Vec<u8>,
    budget: Option<usize>,
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(budget) = self.budget {
            if self.buffer.len() + buf.len() > budget {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("injected write failure after {} bytes", budget),
                ));
            }
        }
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next opened output fail once more than `bytes` bytes are written
    pub fn fail_next_write_after(&self, bytes: usize) {
        self.state.lock().fail_after = Some(bytes);
    }

    /// Raw bytes of a committed delta
    pub fn delta_bytes(&self, delta: u32) -> Option<Vec<u8>> {
        self.state.lock().deltas.get(&delta).cloned()
    }

    /// Rewrite a committed delta in place. Returns `false` if it does not exist.
    pub fn tamper(&self, delta: u32, f: impl FnOnce(&mut Vec<u8>)) -> bool {
        match self.state.lock().deltas.get_mut(&delta) {
            Some(bytes) => {
                f(bytes);
                true
            }
            None => false,
        }
    }

    pub fn delta_count(&self) -> usize {
        self.state.lock().deltas.len()
    }
}

impl DeltaStore for MemoryStore {
    type Output = MemoryOutput;
    type Input = Cursor<Vec<u8>>;

    fn read_sequence_numbers(&self) -> Result<Option<SequenceNumbers>> {
        Ok(self.state.lock().sequence)
    }

    fn open_output(&self, delta: u32) -> Result<Self::Output> {
        let budget = self.state.lock().fail_after.take();
        Ok(MemoryOutput {
            delta,
            buffer: Vec::new(),
            budget,
        })
    }

    fn close_output(&self, retain: SequenceNumbers, output: Self::Output) -> Result<()> {
        let mut state = self.state.lock();
        state.deltas.insert(output.delta, output.buffer);
        state.sequence = Some(retain);
        Ok(())
    }

    fn abort_output(&self, _retain: SequenceNumbers, output: Self::Output) -> Result<()> {
        tracing::debug!(delta = output.delta, bytes = output.buffer.len(), "Discarding aborted delta");
        Ok(())
    }

    fn open_input(&self, delta: u32) -> Result<Self::Input> {
        self.state
            .lock()
            .deltas
            .get(&delta)
            .cloned()
            .map(Cursor::new)
            .ok_or(PersistenceError::DeltaNotFound(delta))
    }

    fn cleanup_deltas(&self, range: Range<u32>) -> Result<()> {
        let mut state = self.state.lock();
        state.deltas.retain(|delta, _| !range.contains(delta));
        Ok(())
    }

    fn delete_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.deltas.clear();
        state.sequence = None;
        Ok(())
    }

    fn list_deltas(&self) -> Result<Vec<u32>> {
        Ok(self.state.lock().deltas.keys().copied().collect())
    }
}
