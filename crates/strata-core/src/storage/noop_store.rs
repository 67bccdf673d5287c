//! Backend that keeps nothing

use std::io;
use std::ops::Range;

use crate::error::{PersistenceError, Result};
use crate::storage::DeltaStore;
use crate::types::SequenceNumbers;

/// Accepts every write and forgets it. Agents running on it always start fresh.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStore;

impl NoopStore {
    pub fn new() -> Self {
        Self
    }
}

impl DeltaStore for NoopStore {
    type Output = io::Sink;
    type Input = io::Empty;

    fn read_sequence_numbers(&self) -> Result<Option<SequenceNumbers>> {
        Ok(None)
    }

    fn open_output(&self, _delta: u32) -> Result<Self::Output> {
        Ok(io::sink())
    }

    fn close_output(&self, _retain: SequenceNumbers, _output: Self::Output) -> Result<()> {
        Ok(())
    }

    fn abort_output(&self, _retain: SequenceNumbers, _output: Self::Output) -> Result<()> {
        Ok(())
    }

    fn open_input(&self, delta: u32) -> Result<Self::Input> {
        Err(PersistenceError::DeltaNotFound(delta))
    }

    fn cleanup_deltas(&self, _range: Range<u32>) -> Result<()> {
        Ok(())
    }

    fn delete_all(&self) -> Result<()> {
        Ok(())
    }

    fn list_deltas(&self) -> Result<Vec<u32>> {
        Ok(Vec::new())
    }
}
