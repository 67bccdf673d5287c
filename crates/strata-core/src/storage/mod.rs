//! Storage backends for deltas
//!
//! The controller never touches bytes at rest directly. Everything goes
//! through [`DeltaStore`], which owns two things per agent: the ordered set of
//! committed deltas, and the `(first, current)` [`SequenceNumbers`] naming the
//! readable range.
//!
//! # Transactions
//!
//! A delta is written through the output returned by
//! [`DeltaStore::open_output`] and becomes visible only on
//! [`DeltaStore::close_output`], which also records the new sequence numbers.
//! The two must land together: after a crash either both are visible or
//! neither is. [`DeltaStore::abort_output`] discards everything written.
//!
//! ```text
//! open_output(n) ──write──▶ close_output(seq, out)   delta n + seq committed
//!                     └───▶ abort_output(seq, out)   nothing survives
//! ```
//!
//! # Backends
//!
//! | Backend        | Bytes at rest                         |
//! |----------------|---------------------------------------|
//! | [`FileStore`]  | one file per delta, `sequence.json`   |
//! | [`SqliteStore`]| WAL database shared by all agents     |
//! | [`MemoryStore`]| process memory, with fault injection  |
//! | [`NoopStore`]  | nothing                               |

pub mod file_store;
pub mod memory_store;
pub mod noop_store;
pub mod sqlite_store;

pub use file_store::FileStore;
pub use memory_store::MemoryStore;
pub use noop_store::NoopStore;
pub use sqlite_store::SqliteStore;

use std::io::{Read, Write};
use std::ops::Range;

use crate::error::Result;
use crate::types::SequenceNumbers;

/// Durable home of one agent's deltas
pub trait DeltaStore: Send + Sync {
    /// Byte sink for a delta being written
    type Output: Write + Send;
    /// Byte source for a committed delta
    type Input: Read + Send;

    /// The committed range, or `None` if nothing was ever committed
    fn read_sequence_numbers(&self) -> Result<Option<SequenceNumbers>>;

    /// Start writing delta `delta`
    fn open_output(&self, delta: u32) -> Result<Self::Output>;

    /// Commit the delta written to `output` together with `retain`
    fn close_output(&self, retain: SequenceNumbers, output: Self::Output) -> Result<()>;

    /// Discard the delta written to `output`. `retain` is the range that stays valid.
    fn abort_output(&self, retain: SequenceNumbers, output: Self::Output) -> Result<()>;

    fn open_input(&self, delta: u32) -> Result<Self::Input>;

    fn close_input(&self, delta: u32, input: Self::Input) -> Result<()> {
        let _ = delta;
        drop(input);
        Ok(())
    }

    /// Delete the deltas in `range`. Missing deltas are not an error.
    fn cleanup_deltas(&self, range: Range<u32>) -> Result<()>;

    /// Delete every delta and the sequence numbers
    fn delete_all(&self) -> Result<()>;

    /// Numbers of the deltas present, ascending
    fn list_deltas(&self) -> Result<Vec<u32>>;
}
