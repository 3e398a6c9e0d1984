//! Result sink: the streaming output interface the engine writes to

use crate::Result;
use arrow::record_batch::RecordBatch;

/// Receives chunks of standardized rows: the user's requested columns in
/// the requested types, packing already applied.
pub trait ResultSink {
    /// Deliver one chunk; more may follow.
    fn write_some(&mut self, chunk: RecordBatch) -> Result<()>;

    /// Deliver the final chunk and finish.
    fn write_all_and_finish(&mut self, chunk: RecordBatch) -> Result<()> {
        self.write_some(chunk)?;
        self.finish()
    }

    /// No more chunks.
    fn finish(&mut self) -> Result<()>;
}

/// A sink that buffers everything in memory. Handy for tests and for small
/// result sets.
#[derive(Debug, Default)]
pub struct BufferSink {
    pub batches: Vec<RecordBatch>,
    pub finished: bool,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }
}

impl ResultSink for BufferSink {
    fn write_some(&mut self, chunk: RecordBatch) -> Result<()> {
        self.batches.push(chunk);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}
