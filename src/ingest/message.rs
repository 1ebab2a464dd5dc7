//! Messages for the ingest worker.

/// Messages the ingest worker receives over its bounded channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMessage {
    /// Drain the pending task queue.
    ///
    /// Requests are idempotent: one drain picks up every task enqueued before
    /// it starts, so a request dropped because the channel is full loses
    /// nothing.
    Drain,

    /// Finish the current drain and exit.
    Shutdown,
}
