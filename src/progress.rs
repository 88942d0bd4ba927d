//! Transfer progress reporting.
//!
//! Every remote operation reports its lifecycle on a single multiplexed
//! channel owned by the [`crate::remote::RemoteFs`] that issued it. The
//! channel is bounded; consumers that stop draining it eventually apply
//! backpressure to uploads.

use std::fmt;

/// Capacity of the multiplexed progress channel.
pub const PROGRESS_BUFFER: usize = 10_000;

/// Kind of transfer an event belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TransferOp {
    Upload,
    Download,
    Copy,
    Remove,
}

impl fmt::Display for TransferOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferOp::Upload => "UPLOAD",
            TransferOp::Download => "DOWNLOAD",
            TransferOp::Copy => "COPY",
            TransferOp::Remove => "REMOVE",
        };
        f.write_str(name)
    }
}

/// Lifecycle phase within one transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TransferPhase {
    Started,
    Transferring,
    Completed,
    Failed,
}

impl fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferPhase::Started => "Started",
            TransferPhase::Transferring => "Transferring",
            TransferPhase::Completed => "Completed",
            TransferPhase::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// One progress observation of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub op: TransferOp,
    pub src: String,
    pub dst: String,
    pub total_bytes: u64,
    pub consumed_bytes: u64,
    pub phase: TransferPhase,
}

impl ProgressEvent {
    /// Completion percentage, zero when the total is unknown.
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.consumed_bytes as f64 * 100.0 / self.total_bytes as f64
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}({:.2}%)] {}, src:{}, dst:{}, totalBytes:{}, consumedBytes:{}",
            self.op, self.percent(), self.phase, self.src, self.dst,
            self.total_bytes, self.consumed_bytes
        )
    }
}

/// Per-transfer reporting handle bound to one (op, src, dst) triple.
///
/// Store implementations receive a sink per call and report through it;
/// the sink multiplexes onto the owning channel. Sends are best-effort
/// once the owning channel is closed.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: async_channel::Sender<ProgressEvent>,
    op: TransferOp,
    src: String,
    dst: String,
}

impl ProgressSink {
    pub fn new(
        tx: async_channel::Sender<ProgressEvent>,
        op: TransferOp,
        src: impl Into<String>,
        dst: impl Into<String>,
    ) -> Self {
        Self { tx, op, src: src.into(), dst: dst.into() }
    }

    pub async fn started(&self, total_bytes: u64) {
        self.emit(TransferPhase::Started, 0, total_bytes).await;
    }

    pub async fn transferring(&self, consumed_bytes: u64, total_bytes: u64) {
        self.emit(TransferPhase::Transferring, consumed_bytes, total_bytes).await;
    }

    pub async fn completed(&self, total_bytes: u64) {
        self.emit(TransferPhase::Completed, total_bytes, total_bytes).await;
    }

    pub async fn failed(&self) {
        self.emit(TransferPhase::Failed, 0, 0).await;
    }

    async fn emit(&self, phase: TransferPhase, consumed_bytes: u64, total_bytes: u64) {
        let event = ProgressEvent {
            op: self.op,
            src: self.src.clone(),
            dst: self.dst.clone(),
            total_bytes,
            consumed_bytes,
            phase,
        };
        // A closed channel means the owning handler is shutting down; the
        // transfer itself proceeds.
        let _ = self.tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sink_tags_events_with_its_triple() {
        let (tx, rx) = async_channel::bounded(8);
        let sink = ProgressSink::new(tx, TransferOp::Upload, "/tmp/a", "p/a");
        sink.started(10).await;
        sink.completed(10).await;

        let first = rx.recv().await.expect("started event");
        assert_eq!(first.phase, TransferPhase::Started);
        assert_eq!(first.src, "/tmp/a");
        assert_eq!(first.dst, "p/a");

        let second = rx.recv().await.expect("completed event");
        assert_eq!(second.phase, TransferPhase::Completed);
        assert_eq!(second.consumed_bytes, 10);
    }

    #[test]
    fn percent_handles_unknown_total() {
        let event = ProgressEvent {
            op: TransferOp::Remove,
            src: String::new(),
            dst: String::new(),
            total_bytes: 0,
            consumed_bytes: 0,
            phase: TransferPhase::Completed,
        };
        assert_eq!(event.percent(), 0.0);
    }
}
