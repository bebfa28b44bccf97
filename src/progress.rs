use crate::error::ToleranceExceeded;
use crate::fusion::FusedSnapshot;
use crate::safety::SafetyLevel;
use crate::scheduler::StepState;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

const PROGRESS_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProgressKind {
    Transition,
    Tick,
    Warning(ToleranceExceeded),
    Safety(SafetyLevel),
}

/// Intermediate `{state, snapshot}` update for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub sequence_number: u64,
    pub timestamp_ms: u64,
    pub step_id: String,
    pub state: StepState,
    pub kind: ProgressKind,
    pub snapshot: Option<FusedSnapshot>,
}

impl ProgressEvent {
    /// One-line rendering for compact output.
    pub fn summary(&self) -> String {
        let detail = match &self.kind {
            ProgressKind::Transition => format!("-> {:?}", self.state),
            ProgressKind::Tick => self
                .snapshot
                .as_ref()
                .map(|s| {
                    s.signals
                        .values()
                        .map(|f| match f.value.as_scalar() {
                            Some(v) => format!("{}={v:.2}", f.signal),
                            None => format!("{}={:?}", f.signal, f.value.channels()),
                        })
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .unwrap_or_default(),
            ProgressKind::Warning(w) => w.to_string(),
            ProgressKind::Safety(level) => format!("safety {level:?}"),
        };
        format!(
            "#{} {:>8}ms {} {}",
            self.sequence_number, self.timestamp_ms, self.step_id, detail
        )
    }
}

/// Sequence-numbered fan-out of progress events to any number of readers.
#[derive(Debug)]
pub struct ProgressPublisher {
    tx: broadcast::Sender<ProgressEvent>,
    sequence_number: AtomicU64,
}

impl ProgressPublisher {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(PROGRESS_BUFFER_SIZE);
        Self {
            tx,
            sequence_number: AtomicU64::new(0),
        }
    }

    pub fn publish(
        &self,
        timestamp_ms: u64,
        step_id: &str,
        state: StepState,
        kind: ProgressKind,
        snapshot: Option<FusedSnapshot>,
    ) -> u64 {
        let sequence_number = self.sequence_number.fetch_add(1, Ordering::Relaxed) + 1;
        // no subscribers is fine
        let _ = self.tx.send(ProgressEvent {
            sequence_number,
            timestamp_ms,
            step_id: step_id.to_string(),
            state,
            kind,
            snapshot,
        });
        sequence_number
    }

    pub fn subscribe(&self) -> ProgressStream {
        ProgressStream {
            rx: self.tx.subscribe(),
        }
    }

    pub fn current_sequence_number(&self) -> u64 {
        self.sequence_number.load(Ordering::Relaxed)
    }
}

impl Default for ProgressPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Ends once the owning session is gone.
#[derive(Debug)]
pub struct ProgressStream {
    rx: broadcast::Receiver<ProgressEvent>,
}

impl ProgressStream {
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "progress subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
