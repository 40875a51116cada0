use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TerminalResult {
    Success,
    Failed(String),
    Cancelled,
}

/// Progress handle for one resource moving between peers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transfer {
    pub id: u64,
    pub resource_name: String,
    pub direction: Direction,
    pub progress_fraction: f64,
    pub terminal_result: Option<TerminalResult>,
}

impl Transfer {
    pub fn new(id: u64, resource_name: impl Into<String>, direction: Direction) -> Self {
        Self {
            id,
            resource_name: resource_name.into(),
            direction,
            progress_fraction: 0.0,
            terminal_result: None,
        }
    }

    /// Move progress forward. Smaller values and updates after the
    /// terminal result are ignored.
    pub fn advance(&mut self, fraction: f64) {
        if self.terminal_result.is_some() || fraction.is_nan() {
            return;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        if fraction > self.progress_fraction {
            self.progress_fraction = fraction;
        }
    }

    /// Record the outcome. Only the first call has an effect.
    pub fn finish(&mut self, result: TerminalResult) {
        if self.terminal_result.is_some() {
            return;
        }
        if result == TerminalResult::Success {
            self.progress_fraction = 1.0;
        }
        self.terminal_result = Some(result);
    }

    pub fn is_finished(&self) -> bool {
        self.terminal_result.is_some()
    }
}

/// What the session last did with a resource, for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TransferStatus {
    Idle,
    Sending { name: String },
    Sent { name: String },
    SendFailed { name: String, reason: String },
    SendCancelled { name: String },
    Receiving { name: String },
    Extracting { name: String },
    Received { folder: PathBuf, skipped: usize },
    ReceiveFailed { reason: String },
}

impl TransferStatus {
    /// True for outcomes; false for idle and in-flight states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Sent { .. }
                | TransferStatus::SendFailed { .. }
                | TransferStatus::SendCancelled { .. }
                | TransferStatus::Received { .. }
                | TransferStatus::ReceiveFailed { .. }
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Idle => write!(f, "Idle"),
            TransferStatus::Sending { name } => write!(f, "Sending {}", name),
            TransferStatus::Sent { name } => write!(f, "Sent {}", name),
            TransferStatus::SendFailed { name, reason } => {
                write!(f, "Failed to send {}: {}", name, reason)
            }
            TransferStatus::SendCancelled { name } => write!(f, "Cancelled sending {}", name),
            TransferStatus::Receiving { name } => write!(f, "Receiving {}", name),
            TransferStatus::Extracting { name } => write!(f, "Extracting {}", name),
            TransferStatus::Received { folder, skipped: 0 } => {
                write!(f, "Received into {}", folder.display())
            }
            TransferStatus::Received { folder, skipped } => write!(
                f,
                "Received into {} ({} damaged file(s) skipped)",
                folder.display(),
                skipped
            ),
            TransferStatus::ReceiveFailed { reason } => write!(f, "Receive failed: {}", reason),
        }
    }
}
