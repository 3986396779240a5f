use serde::Serialize;

/// Per-camera lifecycle state machine.
///
/// State transitions:
/// ```text
/// stopped → starting → streaming → recording ↔ paused
///     ↑                     ↑           ↓
///     └─────────────────────┴── stopping
/// ```
/// Transitions are only made while holding the source's own lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraState {
    Stopped,
    Starting,
    Streaming,
    Recording,
    Paused,
    Stopping,
}

impl CameraState {
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// A live pipeline is delivering frames. Preview keeps working even
    /// while the on-device recorder is paused.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Streaming | Self::Recording | Self::Paused)
    }

    /// An on-device recording session exists, possibly paused.
    pub fn is_recording(&self) -> bool {
        matches!(self, Self::Recording | Self::Paused)
    }
}

/// Recording session state machine. One live session process-wide.
///
/// ```text
/// idle → warming_up → recording ↔ paused → idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    WarmingUp,
    Recording,
    Paused,
}

impl SessionStatus {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_active(&self) -> bool {
        !self.is_idle()
    }
}

/// Overall conversion job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Converting,
    Done,
    Failed,
    Cancelled,
}

/// Per-camera conversion slot state. Follows the job states plus
/// `Skipped` (output already present and no overwrite requested).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Pending,
    Skipped,
    Converting,
    Done,
    Failed,
    Cancelled,
}

impl SlotStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Converting)
    }
}
