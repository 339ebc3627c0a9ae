use serde::{Deserialize, Serialize};

/// Backend message id (numeric). This is the only thing that addresses a stored object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub i32);

/// A stored object as reported by the backend after an upload.
///
/// `filename` is display/validation metadata only; two handles with the same
/// `message_id` address the same object regardless of their names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHandle {
    pub message_id: MessageId,
    pub filename: String,
}

impl FileHandle {
    pub fn new(message_id: MessageId, filename: impl Into<String>) -> Self {
        Self {
            message_id,
            filename: filename.into(),
        }
    }
}

/// Lifecycle state of the supervised worker process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Starting => "starting",
            WorkerStatus::Running => "running",
            WorkerStatus::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
