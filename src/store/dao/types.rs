use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// WorkStatus - ワークのライフサイクル上の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    Created,
    Checked,
    Completed,
    Failed,
    Canceled,
}

impl WorkStatus {
    pub const ALL: [WorkStatus; 5] = [
        WorkStatus::Created,
        WorkStatus::Checked,
        WorkStatus::Completed,
        WorkStatus::Failed,
        WorkStatus::Canceled,
    ];

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkStatus::Completed | WorkStatus::Failed | WorkStatus::Canceled
        )
    }
}

impl AsRef<str> for WorkStatus {
    fn as_ref(&self) -> &str {
        match self {
            WorkStatus::Created => "created",
            WorkStatus::Checked => "checked",
            WorkStatus::Completed => "completed",
            WorkStatus::Failed => "failed",
            WorkStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown work status {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for WorkStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" => Ok(WorkStatus::Created),
            "checked" => Ok(WorkStatus::Checked),
            "completed" => Ok(WorkStatus::Completed),
            "failed" => Ok(WorkStatus::Failed),
            "canceled" | "cancelled" => Ok(WorkStatus::Canceled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}
