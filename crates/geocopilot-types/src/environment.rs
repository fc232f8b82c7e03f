use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Optional host facilities detected for the current session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentProfile {
    pub has_interactive_handle: bool,
    pub has_background_task_framework: bool,
    pub has_processing_registry: bool,
    pub detected_at: DateTime<Utc>,
}

impl EnvironmentProfile {
    pub fn headless() -> Self {
        Self {
            has_interactive_handle: false,
            has_background_task_framework: false,
            has_processing_registry: false,
            detected_at: Utc::now(),
        }
    }

    pub fn summary(&self) -> String {
        let flag = |present: bool| if present { "yes" } else { "no" };
        format!(
            "interactive={} background_tasks={} processing={}",
            flag(self.has_interactive_handle),
            flag(self.has_background_task_framework),
            flag(self.has_processing_registry)
        )
    }
}
