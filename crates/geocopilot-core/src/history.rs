use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use geocopilot_types::{ExecutionResult, ExecutionStatus};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub script: String,
    pub result: ExecutionResult,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionStatistics {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub success_rate: f64,
    pub average_duration_ms: u64,
}

/// Bounded record of recent runs, newest last.
#[derive(Debug, Clone)]
pub struct ExecutionHistory {
    limit: usize,
    entries: VecDeque<HistoryEntry>,
}

impl ExecutionHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn record(&mut self, script: &str, result: &ExecutionResult) {
        if self.entries.len() == self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry {
            script: script.to_string(),
            result: result.clone(),
            recorded_at: Utc::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn recent(&self, n: usize) -> Vec<&HistoryEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).collect()
    }

    pub fn statistics(&self) -> ExecutionStatistics {
        let total = self.entries.len();
        if total == 0 {
            return ExecutionStatistics::default();
        }
        let count = |status: ExecutionStatus| {
            self.entries
                .iter()
                .filter(|e| e.result.status == status)
                .count()
        };
        let succeeded = count(ExecutionStatus::Success);
        let cancelled = count(ExecutionStatus::Cancelled);
        let total_ms = self
            .entries
            .iter()
            .map(|e| e.result.duration_ms)
            .sum::<u64>();
        ExecutionStatistics {
            total,
            succeeded,
            failed: total - succeeded - cancelled,
            cancelled,
            success_rate: succeeded as f64 * 100.0 / total as f64,
            average_duration_ms: total_ms / total as u64,
        }
    }

    /// Summary of the last `n` runs for the collaborator, with recurring
    /// error kinds called out.
    pub fn context_summary(&self, n: usize) -> String {
        let recent = self.recent(n);
        if recent.is_empty() {
            return "No recent executions.".to_string();
        }
        let mut out = vec!["RECENT EXECUTION HISTORY:".to_string()];
        let mut kinds: BTreeMap<&'static str, usize> = BTreeMap::new();
        for (idx, entry) in recent.iter().enumerate() {
            let result = &entry.result;
            out.push(format!(
                "{}. [{}] {} ({} ms)",
                idx + 1,
                entry.recorded_at.format("%H:%M:%S"),
                result.status.as_str(),
                result.duration_ms
            ));
            if let Some(err) = &result.structured_error {
                out.push(format!("   error: {}", err.summary()));
                *kinds.entry(err.kind.as_str()).or_default() += 1;
            } else if let Some(last) = result.stdout_lines.last() {
                out.push(format!("   output: {last}"));
            }
        }
        if !kinds.is_empty() {
            out.push(String::new());
            out.push("COMMON ISSUES DETECTED:".to_string());
            for (kind, n) in kinds {
                out.push(format!("- {kind}: {n} occurrence(s)"));
            }
        }
        out.join("\n")
    }
}

impl Default for ExecutionHistory {
    fn default() -> Self {
        Self::new(50)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geocopilot_types::{ErrorKind, StructuredError};

    fn result(status: ExecutionStatus, duration_ms: u64) -> ExecutionResult {
        ExecutionResult {
            request_id: "req".to_string(),
            run_id: "run".to_string(),
            status,
            stdout_lines: vec!["42".to_string()],
            structured_error: (status != ExecutionStatus::Success).then(|| {
                StructuredError::new(ErrorKind::UncaughtRuntimeError, "NameError: x")
            }),
            produced_artifacts: vec![],
            duration_ms,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn history_is_bounded() {
        let mut history = ExecutionHistory::new(2);
        for ms in [10, 20, 30] {
            history.record("print()", &result(ExecutionStatus::Success, ms));
        }
        assert_eq!(history.len(), 2);
        assert_eq!(history.recent(5)[0].result.duration_ms, 20);
    }

    #[test]
    fn statistics_count_by_status() {
        let mut history = ExecutionHistory::default();
        history.record("a", &result(ExecutionStatus::Success, 100));
        history.record("b", &result(ExecutionStatus::RuntimeError, 50));
        history.record("c", &result(ExecutionStatus::Cancelled, 30));
        history.record("d", &result(ExecutionStatus::Success, 20));
        let stats = history.statistics();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.success_rate, 50.0);
        assert_eq!(stats.average_duration_ms, 50);
    }

    #[test]
    fn context_summary_calls_out_repeated_errors() {
        let mut history = ExecutionHistory::default();
        assert_eq!(history.context_summary(3), "No recent executions.");
        history.record("a", &result(ExecutionStatus::RuntimeError, 5));
        history.record("b", &result(ExecutionStatus::RuntimeError, 5));
        let summary = history.context_summary(3);
        assert!(summary.contains("COMMON ISSUES DETECTED:"));
        assert!(summary.contains("- uncaught_runtime_error: 2 occurrence(s)"));
    }
}
