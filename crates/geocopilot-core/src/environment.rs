use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use geocopilot_types::{EnvironmentProfile, Severity};
use serde_json::Value;
use tokio::sync::RwLock;

/// The desktop application's interactive surface (map canvas, message bar).
pub trait InteractiveHandle: Send + Sync {
    fn active_source_id(&self) -> Option<String>;
    fn refresh_canvas(&self);
    fn push_message(&self, severity: Severity, text: &str);
}

/// Named geoprocessing algorithms provided by the host.
pub trait AlgorithmRegistry: Send + Sync {
    fn algorithm_ids(&self) -> Vec<String>;
    fn run(&self, algorithm_id: &str, parameters: &Value) -> anyhow::Result<Value>;

    fn has_algorithm(&self, algorithm_id: &str) -> bool {
        self.algorithm_ids().iter().any(|id| id == algorithm_id)
    }
}

/// Read-only view of host state used to build an [`EnvironmentProfile`].
pub trait HostProbe: Send + Sync {
    fn interactive_handle(&self) -> anyhow::Result<Option<Arc<dyn InteractiveHandle>>>;
    fn task_manager_available(&self) -> anyhow::Result<bool>;
    fn processing_registry(&self) -> anyhow::Result<Option<Arc<dyn AlgorithmRegistry>>>;
}

/// Host objects backing the detected capabilities.
#[derive(Clone, Default)]
pub struct HostBindings {
    pub interactive: Option<Arc<dyn InteractiveHandle>>,
    pub algorithms: Option<Arc<dyn AlgorithmRegistry>>,
}

#[derive(Clone)]
pub struct Detection {
    pub profile: EnvironmentProfile,
    pub bindings: HostBindings,
}

fn probe_quietly<T>(what: &str, f: impl FnOnce() -> anyhow::Result<T>) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            tracing::warn!("environment probe `{what}` failed: {err:#}");
            None
        }
        Err(_) => {
            tracing::warn!("environment probe `{what}` panicked");
            None
        }
    }
}

pub fn detect_with_bindings(probe: &dyn HostProbe) -> Detection {
    let interactive = probe_quietly("interactive_handle", || probe.interactive_handle()).flatten();
    let background =
        probe_quietly("task_manager", || probe.task_manager_available()).unwrap_or(false);
    let algorithms =
        probe_quietly("processing_registry", || probe.processing_registry()).flatten();

    Detection {
        profile: EnvironmentProfile {
            has_interactive_handle: interactive.is_some(),
            has_background_task_framework: background,
            has_processing_registry: algorithms.is_some(),
            detected_at: Utc::now(),
        },
        bindings: HostBindings {
            interactive,
            algorithms,
        },
    }
}

/// Never fails. A probe that errors or panics reports its capability absent.
pub fn detect(probe: &dyn HostProbe) -> EnvironmentProfile {
    detect_with_bindings(probe).profile
}

/// Holds the process-wide profile; recomputed only on host context changes.
#[derive(Clone)]
pub struct EnvironmentMonitor {
    probe: Arc<dyn HostProbe>,
    current: Arc<RwLock<Detection>>,
}

impl EnvironmentMonitor {
    pub fn new(probe: Arc<dyn HostProbe>) -> Self {
        let detection = detect_with_bindings(probe.as_ref());
        tracing::info!("environment detected: {}", detection.profile.summary());
        Self {
            probe,
            current: Arc::new(RwLock::new(detection)),
        }
    }

    pub async fn profile(&self) -> EnvironmentProfile {
        self.current.read().await.profile.clone()
    }

    pub async fn detection(&self) -> Detection {
        self.current.read().await.clone()
    }

    pub async fn host_context_changed(&self) -> EnvironmentProfile {
        let detection = detect_with_bindings(self.probe.as_ref());
        tracing::info!("environment re-detected: {}", detection.profile.summary());
        let profile = detection.profile.clone();
        *self.current.write().await = detection;
        profile
    }
}

/// No interactive surface, no task manager, no processing registry.
pub struct HeadlessHost;

impl HostProbe for HeadlessHost {
    fn interactive_handle(&self) -> anyhow::Result<Option<Arc<dyn InteractiveHandle>>> {
        Ok(None)
    }

    fn task_manager_available(&self) -> anyhow::Result<bool> {
        Ok(false)
    }

    fn processing_registry(&self) -> anyhow::Result<Option<Arc<dyn AlgorithmRegistry>>> {
        Ok(None)
    }
}

/// Bindings supplied up front by an embedding host.
#[derive(Clone, Default)]
pub struct StaticHost {
    pub bindings: HostBindings,
    pub background_tasks: bool,
}

impl StaticHost {
    pub fn with_interactive(mut self, handle: Arc<dyn InteractiveHandle>) -> Self {
        self.bindings.interactive = Some(handle);
        self
    }

    pub fn with_algorithms(mut self, registry: Arc<dyn AlgorithmRegistry>) -> Self {
        self.bindings.algorithms = Some(registry);
        self
    }

    pub fn with_background_tasks(mut self, enabled: bool) -> Self {
        self.background_tasks = enabled;
        self
    }
}

impl HostProbe for StaticHost {
    fn interactive_handle(&self) -> anyhow::Result<Option<Arc<dyn InteractiveHandle>>> {
        Ok(self.bindings.interactive.clone())
    }

    fn task_manager_available(&self) -> anyhow::Result<bool> {
        Ok(self.background_tasks)
    }

    fn processing_registry(&self) -> anyhow::Result<Option<Arc<dyn AlgorithmRegistry>>> {
        Ok(self.bindings.algorithms.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyHost {
        attached: AtomicBool,
    }

    struct Canvas;

    impl InteractiveHandle for Canvas {
        fn active_source_id(&self) -> Option<String> {
            None
        }
        fn refresh_canvas(&self) {}
        fn push_message(&self, _severity: Severity, _text: &str) {}
    }

    impl HostProbe for FlakyHost {
        fn interactive_handle(&self) -> anyhow::Result<Option<Arc<dyn InteractiveHandle>>> {
            if self.attached.load(Ordering::SeqCst) {
                Ok(Some(Arc::new(Canvas)))
            } else {
                anyhow::bail!("no main window")
            }
        }

        fn task_manager_available(&self) -> anyhow::Result<bool> {
            panic!("task manager probe exploded")
        }

        fn processing_registry(&self) -> anyhow::Result<Option<Arc<dyn AlgorithmRegistry>>> {
            Ok(None)
        }
    }

    #[test]
    fn headless_host_reports_nothing() {
        let profile = detect(&HeadlessHost);
        assert!(!profile.has_interactive_handle);
        assert!(!profile.has_background_task_framework);
        assert!(!profile.has_processing_registry);
    }

    #[test]
    fn failing_probes_degrade_to_false() {
        let host = FlakyHost {
            attached: AtomicBool::new(false),
        };
        let profile = detect(&host);
        assert!(!profile.has_interactive_handle);
        assert!(!profile.has_background_task_framework);
    }

    #[tokio::test]
    async fn monitor_recomputes_only_on_context_change() {
        let host = Arc::new(FlakyHost {
            attached: AtomicBool::new(false),
        });
        let monitor = EnvironmentMonitor::new(host.clone());
        assert!(!monitor.profile().await.has_interactive_handle);

        host.attached.store(true, Ordering::SeqCst);
        assert!(!monitor.profile().await.has_interactive_handle);

        let profile = monitor.host_context_changed().await;
        assert!(profile.has_interactive_handle);
        assert!(monitor.detection().await.bindings.interactive.is_some());
    }

    #[test]
    fn static_host_exposes_its_bindings() {
        let host = StaticHost::default()
            .with_interactive(Arc::new(Canvas))
            .with_background_tasks(true);
        let profile = detect(&host);
        assert!(profile.has_interactive_handle);
        assert!(profile.has_background_task_framework);
        assert!(!profile.has_processing_registry);
    }
}
