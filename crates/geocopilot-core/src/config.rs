use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    /// Runtime-only secret. Stripped before anything is written to disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Name of the environment variable holding the credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

impl ProviderConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Some(key.clone());
        }
        let var = self.api_key_env.as_ref()?;
        std::env::var(var).ok().filter(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SafetyMode {
    #[default]
    Strict,
    Relaxed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryScope {
    #[default]
    PerRequest,
    PerConversation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub scope: RetryScope,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            scope: RetryScope::PerRequest,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub timeout_ms: u64,
    pub coalesce_window_ms: u64,
    pub safety_mode: SafetyMode,
    pub auto_debug: bool,
    pub interpreter: String,
    pub workspace_root: Option<PathBuf>,
    pub api_manifest_path: Option<PathBuf>,
    pub history_limit: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            coalesce_window_ms: 300,
            safety_mode: SafetyMode::Strict,
            auto_debug: false,
            interpreter: "python3".to_string(),
            workspace_root: None,
            api_manifest_path: None,
            history_limit: 50,
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    pub fn resolved_workspace_root(&self) -> PathBuf {
        if let Some(root) = &self.workspace_root {
            return root.clone();
        }
        dirs::data_dir()
            .map(|dir| dir.join("geocopilot").join("workspace"))
            .unwrap_or_else(|| PathBuf::from(".geocopilot/workspace"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl AppConfig {
    /// Configured default when present, otherwise the first provider by id.
    pub fn active_provider(&self) -> Option<(String, ProviderConfig)> {
        if let Some(id) = self.default_provider.as_deref() {
            if let Some(cfg) = self.providers.get(id) {
                return Some((id.to_string(), cfg.clone()));
            }
        }
        let mut ids = self.providers.keys().collect::<Vec<_>>();
        ids.sort();
        let id = ids.first()?;
        self.providers
            .get(id.as_str())
            .map(|cfg| (id.to_string(), cfg.clone()))
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    runtime: Value,
    cli: Value,
}

#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    global_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let global_path = resolve_global_config_path().await?;
        Self::with_paths(path, global_path, cli_overrides).await
    }

    pub async fn with_paths(
        project_path: impl AsRef<Path>,
        global_path: impl AsRef<Path>,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let project_path = project_path.as_ref().to_path_buf();
        let global_path = global_path.as_ref().to_path_buf();
        if let Some(parent) = project_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut global = read_json_file(&global_path).await?;
        let mut project = read_json_file(&project_path).await?;
        scrub_persisted_secrets(&mut global, &global_path).await?;
        scrub_persisted_secrets(&mut project, &project_path).await?;

        let layers = ConfigLayers {
            global,
            project,
            env: env_layer(),
            runtime: empty_object(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };

        Ok(Self {
            project_path,
            global_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> AppConfig {
        let merged = self.get_effective_value().await;
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("invalid merged config, using defaults: {err}");
                AppConfig::default()
            }
        }
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "global": layers.global,
            "project": layers.project,
            "env": layers.env,
            "runtime": layers.runtime,
            "cli": layers.cli
        })
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        self.save_project().await?;
        Ok(self.get_effective_value().await)
    }

    pub async fn patch_global(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.global, &patch);
        }
        self.save_global().await?;
        Ok(self.get_effective_value().await)
    }

    /// In-memory overrides, e.g. switching provider mid-session.
    pub async fn patch_runtime(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        Ok(self.get_effective_value().await)
    }

    pub async fn select_provider(&self, provider_id: &str) -> anyhow::Result<AppConfig> {
        let provider_id = provider_id.trim();
        if provider_id.is_empty() {
            anyhow::bail!("provider id must not be empty");
        }
        self.patch_runtime(json!({ "default_provider": provider_id }))
            .await?;
        Ok(self.get().await)
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.project.clone();
        write_json_file(&self.project_path, &snapshot).await
    }

    async fn save_global(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.global.clone();
        write_json_file(&self.global_path, &snapshot).await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut to_write = value.clone();
    strip_persisted_secrets(&mut to_write);
    let raw = serde_json::to_string_pretty(&to_write)?;
    fs::write(path, raw).await?;
    Ok(())
}

fn strip_persisted_secrets(value: &mut Value) {
    let Some(providers) = value
        .as_object_mut()
        .and_then(|root| root.get_mut("providers"))
        .and_then(|v| v.as_object_mut())
    else {
        return;
    };
    for provider_cfg in providers.values_mut() {
        if let Value::Object(cfg) = provider_cfg {
            cfg.remove("api_key");
            cfg.remove("apiKey");
        }
    }
}

async fn scrub_persisted_secrets(value: &mut Value, path: &Path) -> anyhow::Result<()> {
    let before = value.clone();
    strip_persisted_secrets(value);
    if *value != before {
        tracing::warn!("removed stored credentials from {}", path.display());
        write_json_file(path, value).await?;
    }
    Ok(())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|err| {
        tracing::warn!("ignoring unreadable config {}: {err}", path.display());
        empty_object()
    }))
}

async fn resolve_global_config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("GEOCOPILOT_GLOBAL_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    if let Some(config_dir) = dirs::config_dir() {
        return Ok(config_dir.join("geocopilot").join("config.json"));
    }
    Ok(PathBuf::from(".geocopilot/global_config.json"))
}

fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let mut root = empty_object();

    if let Some(provider) = var("GEOCOPILOT_PROVIDER") {
        deep_merge(&mut root, &json!({ "default_provider": provider.trim() }));
    }
    if let Some(attempts) = var("GEOCOPILOT_MAX_ATTEMPTS").and_then(|v| v.trim().parse::<u32>().ok())
    {
        deep_merge(&mut root, &json!({ "retry": { "max_attempts": attempts } }));
    }
    if let Some(scope) = var("GEOCOPILOT_RETRY_SCOPE") {
        let scope = match scope.trim().to_ascii_lowercase().as_str() {
            "conversation" | "per_conversation" => Some("per_conversation"),
            "request" | "per_request" => Some("per_request"),
            _ => None,
        };
        if let Some(scope) = scope {
            deep_merge(&mut root, &json!({ "retry": { "scope": scope } }));
        }
    }
    if let Some(ms) = var("GEOCOPILOT_TIMEOUT_MS").and_then(|v| v.trim().parse::<u64>().ok()) {
        deep_merge(&mut root, &json!({ "executor": { "timeout_ms": ms } }));
    }
    if let Some(ms) = var("GEOCOPILOT_COALESCE_MS").and_then(|v| v.trim().parse::<u64>().ok()) {
        deep_merge(&mut root, &json!({ "executor": { "coalesce_window_ms": ms } }));
    }
    if let Some(dir) = var("GEOCOPILOT_WORKSPACE") {
        deep_merge(&mut root, &json!({ "executor": { "workspace_root": dir } }));
    }
    if let Some(interpreter) = var("GEOCOPILOT_INTERPRETER") {
        deep_merge(&mut root, &json!({ "executor": { "interpreter": interpreter } }));
    }
    if let Some(relaxed) = var("GEOCOPILOT_RELAXED_SAFETY").and_then(|v| parse_bool_like(&v)) {
        let mode = if relaxed { "relaxed" } else { "strict" };
        deep_merge(&mut root, &json!({ "executor": { "safety_mode": mode } }));
    }
    if let Some(auto) = var("GEOCOPILOT_AUTO_DEBUG").and_then(|v| parse_bool_like(&v)) {
        deep_merge(&mut root, &json!({ "executor": { "auto_debug": auto } }));
    }

    let keyed_providers = [
        ("openai", "OPENAI_API_KEY", "https://api.openai.com/v1", "gpt-4o"),
        (
            "anthropic",
            "ANTHROPIC_API_KEY",
            "https://api.anthropic.com/v1",
            "claude-3-sonnet-20240229",
        ),
        (
            "gemini",
            "GEMINI_API_KEY",
            "https://generativelanguage.googleapis.com/v1beta",
            "gemini-1.5-flash",
        ),
    ];
    for (provider, key_env, url, model) in keyed_providers {
        if var(key_env).is_some() {
            deep_merge(
                &mut root,
                &json!({
                    "providers": {
                        provider: {
                            "api_key_env": key_env,
                            "url": url,
                            "default_model": model
                        }
                    }
                }),
            );
        }
    }
    if let Some(url) = var("OLLAMA_URL") {
        deep_merge(
            &mut root,
            &json!({
                "providers": {
                    "ollama": {
                        "url": url,
                        "default_model": "llama3.1:8b"
                    }
                }
            }),
        );
    }

    root
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
