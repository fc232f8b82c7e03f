use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use geocopilot_core::{
    spawn_log_pump, ApiManifest, ConfigStore, EnvironmentMonitor, HeadlessHost, Preflight,
    ProcessRuntime, SafetyMode, SafetyPolicy, SandboxExecutor, SourceCatalog,
};
use geocopilot_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, redact_text,
    ObservabilityEvent, ProcessKind,
};
use geocopilot_types::{ExecutionRequest, ExecutionResult};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

const SUPPORTED_PROVIDER_IDS: [&str; 4] = ["openai", "anthropic", "gemini", "ollama"];

#[derive(Parser, Debug)]
#[command(name = "geocopilot")]
#[command(about = "Validate and run AI-generated geospatial scripts")]
struct Cli {
    /// Directory holding config.json and logs.
    #[arg(long, global = true, env = "GEOCOPILOT_STATE_DIR")]
    state_dir: Option<PathBuf>,
    /// Project config file; defaults to <state-dir>/config.json.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    provider: Option<String>,
    #[arg(long, global = true)]
    model: Option<String>,
    /// Runtime-only credential; never written to disk.
    #[arg(long, global = true)]
    api_key: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Screen and preflight a script without running it.
    Check {
        /// Script path, or `-` for stdin.
        script: String,
        #[arg(long, default_value_t = false)]
        relaxed: bool,
        /// Treat the interactive map handle as available.
        #[arg(long, default_value_t = false)]
        interactive: bool,
    },
    /// Run a script in the sandbox with an external interpreter.
    Run {
        /// Script path, or `-` for stdin.
        script: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(long)]
        workspace: Option<PathBuf>,
        #[arg(long)]
        interpreter: Option<String>,
        #[arg(long, default_value_t = false)]
        relaxed: bool,
        /// Print the execution result as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print the detected environment profile.
    Env,
    /// Print the effective configuration (`show`) or every layer (`layers`).
    Config {
        #[arg(default_value = "show")]
        view: String,
    },
}

#[derive(Debug, Default)]
struct ExecutorOverrides {
    timeout_ms: Option<u64>,
    workspace: Option<PathBuf>,
    interpreter: Option<String>,
    relaxed: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let state_dir = resolve_state_dir(cli.state_dir.clone());
    let (_log_guard, log_info) =
        init_process_logging(ProcessKind::Cli, &canonical_logs_dir_from_root(&state_dir), 14)?;
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Cli,
        ObservabilityEvent {
            status: Some("ok"),
            detail: Some("cli jsonl logging initialized"),
            ..ObservabilityEvent::new("logging.initialized", "cli.main")
        },
    );
    info!("cli logging initialized: {:?}", log_info);
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| state_dir.join("config.json"));

    match cli.command {
        Command::Check {
            script,
            relaxed,
            interactive,
        } => {
            let overrides = build_cli_overrides(
                cli.api_key,
                cli.provider,
                cli.model,
                ExecutorOverrides {
                    relaxed,
                    ..Default::default()
                },
            )?;
            let store = ConfigStore::new(&config_path, overrides).await?;
            let config = store.get().await;
            let script = read_script(&script)?;
            let manifest = load_manifest(config.executor.api_manifest_path.as_deref()).await;
            let mut profile = EnvironmentMonitor::new(Arc::new(HeadlessHost)).profile().await;
            profile.has_interactive_handle |= interactive;

            let mut blocked = false;
            if let Err(violation) = SafetyPolicy::for_mode(config.executor.safety_mode).screen(&script)
            {
                println!("blocked: {violation}");
                blocked = true;
            }
            let report = Preflight::new(&manifest).check(&script, &profile, None);
            if let Some(err) = &report.blocking {
                println!("blocked: {}", err.summary());
                blocked = true;
            }
            for finding in &report.warnings {
                println!("warning: {}", finding.render());
            }
            if !blocked && report.warnings.is_empty() {
                println!("ok");
            }
            Ok(if blocked {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Command::Run {
            script,
            timeout_ms,
            workspace,
            interpreter,
            relaxed,
            json,
        } => {
            let overrides = build_cli_overrides(
                cli.api_key,
                cli.provider,
                cli.model,
                ExecutorOverrides {
                    timeout_ms,
                    workspace,
                    interpreter,
                    relaxed,
                },
            )?;
            let store = ConfigStore::new(&config_path, overrides).await?;
            let result = run_script(&store, &read_script(&script)?, json).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_result(&result);
            }
            Ok(if result.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Env => {
            let profile = EnvironmentMonitor::new(Arc::new(HeadlessHost)).profile().await;
            println!("{}", serde_json::to_string_pretty(&profile)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Config { view } => {
            let overrides = build_cli_overrides(
                cli.api_key,
                cli.provider,
                cli.model,
                ExecutorOverrides::default(),
            )?;
            let store = ConfigStore::new(&config_path, overrides).await?;
            let mut value = match view.as_str() {
                "show" => store.get_effective_value().await,
                "layers" => store.get_layers_value().await,
                other => anyhow::bail!("unknown config view `{other}` (expected show or layers)"),
            };
            mask_api_keys(&mut value);
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_script(store: &ConfigStore, script: &str, quiet: bool) -> anyhow::Result<ExecutionResult> {
    let config = store.get().await;
    let manifest = load_manifest(config.executor.api_manifest_path.as_deref()).await;
    let runtime = Arc::new(ProcessRuntime::new(config.executor.interpreter.clone()));
    let executor = SandboxExecutor::from_config(&config.executor, SourceCatalog::new(), runtime)
        .with_manifest(Arc::new(manifest))
        .with_process(ProcessKind::Cli);
    let detection = EnvironmentMonitor::new(Arc::new(HeadlessHost)).detection().await;
    let request = ExecutionRequest::new(script, config.executor.resolved_workspace_root());

    let (log_tx, log_rx) = mpsc::unbounded_channel();
    let (coalesced_tx, mut coalesced_rx) = mpsc::unbounded_channel();
    let pump = spawn_log_pump(config.executor.coalesce_window(), log_rx, coalesced_tx);
    let printer = tokio::spawn(async move {
        while let Some(log) = coalesced_rx.recv().await {
            if quiet {
                continue;
            }
            for block in &log.blocks {
                eprintln!("{}", block.body);
            }
        }
    });

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let result = executor
        .execute_streaming(&request, &detection, log_tx, cancel)
        .await;
    pump.await.context("log pump")?;
    printer.await.context("log printer")?;
    Ok(result)
}

fn print_result(result: &ExecutionResult) {
    println!(
        "{} in {} ms (run {})",
        result.status.as_str(),
        result.duration_ms,
        result.run_id
    );
    if let Some(err) = &result.structured_error {
        println!("{}", err.summary());
    }
    for artifact in &result.produced_artifacts {
        println!("artifact: {}", artifact.display());
    }
}

async fn load_manifest(path: Option<&Path>) -> ApiManifest {
    let Some(path) = path else {
        return ApiManifest::builtin();
    };
    match ApiManifest::load(path).await {
        Ok(manifest) => manifest,
        Err(err) => {
            tracing::warn!(
                "failed to load api manifest {}: {err:#}; using built-in",
                path.display()
            );
            ApiManifest::builtin()
        }
    }
}

fn build_cli_overrides(
    api_key: Option<String>,
    provider: Option<String>,
    model: Option<String>,
    executor: ExecutorOverrides,
) -> anyhow::Result<Option<Value>> {
    let provider = normalize_and_validate_provider(provider)?;
    let mut root = serde_json::Map::new();

    if let Some(p) = &provider {
        root.insert("default_provider".to_string(), Value::String(p.clone()));
    }

    // api_key/model go to the selected provider, openai when none is given
    let target_provider = provider.as_deref().unwrap_or("openai");
    if api_key.is_some() || model.is_some() {
        let mut provider_config = serde_json::Map::new();
        if let Some(k) = api_key {
            provider_config.insert("api_key".to_string(), Value::String(k));
        }
        if let Some(m) = model {
            provider_config.insert("default_model".to_string(), Value::String(m));
        }
        let mut providers = serde_json::Map::new();
        providers.insert(target_provider.to_string(), Value::Object(provider_config));
        root.insert("providers".to_string(), Value::Object(providers));
    }

    let mut exec = serde_json::Map::new();
    if let Some(ms) = executor.timeout_ms {
        exec.insert("timeout_ms".to_string(), json!(ms));
    }
    if let Some(dir) = executor.workspace {
        exec.insert("workspace_root".to_string(), json!(dir));
    }
    if let Some(bin) = executor.interpreter {
        exec.insert("interpreter".to_string(), Value::String(bin));
    }
    if executor.relaxed {
        exec.insert("safety_mode".to_string(), json!(SafetyMode::Relaxed));
    }
    if !exec.is_empty() {
        root.insert("executor".to_string(), Value::Object(exec));
    }

    if root.is_empty() {
        return Ok(None);
    }
    Ok(Some(Value::Object(root)))
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        SUPPORTED_PROVIDER_IDS.join(", ")
    );
}

fn resolve_state_dir(flag: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = flag.filter(|d| !d.as_os_str().is_empty()) {
        return dir;
    }
    dirs::config_dir()
        .map(|dir| dir.join("geocopilot"))
        .unwrap_or_else(|| PathBuf::from(".geocopilot"))
}

fn read_script(input: &str) -> anyhow::Result<String> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }
    std::fs::read_to_string(input).with_context(|| format!("failed to read script `{input}`"))
}

fn mask_api_keys(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if key == "api_key" {
                    if let Some(raw) = child.as_str() {
                        *child = Value::String(redact_text(raw));
                    }
                } else {
                    mask_api_keys(child);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(mask_api_keys),
        _ => {}
    }
}
