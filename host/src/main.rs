use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use pupu_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use pupu_sidecar::{
    validate_workspace_root, ConsumerHub, HostConfig, IpcGateway, Launcher, OllamaAutoStarter,
    SidecarSupervisor, StreamBridge,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "pupu-host")]
#[command(about = "Supervises the local Miso sidecar and bridges its chat streams")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LaunchArgs {
    #[arg(long, env = "PUPU_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long)]
    app_path: Option<PathBuf>,
    #[arg(long)]
    resources_path: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    packaged: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the supervisors and serve JSON-lines IPC on stdin/stdout.
    Serve {
        #[command(flatten)]
        launch: LaunchArgs,
        #[arg(long)]
        logs_dir: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        no_ollama: bool,
    },
    /// Print the Miso entrypoint that would be launched.
    Entrypoint {
        #[command(flatten)]
        launch: LaunchArgs,
    },
    /// Validate a workspace root and print the result as JSON.
    ValidateWorkspace { path: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            launch,
            logs_dir,
            no_ollama,
        } => {
            let config = load_config(&launch)?;
            let logs_dir = resolve_logs_dir(logs_dir.or_else(|| config.logs_dir.clone()));
            let (log_guard, log_info) =
                init_process_logging(ProcessKind::Host, &logs_dir, config.log_retention_days())?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Host,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "host.main",
                    status: Some("ok"),
                    detail: Some("host jsonl logging initialized"),
                    ..Default::default()
                },
            );
            info!("host logging initialized: {:?}", log_info);
            let result = serve(config, !no_ollama).await;
            if let Err(err) = &result {
                tracing::error!("host failed: {:#}", err);
            }
            drop(log_guard);
            // a pending blocking stdin read would otherwise hold runtime shutdown
            std::process::exit(if result.is_ok() { 0 } else { 1 });
        }
        Command::Entrypoint { launch } => {
            let config = load_config(&launch)?;
            let launcher = Launcher::new(config.launch);
            let entrypoint = tokio::task::spawn_blocking(move || launcher.resolve_entrypoint())
                .await
                .context("entrypoint resolution failed")?;
            let output = match entrypoint {
                Some(entry) => serde_json::json!({
                    "kind": format!("{:?}", entry.kind),
                    "command": entry.command.to_string_lossy(),
                    "args": entry
                        .args
                        .iter()
                        .map(|a| a.to_string_lossy().into_owned())
                        .collect::<Vec<_>>(),
                    "cwd": entry.cwd.display().to_string(),
                }),
                None => serde_json::Value::Null,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::ValidateWorkspace { path } => {
            let validation = validate_workspace_root(&path, false);
            println!("{}", serde_json::to_string_pretty(&validation)?);
        }
    }

    Ok(())
}

fn load_config(args: &LaunchArgs) -> anyhow::Result<HostConfig> {
    let mut config = HostConfig::load(args.config.as_deref()).with_context(|| {
        format!(
            "failed to load config {}",
            args.config
                .as_deref()
                .map(Path::display)
                .map(|d| d.to_string())
                .unwrap_or_default()
        )
    })?;
    config.apply_env(|key| std::env::var(key).ok());
    if let Some(app_path) = &args.app_path {
        config.launch.app_path = app_path.clone();
    }
    if let Some(resources_path) = &args.resources_path {
        config.launch.resources_path = resources_path.clone();
    }
    if args.packaged {
        config.launch.packaged = true;
    }
    Ok(config)
}

fn resolve_logs_dir(flag: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = flag {
        return dir;
    }
    let root = dirs::data_dir()
        .map(|d| d.join("pupu"))
        .unwrap_or_else(|| PathBuf::from(".pupu"));
    canonical_logs_dir_from_root(&root)
}

async fn serve(config: HostConfig, auto_start_ollama: bool) -> anyhow::Result<()> {
    let hub = Arc::new(ConsumerHub::new());
    let kill_grace = config.supervisor.kill_grace();
    let supervisor = SidecarSupervisor::new(
        config.supervisor,
        Arc::new(Launcher::new(config.launch)),
        hub.clone(),
    );
    let bridge = Arc::new(StreamBridge::new(supervisor.clone()));
    let ollama = Arc::new(OllamaAutoStarter::new(config.ollama));
    let gateway = Arc::new(IpcGateway::new(
        hub,
        bridge,
        ollama.clone(),
        env!("CARGO_PKG_VERSION"),
    ));

    if auto_start_ollama {
        let starter = ollama.clone();
        tokio::spawn(async move {
            let status = starter.start().await;
            info!("ollama auto-start finished: {}", status.as_str());
        });
    }
    let booting = supervisor.clone();
    tokio::spawn(async move { booting.start().await });

    let result = tokio::select! {
        served = gateway.clone().serve(tokio::io::stdin(), tokio::io::stdout()) => {
            served.map_err(anyhow::Error::from)
        }
        signal = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            signal.map_err(anyhow::Error::from)
        }
    };

    supervisor.shutdown();
    ollama.stop();
    if !supervisor
        .wait_for_exit(kill_grace + Duration::from_secs(1))
        .await
    {
        tracing::warn!("miso did not exit before the host quit");
    }
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Host,
        ObservabilityEvent {
            event: "host.shutdown",
            component: "host.main",
            status: Some(if result.is_ok() { "ok" } else { "failed" }),
            ..Default::default()
        },
    );
    result
}
