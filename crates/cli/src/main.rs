mod config_commands;
mod sandbox_commands;
mod snapshot_commands;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    clap::{Parser, Subcommand},
    firmbox_config::FirmboxConfig,
    firmbox_sandbox::{
        Docker, Error as SandboxError, ExistingPolicy, LaunchOptions, LifecycleManager,
        ProcessRunner,
    },
    tracing::{error, info},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(
    name = "firmbox",
    version,
    about = "Run firmware images in emulation sandboxes, with live snapshots and checkpoints"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file to load instead of the discovered one.
    #[arg(long, global = true, env = "FIRMBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Remove new sandboxes when they stop.
    #[arg(long = "rm", global = true, default_value_t = false)]
    auto_remove: bool,

    /// Bind-mount the host's /dev into new sandboxes.
    #[arg(long, global = true, default_value_t = false)]
    with_dev: bool,

    /// Network mode for new sandboxes (e.g. host, bridge).
    #[arg(long = "net", global = true, value_name = "MODE")]
    network_mode: Option<String>,

    /// What to do with a stopped sandbox: prompt, start, recreate, abort.
    #[arg(long, global = true, default_value = "prompt", value_name = "POLICY")]
    on_existing: ExistingPolicy,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Sandbox(sandbox_commands::SandboxCommand),
    /// Live snapshots through the emulator monitor.
    Snapshot {
        #[command(subcommand)]
        action: snapshot_commands::SnapshotAction,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

impl Cli {
    fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            auto_remove: self.auto_remove,
            with_dev: self.with_dev,
            network_mode: self.network_mode.clone(),
            existing: self.on_existing,
        }
    }
}

/// Build the manager from config. The framework checkout defaults to the
/// current directory, matching where the helper is usually run from.
fn lifecycle_manager(config: FirmboxConfig) -> anyhow::Result<LifecycleManager> {
    let framework_root = match config.runtime.framework_root.clone() {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    let docker = Docker::new(Arc::new(ProcessRunner), config.runtime.cli.clone());
    Ok(LifecycleManager::new(docker, config, framework_root))
}

fn load_config(explicit: Option<&Path>) -> anyhow::Result<FirmboxConfig> {
    firmbox_config::discover_and_load(explicit)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let launch = cli.launch_options();
    match cli.command {
        Commands::Config { action } => config_commands::handle_config(action, cli.config.as_deref()),
        Commands::Sandbox(command) => {
            let manager = lifecycle_manager(load_config(cli.config.as_deref())?)?;
            sandbox_commands::handle_sandbox(&manager, &launch, command).await
        },
        Commands::Snapshot { action } => {
            let manager = lifecycle_manager(load_config(cli.config.as_deref())?)?;
            snapshot_commands::handle_snapshot(&manager, action).await
        },
    }
}

/// Log a failed command and pick the process exit status.
fn report_failure(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<SandboxError>() {
        Some(SandboxError::Aborted) => {
            info!("aborted, nothing changed");
            0
        },
        Some(SandboxError::Timeout { log_tail, .. }) => {
            error!("{err:#}");
            if !log_tail.trim().is_empty() {
                eprintln!("--- last emulator log lines ---\n{}", log_tail.trim_end());
            }
            1
        },
        _ => {
            error!("{err:#}");
            1
        },
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "firmbox starting");

    if let Err(e) = run(cli).await {
        std::process::exit(report_failure(&e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_map_to_launch_options() {
        let cli = Cli::try_parse_from([
            "firmbox",
            "--rm",
            "--with-dev",
            "--net",
            "host",
            "--on-existing",
            "recreate",
            "emulate",
            "run",
            "router_fw.bin",
        ])
        .unwrap();
        assert_eq!(cli.launch_options(), LaunchOptions {
            auto_remove: true,
            with_dev: true,
            network_mode: Some("host".into()),
            existing: ExistingPolicy::Recreate,
        });
    }

    #[test]
    fn defaults_prompt_for_existing() {
        let cli = Cli::try_parse_from(["firmbox", "status", "router_fw.bin"]).unwrap();
        assert_eq!(cli.launch_options(), LaunchOptions::default());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn unknown_policy_is_rejected() {
        assert!(
            Cli::try_parse_from(["firmbox", "--on-existing", "maybe", "start", "fw.bin"]).is_err()
        );
    }

    #[test]
    fn aborted_exits_cleanly() {
        assert_eq!(report_failure(&anyhow::Error::from(SandboxError::Aborted)), 0);
        assert_eq!(
            report_failure(&anyhow::Error::from(SandboxError::SandboxNotFound(
                "fw.bin".into()
            ))),
            1
        );
    }

    #[test]
    fn configured_framework_root_wins() {
        let mut config = FirmboxConfig::default();
        config.runtime.framework_root = Some(PathBuf::from("/opt/FirmAE"));
        let manager = lifecycle_manager(config).unwrap();
        assert_eq!(manager.framework_root(), Path::new("/opt/FirmAE"));
    }
}
