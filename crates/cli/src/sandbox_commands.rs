use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use {
    anyhow::{Context, Result},
    clap::Subcommand,
    firmbox_sandbox::{
        EmulationMode, Error as SandboxError, FirmwareRef, LaunchOptions, LifecycleManager,
        LocatedSandbox, SandboxState,
        checkpoint::{self, CheckpointOptions, DEFAULT_CHECKPOINT},
        instance::{self, InstanceId},
        reset,
    },
    serde::Serialize,
    tracing::{debug, info, warn},
};

use crate::snapshot_commands;

#[derive(Subcommand)]
pub enum SandboxCommand {
    /// Create or reuse the sandbox for a firmware image and run the emulation pipeline.
    Emulate {
        /// check, analyze, debug or run.
        mode: EmulationMode,
        /// Vendor hint handed to the pipeline.
        #[arg(long, default_value = "auto")]
        brand: String,
        firmware: PathBuf,
    },
    /// Run a shell command in every running sandbox.
    Exec { command: String },
    /// Checkpoint a firmware's sandbox with the container runtime.
    Checkpoint {
        firmware: PathBuf,
        #[arg(default_value = DEFAULT_CHECKPOINT)]
        name: String,
        /// Directory to store the checkpoint in.
        #[arg(long)]
        checkpoint_dir: Option<String>,
        /// Stop the sandbox once the checkpoint is written.
        #[arg(long)]
        exit: bool,
    },
    /// Restart a firmware's sandbox from a checkpoint.
    Restore {
        firmware: PathBuf,
        #[arg(default_value = DEFAULT_CHECKPOINT)]
        name: String,
    },
    /// Restart the emulated device; pass `clean` to roll the disk image back first.
    Reset {
        firmware: PathBuf,
        clean: Option<String>,
    },
    /// Convert the instance to qcow2 and relaunch it with a monitor socket.
    Prepare { firmware: PathBuf },
    /// Start a firmware's stopped or paused sandbox and re-wire its network.
    Start { firmware: PathBuf },
    /// Stop a firmware's sandbox.
    Stop { firmware: PathBuf },
    /// Force-remove a firmware's sandbox.
    Remove { firmware: PathBuf },
    /// Show a firmware's sandbox, its state and address.
    Status {
        firmware: PathBuf,
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
}

pub async fn handle_sandbox(
    manager: &LifecycleManager,
    launch: &LaunchOptions,
    command: SandboxCommand,
) -> Result<()> {
    match command {
        SandboxCommand::Emulate {
            mode,
            brand,
            firmware,
        } => emulate(manager, launch, mode, &brand, &firmware).await,
        SandboxCommand::Exec { command } => exec(manager, &command).await,
        SandboxCommand::Checkpoint {
            firmware,
            name,
            checkpoint_dir,
            exit,
        } => {
            let opts = CheckpointOptions {
                name,
                leave_running: !exit,
                checkpoint_dir,
            };
            create_checkpoint(manager, &firmware, &opts).await
        },
        SandboxCommand::Restore { firmware, name } => restore(manager, &firmware, &name).await,
        SandboxCommand::Reset { firmware, clean } => {
            reset_device(manager, &firmware, reset::parse_clean_flag(clean.as_deref())).await
        },
        SandboxCommand::Prepare { firmware } => snapshot_commands::prepare(manager, &firmware).await,
        SandboxCommand::Start { firmware } => start(manager, &firmware).await,
        SandboxCommand::Stop { firmware } => {
            let located = manager.require(&FirmwareRef::new(&firmware)?).await?;
            manager.stop(&located.name).await?;
            Ok(())
        },
        SandboxCommand::Remove { firmware } => {
            let located = manager.require(&FirmwareRef::new(&firmware)?).await?;
            manager.remove(&located.name).await?;
            Ok(())
        },
        SandboxCommand::Status { firmware, json } => status(manager, &firmware, json).await,
    }
}

async fn emulate(
    manager: &LifecycleManager,
    launch: &LaunchOptions,
    mode: EmulationMode,
    brand: &str,
    firmware: &Path,
) -> Result<()> {
    // The artifact's directory is bind-mounted, so it needs an absolute path.
    let path = std::fs::canonicalize(firmware)
        .map_err(|_| SandboxError::FirmwareNotFound(firmware.to_path_buf()))?;
    let firmware = FirmwareRef::existing(&path)?;

    let scratch = manager.framework_root().join("scratch");
    tokio::fs::create_dir_all(&scratch)
        .await
        .with_context(|| format!("failed to create {}", scratch.display()))?;

    let outcome = manager.emulate(mode, brand, &firmware, launch).await?;
    info!(
        sandbox = %outcome.sandbox,
        action = ?outcome.action,
        stopped = outcome.stopped,
        "emulate finished"
    );
    println!("{}", outcome.sandbox);
    Ok(())
}

async fn exec(manager: &LifecycleManager, command: &str) -> Result<()> {
    let reports = manager.exec_all(command).await?;
    if reports.is_empty() {
        println!("No running sandboxes.");
        return Ok(());
    }
    for report in &reports {
        if !report.output.success() {
            warn!(
                sandbox = %report.sandbox,
                exit_code = report.output.exit_code,
                "command failed"
            );
        }
        println!("[{}]", report.sandbox);
        let text = report.text().trim_end();
        if !text.is_empty() {
            println!("{text}");
        }
    }
    Ok(())
}

async fn start(manager: &LifecycleManager, firmware: &Path) -> Result<()> {
    let located = manager.require(&FirmwareRef::new(firmware)?).await?;
    if located.state == SandboxState::Running {
        println!("{} is already running.", located.name);
        return Ok(());
    }
    let settle = Duration::from_secs(manager.config().timing.start_settle_secs);
    manager.ensure_running(&located, settle).await?;
    println!("{} is running.", located.name);
    Ok(())
}

async fn create_checkpoint(
    manager: &LifecycleManager,
    firmware: &Path,
    opts: &CheckpointOptions,
) -> Result<()> {
    let located = manager.require(&FirmwareRef::new(firmware)?).await?;
    checkpoint::checkpoint(manager, &located, opts).await?;
    println!("Checkpoint '{}' created for {}.", opts.name, located.name);
    Ok(())
}

async fn restore(manager: &LifecycleManager, firmware: &Path, name: &str) -> Result<()> {
    let located = manager.require(&FirmwareRef::new(firmware)?).await?;
    checkpoint::restore(manager, &located.name, name).await?;
    println!("{} restored from checkpoint '{name}'.", located.name);
    Ok(())
}

async fn reset_device(manager: &LifecycleManager, firmware: &Path, clean: bool) -> Result<()> {
    let report = reset::reset(manager, &FirmwareRef::new(firmware)?, clean).await?;
    if clean && !report.restored_baseline {
        warn!(sandbox = %report.sandbox, "disk image was not restored, device restarted on its current image");
    }
    println!(
        "Instance {} in {} restarted; log at {}",
        report.iid, report.sandbox, report.log
    );
    Ok(())
}

#[derive(Debug, Serialize)]
struct StatusReport {
    firmware: String,
    #[serde(flatten)]
    sandbox: LocatedSandbox,
    ip: Option<String>,
    instance: Option<InstanceId>,
}

impl StatusReport {
    fn render(&self) -> String {
        let mut out = format!(
            "firmware  {}\nsandbox   {}\nstate     {}\n",
            self.firmware, self.sandbox.name, self.sandbox.state
        );
        if let Some(ref ip) = self.ip {
            out.push_str(&format!("ip        {ip}\n"));
        }
        if let Some(ref iid) = self.instance {
            out.push_str(&format!("instance  {iid}\n"));
        }
        out
    }
}

/// The address is looked up on a live sandbox; the instance only on a
/// running one, since a paused sandbox cannot exec.
async fn status(manager: &LifecycleManager, firmware: &Path, json: bool) -> Result<()> {
    let firmware = FirmwareRef::new(firmware)?;
    let located = manager.require(&firmware).await?;
    let docker = manager.docker();

    let ip = match located.state {
        SandboxState::Running | SandboxState::Paused => docker.container_ip(&located.name).await?,
        SandboxState::Stopped => None,
    };
    let instance = if located.state == SandboxState::Running {
        match instance::resolve(
            docker,
            &manager.config().emulation,
            &located.name,
            firmware.base_name(),
        )
        .await
        {
            Ok(iid) => Some(iid),
            Err(e) if e.is_not_found() => {
                debug!(error = %e, "no instance for status");
                None
            },
            Err(e) => return Err(e.into()),
        }
    } else {
        None
    };

    let report = StatusReport {
        firmware: firmware.file_name().to_string(),
        sandbox: located,
        ip,
        instance,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(state: SandboxState) -> StatusReport {
        StatusReport {
            firmware: "router_fw.bin".into(),
            sandbox: LocatedSandbox {
                name: "docker0_router_fw_bin".into(),
                state,
            },
            ip: None,
            instance: None,
        }
    }

    #[test]
    fn stopped_status_omits_address() {
        assert_eq!(
            report(SandboxState::Stopped).render(),
            "firmware  router_fw.bin\nsandbox   docker0_router_fw_bin\nstate     stopped\n"
        );
    }

    #[test]
    fn paused_status_shows_state_and_address() {
        let report = StatusReport {
            ip: Some("172.17.0.2".into()),
            ..report(SandboxState::Paused)
        };
        assert_eq!(
            report.render(),
            "firmware  router_fw.bin\nsandbox   docker0_router_fw_bin\nstate     paused\nip        172.17.0.2\n"
        );
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["state"], "paused");
        assert!(value["instance"].is_null());
    }

    #[test]
    fn running_status_json() {
        let report = StatusReport {
            ip: Some("172.17.0.2".into()),
            instance: Some(InstanceId::new("42").unwrap()),
            ..report(SandboxState::Running)
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "firmware": "router_fw.bin",
                "name": "docker0_router_fw_bin",
                "state": "running",
                "ip": "172.17.0.2",
                "instance": "42",
            })
        );
        assert!(report.render().ends_with("ip        172.17.0.2\ninstance  42\n"));
    }
}
