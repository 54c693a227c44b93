//! Snapshot preparation.
//!
//! Live snapshots need a qcow2 disk. Preparation converts the raw image,
//! rewrites the instance launch script to boot from the qcow2 copy, restarts
//! the emulator and waits for its monitor socket.

use std::{fmt, time::Duration};

use {
    firmbox_config::{EmulationConfig, FirmboxConfig},
    tracing::{info, warn},
};

use crate::{
    Docker,
    error::{Error, Result},
    instance::{InstanceId, InstanceLayout},
    monitor::{MonitorClient, Readiness},
    step,
};

const ENSURE_QEMU_IMG: &str = "command -v qemu-img >/dev/null 2>&1 || (apt-get update >/dev/null 2>&1 && apt-get install -y qemu-utils >/dev/null 2>&1)";

/// MIPS targets attach the rootfs as an IDE drive.
const PATCH_MIPS: &str = r"s@-drive if=ide,format=raw,file=\${IMAGE}@-drive if=ide,format=qcow2,file=\${WORK_DIR}/image.qcow2@g";
/// ARM targets attach it through a drive with id `rootfs`.
const PATCH_ARM: &str = r"s@-drive if=none,file=\${IMAGE},format=raw,id=rootfs@-drive if=none,file=\${WORK_DIR}/image.qcow2,format=qcow2,id=rootfs@g";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepState {
    RawOnly,
    Converting,
    Patched,
    Relaunching,
    MonitorReady,
    Failed,
}

impl fmt::Display for PrepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RawOnly => "raw-only",
            Self::Converting => "converting",
            Self::Patched => "patched",
            Self::Relaunching => "relaunching",
            Self::MonitorReady => "monitor-ready",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What a successful preparation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepReport {
    pub iid: InstanceId,
    pub socket: String,
    /// False when `image.qcow2` already existed.
    pub converted: bool,
    /// False when the launch script already referenced the qcow2 image.
    pub patched: bool,
    pub probes: u32,
    /// Reply to `info snapshots` after the restart, when the probe succeeded.
    pub snapshots: Option<String>,
}

struct Preparation<'a> {
    docker: &'a Docker,
    config: &'a FirmboxConfig,
    sandbox: &'a str,
    layout: InstanceLayout,
    state: PrepState,
}

impl Preparation<'_> {
    fn enter(&mut self, next: PrepState) {
        info!(sandbox = self.sandbox, iid = %self.layout.iid(), from = %self.state, to = %next, "preparation");
        self.state = next;
    }

    async fn convert(&mut self) -> Result<bool> {
        let qcow2 = self.layout.qcow2_image();
        let exists = self
            .docker
            .exec(self.sandbox, ["test", "-f", qcow2.as_str()])
            .await?
            .success();
        if exists {
            info!(image = %qcow2, "qcow2 image present, skipping conversion");
            return Ok(false);
        }

        self.enter(PrepState::Converting);
        step::soft(
            "ensure qemu-img",
            self.docker
                .exec(self.sandbox, ["sh", "-c", ENSURE_QEMU_IMG])
                .await,
        );
        let raw = self.layout.raw_image();
        step::hard(
            "qemu-img convert",
            self.docker
                .exec(self.sandbox, [
                    "qemu-img",
                    "convert",
                    "-p",
                    "-O",
                    "qcow2",
                    raw.as_str(),
                    qcow2.as_str(),
                ])
                .await,
        )?;
        step::hard(
            "chmod qcow2 image",
            self.docker
                .exec(self.sandbox, ["chmod", "a+rw", qcow2.as_str()])
                .await,
        )?;
        Ok(true)
    }

    async fn patch(&mut self) -> Result<bool> {
        let script = self.layout.run_script();
        let already = self
            .docker
            .exec(self.sandbox, ["grep", "-qF", "image.qcow2", script.as_str()])
            .await?
            .success();
        let patched = if already {
            info!(script = %script, "launch script already boots from qcow2");
            false
        } else {
            step::soft(
                "patch launch script",
                self.docker
                    .exec(self.sandbox, [
                        "sed",
                        "-i",
                        "-e",
                        PATCH_MIPS,
                        "-e",
                        PATCH_ARM,
                        script.as_str(),
                    ])
                    .await,
            )
            .is_some()
        };
        self.enter(PrepState::Patched);
        Ok(patched)
    }

    async fn run(&mut self) -> Result<PrepReport> {
        let converted = self.convert().await?;
        let patched = self.patch().await?;

        self.enter(PrepState::Relaunching);
        kill_emulator(self.docker, self.sandbox).await;
        tokio::time::sleep(Duration::from_secs(self.config.timing.relaunch_pause_secs)).await;
        let log = self.layout.relaunch_log();
        relaunch(self.docker, &self.config.emulation, self.sandbox, &self.layout, &log).await?;

        let monitor = MonitorClient::new(
            self.docker.clone(),
            &self.config.emulation,
            self.sandbox,
            self.layout.iid(),
        );
        let emulation = &self.config.emulation;
        let interval = Duration::from_secs(emulation.probe_interval_secs);
        let probes = match monitor.wait_ready(emulation.readiness_probes, interval).await? {
            Readiness::Ready { probes } => probes,
            Readiness::TimedOut { probes } => {
                let log_tail = log_tail(self.docker, self.sandbox, &log, emulation.log_tail_lines).await;
                return Err(Error::Timeout {
                    what: format!("monitor socket {}", monitor.socket()),
                    waited: interval.saturating_mul(probes),
                    log_tail,
                });
            },
        };
        self.enter(PrepState::MonitorReady);

        let snapshots = match monitor.send(&["info snapshots"]).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!(error = %e, "info snapshots probe failed");
                None
            },
        };

        Ok(PrepReport {
            iid: self.layout.iid().clone(),
            socket: monitor.socket().to_string(),
            converted,
            patched,
            probes,
            snapshots,
        })
    }
}

/// Drive an instance to the monitor-ready state.
pub async fn prepare(
    docker: &Docker,
    config: &FirmboxConfig,
    sandbox: &str,
    iid: &InstanceId,
) -> Result<PrepReport> {
    let mut prep = Preparation {
        docker,
        config,
        sandbox,
        layout: InstanceLayout::new(&config.emulation.framework_dir, iid.clone()),
        state: PrepState::RawOnly,
    };
    match prep.run().await {
        Ok(report) => Ok(report),
        Err(e) => {
            prep.enter(PrepState::Failed);
            Err(e)
        },
    }
}

/// Kill every emulator process in the sandbox. Nothing running is fine.
pub(crate) async fn kill_emulator(docker: &Docker, sandbox: &str) {
    step::soft(
        "kill emulator",
        docker.exec(sandbox, ["pkill", "-f", "qemu-system"]).await,
    );
}

/// Start the instance's `run.sh` detached from the framework root with its
/// output in `log`.
pub(crate) async fn relaunch(
    docker: &Docker,
    emulation: &EmulationConfig,
    sandbox: &str,
    layout: &InstanceLayout,
    log: &str,
) -> Result<()> {
    let run_script = layout.relative_run_script();
    step::hard(
        "relaunch emulator",
        docker
            .spawn_logged(sandbox, &emulation.framework_dir, log, [run_script])
            .await,
    )?;
    info!(sandbox, iid = %layout.iid(), log, "emulator relaunched");
    Ok(())
}

async fn log_tail(docker: &Docker, sandbox: &str, log: &str, lines: u32) -> String {
    let count = lines.to_string();
    step::soft(
        "read relaunch log",
        docker
            .exec(sandbox, ["tail", "-n", count.as_str(), log])
            .await,
    )
    .map(|out| out.stdout)
    .unwrap_or_default()
}
