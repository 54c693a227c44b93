//! Runtime-level checkpoint and restore of a whole sandbox.

use std::time::Duration;

use tracing::{info, warn};

use crate::{
    LifecycleManager,
    error::{Error, Result},
    locator::LocatedSandbox,
    step,
};

pub const DEFAULT_CHECKPOINT: &str = "warm1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointOptions {
    pub name: String,
    /// Keep the sandbox running after the checkpoint is written.
    pub leave_running: bool,
    pub checkpoint_dir: Option<String>,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self {
            name: DEFAULT_CHECKPOINT.into(),
            leave_running: true,
            checkpoint_dir: None,
        }
    }
}

/// Checkpoint `located`, starting it first when stopped. Aborts before
/// `checkpoint create` when the daemon lacks experimental features or the
/// sandbox has a hugetlbfs mount.
pub async fn checkpoint(
    manager: &LifecycleManager,
    located: &LocatedSandbox,
    opts: &CheckpointOptions,
) -> Result<()> {
    let docker = manager.docker();
    match docker.experimental_enabled().await? {
        Some(true) => {},
        Some(false) => {
            return Err(Error::Precondition(
                "daemon experimental features are disabled; set \"experimental\": true in /etc/docker/daemon.json and restart the daemon".into(),
            ));
        },
        None => warn!("could not query daemon experimental flag, continuing"),
    }

    let settle = Duration::from_secs(manager.config().timing.start_settle_secs);
    manager.ensure_running(located, settle).await?;

    let mounts = docker
        .exec(&located.name, ["grep", "-w", "hugetlbfs", "/proc/mounts"])
        .await?;
    if mounts.success() && !mounts.stdout.trim().is_empty() {
        return Err(Error::Precondition(format!(
            "hugetlbfs is mounted in {}; recreate it with a tmpfs at /dev/hugepages and checkpoint again",
            located.name
        )));
    }

    step::hard(
        "create checkpoint",
        docker
            .checkpoint_create(
                &located.name,
                &opts.name,
                opts.checkpoint_dir.as_deref(),
                opts.leave_running,
            )
            .await,
    )?;
    info!(sandbox = %located.name, checkpoint = %opts.name, leave_running = opts.leave_running, "checkpoint created");
    Ok(())
}

/// Stop the sandbox, start it from `name`, and re-wire its network.
pub async fn restore(manager: &LifecycleManager, sandbox: &str, name: &str) -> Result<()> {
    let docker = manager.docker();
    step::soft("stop before restore", docker.stop(sandbox).await);
    step::hard(
        "restore checkpoint",
        docker.start_from_checkpoint(sandbox, name).await,
    )?;
    info!(sandbox, checkpoint = name, "sandbox restored from checkpoint");

    tokio::time::sleep(Duration::from_secs(
        manager.config().timing.restore_settle_secs,
    ))
    .await;
    manager.wire_network(sandbox).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use firmbox_config::FirmboxConfig;

    use super::*;
    use crate::{
        locator::SandboxState,
        testing::{ScriptedRunner, fail, ok},
    };

    fn manager(runner: &Arc<ScriptedRunner>) -> LifecycleManager {
        LifecycleManager::new(runner.docker(), FirmboxConfig::default(), "/opt/FirmAE")
    }

    fn running() -> LocatedSandbox {
        LocatedSandbox {
            name: "docker0_router_fw_bin".into(),
            state: SandboxState::Running,
        }
    }

    #[tokio::test]
    async fn experimental_disabled_blocks_checkpoint() {
        let runner = ScriptedRunner::new();
        runner.on("info --format", ok("false\n"));

        let err = checkpoint(&manager(&runner), &running(), &CheckpointOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert_eq!(runner.count("checkpoint create"), 0);
        assert_eq!(runner.count("/proc/mounts"), 0);
    }

    #[tokio::test]
    async fn hugetlbfs_blocks_checkpoint() {
        let runner = ScriptedRunner::new();
        runner.on("info --format", ok("true\n"));
        runner.on("/proc/mounts", ok("hugetlbfs /dev/hugepages hugetlbfs rw,relatime 0 0\n"));

        let err = checkpoint(&manager(&runner), &running(), &CheckpointOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("hugetlbfs"));
        assert_eq!(runner.count("checkpoint create"), 0);
    }

    #[tokio::test]
    async fn inconclusive_experimental_query_does_not_block() {
        let runner = ScriptedRunner::new();
        runner.on("info --format", fail(1, "permission denied"));
        runner.on("/proc/mounts", fail(1, ""));

        checkpoint(&manager(&runner), &running(), &CheckpointOptions::default())
            .await
            .unwrap();
        assert_eq!(runner.calls().last().unwrap(), &format!(
            "docker checkpoint create --leave-running docker0_router_fw_bin {DEFAULT_CHECKPOINT}"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_sandbox_is_started_first() {
        let runner = ScriptedRunner::new();
        runner.on("info --format", ok("1\n"));
        runner.on("/proc/mounts", fail(1, ""));
        let located = LocatedSandbox {
            state: SandboxState::Stopped,
            ..running()
        };
        let opts = CheckpointOptions {
            name: "boot".into(),
            leave_running: false,
            checkpoint_dir: Some("/var/cp".into()),
        };

        let start = tokio::time::Instant::now();
        checkpoint(&manager(&runner), &located, &opts).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert!(
            runner.position("docker start docker0_router_fw_bin").unwrap()
                < runner.position("checkpoint create").unwrap()
        );
        assert_eq!(
            runner.calls().last().unwrap(),
            "docker checkpoint create --checkpoint-dir /var/cp docker0_router_fw_bin boot"
        );
    }

    #[tokio::test]
    async fn checkpoint_create_failure_is_reported() {
        let runner = ScriptedRunner::new();
        runner.on("info --format", ok("true\n"));
        runner.on("/proc/mounts", fail(1, ""));
        runner.on("checkpoint create", fail(1, "criu failed"));
        let err = checkpoint(&manager(&runner), &running(), &CheckpointOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "create checkpoint failed: criu failed");
    }

    #[tokio::test(start_paused = true)]
    async fn restore_stops_starts_and_rewires() {
        let runner = ScriptedRunner::new();
        runner.on("docker stop", fail(1, "already stopped"));
        runner.on("inspect -f", ok("172.17.0.5\n"));

        let start = tokio::time::Instant::now();
        restore(&manager(&runner), "docker0_router_fw_bin", "warm1").await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(2));

        let calls = runner.calls();
        assert_eq!(calls[0], "docker stop docker0_router_fw_bin");
        assert_eq!(calls[1], "docker start --checkpoint warm1 docker0_router_fw_bin");
        assert_eq!(runner.count("inspect -f"), 1);
    }

    #[tokio::test]
    async fn restore_start_failure_is_fatal() {
        let runner = ScriptedRunner::new();
        runner.on("start --checkpoint", fail(1, "checkpoint warm1 does not exist"));
        let err = restore(&manager(&runner), "docker0_router_fw_bin", "warm1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
        assert_eq!(runner.count("inspect"), 0);
    }
}
