//! Container runtime CLI wrapper.
//!
//! Thin typed layer over `docker` (or a compatible CLI). Each method builds one
//! argument vector; state is never cached between calls.

use std::{sync::Arc, time::Duration};

use tracing::debug;

use crate::{
    command::{CommandOutput, CommandRunner, CommandSpec},
    error::Result,
};

/// Runs `$2..` with stdout and stderr redirected to the file in `$1`.
const LOGGED_LAUNCH_SCRIPT: &str = r#"log=$1; shift; exec "$@" >"$log" 2>&1"#;

const IP_TEMPLATE: &str = "{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}";
const PS_TEMPLATE: &str = "{{.Names}} {{.Status}}";

/// One line of `ps --format "{{.Names}} {{.Status}}"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEntry {
    pub name: String,
    pub status: String,
}

impl ContainerEntry {
    pub fn is_paused(&self) -> bool {
        self.status.contains("Paused")
    }
}

/// Handle on the container runtime CLI.
#[derive(Clone)]
pub struct Docker {
    runner: Arc<dyn CommandRunner>,
    cli: String,
}

impl Docker {
    pub fn new(runner: Arc<dyn CommandRunner>, cli: impl Into<String>) -> Self {
        Self {
            runner,
            cli: cli.into(),
        }
    }

    /// Runner shared with host-side commands (`sudo ip route`).
    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub fn cli(&self) -> &str {
        &self.cli
    }

    fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.cli)
    }

    async fn output(&self, spec: CommandSpec) -> Result<CommandOutput> {
        self.runner.output(&spec).await
    }

    /// List sandboxes, oldest first. `all` includes stopped ones; paused
    /// sandboxes are dropped unless `include_paused` is set.
    pub async fn list(&self, all: bool, include_paused: bool) -> Result<Vec<ContainerEntry>> {
        let mut spec = self.command().arg("ps");
        if all {
            spec = spec.arg("-a");
        }
        let spec = spec.args(["--format", PS_TEMPLATE]);
        let out = self.output(spec).await?.into_result("list sandboxes")?;

        let mut entries: Vec<ContainerEntry> = out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| match line.split_once(' ') {
                Some((name, status)) => ContainerEntry {
                    name: name.to_string(),
                    status: status.to_string(),
                },
                None => ContainerEntry {
                    name: line.to_string(),
                    status: String::new(),
                },
            })
            .filter(|entry| include_paused || !entry.is_paused())
            .collect();
        entries.reverse();
        debug!(all, count = entries.len(), "listed sandboxes");
        Ok(entries)
    }

    /// Current IP address of a sandbox, read fresh each time.
    pub async fn container_ip(&self, name: &str) -> Result<Option<String>> {
        let spec = self.command().args(["inspect", "-f", IP_TEMPLATE, name]);
        let out = self.output(spec).await?.into_result("inspect sandbox")?;
        let ip = out.stdout.trim();
        Ok((!ip.is_empty()).then(|| ip.to_string()))
    }

    pub async fn image_exists(&self, image: &str) -> Result<bool> {
        let spec = self.command().args(["images", "-q", image]);
        let out = self.output(spec).await?;
        Ok(out.success() && !out.stdout.trim().is_empty())
    }

    pub async fn run(&self, args: Vec<String>) -> Result<CommandOutput> {
        self.output(self.command().arg("run").args(args)).await
    }

    pub async fn start(&self, name: &str) -> Result<CommandOutput> {
        self.output(self.command().args(["start", name])).await
    }

    pub async fn start_from_checkpoint(&self, name: &str, checkpoint: &str) -> Result<CommandOutput> {
        self.output(self.command().args(["start", "--checkpoint", checkpoint, name]))
            .await
    }

    pub async fn stop(&self, name: &str) -> Result<CommandOutput> {
        self.output(self.command().args(["stop", name])).await
    }

    pub async fn unpause(&self, name: &str) -> Result<CommandOutput> {
        self.output(self.command().args(["unpause", name])).await
    }

    pub async fn remove(&self, name: &str) -> Result<CommandOutput> {
        self.output(self.command().args(["rm", "-f", name])).await
    }

    /// `exec` with output captured.
    pub async fn exec<I, S>(&self, name: &str, argv: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output(self.command().args(["exec", name]).args(argv))
            .await
    }

    /// `exec -i` feeding `input` on stdin.
    pub async fn exec_with_input<I, S>(
        &self,
        name: &str,
        argv: I,
        input: String,
        timeout: Duration,
    ) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = self
            .command()
            .args(["exec", "-i", name])
            .args(argv)
            .stdin(input)
            .timeout(timeout);
        self.output(spec).await
    }

    /// `exec -d`, optionally from `workdir`. Returns once the process is spawned.
    pub async fn exec_detached<I, S>(
        &self,
        name: &str,
        workdir: Option<&str>,
        argv: I,
    ) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = self.command().args(["exec", "-d"]);
        if let Some(dir) = workdir {
            spec = spec.args(["-w", dir]);
        }
        self.output(spec.arg(name).args(argv)).await
    }

    /// Detached `exec` of `argv` from `workdir` with its output written to
    /// `log` inside the sandbox. Paths travel as arguments, not shell text.
    pub async fn spawn_logged<I, S>(
        &self,
        name: &str,
        workdir: &str,
        log: &str,
        argv: I,
    ) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let script = ["sh", "-c", LOGGED_LAUNCH_SCRIPT, "sh", log]
            .into_iter()
            .map(String::from)
            .chain(argv.into_iter().map(Into::into));
        self.exec_detached(name, Some(workdir), script).await
    }

    /// `exec -it` attached to the caller's terminal.
    pub async fn exec_interactive<I, S>(
        &self,
        name: &str,
        workdir: Option<&str>,
        argv: I,
    ) -> Result<i32>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = self.command().args(["exec", "-it"]);
        if let Some(dir) = workdir {
            spec = spec.args(["-w", dir]);
        }
        let spec = spec.arg(name).args(argv);
        self.runner.interactive(&spec).await
    }

    /// Whether the daemon runs with experimental features. `None` when the
    /// query itself fails.
    pub async fn experimental_enabled(&self) -> Result<Option<bool>> {
        let spec = self
            .command()
            .args(["info", "--format", "{{.ExperimentalBuild}}"]);
        let out = self.output(spec).await?;
        if !out.success() {
            return Ok(None);
        }
        let value = out.stdout.trim().to_ascii_lowercase();
        Ok(Some(value == "true" || value == "1"))
    }

    pub async fn checkpoint_create(
        &self,
        name: &str,
        checkpoint: &str,
        checkpoint_dir: Option<&str>,
        leave_running: bool,
    ) -> Result<CommandOutput> {
        let mut spec = self.command().args(["checkpoint", "create"]);
        if let Some(dir) = checkpoint_dir {
            spec = spec.args(["--checkpoint-dir", dir]);
        }
        if leave_running {
            spec = spec.arg("--leave-running");
        }
        self.output(spec.args([name, checkpoint])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedRunner, fail, ok};

    #[tokio::test]
    async fn list_drops_paused_and_reverses() {
        let runner = ScriptedRunner::new();
        runner.on(
            "ps --format",
            ok("docker2_b Up 3 minutes (Paused)\ndocker1_a Up 5 minutes\n\ndocker0_c Up 1 hour\n"),
        );
        let docker = runner.docker();

        let names: Vec<String> = docker
            .list(false, false)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["docker0_c", "docker1_a"]);

        let with_paused = docker.list(false, true).await.unwrap();
        assert_eq!(with_paused.len(), 3);
        assert!(with_paused[2].is_paused());
    }

    #[tokio::test]
    async fn list_all_passes_dash_a() {
        let runner = ScriptedRunner::new();
        runner.docker().list(true, false).await.unwrap();
        assert_eq!(runner.calls(), [
            "docker ps -a --format {{.Names}} {{.Status}}"
        ]);
    }

    #[tokio::test]
    async fn list_failure_is_transport_error() {
        let runner = ScriptedRunner::new();
        runner.on("ps", fail(1, "daemon not running"));
        let err = runner.docker().list(false, false).await.unwrap_err();
        assert_eq!(err.to_string(), "list sandboxes failed: daemon not running");
    }

    #[tokio::test]
    async fn container_ip_is_trimmed_and_optional() {
        let runner = ScriptedRunner::new();
        runner.on("inspect -f", ok("172.17.0.2\n"));
        assert_eq!(
            runner.docker().container_ip("docker0_x").await.unwrap(),
            Some("172.17.0.2".into())
        );

        let empty = ScriptedRunner::new();
        empty.on("inspect -f", ok("\n"));
        assert_eq!(empty.docker().container_ip("docker0_x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn image_exists_requires_an_id() {
        let runner = ScriptedRunner::new();
        runner.on("images -q", ok(""));
        assert!(!runner.docker().image_exists("fcore").await.unwrap());

        let present = ScriptedRunner::new();
        present.on("images -q", ok("3f2a9c\n"));
        assert!(present.docker().image_exists("fcore").await.unwrap());
    }

    #[tokio::test]
    async fn experimental_states() {
        let on = ScriptedRunner::new();
        on.on("info --format", ok("true\n"));
        assert_eq!(on.docker().experimental_enabled().await.unwrap(), Some(true));

        let off = ScriptedRunner::new();
        off.on("info --format", ok("false\n"));
        assert_eq!(off.docker().experimental_enabled().await.unwrap(), Some(false));

        let broken = ScriptedRunner::new();
        broken.on("info --format", fail(1, "cannot connect"));
        assert_eq!(broken.docker().experimental_enabled().await.unwrap(), None);
    }

    #[tokio::test]
    async fn exec_variants_build_expected_argv() {
        let runner = ScriptedRunner::new();
        let docker = runner.docker();
        docker
            .exec_detached("docker0_x", Some("/work/FirmAE"), ["./run.sh"])
            .await
            .unwrap();
        docker
            .checkpoint_create("docker0_x", "warm1", Some("/tmp/cp"), true)
            .await
            .unwrap();
        docker
            .exec_interactive("docker0_x", None, ["bash"])
            .await
            .unwrap();

        assert_eq!(runner.calls(), [
            "docker exec -d -w /work/FirmAE docker0_x ./run.sh",
            "docker checkpoint create --checkpoint-dir /tmp/cp --leave-running docker0_x warm1",
        ]);
        assert_eq!(runner.interactive_calls(), ["docker exec -it docker0_x bash"]);
    }

    #[tokio::test]
    async fn spawn_logged_passes_log_and_argv_positionally() {
        let runner = ScriptedRunner::new();
        runner
            .docker()
            .spawn_logged("docker0_x", "/work/FirmAE", "/tmp/out.log", [
                "./run.sh", "-c", "auto",
            ])
            .await
            .unwrap();
        let spec = &runner.specs()[0];
        assert_eq!(&spec.args[..6], [
            "exec", "-d", "-w", "/work/FirmAE", "docker0_x", "sh"
        ]);
        assert_eq!(spec.args[8..], ["sh", "/tmp/out.log", "./run.sh", "-c", "auto"]);
    }
}
