//! Sandbox lifecycle manager.
//!
//! Creates one sandbox per firmware artifact, launches the emulation pipeline
//! inside it, and makes the emulated device reachable from the host.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use {
    async_trait::async_trait,
    firmbox_config::FirmboxConfig,
    serde::Serialize,
    tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    tracing::{debug, error, info, warn},
};

use crate::{
    Docker,
    command::{CommandOutput, CommandSpec},
    error::{Context, Error, Result},
    firmware::FirmwareRef,
    locator::{self, LocatedSandbox, SandboxState},
    step,
};

const INIT_DATABASE: &str = "service postgresql start && sleep 2 && (sudo -u postgres createdb firmware || true) && sudo -u postgres psql -d firmware -c 'CREATE EXTENSION IF NOT EXISTS pgcrypto;'";

const ENSURE_SOCAT: &str = "apt-get update >/dev/null 2>&1 && apt-get install -y socat >/dev/null 2>&1";

const EXISTING_PROMPT: &str =
    "Sandbox exists but is stopped. (s)tart, (r)emove and recreate, or (q)uit? [s]: ";

/// Pipeline mode passed to `run.sh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulationMode {
    Check,
    Analyze,
    Debug,
    Run,
}

impl EmulationMode {
    pub fn flag(self) -> &'static str {
        match self {
            Self::Check => "-c",
            Self::Analyze => "-a",
            Self::Debug => "-d",
            Self::Run => "-r",
        }
    }

    /// One-shot modes stop their sandbox once the launch flow completes.
    pub fn keeps_running(self) -> bool {
        matches!(self, Self::Debug | Self::Run)
    }
}

impl fmt::Display for EmulationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Check => "check",
            Self::Analyze => "analyze",
            Self::Debug => "debug",
            Self::Run => "run",
        };
        f.write_str(s)
    }
}

impl FromStr for EmulationMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "check" | "c" => Ok(Self::Check),
            "analyze" | "a" => Ok(Self::Analyze),
            "debug" | "d" => Ok(Self::Debug),
            "run" | "r" => Ok(Self::Run),
            other => Err(format!("unknown emulation mode: {other}")),
        }
    }
}

/// What to do when the firmware's sandbox exists but is stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExistingPolicy {
    #[default]
    Prompt,
    Start,
    Recreate,
    Abort,
}

impl ExistingPolicy {
    /// Interpret an answer to the existing-sandbox prompt. Empty means start.
    pub fn from_answer(answer: &str) -> Self {
        match answer.trim().to_ascii_lowercase().as_str() {
            "" | "s" | "start" => Self::Start,
            "r" | "recreate" => Self::Recreate,
            _ => Self::Abort,
        }
    }
}

impl FromStr for ExistingPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "prompt" => Ok(Self::Prompt),
            "start" => Ok(Self::Start),
            "recreate" => Ok(Self::Recreate),
            "abort" => Ok(Self::Abort),
            other => Err(format!(
                "unknown policy '{other}' (expected prompt, start, recreate or abort)"
            )),
        }
    }
}

/// Options for creating a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Pass `--rm` so the runtime deletes the sandbox once stopped.
    pub auto_remove: bool,
    /// Bind the host `/dev` into the sandbox.
    pub with_dev: bool,
    pub network_mode: Option<String>,
    pub existing: ExistingPolicy,
}

/// Asks the operator a question and returns the raw answer.
#[async_trait]
pub trait Prompter: Send + Sync {
    async fn ask(&self, question: &str) -> Result<String>;
}

/// [`Prompter`] on the process's stderr and stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinPrompter;

#[async_trait]
impl Prompter for StdinPrompter {
    async fn ask(&self, question: &str) -> Result<String> {
        let mut stderr = tokio::io::stderr();
        stderr.write_all(question.as_bytes()).await?;
        stderr.flush().await?;

        let mut line = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .context("read answer from stdin")?;
        Ok(line)
    }
}

/// Result of [`LifecycleManager::wire_network`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkReport {
    pub ip: String,
    pub route_installed: bool,
    /// Listen ports whose relay was started by this call.
    pub started: Vec<u16>,
    /// Listen ports whose relay was already running.
    pub existing: Vec<u16>,
}

/// How [`LifecycleManager::emulate`] obtained its sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulateAction {
    Created,
    /// Existing running sandbox; no launch was performed.
    Reused,
    /// Existing paused sandbox unpaused; no launch was performed.
    Resumed,
    /// Existing stopped sandbox started again.
    Restarted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulateOutcome {
    pub sandbox: String,
    pub action: EmulateAction,
    /// The sandbox was stopped after a one-shot launch.
    pub stopped: bool,
}

/// Output of one sandbox in [`LifecycleManager::exec_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecReport {
    pub sandbox: String,
    pub output: CommandOutput,
}

impl ExecReport {
    /// Stdout on success, stderr otherwise.
    pub fn text(&self) -> &str {
        if self.output.success() {
            &self.output.stdout
        } else {
            &self.output.stderr
        }
    }
}

pub struct LifecycleManager {
    docker: Docker,
    config: FirmboxConfig,
    framework_root: PathBuf,
    prompter: Arc<dyn Prompter>,
}

impl LifecycleManager {
    pub fn new(docker: Docker, config: FirmboxConfig, framework_root: impl Into<PathBuf>) -> Self {
        Self {
            docker,
            config,
            framework_root: framework_root.into(),
            prompter: Arc::new(StdinPrompter),
        }
    }

    #[must_use]
    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = prompter;
        self
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    pub fn config(&self) -> &FirmboxConfig {
        &self.config
    }

    pub fn framework_root(&self) -> &Path {
        &self.framework_root
    }

    fn secs(secs: u64) -> Duration {
        Duration::from_secs(secs)
    }

    /// Locate the sandbox owning `firmware` or fail with `SandboxNotFound`.
    pub async fn require(&self, firmware: &FirmwareRef) -> Result<LocatedSandbox> {
        locator::locate(&self.docker, firmware)
            .await?
            .ok_or_else(|| Error::SandboxNotFound(firmware.file_name().to_string()))
    }

    /// Full emulate flow: reuse or create the sandbox, launch the pipeline,
    /// and stop the sandbox again for one-shot modes.
    pub async fn emulate(
        &self,
        mode: EmulationMode,
        brand: &str,
        firmware: &FirmwareRef,
        opts: &LaunchOptions,
    ) -> Result<EmulateOutcome> {
        let existing = locator::locate(&self.docker, firmware).await?;
        let (sandbox, action) = match existing {
            Some(located) if located.state != SandboxState::Stopped => {
                let action = if located.state == SandboxState::Paused {
                    self.unpause(&located.name).await?;
                    EmulateAction::Resumed
                } else {
                    info!(sandbox = %located.name, "sandbox already running");
                    EmulateAction::Reused
                };
                self.wire_network(&located.name).await;
                if mode == EmulationMode::Debug {
                    self.attach_shell(&located.name).await?;
                }
                (located.name, action)
            },
            Some(located) => match self.resolve_policy(opts.existing, &located.name).await? {
                ExistingPolicy::Start => {
                    let settle = Self::secs(self.config.timing.start_settle_secs);
                    self.ensure_running(&located, settle).await?;
                    if mode == EmulationMode::Debug {
                        self.attach_shell(&located.name).await?;
                    }
                    (located.name, EmulateAction::Restarted)
                },
                ExistingPolicy::Recreate => {
                    info!(sandbox = %located.name, "removing stopped sandbox before recreating");
                    self.remove(&located.name).await?;
                    let name = self.create_and_launch(mode, brand, firmware, opts).await?;
                    (name, EmulateAction::Created)
                },
                ExistingPolicy::Abort | ExistingPolicy::Prompt => return Err(Error::Aborted),
            },
            None => {
                let name = self.create_and_launch(mode, brand, firmware, opts).await?;
                (name, EmulateAction::Created)
            },
        };

        let stopped = !mode.keeps_running();
        if stopped {
            step::soft("stop one-shot sandbox", self.docker.stop(&sandbox).await);
        }
        Ok(EmulateOutcome {
            sandbox,
            action,
            stopped,
        })
    }

    async fn resolve_policy(&self, policy: ExistingPolicy, sandbox: &str) -> Result<ExistingPolicy> {
        if policy != ExistingPolicy::Prompt {
            return Ok(policy);
        }
        info!(sandbox, "found stopped sandbox");
        let answer = self.prompter.ask(EXISTING_PROMPT).await?;
        Ok(ExistingPolicy::from_answer(&answer))
    }

    async fn create_and_launch(
        &self,
        mode: EmulationMode,
        brand: &str,
        firmware: &FirmwareRef,
        opts: &LaunchOptions,
    ) -> Result<String> {
        let index = locator::sandbox_count(&self.docker).await?;
        let name = firmware.sandbox_name(index);
        info!(sandbox = %name, firmware = firmware.file_name(), "creating sandbox");
        self.create(&name, firmware, opts).await?;
        self.launch(&name, mode, brand, firmware).await?;
        Ok(name)
    }

    /// Arguments following `docker run`.
    pub fn run_args(&self, name: &str, firmware: &FirmwareRef, opts: &LaunchOptions) -> Vec<String> {
        let emulation = &self.config.emulation;
        let mut args = vec!["-dit".to_string()];
        if opts.auto_remove {
            args.push("--rm".into());
        }
        if let Some(ref mode) = opts.network_mode {
            args.extend(["--network".to_string(), mode.clone()]);
        }
        args.extend([
            "-v".to_string(),
            format!(
                "{}:{}",
                self.framework_root.display(),
                emulation.framework_dir
            ),
            "-v".to_string(),
            format!(
                "{}:{}",
                firmware.host_dir().display(),
                emulation.firmware_dir
            ),
        ]);
        if opts.with_dev {
            args.extend(["-v".to_string(), "/dev:/dev".to_string()]);
        }
        args.extend([
            "--mount".to_string(),
            "type=tmpfs,destination=/dev/hugepages".to_string(),
            "--security-opt".to_string(),
            "seccomp=unconfined".to_string(),
            "--privileged=true".to_string(),
            "--name".to_string(),
            name.to_string(),
            self.config.runtime.image.clone(),
        ]);
        args
    }

    /// Create and start a sandbox, then initialize its analysis database.
    pub async fn create(&self, name: &str, firmware: &FirmwareRef, opts: &LaunchOptions) -> Result<()> {
        let image = &self.config.runtime.image;
        if !self.docker.image_exists(image).await? {
            return Err(Error::Precondition(format!(
                "runtime image '{image}' not found; build it first"
            )));
        }

        let args = self.run_args(name, firmware, opts);
        debug!(sandbox = name, ?args, "docker run");
        let out = step::hard("create sandbox", self.docker.run(args).await)?;
        info!(sandbox = name, id = out.stdout.trim(), "sandbox created");

        tokio::time::sleep(Self::secs(self.config.timing.start_settle_secs)).await;

        let running = self.docker.list(false, true).await?;
        if !running.iter().any(|e| e.name == name) {
            return Err(Error::message(format!(
                "sandbox {name} is not running after start"
            )));
        }

        step::soft(
            "initialize analysis database",
            self.docker.exec(name, ["bash", "-c", INIT_DATABASE]).await,
        );
        Ok(())
    }

    /// Run the emulation pipeline for `firmware` in `name`.
    pub async fn launch(
        &self,
        name: &str,
        mode: EmulationMode,
        brand: &str,
        firmware: &FirmwareRef,
    ) -> Result<()> {
        let emulation = &self.config.emulation;
        let timing = &self.config.timing;
        let target = format!("{}/{}", emulation.firmware_dir, firmware.file_name());
        let argv = ["./run.sh", mode.flag(), brand, target.as_str()];

        if mode == EmulationMode::Debug {
            info!(sandbox = name, "waiting for firmware to start");
            tokio::time::sleep(Self::secs(timing.interactive_warmup_secs)).await;
            self.wire_network(name).await;
            let code = self
                .docker
                .exec_interactive(name, Some(emulation.framework_dir.as_str()), argv)
                .await?;
            if code != 0 {
                warn!(sandbox = name, exit_code = code, "interactive session ended with failure");
            }
            return Ok(());
        }

        let log = format!(
            "{}/scratch/{}.log",
            emulation.framework_dir,
            firmware.file_name()
        );
        step::hard(
            "launch emulation",
            self.docker
                .spawn_logged(name, &emulation.framework_dir, &log, argv)
                .await,
        )?;
        info!(sandbox = name, %mode, log = %log, "emulation launched in background");
        tokio::time::sleep(Self::secs(timing.background_warmup_secs)).await;
        self.wire_network(name).await;
        Ok(())
    }

    /// Bring `located` back to running. A paused sandbox is unpaused. A
    /// stopped one is started, given `settle` to boot, and re-wired, since
    /// its address and relays do not survive the stop.
    pub async fn ensure_running(&self, located: &LocatedSandbox, settle: Duration) -> Result<()> {
        match located.state {
            SandboxState::Running => {},
            SandboxState::Paused => self.unpause(&located.name).await?,
            SandboxState::Stopped => {
                info!(sandbox = %located.name, "starting stopped sandbox");
                self.start(&located.name).await?;
                tokio::time::sleep(settle).await;
                self.wire_network(&located.name).await;
            },
        }
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        step::hard("start sandbox", self.docker.start(name).await)?;
        info!(sandbox = name, "sandbox started");
        Ok(())
    }

    pub async fn unpause(&self, name: &str) -> Result<()> {
        step::hard("unpause sandbox", self.docker.unpause(name).await)?;
        info!(sandbox = name, "sandbox unpaused");
        Ok(())
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        step::hard("stop sandbox", self.docker.stop(name).await)?;
        info!(sandbox = name, "sandbox stopped");
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        step::hard("remove sandbox", self.docker.remove(name).await)?;
        info!(sandbox = name, "sandbox removed");
        Ok(())
    }

    /// Open an interactive shell in the sandbox.
    pub async fn attach_shell(&self, name: &str) -> Result<i32> {
        info!(sandbox = name, "attaching shell");
        self.docker.exec_interactive(name, None, ["bash"]).await
    }

    /// Run `command` through `bash -c` in every running sandbox, one at a time.
    pub async fn exec_all(&self, command: &str) -> Result<Vec<ExecReport>> {
        let sandboxes = self.docker.list(false, false).await?;
        if sandboxes.is_empty() {
            info!("no running sandboxes");
        }
        let mut reports = Vec::with_capacity(sandboxes.len());
        for entry in sandboxes {
            let output = self.docker.exec(&entry.name, ["bash", "-c", command]).await?;
            reports.push(ExecReport {
                sandbox: entry.name,
                output,
            });
        }
        Ok(reports)
    }

    fn host_command(&self, args: &[&str]) -> CommandSpec {
        if self.config.network.use_sudo {
            CommandSpec::new("sudo").arg("ip").args(args.iter().copied())
        } else {
            CommandSpec::new("ip").args(args.iter().copied())
        }
    }

    /// Make the emulated device reachable: host route via the sandbox IP and
    /// one relay per configured forward. Every step is best effort; `None`
    /// means the sandbox IP could not be read.
    pub async fn wire_network(&self, name: &str) -> Option<NetworkReport> {
        let ip = match self.docker.container_ip(name).await {
            Ok(Some(ip)) => ip,
            Ok(None) => {
                error!(sandbox = name, "sandbox has no IP address, skipping network setup");
                return None;
            },
            Err(e) => {
                error!(sandbox = name, error = %e, "could not read sandbox IP, skipping network setup");
                return None;
            },
        };
        info!(sandbox = name, ip = %ip, "sandbox address");

        let network = &self.config.network;
        let guest = &self.config.emulation.guest_address;
        let mut report = NetworkReport {
            ip: ip.clone(),
            ..NetworkReport::default()
        };

        if network.host_route {
            let host_route = format!("{guest}/32");
            let runner = self.docker.runner();
            step::soft(
                "delete stale host route",
                runner
                    .output(&self.host_command(&["route", "del", host_route.as_str()]))
                    .await,
            );
            let add = runner
                .output(&self.host_command(&[
                    "route",
                    "add",
                    host_route.as_str(),
                    "via",
                    ip.as_str(),
                ]))
                .await;
            match add {
                Ok(out) if out.success() => {
                    info!(route = %host_route, via = %ip, "host route installed");
                    report.route_installed = true;
                },
                Ok(out) => warn!(route = %host_route, stderr = out.stderr.trim(), "failed to add host route"),
                Err(e) => warn!(route = %host_route, error = %e, "failed to add host route"),
            }
        }

        self.ensure_socat(name).await;

        for forward in &network.forwards {
            let pattern = format!("socat TCP-LISTEN:{},", forward.listen);
            let running = matches!(
                self.docker.exec(name, ["pgrep", "-f", pattern.as_str()]).await,
                Ok(ref out) if out.success()
            );
            if running {
                debug!(sandbox = name, service = %forward.label, port = forward.listen, "relay already running");
                report.existing.push(forward.listen);
                continue;
            }

            let listen = format!("TCP-LISTEN:{},fork,reuseaddr", forward.listen);
            let target = format!("TCP:{guest}:{}", forward.target);
            let started = step::soft(
                "start port relay",
                self.docker
                    .exec_detached(name, None, ["socat", listen.as_str(), target.as_str()])
                    .await,
            );
            if started.is_some() {
                debug!(sandbox = name, service = %forward.label, listen = forward.listen, target = forward.target, "relay started");
                report.started.push(forward.listen);
            }
        }

        self.log_access_summary(name, &ip);
        Some(report)
    }

    async fn ensure_socat(&self, name: &str) {
        let present = matches!(
            self.docker.exec(name, ["which", "socat"]).await,
            Ok(ref out) if out.success()
        );
        if !present {
            info!(sandbox = name, "installing socat in sandbox");
            step::soft(
                "install socat",
                self.docker.exec(name, ["bash", "-c", ENSURE_SOCAT]).await,
            );
        }
    }

    fn log_access_summary(&self, name: &str, ip: &str) {
        let guest = &self.config.emulation.guest_address;
        info!(guest = %guest, "direct access (with host route): http://{guest}, telnet {guest}");
        for forward in &self.config.network.forwards {
            info!(
                service = %forward.label,
                "{ip}:{} forwards to {guest}:{}",
                forward.listen,
                forward.target
            );
        }
        info!("shell access: {} exec -it {name} bash", self.docker.cli());
    }
}
