//! QEMU human monitor (HMP) client.
//!
//! The monitor socket lives inside the sandbox, so every batch is piped through
//! `docker exec -i <sandbox> socat -t <secs> - UNIX-CONNECT:<socket>`. One
//! connection per batch; replies are returned as plain text.
//!
//! After the batch is written, socat keeps reading until the emulator closes
//! the connection or `monitor_timeout_secs` pass. socat's own half-close wait
//! is 0.5s by default, which truncates the reply of a slow `savevm`.

use std::time::Duration;

use {firmbox_config::EmulationConfig, tracing::debug};

use crate::{
    Docker,
    error::{Error, Result},
    instance::InstanceId,
    step,
};

const MAX_SNAPSHOT_NAME_LEN: usize = 128;

/// Extra time the `exec` gets beyond socat's own drain timeout, so socat
/// exits on its own with whatever reply it has read.
const EXEC_GRACE: Duration = Duration::from_secs(5);

/// Outcome of a bounded readiness poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Socket appeared on probe `probes` (1-based).
    Ready { probes: u32 },
    TimedOut { probes: u32 },
}

/// Per-batch client for one instance's monitor socket.
#[derive(Clone)]
pub struct MonitorClient {
    docker: Docker,
    sandbox: String,
    socket: String,
    /// How long socat waits for the reply after the batch is written.
    drain: Duration,
}

impl MonitorClient {
    pub fn new(docker: Docker, emulation: &EmulationConfig, sandbox: &str, iid: &InstanceId) -> Self {
        Self {
            docker,
            sandbox: sandbox.to_string(),
            socket: socket_path(emulation, iid),
            drain: Duration::from_secs(emulation.monitor_timeout_secs),
        }
    }

    pub fn sandbox(&self) -> &str {
        &self.sandbox
    }

    pub fn socket(&self) -> &str {
        &self.socket
    }

    /// Send `commands` as one newline-terminated batch and return the reply.
    pub async fn send<S: AsRef<str>>(&self, commands: &[S]) -> Result<String> {
        let mut payload = commands
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join("\n");
        payload.push('\n');
        debug!(sandbox = %self.sandbox, socket = %self.socket, batch = %payload.trim_end(), "monitor batch");

        let drain = self.drain.as_secs().to_string();
        let connect = format!("UNIX-CONNECT:{}", self.socket);
        let out = step::hard(
            "monitor command",
            self.docker
                .exec_with_input(
                    &self.sandbox,
                    ["socat", "-t", drain.as_str(), "-", connect.as_str()],
                    payload,
                    self.drain + EXEC_GRACE,
                )
                .await,
        )?;
        Ok(clean_reply(&out.stdout))
    }

    /// Whether the socket exists inside the sandbox.
    pub async fn socket_ready(&self) -> Result<bool> {
        let out = self
            .docker
            .exec(&self.sandbox, ["test", "-S", self.socket.as_str()])
            .await?;
        Ok(out.success())
    }

    /// Fail with [`Error::MonitorNotReady`] unless the socket exists.
    pub async fn ensure_ready(&self) -> Result<()> {
        if self.socket_ready().await? {
            Ok(())
        } else {
            Err(Error::MonitorNotReady {
                sandbox: self.sandbox.clone(),
                socket: self.socket.clone(),
            })
        }
    }

    /// Probe up to `probes` times, `interval` apart. No sleep follows the last
    /// probe.
    pub async fn wait_ready(&self, probes: u32, interval: Duration) -> Result<Readiness> {
        for attempt in 1..=probes {
            if self.socket_ready().await? {
                debug!(socket = %self.socket, probes = attempt, "monitor socket ready");
                return Ok(Readiness::Ready { probes: attempt });
            }
            if attempt < probes {
                tokio::time::sleep(interval).await;
            }
        }
        Ok(Readiness::TimedOut { probes })
    }
}

pub fn socket_path(emulation: &EmulationConfig, iid: &InstanceId) -> String {
    format!("{}{}", emulation.monitor_socket_prefix, iid)
}

/// Check a snapshot tag before it is placed on a monitor command line.
pub fn validate_snapshot_name(name: &str) -> Result<&str> {
    let invalid = |reason| Error::InvalidName {
        kind: "snapshot name",
        value: name.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(invalid("allowed characters are ASCII letters, digits, '-', '_' and '.'"));
    }
    if name.len() > MAX_SNAPSHOT_NAME_LEN {
        return Err(invalid("longer than 128 characters"));
    }
    Ok(name)
}

/// Strip terminal escape sequences and carriage returns the monitor emits.
pub fn clean_reply(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\u{1b}' => {
                if chars.peek() == Some(&'[') {
                    chars.next();
                    // CSI: parameters and intermediates up to a final byte.
                    for next in chars.by_ref() {
                        if ('@'..='~').contains(&next) {
                            break;
                        }
                    }
                } else {
                    chars.next();
                }
            },
            '\r' => {},
            _ => out.push(c),
        }
    }
    out
}

/// Snapshot tags from an `info snapshots` reply.
pub fn snapshot_names(reply: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut in_table = false;
    for line in reply.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("(qemu)") {
            if in_table {
                break;
            }
            continue;
        }
        if !in_table {
            in_table = trimmed.contains("TAG");
            continue;
        }
        if trimmed.is_empty() {
            break;
        }
        if let Some(tag) = trimmed.split_whitespace().nth(1) {
            names.push(tag.to_string());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    use crate::testing::{ScriptedRunner, fail, ok};

    const INFO_SNAPSHOTS: &str = "QEMU 4.2.1 monitor - type 'help' for more information\r\n\
(qemu) info snapshots\r\n\
List of snapshots present on all disks:\r\n\
ID        TAG                 VM SIZE                DATE       VM CLOCK\r\n\
--        demo1               176 MiB 2024-03-01 10:00:01   00:01:12.345\r\n\
--        warm.boot           180 MiB 2024-03-01 10:05:41   00:06:50.001\r\n\
(qemu) \r\n";

    fn client(runner: &std::sync::Arc<ScriptedRunner>) -> MonitorClient {
        MonitorClient::new(
            runner.docker(),
            &EmulationConfig::default(),
            "docker0_router_fw_bin",
            &InstanceId::new("42").unwrap(),
        )
    }

    #[rstest]
    #[case("demo1", true)]
    #[case("warm.boot-2_a", true)]
    #[case("", false)]
    #[case("bad name", false)]
    #[case("x\ninfo status", false)]
    #[case("semi;colon", false)]
    fn snapshot_name_rules(#[case] name: &str, #[case] ok: bool) {
        assert_eq!(validate_snapshot_name(name).is_ok(), ok);
    }

    #[test]
    fn snapshot_name_length_limit() {
        assert!(validate_snapshot_name(&"a".repeat(128)).is_ok());
        assert!(validate_snapshot_name(&"a".repeat(129)).is_err());
    }

    #[test]
    fn socket_path_uses_prefix() {
        let iid = InstanceId::new("42").unwrap();
        assert_eq!(socket_path(&EmulationConfig::default(), &iid), "/tmp/qemu.42");
    }

    #[test]
    fn clean_reply_strips_escapes() {
        assert_eq!(clean_reply("\u{1b}[K(qemu) \u{1b}[Dok\r\n"), "(qemu) ok\n");
    }

    #[test]
    fn parses_snapshot_table() {
        let names = snapshot_names(&clean_reply(INFO_SNAPSHOTS));
        assert_eq!(names, ["demo1", "warm.boot"]);
    }

    #[test]
    fn empty_snapshot_table() {
        let reply = "(qemu) info snapshots\nThere is no snapshot available.\n(qemu) \n";
        assert!(snapshot_names(reply).is_empty());
    }

    #[tokio::test]
    async fn send_joins_commands_with_trailing_newline() {
        let runner = ScriptedRunner::new();
        runner.on("socat", ok("(qemu) \r\n"));
        let reply = client(&runner).send(&["stop", "cont"]).await.unwrap();
        assert_eq!(reply, "(qemu) \n");

        assert_eq!(runner.stdin_for("socat"), ["stop\ncont\n"]);
        assert_eq!(runner.calls(), [
            "docker exec -i docker0_router_fw_bin socat -t 300 - UNIX-CONNECT:/tmp/qemu.42"
        ]);
        assert_eq!(runner.specs()[0].timeout, Some(Duration::from_secs(305)));
    }

    #[tokio::test]
    async fn send_waits_for_reply_up_to_monitor_timeout() {
        let runner = ScriptedRunner::new();
        runner.on("socat", ok("(qemu) savevm demo1\n(qemu) \n"));
        let emulation = EmulationConfig {
            monitor_timeout_secs: 30,
            ..EmulationConfig::default()
        };
        let client = MonitorClient::new(
            runner.docker(),
            &emulation,
            "docker0_router_fw_bin",
            &InstanceId::new("42").unwrap(),
        );
        client.send(&["savevm demo1"]).await.unwrap();

        let spec = &runner.specs()[0];
        let socat = spec.args.iter().position(|a| a == "socat").unwrap();
        assert_eq!(spec.args[socat + 1..socat + 3], ["-t", "30"]);
        assert!(spec.timeout.unwrap() > Duration::from_secs(30));
    }

    #[tokio::test]
    async fn send_failure_carries_stderr() {
        let runner = ScriptedRunner::new();
        runner.on("socat", fail(1, "connect: Connection refused"));
        let err = client(&runner).send(&["info status"]).await.unwrap_err();
        match err {
            Error::Transport { stderr, .. } => assert_eq!(stderr, "connect: Connection refused"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ensure_ready_reports_missing_socket() {
        let runner = ScriptedRunner::new();
        runner.on("test -S", fail(1, ""));
        let err = client(&runner).ensure_ready().await.unwrap_err();
        assert!(matches!(err, Error::MonitorNotReady { .. }));
        assert!(err.to_string().contains("run prepare first"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ready_on_first_probe() {
        let runner = ScriptedRunner::new();
        let start = tokio::time::Instant::now();
        let readiness = client(&runner)
            .wait_ready(180, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(readiness, Readiness::Ready { probes: 1 });
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ready_on_last_probe() {
        let runner = ScriptedRunner::new();
        let mut responses = vec![fail(1, ""); 179];
        responses.push(ok(""));
        runner.on_seq("test -S", responses);

        let start = tokio::time::Instant::now();
        let readiness = client(&runner)
            .wait_ready(180, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(readiness, Readiness::Ready { probes: 180 });
        assert_eq!(start.elapsed(), Duration::from_secs(179));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ready_times_out() {
        let runner = ScriptedRunner::new();
        runner.on("test -S", fail(1, ""));
        let readiness = client(&runner)
            .wait_ready(180, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(readiness, Readiness::TimedOut { probes: 180 });
        assert_eq!(runner.count("test -S"), 180);
    }
}
