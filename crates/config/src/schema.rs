/// Config schema types (runtime, emulation, network, timing).
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default runtime image used when neither config nor environment selects one.
pub const DEFAULT_RUNTIME_IMAGE: &str = "fcore";

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmboxConfig {
    pub runtime: RuntimeConfig,
    pub emulation: EmulationConfig,
    pub network: NetworkConfig,
    pub timing: TimingConfig,
}

/// Container runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Container CLI binary. Defaults to "docker".
    pub cli: String,
    /// Image every sandbox is created from.
    pub image: String,
    /// Host directory of the emulation framework, bind-mounted into each
    /// sandbox. Defaults to the current working directory.
    pub framework_root: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cli: "docker".into(),
            image: DEFAULT_RUNTIME_IMAGE.into(),
            framework_root: None,
        }
    }
}

/// Layout of the emulation framework as seen from inside a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulationConfig {
    /// Mount point of the framework root inside the sandbox.
    pub framework_dir: String,
    /// Mount point of the host firmware directory inside the sandbox.
    pub firmware_dir: String,
    /// Address the emulated device answers on.
    pub guest_address: String,
    /// Monitor sockets live at `<prefix><iid>`.
    pub monitor_socket_prefix: String,
    /// Number of one-interval readiness probes after a relaunch.
    pub readiness_probes: u32,
    /// Seconds between readiness probes.
    pub probe_interval_secs: u64,
    /// Lines of the relaunch log surfaced when readiness times out.
    pub log_tail_lines: u32,
    /// Upper bound for one monitor command batch (savevm can be slow).
    pub monitor_timeout_secs: u64,
}

impl Default for EmulationConfig {
    fn default() -> Self {
        Self {
            framework_dir: "/work/FirmAE".into(),
            firmware_dir: "/work/firmwares".into(),
            guest_address: "192.168.0.1".into(),
            monitor_socket_prefix: "/tmp/qemu.".into(),
            readiness_probes: 180,
            probe_interval_secs: 1,
            log_tail_lines: 80,
            monitor_timeout_secs: 300,
        }
    }
}

/// One relay from a sandbox port to a service port on the emulated device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub listen: u16,
    pub target: u16,
    pub label: String,
}

impl PortForward {
    fn new(listen: u16, target: u16, label: &str) -> Self {
        Self {
            listen,
            target,
            label: label.into(),
        }
    }
}

/// Host-to-guest reachability settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Install a host route to the guest address via the sandbox.
    pub host_route: bool,
    /// Prefix host route commands with `sudo`.
    pub use_sudo: bool,
    pub forwards: Vec<PortForward>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host_route: true,
            use_sudo: true,
            forwards: vec![
                PortForward::new(8080, 80, "HTTP"),
                PortForward::new(8443, 443, "HTTPS"),
                PortForward::new(2323, 23, "Telnet"),
                PortForward::new(2222, 22, "SSH"),
                PortForward::new(11337, 1337, "GDB"),
            ],
        }
    }
}

/// Fixed settle intervals, in seconds, after disruptive actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// After starting or creating a sandbox.
    pub start_settle_secs: u64,
    /// After starting a stopped sandbox ahead of a snapshot operation.
    pub snapshot_start_settle_secs: u64,
    /// After starting a stopped sandbox ahead of a reset.
    pub reset_start_settle_secs: u64,
    /// After relaunching the emulator in a reset.
    pub reset_settle_secs: u64,
    /// After restoring a checkpoint.
    pub restore_settle_secs: u64,
    /// Between killing the emulator and relaunching it.
    pub relaunch_pause_secs: u64,
    /// Before wiring the network in interactive mode.
    pub interactive_warmup_secs: u64,
    /// Before wiring the network in background mode.
    pub background_warmup_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            start_settle_secs: 5,
            snapshot_start_settle_secs: 2,
            reset_start_settle_secs: 3,
            reset_settle_secs: 5,
            restore_settle_secs: 2,
            relaunch_pause_secs: 1,
            interactive_warmup_secs: 10,
            background_warmup_secs: 20,
        }
    }
}
