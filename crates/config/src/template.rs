//! Default configuration template with all options documented.
//!
//! Written by `firmbox config init`. Every value matches the built-in
//! default so the file can be edited selectively.

/// Generate the default config template.
#[must_use]
pub fn default_config_template() -> String {
    r##"# firmbox configuration
# =====================
# Every option is listed with its default value.
# Environment variable substitution is supported: ${ENV_VAR} or ${ENV_VAR:-default}
# FIRMAE_DOCKER_IMAGE overrides runtime.image when set.

[runtime]
cli = "docker"                          # Container CLI binary
image = "fcore"                         # Image used for new sandboxes
# framework_root = "/opt/FirmAE"        # Host framework checkout (default: current directory)

[emulation]
framework_dir = "/work/FirmAE"          # Framework mount point inside the sandbox
firmware_dir = "/work/firmwares"        # Firmware directory mount point inside the sandbox
guest_address = "192.168.0.1"           # Address of the emulated device
monitor_socket_prefix = "/tmp/qemu."    # Monitor socket is <prefix><iid>
readiness_probes = 180                  # Probes after a relaunch before giving up
probe_interval_secs = 1                 # Seconds between probes
log_tail_lines = 80                     # Relaunch log lines shown on timeout
monitor_timeout_secs = 300              # Upper bound for one monitor command batch

[network]
host_route = true                       # Route guest_address via the sandbox IP on the host
use_sudo = true                         # Run host route commands through sudo

[[network.forwards]]
listen = 8080
target = 80
label = "HTTP"

[[network.forwards]]
listen = 8443
target = 443
label = "HTTPS"

[[network.forwards]]
listen = 2323
target = 23
label = "Telnet"

[[network.forwards]]
listen = 2222
target = 22
label = "SSH"

[[network.forwards]]
listen = 11337
target = 1337
label = "GDB"

[timing]
start_settle_secs = 5                   # After creating or starting a sandbox
snapshot_start_settle_secs = 2          # After starting a stopped sandbox for snapshot commands
reset_start_settle_secs = 3             # After starting a stopped sandbox for a reset
reset_settle_secs = 5                   # After relaunching the emulator in a reset
restore_settle_secs = 2                 # After restoring a checkpoint
relaunch_pause_secs = 1                 # Between killing and relaunching the emulator
interactive_warmup_secs = 10            # Before wiring the network in debug mode
background_warmup_secs = 20             # Before wiring the network in background modes
"##
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FirmboxConfig;

    #[test]
    fn template_parses_to_defaults() {
        let cfg: FirmboxConfig = toml::from_str(&default_config_template()).unwrap();
        assert_eq!(cfg, FirmboxConfig::default());
    }

    #[test]
    fn template_validates_cleanly() {
        let result = crate::validate::validate_str(&default_config_template(), "toml");
        assert!(!result.has_errors(), "{:?}", result.diagnostics);
    }
}
