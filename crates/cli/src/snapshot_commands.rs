use std::{path::Path, time::Duration};

use {
    anyhow::Result,
    clap::Subcommand,
    firmbox_sandbox::{
        FirmwareRef, LifecycleManager, MonitorClient,
        instance::{self, InstanceId},
        prepare, snapshot,
    },
    tracing::info,
};

#[derive(Subcommand)]
pub enum SnapshotAction {
    /// Pause the guest, save a snapshot, resume.
    Save { firmware: String, name: String },
    /// Restore the guest from a snapshot.
    Load { firmware: String, name: String },
    /// Delete a snapshot.
    Delete { firmware: String, name: String },
    /// List snapshots stored in the instance image.
    List { firmware: String },
}

impl SnapshotAction {
    fn firmware(&self) -> &str {
        match self {
            Self::Save { firmware, .. }
            | Self::Load { firmware, .. }
            | Self::Delete { firmware, .. }
            | Self::List { firmware } => firmware,
        }
    }
}

pub async fn handle_snapshot(manager: &LifecycleManager, action: SnapshotAction) -> Result<()> {
    let (sandbox, iid) = target(manager, Path::new(action.firmware())).await?;
    let monitor = MonitorClient::new(
        manager.docker().clone(),
        &manager.config().emulation,
        &sandbox,
        &iid,
    );

    let reply = match action {
        SnapshotAction::Save { name, .. } => snapshot::save(&monitor, &name).await?,
        SnapshotAction::Load { name, .. } => snapshot::load(&monitor, &name).await?,
        SnapshotAction::Delete { name, .. } => snapshot::delete(&monitor, &name).await?,
        SnapshotAction::List { .. } => snapshot::list(&monitor).await?,
    };
    print_reply(&reply);
    Ok(())
}

/// Convert the instance to qcow2 and relaunch it with its monitor socket.
pub async fn prepare(manager: &LifecycleManager, firmware: &Path) -> Result<()> {
    let (sandbox, iid) = target(manager, firmware).await?;
    let report = prepare::prepare(manager.docker(), manager.config(), &sandbox, &iid).await?;
    if let Some(ref snapshots) = report.snapshots {
        print_reply(snapshots);
    }
    info!(
        sandbox = %sandbox,
        iid = %report.iid,
        socket = %report.socket,
        converted = report.converted,
        patched = report.patched,
        probes = report.probes,
        "prepared qcow2 image and monitor for live snapshots"
    );
    Ok(())
}

/// Locate the firmware's sandbox, start it when stopped, and resolve its
/// emulation instance.
async fn target(manager: &LifecycleManager, firmware: &Path) -> Result<(String, InstanceId)> {
    let firmware = FirmwareRef::new(firmware)?;
    let located = manager.require(&firmware).await?;
    let settle = Duration::from_secs(manager.config().timing.snapshot_start_settle_secs);
    manager.ensure_running(&located, settle).await?;

    let iid = instance::resolve(
        manager.docker(),
        &manager.config().emulation,
        &located.name,
        firmware.base_name(),
    )
    .await?;
    info!(sandbox = %located.name, %iid, "target instance");
    Ok((located.name, iid))
}

fn print_reply(reply: &str) {
    let reply = reply.trim_end();
    if !reply.is_empty() {
        println!("{reply}");
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[command(subcommand)]
        action: SnapshotAction,
    }

    #[test]
    fn every_action_names_its_firmware() {
        for argv in [
            ["t", "save", "router_fw.bin", "demo1"].as_slice(),
            &["t", "load", "router_fw.bin", "demo1"],
            &["t", "delete", "router_fw.bin", "demo1"],
            &["t", "list", "router_fw.bin"],
        ] {
            let harness = Harness::try_parse_from(argv).unwrap();
            assert_eq!(harness.action.firmware(), "router_fw.bin");
        }
    }

    #[test]
    fn save_requires_a_name() {
        assert!(Harness::try_parse_from(["t", "save", "router_fw.bin"]).is_err());
    }
}
