//! Device reset: restart the emulator on its disk image, optionally rolling
//! the image back to a pristine baseline first.

use std::time::Duration;

use tracing::info;

use crate::{
    LifecycleManager,
    error::Result,
    firmware::FirmwareRef,
    instance::{self, InstanceId, InstanceLayout},
    prepare::{kill_emulator, relaunch},
    step,
};

/// Interpret the optional `clean` argument of a reset.
pub fn parse_clean_flag(value: Option<&str>) -> bool {
    value.is_some_and(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "clean" | "true" | "1" | "yes" | "y"
        )
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetReport {
    pub sandbox: String,
    pub iid: InstanceId,
    /// Whether the raw image was restored from `image.clean`.
    pub restored_baseline: bool,
    pub log: String,
}

/// Kill, unmount, optionally restore the baseline, relaunch and re-wire.
pub async fn reset(manager: &LifecycleManager, firmware: &FirmwareRef, clean: bool) -> Result<ResetReport> {
    let docker = manager.docker();
    let config = manager.config();
    let timing = &config.timing;

    let located = manager.require(firmware).await?;
    manager
        .ensure_running(&located, Duration::from_secs(timing.reset_start_settle_secs))
        .await?;
    let sandbox = located.name;

    let iid = instance::resolve(docker, &config.emulation, &sandbox, firmware.base_name()).await?;
    info!(sandbox = %sandbox, %iid, base_name = firmware.base_name(), clean, "resetting instance");
    let layout = InstanceLayout::new(&config.emulation.framework_dir, iid.clone());

    kill_emulator(docker, &sandbox).await;
    tokio::time::sleep(Duration::from_secs(timing.relaunch_pause_secs)).await;
    step::soft(
        "unmount instance image",
        docker
            .exec(&sandbox, [layout.umount_script(), iid.to_string()])
            .await,
    );

    let restored_baseline = clean && restore_baseline(manager, &sandbox, &layout).await;

    let log = layout.reset_log();
    relaunch(docker, &config.emulation, &sandbox, &layout, &log).await?;
    tokio::time::sleep(Duration::from_secs(timing.reset_settle_secs)).await;
    manager.wire_network(&sandbox).await;

    info!(
        "reset complete; follow the log with: {} exec -it {sandbox} tail -f {log}",
        docker.cli()
    );
    Ok(ResetReport {
        sandbox,
        iid,
        restored_baseline,
        log,
    })
}

/// Create `image.clean` from `image.raw` when missing, then copy it back over
/// `image.raw`. Soft: returns false on any failure.
async fn restore_baseline(manager: &LifecycleManager, sandbox: &str, layout: &InstanceLayout) -> bool {
    let docker = manager.docker();
    let raw = layout.raw_image();
    let clean = layout.clean_image();
    let copy = |from: &str, to: &str| {
        [
            "cp".to_string(),
            "--reflink=auto".to_string(),
            "--sparse=always".to_string(),
            from.to_string(),
            to.to_string(),
        ]
    };

    let has_baseline = matches!(
        docker.exec(sandbox, ["test", "-f", clean.as_str()]).await,
        Ok(ref out) if out.success()
    );
    if !has_baseline {
        info!(sandbox, image = %clean, "creating pristine baseline");
        if step::soft(
            "create baseline image",
            docker.exec(sandbox, copy(raw.as_str(), clean.as_str())).await,
        )
        .is_none()
        {
            return false;
        }
    }
    step::soft(
        "restore baseline image",
        docker.exec(sandbox, copy(clean.as_str(), raw.as_str())).await,
    )
    .is_some()
}
