//! Live snapshot operations over the monitor.

use tracing::{info, warn};

use crate::{
    error::Result,
    monitor::{MonitorClient, snapshot_names, validate_snapshot_name},
};

/// Pause the guest, save, resume, and list. The guest is resumed in the same
/// batch even when `savevm` reports an error.
pub async fn save(monitor: &MonitorClient, name: &str) -> Result<String> {
    let name = validate_snapshot_name(name)?;
    monitor.ensure_ready().await?;
    let reply = monitor
        .send(&[
            "stop".to_string(),
            format!("savevm {name}"),
            "cont".to_string(),
            "info snapshots".to_string(),
        ])
        .await?;

    if snapshot_names(&reply).iter().any(|n| n == name) {
        info!(sandbox = monitor.sandbox(), snapshot = name, "snapshot saved");
    } else {
        warn!(
            sandbox = monitor.sandbox(),
            snapshot = name,
            "snapshot missing from listing after savevm"
        );
    }
    Ok(reply)
}

pub async fn load(monitor: &MonitorClient, name: &str) -> Result<String> {
    let name = validate_snapshot_name(name)?;
    monitor.ensure_ready().await?;
    let reply = monitor
        .send(&[
            "stop".to_string(),
            format!("loadvm {name}"),
            "cont".to_string(),
        ])
        .await?;
    info!(sandbox = monitor.sandbox(), snapshot = name, "snapshot loaded");
    Ok(reply)
}

pub async fn list(monitor: &MonitorClient) -> Result<String> {
    monitor.ensure_ready().await?;
    monitor.send(&["info snapshots"]).await
}

pub async fn delete(monitor: &MonitorClient, name: &str) -> Result<String> {
    let name = validate_snapshot_name(name)?;
    monitor.ensure_ready().await?;
    let reply = monitor
        .send(&[format!("delvm {name}"), "info snapshots".to_string()])
        .await?;
    info!(sandbox = monitor.sandbox(), snapshot = name, "snapshot deleted");
    Ok(reply)
}
