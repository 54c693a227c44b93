//! Sandbox locator: firmware artifact to sandbox name and liveness.

use std::fmt;

use {serde::Serialize, tracing::debug};

use crate::{Docker, error::Result, firmware::FirmwareRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Running,
    /// Frozen by the runtime; its processes resume on `unpause`.
    Paused,
    Stopped,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocatedSandbox {
    pub name: String,
    pub state: SandboxState,
}

/// Find the sandbox owning `firmware`. Live sandboxes (paused included) are
/// consulted first; within a listing the first match wins.
pub async fn locate(docker: &Docker, firmware: &FirmwareRef) -> Result<Option<LocatedSandbox>> {
    let pattern = firmware.sandbox_pattern()?;

    let live = docker.list(false, true).await?;
    if let Some(entry) = live.iter().find(|e| pattern.is_match(&e.name)) {
        let state = if entry.is_paused() {
            SandboxState::Paused
        } else {
            SandboxState::Running
        };
        debug!(sandbox = %entry.name, %state, "located live sandbox");
        return Ok(Some(LocatedSandbox {
            name: entry.name.clone(),
            state,
        }));
    }

    let all = docker.list(true, true).await?;
    Ok(all
        .into_iter()
        .find(|e| pattern.is_match(&e.name))
        .map(|entry| {
            debug!(sandbox = %entry.name, "located stopped sandbox");
            LocatedSandbox {
                name: entry.name,
                state: SandboxState::Stopped,
            }
        }))
}

/// Number of live sandboxes (paused included), used as the next index.
pub async fn sandbox_count(docker: &Docker) -> Result<usize> {
    Ok(docker.list(false, true).await?.len())
}
