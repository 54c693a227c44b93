//! Instance resolver and on-disk instance layout.
//!
//! An emulation instance is `<framework>/scratch/<iid>/` inside the sandbox.
//! Ownership is recorded only by the `name` marker file, so resolution scans
//! every instance directory and compares marker contents.

use std::fmt;

use {firmbox_config::EmulationConfig, serde::Serialize, tracing::debug};

use crate::{
    Docker,
    error::{Context, Error, Result},
    step,
};

/// Prints `<dir>\0<marker contents>\0` for every instance with a marker.
/// The scratch root arrives as `$1`.
const SCAN_SCRIPT: &str = r#"for d in "$1"/*/; do d=${d%/}; [ -f "$d/name" ] || continue; printf '%s\0' "${d##*/}"; cat "$d/name"; printf '\0'; done"#;

/// Opaque instance identifier (a scratch directory name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let invalid = |reason| Error::InvalidName {
            kind: "instance id",
            value: value.clone(),
            reason,
        };
        if value.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid("only ASCII letters, digits, '-' and '_' are allowed"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Paths of one instance as seen from inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLayout {
    framework_dir: String,
    iid: InstanceId,
}

impl InstanceLayout {
    pub fn new(framework_dir: impl Into<String>, iid: InstanceId) -> Self {
        Self {
            framework_dir: framework_dir.into().trim_end_matches('/').to_string(),
            iid,
        }
    }

    pub fn iid(&self) -> &InstanceId {
        &self.iid
    }

    pub fn framework_dir(&self) -> &str {
        &self.framework_dir
    }

    /// Directory relative to the framework root, as `run.sh` expects.
    pub fn relative_dir(&self) -> String {
        format!("scratch/{}", self.iid)
    }

    pub fn dir(&self) -> String {
        format!("{}/{}", self.framework_dir, self.relative_dir())
    }

    pub fn raw_image(&self) -> String {
        format!("{}/image.raw", self.dir())
    }

    pub fn qcow2_image(&self) -> String {
        format!("{}/image.qcow2", self.dir())
    }

    pub fn clean_image(&self) -> String {
        format!("{}/image.clean", self.dir())
    }

    pub fn run_script(&self) -> String {
        format!("{}/run.sh", self.dir())
    }

    pub fn relative_run_script(&self) -> String {
        format!("./{}/run.sh", self.relative_dir())
    }

    pub fn relaunch_log(&self) -> String {
        format!("{}/qemu.relaunch.log", self.dir())
    }

    pub fn reset_log(&self) -> String {
        format!("{}/reset.log", self.dir())
    }

    pub fn umount_script(&self) -> String {
        format!("{}/scripts/umount.sh", self.framework_dir)
    }
}

pub fn scratch_root(emulation: &EmulationConfig) -> String {
    format!("{}/scratch", emulation.framework_dir.trim_end_matches('/'))
}

/// Resolve the instance whose marker equals `base_name`. First match in
/// directory order wins; duplicate markers are not detected.
pub async fn resolve(
    docker: &Docker,
    emulation: &EmulationConfig,
    sandbox: &str,
    base_name: &str,
) -> Result<InstanceId> {
    let scratch = scratch_root(emulation);
    let out = step::hard(
        "scan instance markers",
        docker
            .exec(sandbox, ["sh", "-c", SCAN_SCRIPT, "sh", scratch.as_str()])
            .await,
    )?;

    match first_match(&out.stdout, base_name) {
        Some(dir) => {
            let iid = InstanceId::new(dir).with_context(|| {
                format!("instance marked '{base_name}' under {scratch} in {sandbox}")
            })?;
            debug!(sandbox, %iid, base_name, "resolved instance");
            Ok(iid)
        },
        None => Err(Error::InstanceNotFound {
            sandbox: sandbox.to_string(),
            base_name: base_name.to_string(),
        }),
    }
}

/// Split the scan output into `(dir, marker)` pairs.
fn parse_marker_listing(listing: &str) -> Vec<(&str, &str)> {
    let mut fields = listing.split('\0');
    let mut pairs = Vec::new();
    while let (Some(dir), Some(marker)) = (fields.next(), fields.next()) {
        if !dir.is_empty() {
            pairs.push((dir, marker));
        }
    }
    pairs
}

fn first_match<'a>(listing: &'a str, base_name: &str) -> Option<&'a str> {
    parse_marker_listing(listing)
        .into_iter()
        .find(|(_, marker)| marker.trim() == base_name)
        .map(|(dir, _)| dir)
}
