use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::FirmboxConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "firmbox.toml",
    "firmbox.yaml",
    "firmbox.yml",
    "firmbox.json",
];

/// Environment variable selecting the runtime image.
pub const IMAGE_ENV_VAR: &str = "FIRMAE_DOCKER_IMAGE";

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<FirmboxConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config, then apply environment overrides.
///
/// Search order:
/// 1. `explicit` (from `--config` / `FIRMBOX_CONFIG`); a load failure is fatal
/// 2. `./firmbox.{toml,yaml,yml,json}` (project-local)
/// 3. `~/.config/firmbox/firmbox.{toml,yaml,yml,json}` (user-global)
///
/// Falls back to `FirmboxConfig::default()` when nothing is found.
pub fn discover_and_load(explicit: Option<&Path>) -> anyhow::Result<FirmboxConfig> {
    let mut config = if let Some(path) = explicit {
        debug!(path = %path.display(), "loading explicit config");
        load_config(path)?
    } else if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                FirmboxConfig::default()
            },
        }
    } else {
        debug!("no config file found, using defaults");
        FirmboxConfig::default()
    };
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

/// Apply environment overrides on top of file values.
pub fn apply_env_overrides(config: &mut FirmboxConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(image) = lookup(IMAGE_ENV_VAR).filter(|v| !v.trim().is_empty()) {
        debug!(image, "runtime image overridden from environment");
        config.runtime.image = image;
    }
}

/// Find the first config file in standard locations.
pub(crate) fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    if let Some(config_dir) = config_dir() {
        for name in CONFIG_FILENAMES {
            let p = config_dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }

    None
}

/// Returns the user-global config directory (`~/.config/firmbox/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "firmbox").map(|d| d.config_dir().to_path_buf())
}

/// Returns the path of an existing config file, or the default TOML path.
pub fn find_or_default_config_path() -> PathBuf {
    if let Some(path) = find_config_file() {
        return path;
    }
    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("firmbox.toml")
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<FirmboxConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_each_format() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("firmbox.toml");
        std::fs::write(&toml_path, "[runtime]\nimage = \"a\"\n").unwrap();
        assert_eq!(load_config(&toml_path).unwrap().runtime.image, "a");

        let yaml_path = dir.path().join("firmbox.yaml");
        std::fs::write(&yaml_path, "runtime:\n  image: b\n").unwrap();
        assert_eq!(load_config(&yaml_path).unwrap().runtime.image, "b");

        let json_path = dir.path().join("firmbox.json");
        std::fs::write(&json_path, r#"{"runtime":{"image":"c"}}"#).unwrap();
        assert_eq!(load_config(&json_path).unwrap().runtime.image, "c");
    }

    #[test]
    fn placeholder_fallback_applies_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firmbox.toml");
        std::fs::write(
            &path,
            "[runtime]\nimage = \"${FIRMBOX_TEST_UNSET_IMAGE_7F3A:-fcore:arm}\"\n",
        )
        .unwrap();
        assert_eq!(load_config(&path).unwrap().runtime.image, "fcore:arm");
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firmbox.ini");
        std::fs::write(&path, "image=x").unwrap();
        let err = load_config(&path).unwrap_err().to_string();
        assert!(err.contains("unsupported config format"));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(discover_and_load(Some(&missing)).is_err());
    }

    #[test]
    fn env_override_replaces_image() {
        let mut cfg = FirmboxConfig::default();
        apply_env_overrides(&mut cfg, |name| {
            (name == IMAGE_ENV_VAR).then(|| "fcore:latest".to_string())
        });
        assert_eq!(cfg.runtime.image, "fcore:latest");
    }

    #[test]
    fn blank_env_override_is_ignored() {
        let mut cfg = FirmboxConfig::default();
        apply_env_overrides(&mut cfg, |_| Some("  ".to_string()));
        assert_eq!(cfg.runtime.image, "fcore");
    }
}
