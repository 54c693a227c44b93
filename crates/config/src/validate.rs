//! Configuration validation engine.
//!
//! Validates configuration files against the known schema, detects
//! unknown/misspelled fields, and reports values that would break the
//! sandbox flows at runtime.

use std::{
    collections::{HashMap, HashSet},
    net::Ipv4Addr,
    path::Path,
};

use crate::schema::FirmboxConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "type-error", "value", "file-ref"
    pub category: &'static str,
    /// Dotted path, e.g. "emulation.guest_address"
    pub path: String,
    pub message: String,
}

/// Result of validating a configuration file.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<std::path::PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

// ── Schema tree for unknown-field detection ─────────────────────────────────

/// Represents the expected shape of the configuration schema.
enum KnownKeys {
    /// A struct with fixed field names.
    Struct(HashMap<&'static str, KnownKeys>),
    /// An array of typed items.
    Array(Box<KnownKeys>),
    /// Scalar value; recursion stops here.
    Leaf,
}

/// Build the full schema map mirroring every field in `schema.rs`.
fn build_schema_map() -> KnownKeys {
    use KnownKeys::{Array, Leaf, Struct};

    let forward = || {
        Struct(HashMap::from([
            ("listen", Leaf),
            ("target", Leaf),
            ("label", Leaf),
        ]))
    };

    Struct(HashMap::from([
        (
            "runtime",
            Struct(HashMap::from([
                ("cli", Leaf),
                ("image", Leaf),
                ("framework_root", Leaf),
            ])),
        ),
        (
            "emulation",
            Struct(HashMap::from([
                ("framework_dir", Leaf),
                ("firmware_dir", Leaf),
                ("guest_address", Leaf),
                ("monitor_socket_prefix", Leaf),
                ("readiness_probes", Leaf),
                ("probe_interval_secs", Leaf),
                ("log_tail_lines", Leaf),
                ("monitor_timeout_secs", Leaf),
            ])),
        ),
        (
            "network",
            Struct(HashMap::from([
                ("host_route", Leaf),
                ("use_sudo", Leaf),
                ("forwards", Array(Box::new(forward()))),
            ])),
        ),
        (
            "timing",
            Struct(HashMap::from([
                ("start_settle_secs", Leaf),
                ("snapshot_start_settle_secs", Leaf),
                ("reset_start_settle_secs", Leaf),
                ("reset_settle_secs", Leaf),
                ("restore_settle_secs", Leaf),
                ("relaunch_pause_secs", Leaf),
                ("interactive_warmup_secs", Leaf),
                ("background_warmup_secs", Leaf),
            ])),
        ),
    ]))
}

// ── Levenshtein distance ────────────────────────────────────────────────────

/// Compute the Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Closest candidate within `max_distance` edits, if any.
fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    let mut best: Option<(&'a str, usize)> = None;
    for &candidate in candidates {
        let d = levenshtein(needle, candidate);
        if d > 0 && d <= max_distance && best.as_ref().is_none_or(|(_, bd)| d < *bd) {
            best = Some((candidate, d));
        }
    }
    best.map(|(s, _)| s)
}

// ── Core validation ─────────────────────────────────────────────────────────

/// Validate a config file at the given path, or discover the default config
/// file location if `path` is `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => crate::loader::find_config_file(),
    };

    let Some(ref actual_path) = config_path else {
        return ValidationResult {
            diagnostics: vec![Diagnostic {
                severity: Severity::Info,
                category: "file-ref",
                path: String::new(),
                message: "no config file found; using defaults".into(),
            }],
            config_path: None,
        };
    };

    let format = actual_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("toml");

    match std::fs::read_to_string(actual_path) {
        Ok(content) => {
            let content = crate::env_subst::substitute_env(&content);
            let mut result = validate_str(&content, format);
            result.config_path = Some(actual_path.clone());
            result
        },
        Err(e) => ValidationResult {
            diagnostics: vec![Diagnostic {
                severity: Severity::Error,
                category: "syntax",
                path: String::new(),
                message: format!("failed to read config file: {e}"),
            }],
            config_path: Some(actual_path.clone()),
        },
    }
}

/// Validate raw config text in the given format (`toml`, `yaml`, `yml`,
/// `json`) without touching the file system.
#[must_use]
pub fn validate_str(raw: &str, format: &str) -> ValidationResult {
    let mut diagnostics = Vec::new();

    // 1. Syntax
    let value = match parse_value(raw, format) {
        Ok(v) => v,
        Err(message) => {
            diagnostics.push(Diagnostic {
                severity: Severity::Error,
                category: "syntax",
                path: String::new(),
                message,
            });
            return ValidationResult {
                diagnostics,
                config_path: None,
            };
        },
    };

    // 2. Unknown fields
    let schema = build_schema_map();
    check_unknown_fields(&value, &schema, "", &mut diagnostics);

    // 3. Type check, then semantic checks on what parsed
    match serde_json::from_value::<FirmboxConfig>(value) {
        Ok(config) => check_values(&config, &mut diagnostics),
        Err(e) => diagnostics.push(Diagnostic {
            severity: Severity::Error,
            category: "type-error",
            path: String::new(),
            message: format!("type error: {e}"),
        }),
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

fn parse_value(raw: &str, format: &str) -> Result<serde_json::Value, String> {
    match format {
        "toml" => {
            let v: toml::Value = toml::from_str(raw).map_err(|e| format!("TOML syntax error: {e}"))?;
            serde_json::to_value(v).map_err(|e| e.to_string())
        },
        "yaml" | "yml" => {
            let v: serde_yaml::Value =
                serde_yaml::from_str(raw).map_err(|e| format!("YAML syntax error: {e}"))?;
            serde_json::to_value(v).map_err(|e| e.to_string())
        },
        "json" => serde_json::from_str(raw).map_err(|e| format!("JSON syntax error: {e}")),
        other => Err(format!("unsupported config format: .{other}")),
    }
}

/// Walk the value tree against the schema tree and flag unknown keys.
fn check_unknown_fields(
    value: &serde_json::Value,
    schema: &KnownKeys,
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match (value, schema) {
        (serde_json::Value::Object(table), KnownKeys::Struct(fields)) => {
            let known_keys: Vec<&str> = fields.keys().copied().collect();
            for (key, child_value) in table {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                if let Some(child_schema) = fields.get(key.as_str()) {
                    check_unknown_fields(child_value, child_schema, &path, diagnostics);
                } else {
                    let level = if prefix.is_empty() {
                        "at top level "
                    } else {
                        ""
                    };
                    let msg = match suggest(key, &known_keys, 3) {
                        Some(s) => format!("unknown field {level}(did you mean \"{s}\"?)"),
                        None => format!("unknown field {level}"),
                    };
                    diagnostics.push(Diagnostic {
                        severity: Severity::Error,
                        category: "unknown-field",
                        path,
                        message: msg.trim().to_string(),
                    });
                }
            }
        },
        (serde_json::Value::Array(arr), KnownKeys::Array(item_schema)) => {
            for (i, item) in arr.iter().enumerate() {
                let path = format!("{prefix}[{i}]");
                check_unknown_fields(item, item_schema, &path, diagnostics);
            }
        },
        // Leaf or type mismatch: type errors are reported by the typed pass
        _ => {},
    }
}

fn value_error(path: &str, message: impl Into<String>) -> Diagnostic {
    Diagnostic {
        severity: Severity::Error,
        category: "value",
        path: path.into(),
        message: message.into(),
    }
}

fn value_warning(path: &str, message: impl Into<String>) -> Diagnostic {
    Diagnostic {
        severity: Severity::Warning,
        category: "value",
        path: path.into(),
        message: message.into(),
    }
}

/// Run semantic checks on a successfully parsed config.
fn check_values(config: &FirmboxConfig, diagnostics: &mut Vec<Diagnostic>) {
    if config.runtime.cli.trim().is_empty() {
        diagnostics.push(value_error("runtime.cli", "container CLI must not be empty"));
    }
    if config.runtime.image.trim().is_empty() {
        diagnostics.push(value_error("runtime.image", "runtime image must not be empty"));
    }
    if let Some(ref root) = config.runtime.framework_root
        && !root.is_dir()
    {
        diagnostics.push(Diagnostic {
            severity: Severity::Warning,
            category: "file-ref",
            path: "runtime.framework_root".into(),
            message: format!("directory does not exist: {}", root.display()),
        });
    }

    let emulation = &config.emulation;
    if emulation.guest_address.parse::<Ipv4Addr>().is_err() {
        diagnostics.push(value_error(
            "emulation.guest_address",
            format!("not an IPv4 address: {}", emulation.guest_address),
        ));
    }
    if emulation.readiness_probes == 0 {
        diagnostics.push(value_error(
            "emulation.readiness_probes",
            "at least one readiness probe is required",
        ));
    }
    if emulation.monitor_timeout_secs == 0 {
        diagnostics.push(value_error(
            "emulation.monitor_timeout_secs",
            "monitor batches need a non-zero timeout",
        ));
    }
    if emulation.probe_interval_secs == 0 {
        diagnostics.push(value_warning(
            "emulation.probe_interval_secs",
            "a zero interval polls the sandbox back-to-back",
        ));
    }
    for (path, dir) in [
        ("emulation.framework_dir", &emulation.framework_dir),
        ("emulation.firmware_dir", &emulation.firmware_dir),
        ("emulation.monitor_socket_prefix", &emulation.monitor_socket_prefix),
    ] {
        if !dir.starts_with('/') {
            diagnostics.push(value_error(path, "must be an absolute path inside the sandbox"));
        }
    }

    let mut listen_ports = HashSet::new();
    for (i, fwd) in config.network.forwards.iter().enumerate() {
        let path = format!("network.forwards[{i}]");
        if fwd.listen == 0 || fwd.target == 0 {
            diagnostics.push(value_error(&path, "ports must be non-zero"));
        }
        if !listen_ports.insert(fwd.listen) {
            diagnostics.push(value_error(
                &path,
                format!("listen port {} is forwarded twice", fwd.listen),
            ));
        }
    }
    if config.network.forwards.is_empty() {
        diagnostics.push(Diagnostic {
            severity: Severity::Info,
            category: "value",
            path: "network.forwards".into(),
            message: "no port forwards configured".into(),
        });
    }
}
