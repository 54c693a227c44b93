use std::path::{Path, PathBuf};

use {
    anyhow::{Context, Result, bail},
    clap::Subcommand,
};

use firmbox_config::{
    template::default_config_template,
    validate::{self, Severity, ValidationResult},
};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate the configuration file and report errors/warnings.
    Check {
        /// Show informational diagnostics in addition to errors and warnings.
        #[arg(long)]
        verbose: bool,
    },
    /// Write a documented default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration (file, defaults and env overrides).
    Show,
}

pub fn handle_config(action: ConfigAction, explicit: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Check { verbose } => check(explicit, verbose),
        ConfigAction::Init { force } => {
            let path = explicit
                .map(Path::to_path_buf)
                .unwrap_or_else(firmbox_config::find_or_default_config_path);
            init(&path, force)?;
            eprintln!("Wrote {}", path.display());
            Ok(())
        },
        ConfigAction::Show => {
            let config = firmbox_config::discover_and_load(explicit)?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        },
    }
}

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn check(explicit: Option<&Path>, verbose: bool) -> Result<()> {
    let result = validate::validate(explicit);
    eprint!("{}", render_diagnostics(&result, verbose));

    if result.has_errors() {
        std::process::exit(1);
    }

    Ok(())
}

fn render_diagnostics(result: &ValidationResult, verbose: bool) -> String {
    let mut out = String::new();

    if let Some(ref path) = result.config_path {
        out.push_str(&format!("Checking {}\n\n", path.display()));
    } else {
        out.push_str("No config file found; checking defaults.\n\n");
    }

    let mut shown = 0;
    for d in &result.diagnostics {
        if d.severity == Severity::Info && !verbose {
            continue;
        }

        let (color, label) = match d.severity {
            Severity::Error => (RED, "error"),
            Severity::Warning => (YELLOW, "warning"),
            Severity::Info => (CYAN, "info"),
        };

        if d.path.is_empty() {
            out.push_str(&format!("  {BOLD}{color}{label}{RESET} {}\n", d.message));
        } else {
            out.push_str(&format!(
                "  {BOLD}{color}{label}{RESET} {}: {}\n",
                d.path, d.message
            ));
        }
        shown += 1;
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);

    if shown > 0 {
        out.push('\n');
    }

    if errors == 0 && warnings == 0 {
        out.push_str("No issues found.\n");
    } else {
        out.push_str(&format!("{errors} error(s), {warnings} warning(s)\n"));
    }
    out
}

fn init(path: &PathBuf, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite it",
            path.display()
        );
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, default_config_template())
        .with_context(|| format!("failed to write {}", path.display()))
}
