//! Soft and hard steps.
//!
//! A hard step aborts the surrounding flow on failure. A soft step logs a
//! warning and lets the flow continue.

use tracing::warn;

use crate::{command::CommandOutput, error::Result};

/// Run-result of a step whose failure is tolerated.
pub fn soft(step: &str, result: Result<CommandOutput>) -> Option<CommandOutput> {
    match result {
        Ok(out) if out.success() => Some(out),
        Ok(out) => {
            warn!(
                step,
                exit_code = out.exit_code,
                stderr = out.stderr.trim(),
                "step failed, continuing"
            );
            None
        },
        Err(e) => {
            warn!(step, error = %e, "step failed, continuing");
            None
        },
    }
}

/// Run-result of a step that must succeed.
pub fn hard(step: &str, result: Result<CommandOutput>) -> Result<CommandOutput> {
    result?.into_result(step)
}
