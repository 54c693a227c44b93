//! `${VAR}` expansion in raw config text, applied before parsing.
//!
//! `${VAR:-fallback}` expands to `fallback` when `VAR` is unset or empty. A
//! bare `${VAR}` with nothing to expand stays verbatim.

use std::{borrow::Cow, sync::LazyLock};

use regex::{Captures, Regex};

#[allow(clippy::unwrap_used)] // constant pattern
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").unwrap());

/// Expand placeholders from the process environment.
pub fn substitute_env(input: &str) -> String {
    expand(input, |name| std::env::var(name).ok()).into_owned()
}

fn expand<'a>(input: &'a str, lookup: impl Fn(&str) -> Option<String>) -> Cow<'a, str> {
    PLACEHOLDER.replace_all(input, |caps: &Captures<'_>| {
        match (lookup(&caps[1]).filter(|v| !v.is_empty()), caps.get(2)) {
            (Some(value), _) => value,
            (None, Some(fallback)) => fallback.as_str().to_string(),
            (None, None) => caps[0].to_string(),
        }
    })
}
