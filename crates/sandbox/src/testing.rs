//! Scripted [`CommandRunner`] for unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{
    Docker,
    command::{CommandOutput, CommandRunner, CommandSpec},
    error::Result,
};

pub(crate) fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

pub(crate) fn fail(exit_code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code,
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

struct Rule {
    needle: String,
    responses: Vec<CommandOutput>,
    served: usize,
}

/// Answers commands by substring match on the joined command line.
///
/// Rules are tried in registration order. A rule with several responses
/// serves them in order and then keeps repeating the last one. Commands
/// matching no rule succeed with empty output. Every call is recorded.
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<CommandSpec>>,
    interactive: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn on(&self, needle: &str, response: CommandOutput) -> &Self {
        self.on_seq(needle, vec![response])
    }

    pub(crate) fn on_seq(&self, needle: &str, responses: Vec<CommandOutput>) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            needle: needle.into(),
            responses,
            served: 0,
        });
        self
    }

    /// Command lines of every captured call, in order.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(CommandSpec::command_line)
            .collect()
    }

    pub(crate) fn specs(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn interactive_calls(&self) -> Vec<String> {
        self.interactive
            .lock()
            .unwrap()
            .iter()
            .map(CommandSpec::command_line)
            .collect()
    }

    pub(crate) fn count(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(needle)).count()
    }

    /// Index of the first call containing `needle`.
    pub(crate) fn position(&self, needle: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.contains(needle))
    }

    /// Stdin payloads sent with calls containing `needle`.
    pub(crate) fn stdin_for(&self, needle: &str) -> Vec<String> {
        self.specs()
            .into_iter()
            .filter(|s| s.command_line().contains(needle))
            .filter_map(|s| s.stdin)
            .collect()
    }

    pub(crate) fn docker(self: &Arc<Self>) -> Docker {
        Docker::new(Arc::clone(self) as Arc<dyn CommandRunner>, "docker")
    }

    fn respond(&self, line: &str) -> CommandOutput {
        let mut rules = self.rules.lock().unwrap();
        match rules.iter_mut().find(|r| line.contains(&r.needle)) {
            Some(rule) => {
                let idx = rule.served.min(rule.responses.len().saturating_sub(1));
                rule.served += 1;
                rule.responses.get(idx).cloned().unwrap_or_default()
            },
            None => CommandOutput::default(),
        }
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(spec.clone());
        Ok(self.respond(&spec.command_line()))
    }

    async fn interactive(&self, spec: &CommandSpec) -> Result<i32> {
        self.interactive.lock().unwrap().push(spec.clone());
        Ok(self.respond(&spec.command_line()).exit_code)
    }
}
