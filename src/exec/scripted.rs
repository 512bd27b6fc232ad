//! Scripted runner for unit tests
//!
//! Records every invocation as a command line and answers from a list of
//! prefix rules, checked in insertion order. Unmatched commands succeed with
//! empty output.

use super::runner::{CommandOutput, CommandRunner};
use super::timeout::{TimeoutError, WaitOutcome};
use crate::escape::shell_join;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Mutex;

#[derive(Debug, Clone)]
enum Reply {
    Output(CommandOutput),
    Outcome(WaitOutcome),
    Interrupted,
}

#[derive(Debug)]
struct Rule {
    prefix: String,
    reply: Reply,
}

#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, prefix: &str, reply: Reply) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            prefix: prefix.to_string(),
            reply,
        });
        self
    }

    /// Answer commands starting with `prefix` with `stdout`
    pub fn on(&self, prefix: &str, stdout: &str) -> &Self {
        self.push(prefix, Reply::Output(CommandOutput::success(stdout)))
    }

    /// Fail commands starting with `prefix`
    pub fn fail(&self, prefix: &str, exit_code: i32, stderr: &str) -> &Self {
        self.push(prefix, Reply::Output(CommandOutput::failure(exit_code, stderr)))
    }

    /// Outcome for guarded commands starting with `prefix`
    pub fn guarded(&self, prefix: &str, outcome: WaitOutcome) -> &Self {
        self.push(prefix, Reply::Outcome(outcome))
    }

    /// Guarded commands starting with `prefix` are cut short by a shutdown
    pub fn interrupted(&self, prefix: &str) -> &Self {
        self.push(prefix, Reply::Interrupted)
    }

    /// Every command line seen so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }

    fn answer(&self, line: &str) -> Option<Reply> {
        self.calls.lock().unwrap().push(line.to_string());
        let rules = self.rules.lock().unwrap();
        rules
            .iter()
            .find(|r| line.starts_with(&r.prefix))
            .map(|r| r.reply.clone())
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let mut argv = vec![program.to_string()];
        argv.extend_from_slice(args);
        match self.answer(&shell_join(&argv)) {
            Some(Reply::Output(out)) => Ok(out),
            Some(Reply::Outcome(WaitOutcome::Exited(0))) | None => Ok(CommandOutput::success("")),
            Some(Reply::Outcome(_)) | Some(Reply::Interrupted) => Ok(CommandOutput::failure(1, "")),
        }
    }

    async fn run_guarded(
        &self,
        argv: &[String],
        _timeout_secs: u64,
    ) -> Result<WaitOutcome, TimeoutError> {
        if argv.is_empty() {
            return Err(TimeoutError::EmptyCommand);
        }
        let line = shell_join(argv);
        match self.answer(&line) {
            Some(Reply::Outcome(outcome)) => Ok(outcome),
            Some(Reply::Interrupted) => Err(TimeoutError::Interrupted { command: line }),
            Some(Reply::Output(out)) => Ok(WaitOutcome::Exited(out.exit_code.unwrap_or(1))),
            None => Ok(WaitOutcome::Exited(0)),
        }
    }
}
