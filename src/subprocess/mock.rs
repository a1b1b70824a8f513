//! Scripted stand-in for `crictl`, `kubectl` and scanner commands
//!
//! Rules are checked in the order they were registered; the first rule whose
//! program and argument matcher accept a command answers it. Every command is
//! recorded whether or not a rule matched.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::error::ProcessError;
use super::runner::{ExitStatus, ProcessCommand, ProcessOutput, ProcessRunner};

type ArgsMatcher = Box<dyn Fn(&[String]) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct MockProcessRunner {
    rules: Arc<Mutex<Vec<Rule>>>,
    calls: Arc<Mutex<Vec<ProcessCommand>>>,
}

enum Reply {
    Output(ProcessOutput),
    Timeout(Duration),
}

struct Rule {
    program: String,
    matcher: Option<ArgsMatcher>,
    reply: Reply,
    used: usize,
    limit: Option<usize>,
}

impl Rule {
    fn accepts(&self, command: &ProcessCommand) -> bool {
        self.program == command.program
            && self.matcher.as_ref().map_or(true, |m| m(&command.args))
    }
}

/// Builder for one rule; nothing is registered until [`finish`](Self::finish)
pub struct MockCommandConfig {
    runner: MockProcessRunner,
    rule: Rule,
}

impl MockProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_command(&self, program: &str) -> MockCommandConfig {
        MockCommandConfig {
            runner: self.clone(),
            rule: Rule {
                program: program.to_string(),
                matcher: None,
                reply: Reply::Output(output(ExitStatus::Success, "", "")),
                used: 0,
                limit: None,
            },
        }
    }

    /// Whether `program` ran exactly `times` times
    pub fn verify_called(&self, program: &str, times: usize) -> bool {
        self.calls_lock()
            .iter()
            .filter(|cmd| cmd.program == program)
            .count()
            == times
    }

    pub fn get_call_history(&self) -> Vec<ProcessCommand> {
        self.calls_lock().clone()
    }

    fn rules_lock(&self) -> MutexGuard<'_, Vec<Rule>> {
        self.rules.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn calls_lock(&self) -> MutexGuard<'_, Vec<ProcessCommand>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn output(status: ExitStatus, stdout: &str, stderr: &str) -> ProcessOutput {
    ProcessOutput {
        status,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        duration: Duration::ZERO,
    }
}

#[async_trait]
impl ProcessRunner for MockProcessRunner {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        self.calls_lock().push(command.clone());

        let mut rules = self.rules_lock();
        let Some(rule) = rules.iter_mut().find(|rule| rule.accepts(&command)) else {
            return Err(ProcessError::MockExpectationNotMet(format!(
                "no rule for {}",
                command.display()
            )));
        };

        rule.used += 1;
        if let Some(limit) = rule.limit.filter(|limit| rule.used > *limit) {
            return Err(ProcessError::MockExpectationNotMet(format!(
                "{} ran {} times, allowed {}",
                command.program, rule.used, limit
            )));
        }

        match &rule.reply {
            Reply::Output(out) => Ok(out.clone()),
            Reply::Timeout(after) => Err(ProcessError::Timeout(*after)),
        }
    }
}

impl MockCommandConfig {
    pub fn with_args<F>(mut self, matcher: F) -> Self
    where
        F: Fn(&[String]) -> bool + Send + Sync + 'static,
    {
        self.rule.matcher = Some(Box::new(matcher));
        self
    }

    /// Match commands carrying `word` anywhere in their arguments, e.g. the
    /// `crictl` subcommand behind an exec prefix
    pub fn with_subcommand(self, word: &str) -> Self {
        let word = word.to_string();
        self.with_args(move |args| args.iter().any(|a| *a == word))
    }

    pub fn returns_stdout(mut self, stdout: &str) -> Self {
        if let Reply::Output(out) = &mut self.rule.reply {
            out.stdout = stdout.to_string();
        }
        self
    }

    pub fn returns_stderr(mut self, stderr: &str) -> Self {
        if let Reply::Output(out) = &mut self.rule.reply {
            out.stderr = stderr.to_string();
        }
        self
    }

    pub fn returns_exit_code(mut self, code: i32) -> Self {
        if let Reply::Output(out) = &mut self.rule.reply {
            out.status = match code {
                0 => ExitStatus::Success,
                code => ExitStatus::Error(code),
            };
        }
        self
    }

    /// Answer with [`ProcessError::Timeout`] as if the command overran
    pub fn times_out_after(mut self, after: Duration) -> Self {
        self.rule.reply = Reply::Timeout(after);
        self
    }

    pub fn times(mut self, n: usize) -> Self {
        self.rule.limit = Some(n);
        self
    }

    pub fn finish(self) {
        self.runner.rules_lock().push(self.rule);
    }
}
