use std::time::Duration;

use crate::subprocess::ProcessCommand;

pub struct ProcessCommandBuilder {
    command: ProcessCommand,
}

impl ProcessCommandBuilder {
    pub fn new(program: &str) -> Self {
        Self {
            command: ProcessCommand {
                program: program.to_string(),
                args: Vec::new(),
                timeout: None,
            },
        }
    }

    /// Start from a configured argv template, replacing every occurrence of
    /// `placeholder` with `value`
    ///
    /// The first element becomes the program. Returns `None` for an empty
    /// template.
    pub fn from_template<S: AsRef<str>>(template: &[S], placeholder: &str, value: &str) -> Option<Self> {
        let mut parts = template
            .iter()
            .map(|part| part.as_ref().replace(placeholder, value));
        let program = parts.next()?;
        let mut builder = Self::new(&program);
        builder.command.args.extend(parts);
        Some(builder)
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.command.args.push(arg.to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.command
            .args
            .extend(args.into_iter().map(|s| s.as_ref().to_string()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.command.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> ProcessCommand {
        self.command
    }
}
