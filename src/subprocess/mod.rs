//! Subprocess abstraction used to reach node runtimes and the cluster API
//!
//! Everything that shells out (`crictl`, `kubectl`, external scan gates) goes
//! through [`ProcessRunner`] so it can be replaced by [`MockProcessRunner`]
//! in tests.

pub mod builder;
pub mod error;
pub mod mock;
pub mod runner;

pub use builder::ProcessCommandBuilder;
pub use error::ProcessError;
pub use mock::{MockCommandConfig, MockProcessRunner};
pub use runner::{ExitStatus, ProcessCommand, ProcessOutput, ProcessRunner, TokioProcessRunner};
