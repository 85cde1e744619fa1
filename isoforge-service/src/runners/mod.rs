// Runners Module
// Command execution layer used by every externally delegated build action

pub mod command;
#[cfg(test)]
pub(crate) mod scripted;

// Re-export key types
pub use command::{CommandError, CommandOutput, CommandRunner, Invocation, SystemRunner};
