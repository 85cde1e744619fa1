// Scripted Runner
// In-process CommandRunner double that records invocations and replays canned results

use super::command::{CommandError, CommandOutput, CommandRunner, Invocation};

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;

type Handler = Box<dyn Fn(&Invocation) -> Result<CommandOutput, CommandError> + Send + Sync>;

/// Runner whose responses are scripted per program name.
///
/// Programs without a handler succeed with empty output. Every tool is
/// reported as installed unless listed with [`ScriptedRunner::missing`].
pub struct ScriptedRunner {
    handlers: Vec<(String, Handler)>,
    missing: HashSet<String>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            missing: HashSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn on<F>(mut self, program: &str, handler: F) -> Self
    where
        F: Fn(&Invocation) -> Result<CommandOutput, CommandError> + Send + Sync + 'static,
    {
        self.handlers.push((program.to_string(), Box::new(handler)));
        self
    }

    pub fn missing(mut self, program: &str) -> Self {
        self.missing.insert(program.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<Invocation> {
        self.calls()
            .into_iter()
            .filter(|inv| inv.program == program)
            .collect()
    }
}

#[async_trait::async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
        self.calls.lock().unwrap().push(invocation.clone());
        match self
            .handlers
            .iter()
            .find(|(program, _)| *program == invocation.program)
        {
            Some((_, handler)) => handler(invocation),
            None => Ok(CommandOutput::default()),
        }
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        if self.missing.contains(program) {
            None
        } else {
            Some(PathBuf::from("/usr/bin").join(program))
        }
    }
}

pub fn ok(stdout: &str) -> Result<CommandOutput, CommandError> {
    Ok(CommandOutput::with_stdout(stdout))
}

pub fn fail(invocation: &Invocation, stderr: &str) -> Result<CommandOutput, CommandError> {
    Err(CommandError::Failed {
        command: invocation.command_line(),
        exit_code: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
    })
}
