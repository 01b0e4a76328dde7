//! Closed set of request commands the bridge routes on
//!
//! Commands the bridge does not interpret map to `Command::Other` and are
//! forwarded with their arguments untouched.

use std::fmt;

/// A client request command
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    Initialize,
    Launch,
    Attach,
    BreakpointLocations,
    SetBreakpoints,
    ConfigurationDone,
    Disconnect,
    Terminate,
    StackTrace,
    Scopes,
    Variables,
    Evaluate,
    SetVariable,
    Threads,
    Continue,
    Next,
    StepIn,
    StepOut,
    Pause,
    TerminateThreads,
    RestartFrame,
    Other(String),
}

impl Command {
    pub fn parse(command: &str) -> Self {
        match command {
            "initialize" => Self::Initialize,
            "launch" => Self::Launch,
            "attach" => Self::Attach,
            "breakpointLocations" => Self::BreakpointLocations,
            "setBreakpoints" => Self::SetBreakpoints,
            "configurationDone" => Self::ConfigurationDone,
            "disconnect" => Self::Disconnect,
            "terminate" => Self::Terminate,
            "stackTrace" => Self::StackTrace,
            "scopes" => Self::Scopes,
            "variables" => Self::Variables,
            "evaluate" => Self::Evaluate,
            "setVariable" => Self::SetVariable,
            "threads" => Self::Threads,
            "continue" => Self::Continue,
            "next" => Self::Next,
            "stepIn" => Self::StepIn,
            "stepOut" => Self::StepOut,
            "pause" => Self::Pause,
            "terminateThreads" => Self::TerminateThreads,
            "restartFrame" => Self::RestartFrame,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Initialize => "initialize",
            Self::Launch => "launch",
            Self::Attach => "attach",
            Self::BreakpointLocations => "breakpointLocations",
            Self::SetBreakpoints => "setBreakpoints",
            Self::ConfigurationDone => "configurationDone",
            Self::Disconnect => "disconnect",
            Self::Terminate => "terminate",
            Self::StackTrace => "stackTrace",
            Self::Scopes => "scopes",
            Self::Variables => "variables",
            Self::Evaluate => "evaluate",
            Self::SetVariable => "setVariable",
            Self::Threads => "threads",
            Self::Continue => "continue",
            Self::Next => "next",
            Self::StepIn => "stepIn",
            Self::StepOut => "stepOut",
            Self::Pause => "pause",
            Self::TerminateThreads => "terminateThreads",
            Self::RestartFrame => "restartFrame",
            Self::Other(name) => name,
        }
    }

    /// Stepping and inspection commands owned by whichever backend last stopped
    pub fn is_interactive(&self) -> bool {
        matches!(
            self,
            Self::StackTrace
                | Self::Scopes
                | Self::Variables
                | Self::Evaluate
                | Self::SetVariable
                | Self::Threads
                | Self::Continue
                | Self::Next
                | Self::StepIn
                | Self::StepOut
                | Self::Pause
                | Self::TerminateThreads
                | Self::RestartFrame
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
