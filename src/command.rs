use camino::Utf8PathBuf;
use serde::Serialize;
use std::fmt::{Display, Formatter, Result as FmtResult};

/// How the captured stdout of a task is interpreted.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub enum ResultType {
    /// Parse stdout as a JSON document.
    Json,
    /// Keep stdout verbatim.
    Text,
    /// Do not capture stdout at all.
    #[default]
    Discard,
}

/// When the captured stdout is echoed to the console.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub enum ResultShowType {
    /// Only available via the accumulated results after the run.
    AfterRun,
    /// Echoed as soon as the task finishes.
    #[default]
    Immediate,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskParams {
    /// Working directory for the child. Empty means inherit.
    pub cwd: Utf8PathBuf,
    /// Environment for the child. Empty means inherit.
    pub env: Vec<(String, String)>,
    /// Wall-clock seconds after which the task is force-terminated. 0 disables.
    pub timeout: u64,
    /// Path to which the child's stderr is appended. Empty means discard.
    pub error_log: Utf8PathBuf,
    pub result_type: ResultType,
    pub result_show_type: ResultShowType,
}

/// An immutable description of one child process to launch: the verbatim
/// shell command line plus its parameters. The command line is never
/// tokenized; it is handed to the shell as-is.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskCommand {
    command_line: String,
    params: TaskParams,
}

impl TaskCommand {
    pub fn new(command_line: impl AsRef<str>) -> Self {
        Self {
            command_line: command_line.as_ref().into(),
            params: TaskParams::default(),
        }
    }

    pub fn with_params(command_line: impl AsRef<str>, params: TaskParams) -> Self {
        Self {
            command_line: command_line.as_ref().into(),
            params,
        }
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn params(&self) -> &TaskParams {
        &self.params
    }
}

impl Display for TaskCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.command_line)
    }
}

impl From<&str> for TaskCommand {
    fn from(command_line: &str) -> Self {
        Self::new(command_line)
    }
}

impl From<String> for TaskCommand {
    fn from(command_line: String) -> Self {
        Self::new(command_line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let command = TaskCommand::new("echo hi");
        assert_eq!(command.command_line(), "echo hi");
        assert_eq!(
            command.params(),
            &TaskParams {
                cwd: Utf8PathBuf::new(),
                env: vec![],
                timeout: 0,
                error_log: Utf8PathBuf::new(),
                result_type: ResultType::Discard,
                result_show_type: ResultShowType::Immediate,
            }
        );
    }

    #[test]
    fn with_params() {
        let command = TaskCommand::with_params(
            "ls -l",
            TaskParams {
                cwd: "/tmp".into(),
                env: vec![("KEY".into(), "value".into())],
                timeout: 5,
                error_log: "/tmp/err.log".into(),
                result_type: ResultType::Text,
                result_show_type: ResultShowType::AfterRun,
            },
        );
        assert_eq!(command.params().timeout, 5);
        assert_eq!(command.params().cwd, Utf8PathBuf::from("/tmp"));
        assert_eq!(command.params().result_type, ResultType::Text);
    }

    #[test]
    fn fmt() {
        assert_eq!(format!("{}", TaskCommand::new("sleep 1")), "sleep 1");
    }

    #[test]
    fn from_string() {
        assert_eq!(
            TaskCommand::from(String::from("echo hi")),
            TaskCommand::new("echo hi")
        );
    }
}
