use crate::command::{ResultType, TaskCommand};
use crate::termination::kill_process_tree;

use anyhow::{Context, Result as AnyhowResult};
use camino::Utf8Path;
use log::debug;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Read};
use std::os::fd::AsRawFd;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::Instant;
use sysinfo::Pid;

/// Snapshot of a child's state, refreshed only by [`Task::poll`].
#[derive(Clone, Debug, Serialize)]
pub struct TaskStatus {
    pub pid: u32,
    pub running: bool,
    pub exit_code: Option<i32>,
    pub command: String,
    /// Seconds since launch, recomputed on every poll.
    pub elapsed: f64,
}

/// A live child process launched from a [`TaskCommand`]: the OS handle, the
/// child's stdout pipe (non-blocking) and the cached status snapshot. Owned
/// and driven exclusively by the scheduler's tick.
pub struct Task {
    command: TaskCommand,
    child: Child,
    stdout: Option<ChildStdout>,
    started_at: Instant,
    status: TaskStatus,
    closed: bool,
}

impl Task {
    /// Launches the command under `sh -c` with the configured working
    /// directory, environment and stderr routing. A spawn failure leaves no
    /// half-live handle behind.
    pub fn spawn(task_command: TaskCommand) -> AnyhowResult<Task> {
        let params = task_command.params();
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(task_command.command_line())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(stderr_target(&params.error_log)?);
        if !params.cwd.as_str().is_empty() {
            command.current_dir(&params.cwd);
        }
        command.envs(params.env.iter().map(|(key, value)| (key, value)));

        let mut child = command.spawn().context(format!(
            "Failed to spawn `{}`",
            task_command.command_line()
        ))?;
        // The child must observe EOF on stdin, so the write end is dropped
        // right away.
        drop(child.stdin.take());
        let stdout = child.stdout.take();
        if let Some(stdout) = &stdout {
            if let Err(error) = set_nonblocking(stdout) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(error).context(format!(
                    "Failed to make stdout pipe of `{}` non-blocking",
                    task_command.command_line()
                ));
            }
        }

        let pid = child.id();
        debug!("Spawned task {pid}: `{task_command}`");
        Ok(Task {
            status: TaskStatus {
                pid,
                running: true,
                exit_code: None,
                command: task_command.command_line().into(),
                elapsed: 0.0,
            },
            command: task_command,
            child,
            stdout,
            started_at: Instant::now(),
            closed: false,
        })
    }

    /// Refreshes the status snapshot. Idempotent and cheap; a child that
    /// vanished reads as not running.
    pub fn poll(&mut self) {
        self.status.elapsed = self.started_at.elapsed().as_secs_f64();
        if self.closed {
            self.status.running = false;
            return;
        }
        match self.child.try_wait() {
            Ok(Some(exit_status)) => {
                self.status.running = false;
                self.status.exit_code = exit_status.code();
            }
            Ok(None) => {
                self.status.running = true;
            }
            Err(error) => {
                debug!("Failed to query status of task {}: {error}", self.status.pid);
                self.status.running = false;
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.status.running
    }

    pub fn is_timeout(&self) -> bool {
        let timeout = self.command.params().timeout;
        timeout > 0 && self.status.elapsed >= timeout as f64
    }

    pub fn status(&self) -> &TaskStatus {
        &self.status
    }

    pub fn command(&self) -> &TaskCommand {
        &self.command
    }

    /// Drains the currently available stdout bytes. Returns `None` for
    /// discarded results and after the pipe has already been drained; partial
    /// reads are legal since the pipe is non-blocking.
    pub fn take_output(&mut self) -> Option<String> {
        if self.command.params().result_type == ResultType::Discard {
            return None;
        }
        let mut stdout = self.stdout.take()?;
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            match stdout.read(&mut chunk) {
                Ok(0) => break,
                Ok(count) => buffer.extend_from_slice(&chunk[..count]),
                Err(error) if error.kind() == ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => {
                    debug!("Failed to read stdout of task {}: {error}", self.status.pid);
                    break;
                }
            }
        }
        Some(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Reaps the child. Safe to call more than once; only the first call
    /// waits.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(error) = self.child.wait() {
            debug!("Failed to reap task {}: {error}", self.status.pid);
        }
    }

    /// Kills the child's entire process tree, then reaps it. No-op on an
    /// already closed handle.
    pub fn terminate(&mut self) {
        if self.closed {
            return;
        }
        debug!("Killing task {}: `{}`", self.status.pid, self.command);
        kill_process_tree(&Pid::from_u32(self.status.pid));
        self.close();
    }
}

fn stderr_target(error_log: &Utf8Path) -> AnyhowResult<Stdio> {
    if error_log.as_str().is_empty() {
        return Ok(Stdio::null());
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(error_log)
        .context(format!("Failed to open {error_log} for stderr capturing"))?;
    Ok(Stdio::from(file))
}

fn set_nonblocking(stdout: &ChildStdout) -> std::io::Result<()> {
    let fd = stdout.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::TaskParams;
    use std::thread::sleep;
    use std::time::Duration;

    fn poll_until_finished(task: &mut Task) {
        loop {
            task.poll();
            if !task.is_running() {
                return;
            }
            sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn capture_stdout() -> AnyhowResult<()> {
        let mut task = Task::spawn(TaskCommand::with_params(
            "echo hello",
            TaskParams {
                result_type: ResultType::Text,
                ..Default::default()
            },
        ))?;
        poll_until_finished(&mut task);
        assert_eq!(task.take_output().as_deref(), Some("hello\n"));
        assert_eq!(task.take_output(), None);
        assert_eq!(task.status().exit_code, Some(0));
        task.close();
        task.close();
        task.terminate();
        Ok(())
    }

    #[test]
    fn discarded_result_yields_no_output() -> AnyhowResult<()> {
        let mut task = Task::spawn(TaskCommand::new("echo hello"))?;
        poll_until_finished(&mut task);
        assert_eq!(task.take_output(), None);
        task.close();
        Ok(())
    }

    #[test]
    fn nonzero_exit_code_is_polled() -> AnyhowResult<()> {
        let mut task = Task::spawn(TaskCommand::new("exit 3"))?;
        poll_until_finished(&mut task);
        assert_eq!(task.status().exit_code, Some(3));
        task.close();
        Ok(())
    }

    #[test]
    fn repeated_polls_return_equal_snapshots() -> AnyhowResult<()> {
        let mut task = Task::spawn(TaskCommand::new("echo hello"))?;
        poll_until_finished(&mut task);
        let first_running = task.is_running();
        let first_exit_code = task.status().exit_code;
        task.poll();
        assert_eq!(task.is_running(), first_running);
        assert_eq!(task.status().exit_code, first_exit_code);
        task.close();
        Ok(())
    }

    #[test]
    fn timeout_disabled_by_default() -> AnyhowResult<()> {
        let mut task = Task::spawn(TaskCommand::new("echo hello"))?;
        task.poll();
        assert!(!task.is_timeout());
        poll_until_finished(&mut task);
        task.close();
        Ok(())
    }

    #[test]
    fn spawn_failure_on_missing_cwd() {
        let spawned = Task::spawn(TaskCommand::with_params(
            "echo hello",
            TaskParams {
                cwd: "/nonexistent/directory".into(),
                ..Default::default()
            },
        ));
        assert!(spawned.is_err());
    }

    #[test]
    fn stderr_is_appended_to_error_log() -> AnyhowResult<()> {
        let dir = tempfile::tempdir()?;
        let error_log = dir.path().join("err.log");
        let params = TaskParams {
            error_log: error_log.to_str().unwrap().into(),
            ..Default::default()
        };
        for _ in 0..2 {
            let mut task = Task::spawn(TaskCommand::with_params(
                "echo oops >&2",
                params.clone(),
            ))?;
            poll_until_finished(&mut task);
            task.close();
        }
        assert_eq!(std::fs::read_to_string(&error_log)?, "oops\noops\n");
        Ok(())
    }

    #[test]
    fn environment_is_passed_to_the_child() -> AnyhowResult<()> {
        let mut task = Task::spawn(TaskCommand::with_params(
            "echo $GREETING",
            TaskParams {
                env: vec![("GREETING".into(), "hi there".into())],
                result_type: ResultType::Text,
                ..Default::default()
            },
        ))?;
        poll_until_finished(&mut task);
        assert_eq!(task.take_output().as_deref(), Some("hi there\n"));
        task.close();
        Ok(())
    }
}
