use crate::command::{ResultShowType, ResultType, TaskCommand, TaskParams};
use crate::task::Task;
use crate::termination::Cancelled;

use camino::Utf8PathBuf;
use chrono::Local;
use log::{debug, error};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TICK_INTERVAL_MICROS: u64 = 100_000;
pub const DEFAULT_IMPORT_INTERVAL: u64 = 1;
pub const DEFAULT_CONCURRENCY: usize = 1;

const BANNER_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One element produced by an import callback: either a fully parameterized
/// command or a bare command line, which is wrapped with default parameters.
pub enum ImportItem {
    Command(TaskCommand),
    Line(String),
}

impl From<TaskCommand> for ImportItem {
    fn from(command: TaskCommand) -> Self {
        Self::Command(command)
    }
}

impl From<String> for ImportItem {
    fn from(line: String) -> Self {
        Self::Line(line)
    }
}

impl From<&str> for ImportItem {
    fn from(line: &str) -> Self {
        Self::Line(line.into())
    }
}

/// A collected per-task output, shaped by the task's result type.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum TaskOutput {
    Json(Value),
    Text(String),
}

impl TaskOutput {
    fn is_empty(&self) -> bool {
        match self {
            Self::Json(value) => value.is_null(),
            Self::Text(text) => text.is_empty(),
        }
    }
}

type ImportCallback = Box<dyn FnMut() -> Vec<ImportItem>>;
type ResultCallback = Box<dyn FnMut(String) -> Option<TaskOutput>>;

/// Concurrency-bounded scheduler for external commands. Descriptors queue up
/// in `pending`, run as child processes in `pool` (at most `concurrency` at a
/// time) and leave their stdout in `results`. The tick loop polls the pool,
/// enforces per-task timeouts, asks the registered import callbacks for more
/// work and exits when nothing is left to do or the cancellation token is
/// raised.
pub struct TaskManager {
    pending: VecDeque<TaskCommand>,
    pool: BTreeMap<u64, Task>,
    admitted: HashSet<String>,
    results: Vec<TaskOutput>,
    next_task_id: u64,
    total_added: u64,
    total_finished: u64,
    concurrency: usize,
    tick_interval_micros: u64,
    import_interval: u64,
    show_log: bool,
    show_run_log: bool,
    import_callbacks: Vec<ImportCallback>,
    result_callback: Option<ResultCallback>,
    cancellation_token: CancellationToken,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            pool: BTreeMap::new(),
            admitted: HashSet::new(),
            results: vec![],
            next_task_id: 0,
            total_added: 0,
            total_finished: 0,
            concurrency: DEFAULT_CONCURRENCY,
            tick_interval_micros: DEFAULT_TICK_INTERVAL_MICROS,
            import_interval: DEFAULT_IMPORT_INTERVAL,
            show_log: false,
            show_run_log: true,
            import_callbacks: vec![],
            result_callback: None,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Queues one command with explicit parameters. Always succeeds; illegal
    /// values only surface when the task fails to launch.
    #[allow(clippy::too_many_arguments)]
    pub fn add_task(
        &mut self,
        command_line: impl AsRef<str>,
        result_type: ResultType,
        result_show_type: ResultShowType,
        timeout: u64,
        error_log: impl Into<Utf8PathBuf>,
        cwd: impl Into<Utf8PathBuf>,
        env: Vec<(String, String)>,
    ) {
        self.add_command(TaskCommand::with_params(
            command_line,
            TaskParams {
                cwd: cwd.into(),
                env,
                timeout,
                error_log: error_log.into(),
                result_type,
                result_show_type,
            },
        ));
    }

    /// Queues one prebuilt command.
    pub fn add_command(&mut self, command: TaskCommand) {
        self.pending.push_back(command);
        self.total_added += 1;
    }

    /// Registers a dynamic task source. Sources are invoked in registration
    /// order; registering the same source twice invokes it twice per import
    /// cycle.
    pub fn add_import_task_method(
        &mut self,
        callback: impl FnMut() -> Vec<ImportItem> + 'static,
    ) {
        self.import_callbacks.push(Box::new(callback));
    }

    /// Sets the result transformer applied to each captured stdout string in
    /// place of the built-in result-type handling. `None` drops the output.
    pub fn add_get_result_method(
        &mut self,
        callback: impl FnMut(String) -> Option<TaskOutput> + 'static,
    ) {
        self.result_callback = Some(Box::new(callback));
    }

    pub fn set_concurrency(&mut self, concurrency: usize) {
        self.concurrency = concurrency.max(1);
    }

    /// Sets the sleep between ticks in microseconds. Zero is coerced to one.
    pub fn set_check_time(&mut self, micros: u64) {
        self.tick_interval_micros = micros.max(1);
    }

    /// Sets the number of ticks between import-callback invocations. Zero is
    /// coerced to one.
    pub fn set_import_task_interval(&mut self, interval: u64) {
        self.import_interval = interval.max(1);
    }

    pub fn set_show_log(&mut self, show_log: bool) {
        self.show_log = show_log;
    }

    pub fn set_run_log(&mut self, run_log: bool) {
        self.show_run_log = run_log;
    }

    /// Wires the token observed at the top of every tick, typically the one
    /// returned by [`crate::termination::start_termination_control`].
    pub fn set_cancellation_token(&mut self, token: CancellationToken) {
        self.cancellation_token = token;
    }

    /// Restores the constructor defaults, including the tick interval, and
    /// drops all queued work, callbacks and counters.
    pub fn reset(&mut self) {
        self.reset_data();
        self.next_task_id = 0;
        self.total_added = 0;
        self.total_finished = 0;
        self.concurrency = DEFAULT_CONCURRENCY;
        self.tick_interval_micros = DEFAULT_TICK_INTERVAL_MICROS;
        self.import_interval = DEFAULT_IMPORT_INTERVAL;
        self.import_callbacks.clear();
        self.result_callback = None;
    }

    /// Clears pool, pending queue, dedup set and results, keeping the
    /// configuration.
    pub fn reset_data(&mut self) {
        self.pending.clear();
        self.pool.clear();
        self.admitted.clear();
        self.results.clear();
    }

    pub fn results(&self) -> &[TaskOutput] {
        &self.results
    }

    pub fn take_results(&mut self) -> Vec<TaskOutput> {
        std::mem::take(&mut self.results)
    }

    pub fn total_added(&self) -> u64 {
        self.total_added
    }

    pub fn total_finished(&self) -> u64 {
        self.total_finished
    }

    /// Drives the run to completion. `Ok(true)` if at least one task was
    /// launched, `Ok(false)` if priming found no work, `Err(Cancelled)` when
    /// the cancellation token was raised mid-run. Live children are left
    /// running on cancellation.
    pub fn run(&mut self) -> Result<bool, Cancelled> {
        self.import_tasks();
        if !self.fill_pool() {
            error!("No tasks to run, exiting");
            return Ok(false);
        }

        let mut check_count: u64 = 0;
        let mut show_log_count: u64 = 0;
        let status_every = (1_000_000 / self.tick_interval_micros * 5).max(1);
        let started = Instant::now();
        if self.show_run_log {
            println!(
                "[{}] START RUN",
                Local::now().format(BANNER_TIMESTAMP_FORMAT)
            );
        }
        self.show_status();

        loop {
            if self.cancellation_token.is_cancelled() {
                println!("\nloop end, exit");
                return Err(Cancelled);
            }
            sleep(Duration::from_micros(1));

            self.do_work();
            sleep(Duration::from_micros(self.tick_interval_micros));

            if self.import_callbacks.is_empty() {
                if self.pool.is_empty() {
                    break;
                }
            } else {
                check_count += 1;
                if self.pool.is_empty() || check_count == self.import_interval {
                    self.import_tasks();
                    check_count = 0;
                }
                if self.pool.is_empty() && !self.fill_pool() {
                    break;
                }
            }

            if show_log_count == status_every {
                self.show_status();
                show_log_count = 0;
            }
            show_log_count += 1;
        }

        if self.show_run_log {
            println!(
                "[{}] FINISHED, RUN TIME : {:.2}s",
                Local::now().format(BANNER_TIMESTAMP_FORMAT),
                started.elapsed().as_secs_f64()
            );
        }
        Ok(true)
    }

    fn show_status(&self) {
        if self.show_run_log {
            println!(
                "[{}] total => {} | finished => {}",
                Local::now().format(BANNER_TIMESTAMP_FORMAT),
                self.total_added,
                self.total_finished
            );
        }
    }

    /// One sweep over a snapshot of the pool: poll every task, force-close
    /// the timed-out ones, collect the finished ones and promote queued
    /// commands into the freed slots.
    fn do_work(&mut self) {
        for task_id in self.pool.keys().copied().collect::<Vec<_>>() {
            let Some(task) = self.pool.get_mut(&task_id) else {
                continue;
            };
            task.poll();
            if task.is_running() && !task.is_timeout() {
                continue;
            }
            let Some(mut task) = self.pool.remove(&task_id) else {
                continue;
            };

            if task.is_running() {
                let status = task.status();
                println!(
                    "task {} : {} timeout, force closed!",
                    status.pid, status.command
                );
                task.terminate();
                // Unlike the original, the counter also covers force-closed
                // tasks, so it counts every launched task exactly once.
                self.total_finished += 1;
                continue;
            }

            self.collect_output(&mut task);
            self.total_finished += 1;
            let status = task.status();
            debug!(
                "Task {} exited with code {:?} after {:.2}s",
                status.pid, status.exit_code, status.elapsed
            );
            if self.show_log {
                println!(
                    "task {} : {} is over, running {:.2}s",
                    status.pid, status.command, status.elapsed
                );
            }
            task.close();
            if let Some(command) = self.pending.pop_front() {
                self.add_to_run(command);
            }
        }
    }

    fn collect_output(&mut self, task: &mut Task) {
        let Some(raw) = task.take_output() else {
            return;
        };
        let params = task.command().params();
        let output = match &mut self.result_callback {
            Some(callback) => callback(raw),
            None => match params.result_type {
                ResultType::Json => {
                    if raw.is_empty() {
                        None
                    } else {
                        if params.result_show_type == ResultShowType::Immediate {
                            println!("{raw}");
                        }
                        match serde_json::from_str(&raw) {
                            Ok(value) => Some(TaskOutput::Json(value)),
                            Err(parse_error) => {
                                error!(
                                    "Failed to parse output of task {} as JSON: {parse_error}",
                                    task.status().pid
                                );
                                None
                            }
                        }
                    }
                }
                ResultType::Text => {
                    if params.result_show_type == ResultShowType::Immediate {
                        print!("{raw}");
                    }
                    Some(TaskOutput::Text(raw))
                }
                ResultType::Discard => None,
            },
        };
        if let Some(output) = output {
            if !output.is_empty() {
                self.results.push(output);
            }
        }
    }

    /// Promotes a command into a live task unless its command line was
    /// already admitted during this run. The dedup key is recorded even when
    /// the launch itself fails; a launch failure abandons only this command.
    fn add_to_run(&mut self, command: TaskCommand) -> bool {
        let key = command_digest(command.command_line());
        if self.admitted.contains(&key) {
            return false;
        }
        self.admitted.insert(key);
        match Task::spawn(command) {
            Ok(task) => {
                if self.show_log {
                    let status = task.status();
                    println!("Task {} : {} addToRun.", status.pid, status.command);
                }
                self.pool.insert(self.next_task_id, task);
                self.next_task_id += 1;
                true
            }
            Err(spawn_error) => {
                error!("{spawn_error:?}");
                false
            }
        }
    }

    /// Promotes from the head of the pending queue until the pool is full.
    /// Returns whether there was anything to promote.
    fn fill_pool(&mut self) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        while self.pool.len() < self.concurrency {
            let Some(command) = self.pending.pop_front() else {
                break;
            };
            self.add_to_run(command);
        }
        true
    }

    fn import_tasks(&mut self) {
        for callback in &mut self.import_callbacks {
            for item in callback() {
                let command = match item {
                    ImportItem::Command(command) => command,
                    ImportItem::Line(line) => TaskCommand::new(line),
                };
                self.pending.push_back(command);
                self.total_added += 1;
            }
        }
    }
}

fn command_digest(command_line: &str) -> String {
    format!("{:x}", Sha256::digest(command_line.as_bytes()))
}
