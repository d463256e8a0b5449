use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Once, OnceLock};
use std::thread::{sleep, spawn};
use std::time::Duration;
use sysinfo::{Pid, Process, ProcessesToUpdate, System};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("Cancelled")]
pub struct Cancelled;

static PROCESS_TOKEN: OnceLock<CancellationToken> = OnceLock::new();
static ARM_HANDLERS: Once = Once::new();
static SIGUSR1_RECEIVED: AtomicBool = AtomicBool::new(false);

/// Arms the process-wide termination handlers (SIGINT, SIGTERM, SIGUSR1) and
/// returns the token they cancel. Arming happens exactly once per process;
/// every subsequent call hands out a clone of the same token.
pub fn start_termination_control() -> Result<CancellationToken, ctrlc::Error> {
    let token = PROCESS_TOKEN.get_or_init(CancellationToken::new).clone();
    let mut outcome = Ok(());
    ARM_HANDLERS.call_once(|| outcome = arm_handlers(token.clone()));
    outcome?;
    Ok(token)
}

fn arm_handlers(token: CancellationToken) -> Result<(), ctrlc::Error> {
    // The termination feature of ctrlc covers SIGINT and SIGTERM.
    watch_ctrlc(token.clone())?;
    watch_sigusr1(token);
    Ok(())
}

fn watch_ctrlc(token: CancellationToken) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || token.cancel())
}

extern "C" fn handle_sigusr1(_signal: libc::c_int) {
    SIGUSR1_RECEIVED.store(true, Ordering::Relaxed);
}

// Only an atomic store is signal-safe, so the handler flips a flag and a
// watcher thread raises the token.
fn watch_sigusr1(token: CancellationToken) {
    use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

    let action = SigAction::new(
        SigHandler::Handler(handle_sigusr1),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    if let Err(error) = unsafe { sigaction(Signal::SIGUSR1, &action) } {
        log::error!("Failed to register signal handler for SIGUSR1: {error}");
        return;
    }
    spawn(move || {
        loop {
            if SIGUSR1_RECEIVED.load(Ordering::Relaxed) {
                token.cancel();
                return;
            }
            sleep(Duration::from_millis(250));
        }
    });
}

// This is a non-cooperative termination (SIGKILL) of the entire process tree.
// The command line runs under a shell, so terminating only the direct child
// would leave its descendants running.
pub fn kill_process_tree(top_pid: &Pid) {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    let processes = system.processes();

    match processes.get(top_pid) {
        None => return,
        Some(top_process) => top_process.kill(),
    };

    kill_all_children(top_pid, processes.iter());
}

fn kill_all_children<'a>(
    top_pid: &'a Pid,
    processes: impl Iterator<Item = (&'a Pid, &'a Process)>,
) {
    let children: Vec<ChildProcess<'a>> = processes
        .filter_map(|(pid, process)| {
            process.parent().map(|parent_pid| ChildProcess {
                pid,
                process,
                parent_pid,
            })
        })
        .filter(|child| child.process.thread_kind().is_none())
        .collect();
    let mut pids_in_tree = HashSet::from([top_pid]);

    loop {
        let current_tree_size = pids_in_tree.len();
        add_and_kill_children(&mut pids_in_tree, children.iter());
        if pids_in_tree.len() == current_tree_size {
            break;
        }
    }
}

fn add_and_kill_children<'a>(
    pids_in_tree: &mut HashSet<&'a Pid>,
    children: impl Iterator<Item = &'a ChildProcess<'a>>,
) {
    for child in children {
        if pids_in_tree.contains(&child.parent_pid) {
            pids_in_tree.insert(child.pid);
            child.process.kill();
        }
    }
}

struct ChildProcess<'a> {
    pid: &'a Pid,
    process: &'a Process,
    parent_pid: Pid,
}
