//! Process tree termination backed by the `sysinfo` process table.

use std::collections::{HashMap, HashSet};
use std::io;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, Signal, System};

fn process_table() -> System {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::nothing());
    system
}

/// Collect `root` and all of its live descendants, parents before children.
fn collect_tree(system: &System, root: Pid) -> Vec<Pid> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in system.processes() {
        // Linux lists threads as tasks of their owner; they die with it.
        if process.thread_kind().is_some() {
            continue;
        }
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let mut seen = HashSet::from([root]);
    let mut order = vec![root];
    let mut cursor = 0;
    while cursor < order.len() {
        if let Some(kids) = children.get(&order[cursor]) {
            for kid in kids {
                if seen.insert(*kid) {
                    order.push(*kid);
                }
            }
        }
        cursor += 1;
    }
    order
}

/// List the pids of every live descendant of `pid` (not including `pid`).
pub fn descendants_of(pid: u32) -> Vec<u32> {
    let system = process_table();
    let root = Pid::from_u32(pid);
    if system.process(root).is_none() {
        return Vec::new();
    }
    collect_tree(&system, root)
        .into_iter()
        .skip(1)
        .map(|p| p.as_u32())
        .collect()
}

/// Terminate `pid` and every process it spawned, deepest children first.
///
/// Returns how many processes were signalled. A pid that is not running
/// anymore is not an error: the call returns `Ok(0)`.
pub fn kill_tree(pid: u32) -> io::Result<usize> {
    let system = process_table();
    let root = Pid::from_u32(pid);
    if system.process(root).is_none() {
        return Ok(0);
    }

    let mut signalled = 0;
    let mut root_failed = false;
    for target in collect_tree(&system, root).into_iter().rev() {
        let Some(process) = system.process(target) else {
            continue;
        };
        // `Signal::Term` is unsupported on Windows, fall back to a hard kill there.
        let delivered = process.kill_with(Signal::Term).unwrap_or_else(|| process.kill());
        if delivered {
            signalled += 1;
        } else if target == root {
            root_failed = true;
        }
    }

    if root_failed {
        // The root may have exited between the snapshot and the signal.
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[root]),
            true,
            ProcessRefreshKind::nothing(),
        );
        if system.process(root).is_some() {
            return Err(io::Error::other(format!(
                "failed to deliver termination signal to process {pid}"
            )));
        }
    }

    Ok(signalled)
}
