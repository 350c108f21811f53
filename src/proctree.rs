//! Process-tree inspection and termination via /proc.
//!
//! A session's shell can spawn arbitrary descendants (agents, build tools,
//! watchers). Destroying a session must take the whole tree down, deepest
//! descendants first, so nothing keeps consuming compute or holding file
//! locks after the session is gone.

use std::collections::HashMap;
use std::path::Path;

/// Read the parent PID of `pid` from `/proc/<pid>/stat`. None if the
/// process is gone or the stat line is malformed.
fn parent_of(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Field 4 is ppid; the comm field (2) may contain spaces and is
    // parenthesized, so split after the closing paren.
    let rest = stat.rsplit_once(')')?.1;
    rest.split_whitespace().nth(1)?.parse().ok()
}

/// Read the comm name of `pid` from `/proc/<pid>/comm`.
pub fn comm_of(pid: u32) -> Option<String> {
    std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .ok()
        .map(|s| s.trim_end().to_string())
}

/// Snapshot the pid -> ppid table for all live processes.
fn pid_table() -> HashMap<u32, u32> {
    let mut table = HashMap::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return table;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if let Some(ppid) = parent_of(pid) {
            table.insert(pid, ppid);
        }
    }
    table
}

/// All descendants of `root`, ordered deepest-first.
///
/// The snapshot is taken once; processes forked mid-walk can be missed,
/// which is why callers signal the process group as well.
pub fn descendants_deepest_first(root: u32) -> Vec<u32> {
    let table = pid_table();

    // children index
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (&pid, &ppid) in &table {
        children.entry(ppid).or_default().push(pid);
    }

    // BFS from root records depth order; reversing yields deepest-first.
    let mut ordered = Vec::new();
    let mut queue = std::collections::VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                ordered.push(kid);
                queue.push_back(kid);
            }
        }
    }
    ordered.reverse();
    ordered
}

/// Send `signal` to a single PID. PID 0 and out-of-range values are
/// refused rather than signaled.
fn signal_pid(pid: u32, signal: i32) {
    if pid == 0 || pid > i32::MAX as u32 {
        tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
        return;
    }
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as i32, signal);
    }
}

/// Kill the full process tree rooted at `root`: descendants deepest-first,
/// then the root itself, then the root's process group as a sweep for
/// anything forked during the walk.
pub fn kill_tree(root: u32) {
    let descendants = descendants_deepest_first(root);
    tracing::debug!(root, count = descendants.len(), "killing process tree");
    for pid in descendants {
        signal_pid(pid, libc::SIGKILL);
    }
    signal_pid(root, libc::SIGKILL);
    // portable_pty spawns the child via setsid(), so the root leads its
    // own process group.
    if root != 0 && root <= i32::MAX as u32 {
        #[cfg(unix)]
        unsafe {
            libc::kill(-(root as i32), libc::SIGKILL);
        }
    }
}

/// Find the first descendant of `root` whose comm name matches one of
/// `agent_names`, searching shallowest-first so the agent the shell
/// launched directly wins over its own children.
pub fn find_agent(root: u32, agent_names: &[String]) -> Option<u32> {
    let mut shallowest_first = descendants_deepest_first(root);
    shallowest_first.reverse();
    shallowest_first.into_iter().find(|&pid| {
        comm_of(pid)
            .map(|comm| agent_names.iter().any(|n| n == &comm))
            .unwrap_or(false)
    })
}

/// Kill only the identifiable agent process within `root`'s tree,
/// leaving the shell alive. Returns the killed PID if one was found.
pub fn kill_agent(root: u32, agent_names: &[String]) -> Option<u32> {
    let agent = find_agent(root, agent_names)?;
    // Take the agent's own subtree down with it.
    for pid in descendants_deepest_first(agent) {
        signal_pid(pid, libc::SIGKILL);
    }
    signal_pid(agent, libc::SIGKILL);
    tracing::info!(root, agent, "killed foreground agent");
    Some(agent)
}

/// True if `/proc/<pid>` still exists.
pub fn is_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}
