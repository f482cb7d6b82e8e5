//! Process tree traversal

use std::collections::{HashMap, VecDeque};

/// All descendants of `root`, parents before children.
#[cfg(unix)]
pub fn find_all_descendants(root: u32) -> Vec<u32> {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::All, true);

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent.as_u32()).or_default().push(pid.as_u32());
        }
    }

    let mut result = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                // pid reuse can in theory produce a cycle
                if kid != root && !result.contains(&kid) {
                    result.push(kid);
                    queue.push_back(kid);
                }
            }
        }
    }
    result
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_finds_spawned_child() {
        let mut child = std::process::Command::new("/bin/sleep")
            .arg("5")
            .spawn()
            .unwrap();
        let descendants = find_all_descendants(std::process::id());
        assert!(descendants.contains(&child.id()));
        child.kill().unwrap();
        child.wait().unwrap();
    }
}
