use std::collections::HashMap;

use ph_core::config::Config;
use ph_session::process_tree::{self, ProcessTable};
use serde_json::json;

/// Run the `tree` subcommand.
pub fn run(config: &Config, pid: u32, kill: bool, json_output: bool) -> anyhow::Result<()> {
    if kill {
        let killed = process_tree::kill_tree(pid, config.teardown.tree_kill_passes)?;
        if json_output {
            println!("{}", json!({ "root": pid, "killed": killed }));
        } else {
            println!("killed {} process(es): {killed:?}", killed.len());
        }
        return Ok(());
    }

    let table = ProcessTable::snapshot()?;
    if table.get(pid).is_none() {
        anyhow::bail!("no process with pid {pid}");
    }
    if json_output {
        let rows: Vec<_> = table
            .subtree(pid)
            .into_iter()
            .filter_map(|p| table.get(p))
            .map(|e| json!({ "pid": e.pid, "ppid": e.ppid, "state": format!("{:?}", e.state) }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        print!("{}", render(&table, pid));
    }
    Ok(())
}

/// Indented tree, one process per line.
fn render(table: &ProcessTable, root: u32) -> String {
    let children = table.children_map();
    let mut out = String::new();
    let mut stack = vec![(root, 0usize)];
    let mut seen = std::collections::HashSet::new();
    while let Some((pid, depth)) = stack.pop() {
        if !seen.insert(pid) {
            continue;
        }
        let state = table
            .get(pid)
            .map(|e| format!("{:?}", e.state))
            .unwrap_or_else(|| "?".into());
        out.push_str(&format!("{}{pid} {state}\n", "  ".repeat(depth)));
        push_children(&children, pid, depth + 1, &mut stack);
    }
    out
}

fn push_children(
    children: &HashMap<u32, Vec<u32>>,
    pid: u32,
    depth: usize,
    stack: &mut Vec<(u32, usize)>,
) {
    if let Some(kids) = children.get(&pid) {
        let mut kids = kids.clone();
        kids.sort_unstable_by(|a, b| b.cmp(a));
        stack.extend(kids.into_iter().filter(|k| *k != pid).map(|k| (k, depth)));
    }
}
