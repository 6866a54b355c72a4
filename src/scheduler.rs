//! Dependency-aware subtask ordering.
//!
//! Builds a directed graph from the declared `reads`/`writes` table sets
//! of a plugin's subtasks (edge from writer to reader per shared table)
//! and returns a deterministic topological order: every subtask that
//! writes a table runs before every subtask that reads it, and subtasks
//! with no dependency relation keep their declaration order.
//!
//! This runs once per plugin at registration time. A broken plugin
//! (cycle, or a required subtask reading a table nothing produces) fails
//! there, before any task touches data.
//!
//! Pure and synchronous; safe to call repeatedly and concurrently.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::{RuntimeError, RuntimeResult};
use crate::models::SubtaskMeta;

/// Compute the execution order for a plugin's subtasks.
///
/// Ties are broken by declaration order, so the same input always yields
/// the same output.
///
/// # Errors
///
/// - [`RuntimeError::CycleDetected`] naming the subtasks on the cycle;
///   no partial order is returned.
/// - [`RuntimeError::BadInput`] when a `required` subtask reads a table
///   that no declared subtask writes. Non-required subtasks in the same
///   situation are treated as soft dependencies and schedule normally.
pub fn schedule(metas: &[SubtaskMeta]) -> RuntimeResult<Vec<SubtaskMeta>> {
    let n = metas.len();

    // Table -> declaration indexes of its writers.
    let mut writers: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, meta) in metas.iter().enumerate() {
        for table in &meta.writes {
            writers.entry(table.as_str()).or_default().push(i);
        }
    }

    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut indegree = vec![0usize; n];
    let mut seen = HashSet::new();
    for (reader, meta) in metas.iter().enumerate() {
        for table in &meta.reads {
            let Some(producers) = writers.get(table.as_str()) else {
                if meta.required {
                    return Err(RuntimeError::bad_input(format!(
                        "required subtask {} reads table {} which no subtask writes",
                        meta.name, table
                    )));
                }
                continue;
            };
            for &writer in producers {
                // Reading a table you also write is not a dependency on
                // yourself.
                if writer == reader || !seen.insert((writer, reader)) {
                    continue;
                }
                edges[writer].push(reader);
                indegree[reader] += 1;
            }
        }
    }

    // Kahn's algorithm over a declaration-indexed ready set: always
    // emitting the smallest ready index gives the deterministic
    // tie-break.
    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(&next) = ready.iter().next() {
        ready.remove(&next);
        order.push(next);
        for &reader in &edges[next] {
            indegree[reader] -= 1;
            if indegree[reader] == 0 {
                ready.insert(reader);
            }
        }
    }

    if order.len() < n {
        return Err(RuntimeError::CycleDetected {
            subtasks: trace_cycle(metas, &edges, &indegree),
        });
    }

    Ok(order.into_iter().map(|i| metas[i].clone()).collect())
}

/// Name the subtasks on a dependency cycle.
///
/// After Kahn's algorithm stalls, every leftover node still has an
/// unscheduled predecessor (that is what a nonzero indegree means), so
/// walking predecessors from any leftover node must revisit one; the
/// revisited stretch is a cycle. The walk goes backwards, so the path is
/// reversed before reporting to keep writer -> reader direction.
fn trace_cycle(metas: &[SubtaskMeta], edges: &[Vec<usize>], indegree: &[usize]) -> Vec<String> {
    let remaining: HashSet<usize> = (0..metas.len()).filter(|&i| indegree[i] > 0).collect();
    let start = *remaining.iter().min().expect("cycle implies leftover nodes");

    let predecessor = |node: usize| {
        remaining
            .iter()
            .copied()
            .find(|&candidate| edges[candidate].contains(&node))
            .expect("unscheduled node must have an unscheduled predecessor")
    };

    let mut path = Vec::new();
    let mut visited = HashMap::new();
    let mut current = start;
    loop {
        if let Some(&at) = visited.get(&current) {
            let mut cycle: Vec<usize> = path[at..].to_vec();
            cycle.reverse();
            let mut names: Vec<String> =
                cycle.into_iter().map(|i| metas[i].name.clone()).collect();
            let first = names[0].clone();
            names.push(first);
            return names;
        }
        visited.insert(current, path.len());
        path.push(current);
        current = predecessor(current);
    }
}
