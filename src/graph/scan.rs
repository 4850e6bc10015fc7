//! Initial dependency scan.
//!
//! Runs once at start-up, before the daemon accepts commands: stats every
//! node, compares the world on disk against the persisted records of the
//! previous build, and dirties what changed. Propagation does the rest. A
//! missing source is a dirty signal, not an error.

use std::path::Path;

use tracing::debug;

use crate::db::BuildRecords;
use crate::graph::{depfile, Graph, RuleId, Timestamp};

/// Stat `path` relative to `working_dir`; 0 means missing.
fn stamp(working_dir: &Path, path: &str) -> std::io::Result<Timestamp> {
    let full = working_dir.join(path);
    match std::fs::metadata(&full) {
        Ok(meta) => Ok(meta
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err),
    }
}

/// Scan the graph, setting node timestamps and the initial dirty set.
pub fn scan(
    graph: &mut Graph,
    records: &BuildRecords,
    working_dir: &Path,
) -> std::io::Result<()> {
    for id in graph.node_ids().collect::<Vec<_>>() {
        let mtime = stamp(working_dir, graph.node(id).path())?;
        graph.node_mut(id).update_timestamp(mtime);
    }

    // Sources: dirty when missing, unrecorded, or modified since last build.
    for id in graph.sources() {
        let node = graph.node(id);
        let unchanged =
            node.timestamp() != 0 && records.source_timestamp(node.path()) == Some(node.timestamp());
        if !unchanged {
            debug!(source = node.path(), "source changed");
            graph.mark_dirty(id);
        }
    }

    // Rules: compare inputs (plus depfile implicit deps) and outputs against
    // the rule's recorded command and timestamp. Phony rules have no on-disk
    // footprint; dirty inputs reach them through propagation alone.
    for id in graph.rule_ids().collect::<Vec<_>>() {
        if graph.rule(id).is_phony() {
            continue;
        }
        if rule_is_dirty(graph, records, working_dir, id)? {
            graph.mark_rule_dirty(id);
        }
    }

    Ok(())
}

fn rule_is_dirty(
    graph: &Graph,
    records: &BuildRecords,
    working_dir: &Path,
    id: RuleId,
) -> std::io::Result<bool> {
    let rule = graph.rule(id);
    let first_output = graph.node(rule.outputs()[0]).path();

    // Never ran, or the command line changed since it last ran.
    let Some(record) = records.rule_record(first_output) else {
        debug!(rule = first_output, "no record");
        return Ok(true);
    };
    if record.command != rule.command() {
        debug!(rule = first_output, "command changed");
        return Ok(true);
    }

    let mut newest_input: Timestamp = 0;
    for &input in rule.inputs() {
        let node = graph.node(input);
        if node.timestamp() == 0 {
            debug!(rule = first_output, input = node.path(), "input missing");
            return Ok(true);
        }
        newest_input = newest_input.max(node.timestamp());
    }

    // Implicit dependencies from the depfile fold into the input set. The
    // depfile itself only exists after a first successful run.
    if let Some(depfile_path) = rule.depfile() {
        if let Ok(contents) = std::fs::read_to_string(working_dir.join(depfile_path)) {
            for dep in depfile::all_prereqs(&contents) {
                let mtime = stamp(working_dir, &dep)?;
                if mtime == 0 {
                    debug!(rule = first_output, dep = %dep, "implicit dep missing");
                    return Ok(true);
                }
                newest_input = newest_input.max(mtime);
            }
        }
    }

    if newest_input > record.timestamp {
        debug!(rule = first_output, "input newer than last run");
        return Ok(true);
    }

    for &output in rule.outputs() {
        let node = graph.node(output);
        if node.timestamp() == 0 || node.timestamp() < newest_input {
            debug!(rule = first_output, output = node.path(), "output stale");
            return Ok(true);
        }
    }

    Ok(false)
}
