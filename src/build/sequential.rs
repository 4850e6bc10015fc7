//! The sequential builder.
//!
//! One dedicated thread per build. The traversal is post-order from the
//! requested targets: inputs build before the rule that consumes them, and
//! the first non-success latches the build result and unwinds.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{Receiver, bounded};
use tracing::{debug, info, warn};

use crate::build::BuildResult;
use crate::graph::{Graph, NodeId, NodeState, RuleId, Timestamp};
use crate::stream::StreamConsumer;
use crate::subprocess::{ExitStatus, Subprocess, SubprocessHandle};

pub type OnBuildCompleted = Box<dyn FnOnce(BuildResult) + Send>;

pub struct SequentialBuilder {
    interrupted: Arc<AtomicBool>,
    current_child: Arc<Mutex<Option<SubprocessHandle>>>,
    result: Arc<Mutex<BuildResult>>,
    done_rx: Receiver<BuildResult>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl SequentialBuilder {
    /// Launch an asynchronous build of `targets`. The builder emits
    /// `end_build` on the consumer and then invokes `on_completed`.
    pub fn start(
        graph: Arc<Mutex<Graph>>,
        working_dir: PathBuf,
        consumer: Arc<dyn StreamConsumer>,
        targets: Vec<NodeId>,
        on_completed: OnBuildCompleted,
    ) -> Self {
        let interrupted = Arc::new(AtomicBool::new(false));
        let current_child = Arc::new(Mutex::new(None));
        let result = Arc::new(Mutex::new(BuildResult::Unknown));
        let (done_tx, done_rx) = bounded(1);

        let thread = {
            let interrupted = Arc::clone(&interrupted);
            let current_child = Arc::clone(&current_child);
            let result = Arc::clone(&result);
            std::thread::spawn(move || {
                let outcome = {
                    let mut graph = graph.lock().expect("graph lock");
                    let mut traversal = Traversal {
                        graph: &mut *graph,
                        working_dir: &working_dir,
                        consumer: consumer.as_ref(),
                        interrupted: &interrupted,
                        current_child: &current_child,
                        next_cmd_id: 0,
                    };
                    traversal.build_targets(&targets)
                };
                *result.lock().expect("result lock") = outcome;
                info!(result = outcome.as_str(), "build finished");
                consumer.end_build(outcome);
                let _ = done_tx.send(outcome);
                on_completed(outcome);
            })
        };

        Self {
            interrupted,
            current_child,
            result,
            done_rx,
            thread: Some(thread),
        }
    }

    /// Ask the build to stop. The running command is signalled; the
    /// traversal unwinds with `Interrupted`.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        if let Some(handle) = self.current_child.lock().expect("child lock").as_ref() {
            handle.interrupt();
        }
    }

    /// Block until the build completes.
    pub fn wait(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.done_rx.recv();
            let _ = thread.join();
        }
    }

    pub fn result(&self) -> BuildResult {
        *self.result.lock().expect("result lock")
    }
}

impl Drop for SequentialBuilder {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct Traversal<'a> {
    graph: &'a mut Graph,
    working_dir: &'a std::path::Path,
    consumer: &'a dyn StreamConsumer,
    interrupted: &'a AtomicBool,
    current_child: &'a Mutex<Option<SubprocessHandle>>,
    next_cmd_id: u32,
}

impl Traversal<'_> {
    fn build_targets(&mut self, targets: &[NodeId]) -> BuildResult {
        for &target in targets {
            let result = self.build_node(target);
            if result != BuildResult::Succeeded {
                return result;
            }
        }
        BuildResult::Succeeded
    }

    fn build_node(&mut self, id: NodeId) -> BuildResult {
        if self.interrupted.load(Ordering::SeqCst) {
            return BuildResult::Interrupted;
        }

        let node = self.graph.node(id);
        if node.state() == NodeState::UpToDate {
            return BuildResult::Succeeded;
        }
        let Some(rule) = node.producer() else {
            // A dirty source has nothing to run; the rules above it decide.
            return BuildResult::Succeeded;
        };

        let inputs = self.graph.rule(rule).inputs().to_vec();
        for input in inputs {
            let result = self.build_node(input);
            if result != BuildResult::Succeeded {
                return result;
            }
        }

        // A sibling output may already have forced this rule to run.
        if !self.graph.rule(rule).is_dirty() {
            return BuildResult::Succeeded;
        }
        self.execute_rule(rule)
    }

    fn execute_rule(&mut self, id: RuleId) -> BuildResult {
        if self.interrupted.load(Ordering::SeqCst) {
            return BuildResult::Interrupted;
        }

        let cmd_id = self.next_cmd_id;
        self.next_cmd_id += 1;
        let command = self.graph.rule(id).command().to_string();
        self.consumer.new_command(cmd_id, &command);

        if self.graph.rule(id).is_phony() {
            self.consumer.end_command(cmd_id, ExitStatus::Succeeded);
            self.finish_outputs(id);
            return BuildResult::Succeeded;
        }

        debug!(cmd_id, command = %command, "running");
        let status = match self.run_command(cmd_id, &command) {
            Ok(status) => status,
            Err(err) => {
                warn!(cmd_id, %err, "spawn failed");
                ExitStatus::Failed
            }
        };
        self.consumer.end_command(cmd_id, status);

        match status {
            ExitStatus::Succeeded => {
                self.finish_outputs(id);
                BuildResult::Succeeded
            }
            ExitStatus::Interrupted => BuildResult::Interrupted,
            ExitStatus::Failed | ExitStatus::Unknown => BuildResult::Failed,
        }
    }

    fn run_command(&self, cmd_id: u32, command: &str) -> std::io::Result<ExitStatus> {
        let mut child = Subprocess::spawn(command, self.working_dir)?;
        *self.current_child.lock().expect("child lock") = Some(child.handle());
        // Re-check after publishing the handle: an interrupt that raced the
        // spawn must still reach this child.
        if self.interrupted.load(Ordering::SeqCst) {
            child.handle().interrupt();
        }
        let io_result = child.communicate(cmd_id, self.consumer);
        let status = child.wait();
        *self.current_child.lock().expect("child lock") = None;
        io_result?;
        Ok(status)
    }

    /// Mark every output up-to-date with a fresh timestamp.
    fn finish_outputs(&mut self, id: RuleId) {
        let outputs = self.graph.rule(id).outputs().to_vec();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        for out in outputs {
            let stamp = disk_stamp(self.working_dir, self.graph.node(out).path()).unwrap_or(now);
            self.graph.node_mut(out).update_timestamp(stamp);
            self.graph.mark_up_to_date(out);
        }
    }
}

fn disk_stamp(working_dir: &std::path::Path, path: &str) -> Option<Timestamp> {
    let meta = std::fs::metadata(working_dir.join(path)).ok()?;
    meta.modified()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .ok()
}
