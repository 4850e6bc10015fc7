//! The daemon instance: owns the graph, the stream server and the builder,
//! and exposes the command surface the RPC layer drives.

pub mod rpc;
pub mod run;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{info, warn};

use crate::build::sequential::SequentialBuilder;
use crate::build::{BuildResult, GraphBuilder};
use crate::config::Config;
use crate::db::BuildRecords;
use crate::graph::{printers, Graph, NodeState};
use crate::stream::{StreamConsumer, StreamServer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartBuildResult {
    Ok,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Idle,
    Building,
}

impl DaemonStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DaemonStatus::Idle => "IDLE",
            DaemonStatus::Building => "BUILDING",
        }
    }
}

/// In-band command failures, reported as RPC error responses.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("a build is already in progress")]
    Busy,

    #[error("target '{0}' not found")]
    TargetNotFound(String),

    #[error("malformed request: {0}")]
    Malformed(String),
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::Busy => "BUSY",
            CommandError::TargetNotFound(_) => "TARGET_NOT_FOUND",
            CommandError::Malformed(_) => "MALFORMED",
        }
    }
}

pub struct DaemonInstance {
    graph: Arc<Mutex<Graph>>,
    stream: Arc<StreamServer>,
    working_dir: PathBuf,
    state_file: PathBuf,
    building: Arc<AtomicBool>,
    build_id: Arc<AtomicU32>,
    builder: Mutex<Option<GraphBuilder>>,
    /// Externally visible request flag; also set by signal handlers.
    shutdown: Arc<AtomicBool>,
    /// Guards the wind-down itself, which must run exactly once.
    stopped: AtomicBool,
}

impl DaemonInstance {
    pub fn new(
        config: &Config,
        graph: Graph,
        stream: Arc<StreamServer>,
    ) -> crate::Result<Self> {
        Ok(Self {
            graph: Arc::new(Mutex::new(graph)),
            stream,
            working_dir: config.working_directory()?,
            state_file: config.state_file()?,
            building: Arc::new(AtomicBool::new(false)),
            build_id: Arc::new(AtomicU32::new(0)),
            builder: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
        })
    }

    /// The flag the RPC accept loop and the signal handlers share.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Kick off a build of every root. `Busy` while one is in flight.
    pub fn start_build(&self) -> StartBuildResult {
        if self.building.swap(true, Ordering::SeqCst) {
            return StartBuildResult::Busy;
        }

        let build_id = self.build_id.load(Ordering::SeqCst);
        info!(build_id, "starting build");
        self.stream.new_build(build_id);

        let targets = self.graph.lock().expect("graph lock").roots();
        let builder = SequentialBuilder::start(
            Arc::clone(&self.graph),
            self.working_dir.clone(),
            Arc::clone(&self.stream) as Arc<dyn StreamConsumer>,
            targets,
            self.completion_callback(),
        );
        *self.builder.lock().expect("builder lock") = Some(GraphBuilder::Sequential(builder));

        StartBuildResult::Ok
    }

    /// Runs on the builder thread once the traversal is done: persist the
    /// build records and flip the daemon back to idle.
    fn completion_callback(&self) -> Box<dyn FnOnce(BuildResult) + Send> {
        let graph = Arc::clone(&self.graph);
        let state_file = self.state_file.clone();
        let building = Arc::clone(&self.building);
        let build_id = Arc::clone(&self.build_id);
        Box::new(move |result| {
            if result == BuildResult::Succeeded {
                let records = {
                    let graph = graph.lock().expect("graph lock");
                    BuildRecords::snapshot(&graph)
                };
                if let Err(err) = records.store(&state_file) {
                    warn!(%err, "failed to persist build records");
                }
            }
            build_id.fetch_add(1, Ordering::SeqCst);
            building.store(false, Ordering::SeqCst);
            info!(result = result.as_str(), "build completed");
        })
    }

    pub fn status(&self) -> DaemonStatus {
        if self.building.load(Ordering::SeqCst) {
            DaemonStatus::Building
        } else {
            DaemonStatus::Idle
        }
    }

    /// Idempotent; a no-op when no build is running.
    pub fn interrupt_build(&self) {
        if let Some(builder) = self.builder.lock().expect("builder lock").as_ref() {
            builder.interrupt();
        }
    }

    /// Block until the in-flight build (if any) completes.
    pub fn wait_for_build(&self) {
        if let Some(builder) = self.builder.lock().expect("builder lock").as_mut() {
            builder.wait();
        }
    }

    /// Snapshot of the source nodes currently out-of-date.
    pub fn dirty_sources(&self) -> Vec<String> {
        let graph = self.graph.lock().expect("graph lock");
        let mut sources: Vec<String> = graph
            .sources()
            .into_iter()
            .filter(|&id| graph.node(id).state() == NodeState::OutOfDate)
            .map(|id| graph.node(id).path().to_string())
            .collect();
        sources.sort();
        sources
    }

    pub fn set_dirty(&self, target: &str) -> Result<(), CommandError> {
        let mut graph = self.graph.lock().expect("graph lock");
        let Some(id) = graph.lookup(target) else {
            return Err(CommandError::TargetNotFound(target.to_string()));
        };
        graph.mark_dirty(id);
        Ok(())
    }

    /// Graphviz dump of the whole graph; holds the graph lock for the
    /// duration of the serialisation.
    pub fn graphviz(&self) -> String {
        let graph = self.graph.lock().expect("graph lock");
        printers::graphviz_string(&graph)
    }

    /// Interrupt any build, stop the stream server, release the RPC loop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down");
        self.interrupt_build();
        self.wait_for_build();
        self.stream.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daemon_with(graph: Graph, dir: &std::path::Path) -> Arc<DaemonInstance> {
        let config = Config {
            working_directory: Some(dir.to_path_buf()),
            ..Config::default()
        };
        let stream = Arc::new(StreamServer::bind(0).unwrap());
        Arc::new(DaemonInstance::new(&config, graph, stream).unwrap())
    }

    fn sample_graph() -> Graph {
        let mut g = Graph::new();
        let a_c = g.node_id("a.c");
        let a_o = g.node_id("a.o");
        g.add_rule(vec![a_c], vec![a_o], "cp a.c a.o".into(), None)
            .unwrap();
        g
    }

    #[test]
    fn set_dirty_unknown_target_fails() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_with(sample_graph(), dir.path());
        assert!(matches!(
            daemon.set_dirty("nope"),
            Err(CommandError::TargetNotFound(_))
        ));
    }

    #[test]
    fn set_dirty_marks_and_reports_sources() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_with(sample_graph(), dir.path());

        assert!(daemon.dirty_sources().is_empty());
        daemon.set_dirty("a.c").unwrap();
        assert_eq!(daemon.dirty_sources(), vec!["a.c".to_string()]);
    }

    #[test]
    fn second_start_build_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.c"), "x").unwrap();

        // A build slow enough to observe BUSY.
        let mut slow = Graph::new();
        let input = slow.node_id("a.c");
        let out = slow.node_id("a.o");
        slow.add_rule(vec![input], vec![out], "sleep 5".into(), None)
            .unwrap();
        slow.mark_dirty(input);
        let daemon = daemon_with(slow, dir.path());

        assert_eq!(daemon.start_build(), StartBuildResult::Ok);
        assert_eq!(daemon.status(), DaemonStatus::Building);
        assert_eq!(daemon.start_build(), StartBuildResult::Busy);

        daemon.interrupt_build();
        daemon.wait_for_build();
        assert_eq!(daemon.status(), DaemonStatus::Idle);
    }

    #[test]
    fn interrupt_without_build_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_with(sample_graph(), dir.path());
        daemon.interrupt_build();
        assert_eq!(daemon.status(), DaemonStatus::Idle);
    }

    #[test]
    fn graphviz_renders_under_the_graph_lock() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon_with(sample_graph(), dir.path());
        let dot = daemon.graphviz();
        assert!(dot.contains("digraph falcon"));
        assert!(dot.contains("a.o"));
    }
}
