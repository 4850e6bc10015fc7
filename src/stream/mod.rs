//! Build event streaming.
//!
//! The builder produces events; implementations of [`StreamConsumer`] absorb
//! them. The production implementation is [`StreamServer`], which serialises
//! every event into the current build's transcript and fans the bytes out to
//! connected TCP clients.

pub mod server;
pub mod transcript;

pub use server::StreamServer;
pub use transcript::Transcript;

use crate::build::BuildResult;
use crate::subprocess::ExitStatus;

/// Sink for build and command events.
///
/// Every call is thread-safe and synchronous. An implementation may block
/// briefly (it takes its own lock) but must not perform network I/O on the
/// caller's thread.
pub trait StreamConsumer: Send + Sync {
    fn new_build(&self, build_id: u32);

    fn new_command(&self, cmd_id: u32, command: &str);

    fn write_stdout(&self, cmd_id: u32, bytes: &[u8]);

    fn write_stderr(&self, cmd_id: u32, bytes: &[u8]);

    fn end_command(&self, cmd_id: u32, status: ExitStatus);

    fn end_build(&self, result: BuildResult);

    /// A cache layer produced this output without running its rule.
    fn cache_retrieve(&self, path: &str);
}
