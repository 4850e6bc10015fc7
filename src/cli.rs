//! Launcher surface.
//!
//! `falcon` either starts the daemon (optionally detached) or, with
//! `--module`, prints the graph in one of the supported formats and exits.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "falcon",
    version,
    about = "Falcon build daemon",
    long_about = "Watches a declarative dependency graph, rebuilds what is stale, and \
                  streams each build's transcript to connected observers."
)]
pub struct Cli {
    /// Daemonize the build system (double-fork and detach).
    #[arg(short = 'd', long)]
    pub daemon: bool,

    /// Falcon configuration file.
    #[arg(short = 'f', long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Print the graph with the given module and exit (`-M help` for the list).
    #[arg(short = 'M', long, value_name = "MODULE")]
    pub module: Option<Module>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Module {
    /// Show the graph in DOT format.
    Dot,
    /// Show the graph in Makefile format.
    Make,
    /// List the available modules.
    Help,
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::parse_from(args)
}
