use std::io::Write;

use falcon::cli::{self, Cli, Module};
use falcon::config::Config;
use falcon::daemon::run::{daemonize, run_daemon};
use falcon::db::BuildRecords;
use falcon::graph::{check, parser, printers, scan, Graph};
use falcon::telemetry;

fn main() {
    let cli = cli::parse_from(std::env::args_os());
    if let Err(err) = run(cli) {
        eprintln!("falcon: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> falcon::Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    // Detach before telemetry starts its writer thread; threads do not
    // survive the fork.
    if cli.daemon && cli.module.is_none() && !daemonize()? {
        // Launcher side of the double fork: nothing left to do.
        return Ok(());
    }
    let _telemetry_guard = telemetry::init(&config.log_level, config.log_dir.as_deref());

    let working_dir = config.working_directory()?;
    std::fs::create_dir_all(config.falcon_dir()?)?;

    // Parse, check and scan the graph before anything else; a bad graph
    // means the daemon never starts.
    let mut graph = parser::parse_file(&config.graph_file()?)?;
    check::check_cycles(&graph)?;
    let records = BuildRecords::load(&config.state_file()?)?;
    scan::scan(&mut graph, &records, &working_dir)?;

    if let Some(module) = cli.module {
        return print_module(&graph, module);
    }

    run_daemon(&config, graph)
}

fn print_module(graph: &Graph, module: Module) -> falcon::Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match module {
        Module::Dot => printers::write_graphviz(graph, &mut out)?,
        Module::Make => printers::write_makefile(graph, &mut out)?,
        Module::Help => {
            writeln!(out, "list of available modules:")?;
            writeln!(out, "  dot    show the graph in DOT format")?;
            writeln!(out, "  make   show the graph in Makefile format")?;
        }
    }
    Ok(())
}
