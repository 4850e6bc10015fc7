//! Daemon wiring.
//!
//! Three long-lived threads: the RPC accept loop (this thread), the stream
//! server's poll loop, and, while a build is in flight, the builder. SIGTERM
//! and SIGINT flip the same shutdown flag the `shutdown` RPC does.

use std::net::TcpListener;
use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::daemon::{rpc, DaemonInstance};
use crate::graph::Graph;
use crate::stream::StreamServer;

/// Run the daemon in the current process. Returns once a shutdown has been
/// requested and every subsystem has wound down.
pub fn run_daemon(config: &Config, graph: Graph) -> crate::Result<()> {
    let stream = Arc::new(StreamServer::bind(config.stream_port)?);
    let daemon = Arc::new(DaemonInstance::new(config, graph, Arc::clone(&stream))?);

    // Graceful shutdown on the usual signals.
    let shutdown = daemon.shutdown_flag();
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown));

    let stream_thread = {
        let stream = Arc::clone(&stream);
        std::thread::spawn(move || stream.run())
    };

    let listener = TcpListener::bind(("0.0.0.0", config.api_port))?;
    info!(
        api_port = config.api_port,
        stream_port = config.stream_port,
        "daemon listening"
    );
    rpc::serve(Arc::clone(&daemon), listener)?;

    // Reached via the shutdown RPC or a signal; either way, make sure the
    // builder and stream server are stopped before joining.
    daemon.shutdown();
    let _ = stream_thread.join();
    info!("daemon stopped");
    Ok(())
}

/// Detach from the launching shell: double fork with a `setsid` in between.
/// Returns `false` in the processes that should simply exit, `true` in the
/// daemon itself.
pub fn daemonize() -> std::io::Result<bool> {
    unsafe {
        match libc::fork() {
            -1 => return Err(std::io::Error::last_os_error()),
            0 => {}
            _ => return Ok(false),
        }
        libc::setsid();
        match libc::fork() {
            -1 => return Err(std::io::Error::last_os_error()),
            0 => {}
            _ => libc::_exit(0),
        }
    }
    Ok(true)
}
