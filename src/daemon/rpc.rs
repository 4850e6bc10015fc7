//! RPC protocol and server.
//!
//! Newline-delimited JSON over TCP. Requests are tagged by `op`:
//!
//! ```json
//! {"op": "start_build"}
//! {"op": "set_dirty", "target": "src/a.c"}
//! ```
//!
//! Responses are `{"ok": ...}` or `{"err": {"code": "...", "message": "..."}}`.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::{CommandError, DaemonInstance, StartBuildResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Start building every root; BUSY while a build is in flight.
    StartBuild,
    /// IDLE or BUILDING.
    Status,
    /// Source nodes currently out-of-date.
    DirtySources,
    /// Mark one node (and its transitive parents) out-of-date.
    SetDirty { target: String },
    /// Interrupt the in-flight build; idempotent.
    Interrupt,
    /// Graphviz dump of the graph.
    Graphviz,
    /// Interrupt, stop the stream server, exit.
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Response {
    #[serde(rename = "ok")]
    Ok(ResponsePayload),
    #[serde(rename = "err")]
    Err(ErrorBody),
}

impl Response {
    fn err(error: &CommandError) -> Self {
        Response::Err(ErrorBody {
            code: error.code().to_string(),
            message: error.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ResponsePayload {
    Status { status: String },
    Sources { sources: Vec<String> },
    Graphviz { graphviz: String },
    Empty,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Map one request onto the daemon's command surface.
pub fn dispatch(daemon: &DaemonInstance, request: Request) -> Response {
    match request {
        Request::StartBuild => match daemon.start_build() {
            StartBuildResult::Ok => Response::Ok(ResponsePayload::Status {
                status: "OK".to_string(),
            }),
            StartBuildResult::Busy => Response::err(&CommandError::Busy),
        },
        Request::Status => Response::Ok(ResponsePayload::Status {
            status: daemon.status().as_str().to_string(),
        }),
        Request::DirtySources => Response::Ok(ResponsePayload::Sources {
            sources: daemon.dirty_sources(),
        }),
        Request::SetDirty { target } => match daemon.set_dirty(&target) {
            Ok(()) => Response::Ok(ResponsePayload::Empty),
            Err(err) => Response::err(&err),
        },
        Request::Interrupt => {
            daemon.interrupt_build();
            Response::Ok(ResponsePayload::Empty)
        }
        Request::Graphviz => Response::Ok(ResponsePayload::Graphviz {
            graphviz: daemon.graphviz(),
        }),
        Request::Shutdown => {
            daemon.shutdown();
            Response::Ok(ResponsePayload::Empty)
        }
    }
}

/// Accept loop. Non-blocking so the shutdown flag is observed within 100ms;
/// each accepted connection gets a blocking handler thread.
pub fn serve(daemon: Arc<DaemonInstance>, listener: TcpListener) -> std::io::Result<()> {
    listener.set_nonblocking(true)?;
    loop {
        if daemon.is_shutdown() {
            return Ok(());
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "rpc client connected");
                let daemon = Arc::clone(&daemon);
                std::thread::spawn(move || handle_client(stream, daemon));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => {
                error!(%err, "rpc accept failed");
                return Err(err);
            }
        }
    }
}

fn handle_client(stream: TcpStream, daemon: Arc<DaemonInstance>) {
    if stream.set_nonblocking(false).is_err() {
        return;
    }
    let Ok(reader) = stream.try_clone() else {
        return;
    };
    let mut writer = stream;
    let reader = BufReader::new(reader);

    for line in reader.lines() {
        let Ok(line) = line else {
            return;
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(&daemon, request),
            Err(err) => Response::err(&CommandError::Malformed(err.to_string())),
        };
        let Ok(encoded) = serde_json::to_string(&response) else {
            return;
        };
        if writeln!(writer, "{encoded}").is_err() {
            return;
        }
        if daemon.is_shutdown() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_round_trip_as_tagged_json() {
        let encoded = serde_json::to_string(&Request::SetDirty {
            target: "a.c".into(),
        })
        .unwrap();
        assert_eq!(encoded, r#"{"op":"set_dirty","target":"a.c"}"#);
        let decoded: Request = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            decoded,
            Request::SetDirty {
                target: "a.c".into()
            }
        );

        assert_eq!(
            serde_json::to_string(&Request::StartBuild).unwrap(),
            r#"{"op":"start_build"}"#
        );
    }

    #[test]
    fn ok_responses_use_the_ok_envelope() {
        let response = Response::Ok(ResponsePayload::Status {
            status: "IDLE".into(),
        });
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"ok":{"status":"IDLE"}}"#
        );
    }

    #[test]
    fn errors_carry_code_and_message() {
        let response = Response::err(&CommandError::TargetNotFound("x".into()));
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&response).unwrap()).unwrap();
        assert_eq!(value["err"]["code"], "TARGET_NOT_FOUND");
        assert!(value["err"]["message"].as_str().unwrap().contains('x'));
    }

    #[test]
    fn busy_maps_to_the_busy_code() {
        let response = Response::err(&CommandError::Busy);
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&response).unwrap()).unwrap();
        assert_eq!(value["err"]["code"], "BUSY");
    }
}
