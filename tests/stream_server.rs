//! Integration tests for the transcript stream server: real TCP clients
//! against a live poll loop, driven through the producer-side consumer API.

use std::io::Read;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use falcon::build::BuildResult;
use falcon::stream::{StreamConsumer, StreamServer};
use falcon::subprocess::ExitStatus;

struct Fixture {
    server: Arc<StreamServer>,
    thread: Option<std::thread::JoinHandle<()>>,
    addr: std::net::SocketAddr,
}

impl Fixture {
    fn new() -> Self {
        let server = Arc::new(StreamServer::bind(0).expect("bind stream server"));
        let addr = server.local_addr().expect("local addr");
        let thread = {
            let server = Arc::clone(&server);
            std::thread::spawn(move || server.run())
        };
        Self {
            server,
            thread: Some(thread),
            addr,
        }
    }

    fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).expect("connect stream client")
    }

    /// Connect and wait until at least one transcript byte has arrived,
    /// proving the server attached this client to the current build.
    fn connect_attached(&self) -> (TcpStream, Vec<u8>) {
        let mut client = self.connect();
        let mut first = [0u8; 1];
        client.read_exact(&mut first).expect("first byte");
        (client, first.to_vec())
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.server.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn read_to_close(mut client: TcpStream, mut prefix: Vec<u8>) -> serde_json::Value {
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    client.read_to_end(&mut prefix).expect("read transcript");
    serde_json::from_slice(&prefix).expect("transcript parses as JSON")
}

#[test]
fn client_before_any_build_waits_for_the_first_transcript() {
    let fixture = Fixture::new();
    let client = fixture.connect();
    // Let the poll loop accept and park the client with no build to read.
    std::thread::sleep(Duration::from_millis(100));

    fixture.server.new_build(7);
    fixture.server.new_command(0, "true");
    fixture.server.end_command(0, ExitStatus::Succeeded);
    fixture.server.end_build(BuildResult::Succeeded);

    let value = read_to_close(client, Vec::new());
    assert_eq!(value["id"], 7);
    let cmds = value["cmds"].as_array().unwrap();
    assert_eq!(cmds.len(), 2);
    assert_eq!(cmds[0]["cmd"], "true");
    assert_eq!(cmds[1]["status"], "SUCCEEDED");
    assert_eq!(value["result"], "SUCCEEDED");
}

#[test]
fn mid_build_client_sees_the_whole_prefix() {
    let fixture = Fixture::new();

    fixture.server.new_build(0);
    fixture.server.new_command(0, "echo one");
    fixture.server.write_stdout(0, b"one\n");
    fixture.server.end_command(0, ExitStatus::Succeeded);
    fixture.server.new_command(1, "echo two");
    fixture.server.end_command(1, ExitStatus::Succeeded);

    // Late client: two commands already completed, build still running.
    let (client, prefix) = fixture.connect_attached();

    fixture.server.new_command(2, "echo three");
    fixture.server.end_command(2, ExitStatus::Failed);
    fixture.server.end_build(BuildResult::Failed);

    let value = read_to_close(client, prefix);
    assert_eq!(value["id"], 0);
    let cmds = value["cmds"].as_array().unwrap();
    assert_eq!(cmds.len(), 6);
    assert_eq!(cmds[0]["cmd"], "echo one");
    assert_eq!(cmds[1]["stdout"], "one\n");
    assert_eq!(cmds[5]["status"], "FAILED");
    assert_eq!(value["result"], "FAILED");
}

#[test]
fn client_between_builds_gets_the_completed_transcript_then_eof() {
    let fixture = Fixture::new();

    fixture.server.new_build(0);
    fixture.server.new_command(0, "true");
    fixture.server.end_command(0, ExitStatus::Succeeded);
    fixture.server.end_build(BuildResult::Succeeded);

    // Connects after endBuild(0), before any newBuild(1).
    let client = fixture.connect();
    let value = read_to_close(client, Vec::new());
    assert_eq!(value["id"], 0);
    assert_eq!(value["result"], "SUCCEEDED");
}

#[test]
fn consecutive_builds_hand_off_cleanly() {
    let fixture = Fixture::new();

    fixture.server.new_build(0);
    fixture.server.new_command(0, "first");
    let (client, prefix) = fixture.connect_attached();
    fixture.server.end_command(0, ExitStatus::Succeeded);
    fixture.server.end_build(BuildResult::Succeeded);

    // The reader of build 0 is closed at end-of-transcript, never seeing
    // anything of build 1.
    let value = read_to_close(client, prefix);
    assert_eq!(value["id"], 0);

    fixture.server.new_build(1);
    fixture.server.new_command(0, "second");
    fixture.server.end_command(0, ExitStatus::Succeeded);
    fixture.server.end_build(BuildResult::Succeeded);

    let value = read_to_close(fixture.connect(), Vec::new());
    assert_eq!(value["id"], 1);
    assert_eq!(value["cmds"].as_array().unwrap().len(), 2);
    assert_eq!(value["cmds"][0]["cmd"], "second");
}

#[test]
fn several_clients_receive_identical_bytes() {
    let fixture = Fixture::new();

    fixture.server.new_build(0);
    fixture.server.new_command(0, "shared");
    let (early, early_prefix) = fixture.connect_attached();
    fixture.server.write_stdout(0, b"payload\n");
    let (late, late_prefix) = fixture.connect_attached();
    fixture.server.end_command(0, ExitStatus::Succeeded);
    fixture.server.end_build(BuildResult::Succeeded);

    let mut early_bytes = early_prefix;
    let mut late_bytes = late_prefix;
    let mut early = early;
    let mut late = late;
    early.read_to_end(&mut early_bytes).unwrap();
    late.read_to_end(&mut late_bytes).unwrap();
    assert_eq!(early_bytes, late_bytes);
}

#[test]
fn slow_client_never_blocks_the_producer() {
    let fixture = Fixture::new();

    fixture.server.new_build(0);
    fixture.server.new_command(0, "spam");
    let (client, prefix) = fixture.connect_attached();

    // Append far more than a socket buffer while the client reads nothing;
    // every producer call must return without waiting on the socket.
    let chunk = vec![b'x'; 4096];
    let started = std::time::Instant::now();
    for _ in 0..1024 {
        fixture.server.write_stdout(0, &chunk);
    }
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "producer stalled on a slow client"
    );
    fixture.server.end_command(0, ExitStatus::Succeeded);
    fixture.server.end_build(BuildResult::Succeeded);

    let value = read_to_close(client, prefix);
    let stdout_len: usize = value["cmds"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["stdout"].as_str())
        .map(|s| s.len())
        .sum();
    assert_eq!(stdout_len, 4096 * 1024);
}

#[test]
fn output_chunks_escape_into_valid_json() {
    let fixture = Fixture::new();

    fixture.server.new_build(0);
    fixture.server.new_command(0, "sh -c 'echo \"hi\"'");
    fixture.server.write_stdout(0, b"line one\nwith \"quotes\" and \\slashes\\\n");
    fixture.server.end_command(0, ExitStatus::Succeeded);
    fixture.server.end_build(BuildResult::Succeeded);

    let value = read_to_close(fixture.connect(), Vec::new());
    assert_eq!(value["cmds"][0]["cmd"], "sh -c 'echo \"hi\"'");
    assert_eq!(
        value["cmds"][1]["stdout"],
        "line one\nwith \"quotes\" and \\slashes\\\n"
    );
}

#[test]
fn disconnected_client_is_dropped_without_fuss() {
    let fixture = Fixture::new();

    fixture.server.new_build(0);
    fixture.server.new_command(0, "noisy");
    let (client, _prefix) = fixture.connect_attached();
    drop(client);

    // Keep producing; the server notices the dead socket on the next send.
    for _ in 0..64 {
        fixture.server.write_stdout(0, &[b'y'; 1024]);
    }
    fixture.server.end_command(0, ExitStatus::Succeeded);
    fixture.server.end_build(BuildResult::Succeeded);

    // A fresh client still gets the whole transcript.
    let value = read_to_close(fixture.connect(), Vec::new());
    assert_eq!(value["result"], "SUCCEEDED");
}
