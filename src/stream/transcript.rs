//! Per-build transcript buffers.
//!
//! Each build accumulates one append-only byte buffer which, once the build
//! ends, parses as a single JSON object:
//!
//! ```json
//! {
//!   "id": 0,
//!   "cmds": [
//!     { "id": 0, "cmd": "cc -c a.c" },
//!     { "id": 0, "stdout": "..." },
//!     { "id": 0, "status": "SUCCEEDED" }
//!   ],
//!   "result": "SUCCEEDED"
//! }
//! ```
//!
//! Clients read a byte-for-byte prefix of this buffer; bytes are never
//! rewritten once appended.

use crate::build::BuildResult;
use crate::subprocess::ExitStatus;

/// Escape a byte chunk for embedding in a JSON string: `"` and `\` are
/// backslashed, newline becomes `\n`, everything else passes through.
pub fn escape_json_into(buf: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        match b {
            b'"' | b'\\' => {
                buf.push(b'\\');
                buf.push(b);
            }
            b'\n' => buf.extend_from_slice(b"\\n"),
            _ => buf.push(b),
        }
    }
}

/// One build's transcript, plus the bookkeeping the stream server needs to
/// retain and garbage-collect it.
#[derive(Debug)]
pub struct Transcript {
    id: u32,
    buf: Vec<u8>,
    first_chunk: bool,
    completed: bool,
    refcount: usize,
}

impl Transcript {
    /// Open the object and the `cmds` array.
    pub fn new(id: u32) -> Self {
        let mut transcript = Self {
            id,
            buf: Vec::new(),
            first_chunk: true,
            completed: false,
            refcount: 0,
        };
        transcript
            .buf
            .extend_from_slice(format!("{{\n  \"id\": {id},\n  \"cmds\": [\n").as_bytes());
        transcript
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    pub fn completed(&self) -> bool {
        self.completed
    }

    pub fn refcount(&self) -> usize {
        self.refcount
    }

    pub fn acquire(&mut self) {
        self.refcount += 1;
    }

    pub fn release(&mut self) {
        debug_assert!(self.refcount > 0, "refcount underflow");
        self.refcount -= 1;
    }

    /// `,\n` between events; elided for the first entry of `cmds`.
    fn separator(&mut self) {
        if self.first_chunk {
            self.first_chunk = false;
        } else {
            self.buf.extend_from_slice(b",\n");
        }
    }

    pub fn push_command(&mut self, cmd_id: u32, command: &str) {
        debug_assert!(!self.completed);
        self.separator();
        self.buf
            .extend_from_slice(format!("    {{ \"id\": {cmd_id}, \"cmd\": \"").as_bytes());
        escape_json_into(&mut self.buf, command.as_bytes());
        self.buf.extend_from_slice(b"\" }");
    }

    pub fn push_output(&mut self, cmd_id: u32, bytes: &[u8], is_stdout: bool) {
        debug_assert!(!self.completed);
        // Output only ever follows the command event that opened the array.
        debug_assert!(!self.first_chunk);
        self.buf.extend_from_slice(b",\n");
        let stream = if is_stdout { "stdout" } else { "stderr" };
        self.buf
            .extend_from_slice(format!("    {{ \"id\": {cmd_id}, \"{stream}\": \"").as_bytes());
        escape_json_into(&mut self.buf, bytes);
        self.buf.extend_from_slice(b"\" }");
    }

    pub fn push_status(&mut self, cmd_id: u32, status: ExitStatus) {
        debug_assert!(!self.completed);
        debug_assert!(!self.first_chunk);
        self.buf.extend_from_slice(b",\n");
        self.buf.extend_from_slice(
            format!(
                "    {{ \"id\": {cmd_id}, \"status\": \"{}\" }}",
                status.as_str()
            )
            .as_bytes(),
        );
    }

    pub fn push_cache(&mut self, path: &str) {
        debug_assert!(!self.completed);
        self.separator();
        self.buf.extend_from_slice(b"    { \"cache\": \"");
        escape_json_into(&mut self.buf, path.as_bytes());
        self.buf.extend_from_slice(b"\" }");
    }

    /// Close the `cmds` array and the object. The caller flips `completed`
    /// after flushing waiters, mirroring the producer-side ordering.
    pub fn push_trailer(&mut self, result: BuildResult) {
        debug_assert!(!self.completed);
        self.buf.extend_from_slice(
            format!("\n  ],\n  \"result\": \"{}\"\n}}\n", result.as_str()).as_bytes(),
        );
    }

    pub fn set_completed(&mut self) {
        self.completed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_json(transcript: &Transcript) -> serde_json::Value {
        serde_json::from_slice(transcript.buf()).expect("transcript must be valid JSON")
    }

    #[test]
    fn empty_build_is_valid_json_with_empty_cmds() {
        let mut t = Transcript::new(0);
        t.push_trailer(BuildResult::Succeeded);
        t.set_completed();

        let value = as_json(&t);
        assert_eq!(value["id"], 0);
        assert_eq!(value["cmds"].as_array().unwrap().len(), 0);
        assert_eq!(value["result"], "SUCCEEDED");
    }

    #[test]
    fn failing_command_produces_ordered_events() {
        let mut t = Transcript::new(3);
        t.push_command(0, "sh -c 'echo hi; echo bye 1>&2; exit 2'");
        t.push_output(0, b"hi\n", true);
        t.push_output(0, b"bye\n", false);
        t.push_status(0, ExitStatus::Failed);
        t.push_trailer(BuildResult::Failed);
        t.set_completed();

        let value = as_json(&t);
        assert_eq!(value["id"], 3);
        let cmds = value["cmds"].as_array().unwrap();
        assert_eq!(cmds.len(), 4);
        assert_eq!(cmds[0]["cmd"], "sh -c 'echo hi; echo bye 1>&2; exit 2'");
        assert_eq!(cmds[1]["stdout"], "hi\n");
        assert_eq!(cmds[2]["stderr"], "bye\n");
        assert_eq!(cmds[3]["status"], "FAILED");
        assert_eq!(value["result"], "FAILED");
    }

    #[test]
    fn escaping_round_trips_through_a_json_parser() {
        let nasty = "a \"quoted\" \\ backslash\nnewline";
        let mut t = Transcript::new(0);
        t.push_command(0, nasty);
        t.push_trailer(BuildResult::Succeeded);

        let value = as_json(&t);
        assert_eq!(value["cmds"][0]["cmd"], nasty);
    }

    #[test]
    fn cache_events_carry_no_id() {
        let mut t = Transcript::new(0);
        t.push_cache("out/lib.a");
        t.push_command(0, "link");
        t.push_status(0, ExitStatus::Succeeded);
        t.push_trailer(BuildResult::Succeeded);

        let value = as_json(&t);
        let cmds = value["cmds"].as_array().unwrap();
        assert_eq!(cmds.len(), 3);
        assert_eq!(cmds[0]["cache"], "out/lib.a");
        assert!(cmds[0].get("id").is_none());
        assert_eq!(cmds[1]["id"], 0);
    }

    #[test]
    fn cmds_length_matches_command_plus_cache_events() {
        let mut t = Transcript::new(1);
        t.push_command(0, "a");
        t.push_status(0, ExitStatus::Succeeded);
        t.push_cache("b");
        t.push_command(1, "c");
        t.push_status(1, ExitStatus::Succeeded);
        t.push_trailer(BuildResult::Succeeded);

        let value = as_json(&t);
        // Command, cache and status events all land in `cmds`; the consumers
        // that index by command id tolerate entries without one.
        assert_eq!(value["cmds"].as_array().unwrap().len(), 5);
        assert_eq!(value["result"], "SUCCEEDED");
    }

    #[test]
    fn buffer_is_append_only() {
        let mut t = Transcript::new(0);
        let before = t.buf().to_vec();
        t.push_command(0, "cmd");
        assert_eq!(&t.buf()[..before.len()], &before[..]);
        let mid = t.buf().to_vec();
        t.push_status(0, ExitStatus::Succeeded);
        t.push_trailer(BuildResult::Succeeded);
        assert_eq!(&t.buf()[..mid.len()], &mid[..]);
    }

    #[test]
    fn raw_escape_helper_handles_every_special_byte() {
        let mut buf = Vec::new();
        escape_json_into(&mut buf, b"\"\\\n plain");
        assert_eq!(buf, b"\\\"\\\\\\n plain");
    }
}
