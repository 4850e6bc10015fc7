//! The build transcript stream server.
//!
//! A single dedicated thread multiplexes every connected observer over one
//! `poll` call: the listening socket for new connections, an event pipe for
//! producer-side wakeups, and every client that still has unsent transcript
//! bytes. Clients that have caught up with the current end of the transcript
//! are parked in a waiting list and not polled for writability, otherwise
//! poll would spin reporting their sockets writable forever.
//!
//! Producers (the builder thread, via the [`StreamConsumer`] impl) append
//! bytes to the front build's transcript under the server's mutex and raise
//! the event pipe; they never touch a socket. A slow client therefore never
//! blocks the build.
//!
//! Builds are refcounted by the clients reading them. A completed build is
//! garbage-collected when its last reader detaches, except for the newest
//! build, which is always retained so that a late-connecting client has a
//! transcript to attach to.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, trace};

use crate::build::BuildResult;
use crate::stream::transcript::Transcript;
use crate::stream::StreamConsumer;
use crate::subprocess::ExitStatus;

/// Cross-thread wakeup: a byte written to the pipe makes the poll loop's
/// read end readable. Level-triggered, drained once observed.
struct EventPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl EventPipe {
    fn new() -> io::Result<Self> {
        let mut fds: [libc::c_int; 2] = [0; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    fn raise(&self) {
        let byte = [1u8];
        // EAGAIN means a wakeup is already pending, which is just as good.
        unsafe {
            libc::write(self.write_fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for EventPipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

struct ClientInfo {
    stream: TcpStream,
    /// Build this client reads from; `None` until the first build starts.
    build: Option<u32>,
    /// Bytes of the transcript already sent.
    offset: usize,
    waiting: bool,
}

#[derive(Default)]
struct ServerState {
    /// Transcripts by build id; the newest id is the current build.
    builds: BTreeMap<u32, Transcript>,
    clients: HashMap<RawFd, ClientInfo>,
    /// Clients with unsent bytes; polled for writability.
    active: Vec<RawFd>,
    /// Clients that caught up; woken when a producer appends.
    waiting: Vec<RawFd>,
}

impl ServerState {
    fn front_id(&self) -> Option<u32> {
        self.builds.keys().next_back().copied()
    }

    #[cfg(debug_assertions)]
    fn check_invariants(&self) {
        let front = self.front_id();
        for (&id, build) in &self.builds {
            let readers = self
                .clients
                .values()
                .filter(|c| c.build == Some(id))
                .count();
            debug_assert_eq!(build.refcount(), readers, "refcount drift on build {id}");
            debug_assert!(
                build.completed() || Some(id) == front,
                "non-front build {id} incomplete"
            );
        }
        for (fd, client) in &self.clients {
            if let Some(id) = client.build {
                let build = self.builds.get(&id).expect("client points at live build");
                debug_assert!(
                    client.offset <= build.buf().len(),
                    "client {fd} offset past buffer"
                );
            }
        }
    }

    #[cfg(not(debug_assertions))]
    fn check_invariants(&self) {}
}

/// Outcome of pushing bytes to one client.
enum SendOutcome {
    KeepActive,
    Park,
    Close,
}

pub struct StreamServer {
    listener: TcpListener,
    event: EventPipe,
    state: Mutex<ServerState>,
    stopped: AtomicBool,
}

impl StreamServer {
    /// Bind the stream port (0 picks an ephemeral port, used by tests).
    pub fn bind(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            event: EventPipe::new()?,
            state: Mutex::new(ServerState::default()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Event loop; runs on its own thread until [`StreamServer::stop`].
    pub fn run(&self) {
        while !self.stopped.load(Ordering::SeqCst) {
            if let Err(err) = self.process_events() {
                error!(%err, "stream server poll failed");
                break;
            }
        }
        // Close every client socket; the listener closes with the server.
        let mut state = self.lock();
        state.clients.clear();
        state.active.clear();
        state.waiting.clear();
    }

    /// Ask the event loop to exit at the next iteration boundary.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.event.raise();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().expect("stream server lock")
    }

    fn process_events(&self) -> io::Result<()> {
        let mut fds = Vec::new();
        {
            let state = self.lock();
            for &fd in &state.active {
                fds.push(libc::pollfd {
                    fd,
                    events: libc::POLLOUT,
                    revents: 0,
                });
            }
        }
        fds.push(libc::pollfd {
            fd: self.listener.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        fds.push(libc::pollfd {
            fd: self.event.read_fd,
            events: libc::POLLIN,
            revents: 0,
        });

        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EINTR) => Ok(()),
                // EINVAL means too many fds; fatal for this thread.
                _ => Err(err),
            };
        }

        for pollfd in &fds {
            if pollfd.revents == 0 {
                continue;
            }
            if pollfd.fd == self.listener.as_raw_fd() {
                self.accept_clients()?;
            } else if pollfd.fd == self.event.read_fd {
                self.event.drain();
            } else {
                self.process_client(pollfd.fd);
            }
        }
        Ok(())
    }

    /// Accept every pending connection.
    fn accept_clients(&self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "stream client connected");
                    self.create_client(stream)?;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn create_client(&self, stream: TcpStream) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        let fd = stream.as_raw_fd();

        let mut state = self.lock();
        let front = state.front_id();
        let has_data = front
            .and_then(|id| state.builds.get(&id))
            .is_some_and(|b| !b.buf().is_empty());

        if has_data {
            state.active.push(fd);
        } else {
            state.waiting.push(fd);
        }
        if let Some(id) = front {
            state.builds.get_mut(&id).expect("front build").acquire();
        }
        state.clients.insert(
            fd,
            ClientInfo {
                stream,
                build: front,
                offset: 0,
                waiting: !has_data,
            },
        );
        state.check_invariants();
        Ok(())
    }

    /// Push as many bytes as the kernel accepts to one writable client.
    fn process_client(&self, fd: RawFd) {
        let mut guard = self.lock();
        let state = &mut *guard;

        let outcome = {
            let Some(info) = state.clients.get_mut(&fd) else {
                return;
            };
            debug_assert!(!info.waiting, "waiting client in the poll set");
            let build_id = info.build.expect("active client without a build");
            let transcript = state.builds.get(&build_id).expect("client's build exists");
            let buf = transcript.buf();
            debug_assert!(info.offset <= buf.len());

            let mut outcome = SendOutcome::Park;
            while info.offset < buf.len() {
                let n = unsafe {
                    libc::send(
                        fd,
                        buf.as_ptr().add(info.offset) as *const libc::c_void,
                        buf.len() - info.offset,
                        libc::MSG_NOSIGNAL,
                    )
                };
                if n < 0 {
                    let err = io::Error::last_os_error();
                    outcome = match err.raw_os_error() {
                        Some(libc::EAGAIN) => SendOutcome::KeepActive,
                        _ => SendOutcome::Close,
                    };
                    break;
                }
                // A send of 0 is progress of 0 bytes; keep looping.
                info.offset += n as usize;
            }
            if info.offset == buf.len() && matches!(outcome, SendOutcome::Park) {
                if transcript.completed() {
                    // Fully delivered; end-of-stream.
                    outcome = SendOutcome::Close;
                } else {
                    info.waiting = true;
                }
            }
            outcome
        };

        match outcome {
            SendOutcome::KeepActive => {}
            SendOutcome::Park => {
                state.active.retain(|&a| a != fd);
                state.waiting.push(fd);
                trace!(fd, "client parked");
            }
            SendOutcome::Close => Self::close_client(state, fd),
        }
        state.check_invariants();
    }

    /// Detach and close one client; locking is the caller's.
    fn close_client(state: &mut ServerState, fd: RawFd) {
        let Some(info) = state.clients.remove(&fd) else {
            return;
        };
        if let Some(id) = info.build {
            let build = state.builds.get_mut(&id).expect("client's build exists");
            build.release();
            // Keep the front build even when unread so that the next client
            // to connect always has a build to attach to.
            if build.refcount() == 0 && build.completed() && state.front_id() != Some(id) {
                debug!(build = id, "garbage-collecting build");
                state.builds.remove(&id);
            }
        }
        state.active.retain(|&a| a != fd);
        state.waiting.retain(|&w| w != fd);
        debug!(fd, "stream client closed");
        drop(info.stream);
    }

    /// New bytes exist on the (incomplete) front build: wake every parked
    /// client, attaching those that connected before any build existed.
    fn flush_waiting(&self, state: &mut ServerState) {
        let front = state.front_id().expect("flush with no build");
        {
            let build = state.builds.get(&front).expect("front build");
            debug_assert!(!build.completed());
            debug_assert!(!build.buf().is_empty());
        }

        let parked = std::mem::take(&mut state.waiting);
        for fd in parked {
            let info = state.clients.get_mut(&fd).expect("waiting client exists");
            match info.build {
                None => {
                    info.build = Some(front);
                    state.builds.get_mut(&front).expect("front build").acquire();
                }
                // A waiting client attached to an older build is impossible:
                // it would have been closed at that build's final flush.
                Some(attached) => debug_assert_eq!(attached, front),
            }
            info.waiting = false;
            state.active.push(fd);
        }

        self.event.raise();
    }
}

impl StreamConsumer for StreamServer {
    fn new_build(&self, build_id: u32) {
        let mut guard = self.lock();
        let state = &mut *guard;

        if let Some(front) = state.front_id() {
            let build = state.builds.get(&front).expect("front build");
            debug_assert!(build.completed(), "new build before the prior one ended");
            if build.refcount() == 0 {
                state.builds.remove(&front);
            }
        }
        debug!(build = build_id, "new build transcript");
        state.builds.insert(build_id, Transcript::new(build_id));
        self.flush_waiting(state);
        state.check_invariants();
    }

    fn new_command(&self, cmd_id: u32, command: &str) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let front = state.front_id().expect("command outside a build");
        state
            .builds
            .get_mut(&front)
            .expect("front build")
            .push_command(cmd_id, command);
        self.flush_waiting(state);
    }

    fn write_stdout(&self, cmd_id: u32, bytes: &[u8]) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let front = state.front_id().expect("output outside a build");
        state
            .builds
            .get_mut(&front)
            .expect("front build")
            .push_output(cmd_id, bytes, true);
        self.flush_waiting(state);
    }

    fn write_stderr(&self, cmd_id: u32, bytes: &[u8]) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let front = state.front_id().expect("output outside a build");
        state
            .builds
            .get_mut(&front)
            .expect("front build")
            .push_output(cmd_id, bytes, false);
        self.flush_waiting(state);
    }

    fn end_command(&self, cmd_id: u32, status: ExitStatus) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let front = state.front_id().expect("status outside a build");
        state
            .builds
            .get_mut(&front)
            .expect("front build")
            .push_status(cmd_id, status);
        self.flush_waiting(state);
    }

    fn end_build(&self, result: BuildResult) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let front = state.front_id().expect("end outside a build");
        state
            .builds
            .get_mut(&front)
            .expect("front build")
            .push_trailer(result);
        // Wake readers onto the trailer bytes first, then seal: flushing
        // asserts the front build is still in progress.
        self.flush_waiting(state);
        state
            .builds
            .get_mut(&front)
            .expect("front build")
            .set_completed();
        debug!(build = front, result = result.as_str(), "build sealed");
        state.check_invariants();
    }

    fn cache_retrieve(&self, path: &str) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let front = state.front_id().expect("cache event outside a build");
        state
            .builds
            .get_mut(&front)
            .expect("front build")
            .push_cache(path);
        self.flush_waiting(state);
    }
}
