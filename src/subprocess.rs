//! Posix subprocess runner.
//!
//! Commands run under `/bin/sh -c` in their own process group, with stdout
//! and stderr connected to two distinct non-blocking pipes. The parent polls
//! both and hands each chunk to the stream consumer as it arrives; nothing
//! is line-buffered. Interruption signals the whole process group.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::stream::StreamConsumer;

/// Outcome of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Succeeded,
    Failed,
    Interrupted,
    Unknown,
}

impl ExitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitStatus::Succeeded => "SUCCEEDED",
            ExitStatus::Failed => "FAILED",
            ExitStatus::Interrupted => "INTERRUPTED",
            ExitStatus::Unknown => "UNKNOWN",
        }
    }
}

fn check_posix(func: &str, ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        return Err(io::Error::new(
            io::Error::last_os_error().kind(),
            format!("{func}: {}", io::Error::last_os_error()),
        ));
    }
    Ok(ret)
}

fn set_nonblocking(fd: libc::c_int) -> io::Result<()> {
    unsafe {
        let flags = check_posix("fcntl", libc::fcntl(fd, libc::F_GETFL))?;
        check_posix("fcntl", libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    }
    Ok(())
}

/// Cross-thread interrupt handle for a running child.
#[derive(Clone)]
pub struct SubprocessHandle {
    pid: libc::pid_t,
    interrupted: Arc<AtomicBool>,
}

impl SubprocessHandle {
    /// Signal the child's process group and make the next poll iteration
    /// return promptly. Safe to call from any thread, any number of times.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        unsafe {
            libc::kill(-self.pid, libc::SIGINT);
        }
    }
}

pub struct Subprocess {
    pid: libc::pid_t,
    stdout: libc::c_int,
    stderr: libc::c_int,
    interrupted: Arc<AtomicBool>,
}

impl Subprocess {
    /// Fork and exec `/bin/sh -c command` in `working_dir`, in a fresh
    /// process group, stdout/stderr redirected to pipes owned by the parent.
    pub fn spawn(command: &str, working_dir: &Path) -> io::Result<Self> {
        let mut out_pipe: [libc::c_int; 2] = [0; 2];
        let mut err_pipe: [libc::c_int; 2] = [0; 2];
        unsafe {
            check_posix("pipe", libc::pipe(out_pipe.as_mut_ptr()))?;
            check_posix("pipe", libc::pipe(err_pipe.as_mut_ptr()))?;
        }

        let command_c = std::ffi::CString::new(command)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in command"))?;
        let dir_c = std::ffi::CString::new(working_dir.to_string_lossy().into_owned())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in working dir"))?;

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            unsafe {
                libc::close(out_pipe[0]);
                libc::close(out_pipe[1]);
                libc::close(err_pipe[0]);
                libc::close(err_pipe[1]);
            }
            return Err(io::Error::last_os_error());
        }

        if pid == 0 {
            // Child: only async-signal-safe calls from here to exec.
            unsafe {
                libc::setpgid(0, 0);
                libc::dup2(out_pipe[1], libc::STDOUT_FILENO);
                libc::dup2(err_pipe[1], libc::STDERR_FILENO);
                libc::close(out_pipe[0]);
                libc::close(out_pipe[1]);
                libc::close(err_pipe[0]);
                libc::close(err_pipe[1]);
                if libc::chdir(dir_c.as_ptr()) != 0 {
                    libc::_exit(127);
                }
                let sh = c"/bin/sh".as_ptr();
                let dash_c = c"-c".as_ptr();
                let argv = [sh, dash_c, command_c.as_ptr(), std::ptr::null()];
                libc::execv(sh, argv.as_ptr());
                libc::_exit(127);
            }
        }

        // Parent.
        unsafe {
            libc::close(out_pipe[1]);
            libc::close(err_pipe[1]);
        }
        set_nonblocking(out_pipe[0])?;
        set_nonblocking(err_pipe[0])?;

        debug!(pid, command, "spawned");
        Ok(Self {
            pid,
            stdout: out_pipe[0],
            stderr: err_pipe[0],
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn handle(&self) -> SubprocessHandle {
        SubprocessHandle {
            pid: self.pid,
            interrupted: Arc::clone(&self.interrupted),
        }
    }

    /// Poll both pipes, forwarding every readable chunk to `consumer`, until
    /// each has reached EOF. Partial reads are delivered as they arrive.
    pub fn communicate(&mut self, cmd_id: u32, consumer: &dyn StreamConsumer) -> io::Result<()> {
        let mut out_open = true;
        let mut err_open = true;
        let mut buf = [0u8; 4096];

        while out_open || err_open {
            let mut fds = Vec::with_capacity(2);
            if out_open {
                fds.push(libc::pollfd {
                    fd: self.stdout,
                    events: libc::POLLIN,
                    revents: 0,
                });
            }
            if err_open {
                fds.push(libc::pollfd {
                    fd: self.stderr,
                    events: libc::POLLIN,
                    revents: 0,
                });
            }

            // A finite timeout keeps interruption prompt even if the child
            // ignores the signal for a while.
            let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, 500) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }

            for pollfd in &fds {
                if pollfd.revents == 0 {
                    continue;
                }
                let is_stdout = pollfd.fd == self.stdout;
                loop {
                    let n = unsafe {
                        libc::read(pollfd.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                    };
                    if n > 0 {
                        let chunk = &buf[..n as usize];
                        if is_stdout {
                            consumer.write_stdout(cmd_id, chunk);
                        } else {
                            consumer.write_stderr(cmd_id, chunk);
                        }
                        continue;
                    }
                    if n == 0 {
                        if is_stdout {
                            out_open = false;
                        } else {
                            err_open = false;
                        }
                        break;
                    }
                    let err = io::Error::last_os_error();
                    match err.raw_os_error() {
                        Some(libc::EAGAIN) => break,
                        Some(libc::EINTR) => continue,
                        _ => return Err(err),
                    }
                }
            }
        }
        Ok(())
    }

    /// Reap the child and translate its wait status.
    pub fn wait(&mut self) -> ExitStatus {
        let mut status: libc::c_int = 0;
        let ret = loop {
            let ret = unsafe { libc::waitpid(self.pid, &mut status, 0) };
            if ret >= 0 || io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                break ret;
            }
        };
        if ret < 0 {
            return ExitStatus::Unknown;
        }

        let status = std::process::ExitStatus::from_raw(status);
        let interrupted = self.interrupted.load(Ordering::SeqCst);
        let exit = match (status.code(), status.signal()) {
            // An interrupt request wins however the child chose to die.
            _ if interrupted => ExitStatus::Interrupted,
            (Some(0), _) => ExitStatus::Succeeded,
            (Some(_), _) => ExitStatus::Failed,
            (None, Some(_)) => ExitStatus::Failed,
            (None, None) => ExitStatus::Unknown,
        };
        debug!(pid = self.pid, ?exit, "reaped");
        exit
    }
}

impl Drop for Subprocess {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.stdout);
            libc::close(self.stderr);
        }
    }
}

/// Convenience wrapper: spawn, stream, reap.
pub fn run(
    command: &str,
    working_dir: &Path,
    cmd_id: u32,
    consumer: &dyn StreamConsumer,
) -> io::Result<ExitStatus> {
    let mut child = Subprocess::spawn(command, working_dir)?;
    child.communicate(cmd_id, consumer)?;
    Ok(child.wait())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::BuildResult;
    use std::sync::Mutex;

    /// Accumulates chunk payloads per stream.
    #[derive(Default)]
    struct BufferConsumer {
        stdout: Mutex<Vec<u8>>,
        stderr: Mutex<Vec<u8>>,
    }

    impl StreamConsumer for BufferConsumer {
        fn new_build(&self, _build_id: u32) {}
        fn new_command(&self, _cmd_id: u32, _command: &str) {}
        fn write_stdout(&self, _cmd_id: u32, bytes: &[u8]) {
            self.stdout.lock().unwrap().extend_from_slice(bytes);
        }
        fn write_stderr(&self, _cmd_id: u32, bytes: &[u8]) {
            self.stderr.lock().unwrap().extend_from_slice(bytes);
        }
        fn end_command(&self, _cmd_id: u32, _status: ExitStatus) {}
        fn end_build(&self, _result: BuildResult) {}
        fn cache_retrieve(&self, _path: &str) {}
    }

    #[test]
    fn captures_stdout() {
        let consumer = BufferConsumer::default();
        let status = run("printf 'To STDOUT'", Path::new("."), 0, &consumer).unwrap();
        assert_eq!(status, ExitStatus::Succeeded);
        assert_eq!(&*consumer.stdout.lock().unwrap(), b"To STDOUT");
        assert!(consumer.stderr.lock().unwrap().is_empty());
    }

    #[test]
    fn captures_stderr() {
        let consumer = BufferConsumer::default();
        let status = run("printf 'To STDERR' >&2", Path::new("."), 0, &consumer).unwrap();
        assert_eq!(status, ExitStatus::Succeeded);
        assert_eq!(&*consumer.stderr.lock().unwrap(), b"To STDERR");
        assert!(consumer.stdout.lock().unwrap().is_empty());
    }

    #[test]
    fn captures_both_streams() {
        let consumer = BufferConsumer::default();
        let status = run(
            "printf 'To STDOUT'; printf 'To STDERR' >&2",
            Path::new("."),
            0,
            &consumer,
        )
        .unwrap();
        assert_eq!(status, ExitStatus::Succeeded);
        assert_eq!(&*consumer.stdout.lock().unwrap(), b"To STDOUT");
        assert_eq!(&*consumer.stderr.lock().unwrap(), b"To STDERR");
    }

    #[test]
    fn nonzero_exit_is_failed() {
        let consumer = BufferConsumer::default();
        let status = run("exit 2", Path::new("."), 0, &consumer).unwrap();
        assert_eq!(status, ExitStatus::Failed);
    }

    #[test]
    fn runs_in_the_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "here").unwrap();
        let consumer = BufferConsumer::default();
        let status = run("cat marker", dir.path(), 0, &consumer).unwrap();
        assert_eq!(status, ExitStatus::Succeeded);
        assert_eq!(&*consumer.stdout.lock().unwrap(), b"here");
    }

    #[test]
    fn interrupt_from_another_thread() {
        let consumer = BufferConsumer::default();
        let mut child = Subprocess::spawn("sleep 30", Path::new(".")).unwrap();
        let handle = child.handle();

        let interrupter = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(100));
            handle.interrupt();
        });

        child.communicate(0, &consumer).unwrap();
        let status = child.wait();
        interrupter.join().unwrap();
        assert_eq!(status, ExitStatus::Interrupted);
    }
}
