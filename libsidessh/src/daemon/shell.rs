// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shell process management: a persistent PTY-backed shell for the
//! streaming protocol, and a one-command-at-a-time runner for the
//! clipboard protocol.

use std::{
    io::{Read as _, Write as _},
    os::unix::process::CommandExt as _,
    process,
    thread,
    time::{Duration, Instant},
};

use nix::{
    poll,
    poll::{PollFd, PollFlags},
    sys::signal,
    sys::wait::{waitpid, WaitPidFlag, WaitStatus},
    unistd::Pid,
};
use sidessh_protocol::SignalName;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::{transport::find_in_path, tty};

const SHELL_KILL_TIMEOUT: Duration = Duration::from_secs(1);
const WRITE_POLL_MS: u16 = 100;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("no usable shell found (tried {0})")]
    NoShell(String),
    #[error("failed to start shell: {0}")]
    Spawn(String),
    #[error("shell has already exited")]
    Exited,
    #[error("shell io error: {0}")]
    Io(String),
}

/// Resolve the preferred shell to an executable path, falling back to
/// common shells when it is not installed.
pub fn resolve_shell(preferred: &str) -> Result<String, ShellError> {
    let mut candidates: Vec<&str> = vec![preferred];
    for fallback in ["bash", "sh"] {
        if fallback != preferred {
            candidates.push(fallback);
        }
    }

    for candidate in &candidates {
        if candidate.contains('/') {
            if std::path::Path::new(candidate).is_file() {
                return Ok(String::from(*candidate));
            }
            continue;
        }
        if let Some(path) = find_in_path(candidate) {
            return Ok(path.to_string_lossy().into_owned());
        }
    }

    Err(ShellError::NoShell(candidates.join(", ")))
}

/// A persistent PTY-backed shell process.
pub struct PtyShellSession {
    pub shell_path: String,
    /// Held so the master side of the pty stays open for the life of
    /// the session; dropping it closes the fd.
    _fork: shpool_pty::fork::Fork,
    master: shpool_pty::fork::Master,
    child_pid: libc::pid_t,
    exit_code: Option<i32>,
}

impl PtyShellSession {
    /// Fork a shell onto a fresh pty sized `cols` x `rows`.
    #[instrument(skip_all, fields(shell = shell_path))]
    pub fn spawn(shell_path: &str, cols: u16, rows: u16) -> Result<Self, ShellError> {
        let mut cmd = process::Command::new(shell_path);
        cmd.stdin(process::Stdio::inherit())
            .stdout(process::Stdio::inherit())
            .stderr(process::Stdio::inherit());

        let fork = shpool_pty::fork::Fork::from_ptmx()
            .map_err(|e| ShellError::Spawn(format!("forking pty: {e}")))?;
        if fork.is_child().is_ok() {
            // In the child the pty slave is already wired up as the
            // controlling terminal on fds 0/1/2.
            for fd in 3..(nix::unistd::SysconfVar::OPEN_MAX as i32) {
                let _ = unsafe { libc::close(fd) };
            }
            let err = cmd.exec();
            eprintln!("shell exec err: {err:?}");
            std::process::exit(1);
        }

        let master = fork
            .is_parent()
            .map_err(|e| ShellError::Spawn(format!("getting pty master: {e}")))?;
        let child_pid = fork.child_pid().unwrap_or(-1);
        if child_pid <= 0 {
            return Err(ShellError::Spawn(String::from("no child pid after fork")));
        }

        let raw_fd = master
            .raw_fd()
            .ok_or_else(|| ShellError::Spawn(String::from("no pty master fd")))?;
        set_nonblocking(raw_fd).map_err(|e| ShellError::Spawn(e.to_string()))?;
        tty::Size { rows: rows.max(1), cols: cols.max(1) }
            .set_fd(raw_fd)
            .map_err(|e| ShellError::Spawn(format!("sizing pty: {e}")))?;

        info!("spawned shell pid={child_pid}");
        Ok(PtyShellSession {
            shell_path: String::from(shell_path),
            _fork: fork,
            master,
            child_pid,
            exit_code: None,
        })
    }

    pub fn write_input(&mut self, data: &[u8]) -> Result<(), ShellError> {
        if data.is_empty() {
            return Ok(());
        }
        if !self.is_alive() {
            return Err(ShellError::Exited);
        }

        let mut written = 0usize;
        while written < data.len() {
            match self.master.write(&data[written..]) {
                Ok(0) => return Err(ShellError::Io(String::from("zero-byte pty write"))),
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    let fd = match self.master.borrow_fd() {
                        Some(fd) => fd,
                        None => return Err(ShellError::Io(String::from("pty master gone"))),
                    };
                    let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
                    poll::poll(&mut fds, WRITE_POLL_MS)
                        .map_err(|e| ShellError::Io(format!("polling pty master: {e}")))?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(ShellError::Io(format!("writing pty master: {e}"))),
            }
        }
        Ok(())
    }

    /// Nonblocking read of whatever output the shell has produced, up
    /// to `max_bytes`. Returns an empty buffer when there is nothing,
    /// including after the child side has gone away.
    pub fn read_output(&mut self, max_bytes: usize) -> Result<Vec<u8>, ShellError> {
        let fd = match self.master.borrow_fd() {
            Some(fd) => fd,
            None => return Ok(Vec::new()),
        };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let nready = poll::poll(&mut fds, 0u16)
            .map_err(|e| ShellError::Io(format!("polling pty master: {e}")))?;
        if nready == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; max_bytes.max(1)];
        match self.master.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(Vec::new()),
            // EIO is how a pty master reports that the slave side is
            // gone.
            Err(e) if e.raw_os_error() == Some(libc::EIO) => Ok(Vec::new()),
            Err(e) => Err(ShellError::Io(format!("reading pty master: {e}"))),
        }
    }

    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), ShellError> {
        let raw_fd = self
            .master
            .raw_fd()
            .ok_or_else(|| ShellError::Io(String::from("pty master gone")))?;
        tty::Size { rows: rows.max(1), cols: cols.max(1) }
            .set_fd(raw_fd)
            .map_err(|e| ShellError::Io(format!("resizing pty: {e}")))
    }

    /// Deliver a signal to the shell's process group.
    pub fn send_signal(&mut self, name: SignalName) -> Result<(), ShellError> {
        if !self.is_alive() {
            return Ok(());
        }

        let sig = match name {
            SignalName::Int => signal::Signal::SIGINT,
            SignalName::Term => signal::Signal::SIGTERM,
            SignalName::Hup => signal::Signal::SIGHUP,
            SignalName::Quit => signal::Signal::SIGQUIT,
        };
        let pgid = nix::unistd::getpgid(Some(Pid::from_raw(self.child_pid)))
            .map_err(|e| ShellError::Io(format!("resolving shell pgid: {e}")))?;
        signal::killpg(pgid, sig)
            .map_err(|e| ShellError::Io(format!("signalling shell: {e}")))?;
        Ok(())
    }

    /// Has the shell process exited? Reaps and caches the exit code
    /// as a side effect.
    pub fn is_alive(&mut self) -> bool {
        if self.exit_code.is_some() {
            return false;
        }

        match waitpid(Pid::from_raw(self.child_pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(WaitStatus::Exited(_, code)) => {
                self.exit_code = Some(code);
                false
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                self.exit_code = Some(128 + sig as i32);
                false
            }
            Ok(_) => true,
            Err(_) => {
                // ECHILD: someone else reaped it; treat as exited.
                if self.exit_code.is_none() {
                    self.exit_code = Some(1);
                }
                false
            }
        }
    }

    pub fn exit_code(&mut self) -> Option<i32> {
        self.is_alive();
        self.exit_code
    }

    /// Tear the shell down: SIGTERM the group, then SIGKILL if it
    /// lingers.
    pub fn close(&mut self) {
        if self.is_alive() {
            let pid = Pid::from_raw(self.child_pid);
            if let Ok(pgid) = nix::unistd::getpgid(Some(pid)) {
                let _ = signal::killpg(pgid, signal::Signal::SIGTERM);
            } else {
                let _ = signal::kill(pid, signal::Signal::SIGTERM);
            }

            let deadline = Instant::now() + SHELL_KILL_TIMEOUT;
            while self.is_alive() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }
            if self.is_alive() {
                warn!("shell pid={} ignored SIGTERM, sending SIGKILL", self.child_pid);
                if let Ok(pgid) = nix::unistd::getpgid(Some(pid)) {
                    let _ = signal::killpg(pgid, signal::Signal::SIGKILL);
                } else {
                    let _ = signal::kill(pid, signal::Signal::SIGKILL);
                }
                let _ = waitpid(pid, None);
            }
        }
    }
}

impl Drop for PtyShellSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn set_nonblocking(fd: i32) -> Result<(), ShellError> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(ShellError::Io(String::from("marking pty master nonblocking")));
        }
    }
    Ok(())
}

/// Output of one clipboard-protocol command execution.
#[derive(Debug, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Runs one command at a time through `<shell> -c <command>` for the
/// request/response protocol.
pub struct CommandShell {
    pub shell_path: String,
}

impl CommandShell {
    pub fn new(preferred: &str) -> Result<Self, ShellError> {
        Ok(CommandShell { shell_path: resolve_shell(preferred)? })
    }

    pub fn execute(&self, command: &str, timeout: Duration) -> Result<CommandResult, ShellError> {
        let mut child = process::Command::new(&self.shell_path)
            .arg("-c")
            .arg(command)
            .stdin(process::Stdio::null())
            .stdout(process::Stdio::piped())
            .stderr(process::Stdio::piped())
            .spawn()
            .map_err(|e| ShellError::Spawn(format!("running {command:?}: {e}")))?;

        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let output = child
                            .wait_with_output()
                            .map_err(|e| ShellError::Io(format!("collecting output: {e}")))?;
                        return Ok(CommandResult {
                            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                            stderr: format!(
                                "{}command timed out after {:.0}s\n",
                                String::from_utf8_lossy(&output.stderr),
                                timeout.as_secs_f64()
                            ),
                            exit_code: 124,
                        });
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(ShellError::Io(format!("waiting on command: {e}"))),
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|e| ShellError::Io(format!("collecting output: {e}")))?;
        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resolve_shell_finds_sh() {
        let path = resolve_shell("sh").expect("sh resolves");
        assert!(path.ends_with("sh"));
    }

    #[test]
    fn resolve_shell_falls_back() {
        let path = resolve_shell("definitely-not-a-shell").expect("fallback");
        assert!(path.ends_with("bash") || path.ends_with("sh"));
    }

    #[test]
    fn command_shell_captures_streams_and_exit() {
        let shell = CommandShell::new("sh").expect("shell");

        let result = shell
            .execute("echo hello", Duration::from_secs(10))
            .expect("echo runs");
        assert!(result.stdout.contains("hello"));
        assert_eq!(result.stderr, "");
        assert_eq!(result.exit_code, 0);

        let result = shell
            .execute("printf 'err\\n' 1>&2; exit 3", Duration::from_secs(10))
            .expect("stderr command runs");
        assert!(result.stderr.contains("err"));
        assert_eq!(result.exit_code, 3);
    }

    #[test]
    fn command_shell_times_out() {
        let shell = CommandShell::new("sh").expect("shell");
        let result = shell
            .execute("sleep 5", Duration::from_millis(100))
            .expect("timeout handled");
        assert_eq!(result.exit_code, 124);
        assert!(result.stderr.contains("timed out"));
    }

    #[test]
    #[ntest::timeout(60000)]
    fn pty_shell_round_trip() {
        let shell_path = resolve_shell("sh").expect("sh resolves");
        let mut shell = PtyShellSession::spawn(&shell_path, 80, 24).expect("spawn");

        shell.write_input(b"echo pty-check\n").expect("write");

        let mut collected = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            collected.extend(shell.read_output(4096).expect("read"));
            if String::from_utf8_lossy(&collected).contains("pty-check") {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert!(String::from_utf8_lossy(&collected).contains("pty-check"));

        shell.write_input(b"exit 7\n").expect("write exit");
        let deadline = Instant::now() + Duration::from_secs(10);
        while shell.is_alive() && Instant::now() < deadline {
            let _ = shell.read_output(4096);
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!shell.is_alive());
        assert_eq!(shell.exit_code(), Some(7));
    }
}
