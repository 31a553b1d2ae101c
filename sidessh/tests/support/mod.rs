// Shared helpers for the integration test binaries. Cargo builds each
// tests/*.rs file separately, so any one binary may only exercise a
// subset of what lives here.
#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::{env, thread, time};

use anyhow::{anyhow, Context};
use tempfile::TempDir;

/// Locate the `sidessh` binary that cargo built alongside this test
/// executable. Test binaries land in `target/<profile>/deps/`, one
/// level below the main binary, so step out of `deps` if we are in
/// it.
pub fn sidessh_bin() -> PathBuf {
    let mut dir = env::current_exe().expect("test binary has a path");
    dir.pop();
    if dir.ends_with("deps") {
        dir.pop();
    }
    dir.join("sidessh")
}

/// DaemonProc is a helper handle for a `sidessh daemon` subprocess
/// running the git transport against a throwaway upstream repo. It
/// kills the subprocess when it goes out of scope.
pub struct DaemonProc {
    proc: Child,
    pub tmp_dir: TempDir,
    pub upstream: PathBuf,
    log_file: PathBuf,
}

impl DaemonProc {
    pub fn new() -> anyhow::Result<DaemonProc> {
        let tmp_dir = tempfile::Builder::new()
            .prefix("sidessh-test")
            .rand_bytes(20)
            .tempdir()
            .context("creating tmp dir")?;

        let upstream = tmp_dir.path().join("upstream.git");
        let status = Command::new("git")
            .arg("init")
            .arg("--bare")
            .arg(&upstream)
            .output()
            .context("creating upstream repo")?;
        if !status.status.success() {
            return Err(anyhow!(
                "git init failed: {}",
                String::from_utf8_lossy(&status.stderr)
            ));
        }

        let log_file = tmp_dir.path().join("daemon.log");
        eprintln!("spawning daemon proc with log {:?}", &log_file);

        let proc = Command::new(sidessh_bin())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .arg("-v")
            .arg("--log-file")
            .arg(&log_file)
            .arg("daemon")
            .arg("--transport")
            .arg("git")
            .arg("--upstream-url")
            .arg(&upstream)
            .arg("--local-repo")
            .arg(tmp_dir.path().join("server.git"))
            .arg("--shell")
            .arg("sh")
            .arg("--poll-interval-ms")
            .arg("25")
            .arg("--fetch-interval")
            .arg("0.05")
            .arg("--push-interval")
            .arg("0.05")
            .spawn()
            .context("spawning daemon process")?;

        Ok(DaemonProc { proc, tmp_dir, upstream, log_file })
    }

    pub fn attach(&mut self) -> anyhow::Result<AttachProc> {
        let mut proc = Command::new(sidessh_bin())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .arg("attach")
            .arg("--transport")
            .arg("git")
            .arg("--upstream-url")
            .arg(&self.upstream)
            .arg("--local-repo")
            .arg(self.tmp_dir.path().join("client.git"))
            .arg("--connect-timeout")
            .arg("30")
            .arg("--poll-interval-ms")
            .arg("25")
            .arg("--fetch-interval")
            .arg("0.05")
            .arg("--push-interval")
            .arg("0.05")
            .arg("testhost")
            .spawn()
            .context("spawning attach process")?;

        let stdout = proc.stdout.take().context("missing attach stdout")?;
        let (line_tx, line_rx) = mpsc::channel();
        thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        if line_tx.send(line).is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        });

        Ok(AttachProc { proc: Some(proc), line_rx })
    }
}

impl Drop for DaemonProc {
    fn drop(&mut self) {
        let _ = self.proc.kill();
        let _ = self.proc.wait();

        if std::thread::panicking() {
            if let Ok(log) = std::fs::read_to_string(&self.log_file) {
                eprintln!("daemon log:\n{log}");
            }
        }
    }
}

/// A `sidessh attach` subprocess with a piped stdin and a background
/// stdout line reader.
pub struct AttachProc {
    proc: Option<Child>,
    line_rx: mpsc::Receiver<String>,
}

impl AttachProc {
    pub fn run_cmd(&mut self, cmd: &str) -> anyhow::Result<()> {
        let proc = self.proc.as_mut().context("attach process gone")?;
        let stdin = proc.stdin.as_mut().context("missing attach stdin")?;
        writeln!(stdin, "{cmd}").context("writing command")?;
        stdin.flush().context("flushing command")?;
        Ok(())
    }

    /// Block until a stdout line containing `needle` shows up.
    pub fn match_line(&mut self, needle: &str, timeout: time::Duration) -> anyhow::Result<String> {
        let deadline = time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(time::Instant::now())
                .ok_or_else(|| anyhow!("timed out waiting for line containing {needle:?}"))?;
            match self.line_rx.recv_timeout(remaining) {
                Ok(line) => {
                    eprintln!("attach stdout: {line:?}");
                    if line.contains(needle) {
                        return Ok(line);
                    }
                }
                Err(_) => {
                    return Err(anyhow!("timed out waiting for line containing {needle:?}"))
                }
            }
        }
    }

    /// Wait for the attach process to exit, returning its exit code.
    pub fn wait_exit(&mut self, timeout: time::Duration) -> anyhow::Result<i32> {
        let mut proc = self.proc.take().context("attach process gone")?;
        let deadline = time::Instant::now() + timeout;
        loop {
            if let Some(status) = proc.try_wait().context("polling attach process")? {
                return status.code().context("attach killed by signal");
            }
            if time::Instant::now() >= deadline {
                let _ = proc.kill();
                let _ = proc.wait();
                return Err(anyhow!("attach process did not exit in time"));
            }
            thread::sleep(time::Duration::from_millis(20));
        }
    }
}

impl Drop for AttachProc {
    fn drop(&mut self) {
        if let Some(mut proc) = self.proc.take() {
            let _ = proc.kill();
            let _ = proc.wait();
        }
    }
}
