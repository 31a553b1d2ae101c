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

//! Git commit-log transport.
//!
//! Each peer keeps a local bare mirror with `origin` pointing at a
//! shared upstream bare repo. Every message becomes one commit whose
//! tree holds `frames/<msg_id>.json`; the two directions live on two
//! branches. Commits give content-addressed durability and commit ids
//! are a natural monotonic cursor, so the whole protocol runs over
//! stock git hosting with no custom server code.

use std::{
    fs,
    fs::OpenOptions,
    io::Write as _,
    os::fd::AsRawFd,
    path::PathBuf,
    process,
    thread,
    time::Duration,
};

use sidessh_protocol::{decode_message, encode_message, Message, Protocol};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{find_in_path, TransportBackend, TransportError};
use crate::consts;

#[derive(Debug, Clone)]
pub struct GitTransportConfig {
    /// This peer's local bare mirror.
    pub local_repo: PathBuf,
    /// The shared upstream bare repository URL or path.
    pub upstream_url: String,
    pub inbound_branch: String,
    pub outbound_branch: String,
    pub auto_init_local: bool,
    pub push_retries: u32,
    pub conflict_retry_delay: Duration,
}

impl Default for GitTransportConfig {
    fn default() -> Self {
        GitTransportConfig {
            local_repo: PathBuf::from("/tmp/sidessh-mirror.git"),
            upstream_url: String::from("/tmp/sidessh-upstream.git"),
            inbound_branch: String::from(consts::DEFAULT_BRANCH_C2S),
            outbound_branch: String::from(consts::DEFAULT_BRANCH_S2C),
            auto_init_local: true,
            push_retries: 6,
            conflict_retry_delay: Duration::from_millis(50),
        }
    }
}

pub struct GitTransportBackend {
    config: GitTransportConfig,
    inbound_ref: String,
    outbound_ref: String,
    lock_path: PathBuf,
    closed: bool,
}

impl GitTransportBackend {
    pub fn new(config: GitTransportConfig) -> Result<Self, TransportError> {
        let inbound_ref = format!("refs/heads/{}", config.inbound_branch);
        let outbound_ref = format!("refs/heads/{}", config.outbound_branch);
        let lock_path = config.local_repo.join("sidessh.lock");

        let backend = GitTransportBackend {
            config,
            inbound_ref,
            outbound_ref,
            lock_path,
            closed: false,
        };
        backend.ensure_initialized()?;
        Ok(backend)
    }

    fn ensure_initialized(&self) -> Result<(), TransportError> {
        if find_in_path("git").is_none() {
            return Err(TransportError::Unavailable(String::from(
                "git executable is not available in PATH",
            )));
        }

        if !self.config.local_repo.exists() {
            if !self.config.auto_init_local {
                return Err(TransportError::Unavailable(format!(
                    "local mirror repo does not exist: {}",
                    self.config.local_repo.display()
                )));
            }

            if let Some(parent) = self.config.local_repo.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    TransportError::Medium(format!("creating mirror parent dir: {e}"))
                })?;
            }
            let output = process::Command::new("git")
                .arg("init")
                .arg("--bare")
                .arg(&self.config.local_repo)
                .output()
                .map_err(|e| TransportError::Unavailable(format!("spawning git init: {e}")))?;
            if !output.status.success() {
                return Err(TransportError::Medium(format!(
                    "failed to initialize local bare repo: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            info!("initialized local mirror at {}", self.config.local_repo.display());
        }

        let is_bare = self.run_git(&["rev-parse", "--is-bare-repository"], None)?;
        if is_bare.trim() != "true" {
            return Err(TransportError::Medium(format!(
                "local mirror repo is not bare: {}",
                self.config.local_repo.display()
            )));
        }

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.lock_path)
            .map_err(|e| TransportError::Medium(format!("creating repo lock file: {e}")))?;

        self.ensure_origin_remote()
    }

    fn ensure_origin_remote(&self) -> Result<(), TransportError> {
        match self.run_git_result(&["remote", "get-url", "origin"], None)? {
            (true, existing) => {
                if existing.trim() != self.config.upstream_url {
                    warn!(
                        "origin url {} does not match configured upstream, realigning",
                        existing.trim()
                    );
                    self.run_git(
                        &["remote", "set-url", "origin", &self.config.upstream_url],
                        None,
                    )?;
                }
            }
            (false, _) => {
                self.run_git(&["remote", "add", "origin", &self.config.upstream_url], None)?;
            }
        }
        Ok(())
    }

    fn resolve_ref(&self, reference: &str) -> Result<Option<String>, TransportError> {
        let (ok, output) =
            self.run_git_result(&["rev-parse", "--verify", "-q", reference], None)?;
        if !ok {
            return Ok(None);
        }
        let value = output.trim();
        Ok(if value.is_empty() { None } else { Some(String::from(value)) })
    }

    fn list_commits(
        &self,
        cursor: Option<&str>,
        head: &str,
    ) -> Result<Vec<String>, TransportError> {
        let range;
        let args: Vec<&str> = match cursor {
            Some(cursor) => {
                range = format!("{cursor}..{head}");
                vec!["rev-list", "--reverse", &range]
            }
            None => vec!["rev-list", "--reverse", head],
        };

        let output = match self.run_git(&args, None) {
            Ok(out) => out,
            Err(_) => {
                // The cursor can become invalid if upstream history was
                // rewritten; fall back to the full history and let the
                // session layer dedup re-delivered msg_ids.
                warn!("inbound cursor no longer resolves, rereading full history");
                self.run_git(&["rev-list", "--reverse", head], None)?
            }
        };

        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    fn frame_path_for_commit(&self, commit_id: &str) -> Result<Option<String>, TransportError> {
        let output =
            self.run_git(&["ls-tree", "--name-only", "-r", commit_id, "frames"], None)?;
        Ok(output
            .lines()
            .map(str::trim)
            .find(|line| line.ends_with(".json"))
            .map(String::from))
    }

    fn fetch_branch_to_local(
        &self,
        branch: &str,
        local_ref: &str,
        allow_missing: bool,
    ) -> Result<bool, TransportError> {
        let refspec = format!("+refs/heads/{branch}:{local_ref}");
        let (ok, output) =
            self.run_git_result(&["fetch", "--prune", "origin", &refspec], None)?;
        if ok {
            return Ok(true);
        }

        let lowered = output.to_lowercase();
        let missing_patterns =
            ["couldn't find remote ref", "no such ref was fetched", "fatal: couldn't find remote ref"];
        if allow_missing && missing_patterns.iter().any(|p| lowered.contains(p)) {
            return Ok(false);
        }

        Err(TransportError::Medium(format!(
            "git fetch failed (branch={branch}, ref={local_ref}): {}",
            output.trim()
        )))
    }

    fn commit_frame_on_outbound(
        &self,
        message: &Message,
        payload: &str,
    ) -> Result<String, TransportError> {
        let parent = self.resolve_ref(&self.outbound_ref)?;

        let blob = self.run_git(&["hash-object", "-w", "--stdin"], Some(payload))?;
        let blob = blob.trim();

        let frames_entry = format!("100644 blob {blob}\t{}.json\n", message.msg_id);
        let frames_tree = self.run_git(&["mktree"], Some(&frames_entry))?;
        let frames_tree = frames_tree.trim();

        let root_entry = format!("040000 tree {frames_tree}\tframes\n");
        let root_tree = self.run_git(&["mktree"], Some(&root_entry))?;
        let root_tree = root_tree.trim();

        let subject = format!(
            "gitssh:{}:{}:{}:{}\n",
            message.payload.kind(),
            message.session_id,
            message.seq,
            message.msg_id
        );
        let mut commit_args = vec!["commit-tree", root_tree];
        if let Some(parent) = parent.as_deref() {
            commit_args.push("-p");
            commit_args.push(parent);
        }
        let commit_id = self.run_git(&commit_args, Some(&subject))?;
        let commit_id = String::from(commit_id.trim());

        let mut update_args =
            vec!["update-ref", self.outbound_ref.as_str(), commit_id.as_str()];
        if let Some(parent) = parent.as_deref() {
            update_args.push(parent);
        }
        self.run_git(&update_args, None)?;

        Ok(commit_id)
    }

    fn push_outbound_once(&self) -> Result<(bool, String), TransportError> {
        let refspec = format!("{0}:{0}", self.outbound_ref);
        let (ok, output) = self.run_git_result(&["push", "origin", &refspec], None)?;
        if ok {
            Ok((true, String::new()))
        } else {
            let detail = output.trim();
            Ok((false, if detail.is_empty() { String::from("unknown push error") } else { String::from(detail) }))
        }
    }

    fn is_non_fast_forward(error: &str) -> bool {
        let lowered = error.to_lowercase();
        ["non-fast-forward", "fetch first", "rejected", "failed to push some refs"]
            .iter()
            .any(|p| lowered.contains(p))
    }

    fn run_git(&self, args: &[&str], input: Option<&str>) -> Result<String, TransportError> {
        let (ok, output) = self.run_git_result(args, input)?;
        if !ok {
            return Err(TransportError::Medium(format!(
                "git command failed (git --git-dir {} {}): {}",
                self.config.local_repo.display(),
                args.join(" "),
                output.trim()
            )));
        }
        Ok(output)
    }

    /// Run git against the mirror, returning (success, stdout+stderr).
    fn run_git_result(
        &self,
        args: &[&str],
        input: Option<&str>,
    ) -> Result<(bool, String), TransportError> {
        let mut cmd = process::Command::new("git");
        cmd.arg("--git-dir")
            .arg(&self.config.local_repo)
            .args(args)
            // Mirrors run headless; pin an identity so commit-tree
            // never goes digging for one.
            .env("GIT_AUTHOR_NAME", "sidessh")
            .env("GIT_AUTHOR_EMAIL", "sidessh@localhost")
            .env("GIT_COMMITTER_NAME", "sidessh")
            .env("GIT_COMMITTER_EMAIL", "sidessh@localhost")
            .stdout(process::Stdio::piped())
            .stderr(process::Stdio::piped())
            .stdin(if input.is_some() { process::Stdio::piped() } else { process::Stdio::null() });

        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::Unavailable(format!("spawning git: {e}")))?;

        if let Some(text) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(text.as_bytes())
                    .map_err(|e| TransportError::Medium(format!("writing git stdin: {e}")))?;
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|e| TransportError::Medium(format!("waiting for git: {e}")))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }

        Ok((output.status.success(), combined))
    }

    fn repo_lock(&self) -> Result<RepoLock, TransportError> {
        RepoLock::acquire(&self.lock_path)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

impl TransportBackend for GitTransportBackend {
    fn name(&self) -> String {
        format!(
            "git:{} (upstream={}, in={}, out={})",
            self.config.local_repo.display(),
            self.config.upstream_url,
            self.config.inbound_branch,
            self.config.outbound_branch
        )
    }

    fn snapshot_inbound_cursor(&mut self) -> Option<String> {
        self.resolve_ref(&self.inbound_ref).ok().flatten()
    }

    fn read_inbound_messages(
        &mut self,
        cursor: Option<&str>,
    ) -> Result<(Vec<Message>, Option<String>), TransportError> {
        self.ensure_open()?;

        let head = match self.resolve_ref(&self.inbound_ref)? {
            Some(head) => head,
            None => return Ok((Vec::new(), cursor.map(String::from))),
        };
        if cursor == Some(head.as_str()) {
            return Ok((Vec::new(), cursor.map(String::from)));
        }

        let commit_ids = self.list_commits(cursor, &head)?;
        let mut messages = Vec::new();
        for commit_id in &commit_ids {
            let frame_path = match self.frame_path_for_commit(commit_id)? {
                Some(path) => path,
                None => continue,
            };
            let spec = format!("{commit_id}:{frame_path}");
            let content = self.run_git(&["show", &spec], None)?;
            if let Some(message) = decode_message(&content, Protocol::StreamV2) {
                messages.push(message);
            }
        }

        let next_cursor = commit_ids.last().cloned().or_else(|| cursor.map(String::from));
        Ok((messages, next_cursor))
    }

    fn fetch_inbound(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        let _lock = self.repo_lock()?;
        let branch = self.config.inbound_branch.clone();
        let local_ref = self.inbound_ref.clone();
        self.fetch_branch_to_local(&branch, &local_ref, true)?;
        Ok(())
    }

    fn write_outbound_message(&mut self, message: &Message) -> Result<Uuid, TransportError> {
        self.ensure_open()?;
        let payload = encode_message(message);

        let _lock = self.repo_lock()?;
        let mut delay = self.config.conflict_retry_delay;
        let retries = self.config.push_retries.max(1);

        for attempt in 0..retries {
            let commit_id = self.commit_frame_on_outbound(message, &payload)?;
            let (pushed, push_error) = self.push_outbound_once()?;
            if pushed {
                debug!("pushed frame {} as {}", message.msg_id, commit_id);
                return Ok(message.msg_id);
            }

            if Self::is_non_fast_forward(&push_error) {
                if attempt + 1 < retries {
                    // Absorb the peer's tip so the next commit parents
                    // on top of it instead of fighting forever.
                    let branch = self.config.outbound_branch.clone();
                    let local_ref = self.outbound_ref.clone();
                    self.fetch_branch_to_local(&branch, &local_ref, true)?;
                    thread::sleep(delay);
                    delay = (delay * 2).min(Duration::from_millis(500));
                    continue;
                }

                return Err(TransportError::PeerTimeout(format!(
                    "failed to push outbound branch after repeated non-fast-forward conflicts: {push_error}"
                )));
            }

            return Err(TransportError::Medium(push_error));
        }

        Err(TransportError::Medium(String::from("failed to push outbound message")))
    }

    fn push_outbound(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        let _lock = self.repo_lock()?;

        if self.resolve_ref(&self.outbound_ref)?.is_none() {
            return Ok(());
        }

        let (pushed, push_error) = self.push_outbound_once()?;
        if pushed {
            return Ok(());
        }

        if Self::is_non_fast_forward(&push_error) {
            // Refresh the local mirror so the next write starts from
            // the upstream tip.
            let branch = self.config.outbound_branch.clone();
            let local_ref = self.outbound_ref.clone();
            self.fetch_branch_to_local(&branch, &local_ref, true)?;
            return Ok(());
        }

        Err(TransportError::Medium(push_error))
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Exclusive advisory lock on the mirror, serializing writers that
/// share it. Released on drop.
struct RepoLock {
    file: fs::File,
}

impl RepoLock {
    fn acquire(path: &PathBuf) -> Result<Self, TransportError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(|e| TransportError::Medium(format!("opening repo lock: {e}")))?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(TransportError::Medium(format!(
                "locking mirror: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(RepoLock { file })
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(test)]
mod test {
    use sidessh_protocol::{build_message, Endpoint, Payload, Protocol, PtyClosed};

    use super::*;

    fn init_upstream(dir: &std::path::Path) -> String {
        let upstream = dir.join("upstream.git");
        let status = process::Command::new("git")
            .arg("init")
            .arg("--bare")
            .arg(&upstream)
            .output()
            .expect("git init upstream");
        assert!(status.status.success());
        upstream.to_string_lossy().into_owned()
    }

    fn backend(
        dir: &std::path::Path,
        mirror: &str,
        upstream: &str,
        inbound: &str,
        outbound: &str,
    ) -> GitTransportBackend {
        GitTransportBackend::new(GitTransportConfig {
            local_repo: dir.join(mirror),
            upstream_url: String::from(upstream),
            inbound_branch: String::from(inbound),
            outbound_branch: String::from(outbound),
            ..GitTransportConfig::default()
        })
        .expect("backend init")
    }

    fn frame(session: Uuid, seq: u64) -> Message {
        build_message(
            Protocol::StreamV2,
            Payload::PtyClosed(PtyClosed { stream_id: Uuid::new_v4(), exit_code: seq as i32 }),
            session,
            Endpoint::Client,
            Endpoint::Server,
            seq,
        )
        .expect("build to succeed")
    }

    #[test]
    fn commit_frame_round_trip() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let upstream = init_upstream(tmp.path());

        let mut writer = backend(tmp.path(), "writer.git", &upstream, "s2c", "c2s");
        let mut reader = backend(tmp.path(), "reader.git", &upstream, "c2s", "s2c");

        let session = Uuid::new_v4();
        let sent: Vec<Message> = (1..=3).map(|seq| frame(session, seq)).collect();
        for message in &sent {
            writer.write_outbound_message(message).expect("write");
        }

        reader.fetch_inbound().expect("fetch");
        let (messages, cursor) = reader.read_inbound_messages(None).expect("read");
        assert_eq!(messages, sent);

        // Cursor advances; a second read sees nothing new.
        let (messages, _) =
            reader.read_inbound_messages(cursor.as_deref()).expect("read again");
        assert!(messages.is_empty());
    }

    #[test]
    fn snapshot_cursor_skips_history() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let upstream = init_upstream(tmp.path());

        let mut writer = backend(tmp.path(), "writer.git", &upstream, "s2c", "c2s");
        let mut reader = backend(tmp.path(), "reader.git", &upstream, "c2s", "s2c");

        let session = Uuid::new_v4();
        writer.write_outbound_message(&frame(session, 1)).expect("write old");

        reader.fetch_inbound().expect("fetch");
        let cursor = reader.snapshot_inbound_cursor();
        assert!(cursor.is_some());

        let fresh = frame(session, 2);
        writer.write_outbound_message(&fresh).expect("write new");
        reader.fetch_inbound().expect("fetch");

        let (messages, _) = reader.read_inbound_messages(cursor.as_deref()).expect("read");
        assert_eq!(messages, vec![fresh]);
    }

    #[test]
    #[ntest::timeout(60000)]
    fn concurrent_writers_lose_nothing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let upstream = init_upstream(tmp.path());

        let session = Uuid::new_v4();
        let mut handles = Vec::new();
        for writer_idx in 0..2 {
            let dir = tmp.path().to_path_buf();
            let upstream = upstream.clone();
            handles.push(thread::spawn(move || {
                let mut writer = backend(
                    &dir,
                    &format!("writer{writer_idx}.git"),
                    &upstream,
                    "s2c",
                    "c2s",
                );
                let mut ids = Vec::new();
                for seq in 1..=8u64 {
                    let message = frame(session, seq);
                    ids.push(message.msg_id);
                    writer.write_outbound_message(&message).expect("write");
                }
                ids
            }));
        }

        let mut expected: Vec<Uuid> = Vec::new();
        for handle in handles {
            expected.extend(handle.join().expect("writer thread"));
        }

        let mut reader = backend(tmp.path(), "reader.git", &upstream, "c2s", "s2c");
        reader.fetch_inbound().expect("fetch");
        let (messages, _) = reader.read_inbound_messages(None).expect("read");

        let mut got: Vec<Uuid> = messages.iter().map(|m| m.msg_id).collect();
        assert_eq!(got.len(), 16, "all 16 frames observed");
        got.sort();
        let mut expected_sorted = expected.clone();
        expected_sorted.sort();
        assert_eq!(got, expected_sorted);
    }
}
