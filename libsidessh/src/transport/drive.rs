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

//! Google Drive appData transport.
//!
//! Two private appData files, one per direction, each holding one
//! encoded message per line. appData has no append primitive, so a
//! write downloads the current contents, appends a line, and uploads
//! the whole file; strong consistency on full-object update keeps that
//! simple, and file size is bounded by session lifetime.

use std::{
    fs,
    path::PathBuf,
    thread,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use sidessh_protocol::{decode_message, encode_message, Message, Protocol};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{TransportBackend, TransportError};
use crate::consts;

pub const DRIVE_APPDATA_SCOPE: &str = "https://www.googleapis.com/auth/drive.appdata";

const DRIVE_FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const DRIVE_UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";
const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

const RETRY_DELAY_CAP: Duration = Duration::from_secs(2);

/// A failed Drive API call. `status` carries the HTTP status when
/// there was one; keyword matching on `detail` catches transport-level
/// flakiness that arrives without a status.
#[derive(Debug)]
pub struct DriveApiError {
    pub status: Option<u16>,
    pub detail: String,
}

impl DriveApiError {
    pub fn new(detail: impl Into<String>) -> Self {
        DriveApiError { status: None, detail: detail.into() }
    }

    fn is_retryable(&self) -> bool {
        if matches!(self.status, Some(429 | 500 | 502 | 503 | 504)) {
            return true;
        }

        let lowered = self.detail.to_lowercase();
        [
            "rate limit",
            "backend error",
            "internal error",
            "temporarily unavailable",
            "connection reset",
            "timeout",
        ]
        .iter()
        .any(|p| lowered.contains(p))
    }
}

/// The slice of the Drive REST surface this transport needs. The
/// OAuth consent flow stays outside; tests plug in an in-memory
/// implementation.
pub trait DriveFiles: Send {
    fn find_file_id(&mut self, name: &str) -> Result<Option<String>, DriveApiError>;
    fn create_file(&mut self, name: &str) -> Result<String, DriveApiError>;
    fn download(&mut self, file_id: &str) -> Result<String, DriveApiError>;
    fn upload(&mut self, file_id: &str, content: &str) -> Result<(), DriveApiError>;
}

#[derive(Debug, Clone)]
pub struct DriveTransportConfig {
    pub inbound_file_name: String,
    pub outbound_file_name: String,
    pub poll_page_size: u32,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for DriveTransportConfig {
    fn default() -> Self {
        DriveTransportConfig {
            inbound_file_name: String::from(consts::DEFAULT_DRIVE_LOG_C2S),
            outbound_file_name: String::from(consts::DEFAULT_DRIVE_LOG_S2C),
            poll_page_size: 200,
            max_retries: 5,
            retry_base_delay: Duration::from_millis(200),
        }
    }
}

pub struct GoogleDriveTransportBackend {
    api: Box<dyn DriveFiles>,
    config: DriveTransportConfig,
    inbound_file_id: String,
    outbound_file_id: String,
    inbound_lines: Vec<String>,
    closed: bool,
}

impl GoogleDriveTransportBackend {
    pub fn new(
        mut api: Box<dyn DriveFiles>,
        config: DriveTransportConfig,
    ) -> Result<Self, TransportError> {
        let inbound_file_id =
            ensure_appdata_file(&mut *api, &config, &config.inbound_file_name)?;
        let outbound_file_id =
            ensure_appdata_file(&mut *api, &config, &config.outbound_file_name)?;

        let mut backend = GoogleDriveTransportBackend {
            api,
            config,
            inbound_file_id,
            outbound_file_id,
            inbound_lines: Vec::new(),
            closed: false,
        };
        backend.fetch_inbound()?;
        Ok(backend)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn parse_cursor(cursor: Option<&str>) -> usize {
        cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0)
    }
}

impl TransportBackend for GoogleDriveTransportBackend {
    fn name(&self) -> String {
        format!(
            "google-drive:in={},out={},scope={}",
            self.config.inbound_file_name, self.config.outbound_file_name, DRIVE_APPDATA_SCOPE
        )
    }

    fn snapshot_inbound_cursor(&mut self) -> Option<String> {
        Some(self.inbound_lines.len().to_string())
    }

    fn read_inbound_messages(
        &mut self,
        cursor: Option<&str>,
    ) -> Result<(Vec<Message>, Option<String>), TransportError> {
        self.ensure_open()?;

        let start = Self::parse_cursor(cursor);
        let next = self.inbound_lines.len().to_string();
        if start >= self.inbound_lines.len() {
            return Ok((Vec::new(), Some(next)));
        }

        let messages = self.inbound_lines[start..]
            .iter()
            .filter_map(|line| decode_message(line, Protocol::StreamV2))
            .collect();
        Ok((messages, Some(next)))
    }

    fn fetch_inbound(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;

        let file_id = self.inbound_file_id.clone();
        let text = run_drive_call(
            &format!("download file {file_id}"),
            &self.config,
            || self.api.download(&file_id),
        )?;
        self.inbound_lines = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();
        Ok(())
    }

    fn write_outbound_message(&mut self, message: &Message) -> Result<Uuid, TransportError> {
        self.ensure_open()?;
        let payload = encode_message(message);
        let file_id = self.outbound_file_id.clone();

        let mut existing = run_drive_call(
            &format!("download file {file_id}"),
            &self.config,
            || self.api.download(&file_id),
        )?;
        if !existing.is_empty() && !existing.ends_with('\n') {
            existing.push('\n');
        }
        let updated = format!("{existing}{payload}\n");

        run_drive_call(&format!("update file {file_id}"), &self.config, || {
            self.api.upload(&file_id, &updated)
        })?;

        debug!("appended frame {} to {}", message.msg_id, self.config.outbound_file_name);
        Ok(message.msg_id)
    }

    fn push_outbound(&mut self) -> Result<(), TransportError> {
        // Writes land immediately on each append.
        self.ensure_open()
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

fn ensure_appdata_file(
    api: &mut dyn DriveFiles,
    config: &DriveTransportConfig,
    name: &str,
) -> Result<String, TransportError> {
    if let Some(existing) =
        run_drive_call(&format!("find appData file {name}"), config, || api.find_file_id(name))?
    {
        return Ok(existing);
    }

    info!("creating appData file {name}");
    run_drive_call(&format!("create appData file {name}"), config, || api.create_file(name))
}

/// Run a Drive call with exponential backoff on transient failures.
fn run_drive_call<T>(
    action: &str,
    config: &DriveTransportConfig,
    mut call: impl FnMut() -> Result<T, DriveApiError>,
) -> Result<T, TransportError> {
    let attempts = config.max_retries.max(1);
    let mut delay = config.retry_base_delay;

    for attempt in 0..attempts {
        match call() {
            Ok(value) => return Ok(value),
            Err(err) => {
                if err.is_retryable() && attempt + 1 < attempts {
                    warn!("google drive {action} failed (attempt {}): {}", attempt + 1, err.detail);
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    delay = if delay.is_zero() {
                        Duration::from_millis(100)
                    } else {
                        (delay * 2).min(RETRY_DELAY_CAP)
                    };
                    continue;
                }

                return Err(TransportError::Medium(format!(
                    "google drive {action} failed: {}",
                    err.detail
                )));
            }
        }
    }

    Err(TransportError::Medium(format!("google drive {action} failed after retries")))
}

//
// OAuth + HTTP implementation
//

#[derive(Debug, Clone)]
pub struct DriveAuthConfig {
    pub client_secrets_path: PathBuf,
    pub token_path: PathBuf,
}

/// The cached OAuth user token, in the layout the consent tooling
/// writes.
#[derive(Debug, Serialize, Deserialize)]
struct CachedToken {
    token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    expiry: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientSecrets {
    installed: ClientSecretsInner,
}

#[derive(Debug, Deserialize)]
struct ClientSecretsInner {
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<FileEntry>,
}

#[derive(Debug, Deserialize)]
struct FileEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CreatedFile {
    id: String,
}

/// [`DriveFiles`] over the real REST API with cached-token OAuth.
///
/// The interactive consent flow is out of scope here: if there is no
/// usable cached token and no refresh token, construction fails with
/// an instruction to complete consent elsewhere first.
pub struct HttpDriveFiles {
    client: reqwest::blocking::Client,
    auth: DriveAuthConfig,
    token: CachedToken,
    poll_page_size: u32,
}

impl HttpDriveFiles {
    pub fn new(auth: DriveAuthConfig, poll_page_size: u32) -> Result<Self, TransportError> {
        let token_raw = fs::read_to_string(&auth.token_path).map_err(|e| {
            TransportError::Unavailable(format!(
                "google OAuth token is missing at {} ({e}); complete the OAuth consent flow \
                 once in an interactive terminal to create it",
                auth.token_path.display()
            ))
        })?;
        let token: CachedToken = serde_json::from_str(&token_raw).map_err(|e| {
            TransportError::Unavailable(format!(
                "google OAuth token at {} is not parseable: {e}",
                auth.token_path.display()
            ))
        })?;

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TransportError::Medium(format!("building http client: {e}")))?;

        let mut files = HttpDriveFiles { client, auth, token, poll_page_size };
        if files.token_expired() {
            files.refresh_token().map_err(|e| {
                TransportError::Unavailable(format!(
                    "failed to refresh google OAuth token: {}",
                    e.detail
                ))
            })?;
        }
        Ok(files)
    }

    fn token_expired(&self) -> bool {
        match self.token.expiry.as_deref() {
            Some(raw) => match DateTime::parse_from_rfc3339(raw) {
                Ok(expiry) => expiry <= Utc::now(),
                Err(_) => true,
            },
            None => false,
        }
    }

    fn client_credentials(&self) -> Result<(String, String), DriveApiError> {
        if let (Some(id), Some(secret)) =
            (self.token.client_id.clone(), self.token.client_secret.clone())
        {
            return Ok((id, secret));
        }

        let raw = fs::read_to_string(&self.auth.client_secrets_path).map_err(|e| {
            DriveApiError::new(format!(
                "client secrets file {} unreadable: {e}",
                self.auth.client_secrets_path.display()
            ))
        })?;
        let secrets: ClientSecrets = serde_json::from_str(&raw)
            .map_err(|e| DriveApiError::new(format!("parsing client secrets: {e}")))?;
        Ok((secrets.installed.client_id, secrets.installed.client_secret))
    }

    fn refresh_token(&mut self) -> Result<(), DriveApiError> {
        let refresh_token = self
            .token
            .refresh_token
            .clone()
            .ok_or_else(|| DriveApiError::new("token expired and no refresh token cached"))?;
        let (client_id, client_secret) = self.client_credentials()?;

        let response = self
            .client
            .post(OAUTH_TOKEN_URL)
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .map_err(|e| DriveApiError::new(format!("token refresh request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(DriveApiError {
                status: Some(status.as_u16()),
                detail: format!("token refresh returned {status}: {body}"),
            });
        }

        let refreshed: RefreshResponse = response
            .json()
            .map_err(|e| DriveApiError::new(format!("parsing token refresh response: {e}")))?;
        self.token.token = refreshed.access_token;
        if let Some(expires_in) = refreshed.expires_in {
            let expiry = Utc::now() + chrono::Duration::seconds(expires_in.max(0));
            self.token.expiry = Some(expiry.to_rfc3339());
        }
        self.persist_token();
        Ok(())
    }

    fn persist_token(&self) {
        match serde_json::to_string(&self.token) {
            Ok(json) => {
                if let Err(e) = fs::write(&self.auth.token_path, json) {
                    warn!("could not persist refreshed OAuth token: {e}");
                }
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt as _;
                    let _ = fs::set_permissions(
                        &self.auth.token_path,
                        fs::Permissions::from_mode(0o600),
                    );
                }
            }
            Err(e) => warn!("could not serialize OAuth token: {e}"),
        }
    }

    fn authed(
        &mut self,
        build: impl Fn(&reqwest::blocking::Client, &str) -> reqwest::blocking::RequestBuilder,
    ) -> Result<reqwest::blocking::Response, DriveApiError> {
        if self.token_expired() {
            self.refresh_token()?;
        }

        let response = build(&self.client, &self.token.token)
            .send()
            .map_err(|e| DriveApiError::new(format!("drive request failed: {e}")))?;

        // A 401 means the access token went stale early; refresh once
        // and replay.
        if response.status().as_u16() == 401 {
            self.refresh_token()?;
            return build(&self.client, &self.token.token)
                .send()
                .map_err(|e| DriveApiError::new(format!("drive request failed: {e}")));
        }

        Ok(response)
    }

    fn check(response: reqwest::blocking::Response) -> Result<reqwest::blocking::Response, DriveApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        Err(DriveApiError {
            status: Some(status.as_u16()),
            detail: format!("drive api returned {status}: {body}"),
        })
    }
}

impl DriveFiles for HttpDriveFiles {
    fn find_file_id(&mut self, name: &str) -> Result<Option<String>, DriveApiError> {
        let safe_name = name.replace('\'', "\\'");
        let query = format!("name = '{safe_name}' and trashed = false");
        let page_size = self.poll_page_size.max(1).to_string();

        let response = self.authed(|client, token| {
            client
                .get(DRIVE_FILES_URL)
                .bearer_auth(token)
                .query(&[
                    ("q", query.as_str()),
                    ("spaces", "appDataFolder"),
                    ("fields", "files(id,name)"),
                    ("pageSize", page_size.as_str()),
                ])
        })?;
        let listing: FileList = Self::check(response)?
            .json()
            .map_err(|e| DriveApiError::new(format!("parsing file list: {e}")))?;

        Ok(listing.files.into_iter().map(|f| f.id).next())
    }

    fn create_file(&mut self, name: &str) -> Result<String, DriveApiError> {
        let body = serde_json::json!({
            "name": name,
            "parents": ["appDataFolder"],
        });

        let response = self.authed(|client, token| {
            client.post(DRIVE_FILES_URL).bearer_auth(token).json(&body)
        })?;
        let created: CreatedFile = Self::check(response)?
            .json()
            .map_err(|e| DriveApiError::new(format!("parsing create response: {e}")))?;
        Ok(created.id)
    }

    fn download(&mut self, file_id: &str) -> Result<String, DriveApiError> {
        let url = format!("{DRIVE_FILES_URL}/{file_id}");
        let response = self.authed(|client, token| {
            client.get(&url).bearer_auth(token).query(&[("alt", "media")])
        })?;
        Self::check(response)?
            .text()
            .map_err(|e| DriveApiError::new(format!("reading download body: {e}")))
    }

    fn upload(&mut self, file_id: &str, content: &str) -> Result<(), DriveApiError> {
        let url = format!("{DRIVE_UPLOAD_URL}/{file_id}");
        let content = String::from(content);
        let response = self.authed(move |client, token| {
            client
                .patch(&url)
                .bearer_auth(token)
                .query(&[("uploadType", "media")])
                .header(reqwest::header::CONTENT_TYPE, "text/plain")
                .body(content.clone())
        })?;
        Self::check(response).map(|_| ())
    }
}
