use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::PipelineConfig;
use crate::digest::compute_hash;
use crate::error::UploadError;
use crate::ledger::{StateLedger, UploadRecord, UploadStatus};
use crate::retry::{RequestPacer, RetryPolicy};
use crate::runtime::normalize_for_display;

pub const SUPPORTED_EXTENSIONS: &[&str] = &["md", "txt", "pdf", "docx", "doc", "html", "htm"];
const PING_TIMEOUT: Duration = Duration::from_secs(10);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const EMBEDDINGS_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub slug: String,
}

/// Document endpoints of the target platform.
pub trait DocumentApi {
    fn verify_access(&mut self) -> Result<(), UploadError>;
    fn list_workspaces(&mut self) -> Result<Vec<Workspace>, UploadError>;
    fn create_workspace(&mut self, name: &str) -> Result<Workspace, UploadError>;
    /// Uploads one file and returns the platform's document location.
    fn upload_document(&mut self, file_name: &str, content: &[u8]) -> Result<String, UploadError>;
    fn update_embeddings(
        &mut self,
        workspace_slug: &str,
        adds: &[String],
        deletes: &[String],
    ) -> Result<(), UploadError>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct AnythingLlmClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub upload_delay_ms: u64,
}

impl AnythingLlmClientConfig {
    pub fn from_pipeline(config: &PipelineConfig) -> Result<Self, UploadError> {
        let api_key = config
            .require_api_key()
            .map_err(|error| UploadError::Config(error.to_string()))?;
        let base_url = config.target_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(UploadError::Config("target URL is empty".to_string()));
        }
        Ok(Self {
            base_url,
            api_key: api_key.to_string(),
            user_agent: config.http.user_agent.clone(),
            timeout_ms: config.http.timeout_ms,
            upload_delay_ms: config.http.upload_delay_ms,
        })
    }
}

pub struct AnythingLlmClient {
    client: Client,
    config: AnythingLlmClientConfig,
    upload_pacer: RequestPacer,
    requests: usize,
}

impl AnythingLlmClient {
    pub fn new(config: AnythingLlmClientConfig) -> Result<Self, UploadError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|error| UploadError::Config(format!("failed to build HTTP client: {error}")))?;
        Ok(Self {
            client,
            upload_pacer: RequestPacer::new(config.upload_delay_ms),
            config,
            requests: 0,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(&self.config.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    fn execute(&mut self, request: RequestBuilder) -> Result<Response, UploadError> {
        self.requests += 1;
        let response = request.send().map_err(classify_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

impl DocumentApi for AnythingLlmClient {
    fn verify_access(&mut self) -> Result<(), UploadError> {
        let ping = self.client.get(self.endpoint("/api/ping")).timeout(PING_TIMEOUT);
        self.execute(ping).map_err(|error| match error {
            UploadError::Auth(_) => error,
            other => UploadError::Server(format!(
                "cannot reach {}: {other}",
                self.config.base_url
            )),
        })?;

        let request = self.authorized(self.client.get(self.endpoint("/api/v1/auth")));
        let payload: AuthResponse = decode(self.execute(request)?, "auth")?;
        if payload.authenticated {
            Ok(())
        } else {
            Err(UploadError::Auth("API key was not accepted".to_string()))
        }
    }

    fn list_workspaces(&mut self) -> Result<Vec<Workspace>, UploadError> {
        let request = self.authorized(self.client.get(self.endpoint("/api/v1/workspaces")));
        let payload: WorkspacesResponse = decode(self.execute(request)?, "workspaces")?;
        Ok(payload.workspaces)
    }

    fn create_workspace(&mut self, name: &str) -> Result<Workspace, UploadError> {
        let request = self.authorized(
            self.client
                .post(self.endpoint("/api/v1/workspace/new"))
                .json(&json!({ "name": name })),
        );
        let payload: NewWorkspaceResponse = decode(self.execute(request)?, "workspace/new")?;
        payload.workspace.ok_or_else(|| {
            UploadError::Protocol(
                payload
                    .message
                    .unwrap_or_else(|| format!("workspace {name} was not returned")),
            )
        })
    }

    fn upload_document(&mut self, file_name: &str, content: &[u8]) -> Result<String, UploadError> {
        let part = Part::bytes(content.to_vec())
            .file_name(file_name.to_string())
            .mime_str(mime_for(file_name))
            .map_err(|error| UploadError::Protocol(format!("invalid MIME type: {error}")))?;
        let form = Form::new().part("file", part);

        self.upload_pacer.pace();
        let request = self.authorized(
            self.client
                .post(self.endpoint("/api/v1/document/upload"))
                .timeout(UPLOAD_TIMEOUT)
                .multipart(form),
        );
        let payload: UploadResponse = decode(self.execute(request)?, "document/upload")?;
        if !payload.success {
            return Err(UploadError::Protocol(
                payload
                    .error
                    .unwrap_or_else(|| format!("upload of {file_name} was rejected")),
            ));
        }
        payload
            .documents
            .into_iter()
            .find_map(|document| document.location)
            .ok_or_else(|| {
                UploadError::Protocol(format!("upload of {file_name} returned no document location"))
            })
    }

    fn update_embeddings(
        &mut self,
        workspace_slug: &str,
        adds: &[String],
        deletes: &[String],
    ) -> Result<(), UploadError> {
        let request = self.authorized(
            self.client
                .post(self.endpoint(&format!(
                    "/api/v1/workspace/{workspace_slug}/update-embeddings"
                )))
                .timeout(EMBEDDINGS_TIMEOUT)
                .json(&json!({ "adds": adds, "deletes": deletes })),
        );
        self.execute(request)?;
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.requests
    }
}

fn mime_for(file_name: &str) -> &'static str {
    match extension_of(Path::new(file_name)).as_deref() {
        Some("html" | "htm") => "text/html",
        Some("pdf") => "application/pdf",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Some("doc") => "application/msword",
        _ => "text/plain",
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|extension| extension.to_string_lossy().to_ascii_lowercase())
}

fn decode<T: for<'de> Deserialize<'de>>(response: Response, what: &str) -> Result<T, UploadError> {
    response
        .json()
        .map_err(|error| UploadError::Protocol(format!("failed to decode {what} response: {error}")))
}

fn classify_transport_error(error: reqwest::Error) -> UploadError {
    if error.is_builder() {
        UploadError::Config(format!("invalid request: {error}"))
    } else {
        UploadError::Server(format!("request failed: {error}"))
    }
}

fn classify_status(status: StatusCode, body: &str) -> UploadError {
    let detail: String = body.trim().chars().take(200).collect();
    let message = if detail.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {detail}")
    };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => UploadError::Auth(message),
        StatusCode::NOT_FOUND => UploadError::NotFound(message),
        StatusCode::CONFLICT => UploadError::Conflict(message),
        StatusCode::TOO_MANY_REQUESTS => UploadError::RateLimited(message),
        StatusCode::REQUEST_TIMEOUT => UploadError::Server(message),
        status if status.is_server_error() => UploadError::Server(message),
        _ => UploadError::Protocol(message),
    }
}

#[derive(Debug, Deserialize, Default)]
struct AuthResponse {
    #[serde(default)]
    authenticated: bool,
}

#[derive(Debug, Deserialize, Default)]
struct WorkspacesResponse {
    #[serde(default)]
    workspaces: Vec<Workspace>,
}

#[derive(Debug, Deserialize, Default)]
struct NewWorkspaceResponse {
    workspace: Option<Workspace>,
    message: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct UploadResponse {
    #[serde(default)]
    success: bool,
    error: Option<String>,
    #[serde(default)]
    documents: Vec<UploadedDocument>,
}

#[derive(Debug, Deserialize)]
struct UploadedDocument {
    location: Option<String>,
}

/// What happened to one exported file during an upload pass.
#[derive(Debug)]
pub enum DocumentOutcome {
    Uploaded {
        location: String,
        replaced: Option<String>,
    },
    Unchanged,
    /// A previous upload with the same digest was attached.
    Reattached { location: String },
    /// Uploaded but not attached to the workspace.
    Unattached {
        location: String,
        error: UploadError,
    },
    Failed(UploadError),
}

/// Uploads exported documents through a [`DocumentApi`], consulting the
/// ledger so that unchanged documents cost no platform calls.
pub struct UploadClient<'a, A: DocumentApi + ?Sized> {
    api: &'a mut A,
    ledger: &'a StateLedger,
    retry: RetryPolicy,
}

impl<'a, A: DocumentApi + ?Sized> UploadClient<'a, A> {
    pub fn new(api: &'a mut A, ledger: &'a StateLedger, retry: RetryPolicy) -> Self {
        Self { api, ledger, retry }
    }

    pub fn verify_access(&mut self) -> Result<(), UploadError> {
        let api = &mut *self.api;
        self.retry
            .run("verify access", |_| api.verify_access(), UploadError::kind)
    }

    /// Returns the workspace named `name`, creating it when absent. A
    /// conflicting concurrent create resolves to the existing workspace.
    pub fn ensure_workspace(&mut self, name: &str) -> Result<Workspace, UploadError> {
        if let Some(existing) = self.find_workspace(name)? {
            debug!(workspace = %existing.slug, "reusing workspace");
            return Ok(existing);
        }

        let api = &mut *self.api;
        match self
            .retry
            .run("create workspace", |_| api.create_workspace(name), UploadError::kind)
        {
            Ok(created) => {
                info!(workspace = %created.slug, name, "created workspace");
                Ok(created)
            }
            Err(UploadError::Conflict(message)) => {
                debug!(name, "workspace create conflicted; looking it up again");
                self.find_workspace(name)?
                    .ok_or(UploadError::Conflict(message))
            }
            Err(error) => Err(error),
        }
    }

    fn find_workspace(&mut self, name: &str) -> Result<Option<Workspace>, UploadError> {
        let api = &mut *self.api;
        let workspaces = self
            .retry
            .run("list workspaces", |_| api.list_workspaces(), UploadError::kind)?;
        Ok(workspaces.into_iter().find(|workspace| workspace.name == name))
    }

    /// Uploads one file unless the ledger already holds a succeeded record
    /// with the same digest. Only ledger failures are returned as `Err`.
    pub fn upload_document(&mut self, workspace: &Workspace, path: &Path) -> Result<DocumentOutcome> {
        let file_name = match path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => bail!("not a file path: {}", path.display()),
        };
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(source) => {
                return Ok(DocumentOutcome::Failed(UploadError::Io {
                    path: normalize_for_display(path),
                    source,
                }));
            }
        };
        let digest = compute_hash(&content);

        let previous = self.ledger.upload_record(&workspace.slug, &file_name)?;
        if let Some(record) = &previous {
            if record.is_current(&digest) {
                debug!(file = %file_name, "upload skipped, digest unchanged");
                return Ok(DocumentOutcome::Unchanged);
            }
            if record.status == UploadStatus::UploadedUnattached
                && record.digest == digest
                && let Some(location) = record.location.clone()
            {
                return self.attach_to_workspace(workspace, record.clone(), location, true);
            }
        }

        let mut record =
            UploadRecord::pending(&workspace.slug, &file_name, &digest, previous.as_ref());
        record.attempts = record.attempts.saturating_add(1);
        self.ledger.record_upload(&record)?;

        let api = &mut *self.api;
        let uploaded = self.retry.run(
            "upload document",
            |_| api.upload_document(&file_name, &content),
            UploadError::kind,
        );
        let location = match uploaded {
            Ok(location) => location,
            Err(error) => {
                warn!(file = %file_name, kind = %error.kind(), "upload failed: {error}");
                record.status = UploadStatus::Failed;
                record.last_error = Some(error.to_string());
                self.ledger.record_upload(&record)?;
                return Ok(DocumentOutcome::Failed(error));
            }
        };
        record.location = Some(location.clone());
        self.attach_to_workspace(workspace, record, location, false)
    }

    /// Embeds `location` in the workspace, dropping the superseded copy of
    /// the same file in the same call.
    pub fn attach_to_workspace(
        &mut self,
        workspace: &Workspace,
        mut record: UploadRecord,
        location: String,
        reattach: bool,
    ) -> Result<DocumentOutcome> {
        let adds = vec![location.clone()];
        let deletes: Vec<String> = record
            .superseded_location
            .iter()
            .filter(|old| **old != location)
            .cloned()
            .collect();

        let api = &mut *self.api;
        let slug = workspace.slug.as_str();
        let attached = self.retry.run(
            "update embeddings",
            |_| api.update_embeddings(slug, &adds, &deletes),
            UploadError::kind,
        );
        match attached {
            Ok(()) => {
                let replaced = record.superseded_location.take();
                record.status = UploadStatus::Succeeded;
                record.last_error = None;
                self.ledger.record_upload(&record)?;
                info!(file = %record.file_name, workspace = %slug, "document embedded");
                Ok(if reattach {
                    DocumentOutcome::Reattached { location }
                } else {
                    DocumentOutcome::Uploaded { location, replaced }
                })
            }
            Err(error) => {
                warn!(
                    file = %record.file_name,
                    workspace = %slug,
                    "uploaded but not attached: {error}"
                );
                record.status = UploadStatus::UploadedUnattached;
                record.last_error = Some(error.to_string());
                self.ledger.record_upload(&record)?;
                Ok(DocumentOutcome::Unattached { location, error })
            }
        }
    }
}

/// Files with a supported extension directly inside `export_dir`, sorted by
/// name.
pub fn list_exported_documents(export_dir: &Path) -> Result<Vec<PathBuf>> {
    if !export_dir.is_dir() {
        bail!("export directory not found: {}", export_dir.display());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(export_dir).min_depth(1).max_depth(1) {
        let entry = entry
            .with_context(|| format!("failed to read {}", export_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let supported = extension_of(entry.path())
            .is_some_and(|extension| SUPPORTED_EXTENSIONS.contains(&extension.as_str()));
        if supported {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}
