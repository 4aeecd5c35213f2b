use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigSnapshot, PipelineConfig, article_base_url};
use crate::error::{ErrorKind, ExportError, WikiError};
use crate::export::{ExportOutcome, ExportedDocument, PageExporter};
use crate::ledger::StateLedger;
use crate::runtime::ResolvedPaths;
use crate::upload::{
    AnythingLlmClient, AnythingLlmClientConfig, DocumentApi, DocumentOutcome, UploadClient,
    list_exported_documents,
};
use crate::wiki::{ListScope, MediaWikiClient, PageListing, WikiApi};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    Run,
    ScrapeOnly,
    UploadOnly,
}

impl PipelineMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::ScrapeOnly => "scrape",
            Self::UploadOnly => "upload",
        }
    }

    pub fn scrapes(self) -> bool {
        matches!(self, Self::Run | Self::ScrapeOnly)
    }

    pub fn uploads(self) -> bool {
        matches!(self, Self::Run | Self::UploadOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Idle,
    Crawling,
    Exporting,
    Uploading,
    Reporting,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEvent {
    StartCrawl,
    PageFetched,
    PageExported,
    StartUpload,
    Finish,
    Reported,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid pipeline transition from {from:?} on {event:?}")]
pub struct InvalidTransition {
    pub from: PipelineStage,
    pub event: StageEvent,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Crawling => "crawling",
            Self::Exporting => "exporting",
            Self::Uploading => "uploading",
            Self::Reporting => "reporting",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn advance(self, event: StageEvent) -> Result<Self, InvalidTransition> {
        use PipelineStage::*;
        use StageEvent::*;

        let next = match (self, event) {
            (Idle, StartCrawl) => Crawling,
            (Idle | Crawling, StartUpload) => Uploading,
            (Crawling, PageFetched) => Exporting,
            (Exporting, PageExported) => Crawling,
            (Crawling | Uploading, Finish) => Reporting,
            (Reporting, Reported) => Done,
            (stage, Fatal) if !stage.is_terminal() => Failed,
            (from, event) => return Err(InvalidTransition { from, event }),
        };
        Ok(next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Partial => 1,
            Self::Failed => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Setup,
    Listing,
    Fetch,
    Export,
    Upload,
    Attach,
    State,
}

impl FailureStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Listing => "listing",
            Self::Fetch => "fetch",
            Self::Export => "export",
            Self::Upload => "upload",
            Self::Attach => "attach",
            Self::State => "state",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub stage: FailureStage,
    pub identifier: String,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Exported,
    Updated,
    Unchanged,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageOutcome {
    pub title: String,
    pub status: PageStatus,
    pub file_name: Option<String>,
    pub digest: Option<String>,
    pub exported_at_unix: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploaded,
    Replaced,
    Reattached,
    Unchanged,
    Unattached,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentReport {
    pub file_name: String,
    pub status: DocumentStatus,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub listed: usize,
    pub scraped: usize,
    /// Files written, new or changed.
    pub exported: usize,
    pub updated: usize,
    pub skipped_unchanged: usize,
    pub fetch_failed: usize,
    pub export_failed: usize,
    pub upload_succeeded: usize,
    pub upload_skipped_unchanged: usize,
    pub upload_failed: usize,
    pub upload_unattached: usize,
}

/// Report of one pipeline invocation.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub mode: PipelineMode,
    pub config: ConfigSnapshot,
    pub started_at_unix: u64,
    pub finished_at_unix: u64,
    pub status: RunStatus,
    pub stage: PipelineStage,
    pub workspace_slug: Option<String>,
    pub resumed_from: Option<String>,
    pub counts: RunCounts,
    pub pages: Vec<PageOutcome>,
    pub documents: Vec<DocumentReport>,
    pub failures: Vec<FailureRecord>,
    pub fatal_error: Option<String>,
    pub wiki_requests: usize,
    pub upload_requests: usize,
}

impl PipelineRun {
    pub fn exit_code(&self) -> u8 {
        self.status.exit_code()
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: PipelineMode,
    /// Ignore and clear any saved listing cursor.
    pub restart: bool,
}

/// Network collaborators for one run. A mode that needs a missing
/// collaborator fails with a configuration error.
#[derive(Default)]
pub struct Collaborators<'a> {
    pub wiki: Option<&'a mut dyn WikiApi>,
    pub documents: Option<&'a mut dyn DocumentApi>,
}

/// Builds the HTTP clients from `config`, opens the ledger and runs.
/// Only local setup problems (state directory, ledger) are returned as `Err`;
/// everything else ends up in the report.
pub fn run_pipeline(
    config: &PipelineConfig,
    paths: &ResolvedPaths,
    options: &RunOptions,
) -> Result<PipelineRun> {
    let ledger = StateLedger::open(&paths.db_path)?;

    let mut wiki_client = None;
    let mut document_client = None;
    let mut setup_failure = None;
    if options.mode.scrapes() {
        match MediaWikiClient::connect(config) {
            Ok(client) => wiki_client = Some(client),
            Err(error) => {
                setup_failure = Some(FatalError::wiki(FailureStage::Setup, "wiki", &error));
            }
        }
    }
    if options.mode.uploads() && setup_failure.is_none() {
        match AnythingLlmClientConfig::from_pipeline(config).and_then(AnythingLlmClient::new) {
            Ok(client) => document_client = Some(client),
            Err(error) => {
                setup_failure = Some(FatalError::new(
                    FailureStage::Setup,
                    "target",
                    error.kind(),
                    error.to_string(),
                ));
            }
        }
    }

    if let Some(fatal) = setup_failure {
        let mut driver = PipelineDriver::new(config, paths, &ledger, options);
        return Ok(driver.finish(Err(fatal)));
    }

    let collaborators = Collaborators {
        wiki: wiki_client
            .as_mut()
            .map(|client| client as &mut dyn WikiApi),
        documents: document_client
            .as_mut()
            .map(|client| client as &mut dyn DocumentApi),
    };
    Ok(run_with(config, paths, &ledger, options, collaborators))
}

/// Runs the pipeline against the given collaborators and ledger.
pub fn run_with(
    config: &PipelineConfig,
    paths: &ResolvedPaths,
    ledger: &StateLedger,
    options: &RunOptions,
    mut collaborators: Collaborators<'_>,
) -> PipelineRun {
    let mut driver = PipelineDriver::new(config, paths, ledger, options);
    let outcome = driver.execute(&mut collaborators);
    driver.finish(outcome)
}

/// Writes the JSON report atomically.
pub fn write_report(report: &PipelineRun, path: &Path) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create report directory {}", dir.display()))?;
    let rendered =
        serde_json::to_string_pretty(report).context("failed to serialize run report")?;
    let mut temp = NamedTempFile::new_in(&dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    temp.write_all(rendered.as_bytes())
        .and_then(|()| temp.write_all(b"\n"))
        .with_context(|| format!("failed to write {}", path.display()))?;
    temp.persist(path)
        .with_context(|| format!("failed to persist {}", path.display()))?;
    Ok(())
}

#[derive(Debug)]
struct FatalError {
    stage: FailureStage,
    identifier: String,
    kind: ErrorKind,
    message: String,
}

impl FatalError {
    fn new(stage: FailureStage, identifier: &str, kind: ErrorKind, message: String) -> Self {
        Self {
            stage,
            identifier: identifier.to_string(),
            kind,
            message,
        }
    }

    fn wiki(stage: FailureStage, identifier: &str, error: &WikiError) -> Self {
        Self::new(stage, identifier, error.kind(), error.to_string())
    }
}

impl From<anyhow::Error> for FatalError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(FailureStage::State, "ledger", ErrorKind::Io, format!("{error:#}"))
    }
}

impl From<InvalidTransition> for FatalError {
    fn from(error: InvalidTransition) -> Self {
        Self::new(
            FailureStage::State,
            "pipeline",
            ErrorKind::Protocol,
            error.to_string(),
        )
    }
}

struct PipelineDriver<'a> {
    config: &'a PipelineConfig,
    paths: &'a ResolvedPaths,
    ledger: &'a StateLedger,
    options: &'a RunOptions,
    stage: PipelineStage,
    report: PipelineRun,
}

impl<'a> PipelineDriver<'a> {
    fn new(
        config: &'a PipelineConfig,
        paths: &'a ResolvedPaths,
        ledger: &'a StateLedger,
        options: &'a RunOptions,
    ) -> Self {
        let started_at_unix = unix_timestamp();
        Self {
            config,
            paths,
            ledger,
            options,
            stage: PipelineStage::Idle,
            report: PipelineRun {
                mode: options.mode,
                config: config.snapshot(),
                started_at_unix,
                finished_at_unix: started_at_unix,
                status: RunStatus::Success,
                stage: PipelineStage::Idle,
                workspace_slug: None,
                resumed_from: None,
                counts: RunCounts::default(),
                pages: Vec::new(),
                documents: Vec::new(),
                failures: Vec::new(),
                fatal_error: None,
                wiki_requests: 0,
                upload_requests: 0,
            },
        }
    }

    fn transition(&mut self, event: StageEvent) -> Result<(), FatalError> {
        let next = self.stage.advance(event)?;
        debug!(from = ?self.stage, to = ?next, "pipeline stage");
        self.stage = next;
        Ok(())
    }

    fn execute(&mut self, collaborators: &mut Collaborators<'_>) -> Result<(), FatalError> {
        info!(mode = self.options.mode.as_str(), "pipeline started");
        if self.options.mode.scrapes() {
            let wiki = collaborators.wiki.as_deref_mut().ok_or_else(|| {
                FatalError::new(
                    FailureStage::Setup,
                    "wiki",
                    ErrorKind::Config,
                    "wiki client is not configured".to_string(),
                )
            })?;
            self.transition(StageEvent::StartCrawl)?;
            let crawled = self.crawl(&mut *wiki);
            self.report.wiki_requests = wiki.request_count();
            crawled?;
        }
        if self.options.mode.uploads() {
            let documents = collaborators.documents.as_deref_mut().ok_or_else(|| {
                FatalError::new(
                    FailureStage::Setup,
                    "target",
                    ErrorKind::Config,
                    "document client is not configured".to_string(),
                )
            })?;
            self.transition(StageEvent::StartUpload)?;
            let uploaded = self.upload(&mut *documents);
            self.report.upload_requests = documents.request_count();
            uploaded?;
        }
        self.transition(StageEvent::Finish)
    }

    fn crawl(&mut self, wiki: &mut dyn WikiApi) -> Result<(), FatalError> {
        let base_url = self
            .config
            .wiki_api_url()
            .ok()
            .map(|api_url| article_base_url(&api_url));
        let exporter = PageExporter::new(&self.paths.export_dir, base_url).map_err(|error| {
            FatalError::new(
                FailureStage::Export,
                &self.paths.export_dir.display().to_string(),
                error.kind(),
                error.to_string(),
            )
        })?;

        let scope = ListScope::from_config(self.config);
        let scope_key = scope.key();
        let persist_cursor = self.config.limit.is_none();
        if self.options.restart {
            self.ledger.clear_crawl_cursor(&scope_key)?;
        }
        let mut saved_cursor = if self.options.restart || !persist_cursor {
            None
        } else {
            self.ledger.crawl_cursor(&scope_key)?
        };
        if let Some(cursor) = &saved_cursor {
            info!(cursor = %cursor, "resuming page listing");
            self.report.resumed_from = Some(cursor.clone());
        }

        let retry = self.config.http.retry;
        let mut listing = PageListing::resume_from(wiki, scope, retry, saved_cursor.clone());
        let mut processed = 0usize;
        loop {
            if self.config.limit.is_some_and(|limit| processed >= limit) {
                info!(processed, "page limit reached");
                break;
            }
            let title = match listing.next() {
                None => break,
                Some(Ok(title)) => title,
                Some(Err(error))
                    if self.report.resumed_from.is_some()
                        && listing.batches_fetched() == 0
                        && !error.kind().is_fatal() =>
                {
                    warn!("saved listing cursor rejected, starting over: {error}");
                    self.ledger.clear_crawl_cursor(&scope_key)?;
                    saved_cursor = None;
                    self.report.resumed_from = None;
                    listing.restart();
                    continue;
                }
                Some(Err(error)) => {
                    return Err(FatalError::wiki(FailureStage::Listing, "allpages", &error));
                }
            };
            processed += 1;
            self.report.counts.listed += 1;

            let fetched = retry.run(
                "fetch page",
                |_| listing.api_mut().fetch_page(&title),
                WikiError::kind,
            );
            match fetched {
                Ok(page) => {
                    self.report.counts.scraped += 1;
                    self.transition(StageEvent::PageFetched)?;
                    self.record_export(&title, exporter.export(&page));
                    self.transition(StageEvent::PageExported)?;
                }
                Err(error) if self.fetch_error_is_fatal(&error) => {
                    return Err(FatalError::wiki(FailureStage::Fetch, &title, &error));
                }
                Err(error) => {
                    warn!(title = %title, kind = %error.kind(), "fetch failed: {error}");
                    self.report.counts.fetch_failed += 1;
                    self.report.pages.push(PageOutcome {
                        title: title.clone(),
                        status: PageStatus::Failed,
                        file_name: None,
                        digest: None,
                        exported_at_unix: None,
                    });
                    self.record_failure(FailureStage::Fetch, &title, error.kind(), error.to_string());
                }
            }

            if persist_cursor {
                let cursor = listing.resume_cursor().map(str::to_string);
                if let Some(current) = &cursor
                    && cursor != saved_cursor
                {
                    self.ledger.set_crawl_cursor(&scope_key, current)?;
                    saved_cursor = cursor;
                }
            }
        }

        if persist_cursor && listing.is_exhausted() {
            self.ledger.clear_crawl_cursor(&scope_key)?;
        }
        info!(
            listed = self.report.counts.listed,
            exported = self.report.counts.exported,
            unchanged = self.report.counts.skipped_unchanged,
            "crawl finished"
        );
        Ok(())
    }

    /// Auth errors mean the wiki needs a login only until some page has been
    /// read; after that they are per-page read restrictions.
    fn fetch_error_is_fatal(&self, error: &WikiError) -> bool {
        match error.kind() {
            ErrorKind::Auth => self.report.counts.scraped == 0,
            kind => kind.is_fatal(),
        }
    }

    fn record_export(
        &mut self,
        title: &str,
        exported: Result<ExportedDocument, ExportError>,
    ) {
        match exported {
            Ok(document) => {
                let status = match document.outcome {
                    ExportOutcome::Exported => {
                        self.report.counts.exported += 1;
                        PageStatus::Exported
                    }
                    ExportOutcome::Updated => {
                        self.report.counts.exported += 1;
                        self.report.counts.updated += 1;
                        PageStatus::Updated
                    }
                    ExportOutcome::Unchanged => {
                        self.report.counts.skipped_unchanged += 1;
                        PageStatus::Unchanged
                    }
                };
                debug!(
                    title,
                    file = %document.file_name,
                    outcome = document.outcome.as_str(),
                    "page exported"
                );
                self.report.pages.push(PageOutcome {
                    title: title.to_string(),
                    status,
                    file_name: Some(document.file_name),
                    digest: Some(document.digest),
                    exported_at_unix: Some(document.exported_at_unix),
                });
            }
            Err(error) => {
                warn!(title, "export failed: {error}");
                self.report.counts.export_failed += 1;
                self.report.pages.push(PageOutcome {
                    title: title.to_string(),
                    status: PageStatus::Failed,
                    file_name: None,
                    digest: None,
                    exported_at_unix: None,
                });
                self.record_failure(FailureStage::Export, title, error.kind(), error.to_string());
            }
        }
    }

    fn upload(&mut self, documents: &mut dyn DocumentApi) -> Result<(), FatalError> {
        let files = list_exported_documents(&self.paths.export_dir).map_err(|error| {
            FatalError::new(
                FailureStage::Upload,
                &self.paths.export_dir.display().to_string(),
                ErrorKind::Io,
                format!("{error:#}"),
            )
        })?;
        if files.is_empty() {
            warn!(dir = %self.paths.export_dir.display(), "no documents to upload");
        }

        let mut client = UploadClient::new(documents, self.ledger, self.config.http.retry);
        client.verify_access().map_err(|error| {
            FatalError::new(FailureStage::Setup, "target", error.kind(), error.to_string())
        })?;
        let workspace = client
            .ensure_workspace(&self.config.workspace)
            .map_err(|error| {
                FatalError::new(
                    FailureStage::Setup,
                    &self.config.workspace,
                    error.kind(),
                    error.to_string(),
                )
            })?;
        info!(workspace = %workspace.slug, files = files.len(), "uploading documents");
        self.report.workspace_slug = Some(workspace.slug.clone());

        for path in files {
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let (status, location) = match client.upload_document(&workspace, &path)? {
                DocumentOutcome::Uploaded { location, replaced } => {
                    self.report.counts.upload_succeeded += 1;
                    let status = if replaced.is_some() {
                        DocumentStatus::Replaced
                    } else {
                        DocumentStatus::Uploaded
                    };
                    (status, Some(location))
                }
                DocumentOutcome::Reattached { location } => {
                    self.report.counts.upload_succeeded += 1;
                    (DocumentStatus::Reattached, Some(location))
                }
                DocumentOutcome::Unchanged => {
                    self.report.counts.upload_skipped_unchanged += 1;
                    (DocumentStatus::Unchanged, None)
                }
                DocumentOutcome::Unattached { location, error } => {
                    self.report.counts.upload_unattached += 1;
                    self.record_failure(
                        FailureStage::Attach,
                        &file_name,
                        error.kind(),
                        error.to_string(),
                    );
                    (DocumentStatus::Unattached, Some(location))
                }
                DocumentOutcome::Failed(error) if error.kind().is_fatal() => {
                    return Err(FatalError::new(
                        FailureStage::Upload,
                        &file_name,
                        error.kind(),
                        error.to_string(),
                    ));
                }
                DocumentOutcome::Failed(error) => {
                    self.report.counts.upload_failed += 1;
                    self.record_failure(
                        FailureStage::Upload,
                        &file_name,
                        error.kind(),
                        error.to_string(),
                    );
                    (DocumentStatus::Failed, None)
                }
            };
            self.report.documents.push(DocumentReport {
                file_name,
                status,
                location,
            });
        }
        info!(
            uploaded = self.report.counts.upload_succeeded,
            unchanged = self.report.counts.upload_skipped_unchanged,
            failed = self.report.counts.upload_failed,
            "upload finished"
        );
        Ok(())
    }

    fn record_failure(
        &mut self,
        stage: FailureStage,
        identifier: &str,
        kind: ErrorKind,
        message: String,
    ) {
        self.report.failures.push(FailureRecord {
            stage,
            identifier: identifier.to_string(),
            kind,
            message,
        });
    }

    fn finish(&mut self, outcome: Result<(), FatalError>) -> PipelineRun {
        match outcome {
            Ok(()) => {
                self.stage = self
                    .stage
                    .advance(StageEvent::Reported)
                    .unwrap_or(PipelineStage::Failed);
            }
            Err(fatal) => {
                warn!(stage = ?fatal.stage, kind = %fatal.kind, "run failed: {}", fatal.message);
                self.stage = self
                    .stage
                    .advance(StageEvent::Fatal)
                    .unwrap_or(PipelineStage::Failed);
                self.report.fatal_error = Some(fatal.message.clone());
                self.record_failure(fatal.stage, &fatal.identifier, fatal.kind, fatal.message);
            }
        }

        let mut report = self.report.clone();
        report.stage = self.stage;
        report.finished_at_unix = unix_timestamp();
        report.status = if report.fatal_error.is_some() || self.stage == PipelineStage::Failed {
            RunStatus::Failed
        } else if report.failures.is_empty() {
            RunStatus::Success
        } else {
            RunStatus::Partial
        };
        report.pages.sort_by(|left, right| left.title.cmp(&right.title));
        report
            .documents
            .sort_by(|left, right| left.file_name.cmp(&right.file_name));
        report.failures.sort_by(|left, right| {
            left.identifier
                .cmp(&right.identifier)
                .then_with(|| left.message.cmp(&right.message))
        });
        info!(status = report.status.as_str(), "pipeline finished");
        report
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}
