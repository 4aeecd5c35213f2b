use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{PipelineConfig, WikiCredentials};
use crate::digest::compute_hash;
use crate::error::WikiError;
use crate::retry::{RequestPacer, RetryPolicy};
use crate::wikitext;

pub const NS_MAIN: i32 = 0;

/// One revision of a wiki page as returned by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WikiPage {
    pub title: String,
    pub namespace: i32,
    pub page_id: i64,
    pub revision_id: i64,
    pub timestamp: String,
    pub content: String,
    /// Hash of the normalized body, see [`WikiPage::markdown`].
    pub digest: String,
}

impl WikiPage {
    pub fn new(
        title: String,
        namespace: i32,
        page_id: i64,
        revision_id: i64,
        timestamp: String,
        content: String,
    ) -> Self {
        let digest = compute_hash(wikitext::to_markdown(&content).as_bytes());
        Self {
            title,
            namespace,
            page_id,
            revision_id,
            timestamp,
            content,
            digest,
        }
    }

    pub fn markdown(&self) -> String {
        wikitext::to_markdown(&self.content)
    }
}

/// Which part of the page index to enumerate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListScope {
    pub namespace: i32,
    pub prefix: Option<String>,
    pub include_redirects: bool,
    pub batch_size: usize,
}

impl ListScope {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            namespace: config.namespace,
            prefix: config.prefix.clone(),
            include_redirects: config.include_redirects,
            batch_size: config.batch_size,
        }
    }

    /// Key under which a resume cursor for this scope is stored.
    pub fn key(&self) -> String {
        format!(
            "allpages:ns={}:prefix={}:redirects={}",
            self.namespace,
            self.prefix.as_deref().unwrap_or(""),
            self.include_redirects
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageBatch {
    pub titles: Vec<String>,
    pub next_cursor: Option<String>,
}

pub trait WikiApi {
    fn login(&mut self, username: &str, password: &str) -> Result<(), WikiError>;
    fn list_pages(&mut self, scope: &ListScope, cursor: Option<&str>)
    -> Result<PageBatch, WikiError>;
    fn fetch_page(&mut self, title: &str) -> Result<WikiPage, WikiError>;
    fn request_count(&self) -> usize;
}

/// Lazy, de-duplicating walk over the page index. Batches are requested only
/// when the previous one has been consumed, so memory stays bounded by one
/// batch plus the set of titles already yielded.
pub struct PageListing<'a, A: WikiApi + ?Sized> {
    api: &'a mut A,
    scope: ListScope,
    retry: RetryPolicy,
    buffer: VecDeque<String>,
    batch_cursor: Option<String>,
    next_cursor: Option<String>,
    batches: usize,
    exhausted: bool,
    failed: bool,
    seen: BTreeSet<String>,
}

impl<'a, A: WikiApi + ?Sized> PageListing<'a, A> {
    pub fn new(api: &'a mut A, scope: ListScope, retry: RetryPolicy) -> Self {
        Self::resume_from(api, scope, retry, None)
    }

    pub fn resume_from(
        api: &'a mut A,
        scope: ListScope,
        retry: RetryPolicy,
        cursor: Option<String>,
    ) -> Self {
        Self {
            api,
            scope,
            retry,
            buffer: VecDeque::new(),
            batch_cursor: cursor.clone(),
            next_cursor: cursor,
            batches: 0,
            exhausted: false,
            failed: false,
            seen: BTreeSet::new(),
        }
    }

    pub fn api_mut(&mut self) -> &mut A {
        &mut *self.api
    }

    /// Cursor from which a fresh listing would reproduce every title not yet
    /// handed out. `None` means "from the beginning" before the first batch
    /// and "nothing left" once exhausted.
    pub fn resume_cursor(&self) -> Option<&str> {
        if self.buffer.is_empty() {
            self.next_cursor.as_deref()
        } else {
            self.batch_cursor.as_deref()
        }
    }

    pub fn batches_fetched(&self) -> usize {
        self.batches
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted && self.buffer.is_empty()
    }

    /// Forgets all progress and starts over from the first title.
    pub fn restart(&mut self) {
        self.buffer.clear();
        self.batch_cursor = None;
        self.next_cursor = None;
        self.batches = 0;
        self.exhausted = false;
        self.failed = false;
        self.seen.clear();
    }

    fn fill(&mut self) -> Result<(), WikiError> {
        let cursor = self.next_cursor.clone();
        let retry = self.retry;
        let scope = &self.scope;
        let api = &mut *self.api;
        let batch = retry.run(
            "list pages",
            |_| api.list_pages(scope, cursor.as_deref()),
            WikiError::kind,
        )?;
        debug!(
            titles = batch.titles.len(),
            cursor = cursor.as_deref().unwrap_or(""),
            "fetched page index batch"
        );

        self.batches += 1;
        self.batch_cursor = cursor;
        self.next_cursor = batch.next_cursor;
        if self.next_cursor.is_none() {
            self.exhausted = true;
        }
        self.buffer.extend(batch.titles);
        Ok(())
    }
}

impl<A: WikiApi + ?Sized> Iterator for PageListing<'_, A> {
    type Item = Result<String, WikiError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            while let Some(title) = self.buffer.pop_front() {
                if self.seen.insert(normalize_title(&title)) {
                    return Some(Ok(title));
                }
            }
            if self.exhausted || self.failed {
                return None;
            }
            if let Err(error) = self.fill() {
                self.failed = true;
                return Some(Err(error));
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_ms: u64,
}

impl MediaWikiClientConfig {
    pub fn from_pipeline(config: &PipelineConfig) -> Result<Self, WikiError> {
        let api_url = config
            .wiki_api_url()
            .map_err(|error| WikiError::Config(error.to_string()))?;
        Ok(Self {
            api_url,
            user_agent: config.http.user_agent.clone(),
            timeout_ms: config.http.timeout_ms,
            rate_limit_ms: config.http.wiki_rate_limit_ms,
        })
    }
}

pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    pacer: RequestPacer,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self, WikiError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .cookie_store(true)
            .build()
            .map_err(|error| {
                WikiError::Config(format!("failed to build MediaWiki HTTP client: {error}"))
            })?;

        Ok(Self {
            client,
            pacer: RequestPacer::new(config.rate_limit_ms),
            config,
        })
    }

    /// Builds a client and, when credentials are configured, logs in. A
    /// rejected login is returned as `AuthRequired`.
    pub fn connect(config: &PipelineConfig) -> Result<Self, WikiError> {
        let mut client = Self::new(MediaWikiClientConfig::from_pipeline(config)?)?;
        if let WikiCredentials::Login { username, password } = &config.credentials {
            config.http.retry.run(
                "login",
                |_| client.login(username, password),
                WikiError::kind,
            )?;
            info!(username = %username, "logged in to MediaWiki");
        }
        Ok(client)
    }

    pub fn api_url(&self) -> &str {
        &self.config.api_url
    }

    fn send(&mut self, params: &[(&str, String)], post: bool) -> Result<Value, WikiError> {
        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format", "json".to_string()));
        pairs.push(("formatversion", "2".to_string()));
        for (key, value) in params {
            if !value.is_empty() {
                pairs.push((*key, value.clone()));
            }
        }

        self.pacer.pace();
        let request = if post {
            self.client.post(&self.config.api_url).form(&pairs)
        } else {
            self.client.get(&self.config.api_url).query(&pairs)
        };
        let response = request.send().map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }
        let payload: Value = response.json().map_err(|error| {
            WikiError::Protocol(format!("failed to decode MediaWiki API JSON response: {error}"))
        })?;
        if let Some(error) = payload.get("error") {
            return Err(classify_api_error(error));
        }
        Ok(payload)
    }
}

impl WikiApi for MediaWikiClient {
    fn login(&mut self, username: &str, password: &str) -> Result<(), WikiError> {
        let token_response = self.send(
            &[
                ("action", "query".to_string()),
                ("meta", "tokens".to_string()),
                ("type", "login".to_string()),
            ],
            false,
        )?;
        let token_payload: TokenQueryResponse = decode(token_response, "login token")?;
        let login_token = token_payload
            .query
            .tokens
            .and_then(|tokens| tokens.logintoken)
            .ok_or_else(|| WikiError::Protocol("failed to get MediaWiki login token".to_string()))?;

        let login_response = self.send(
            &[
                ("action", "login".to_string()),
                ("lgname", username.to_string()),
                ("lgpassword", password.to_string()),
                ("lgtoken", login_token),
            ],
            true,
        )?;
        let login_payload: LoginResponse = decode(login_response, "login")?;
        match login_payload.login.result.as_deref() {
            Some("Success") => Ok(()),
            other => Err(WikiError::AuthRequired(format!(
                "MediaWiki login failed: {}",
                login_payload
                    .login
                    .reason
                    .or_else(|| other.map(ToString::to_string))
                    .unwrap_or_else(|| "unknown error".to_string())
            ))),
        }
    }

    fn list_pages(
        &mut self,
        scope: &ListScope,
        cursor: Option<&str>,
    ) -> Result<PageBatch, WikiError> {
        let mut params = vec![
            ("action", "query".to_string()),
            ("list", "allpages".to_string()),
            ("apnamespace", scope.namespace.to_string()),
            ("aplimit", scope.batch_size.to_string()),
        ];
        if let Some(prefix) = &scope.prefix {
            params.push(("apprefix", prefix.clone()));
        }
        if !scope.include_redirects {
            params.push(("apfilterredir", "nonredirects".to_string()));
        }
        if let Some(cursor) = cursor {
            params.push(("apcontinue", cursor.to_string()));
        }

        let response = self.send(&params, false)?;
        let parsed: QueryResponse = decode(response, "allpages")?;
        Ok(PageBatch {
            titles: parsed
                .query
                .allpages
                .into_iter()
                .map(|item| item.title)
                .collect(),
            next_cursor: parsed.continuation.and_then(|cont| cont.apcontinue),
        })
    }

    fn fetch_page(&mut self, title: &str) -> Result<WikiPage, WikiError> {
        let params = vec![
            ("action", "query".to_string()),
            ("titles", title.to_string()),
            ("prop", "revisions".to_string()),
            ("rvprop", "content|timestamp|ids".to_string()),
            ("rvslots", "main".to_string()),
        ];
        let response = self.send(&params, false)?;
        let parsed: QueryResponse = decode(response, "page content")?;
        page_from_query(parsed, title)
    }

    fn request_count(&self) -> usize {
        self.pacer.request_count()
    }
}

fn page_from_query(parsed: QueryResponse, title: &str) -> Result<WikiPage, WikiError> {
    let page = parsed
        .query
        .pages
        .into_iter()
        .next()
        .ok_or_else(|| WikiError::NotFound(title.to_string()))?;
    if page.missing.unwrap_or(false) || page.invalid.unwrap_or(false) {
        return Err(WikiError::NotFound(page.title));
    }
    let revision = page
        .revisions
        .into_iter()
        .next()
        .ok_or_else(|| WikiError::NotFound(format!("{title} has no revisions")))?;
    let content = revision
        .slots
        .and_then(|slots| slots.main)
        .map(|slot| slot.content)
        .ok_or_else(|| WikiError::Protocol(format!("{title}: main slot missing in response")))?;

    Ok(WikiPage::new(
        page.title,
        page.ns,
        page.pageid.unwrap_or_default(),
        revision.revid,
        revision.timestamp,
        content,
    ))
}

/// MediaWiki treats `_` and space as the same character in titles.
pub fn normalize_title(title: &str) -> String {
    title.replace('_', " ").trim().to_string()
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value, what: &str) -> Result<T, WikiError> {
    serde_json::from_value(value)
        .map_err(|error| WikiError::Protocol(format!("failed to decode {what} API response: {error}")))
}

fn classify_transport_error(error: reqwest::Error) -> WikiError {
    if error.is_builder() {
        WikiError::Config(format!("invalid MediaWiki request: {error}"))
    } else {
        WikiError::Transient(format!("failed to call MediaWiki API: {error}"))
    }
}

fn classify_status(status: StatusCode) -> WikiError {
    let message = format!("MediaWiki API request failed with HTTP {status}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => WikiError::AuthRequired(message),
        StatusCode::TOO_MANY_REQUESTS => WikiError::RateLimited(message),
        StatusCode::REQUEST_TIMEOUT => WikiError::Transient(message),
        status if status.is_server_error() => WikiError::Transient(message),
        _ => WikiError::Protocol(message),
    }
}

fn classify_api_error(error: &Value) -> WikiError {
    let code = error
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or("unknown_error");
    let info = error
        .get("info")
        .and_then(Value::as_str)
        .unwrap_or("unknown info");
    let message = format!("MediaWiki API error [{code}]: {info}");
    match code {
        "readapidenied" | "permissiondenied" | "notloggedin" | "assertuserfailed"
        | "mwoauth-invalid-authorization" => WikiError::AuthRequired(message),
        "ratelimited" | "maxlag" => WikiError::RateLimited(message),
        "missingtitle" => WikiError::NotFound(message),
        _ => WikiError::Protocol(message),
    }
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
    #[serde(default, rename = "continue")]
    continuation: Option<ContinuationPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    allpages: Vec<TitleQueryItem>,
    #[serde(default)]
    pages: Vec<PageQueryItem>,
}

#[derive(Debug, Deserialize, Default)]
struct ContinuationPayload {
    apcontinue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TitleQueryItem {
    title: String,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    pageid: Option<i64>,
    #[serde(default)]
    ns: i32,
    title: String,
    missing: Option<bool>,
    invalid: Option<bool>,
    #[serde(default)]
    revisions: Vec<RevisionQueryItem>,
}

#[derive(Debug, Deserialize)]
struct RevisionQueryItem {
    revid: i64,
    timestamp: String,
    slots: Option<RevisionSlotContainer>,
}

#[derive(Debug, Deserialize)]
struct RevisionSlotContainer {
    main: Option<RevisionMainSlot>,
}

#[derive(Debug, Deserialize)]
struct RevisionMainSlot {
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryResponse {
    #[serde(default)]
    query: TokenQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryPayload {
    tokens: Option<TokenPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenPayload {
    logintoken: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LoginResponse {
    #[serde(default)]
    login: LoginPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use serde_json::json;

    use super::{
        ListScope, PageListing, QueryResponse, WikiPage, classify_api_error, classify_status,
        page_from_query,
    };
    use crate::error::{ErrorKind, WikiError};
    use crate::retry::RetryPolicy;
    use crate::testing::MockWiki;

    fn scope(batch_size: usize) -> ListScope {
        ListScope {
            namespace: 0,
            prefix: None,
            include_redirects: false,
            batch_size,
        }
    }

    fn wiki_with(count: usize) -> MockWiki {
        let mut wiki = MockWiki::default();
        for index in 0..count {
            wiki.add_page(&format!("Page {index:03}"), "body");
        }
        wiki
    }

    #[test]
    fn listing_yields_every_title_regardless_of_batch_size() {
        for batch_size in [1, 2, 3, 7, 50] {
            let mut wiki = wiki_with(10);
            let titles = PageListing::new(&mut wiki, scope(batch_size), RetryPolicy::none())
                .collect::<Result<Vec<_>, _>>()
                .expect("listing");
            assert_eq!(titles.len(), 10, "batch size {batch_size}");
            assert_eq!(titles[0], "Page 000");
            assert_eq!(titles[9], "Page 009");
            assert_eq!(wiki.list_calls, 10_usize.div_ceil(batch_size));
        }
    }

    #[test]
    fn listing_drops_duplicate_titles_across_batches() {
        let mut wiki = wiki_with(4);
        wiki.duplicate_batch_edges = true;
        let titles = PageListing::new(&mut wiki, scope(2), RetryPolicy::none())
            .collect::<Result<Vec<_>, _>>()
            .expect("listing");
        assert_eq!(titles, vec!["Page 000", "Page 001", "Page 002", "Page 003"]);
    }

    #[test]
    fn listing_is_lazy_and_tracks_resume_cursor() {
        let mut wiki = wiki_with(5);
        let mut listing = PageListing::new(&mut wiki, scope(2), RetryPolicy::none());
        assert_eq!(listing.resume_cursor(), None);

        assert_eq!(listing.next().expect("item").expect("title"), "Page 000");
        assert_eq!(listing.batches_fetched(), 1);
        assert_eq!(listing.resume_cursor(), None);

        assert_eq!(listing.next().expect("item").expect("title"), "Page 001");
        assert_eq!(listing.resume_cursor(), Some("Page 002"));

        assert_eq!(listing.next().expect("item").expect("title"), "Page 002");
        assert_eq!(listing.batches_fetched(), 2);
        assert_eq!(listing.resume_cursor(), Some("Page 002"));
        assert!(!listing.is_exhausted());
    }

    #[test]
    fn listing_resumes_from_cursor() {
        let mut wiki = wiki_with(5);
        let titles = PageListing::resume_from(
            &mut wiki,
            scope(2),
            RetryPolicy::none(),
            Some("Page 003".to_string()),
        )
        .collect::<Result<Vec<_>, _>>()
        .expect("listing");
        assert_eq!(titles, vec!["Page 003", "Page 004"]);
    }

    #[test]
    fn listing_stops_after_error() {
        let mut wiki = wiki_with(3);
        wiki.fail_listing = true;
        let mut listing = PageListing::new(&mut wiki, scope(2), RetryPolicy::none());
        let first = listing.next().expect("item");
        assert!(first.is_err());
        assert!(listing.next().is_none());
    }

    #[test]
    fn digest_ignores_markup_only_changes() {
        let plain = WikiPage::new(
            "Home".to_string(),
            0,
            1,
            1,
            "2026-01-01T00:00:00Z".to_string(),
            "Welcome {{Navbox}}".to_string(),
        );
        let with_other_template = WikiPage::new(
            "Home".to_string(),
            0,
            1,
            2,
            "2026-01-02T00:00:00Z".to_string(),
            "Welcome {{Sidebar}}".to_string(),
        );
        assert_eq!(plain.digest, with_other_template.digest);
        assert_eq!(plain.markdown(), "Welcome");
    }

    #[test]
    fn api_errors_map_to_taxonomy() {
        let denied = classify_api_error(&json!({"code": "readapidenied", "info": "login"}));
        assert_eq!(denied.kind(), ErrorKind::Auth);
        let lagged = classify_api_error(&json!({"code": "maxlag", "info": "lag"}));
        assert_eq!(lagged.kind(), ErrorKind::RateLimited);
        let other = classify_api_error(&json!({"code": "badcontinue", "info": "bad"}));
        assert_eq!(other.kind(), ErrorKind::Protocol);
        assert!(other.to_string().contains("[badcontinue]"));
    }

    #[test]
    fn http_statuses_map_to_taxonomy() {
        assert_eq!(classify_status(StatusCode::FORBIDDEN).kind(), ErrorKind::Auth);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS).kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY).kind(),
            ErrorKind::TransientNetwork
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND).kind(), ErrorKind::Protocol);
    }

    #[test]
    fn missing_page_is_not_found() {
        let parsed: QueryResponse = serde_json::from_value(json!({
            "query": {"pages": [{"ns": 0, "title": "Ghost", "missing": true}]}
        }))
        .expect("decode");
        let error = page_from_query(parsed, "Ghost").expect_err("missing");
        assert!(matches!(error, WikiError::NotFound(_)));
    }

    #[test]
    fn revision_content_is_extracted() {
        let parsed: QueryResponse = serde_json::from_value(json!({
            "query": {"pages": [{
                "pageid": 7, "ns": 0, "title": "Setup",
                "revisions": [{
                    "revid": 42, "timestamp": "2026-03-01T10:00:00Z",
                    "slots": {"main": {"content": "Install it."}}
                }]
            }]}
        }))
        .expect("decode");
        let page = page_from_query(parsed, "Setup").expect("page");
        assert_eq!(page.page_id, 7);
        assert_eq!(page.revision_id, 42);
        assert_eq!(page.content, "Install it.");
        assert_eq!(page.digest.len(), 16);
    }
}
