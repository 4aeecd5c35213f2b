//! In-memory stand-ins for the wiki and the document platform.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{UploadError, WikiError};
use crate::upload::{DocumentApi, Workspace};
use crate::wiki::{ListScope, PageBatch, WikiApi, WikiPage};

#[derive(Debug, Default)]
pub struct MockWiki {
    pages: BTreeMap<String, String>,
    /// Titles that are listed but cannot be fetched.
    pub missing: BTreeSet<String>,
    /// Titles whose content is read-protected.
    pub protected: BTreeSet<String>,
    /// Remaining rate-limited responses per title.
    pub rate_limited: BTreeMap<String, usize>,
    pub require_login: bool,
    pub valid_login: Option<(String, String)>,
    pub logged_in: bool,
    pub fail_listing: bool,
    /// Fail every listing call after this many.
    pub fail_listing_after: Option<usize>,
    /// Repeat the previous batch's last title at the head of each batch.
    pub duplicate_batch_edges: bool,
    pub list_calls: usize,
    pub fetches: Vec<String>,
    requests: usize,
}

impl MockWiki {
    pub fn with_pages(pages: &[(&str, &str)]) -> Self {
        let mut wiki = Self::default();
        for (title, content) in pages {
            wiki.add_page(title, content);
        }
        wiki
    }

    pub fn add_page(&mut self, title: &str, content: &str) {
        self.pages.insert(title.to_string(), content.to_string());
    }

    fn titles(&self, scope: &ListScope) -> Vec<String> {
        self.pages
            .keys()
            .chain(self.missing.iter())
            .filter(|title| {
                scope
                    .prefix
                    .as_deref()
                    .is_none_or(|prefix| title.starts_with(prefix))
            })
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl WikiApi for MockWiki {
    fn login(&mut self, username: &str, password: &str) -> Result<(), WikiError> {
        self.requests += 1;
        match &self.valid_login {
            Some((user, pass)) if user == username && pass == password => {
                self.logged_in = true;
                Ok(())
            }
            _ => Err(WikiError::AuthRequired(
                "MediaWiki login failed: WrongPass".to_string(),
            )),
        }
    }

    fn list_pages(
        &mut self,
        scope: &ListScope,
        cursor: Option<&str>,
    ) -> Result<PageBatch, WikiError> {
        self.requests += 1;
        self.list_calls += 1;
        let past_budget = self
            .fail_listing_after
            .is_some_and(|calls| self.list_calls > calls);
        if self.fail_listing || past_budget {
            return Err(WikiError::Protocol("allpages unavailable".to_string()));
        }
        if self.require_login && !self.logged_in {
            return Err(WikiError::AuthRequired("readapidenied".to_string()));
        }

        let titles = self.titles(scope);
        let start = cursor.map_or(0, |cursor| {
            titles
                .iter()
                .position(|title| title.as_str() >= cursor)
                .unwrap_or(titles.len())
        });
        let end = (start + scope.batch_size).min(titles.len());
        let mut batch = titles[start..end].to_vec();
        if self.duplicate_batch_edges && start > 0 {
            batch.insert(0, titles[start - 1].clone());
        }
        Ok(PageBatch {
            titles: batch,
            next_cursor: titles.get(end).cloned(),
        })
    }

    fn fetch_page(&mut self, title: &str) -> Result<WikiPage, WikiError> {
        self.requests += 1;
        self.fetches.push(title.to_string());
        if self.require_login && !self.logged_in {
            return Err(WikiError::AuthRequired("readapidenied".to_string()));
        }
        if self.protected.contains(title) {
            return Err(WikiError::AuthRequired(format!("permissiondenied: {title}")));
        }
        if let Some(remaining) = self.rate_limited.get_mut(title)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(WikiError::RateLimited("ratelimited".to_string()));
        }
        let position = self.pages.keys().position(|key| key == title);
        match (self.pages.get(title), position) {
            (Some(content), Some(position)) => Ok(WikiPage::new(
                title.to_string(),
                0,
                i64::try_from(position).unwrap_or_default() + 1,
                1,
                "2026-01-01T00:00:00Z".to_string(),
                content.clone(),
            )),
            _ => Err(WikiError::NotFound(title.to_string())),
        }
    }

    fn request_count(&self) -> usize {
        self.requests
    }
}

#[derive(Debug, Default)]
pub struct MockDocuments {
    pub workspaces: Vec<Workspace>,
    pub created: Vec<String>,
    /// File names of successful uploads, in order.
    pub uploads: Vec<String>,
    pub upload_attempts: usize,
    pub embeddings: Vec<(String, Vec<String>, Vec<String>)>,
    pub reject_auth: bool,
    pub conflict_on_create: bool,
    pub fail_attach: bool,
    pub fail_uploads: BTreeSet<String>,
    pub requests: usize,
}

impl MockDocuments {
    fn insert_workspace(&mut self, name: &str) -> Workspace {
        let workspace = Workspace {
            id: i64::try_from(self.workspaces.len()).unwrap_or_default() + 1,
            name: name.to_string(),
            slug: name.to_lowercase().replace(' ', "-"),
        };
        self.workspaces.push(workspace.clone());
        workspace
    }
}

impl DocumentApi for MockDocuments {
    fn verify_access(&mut self) -> Result<(), UploadError> {
        self.requests += 1;
        if self.reject_auth {
            return Err(UploadError::Auth("HTTP 403 Forbidden: Invalid API Key".to_string()));
        }
        Ok(())
    }

    fn list_workspaces(&mut self) -> Result<Vec<Workspace>, UploadError> {
        self.requests += 1;
        Ok(self.workspaces.clone())
    }

    fn create_workspace(&mut self, name: &str) -> Result<Workspace, UploadError> {
        self.requests += 1;
        if self.conflict_on_create {
            self.insert_workspace(name);
            return Err(UploadError::Conflict(format!("workspace {name} exists")));
        }
        self.created.push(name.to_string());
        Ok(self.insert_workspace(name))
    }

    fn upload_document(&mut self, file_name: &str, _content: &[u8]) -> Result<String, UploadError> {
        self.requests += 1;
        self.upload_attempts += 1;
        if self.reject_auth {
            return Err(UploadError::Auth("HTTP 401 Unauthorized".to_string()));
        }
        if self.fail_uploads.contains(file_name) {
            return Err(UploadError::Server("HTTP 502 Bad Gateway".to_string()));
        }
        self.uploads.push(file_name.to_string());
        Ok(format!(
            "custom-documents/{file_name}-{}.json",
            self.uploads.len()
        ))
    }

    fn update_embeddings(
        &mut self,
        workspace_slug: &str,
        adds: &[String],
        deletes: &[String],
    ) -> Result<(), UploadError> {
        self.requests += 1;
        if self.fail_attach {
            return Err(UploadError::Server("HTTP 500 embedding failed".to_string()));
        }
        self.embeddings
            .push((workspace_slug.to_string(), adds.to_vec(), deletes.to_vec()));
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.requests
    }
}
