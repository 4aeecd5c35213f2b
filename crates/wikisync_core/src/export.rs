use std::fs;
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tempfile::NamedTempFile;

use crate::digest::compute_hash;
use crate::error::ExportError;
use crate::runtime::normalize_for_display;
use crate::wiki::WikiPage;

pub const DOCUMENT_EXTENSION: &str = "md";
/// Leaves room for `-{8 hex}.md` under the 255-byte file name limit.
const MAX_STEM_BYTES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportOutcome {
    Exported,
    Updated,
    Unchanged,
}

impl ExportOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exported => "exported",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedDocument {
    pub title: String,
    pub file_name: String,
    pub path: PathBuf,
    pub digest: String,
    pub outcome: ExportOutcome,
    pub bytes: usize,
    /// When the file content was last written. Kept out of the document
    /// itself so the digest alone determines its bytes.
    pub exported_at_unix: u64,
}

/// Writes one Markdown document per wiki page into a flat directory.
#[derive(Debug, Clone)]
pub struct PageExporter {
    export_dir: PathBuf,
    article_base_url: Option<String>,
}

impl PageExporter {
    pub fn new(export_dir: &Path, article_base_url: Option<String>) -> Result<Self, ExportError> {
        fs::create_dir_all(export_dir).map_err(|source| ExportError::Io {
            path: normalize_for_display(export_dir),
            source,
        })?;
        Ok(Self {
            export_dir: export_dir.to_path_buf(),
            article_base_url,
        })
    }

    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }

    pub fn path_for(&self, title: &str) -> PathBuf {
        self.export_dir.join(document_file_name(title))
    }

    /// Document body: title heading, normalized text, provenance footer. The
    /// output depends only on the page title, its digest input and the base
    /// URL, so re-exporting an unchanged page yields identical bytes.
    pub fn render(&self, page: &WikiPage) -> String {
        let markdown = page.markdown();
        let mut out = format!("# {}\n\n", page.title);
        if !markdown.is_empty() {
            out.push_str(&markdown);
            out.push_str("\n\n");
        }
        out.push_str("---\nSource: MediaWiki\n");
        out.push_str(&format!("Page: {}\n", page.title));
        if let Some(base) = &self.article_base_url {
            out.push_str(&format!("URL: {base}{}\n", page.title.replace(' ', "_")));
        }
        out.push_str(&format!("Digest: {}\n", page.digest));
        out
    }

    pub fn export(&self, page: &WikiPage) -> Result<ExportedDocument, ExportError> {
        let file_name = document_file_name(&page.title);
        let path = self.export_dir.join(&file_name);
        let rendered = self.render(page);

        let outcome = match fs::read(&path) {
            Ok(existing) if existing == rendered.as_bytes() => ExportOutcome::Unchanged,
            Ok(_) => ExportOutcome::Updated,
            Err(error) if error.kind() == IoErrorKind::NotFound => ExportOutcome::Exported,
            Err(source) => {
                return Err(ExportError::Io {
                    path: normalize_for_display(&path),
                    source,
                });
            }
        };
        let exported_at_unix = if outcome == ExportOutcome::Unchanged {
            fs::metadata(&path)
                .and_then(|metadata| metadata.modified())
                .map(unix_seconds)
                .unwrap_or_else(|_| unix_seconds(SystemTime::now()))
        } else {
            write_atomic(&self.export_dir, &path, rendered.as_bytes())?;
            unix_seconds(SystemTime::now())
        };

        Ok(ExportedDocument {
            title: page.title.clone(),
            file_name,
            path,
            digest: page.digest.clone(),
            outcome,
            bytes: rendered.len(),
            exported_at_unix,
        })
    }
}

/// Filesystem-safe file name for a page title.
///
/// Whitespace runs become `_` and characters that are reserved on common
/// filesystems are replaced. When that loses information, or the stem is cut
/// at the length cap, an 8-hex suffix derived from the full title keeps names
/// distinct.
pub fn document_file_name(title: &str) -> String {
    let joined = title.split_whitespace().collect::<Vec<_>>().join("_");
    let sanitized: String = joined
        .chars()
        .map(|ch| match ch {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect();
    let stem = truncate_bytes(
        sanitized.trim_matches(|ch| ch == '.' || ch == '_'),
        MAX_STEM_BYTES,
    );

    let hash = compute_hash(title.as_bytes());
    let suffix = &hash[..8];
    let stem = if stem.is_empty() {
        format!("page-{suffix}")
    } else if stem != joined {
        format!("{stem}-{suffix}")
    } else {
        stem.to_string()
    };
    format!("{stem}.{DOCUMENT_EXTENSION}")
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}

fn truncate_bytes(value: &str, max_bytes: usize) -> &str {
    if value.len() <= max_bytes {
        return value;
    }
    let mut end = max_bytes;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

fn write_atomic(dir: &Path, path: &Path, content: &[u8]) -> Result<(), ExportError> {
    let io_error = |source| ExportError::Io {
        path: normalize_for_display(path),
        source,
    };
    let mut temp = NamedTempFile::new_in(dir).map_err(io_error)?;
    temp.write_all(content).map_err(io_error)?;
    temp.as_file().sync_all().map_err(io_error)?;
    temp.persist(path).map_err(|error| io_error(error.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::{ExportOutcome, PageExporter, document_file_name};
    use crate::wiki::WikiPage;

    fn page(title: &str, content: &str) -> WikiPage {
        WikiPage::new(
            title.to_string(),
            0,
            1,
            1,
            "2026-01-01T00:00:00Z".to_string(),
            content.to_string(),
        )
    }

    #[test]
    fn plain_titles_keep_their_name() {
        assert_eq!(document_file_name("Home"), "Home.md");
        assert_eq!(document_file_name("Getting started"), "Getting_started.md");
        assert_eq!(document_file_name("  Spaced   out "), "Spaced_out.md");
    }

    #[test]
    fn reserved_characters_get_a_hash_suffix() {
        let colon = document_file_name("Help:Contents");
        let slash = document_file_name("Help/Contents");
        assert!(colon.starts_with("Help_Contents-"));
        assert!(slash.starts_with("Help_Contents-"));
        assert_ne!(colon, slash);
        assert_ne!(colon, document_file_name("Help_Contents"));
        assert!(colon.ends_with(".md"));
    }

    #[test]
    fn empty_and_long_titles_are_handled() {
        assert!(document_file_name("...").starts_with("page-"));
        let long = "x".repeat(300);
        let name = document_file_name(&long);
        assert!(name.len() < 220);
        assert_ne!(name, document_file_name(&"x".repeat(301)));
    }

    #[test]
    fn long_multibyte_titles_fit_the_file_name_limit() {
        let title = "漢".repeat(85);
        let name = document_file_name(&title);
        assert!(name.len() <= 255, "{} bytes", name.len());
        assert!(name.starts_with(&"漢".repeat(66)));
        assert!(name.ends_with(".md"));
        assert_ne!(name, document_file_name(&"漢".repeat(86)));

        let temp = tempdir().expect("tempdir");
        let exporter = PageExporter::new(temp.path(), None).expect("exporter");
        let exported = exporter.export(&page(&title, "body")).expect("export");
        assert_eq!(exported.outcome, ExportOutcome::Exported);
        assert!(exported.path.exists());
    }

    #[test]
    fn export_writes_then_reports_unchanged() {
        let temp = tempdir().expect("tempdir");
        let exporter = PageExporter::new(
            &temp.path().join("out"),
            Some("https://wiki.example.com/index.php?title=".to_string()),
        )
        .expect("exporter");

        let first = exporter
            .export(&page("Main Page", "Hello '''world'''."))
            .expect("export");
        assert_eq!(first.outcome, ExportOutcome::Exported);
        assert!(first.exported_at_unix > 0);
        let written = fs::read_to_string(&first.path).expect("read");
        assert!(written.starts_with("# Main Page\n\nHello **world**.\n\n---\n"));
        assert!(written.contains("URL: https://wiki.example.com/index.php?title=Main_Page\n"));
        assert!(written.ends_with(&format!("Digest: {}\n", first.digest)));

        let second = exporter
            .export(&page("Main Page", "Hello '''world'''."))
            .expect("export");
        assert_eq!(second.outcome, ExportOutcome::Unchanged);
        assert!(second.exported_at_unix > 0);
        assert!(!written.contains(&second.exported_at_unix.to_string()));

        let third = exporter
            .export(&page("Main Page", "Hello there."))
            .expect("export");
        assert_eq!(third.outcome, ExportOutcome::Updated);
        assert_ne!(third.digest, first.digest);
    }

    #[test]
    fn export_leaves_no_temp_files() {
        let temp = tempdir().expect("tempdir");
        let exporter = PageExporter::new(temp.path(), None).expect("exporter");
        exporter.export(&page("FAQ", "Q and A")).expect("export");
        let names = fs::read_dir(temp.path())
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name())
            .collect::<Vec<_>>();
        assert_eq!(names.len(), 1);
        assert_eq!(names[0], "FAQ.md");
    }

    #[test]
    fn empty_body_renders_footer_only() {
        let temp = tempdir().expect("tempdir");
        let exporter = PageExporter::new(temp.path(), None).expect("exporter");
        let rendered = exporter.render(&page("Stub", "{{Stub}}"));
        assert!(rendered.starts_with("# Stub\n\n---\nSource: MediaWiki\nPage: Stub\nDigest: "));
        assert!(!rendered.contains("URL:"));
    }
}
