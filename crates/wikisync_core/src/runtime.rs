use std::env;
use std::path::{Path, PathBuf};

use anyhow::Result;

pub const STATE_DIR_NAME: &str = ".wikisync";
pub const EXPORT_DIR_NAME: &str = "wiki_export";
pub const DB_FILENAME: &str = "state.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub export_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub export_dir: PathBuf,
    pub state_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub export_source: ValueSource,
    pub state_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    /// Layout rooted at `project_root` with every path at its default.
    pub fn under(project_root: &Path) -> Self {
        let state_dir = project_root.join(STATE_DIR_NAME);
        Self {
            project_root: project_root.to_path_buf(),
            export_dir: project_root.join(EXPORT_DIR_NAME),
            db_path: state_dir.join(DB_FILENAME),
            config_path: state_dir.join("config.toml"),
            state_dir,
            export_source: ValueSource::Default,
            state_source: ValueSource::Default,
            config_source: ValueSource::Default,
        }
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={}\nexport_dir={} ({})\nstate_dir={} ({})\ndb_path={}\nconfig_path={} ({})",
            normalize_for_display(&self.project_root),
            normalize_for_display(&self.export_dir),
            self.export_source.as_str(),
            normalize_for_display(&self.state_dir),
            self.state_source.as_str(),
            normalize_for_display(&self.db_path),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }
}

pub fn resolve_paths(cwd: &Path, overrides: &PathOverrides) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(cwd, overrides, |key| env::var(key).ok())
}

pub fn resolve_paths_with_lookup<F>(
    cwd: &Path,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let project_root = overrides
        .project_root
        .as_deref()
        .map(|path| absolutize(path, cwd))
        .unwrap_or_else(|| cwd.to_path_buf());
    let defaults = ResolvedPaths::under(&project_root);

    let pick = |flag: Option<&Path>, key: &str, default: PathBuf| -> (PathBuf, ValueSource) {
        if let Some(path) = flag {
            return (absolutize(path, &project_root), ValueSource::Flag);
        }
        if let Some(value) = lookup_env(key).filter(|value| !value.trim().is_empty()) {
            return (
                absolutize(Path::new(value.trim()), &project_root),
                ValueSource::Env,
            );
        }
        (default, ValueSource::Default)
    };

    let (export_dir, export_source) = pick(
        overrides.export_dir.as_deref(),
        "WIKISYNC_EXPORT_DIR",
        defaults.export_dir,
    );
    let (state_dir, state_source) = pick(
        overrides.state_dir.as_deref(),
        "WIKISYNC_STATE_DIR",
        defaults.state_dir,
    );
    let (config_path, config_source) = pick(
        overrides.config.as_deref(),
        "WIKISYNC_CONFIG",
        state_dir.join("config.toml"),
    );

    Ok(ResolvedPaths {
        db_path: state_dir.join(DB_FILENAME),
        project_root,
        export_dir,
        state_dir,
        config_path,
        export_source,
        state_source,
        config_source,
    })
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
