use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

pub const DEFAULT_USER_AGENT: &str = "wikisync/0.1";
pub const DEFAULT_WIKI_PATH: &str = "/";
pub const DEFAULT_TARGET_URL: &str = "http://localhost:3001";
pub const DEFAULT_WORKSPACE: &str = "MediaWiki Import";
pub const DEFAULT_NAMESPACE: i32 = 0;
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// On-disk configuration. Every key is optional; environment variables and
/// flags fill or override individual values.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ConfigFile {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub target: TargetSection,
    #[serde(default)]
    pub http: HttpSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub url: Option<String>,
    pub path: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub namespace: Option<i32>,
    pub prefix: Option<String>,
    pub include_redirects: Option<bool>,
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct TargetSection {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub workspace: Option<String>,
    pub upload_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HttpSection {
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
    pub rate_limit_ms: Option<u64>,
}

/// Load and parse a ConfigFile. Returns default if file doesn't exist.
pub fn load_config_file(config_path: &Path) -> Result<ConfigFile> {
    if !config_path.exists() {
        return Ok(ConfigFile::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: ConfigFile = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Values supplied on the command line; they win over env and file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub wiki_url: Option<String>,
    pub wiki_path: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub namespace: Option<i32>,
    pub prefix: Option<String>,
    pub include_redirects: bool,
    pub limit: Option<usize>,
    pub target_url: Option<String>,
    pub api_key: Option<String>,
    pub workspace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WikiCredentials {
    Anonymous,
    Login { username: String, password: String },
}

impl WikiCredentials {
    fn from_parts(username: Option<String>, password: Option<String>) -> Self {
        match (username, password) {
            (Some(username), Some(password)) => Self::Login { username, password },
            (Some(_), None) | (None, Some(_)) => {
                tracing::warn!("only one of username/password is set; using anonymous access");
                Self::Anonymous
            }
            (None, None) => Self::Anonymous,
        }
    }

    pub fn is_login(&self) -> bool {
        matches!(self, Self::Login { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub user_agent: String,
    pub timeout_ms: u64,
    pub retry: RetryPolicy,
    pub wiki_rate_limit_ms: u64,
    pub upload_delay_ms: u64,
}

/// Fully resolved pipeline configuration handed to the client constructors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub wiki_url: Option<String>,
    pub wiki_path: String,
    pub credentials: WikiCredentials,
    pub namespace: i32,
    pub prefix: Option<String>,
    pub include_redirects: bool,
    pub batch_size: usize,
    pub limit: Option<usize>,
    pub target_url: String,
    pub api_key: Option<String>,
    pub workspace: String,
    pub http: HttpSettings,
}

/// Subset of the configuration recorded in run reports. Secrets are omitted.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub wiki_url: Option<String>,
    pub wiki_path: String,
    pub namespace: i32,
    pub prefix: Option<String>,
    pub authenticated: bool,
    pub target_url: String,
    pub workspace: String,
}

impl PipelineConfig {
    pub fn resolve(file: &ConfigFile, overrides: &ConfigOverrides) -> Result<Self> {
        Self::resolve_with_lookup(file, overrides, |key| std::env::var(key).ok())
    }

    pub fn resolve_with_lookup<F>(
        file: &ConfigFile,
        overrides: &ConfigOverrides,
        lookup_env: F,
    ) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| {
            lookup_env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let pick = |flag: &Option<String>, key: &str, from_file: &Option<String>| {
            flag.clone()
                .filter(|value| !value.trim().is_empty())
                .or_else(|| env(key))
                .or_else(|| from_file.clone())
        };

        let namespace = match overrides.namespace {
            Some(namespace) => namespace,
            None => match env("MEDIAWIKI_NAMESPACE") {
                Some(value) => value
                    .parse::<i32>()
                    .with_context(|| format!("MEDIAWIKI_NAMESPACE is not an integer: {value}"))?,
                None => file.wiki.namespace.unwrap_or(DEFAULT_NAMESPACE),
            },
        };

        let batch_size = file.wiki.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            bail!("wiki.batch_size must be at least 1");
        }
        if overrides.limit == Some(0) {
            bail!("--limit must be at least 1");
        }

        let parse_u64 = |key: &str, from_file: Option<u64>, default: u64| -> Result<u64> {
            match env(key) {
                Some(value) => value
                    .parse::<u64>()
                    .with_context(|| format!("{key} is not a non-negative integer: {value}")),
                None => Ok(from_file.unwrap_or(default)),
            }
        };
        let retries = match env("WIKISYNC_HTTP_RETRIES") {
            Some(value) => value
                .parse::<usize>()
                .with_context(|| format!("WIKISYNC_HTTP_RETRIES is not an integer: {value}"))?,
            None => file.http.retries.unwrap_or(3),
        };

        let http = HttpSettings {
            user_agent: env("WIKISYNC_USER_AGENT")
                .or_else(|| file.http.user_agent.clone())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            timeout_ms: parse_u64("WIKISYNC_HTTP_TIMEOUT_MS", file.http.timeout_ms, 30_000)?,
            retry: RetryPolicy {
                max_retries: retries,
                retry_delay_ms: parse_u64(
                    "WIKISYNC_HTTP_RETRY_DELAY_MS",
                    file.http.retry_delay_ms,
                    500,
                )?,
            },
            wiki_rate_limit_ms: parse_u64("WIKISYNC_RATE_LIMIT_MS", file.http.rate_limit_ms, 300)?,
            upload_delay_ms: parse_u64(
                "WIKISYNC_UPLOAD_DELAY_MS",
                file.target.upload_delay_ms,
                500,
            )?,
        };

        Ok(Self {
            wiki_url: pick(&overrides.wiki_url, "MEDIAWIKI_URL", &file.wiki.url),
            wiki_path: pick(&overrides.wiki_path, "MEDIAWIKI_PATH", &file.wiki.path)
                .unwrap_or_else(|| DEFAULT_WIKI_PATH.to_string()),
            credentials: WikiCredentials::from_parts(
                pick(&overrides.username, "MEDIAWIKI_USERNAME", &file.wiki.username),
                pick(&overrides.password, "MEDIAWIKI_PASSWORD", &file.wiki.password),
            ),
            namespace,
            prefix: pick(&overrides.prefix, "MEDIAWIKI_PREFIX", &file.wiki.prefix),
            include_redirects: overrides.include_redirects
                || file.wiki.include_redirects.unwrap_or(false),
            batch_size,
            limit: overrides.limit,
            target_url: pick(&overrides.target_url, "ANYTHINGLLM_URL", &file.target.url)
                .unwrap_or_else(|| DEFAULT_TARGET_URL.to_string()),
            api_key: pick(&overrides.api_key, "ANYTHINGLLM_API_KEY", &file.target.api_key),
            workspace: pick(
                &overrides.workspace,
                "ANYTHINGLLM_WORKSPACE",
                &file.target.workspace,
            )
            .unwrap_or_else(|| DEFAULT_WORKSPACE.to_string()),
            http,
        })
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            wiki_url: self.wiki_url.clone(),
            wiki_path: self.wiki_path.clone(),
            namespace: self.namespace,
            prefix: self.prefix.clone(),
            authenticated: self.credentials.is_login(),
            target_url: self.target_url.clone(),
            workspace: self.workspace.clone(),
        }
    }

    /// Resolved `api.php` endpoint for the configured wiki.
    pub fn wiki_api_url(&self) -> Result<String> {
        let url = self
            .wiki_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("wiki URL is required (set MEDIAWIKI_URL or --url)"))?;
        mediawiki_api_url(url, &self.wiki_path)
    }

    pub fn require_api_key(&self) -> Result<&str> {
        match self.api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => Ok(key),
            _ => bail!(
                "API key is required. Set ANYTHINGLLM_API_KEY or use --api-key \
                 (create one under Settings > Developer > API Keys)"
            ),
        }
    }
}

/// Build the Action API endpoint from a host (scheme optional, https assumed)
/// and a script path such as `/` or `/w/`.
pub fn mediawiki_api_url(url: &str, path: &str) -> Result<String> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        bail!("wiki URL is empty");
    }
    let (scheme, rest) = if let Some(rest) = trimmed.strip_prefix("http://") {
        ("http", rest)
    } else if let Some(rest) = trimmed.strip_prefix("https://") {
        ("https", rest)
    } else {
        ("https", trimmed)
    };
    let host = rest.trim_matches('/');
    if host.is_empty() {
        bail!("wiki URL has no host: {url}");
    }
    if host.ends_with("/api.php") {
        return Ok(format!("{scheme}://{host}"));
    }

    let mut script_path = path.trim().to_string();
    if !script_path.starts_with('/') {
        script_path.insert(0, '/');
    }
    if !script_path.ends_with('/') {
        script_path.push('/');
    }
    Ok(format!("{scheme}://{host}{script_path}api.php"))
}

/// Base URL for human-readable page links, derived from the API endpoint.
pub fn article_base_url(api_url: &str) -> String {
    let base = api_url.strip_suffix("api.php").unwrap_or(api_url);
    format!("{}/index.php?title=", base.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::*;

    fn resolve(file: &ConfigFile, overrides: &ConfigOverrides, env: &[(&str, &str)]) -> PipelineConfig {
        let env: HashMap<String, String> = env
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        PipelineConfig::resolve_with_lookup(file, overrides, |key| env.get(key).cloned())
            .expect("resolve config")
    }

    #[test]
    fn defaults_match_the_original_scripts() {
        let config = resolve(&ConfigFile::default(), &ConfigOverrides::default(), &[]);
        assert!(config.wiki_url.is_none());
        assert_eq!(config.wiki_path, "/");
        assert_eq!(config.namespace, 0);
        assert_eq!(config.target_url, "http://localhost:3001");
        assert_eq!(config.workspace, "MediaWiki Import");
        assert_eq!(config.credentials, WikiCredentials::Anonymous);
        assert_eq!(config.http.upload_delay_ms, 500);
        assert_eq!(config.batch_size, 500);
    }

    #[test]
    fn flag_beats_env_beats_file() {
        let mut file = ConfigFile::default();
        file.wiki.url = Some("file.example".to_string());
        file.target.workspace = Some("From File".to_string());
        file.wiki.prefix = Some("Docs/".to_string());

        let overrides = ConfigOverrides {
            wiki_url: Some("flag.example".to_string()),
            ..ConfigOverrides::default()
        };
        let config = resolve(
            &file,
            &overrides,
            &[
                ("MEDIAWIKI_URL", "env.example"),
                ("ANYTHINGLLM_WORKSPACE", "From Env"),
            ],
        );
        assert_eq!(config.wiki_url.as_deref(), Some("flag.example"));
        assert_eq!(config.workspace, "From Env");
        assert_eq!(config.prefix.as_deref(), Some("Docs/"));
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let mut file = ConfigFile::default();
        file.target.api_key = Some("file-key".to_string());
        let config = resolve(
            &file,
            &ConfigOverrides::default(),
            &[("ANYTHINGLLM_API_KEY", "   ")],
        );
        assert_eq!(config.api_key.as_deref(), Some("file-key"));
    }

    #[test]
    fn credentials_require_both_parts() {
        let only_user = resolve(
            &ConfigFile::default(),
            &ConfigOverrides::default(),
            &[("MEDIAWIKI_USERNAME", "bot")],
        );
        assert_eq!(only_user.credentials, WikiCredentials::Anonymous);

        let both = resolve(
            &ConfigFile::default(),
            &ConfigOverrides::default(),
            &[("MEDIAWIKI_USERNAME", "bot"), ("MEDIAWIKI_PASSWORD", "secret")],
        );
        assert!(both.credentials.is_login());
        assert!(both.snapshot().authenticated);
    }

    #[test]
    fn invalid_namespace_env_is_an_error() {
        let env = HashMap::from([("MEDIAWIKI_NAMESPACE".to_string(), "main".to_string())]);
        let error = PipelineConfig::resolve_with_lookup(
            &ConfigFile::default(),
            &ConfigOverrides::default(),
            |key| env.get(key).cloned(),
        )
        .expect_err("must fail");
        assert!(error.to_string().contains("MEDIAWIKI_NAMESPACE"));
    }

    #[test]
    fn missing_api_key_is_reported() {
        let config = resolve(&ConfigFile::default(), &ConfigOverrides::default(), &[]);
        let error = config.require_api_key().expect_err("must fail");
        assert!(error.to_string().contains("ANYTHINGLLM_API_KEY"));
    }

    #[test]
    fn api_url_follows_scheme_and_path_rules() {
        assert_eq!(
            mediawiki_api_url("wiki.example.com", "/").expect("url"),
            "https://wiki.example.com/api.php"
        );
        assert_eq!(
            mediawiki_api_url("http://wiki.example.com/", "w").expect("url"),
            "http://wiki.example.com/w/api.php"
        );
        assert_eq!(
            mediawiki_api_url("https://wiki.example.com/w/api.php", "/ignored/").expect("url"),
            "https://wiki.example.com/w/api.php"
        );
        assert!(mediawiki_api_url("https://", "/").is_err());
        assert!(mediawiki_api_url("http:///", "/").is_err());
        assert!(mediawiki_api_url("  ", "/").is_err());
        assert_eq!(
            mediawiki_api_url("wiki.example.com/w/api.php", "/").expect("url"),
            "https://wiki.example.com/w/api.php"
        );
    }

    #[test]
    fn article_base_url_strips_api_php() {
        assert_eq!(
            article_base_url("https://wiki.example.com/w/api.php"),
            "https://wiki.example.com/w/index.php?title="
        );
    }

    #[test]
    fn load_config_file_returns_default_for_missing_file() {
        let config = load_config_file(Path::new("/nonexistent/config.toml")).expect("load");
        assert_eq!(config, ConfigFile::default());
    }

    #[test]
    fn load_config_file_parses_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[wiki]
url = "wiki.example.org"
path = "/w/"
namespace = 4
prefix = "Handbook"

[target]
url = "http://llm.internal:3001"
workspace = "Handbook"

[http]
retries = 5
"#,
        )
        .expect("write config");

        let file = load_config_file(&config_path).expect("load");
        let config = resolve(&file, &ConfigOverrides::default(), &[]);
        assert_eq!(config.wiki_api_url().expect("api url"), "https://wiki.example.org/w/api.php");
        assert_eq!(config.namespace, 4);
        assert_eq!(config.prefix.as_deref(), Some("Handbook"));
        assert_eq!(config.workspace, "Handbook");
        assert_eq!(config.http.retry.max_retries, 5);
    }

    #[test]
    fn load_config_file_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[wiki\nurl = \"oops\"").expect("write config");
        let error = load_config_file(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }
}
