//! Layered configuration for uplift.
//!
//! Values are resolved in order: built-in defaults, then `.uplift/uplift.toml`
//! (or an explicit `--config` path), then environment variables (a `.env`
//! file is loaded first), then CLI flags applied by the caller.
//!
//! ```toml
//! [server]
//! port = 5000
//! db_path = ".uplift/uplift.db"
//!
//! [detector]
//! command = ["python3", "checker.py"]
//! timeout_secs = 300
//!
//! [rewrite]
//! api_url = "https://api.groq.com/openai/v1/chat/completions"
//! model = "llama-3.1-8b-instant"
//! timeout_secs = 120
//! preview_chars = 4000
//!
//! [publish]
//! staging_root = ".uplift/staging"
//! base_branch = "main"
//! branch_prefix = "uplift/"
//! pr_attempts = 2
//! on_pr_failure = "keep_branch"
//!
//! [pipeline]
//! partial_failure = "flag_partial"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = ".uplift/uplift.toml";

/// What to do with a pushed branch when the pull request cannot be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanBranchPolicy {
    /// Leave the branch on origin and report its name in the error.
    #[default]
    KeepBranch,
    /// Delete the branch from origin (best effort).
    DeleteBranch,
}

/// How a run that lost some rewrites reports its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialFailurePolicy {
    /// Report plain success; failed files are only logged.
    ReportSuccess,
    /// Report success with a list of the files that could not be rewritten.
    #[default]
    FlagPartial,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectorConfig {
    /// Program and leading arguments; the checkout path is appended.
    pub command: Vec<String>,
    /// The detector process is killed after this many seconds.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RewriteConfig {
    pub api_url: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub preview_chars: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishConfig {
    pub staging_root: PathBuf,
    pub base_branch: String,
    pub branch_prefix: String,
    pub commit_message: String,
    pub author_name: String,
    pub author_email: String,
    pub pr_attempts: u32,
    pub on_pr_failure: OrphanBranchPolicy,
    pub keep_staging: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GitHubConfig {
    pub api_url: String,
    #[serde(skip_serializing)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineConfig {
    pub partial_failure: PartialFailurePolicy,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoggingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    pub json: bool,
}

/// Effective configuration for one uplift process.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpliftConfig {
    pub server: ServerConfig,
    pub detector: DetectorConfig,
    pub rewrite: RewriteConfig,
    pub publish: PublishConfig,
    pub github: GitHubConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            db_path: PathBuf::from(".uplift/uplift.db"),
            dev_mode: false,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 300,
        }
    }
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.groq.com/openai/v1/chat/completions".to_string(),
            model: "llama-3.1-8b-instant".to_string(),
            api_key: None,
            timeout_secs: 120,
            preview_chars: 4000,
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            staging_root: PathBuf::from(".uplift/staging"),
            base_branch: "main".to_string(),
            branch_prefix: "uplift/".to_string(),
            commit_message: "Automated commit message.".to_string(),
            author_name: "uplift".to_string(),
            author_email: "uplift@localhost".to_string(),
            pr_attempts: 2,
            on_pr_failure: OrphanBranchPolicy::KeepBranch,
            keep_staging: false,
        }
    }
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            token: None,
        }
    }
}

// ── Raw TOML structure ───────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    server: Option<ServerSection>,
    detector: Option<DetectorSection>,
    rewrite: Option<RewriteSection>,
    publish: Option<PublishSection>,
    github: Option<GitHubSection>,
    pipeline: Option<PipelineSection>,
    logging: Option<LoggingSection>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev_mode: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct DetectorSection {
    command: Option<Vec<String>>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RewriteSection {
    api_url: Option<String>,
    model: Option<String>,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
    preview_chars: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct PublishSection {
    staging_root: Option<PathBuf>,
    base_branch: Option<String>,
    branch_prefix: Option<String>,
    commit_message: Option<String>,
    author_name: Option<String>,
    author_email: Option<String>,
    pr_attempts: Option<u32>,
    on_pr_failure: Option<OrphanBranchPolicy>,
    keep_staging: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct GitHubSection {
    api_url: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PipelineSection {
    partial_failure: Option<PartialFailurePolicy>,
}

#[derive(Debug, Deserialize)]
struct LoggingSection {
    dir: Option<PathBuf>,
    json: Option<bool>,
}

impl UpliftConfig {
    /// Load configuration from `path` (or the default location) and the
    /// environment. A missing default file yields defaults; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file on top of the defaults. Environment is not consulted.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        let raw: ConfigToml = toml::from_str(content)?;
        let mut config = Self::default();

        if let Some(server) = raw.server {
            if let Some(port) = server.port {
                config.server.port = port;
            }
            if let Some(db_path) = server.db_path {
                config.server.db_path = db_path;
            }
            if let Some(dev_mode) = server.dev_mode {
                config.server.dev_mode = dev_mode;
            }
        }
        if let Some(detector) = raw.detector {
            if let Some(command) = detector.command {
                config.detector.command = command;
            }
            if let Some(secs) = detector.timeout_secs {
                config.detector.timeout_secs = secs;
            }
        }
        if let Some(rewrite) = raw.rewrite {
            if let Some(api_url) = rewrite.api_url {
                config.rewrite.api_url = api_url;
            }
            if let Some(model) = rewrite.model {
                config.rewrite.model = model;
            }
            if rewrite.api_key.is_some() {
                config.rewrite.api_key = rewrite.api_key;
            }
            if let Some(timeout_secs) = rewrite.timeout_secs {
                config.rewrite.timeout_secs = timeout_secs;
            }
            if let Some(preview_chars) = rewrite.preview_chars {
                config.rewrite.preview_chars = preview_chars;
            }
        }
        if let Some(publish) = raw.publish {
            let p = &mut config.publish;
            if let Some(v) = publish.staging_root {
                p.staging_root = v;
            }
            if let Some(v) = publish.base_branch {
                p.base_branch = v;
            }
            if let Some(v) = publish.branch_prefix {
                p.branch_prefix = v;
            }
            if let Some(v) = publish.commit_message {
                p.commit_message = v;
            }
            if let Some(v) = publish.author_name {
                p.author_name = v;
            }
            if let Some(v) = publish.author_email {
                p.author_email = v;
            }
            if let Some(v) = publish.pr_attempts {
                p.pr_attempts = v;
            }
            if let Some(v) = publish.on_pr_failure {
                p.on_pr_failure = v;
            }
            if let Some(v) = publish.keep_staging {
                p.keep_staging = v;
            }
        }
        if let Some(github) = raw.github {
            if let Some(api_url) = github.api_url {
                config.github.api_url = api_url;
            }
            if github.token.is_some() {
                config.github.token = github.token;
            }
        }
        if let Some(partial_failure) = raw.pipeline.and_then(|p| p.partial_failure) {
            config.pipeline.partial_failure = partial_failure;
        }
        if let Some(logging) = raw.logging {
            config.logging.dir = logging.dir;
            if let Some(json) = logging.json {
                config.logging.json = json;
            }
        }

        Ok(config)
    }

    /// Overlay environment variables. `lookup` is injected so tests do not
    /// have to mutate the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("GITHUB_TOKEN").filter(|t| !t.is_empty()) {
            self.github.token = Some(token);
        }
        if let Some(key) = lookup("UPLIFT_REWRITE_API_KEY")
            .or_else(|| lookup("GROQ_API_KEY"))
            .filter(|k| !k.is_empty())
        {
            self.rewrite.api_key = Some(key);
        }
        if let Some(url) = lookup("UPLIFT_REWRITE_API_URL") {
            self.rewrite.api_url = url;
        }
        if let Some(model) = lookup("UPLIFT_REWRITE_MODEL") {
            self.rewrite.model = model;
        }
        if let Some(command) = lookup("UPLIFT_DETECTOR_COMMAND") {
            self.detector.command = command.split_whitespace().map(str::to_string).collect();
        }
        if let Some(port) = lookup("UPLIFT_PORT") {
            self.server.port = port.parse().map_err(|_| ConfigError::Invalid {
                key: "UPLIFT_PORT".to_string(),
                message: format!("'{}' is not a port number", port),
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.publish.pr_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "publish.pr_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.publish.base_branch.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "publish.base_branch".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.detector.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "detector.timeout_secs".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.rewrite.preview_chars == 0 {
            return Err(ConfigError::Invalid {
                key: "rewrite.preview_chars".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = UpliftConfig::default();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.publish.base_branch, "main");
        assert_eq!(config.publish.pr_attempts, 2);
        assert_eq!(config.publish.on_pr_failure, OrphanBranchPolicy::KeepBranch);
        assert_eq!(
            config.pipeline.partial_failure,
            PartialFailurePolicy::FlagPartial
        );
        assert!(config.detector.command.is_empty());
        assert_eq!(config.detector.timeout_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_full() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uplift.toml");
        fs::write(
            &path,
            r#"
[server]
port = 8080
db_path = "/var/lib/uplift.db"

[detector]
command = ["python3", "checker.py"]

[rewrite]
model = "llama-3.3-70b-versatile"
preview_chars = 200

[publish]
base_branch = "develop"
branch_prefix = "modernize/"
on_pr_failure = "delete_branch"
keep_staging = true

[github]
api_url = "https://github.example.com/api/v3"

[pipeline]
partial_failure = "report_success"
"#,
        )
        .unwrap();

        let config = UpliftConfig::from_file(&path).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.db_path, PathBuf::from("/var/lib/uplift.db"));
        assert_eq!(config.detector.command, vec!["python3", "checker.py"]);
        assert_eq!(config.rewrite.model, "llama-3.3-70b-versatile");
        assert_eq!(config.rewrite.preview_chars, 200);
        assert_eq!(config.rewrite.timeout_secs, 120); // default
        assert_eq!(config.publish.base_branch, "develop");
        assert_eq!(config.publish.branch_prefix, "modernize/");
        assert_eq!(config.publish.on_pr_failure, OrphanBranchPolicy::DeleteBranch);
        assert!(config.publish.keep_staging);
        assert_eq!(config.github.api_url, "https://github.example.com/api/v3");
        assert_eq!(
            config.pipeline.partial_failure,
            PartialFailurePolicy::ReportSuccess
        );
    }

    #[test]
    fn test_from_file_missing_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = UpliftConfig::from_file(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_from_file_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uplift.toml");
        fs::write(&path, "not valid toml {{{{").unwrap();
        let err = UpliftConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_unknown_section_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uplift.toml");
        fs::write(&path, "[sandbox]\nimage = \"x\"\n").unwrap();
        assert!(UpliftConfig::from_file(&path).is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = UpliftConfig::default();
        config
            .apply_env(env(&[
                ("GITHUB_TOKEN", "ghp_abc"),
                ("GROQ_API_KEY", "gsk_fallback"),
                ("UPLIFT_DETECTOR_COMMAND", "node detect.js --json"),
                ("UPLIFT_PORT", "7000"),
            ]))
            .unwrap();
        assert_eq!(config.github.token.as_deref(), Some("ghp_abc"));
        assert_eq!(config.rewrite.api_key.as_deref(), Some("gsk_fallback"));
        assert_eq!(config.detector.command, vec!["node", "detect.js", "--json"]);
        assert_eq!(config.server.port, 7000);
    }

    #[test]
    fn test_rewrite_api_key_prefers_uplift_variable() {
        let mut config = UpliftConfig::default();
        config
            .apply_env(env(&[
                ("UPLIFT_REWRITE_API_KEY", "primary"),
                ("GROQ_API_KEY", "fallback"),
            ]))
            .unwrap();
        assert_eq!(config.rewrite.api_key.as_deref(), Some("primary"));
    }

    #[test]
    fn test_env_invalid_port() {
        let mut config = UpliftConfig::default();
        let err = config.apply_env(env(&[("UPLIFT_PORT", "http")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_validate_rejects_zero_pr_attempts() {
        let mut config = UpliftConfig::default();
        config.publish.pr_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_detector_timeout_from_file() {
        let config = UpliftConfig::from_toml_str("[detector]\ntimeout_secs = 45\n").unwrap();
        assert_eq!(config.detector.timeout_secs, 45);
        assert!(config.detector.command.is_empty());

        let mut zero = UpliftConfig::default();
        zero.detector.timeout_secs = 0;
        let err = zero.validate().unwrap_err();
        assert!(err.to_string().contains("detector.timeout_secs"));
    }

    #[test]
    fn test_rendered_defaults_load_back() {
        let rendered = toml::to_string_pretty(&UpliftConfig::default()).unwrap();
        let parsed = UpliftConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.server.port, 5000);
        assert_eq!(parsed.publish.on_pr_failure, OrphanBranchPolicy::KeepBranch);
        assert_eq!(parsed.rewrite.model, "llama-3.1-8b-instant");
    }

    #[test]
    fn test_secrets_not_serialized() {
        let mut config = UpliftConfig::default();
        config.github.token = Some("ghp_secret".to_string());
        config.rewrite.api_key = Some("gsk_secret".to_string());
        let rendered = toml::to_string(&config).unwrap();
        assert!(!rendered.contains("ghp_secret"));
        assert!(!rendered.contains("gsk_secret"));
    }
}
