//! Configuration from environment variables and an optional YAML file.
//!
//! The YAML file (path from `OPENBRIDGE_CONFIG`, falling back to
//! `<config_dir>/openbridge/config.yml`) overrides values read from the
//! environment:
//!
//! ```yaml
//! server:
//!   port: 8080
//! backend: cli
//! max_concurrent: 4
//! cli:
//!   binary: /usr/local/bin/claude
//!   timeout_secs: 600
//! model_aliases:
//!   gpt-4o: claude-opus-4-1
//! ```
//!
//! **Environment variables:**
//! - `HOST` / `PORT`: bind address (default: 0.0.0.0:8080)
//! - `BACKEND`: `api` (direct HTTPS call) or `cli` (local agent process)
//! - `ANTHROPIC_API_KEY` / `CLAUDE_CODE_OAUTH_TOKEN`: backend credential
//! - `ANTHROPIC_BASE_URL`: remote API base URL
//! - `REQUEST_TIMEOUT_SECS`: transport timeout for the direct-call backend
//! - `CLAUDE_BIN`, `CLI_TIMEOUT_SECS`, `CLI_PARTIAL_MESSAGES`: process backend
//! - `MAX_CONCURRENT`: admission capacity
//! - `DEFAULT_MAX_TOKENS`: output limit when a request sets none

use anyhow::{bail, Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Which execution backend serves requests. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Api,
    Cli,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "api" | "direct" => Ok(BackendKind::Api),
            "cli" | "process" => Ok(BackendKind::Cli),
            other => bail!("unknown backend '{other}' (expected 'api' or 'cli')"),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Api => "api",
            BackendKind::Cli => "cli",
        })
    }
}

#[derive(Debug)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub backend: BackendKind,
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub cli_binary: PathBuf,
    pub cli_timeout_secs: u64,
    pub cli_partial_messages: bool,
    pub max_concurrent: usize,
    pub default_max_tokens: u32,
    pub model_aliases: HashMap<String, String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            backend: BackendKind::Api,
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_secs: 600,
            cli_binary: PathBuf::from("claude"),
            cli_timeout_secs: 300,
            cli_partial_messages: true,
            max_concurrent: 8,
            default_max_tokens: 4096,
            model_aliases: HashMap::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct YamlConfig {
    #[serde(default)]
    server: Option<YamlServer>,
    #[serde(default)]
    backend: Option<BackendKind>,
    #[serde(default)]
    max_concurrent: Option<usize>,
    #[serde(default)]
    default_max_tokens: Option<u32>,
    #[serde(default)]
    api: Option<YamlApi>,
    #[serde(default)]
    cli: Option<YamlCli>,
    #[serde(default)]
    model_aliases: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlServer {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlApi {
    base_url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlCli {
    binary: Option<PathBuf>,
    timeout_secs: Option<u64>,
    partial_messages: Option<bool>,
}

impl ProxyConfig {
    /// Read the environment, then apply the YAML file if one is found. An
    /// explicit path takes priority over `OPENBRIDGE_CONFIG` and the default
    /// location.
    pub fn load_with(config_path: Option<&Path>) -> Result<Self> {
        let mut config = Self::from_env()?;
        let path = config_path
            .map(Path::to_path_buf)
            .or_else(Self::config_file_path);
        if let Some(path) = path {
            config.apply_yaml_file(&path)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend = match get("BACKEND") {
            Some(v) => v.parse()?,
            None => defaults.backend,
        };
        let api_key = get("ANTHROPIC_API_KEY")
            .or_else(|| get("CLAUDE_CODE_OAUTH_TOKEN"))
            .map(SecretString::from);

        Ok(Self {
            host: get("HOST").unwrap_or(defaults.host),
            port: parse_var(get("PORT"), "PORT")?.unwrap_or(defaults.port),
            backend,
            api_key,
            base_url: get("ANTHROPIC_BASE_URL").unwrap_or(defaults.base_url),
            request_timeout_secs: parse_var(get("REQUEST_TIMEOUT_SECS"), "REQUEST_TIMEOUT_SECS")?
                .unwrap_or(defaults.request_timeout_secs),
            cli_binary: get("CLAUDE_BIN")
                .map(PathBuf::from)
                .unwrap_or(defaults.cli_binary),
            cli_timeout_secs: parse_var(get("CLI_TIMEOUT_SECS"), "CLI_TIMEOUT_SECS")?
                .unwrap_or(defaults.cli_timeout_secs),
            cli_partial_messages: parse_var(get("CLI_PARTIAL_MESSAGES"), "CLI_PARTIAL_MESSAGES")?
                .unwrap_or(defaults.cli_partial_messages),
            max_concurrent: parse_var(get("MAX_CONCURRENT"), "MAX_CONCURRENT")?
                .unwrap_or(defaults.max_concurrent),
            default_max_tokens: parse_var(get("DEFAULT_MAX_TOKENS"), "DEFAULT_MAX_TOKENS")?
                .unwrap_or(defaults.default_max_tokens),
            model_aliases: defaults.model_aliases,
        })
    }

    fn config_file_path() -> Option<PathBuf> {
        if let Ok(path) = env::var("OPENBRIDGE_CONFIG") {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir()
            .map(|dir| dir.join("openbridge").join("config.yml"))
            .filter(|path| path.exists())
    }

    /// Override fields with the values present in a YAML file.
    pub fn apply_yaml_file(&mut self, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        self.apply_yaml_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn apply_yaml_str(&mut self, content: &str) -> Result<()> {
        let yaml: YamlConfig = serde_yaml_ng::from_str(content)?;

        if let Some(server) = yaml.server {
            if let Some(host) = server.host {
                self.host = host;
            }
            if let Some(port) = server.port {
                self.port = port;
            }
        }
        if let Some(backend) = yaml.backend {
            self.backend = backend;
        }
        if let Some(n) = yaml.max_concurrent {
            self.max_concurrent = n;
        }
        if let Some(n) = yaml.default_max_tokens {
            self.default_max_tokens = n;
        }
        if let Some(api) = yaml.api {
            if let Some(url) = api.base_url {
                self.base_url = url;
            }
            if let Some(secs) = api.timeout_secs {
                self.request_timeout_secs = secs;
            }
        }
        if let Some(cli) = yaml.cli {
            if let Some(binary) = cli.binary {
                self.cli_binary = binary;
            }
            if let Some(secs) = cli.timeout_secs {
                self.cli_timeout_secs = secs;
            }
            if let Some(partial) = cli.partial_messages {
                self.cli_partial_messages = partial;
            }
        }
        self.model_aliases.extend(yaml.model_aliases);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            bail!("max_concurrent must be at least 1");
        }
        if self.default_max_tokens == 0 {
            bail!("default_max_tokens must be at least 1");
        }
        if self.cli_timeout_secs == 0 {
            bail!("cli timeout must be at least 1 second");
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn base_url_trimmed(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

fn parse_var<T: FromStr>(value: Option<String>, name: &str) -> Result<Option<T>>
where
    T::Err: fmt::Display,
{
    value
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("invalid {name}={v}: {e}"))
        })
        .transpose()
}
