//! Per-instance token storage under the state directory.
//!
//! Layout: `<state_dir>/<host>/token` holds the token (owner-only on unix)
//! and `<state_dir>/last_login` holds the url of the most recent login.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use glu_core::write_secret_atomic;
use reqwest::Url;

const STATE_DIR_NAME: &str = ".gitlab-util";
const TOKEN_FILE: &str = "token";
const LAST_LOGIN_FILE: &str = "last_login";
const API_SUFFIX: &str = "/api/v4";

/// `~/.gitlab-util`.
pub fn default_state_dir() -> Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .ok_or_else(|| anyhow!("HOME is not set; pass --state-dir"))?;
    Ok(PathBuf::from(home).join(STATE_DIR_NAME))
}

/// Normalizes an instance url to its REST v4 root.
pub fn api_base_url(url: &str) -> Result<String> {
    let trimmed = url.trim().trim_end_matches('/');
    let parsed = Url::parse(trimmed).with_context(|| format!("invalid gitlab url '{url}'"))?;
    if parsed.host_str().is_none() {
        bail!("gitlab url '{url}' has no host");
    }
    if trimmed.ends_with(API_SUFFIX) {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("{trimmed}{API_SUFFIX}"))
    }
}

fn host_of(url: &str) -> Result<String> {
    let parsed = Url::parse(url.trim()).with_context(|| format!("invalid gitlab url '{url}'"))?;
    parsed
        .host_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("gitlab url '{url}' has no host"))
}

#[derive(Debug, Clone)]
pub struct CredentialStore {
    root: PathBuf,
}

impl CredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn token_path(&self, url: &str) -> Result<PathBuf> {
        Ok(self.root.join(host_of(url)?).join(TOKEN_FILE))
    }

    /// Stores `token` for the url's host and remembers `url` as the last login.
    pub fn save(&self, url: &str, token: &str) -> Result<()> {
        let token_path = self.token_path(url)?;
        write_secret_atomic(&token_path, token.trim())
            .with_context(|| format!("failed to store token in {}", token_path.display()))?;
        write_secret_atomic(&self.root.join(LAST_LOGIN_FILE), url.trim())
            .context("failed to record last login url")?;
        Ok(())
    }

    pub fn load_token(&self, url: &str) -> Result<String> {
        let token_path = self.token_path(url)?;
        let token = std::fs::read_to_string(&token_path).with_context(|| {
            format!(
                "no stored token for {} ({}); run `gitlab-util login` first",
                host_of(url).unwrap_or_default(),
                token_path.display()
            )
        })?;
        Ok(token.trim().to_string())
    }

    pub fn last_login(&self) -> Result<Option<String>> {
        let path = self.root.join(LAST_LOGIN_FILE);
        match std::fs::read_to_string(&path) {
            Ok(url) if !url.trim().is_empty() => Ok(Some(url.trim().to_string())),
            Ok(_) => Ok(None),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => {
                Err(error).with_context(|| format!("failed to read {}", path.display()))
            }
        }
    }

    /// Explicit url, else the last login url.
    pub fn resolve_url(&self, explicit: Option<&str>) -> Result<String> {
        if let Some(url) = explicit.map(str::trim).filter(|url| !url.is_empty()) {
            return Ok(url.to_string());
        }
        self.last_login()?
            .ok_or_else(|| anyhow!("no gitlab url given and no previous login; pass --gitlab-url"))
    }

    /// Explicit token (e.g. `GITLAB_TOKEN`), else the token stored for `url`.
    pub fn resolve_token(&self, url: &str, explicit: Option<&str>) -> Result<String> {
        match explicit.map(str::trim).filter(|token| !token.is_empty()) {
            Some(token) => Ok(token.to_string()),
            None => self.load_token(url),
        }
    }
}
