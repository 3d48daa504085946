//! Conditional-request validator cache.
//!
//! Maps a URL to the last `ETag` seen for it. Loaded once at startup and
//! rewritten to disk after every change. Losing this file only costs
//! bandwidth, so load failures degrade to an empty cache.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Default cache file path.
pub const DEFAULT_CACHE_FILE: &str = ".etag_cache.json";

#[derive(Debug)]
pub struct ValidatorCache {
    path: Option<PathBuf>,
    tokens: Mutex<HashMap<String, String>>,
}

impl ValidatorCache {
    /// Load the cache from `path`. A missing or unreadable file starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let tokens = match read_tokens(&path) {
            Ok(Some(tokens)) => {
                info!(path = %path.display(), entries = tokens.len(), "Validator cache loaded");
                tokens
            }
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Validator cache unreadable, starting empty");
                HashMap::new()
            }
        };
        Self {
            path: Some(path),
            tokens: Mutex::new(tokens),
        }
    }

    /// A cache that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, url: &str) -> Option<String> {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(url)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remember `token` for `url` and persist if it changed. The lock is
    /// held across the write so concurrent updates hit the file in order.
    pub fn store(&self, url: &str, token: &str) -> Result<()> {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        if tokens.get(url).map(String::as_str) == Some(token) {
            return Ok(());
        }
        tokens.insert(url.to_string(), token.to_string());
        debug!(url, token, "Validator updated");

        match &self.path {
            Some(path) => write_tokens(path, &tokens),
            None => Ok(()),
        }
    }
}

fn read_tokens(path: &Path) -> Result<Option<HashMap<String, String>>> {
    if !path.exists() {
        return Ok(None);
    }
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read validator cache {}", path.display()))?;
    let tokens = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse validator cache {}", path.display()))?;
    Ok(Some(tokens))
}

/// Write through a sibling temp file and rename, so a crash mid-write
/// leaves the previous cache intact.
fn write_tokens(path: &Path, tokens: &HashMap<String, String>) -> Result<()> {
    let json = serde_json::to_string(tokens).context("Failed to serialise validator cache")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)
        .with_context(|| format!("Failed to write validator cache {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace validator cache {}", path.display()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
