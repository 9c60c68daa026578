//! Signaling endpoint address and its persisted store
//!
//! The address is scanned from a QR code by the host application and
//! written to a small JSON file. The streaming core reads it at startup
//! and watches the file so that a newly scanned address forces a full
//! stop/start cycle.

use crate::webrtc::SessionError;
use log::{debug, info, warn};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::mpsc;

/// Address of the remote signaling endpoint (`ws://host:port/...`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EndpointAddress(String);

impl EndpointAddress {
    /// Validate and normalize an address.
    ///
    /// A bare `host:port` (as printed in most QR codes) is taken to mean `ws://`.
    pub fn parse(input: &str) -> Result<Self, SessionError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(SessionError::Config("Endpoint address is empty".into()));
        }

        let normalized = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("ws://{}", trimmed)
        };

        let rest = normalized
            .strip_prefix("ws://")
            .or_else(|| normalized.strip_prefix("wss://"))
            .ok_or_else(|| {
                SessionError::Config(format!("Unsupported endpoint scheme: {}", normalized))
            })?;

        let host = rest.split('/').next().unwrap_or_default();
        if host.is_empty() || host.starts_with(':') {
            return Err(SessionError::Config(format!("Endpoint address has no host: {}", normalized)));
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_secure(&self) -> bool {
        self.0.starts_with("wss://")
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EndpointAddress {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EndpointAddress {
    type Error = SessionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EndpointAddress> for String {
    fn from(value: EndpointAddress) -> Self {
        value.0
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEndpoint {
    signaling_url: EndpointAddress,
}

/// File-backed store for the last scanned endpoint address
#[derive(Debug, Clone)]
pub struct EndpointStore {
    path: PathBuf,
}

impl EndpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored address; `None` when nothing has been saved yet
    pub fn load(&self) -> Result<Option<EndpointAddress>, SessionError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| SessionError::Config(format!("Failed to read {}: {}", self.path.display(), e)))?;
        if content.trim().is_empty() {
            return Ok(None);
        }

        let stored: StoredEndpoint = serde_json::from_str(&content)
            .map_err(|e| SessionError::Config(format!("Invalid endpoint file {}: {}", self.path.display(), e)))?;
        Ok(Some(stored.signaling_url))
    }

    /// Persist an address, replacing the file atomically
    pub fn save(&self, address: &EndpointAddress) -> Result<(), SessionError> {
        let body = serde_json::to_string_pretty(&StoredEndpoint { signaling_url: address.clone() })
            .map_err(|e| SessionError::Config(format!("Failed to encode endpoint: {}", e)))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| SessionError::Config(format!("Failed to create {}: {}", parent.display(), e)))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body)
            .map_err(|e| SessionError::Config(format!("Failed to write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| SessionError::Config(format!("Failed to replace {}: {}", self.path.display(), e)))?;

        info!("Saved signaling endpoint {} to {}", address, self.path.display());
        Ok(())
    }

    /// Watch the store for changes.
    ///
    /// Every successfully parsed address written after this call is sent on
    /// the returned channel. The watcher stops when it is dropped.
    pub fn watch(&self) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<EndpointAddress>), SessionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = self.clone();
        let file_name = self.path.file_name().map(|n| n.to_os_string());

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!("Endpoint watcher error: {}", e);
                    return;
                }
            };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                return;
            }
            let touches_store = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
            if !touches_store {
                return;
            }
            match store.load() {
                Ok(Some(address)) => {
                    debug!("Endpoint store changed: {}", address);
                    let _ = tx.send(address);
                }
                Ok(None) => {}
                Err(e) => warn!("Ignoring unreadable endpoint store: {}", e),
            }
        })
        .map_err(|e| SessionError::Config(format!("Failed to create endpoint watcher: {}", e)))?;

        let dir = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => parent.to_path_buf(),
            None => PathBuf::from("."),
        };
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| SessionError::Config(format!("Failed to watch {}: {}", dir.display(), e)))?;

        Ok((watcher, rx))
    }
}
