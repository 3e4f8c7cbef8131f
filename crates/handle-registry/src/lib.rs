//! Persistent wallet-to-handle map. One handle per wallet, immutable once
//! set, globally unique ignoring case. Backed by a JSON object file keyed
//! by lower-case wallet hex, rewritten on each mutation.

use chess_domain::WalletAddress;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

pub const MIN_HANDLE_LEN: usize = 3;
pub const MAX_HANDLE_LEN: usize = 15;

#[derive(Debug, Error)]
pub enum HandleRegistryError {
    #[error("wallet already has a registered handle")]
    AlreadyRegistered,
    #[error("handle must be {MIN_HANDLE_LEN}-{MAX_HANDLE_LEN} characters of letters, digits or underscore")]
    InvalidFormat,
    #[error("handle is already taken")]
    Taken,
    #[error("failed reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed writing {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed registry file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug)]
pub struct HandleRegistry {
    path: PathBuf,
    handles: HashMap<String, String>,
}

fn is_valid_handle(handle: &str) -> bool {
    (MIN_HANDLE_LEN..=MAX_HANDLE_LEN).contains(&handle.len())
        && handle
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

impl HandleRegistry {
    /// Load the registry, treating a missing file as empty.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, HandleRegistryError> {
        let path = path.as_ref().to_path_buf();
        let handles = match std::fs::read_to_string(&path) {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|source| HandleRegistryError::Parse {
                    path: path.display().to_string(),
                    source,
                })?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => {
                return Err(HandleRegistryError::Read {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        Ok(Self { path, handles })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    #[must_use]
    pub fn handle_for(&self, wallet: &WalletAddress) -> Option<&str> {
        self.handles.get(&wallet.to_lower_hex()).map(String::as_str)
    }

    #[must_use]
    pub fn is_taken(&self, handle: &str) -> bool {
        self.handles
            .values()
            .any(|existing| existing.eq_ignore_ascii_case(handle))
    }

    pub fn register(
        &mut self,
        wallet: &WalletAddress,
        handle: &str,
    ) -> Result<(), HandleRegistryError> {
        if !is_valid_handle(handle) {
            return Err(HandleRegistryError::InvalidFormat);
        }
        let key = wallet.to_lower_hex();
        if self.handles.contains_key(&key) {
            return Err(HandleRegistryError::AlreadyRegistered);
        }
        if self.is_taken(handle) {
            return Err(HandleRegistryError::Taken);
        }
        self.handles.insert(key, handle.to_string());
        self.persist()?;
        info!(wallet = %wallet, handle, "registered username");
        Ok(())
    }

    fn persist(&self) -> Result<(), HandleRegistryError> {
        let content = serde_json::to_string_pretty(&self.handles).map_err(|source| {
            HandleRegistryError::Parse {
                path: self.path.display().to_string(),
                source,
            }
        })?;
        std::fs::write(&self.path, content).map_err(|source| HandleRegistryError::Write {
            path: self.path.display().to_string(),
            source,
        })
    }
}
