//! JSON-file state store.
//!
//! Every mutation rewrites the whole file: serialize, write a sibling temp
//! file, fsync, rename over the target.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("failed to write state file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// What the connector remembers about one host's instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    /// RFC 3339 UTC timestamp of the launch.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_at: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_state: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub last_ipv4: Vec<String>,
}

/// On-disk document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceState>,
}

/// Durable host_id → instance mapping.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: State,
}

impl StateStore {
    /// Load the store at `path`.
    ///
    /// A missing, unreadable or malformed file yields an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<State>(&contents) {
                Ok(state) => {
                    debug!(
                        path = %path.display(),
                        instance_count = state.instances.len(),
                        "Loaded state"
                    );
                    state
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Malformed state file, starting empty"
                    );
                    State::default()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No state file, starting empty");
                State::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable state file, starting empty");
                State::default()
            }
        };

        Self { path, state }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn get(&self, host_id: &str) -> Option<&InstanceState> {
        self.state.instances.get(host_id)
    }

    /// Insert or replace an entry and persist. Memory is only updated once
    /// the file is written.
    pub fn set(&mut self, host_id: &str, entry: InstanceState) -> Result<(), StateStoreError> {
        let mut next = self.state.clone();
        next.instances.insert(host_id.to_string(), entry);
        self.commit(next)
    }

    /// Record an observation for an entry, keeping its image and creation
    /// time when one already exists.
    pub fn refresh(
        &mut self,
        host_id: &str,
        name: &str,
        last_state: &str,
        last_ipv4: &[String],
    ) -> Result<(), StateStoreError> {
        let existing = self.get(host_id).cloned().unwrap_or_default();
        self.set(
            host_id,
            InstanceState {
                name: name.to_string(),
                image: existing.image,
                created_at: existing.created_at,
                last_state: last_state.to_string(),
                last_ipv4: last_ipv4.to_vec(),
            },
        )
    }

    /// Remove an entry and persist. Returns the removed entry.
    pub fn remove(&mut self, host_id: &str) -> Result<Option<InstanceState>, StateStoreError> {
        let mut next = self.state.clone();
        let removed = next.instances.remove(host_id);
        self.commit(next)?;
        Ok(removed)
    }

    /// Rewrite the file from memory.
    pub fn persist(&self) -> Result<(), StateStoreError> {
        self.write(&self.state)
    }

    fn commit(&mut self, next: State) -> Result<(), StateStoreError> {
        self.write(&next)?;
        self.state = next;
        Ok(())
    }

    fn write(&self, state: &State) -> Result<(), StateStoreError> {
        let contents = serde_json::to_string_pretty(state)?;
        write_atomic(&self.path, contents.as_bytes()).map_err(|source| StateStoreError::Io {
            path: self.path.clone(),
            source,
        })?;

        debug!(
            path = %self.path.display(),
            instance_count = state.instances.len(),
            "Saved state"
        );
        Ok(())
    }
}

/// Write `contents` to `path` via a sibling temp file with owner-only
/// permissions.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&tmp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)
}
