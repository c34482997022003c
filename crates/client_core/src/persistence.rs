use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use shared::domain::{Cell, ReservationId};
use tracing::warn;

/// What a visitor remembers about their claim across restarts. Advisory: the
/// lock service's view always wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSelection {
    #[serde(default)]
    pub reservation_id: Option<ReservationId>,
    #[serde(default)]
    pub blocks: Vec<Cell>,
}

impl PersistedSelection {
    pub fn is_empty(&self) -> bool {
        self.reservation_id.is_none() && self.blocks.is_empty()
    }
}

pub trait SelectionStore: Send + Sync {
    fn load(&self) -> Result<Option<PersistedSelection>>;
    fn save(&self, selection: &PersistedSelection) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

pub struct JsonFileSelectionStore {
    path: PathBuf,
}

impl JsonFileSelectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SelectionStore for JsonFileSelectionStore {
    fn load(&self) -> Result<Option<PersistedSelection>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read '{}'", self.path.display()))
            }
        };
        match serde_json::from_str(&raw) {
            Ok(selection) => Ok(Some(selection)),
            Err(error) => {
                warn!(
                    path = %self.path.display(),
                    %error,
                    "selection: discarding unreadable saved selection"
                );
                Ok(None)
            }
        }
    }

    fn save(&self, selection: &PersistedSelection) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create '{}'", parent.display()))?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(selection)?)
            .with_context(|| format!("failed to write '{}'", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace '{}'", self.path.display()))?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove '{}'", self.path.display()))
            }
        }
    }
}

#[derive(Default)]
pub struct MemorySelectionStore {
    inner: Mutex<Option<PersistedSelection>>,
}

impl MemorySelectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_selection(selection: PersistedSelection) -> Self {
        Self {
            inner: Mutex::new(Some(selection)),
        }
    }
}

impl SelectionStore for MemorySelectionStore {
    fn load(&self) -> Result<Option<PersistedSelection>> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("selection store lock poisoned"))?;
        Ok(guard.clone())
    }

    fn save(&self, selection: &PersistedSelection) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("selection store lock poisoned"))?;
        *guard = Some(selection.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("selection store lock poisoned"))?;
        *guard = None;
        Ok(())
    }
}
