//! Boundary traits
//!
//! The agent never talks to a device directly: snapshots come from a
//! [`SnapshotSource`] and actions go to a [`Device`]. The file-backed
//! implementations below drive offline runs over recorded snapshots.

use std::fs;
use std::path::{Path, PathBuf};

use ape_common::{AgentError, ApeError, Result, TreeOptions, UiTree};
use ape_model::Action;
use tracing::{debug, info};

/// Supplies UI snapshots of the app under test
#[cfg_attr(test, mockall::automock)]
pub trait SnapshotSource {
    /// Current UI tree; `None` when the device returned nothing usable
    fn snapshot(&mut self) -> Result<Option<UiTree>>;

    /// Encoded screenshot of the current screen, if available
    fn screenshot(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Executes actions
#[cfg_attr(test, mockall::automock)]
pub trait Device {
    fn perform(&mut self, action: &Action) -> Result<()>;

    /// Force the foreground activity to stop
    fn stop_top_activity(&mut self) -> Result<()>;

    /// Crash observed since the last call, if any
    fn take_crash(&mut self) -> Result<Option<CrashReport>>;
}

/// An app crash reported by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    pub activity: String,
    pub message: String,
}

/// Package and activity launched by start actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub package: String,
    pub class: String,
}

impl Component {
    pub fn new(package: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            class: class.into(),
        }
    }
}

/// Replays the `*.json` snapshot documents of a directory in name order
#[derive(Debug)]
pub struct DirectorySource {
    files: Vec<PathBuf>,
    cursor: usize,
    options: TreeOptions,
}

impl DirectorySource {
    pub fn open(dir: &Path, options: TreeOptions) -> Result<Self> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map_or(false, |ext| ext == "json"))
            .collect();
        if files.is_empty() {
            return Err(AgentError::Device(format!("no snapshots in {}", dir.display())).into());
        }
        files.sort();
        info!(dir = %dir.display(), count = files.len(), "snapshot directory opened");
        Ok(Self {
            files,
            cursor: 0,
            options,
        })
    }

    pub fn remaining(&self) -> usize {
        self.files.len() - self.cursor
    }

    fn current(&self) -> Option<&PathBuf> {
        self.cursor.checked_sub(1).and_then(|i| self.files.get(i))
    }
}

impl SnapshotSource for DirectorySource {
    fn snapshot(&mut self) -> Result<Option<UiTree>> {
        let Some(path) = self.files.get(self.cursor) else {
            return Err(ApeError::StopTesting("snapshot directory exhausted".into()));
        };
        self.cursor += 1;
        let json = fs::read_to_string(path)?;
        match UiTree::from_json(&json, &self.options) {
            Ok(tree) => Ok(Some(tree)),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "unreadable snapshot");
                Ok(None)
            }
        }
    }

    fn screenshot(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(path) = self.current() else {
            return Ok(None);
        };
        let png = path.with_extension("png");
        if !png.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(png)?))
    }
}

/// Logs actions instead of executing them
#[derive(Debug, Default)]
pub struct DryRunDevice {
    performed: usize,
}

impl DryRunDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn performed(&self) -> usize {
        self.performed
    }
}

impl Device for DryRunDevice {
    fn perform(&mut self, action: &Action) -> Result<()> {
        self.performed += 1;
        info!(action = %action, throttle = action.throttle, "perform");
        Ok(())
    }

    fn stop_top_activity(&mut self) -> Result<()> {
        info!("stop top activity");
        Ok(())
    }

    fn take_crash(&mut self) -> Result<Option<CrashReport>> {
        Ok(None)
    }
}
