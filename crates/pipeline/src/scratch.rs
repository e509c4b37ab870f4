//! Scratch files for downloaded videos and extracted audio.
//!
//! Every file is owned by a `ScratchFile` guard that deletes it when released
//! or dropped, so a pipeline run cannot leak its artifacts whichever way it
//! exits. `sweep_orphans` catches whatever a crashed process left behind.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use uuid::Uuid;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Video,
    Audio,
}

impl ArtifactKind {
    fn prefix(self) -> &'static str {
        match self {
            ArtifactKind::Video => "video",
            ArtifactKind::Audio => "audio",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            ArtifactKind::Video => "mp4",
            ArtifactKind::Audio => "wav",
        }
    }
}

/// Shared scratch directory. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ScratchDir {
    root: PathBuf,
    live: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ScratchDir {
    /// Open (and create if needed) the scratch directory
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create scratch directory: {}", root.display()))?;
        Ok(Self {
            root,
            live: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reserve a uniquely named path. The file itself is created by whoever writes to it.
    pub fn acquire(&self, kind: ArtifactKind) -> ScratchFile {
        let name = format!("{}-{}.{}", kind.prefix(), Uuid::new_v4(), kind.extension());
        self.track(self.root.join(name))
    }

    /// Take ownership of a file some stage created on its own. Only existing
    /// files that resolve to somewhere under the scratch root are accepted.
    pub fn adopt(&self, path: PathBuf) -> Result<ScratchFile> {
        let resolved = fs::canonicalize(&path)
            .with_context(|| format!("Failed to resolve {}", path.display()))?;
        let root = fs::canonicalize(&self.root)
            .with_context(|| format!("Failed to resolve scratch directory: {}", self.root.display()))?;
        if !resolved.starts_with(&root) {
            bail!(
                "{} is outside the scratch directory {}",
                path.display(),
                self.root.display()
            );
        }
        Ok(self.track(path))
    }

    fn track(&self, path: PathBuf) -> ScratchFile {
        self.live.lock().insert(path.clone());
        ScratchFile {
            path,
            live: Arc::clone(&self.live),
            released: false,
        }
    }

    /// Number of guards not yet released
    pub fn outstanding(&self) -> usize {
        self.live.lock().len()
    }

    /// Delete files under the scratch root older than `older_than` that no live
    /// guard owns. Returns the number of files deleted.
    pub fn sweep_orphans(&self, older_than: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut deleted = 0;

        for entry in WalkDir::new(&self.root).follow_links(false).into_iter() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading scratch entry: {}", e);
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_file() || self.live.lock().contains(path) {
                continue;
            }

            let modified = match entry.metadata().ok().and_then(|m| m.modified().ok()) {
                Some(modified) => modified,
                None => {
                    warn!("Failed to stat scratch file: {}", path.display());
                    continue;
                }
            };
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age < older_than {
                continue;
            }

            match fs::remove_file(path) {
                Ok(()) => {
                    info!("🗑️  Deleted orphaned scratch file: {} (age {})", path.display(), format_age(age));
                    deleted += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to delete orphaned scratch file {}: {}", path.display(), e),
            }
        }

        if deleted > 0 {
            info!("✅ Swept {} orphaned scratch file(s)", deleted);
        } else {
            debug!("No orphaned scratch files found in {}", self.root.display());
        }
        Ok(deleted)
    }
}

/// Guard over one scratch path. The file is deleted exactly once, on
/// `release` or on drop, whichever comes first.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
    live: Arc<Mutex<HashSet<PathBuf>>>,
    released: bool,
}

impl ScratchFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file now. Later calls and the eventual drop do nothing.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.live.lock().remove(&self.path);
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Released scratch file: {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete scratch file: {}", self.path.display())),
        }
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("{:#}", e);
        }
    }
}

/// Format an age as `Xh Ym Zs`
pub fn format_age(age: Duration) -> String {
    let secs = age.as_secs();
    format!("{}h {}m {}s", secs / 3600, (secs / 60) % 60, secs % 60)
}
