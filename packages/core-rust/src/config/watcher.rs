//! File watcher that re-merges the file layer when a config file changes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use notify::event::{EventKind, ModifyKind};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{info, warn};

use super::Configuration;
use crate::error::ConfigError;

/// Keeps the platform watcher alive; dropping it stops watching.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    watched: Vec<PathBuf>,
}

impl std::fmt::Debug for ConfigWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigWatcher")
            .field("watched", &self.watched)
            .finish_non_exhaustive()
    }
}

impl ConfigWatcher {
    /// Watches the parent directory of every configured file, so editors that
    /// replace files by rename are still observed.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Watch` if the watcher or a directory watch fails.
    pub fn start(config: Configuration) -> Result<Self, ConfigError> {
        let targets: HashSet<PathBuf> = config
            .files()
            .iter()
            .map(|f| absolute(&f.path))
            .collect();
        let dirs: HashSet<PathBuf> = targets
            .iter()
            .filter_map(|p| p.parent().map(Path::to_path_buf))
            .filter(|d| d.is_dir())
            .collect();

        let handler_config = config.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) if is_content_change(&event.kind) => {
                    let Some(changed) = event
                        .paths
                        .iter()
                        .map(|p| absolute(p))
                        .find(|p| targets.contains(p))
                    else {
                        return;
                    };
                    match handler_config.reload_files() {
                        Ok(()) => info!(file = %changed.display(), "config file changed"),
                        Err(e) => warn!(file = %changed.display(), error = %e, "config reload failed"),
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "config watch error"),
            }
        })?;

        let mut watched = Vec::with_capacity(dirs.len());
        for dir in dirs {
            watcher.watch(&dir, RecursiveMode::NonRecursive)?;
            watched.push(dir);
        }

        Ok(Self {
            _watcher: watcher,
            watched,
        })
    }

    /// Directories currently being watched.
    #[must_use]
    pub fn watched(&self) -> &[PathBuf] {
        &self.watched
    }
}

fn is_content_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Name(_))
    )
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        }
    })
}
