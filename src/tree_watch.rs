//! Reloads a layer tree when its file, or anything next to it, changes.

use crate::tree::{load_tree, AuthoredGroup};
use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use tracing::{error, info};

/// Watches the directory holding a tree file, so edits to layer sources
/// referenced by `path:` also trigger a reload.
pub struct TreeWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<Event>>,
}

impl TreeWatcher {
    pub fn new(path: &Path) -> Result<Self> {
        let (tx, rx) = channel();
        let mut watcher = RecommendedWatcher::new(tx, notify::Config::default())
            .context("failed to create tree watcher")?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        watcher
            .watch(dir, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", dir.display()))?;
        info!(path = %path.display(), "watching layer tree for changes");
        Ok(Self {
            path: path.to_path_buf(),
            _watcher: watcher,
            rx,
        })
    }

    /// Drains pending events and returns the reloaded tree if anything
    /// changed. A tree that fails to load is logged and skipped, leaving the
    /// previous compile in place.
    pub fn check_for_changes(&mut self) -> Option<AuthoredGroup> {
        let mut needs_reload = false;
        while let Ok(res) = self.rx.try_recv() {
            if let Ok(event) = res {
                if is_content_change(&event.kind) {
                    needs_reload = true;
                }
            }
        }
        if !needs_reload {
            return None;
        }

        info!("layer tree changed, reloading");
        match load_tree(&self.path) {
            Ok(tree) => Some(tree),
            Err(e) => {
                error!("failed to reload layer tree: {e}");
                None
            }
        }
    }
}

fn is_content_change(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Modify(_) | EventKind::Create(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind};

    #[test]
    fn test_content_changes_trigger_reload() {
        assert!(is_content_change(&EventKind::Modify(ModifyKind::Any)));
        assert!(is_content_change(&EventKind::Create(CreateKind::File)));
        assert!(!is_content_change(&EventKind::Access(AccessKind::Any)));
    }
}
