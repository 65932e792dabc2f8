//! C9: watches the hooks directory for changes and reloads the affected
//! file's hooks into the registry. Debounced 200ms so an editor's
//! write-then-rename save doesn't trigger two reloads in a row.

use crate::loader::{self, DocumentMode};
use crate::registry::Registry;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const DEBOUNCE: Duration = Duration::from_millis(200);

/// Holds the underlying OS file watcher alive; dropping this stops
/// watching.
pub struct Watcher {
    _debouncer: Debouncer<notify::RecommendedWatcher>,
}

pub async fn watch_directory(dir: PathBuf, mode: DocumentMode, registry: Arc<Registry>) -> notify::Result<Watcher> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut debouncer = new_debouncer(DEBOUNCE, move |result: DebounceEventResult| {
        let _ = tx.send(result);
    })?;
    debouncer.watcher().watch(&dir, RecursiveMode::NonRecursive)?;

    tokio::spawn(async move {
        while let Some(result) = rx.recv().await {
            match result {
                Ok(events) => {
                    for event in events {
                        handle_change(&event.path, mode, &registry).await;
                    }
                }
                Err(errors) => {
                    for e in errors {
                        log::error!("hook file watcher error: {e}");
                    }
                }
            }
        }
        log::warn!("hook file watcher channel closed, hot-reload is no longer active");
    });

    log::info!("watching {} for hook changes", dir.display());
    Ok(Watcher { _debouncer: debouncer })
}

fn is_hook_doc(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
        Some("json") | Some("yaml") | Some("yml")
    )
}

async fn handle_change(path: &Path, mode: DocumentMode, registry: &Arc<Registry>) {
    if !is_hook_doc(path) {
        return;
    }
    if path.exists() {
        match loader::load_file(path, mode).await {
            Ok(hooks) => match registry.replace_file(path, hooks) {
                Ok(()) => log::info!("reloaded hooks from {}", path.display()),
                Err(e) => log::error!("reload of {} skipped: {e}", path.display()),
            },
            Err(e) => log::error!("reload of {} failed: {e}", path.display()),
        }
    } else {
        registry.remove_file(path);
        log::info!("removed hooks for deleted file {}", path.display());
    }
}

/// Reloads every hook file under `dir`, used by the SIGHUP/SIGUSR1
/// process-level reload path (spec §4.C9 / §6).
pub async fn reload_all(dir: &Path, mode: DocumentMode, registry: &Arc<Registry>) {
    match loader::load_directory(dir, mode).await {
        Ok(by_file) => {
            for (path, hooks) in by_file {
                match registry.replace_file(&path, hooks) {
                    Ok(()) => {}
                    Err(e) => log::error!("reload of {} skipped: {e}", path.display()),
                }
            }
            log::info!("reloaded all hooks from {}", dir.display());
        }
        Err(e) => log::error!("failed to reload hooks directory {}: {e}", dir.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    #[tokio::test]
    async fn reload_all_picks_up_every_file_in_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("a.json")).unwrap();
        f.write_all(br#"[{"id":"a","execute-command":"/bin/true"}]"#).unwrap();
        let mut f2 = std::fs::File::create(dir.path().join("b.json")).unwrap();
        f2.write_all(br#"[{"id":"b","execute-command":"/bin/true"}]"#).unwrap();

        let registry = Arc::new(Registry::new());
        reload_all(dir.path(), DocumentMode::Literal, &registry).await;
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn handle_change_removes_hooks_for_a_deleted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.json");
        std::fs::write(&path, br#"[{"id":"a","execute-command":"/bin/true"}]"#).unwrap();
        let registry = Arc::new(Registry::new());
        reload_all(dir.path(), DocumentMode::Literal, &registry).await;
        assert_eq!(registry.len(), 1);

        std::fs::remove_file(&path).unwrap();
        handle_change(&path, DocumentMode::Literal, &registry).await;
        assert_eq!(registry.len(), 0);
    }
}
