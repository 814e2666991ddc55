//! Debounced filesystem watcher.
//!
//! Optional background service feeding changed paths back into the
//! indexer. Rapid events for the same path are merged during a debounce
//! window, with deletion winning over creation and modification. The
//! engine owns start and stop through a `WatchHandle`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::Result;

/// Watcher configuration; disabled unless a host opts in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub enabled: bool,
    /// Quiet period before a path's merged event is released.
    pub debounce_ms: u64,
    /// File extensions worth reacting to.
    pub extensions: Vec<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce_ms: 500,
            extensions: vec![
                "rs".to_string(),
                "py".to_string(),
                "js".to_string(),
                "jsx".to_string(),
                "ts".to_string(),
                "tsx".to_string(),
                "go".to_string(),
                "md".to_string(),
                "txt".to_string(),
            ],
        }
    }
}

/// A debounced change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
    Renamed(PathBuf, PathBuf),
}

impl FileEvent {
    /// The path the event keys on for merging.
    fn path(&self) -> &Path {
        match self {
            Self::Created(p) | Self::Modified(p) | Self::Deleted(p) => p,
            Self::Renamed(_, new) => new,
        }
    }
}

struct PendingEvent {
    event: FileEvent,
    last_seen: Instant,
}

/// Recursive watcher over one root. The notify handle must stay alive
/// for events to keep flowing.
#[derive(Debug)]
pub struct FileWatcher {
    config: WatcherConfig,
    root: PathBuf,
    inner: Option<RecommendedWatcher>,
}

impl FileWatcher {
    pub fn new(root: PathBuf, config: WatcherConfig) -> Self {
        Self {
            config,
            root,
            inner: None,
        }
    }

    /// Start watching; returns the debounced event stream.
    pub fn start(&mut self) -> Result<mpsc::Receiver<FileEvent>> {
        let (raw_tx, raw_rx) = mpsc::channel::<FileEvent>(100);
        let (debounced_tx, debounced_rx) = mpsc::channel(100);
        let extensions = self.config.extensions.clone();
        let debounce = Duration::from_millis(self.config.debounce_ms);

        let mut watcher =
            notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    for file_event in convert_event(event, &extensions) {
                        let _ = raw_tx.blocking_send(file_event);
                    }
                }
            })
            .map_err(|e| anyhow::anyhow!("create watcher: {}", e))?;
        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| anyhow::anyhow!("watch {}: {}", self.root.display(), e))?;
        self.inner = Some(watcher);

        tokio::spawn(debounce_events(raw_rx, debounced_tx, debounce));

        info!(
            "watching {} with {}ms debounce",
            self.root.display(),
            debounce.as_millis()
        );
        Ok(debounced_rx)
    }

    pub fn stop(&mut self) {
        if self.inner.take().is_some() {
            info!("stopped watching {}", self.root.display());
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_some()
    }
}

/// Merge raw events per path and release them after a quiet period.
async fn debounce_events(
    mut raw_rx: mpsc::Receiver<FileEvent>,
    debounced_tx: mpsc::Sender<FileEvent>,
    debounce: Duration,
) {
    let mut pending: HashMap<PathBuf, PendingEvent> = HashMap::new();
    let tick = Duration::from_millis(50);

    loop {
        match tokio::time::timeout(tick, raw_rx.recv()).await {
            Ok(Some(event)) => {
                let path = event.path().to_path_buf();
                let now = Instant::now();
                pending
                    .entry(path)
                    .and_modify(|p| {
                        p.event = merge_events(&p.event, &event);
                        p.last_seen = now;
                    })
                    .or_insert(PendingEvent {
                        event,
                        last_seen: now,
                    });
            }
            Ok(None) => {
                for (_, pending_event) in pending.drain() {
                    let _ = debounced_tx.send(pending_event.event).await;
                }
                return;
            }
            Err(_) => {}
        }

        let now = Instant::now();
        let mut ready = Vec::new();
        pending.retain(|_, p| {
            if now.duration_since(p.last_seen) >= debounce {
                ready.push(p.event.clone());
                false
            } else {
                true
            }
        });
        for event in ready {
            if debounced_tx.send(event).await.is_err() {
                return;
            }
        }
    }
}

/// Merge two events for the same path. Deletion is final; a created
/// file that is then modified is still just created.
fn merge_events(existing: &FileEvent, new: &FileEvent) -> FileEvent {
    match (existing, new) {
        (_, FileEvent::Deleted(p)) => FileEvent::Deleted(p.clone()),
        (FileEvent::Deleted(p), _) => FileEvent::Deleted(p.clone()),
        (FileEvent::Created(p), FileEvent::Modified(_)) => FileEvent::Created(p.clone()),
        (FileEvent::Modified(_), FileEvent::Created(p)) => FileEvent::Created(p.clone()),
        (_, FileEvent::Renamed(old, new)) => FileEvent::Renamed(old.clone(), new.clone()),
        (FileEvent::Renamed(old, new), _) => FileEvent::Renamed(old.clone(), new.clone()),
        (_, other) => other.clone(),
    }
}

fn convert_event(event: Event, extensions: &[String]) -> Vec<FileEvent> {
    let mut out = Vec::new();
    for path in event.paths {
        if !is_watched(&path, extensions) {
            continue;
        }
        let file_event = match event.kind {
            notify::EventKind::Create(_) => Some(FileEvent::Created(path)),
            notify::EventKind::Modify(_) => Some(FileEvent::Modified(path)),
            notify::EventKind::Remove(_) => Some(FileEvent::Deleted(path)),
            _ => None,
        };
        if let Some(fe) = file_event {
            out.push(fe);
        }
    }
    out
}

fn is_watched(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| extensions.iter().any(|allowed| allowed == ext))
        .unwrap_or(false)
}

/// Keeps a watch alive; dropping it stops both the watcher and the
/// consumer task.
#[derive(Debug)]
pub struct WatchHandle {
    watcher: FileWatcher,
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub(crate) fn new(watcher: FileWatcher, task: JoinHandle<()>) -> Self {
        Self { watcher, task }
    }

    pub fn stop(mut self) {
        self.watcher.stop();
        self.task.abort();
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.watcher.stop();
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watcher_config_default() {
        let config = WatcherConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.debounce_ms, 500);
        assert!(config.extensions.iter().any(|e| e == "rs"));
    }

    #[test]
    fn test_is_watched() {
        let extensions = vec!["rs".to_string(), "md".to_string()];
        assert!(is_watched(Path::new("src/lib.rs"), &extensions));
        assert!(is_watched(Path::new("README.md"), &extensions));
        assert!(!is_watched(Path::new("image.png"), &extensions));
        assert!(!is_watched(Path::new("Makefile"), &extensions));
    }

    #[test]
    fn test_merge_delete_wins() {
        let p = PathBuf::from("a.rs");
        let created = FileEvent::Created(p.clone());
        let modified = FileEvent::Modified(p.clone());
        let deleted = FileEvent::Deleted(p.clone());

        assert!(matches!(
            merge_events(&created, &deleted),
            FileEvent::Deleted(_)
        ));
        assert!(matches!(
            merge_events(&modified, &deleted),
            FileEvent::Deleted(_)
        ));
        assert!(matches!(
            merge_events(&deleted, &created),
            FileEvent::Deleted(_)
        ));
    }

    #[test]
    fn test_merge_create_then_modify_stays_created() {
        let p = PathBuf::from("a.rs");
        let merged = merge_events(&FileEvent::Created(p.clone()), &FileEvent::Modified(p));
        assert!(matches!(merged, FileEvent::Created(_)));
    }

    #[tokio::test]
    async fn test_debounce_merges_rapid_events() {
        let (raw_tx, raw_rx) = mpsc::channel(16);
        let (debounced_tx, mut debounced_rx) = mpsc::channel(16);
        tokio::spawn(debounce_events(
            raw_rx,
            debounced_tx,
            Duration::from_millis(20),
        ));

        let p = PathBuf::from("a.rs");
        raw_tx.send(FileEvent::Created(p.clone())).await.unwrap();
        raw_tx.send(FileEvent::Modified(p.clone())).await.unwrap();
        raw_tx.send(FileEvent::Deleted(p.clone())).await.unwrap();

        let merged = tokio::time::timeout(Duration::from_secs(2), debounced_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(merged, FileEvent::Deleted(p));

        // Nothing else was pending.
        drop(raw_tx);
        let rest = tokio::time::timeout(Duration::from_secs(2), debounced_rx.recv())
            .await
            .unwrap();
        assert!(rest.is_none());
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = FileWatcher::new(dir.path().to_path_buf(), WatcherConfig::default());
        assert!(!watcher.is_running());

        let _rx = watcher.start().unwrap();
        assert!(watcher.is_running());

        watcher.stop();
        assert!(!watcher.is_running());
    }
}
