/// File System Watcher Module
///
/// Wraps a recursive `notify` watcher and debounces its raw event stream:
/// events for the same relative path are coalesced over a 300 ms window with
/// the last event winning, so editors that write-then-rename produce a
/// single change. Platform rename events that carry both paths surface as a
/// `Renamed`; platforms that only report delete+create pairs are collapsed
/// later by the engine's content-hash window.
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::error::{SyncError, SyncResult};

/// Debounce window per relative path.
const DEBOUNCE: Duration = Duration::from_millis(300);

/// Flush sweep period.
const FLUSH_TICK: Duration = Duration::from_millis(100);

/// A debounced change to one path.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchKind {
    Created,
    Modified,
    Removed,
    /// Rename where the platform reported both sides.
    Renamed { old_relative_path: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub relative_path: String,
    pub kind: WatchKind,
}

/// Keeps the native watcher alive; dropping this stops event delivery.
pub struct FsWatcher {
    _watcher: RecommendedWatcher,
}

impl FsWatcher {
    /// Watch `sync_root` recursively. Debounced events arrive on the
    /// returned receiver until shutdown flips.
    pub fn start(
        sync_root: &Path,
        shutdown: watch::Receiver<bool>,
    ) -> SyncResult<(Self, mpsc::Receiver<WatchEvent>)> {
        let (raw_tx, raw_rx) = mpsc::channel::<Event>(1024);
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                if let Ok(event) = result {
                    // Runs on the notify thread; drop events if the daemon
                    // cannot keep up rather than block the OS callback.
                    let _ = raw_tx.try_send(event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| SyncError::Io(format!("cannot create watcher: {}", e)))?;
        watcher
            .watch(sync_root, RecursiveMode::Recursive)
            .map_err(|e| SyncError::Io(format!("cannot watch {:?}: {}", sync_root, e)))?;

        let (out_tx, out_rx) = mpsc::channel(1024);
        tokio::spawn(debounce_loop(sync_root.to_path_buf(), raw_rx, out_tx, shutdown));
        Ok((Self { _watcher: watcher }, out_rx))
    }
}

/// Translate one raw notify event into per-path watch kinds.
pub(crate) fn map_event(event: &Event, sync_root: &Path) -> Vec<(String, WatchKind)> {
    let relative = |path: &PathBuf| -> Option<String> {
        path.strip_prefix(sync_root)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .filter(|p| !p.is_empty())
    };

    match &event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .filter_map(&relative)
            .map(|p| (p, WatchKind::Created))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .filter_map(&relative)
            .map(|p| (p, WatchKind::Removed))
            .collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::Both if event.paths.len() == 2 => {
                match (relative(&event.paths[0]), relative(&event.paths[1])) {
                    (Some(from), Some(to)) => {
                        vec![(to, WatchKind::Renamed { old_relative_path: from })]
                    }
                    // A rename across the root boundary degrades to a
                    // remove or a create of the side we can still see.
                    (Some(from), None) => vec![(from, WatchKind::Removed)],
                    (None, Some(to)) => vec![(to, WatchKind::Created)],
                    (None, None) => Vec::new(),
                }
            }
            RenameMode::From => event
                .paths
                .iter()
                .filter_map(&relative)
                .map(|p| (p, WatchKind::Removed))
                .collect(),
            RenameMode::To => event
                .paths
                .iter()
                .filter_map(&relative)
                .map(|p| (p, WatchKind::Created))
                .collect(),
            _ => event
                .paths
                .iter()
                .filter_map(&relative)
                .map(|p| (p, WatchKind::Modified))
                .collect(),
        },
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => event
            .paths
            .iter()
            .filter_map(&relative)
            .map(|p| (p, WatchKind::Modified))
            .collect(),
        _ => Vec::new(),
    }
}

fn merge(existing: Option<WatchKind>, incoming: WatchKind) -> WatchKind {
    match (existing, incoming) {
        // A rename followed by an in-place edit still needs the old path.
        (Some(WatchKind::Renamed { old_relative_path }), WatchKind::Modified) => {
            WatchKind::Renamed { old_relative_path }
        }
        // Created then modified within the window is still a create.
        (Some(WatchKind::Created), WatchKind::Modified) => WatchKind::Created,
        (_, incoming) => incoming,
    }
}

async fn debounce_loop(
    sync_root: PathBuf,
    mut raw: mpsc::Receiver<Event>,
    out: mpsc::Sender<WatchEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut pending: HashMap<String, (WatchKind, Instant)> = HashMap::new();
    let mut ticker = tokio::time::interval(FLUSH_TICK);
    loop {
        tokio::select! {
            event = raw.recv() => {
                let Some(event) = event else { break };
                let deadline = Instant::now() + DEBOUNCE;
                for (path, kind) in map_event(&event, &sync_root) {
                    let merged = merge(pending.remove(&path).map(|(k, _)| k), kind);
                    pending.insert(path, (merged, deadline));
                }
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                let due: Vec<String> = pending
                    .iter()
                    .filter(|(_, (_, deadline))| *deadline <= now)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in due {
                    if let Some((kind, _)) = pending.remove(&path) {
                        if out.send(WatchEvent { relative_path: path, kind }).await.is_err() {
                            return;
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::CreateKind;

    fn event(kind: EventKind, paths: Vec<PathBuf>) -> Event {
        let mut e = Event::new(kind);
        e.paths = paths;
        e
    }

    #[test]
    fn maps_paths_relative_to_root() {
        let root = PathBuf::from("/sync");
        let e = event(
            EventKind::Create(CreateKind::File),
            vec![PathBuf::from("/sync/docs/new.txt")],
        );
        assert_eq!(
            map_event(&e, &root),
            vec![("docs/new.txt".to_string(), WatchKind::Created)]
        );

        // Paths outside the root are dropped
        let outside = event(
            EventKind::Create(CreateKind::File),
            vec![PathBuf::from("/elsewhere/x.txt")],
        );
        assert!(map_event(&outside, &root).is_empty());
    }

    #[test]
    fn rename_both_carries_old_path() {
        let root = PathBuf::from("/sync");
        let e = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            vec![PathBuf::from("/sync/old.txt"), PathBuf::from("/sync/new.txt")],
        );
        assert_eq!(
            map_event(&e, &root),
            vec![(
                "new.txt".to_string(),
                WatchKind::Renamed { old_relative_path: "old.txt".to_string() }
            )]
        );
    }

    #[test]
    fn metadata_only_changes_are_dropped() {
        let root = PathBuf::from("/sync");
        let e = event(
            EventKind::Modify(ModifyKind::Metadata(notify::event::MetadataKind::Any)),
            vec![PathBuf::from("/sync/a.txt")],
        );
        assert!(map_event(&e, &root).is_empty());
    }

    #[test]
    fn merge_keeps_rename_and_create() {
        assert_eq!(
            merge(
                Some(WatchKind::Renamed { old_relative_path: "a".into() }),
                WatchKind::Modified
            ),
            WatchKind::Renamed { old_relative_path: "a".into() }
        );
        assert_eq!(merge(Some(WatchKind::Created), WatchKind::Modified), WatchKind::Created);
        assert_eq!(merge(Some(WatchKind::Modified), WatchKind::Removed), WatchKind::Removed);
        assert_eq!(merge(None, WatchKind::Modified), WatchKind::Modified);
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_collapses_bursts() {
        let (raw_tx, raw_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(debounce_loop(PathBuf::from("/sync"), raw_rx, out_tx, shutdown_rx));

        for _ in 0..5 {
            raw_tx
                .send(event(
                    EventKind::Modify(ModifyKind::Any),
                    vec![PathBuf::from("/sync/burst.txt")],
                ))
                .await
                .unwrap();
        }

        let got = out_rx.recv().await.unwrap();
        assert_eq!(got.relative_path, "burst.txt");
        assert_eq!(got.kind, WatchKind::Modified);

        // Nothing else should be pending
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(out_rx.try_recv().is_err());
    }
}
