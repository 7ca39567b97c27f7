// src/watcher.rs
//! Snippet watcher
//! - Watches snippet roots on disk with `notify`
//! - Debounces bursts of file events on a background thread
//! - Emits `SnippetEvent`s keyed by virtual snippet id, with the new text already read
//!
//! Usage:
//!  let mut watcher = SnippetWatcher::new(&config.watcher)?;
//!  watcher.watch_root("shaders/", "/Project")?;
//!  // each editor tick:
//!  session.apply_snippet_events(watcher.poll());

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;

use crate::config::WatcherConfig;
use crate::error::{Error, Result};
use crate::snippets::{snippet_id_for, SnippetId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnippetEvent {
    Changed { id: SnippetId, text: String },
    Removed { id: SnippetId },
}

impl SnippetEvent {
    pub fn id(&self) -> &SnippetId {
        match self {
            SnippetEvent::Changed { id, .. } | SnippetEvent::Removed { id } => id,
        }
    }
}

/// Watched root: disk directory + virtual mount prefix.
#[derive(Debug, Clone)]
struct Root {
    dir: PathBuf,
    prefix: String,
}

type Roots = Arc<RwLock<Vec<Root>>>;

// ---------- Debounce ----------

/// Paths touched recently; a path is released once it has been quiet for the window.
#[derive(Debug, Default)]
struct Debouncer {
    pending: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    fn touch(&mut self, path: PathBuf, now: Instant) {
        self.pending.insert(path, now);
    }

    fn drain_ready(&mut self, now: Instant, window: Duration) -> Vec<PathBuf> {
        let mut ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, t)| now.duration_since(**t) >= window)
            .map(|(p, _)| p.clone())
            .collect();
        for p in &ready {
            self.pending.remove(p);
        }
        ready.sort();
        ready
    }
}

/// Turn a settled path into an event. Existence decides change vs removal, so
/// renames and editor save-via-replace come out right.
fn settle(roots: &[Root], path: &Path) -> Option<SnippetEvent> {
    let id = roots
        .iter()
        .filter(|r| path.starts_with(&r.dir))
        .find_map(|r| snippet_id_for(&r.dir, &r.prefix, path))?;
    match std::fs::read_to_string(path) {
        Ok(text) => Some(SnippetEvent::Changed { id, text }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Some(SnippetEvent::Removed { id }),
        Err(e) => {
            log::warn!("could not read snippet {}: {}", path.display(), e);
            None
        }
    }
}

// ---------- Watcher ----------

pub struct SnippetWatcher {
    watcher: Option<RecommendedWatcher>,
    roots: Roots,
    events: Receiver<SnippetEvent>,
    debounce_thread: Option<JoinHandle<()>>,
}

impl SnippetWatcher {
    pub fn new(config: &WatcherConfig) -> Result<Self> {
        let (raw_tx, raw_rx) = unbounded::<PathBuf>();
        let (event_tx, event_rx) = unbounded::<SnippetEvent>();

        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    for path in event.paths {
                        let _ = raw_tx.send(path);
                    }
                }
            }
            Err(e) => log::warn!("notify error: {:?}", e),
        })
        .map_err(|e| Error::custom(format!("failed to create file watcher: {e}")))?;

        let roots: Roots = Arc::new(RwLock::new(Vec::new()));
        let window = Duration::from_millis(config.debounce_ms);
        let thread_roots = roots.clone();
        let debounce_thread = std::thread::Builder::new()
            .name("snippet-watch".into())
            .spawn(move || debounce_loop(raw_rx, event_tx, thread_roots, window))?;

        Ok(Self {
            watcher: Some(watcher),
            roots,
            events: event_rx,
            debounce_thread: Some(debounce_thread),
        })
    }

    /// Watch `dir` recursively; files under it map to `<prefix>/<relative path>`.
    pub fn watch_root(&mut self, dir: impl AsRef<Path>, prefix: &str) -> Result<()> {
        let dir = dir.as_ref();
        let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
        if let Some(watcher) = self.watcher.as_mut() {
            watcher
                .watch(&dir, RecursiveMode::Recursive)
                .map_err(|e| Error::custom(format!("watch failed for {}: {e}", dir.display())))?;
        }
        log::info!("watching snippets in {} as {}", dir.display(), prefix);
        self.roots.write().push(Root {
            dir,
            prefix: prefix.to_string(),
        });
        Ok(())
    }

    /// Settled events since the last poll. Never blocks.
    pub fn poll(&self) -> Vec<SnippetEvent> {
        self.events.try_iter().collect()
    }

    pub fn events(&self) -> &Receiver<SnippetEvent> {
        &self.events
    }
}

impl Drop for SnippetWatcher {
    fn drop(&mut self) {
        // dropping the notify watcher disconnects the raw channel and ends the thread
        self.watcher.take();
        if let Some(handle) = self.debounce_thread.take() {
            if handle.join().is_err() {
                log::error!("snippet watch thread panicked");
            }
        }
    }
}

fn debounce_loop(raw_rx: Receiver<PathBuf>, event_tx: Sender<SnippetEvent>, roots: Roots, window: Duration) {
    let mut debouncer = Debouncer::default();
    let tick = Duration::from_millis(50).min(window.max(Duration::from_millis(1)));
    loop {
        match raw_rx.recv_timeout(tick) {
            Ok(path) => debouncer.touch(path, Instant::now()),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        for path in debouncer.drain_ready(Instant::now(), window) {
            let Some(event) = settle(&roots.read(), &path) else {
                continue;
            };
            log::debug!("snippet event {:?}", event.id());
            if event_tx.send(event).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("snippet_watch_{}_{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(dir.join("lib")).unwrap();
        dir
    }

    #[test]
    fn test_debounce_waits_for_quiet() {
        let mut d = Debouncer::default();
        let t0 = Instant::now();
        let window = Duration::from_millis(100);
        d.touch(PathBuf::from("a.ush"), t0);
        d.touch(PathBuf::from("b.ush"), t0 + Duration::from_millis(60));
        // a touched again: restarts its window
        d.touch(PathBuf::from("a.ush"), t0 + Duration::from_millis(80));

        assert!(d.drain_ready(t0 + Duration::from_millis(120), window).is_empty());
        assert_eq!(
            d.drain_ready(t0 + Duration::from_millis(165), window),
            [PathBuf::from("b.ush")]
        );
        assert_eq!(
            d.drain_ready(t0 + Duration::from_millis(180), window),
            [PathBuf::from("a.ush")]
        );
        assert!(d.drain_ready(t0 + Duration::from_secs(5), window).is_empty());
    }

    #[test]
    fn test_settle_maps_to_virtual_ids() {
        let dir = temp_root("settle");
        let roots = vec![Root {
            dir: dir.clone(),
            prefix: "/Project".into(),
        }];
        let file = dir.join("lib").join("noise.ush");
        std::fs::write(&file, "float Noise(float x) { return x; }").unwrap();

        assert_eq!(
            settle(&roots, &file),
            Some(SnippetEvent::Changed {
                id: SnippetId::new("/Project/lib/noise.ush"),
                text: "float Noise(float x) { return x; }".into()
            })
        );

        std::fs::remove_file(&file).unwrap();
        assert_eq!(
            settle(&roots, &file),
            Some(SnippetEvent::Removed {
                id: SnippetId::new("/Project/lib/noise.ush")
            })
        );

        // not a snippet extension, not under a root
        assert_eq!(settle(&roots, &dir.join("notes.txt")), None);
        assert_eq!(settle(&roots, Path::new("/elsewhere/x.ush")), None);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
