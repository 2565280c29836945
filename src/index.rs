//! Shared-folder indexer.
//!
//! Walks the shared root into a table of [`SharedFile`] entries keyed by a
//! stable id (UUID v5 of the root-relative path, nil namespace), so ids
//! survive restarts as long as the layout does. Hidden entries (leading
//! dot) and anything unreadable are skipped; a broken subtree degrades to
//! "whatever could be read".
//!
//! Rescans build a fresh table off-task and swap it in atomically, so
//! concurrent readers always see a consistent snapshot. A filesystem
//! watcher coalesces change bursts into a single debounced rescan.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use log::{debug, warn};
use notify::{EventKind, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::ShareResult;
use crate::protocol::SharedFile;

/// Change bursts within this window collapse into one rescan.
const RESCAN_DEBOUNCE_MS: u64 = 200;

/// A table entry: the wire-visible metadata plus where the bytes live.
#[derive(Debug, Clone)]
pub struct IndexedFile {
    pub file: SharedFile,
    pub abs_path: PathBuf,
}

#[derive(Clone)]
pub struct SharedIndex {
    inner: Arc<IndexInner>,
}

struct IndexInner {
    root: PathBuf,
    table: RwLock<Arc<HashMap<String, IndexedFile>>>,
    files_tx: watch::Sender<Vec<SharedFile>>,
    rescan_tx: mpsc::Sender<()>,
    rescan_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl SharedIndex {
    pub fn new(root: &Path) -> ShareResult<SharedIndex> {
        let root = root.canonicalize()?;
        let (files_tx, _) = watch::channel(Vec::new());
        let (rescan_tx, rescan_rx) = mpsc::channel(1);

        Ok(SharedIndex {
            inner: Arc::new(IndexInner {
                root,
                table: RwLock::new(Arc::new(HashMap::new())),
                files_tx,
                rescan_tx,
                rescan_rx: Mutex::new(Some(rescan_rx)),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Walk the root off-task and swap the fresh table in. Returns the
    /// number of indexed files.
    pub async fn rescan(&self) -> usize {
        let root = self.inner.root.clone();
        let table = match tokio::task::spawn_blocking(move || scan_root(&root)).await {
            Ok(table) => table,
            Err(e) => {
                warn!("index rescan worker failed: {}", e);
                return self.inner.table.read().len();
            }
        };

        let count = table.len();
        let mut files: Vec<SharedFile> = table.values().map(|e| e.file.clone()).collect();
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        *self.inner.table.write() = Arc::new(table);
        self.inner.files_tx.send_replace(files);
        count
    }

    /// Queue a debounced rescan; cheap to call from any context.
    pub fn trigger_rescan(&self) {
        let _ = self.inner.rescan_tx.try_send(());
    }

    /// Current snapshot, ordered by relative path.
    pub fn files(&self) -> Vec<SharedFile> {
        self.inner.files_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<SharedFile>> {
        self.inner.files_tx.subscribe()
    }

    /// Look a file id back up to its on-disk location. The resolved path is
    /// re-checked against the root so nothing outside the shared tree is
    /// ever served.
    pub fn resolve(&self, file_id: &str) -> Option<IndexedFile> {
        let entry = self.inner.table.read().get(file_id).cloned()?;
        let canonical = entry.abs_path.canonicalize().ok()?;
        if !canonical.starts_with(&self.inner.root) {
            warn!(
                "refusing to serve {} (escapes shared root)",
                entry.abs_path.display()
            );
            return None;
        }
        Some(entry)
    }

    /// Spawn the watcher and the debounced rescan worker.
    pub(crate) fn spawn_tasks(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        // Rescan worker: drain triggers, debounce, walk.
        if let Some(mut rx) = self.inner.rescan_rx.lock().take() {
            let index = self.clone();
            let worker_cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = worker_cancel.cancelled() => break,
                        received = rx.recv() => {
                            if received.is_none() {
                                break;
                            }
                            tokio::time::sleep(Duration::from_millis(RESCAN_DEBOUNCE_MS)).await;
                            while rx.try_recv().is_ok() {}
                            let count = index.rescan().await;
                            debug!("shared index rescanned: {} files", count);
                        }
                    }
                }
            }));
        }

        // Filesystem watcher: raise triggers on relevant change events.
        let root = self.inner.root.clone();
        let rescan_tx = self.inner.rescan_tx.clone();
        handles.push(tokio::spawn(async move {
            let mut watcher = match notify::recommended_watcher(
                move |res: Result<notify::Event, notify::Error>| match res {
                    Ok(event)
                        if matches!(
                            event.kind,
                            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                        ) =>
                    {
                        let _ = rescan_tx.try_send(());
                    }
                    Ok(_) => {}
                    Err(err) => warn!("shared-root watch error: {}", err),
                },
            ) {
                Ok(w) => w,
                Err(e) => {
                    warn!("shared-root watcher unavailable: {}", e);
                    return;
                }
            };

            if let Err(e) = watcher.watch(&root, RecursiveMode::Recursive) {
                warn!("failed to watch {}: {}", root.display(), e);
                return;
            }

            // Keep the watcher alive until shutdown.
            cancel.cancelled().await;
        }));

        handles
    }
}

/// Deterministic file id from the root-relative POSIX path.
pub fn file_id_for(relative_path: &str) -> String {
    Uuid::new_v5(&Uuid::nil(), relative_path.as_bytes()).to_string()
}

fn scan_root(root: &Path) -> HashMap<String, IndexedFile> {
    let mut table = HashMap::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden_name(e.file_name()));

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                debug!("skipping unreadable entry: {}", err);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(err) => {
                debug!("skipping {}: {}", entry.path().display(), err);
                continue;
            }
        };
        let relative_path = match relative_path_of(root, entry.path()) {
            Some(rel) => rel,
            None => continue,
        };

        let last_modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let file_id = file_id_for(&relative_path);
        table.insert(
            file_id.clone(),
            IndexedFile {
                file: SharedFile {
                    file_id,
                    name: entry.file_name().to_string_lossy().into_owned(),
                    size: metadata.len(),
                    mime_type: mime_for_path(entry.path()).to_string(),
                    relative_path,
                    last_modified,
                },
                abs_path: entry.path().to_path_buf(),
            },
        );
    }

    table
}

fn is_hidden_name(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// Forward-slash join of the path below `root`; `None` for anything that is
/// not a plain descendant.
fn relative_path_of(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            std::path::Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "js" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populate(root: &Path) {
        std::fs::write(root.join("a.txt"), b"hello").unwrap();
        std::fs::create_dir(root.join("sub")).unwrap();
        std::fs::write(root.join("sub/b.bin"), [0u8; 16]).unwrap();
        std::fs::create_dir(root.join(".hidden")).unwrap();
        std::fs::write(root.join(".hidden/secret.txt"), b"shh").unwrap();
        std::fs::write(root.join(".dotfile"), b"x").unwrap();
    }

    #[tokio::test]
    async fn scan_skips_hidden_and_builds_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());

        let index = SharedIndex::new(dir.path()).unwrap();
        assert_eq!(index.rescan().await, 2);

        let files = index.files();
        let paths: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "sub/b.bin"]);
        assert!(paths.iter().all(|p| !p.starts_with('/')));

        let a = &files[0];
        assert_eq!(a.name, "a.txt");
        assert_eq!(a.size, 5);
        assert_eq!(a.mime_type, "text/plain");
        assert_eq!(files[1].mime_type, "application/octet-stream");
    }

    #[tokio::test]
    async fn file_ids_are_stable_and_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());

        let index = SharedIndex::new(dir.path()).unwrap();
        index.rescan().await;
        let first: Vec<String> = index.files().iter().map(|f| f.file_id.clone()).collect();

        index.rescan().await;
        let second: Vec<String> = index.files().iter().map(|f| f.file_id.clone()).collect();
        assert_eq!(first, second);

        // The id is a pure function of the relative path.
        assert_eq!(
            first[0],
            Uuid::new_v5(&Uuid::nil(), b"a.txt").to_string()
        );
    }

    #[tokio::test]
    async fn resolve_maps_id_to_a_path_under_the_root() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());

        let index = SharedIndex::new(dir.path()).unwrap();
        index.rescan().await;

        let entry = index.resolve(&file_id_for("sub/b.bin")).unwrap();
        assert!(entry.abs_path.starts_with(index.root()));
        assert_eq!(entry.file.relative_path, "sub/b.bin");

        assert!(index.resolve(&file_id_for("no/such/file")).is_none());
    }

    #[tokio::test]
    async fn resolve_fails_once_the_file_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());

        let index = SharedIndex::new(dir.path()).unwrap();
        index.rescan().await;

        let id = file_id_for("a.txt");
        assert!(index.resolve(&id).is_some());

        std::fs::remove_file(dir.path().join("a.txt")).unwrap();
        assert!(index.resolve(&id).is_none());
    }

    #[tokio::test]
    async fn rescan_picks_up_new_files() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());

        let index = SharedIndex::new(dir.path()).unwrap();
        assert_eq!(index.rescan().await, 2);

        std::fs::write(dir.path().join("c.md"), b"# new").unwrap();
        assert_eq!(index.rescan().await, 3);
        assert!(index
            .files()
            .iter()
            .any(|f| f.relative_path == "c.md" && f.mime_type == "text/markdown"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_trees_are_not_followed() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("leak.txt"), b"outside").unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"inside").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let index = SharedIndex::new(dir.path()).unwrap();
        index.rescan().await;

        assert!(index
            .files()
            .iter()
            .all(|f| !f.relative_path.contains("leak")));
    }
}
