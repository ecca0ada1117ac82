//! File watching.
//!
//! A poll loop rediscovers modules under the watched roots and keeps a
//! SHA-256 hash per watched file. Differences between scans surface as
//! `ModuleAdded` / `ModuleChanged` / `ModuleRemoved` events. A build takes a
//! [`WatchTransaction`] on its module first: scans skip the module while the
//! transaction is open, and files the build declares via `modified_files`
//! have their stored hashes refreshed so build output does not retrigger the
//! build that produced it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use parallax_proto::Digest;

use crate::discovery::discover_modules;
use crate::error::{EngineError, EngineResult};
use crate::moduleconfig::UnvalidatedModuleConfig;

const TOPIC_CAPACITY: usize = 128;

type FileHashes = HashMap<PathBuf, Digest>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    Added,
    Changed,
    Removed,
}

#[derive(Debug, Clone)]
pub enum WatchEvent {
    ModuleAdded(UnvalidatedModuleConfig),
    ModuleRemoved(UnvalidatedModuleConfig),
    ModuleChanged {
        config: UnvalidatedModuleConfig,
        path: PathBuf,
        change: FileChange,
    },
}

#[derive(Default)]
struct WatchState {
    configs: HashMap<PathBuf, UnvalidatedModuleConfig>,
    hashes: HashMap<PathBuf, FileHashes>,
    transactions: HashMap<PathBuf, usize>,
    watching: bool,
}

#[derive(Clone)]
pub struct Watcher {
    state: Arc<Mutex<WatchState>>,
    topic: broadcast::Sender<WatchEvent>,
}

impl Default for Watcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Watcher {
    #[must_use]
    pub fn new() -> Self {
        let (topic, _) = broadcast::channel(TOPIC_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(WatchState::default())),
            topic,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.topic.subscribe()
    }

    /// Start the poll loop. May only be called once per watcher.
    pub fn watch(
        &self,
        cancel: CancellationToken,
        period: Duration,
        roots: Vec<PathBuf>,
    ) -> EngineResult<()> {
        {
            let mut state = self.state.lock();
            if state.watching {
                return Err(EngineError::Internal("watcher is already running".into()));
            }
            state.watching = true;
        }
        let watcher = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = watcher.poll(&roots) {
                            warn!(error = %err, "watch pass failed");
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// One scan pass. Public so callers can force a scan between ticks.
    pub fn poll(&self, roots: &[PathBuf]) -> EngineResult<()> {
        let discovered = discover_modules(roots)?;
        let mut scanned = Vec::with_capacity(discovered.len());
        for config in discovered {
            let hashes = hash_module_files(&config)?;
            scanned.push((config, hashes));
        }

        let mut state = self.state.lock();
        let gone: Vec<PathBuf> = state
            .configs
            .keys()
            .filter(|dir| !scanned.iter().any(|(c, _)| &&c.dir == dir))
            .cloned()
            .collect();
        for dir in gone {
            if let Some(config) = state.configs.remove(&dir) {
                state.hashes.remove(&dir);
                let _ = self.topic.send(WatchEvent::ModuleRemoved(config));
            }
        }
        for (config, new_hashes) in scanned {
            let dir = config.dir.clone();
            let is_new = !state.configs.contains_key(&dir);
            state.configs.insert(dir.clone(), config.clone());
            if is_new {
                state.hashes.insert(dir, new_hashes);
                let _ = self.topic.send(WatchEvent::ModuleAdded(config));
                continue;
            }
            if state.transactions.get(&dir).copied().unwrap_or(0) > 0 {
                // A build holds the module; keep the lease-managed hashes.
                continue;
            }
            let change = state
                .hashes
                .get(&dir)
                .and_then(|old| first_change(old, &new_hashes));
            state.hashes.insert(dir, new_hashes);
            if let Some((path, change)) = change {
                let _ = self.topic.send(WatchEvent::ModuleChanged {
                    config,
                    path,
                    change,
                });
            }
        }
        Ok(())
    }

    /// Take a modification lease on a module directory for the duration of a
    /// build.
    #[must_use]
    pub fn transaction(&self, dir: &Path) -> WatchTransaction {
        *self
            .state
            .lock()
            .transactions
            .entry(dir.to_path_buf())
            .or_insert(0) += 1;
        WatchTransaction {
            state: Arc::clone(&self.state),
            dir: dir.to_path_buf(),
            open: true,
        }
    }
}

/// A modification lease on one module directory. Dropping the transaction
/// releases the lease.
pub struct WatchTransaction {
    state: Arc<Mutex<WatchState>>,
    dir: PathBuf,
    open: bool,
}

impl WatchTransaction {
    /// Declare files written while the lease is held. Their stored hashes are
    /// refreshed so the next scan does not report them as changes; files that
    /// no longer exist are forgotten.
    pub fn modified_files(&self, files: &[PathBuf]) -> EngineResult<()> {
        let mut updates = Vec::with_capacity(files.len());
        for file in files {
            match std::fs::read(file) {
                Ok(content) => updates.push((file.clone(), Some(Digest::of(&content)))),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    updates.push((file.clone(), None));
                }
                Err(err) => return Err(err.into()),
            }
        }
        let mut state = self.state.lock();
        let hashes = state.hashes.entry(self.dir.clone()).or_default();
        for (path, digest) in updates {
            match digest {
                Some(digest) => {
                    hashes.insert(path, digest);
                }
                None => {
                    hashes.remove(&path);
                }
            }
        }
        Ok(())
    }

    pub fn end(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let mut state = self.state.lock();
        if let Some(count) = state.transactions.get_mut(&self.dir) {
            *count -= 1;
            if *count == 0 {
                state.transactions.remove(&self.dir);
            }
        }
    }
}

impl Drop for WatchTransaction {
    fn drop(&mut self) {
        self.release();
    }
}

/// Hash every file under the module directory matching its watch patterns.
fn hash_module_files(config: &UnvalidatedModuleConfig) -> EngineResult<FileHashes> {
    let mut hashes = HashMap::new();
    let patterns = config.watch_patterns();
    collect(&config.dir, &config.dir, &patterns, &mut hashes)?;
    Ok(hashes)
}

fn collect(
    root: &Path,
    dir: &Path,
    patterns: &[String],
    out: &mut FileHashes,
) -> EngineResult<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect(root, &path, patterns, out)?;
            continue;
        }
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let rel = rel.to_string_lossy();
        if !patterns.iter().any(|p| glob::matches(p, &rel)) {
            continue;
        }
        match std::fs::read(&path) {
            Ok(content) => {
                out.insert(path, Digest::of(&content));
            }
            // Deleted between listing and read; the next scan settles it.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// The first difference between two hash maps, in path order.
fn first_change(old: &FileHashes, new: &FileHashes) -> Option<(PathBuf, FileChange)> {
    let mut changes = Vec::new();
    for (path, digest) in new {
        match old.get(path) {
            None => changes.push((path.clone(), FileChange::Added)),
            Some(prev) if prev != digest => changes.push((path.clone(), FileChange::Changed)),
            Some(_) => {}
        }
    }
    for path in old.keys() {
        if !new.contains_key(path) {
            changes.push((path.clone(), FileChange::Removed));
        }
    }
    changes.sort_by(|a, b| a.0.cmp(&b.0));
    changes.into_iter().next()
}

/// Minimal glob matching over `/`-separated paths. `**` spans any number of
/// path segments; `*` and `?` stay within one segment.
mod glob {
    pub fn matches(pattern: &str, path: &str) -> bool {
        let pat: Vec<&str> = pattern.split('/').collect();
        let segs: Vec<&str> = path.split('/').collect();
        segments(&pat, &segs)
    }

    fn segments(pat: &[&str], path: &[&str]) -> bool {
        match pat.first() {
            None => path.is_empty(),
            Some(&"**") => {
                if segments(&pat[1..], path) {
                    return true;
                }
                !path.is_empty() && segments(pat, &path[1..])
            }
            Some(seg) => match path.first() {
                Some(name) => segment(seg.as_bytes(), name.as_bytes()) && segments(&pat[1..], &path[1..]),
                None => false,
            },
        }
    }

    fn segment(pat: &[u8], name: &[u8]) -> bool {
        match pat.first() {
            None => name.is_empty(),
            Some(b'*') => {
                segment(&pat[1..], name) || (!name.is_empty() && segment(pat, &name[1..]))
            }
            Some(b'?') => !name.is_empty() && segment(&pat[1..], &name[1..]),
            Some(c) => name.first() == Some(c) && segment(&pat[1..], &name[1..]),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::matches;

        #[test]
        fn double_star_spans_segments() {
            assert!(matches("**/*.go", "main.go"));
            assert!(matches("**/*.go", "a/b/c.go"));
            assert!(!matches("**/*.go", "main.rs"));
            assert!(matches("src/**", "src/x/y"));
            assert!(!matches("src/**", "lib/x"));
        }

        #[test]
        fn single_star_stays_in_segment() {
            assert!(matches("*.txt", "notes.txt"));
            assert!(!matches("*.txt", "a/notes.txt"));
            assert!(matches("a/?.txt", "a/b.txt"));
            assert!(!matches("a/?.txt", "a/bc.txt"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moduleconfig::MODULE_MANIFEST;

    fn module(dir: &Path, name: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(
            dir.join(MODULE_MANIFEST),
            format!("module = \"{name}\"\nlanguage = \"go\"\n"),
        )
        .unwrap();
    }

    #[test]
    fn reports_module_and_file_lifecycle() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("echo");
        module(&dir, "echo");
        std::fs::write(dir.join("main.go"), "package main").unwrap();

        let watcher = Watcher::new();
        let mut rx = watcher.subscribe();
        let roots = vec![root.path().to_path_buf()];

        watcher.poll(&roots).unwrap();
        assert!(matches!(rx.try_recv(), Ok(WatchEvent::ModuleAdded(c)) if c.module == "echo"));

        std::fs::write(dir.join("main.go"), "package main // v2").unwrap();
        watcher.poll(&roots).unwrap();
        match rx.try_recv().unwrap() {
            WatchEvent::ModuleChanged { path, change, .. } => {
                assert_eq!(path, dir.join("main.go"));
                assert_eq!(change, FileChange::Changed);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        std::fs::remove_dir_all(&dir).unwrap();
        watcher.poll(&roots).unwrap();
        assert!(matches!(rx.try_recv(), Ok(WatchEvent::ModuleRemoved(c)) if c.module == "echo"));
    }

    #[test]
    fn declared_build_output_does_not_retrigger() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("echo");
        module(&dir, "echo");

        let watcher = Watcher::new();
        let mut rx = watcher.subscribe();
        let roots = vec![root.path().to_path_buf()];
        watcher.poll(&roots).unwrap();
        let _ = rx.try_recv().unwrap();

        let txn = watcher.transaction(&dir);
        let output = dir.join("echo.bin");
        std::fs::write(&output, "binary").unwrap();
        txn.modified_files(std::slice::from_ref(&output)).unwrap();
        txn.end();

        watcher.poll(&roots).unwrap();
        assert!(rx.try_recv().is_err());

        // An undeclared write still triggers.
        std::fs::write(dir.join("other.go"), "package other").unwrap();
        watcher.poll(&roots).unwrap();
        match rx.try_recv().unwrap() {
            WatchEvent::ModuleChanged { change, .. } => assert_eq!(change, FileChange::Added),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn scans_pause_while_a_transaction_is_open() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("echo");
        module(&dir, "echo");
        std::fs::write(dir.join("main.go"), "package main").unwrap();

        let watcher = Watcher::new();
        let mut rx = watcher.subscribe();
        let roots = vec![root.path().to_path_buf()];
        watcher.poll(&roots).unwrap();
        let _ = rx.try_recv().unwrap();

        let txn = watcher.transaction(&dir);
        std::fs::write(dir.join("main.go"), "package main // edited").unwrap();
        watcher.poll(&roots).unwrap();
        assert!(rx.try_recv().is_err());
        txn.end();

        // The undeclared edit surfaces once the lease is released.
        watcher.poll(&roots).unwrap();
        assert!(matches!(
            rx.try_recv(),
            Ok(WatchEvent::ModuleChanged { .. })
        ));
    }
}
