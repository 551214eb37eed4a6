//! Capture spool retention.
//!
//! The capture hardware appends `.dat` files to a spool directory and never
//! deletes them. This module watches that directory and evicts the oldest
//! files once a per-pattern quota is exceeded, so an unattended instrument
//! cannot fill its disk between runs.
//!
//! Files are grouped by glob pattern; the first matching pattern claims a
//! file. Arrival order is the order files finish being written (the watcher
//! reacts to close-after-write, not creation, so a file still being streamed
//! is never a deletion candidate). Files matching no pattern are ignored.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use notify::{
    event::{AccessKind, AccessMode},
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};

/// One retention group: a glob pattern and the files it has claimed, oldest
/// first.
struct Rule {
    pattern: String,
    regex: Regex,
    seen: VecDeque<PathBuf>,
}

/// Pure retention bookkeeping, separated from the file watcher so the
/// eviction rules are testable without inotify.
pub struct Tracker {
    rules: Vec<Rule>,
    keep: usize,
}

impl Tracker {
    /// Build a tracker keeping at most `keep` files per pattern. A `keep` of
    /// zero disables eviction; files are still tracked.
    pub fn new(patterns: &[String], keep: usize) -> EngineResult<Self> {
        let rules = patterns
            .iter()
            .map(|pattern| {
                Ok(Rule {
                    pattern: pattern.clone(),
                    regex: glob_to_regex(pattern)?,
                    seen: VecDeque::new(),
                })
            })
            .collect::<EngineResult<Vec<Rule>>>()?;
        Ok(Self { rules, keep })
    }

    /// Record one finished file and evict past quota. Returns the paths
    /// removed from disk.
    pub fn observe(&mut self, path: &Path) -> Vec<PathBuf> {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return Vec::new();
        };
        let Some(rule) = self.rules.iter_mut().find(|r| r.regex.is_match(name)) else {
            debug!("ignoring {name}, no retention pattern matches");
            return Vec::new();
        };

        // A file closed again (reopened and appended) moves to the back.
        rule.seen.retain(|p| p != path);
        rule.seen.push_back(path.to_path_buf());
        debug!(
            "tracking {name} under {} ({} of {})",
            rule.pattern,
            rule.seen.len(),
            self.keep
        );

        let mut evicted = Vec::new();
        if self.keep == 0 {
            return evicted;
        }
        while rule.seen.len() > self.keep {
            let victim = match rule.seen.pop_front() {
                Some(v) => v,
                None => break,
            };
            match fs::remove_file(&victim) {
                Ok(()) => {
                    info!("evicted {} under {}", victim.display(), rule.pattern);
                    evicted.push(victim);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("{} already gone", victim.display());
                }
                Err(e) => warn!("could not evict {}: {e}", victim.display()),
            }
        }
        evicted
    }

    /// Files currently tracked under one pattern, cross-checked against disk.
    /// Entries removed behind our back are dropped.
    pub fn tracked(&mut self, pattern: &str) -> Vec<PathBuf> {
        match self.rules.iter_mut().find(|r| r.pattern == pattern) {
            Some(rule) => {
                rule.seen.retain(|p| p.exists());
                rule.seen.iter().cloned().collect()
            }
            None => Vec::new(),
        }
    }
}

/// Watches a spool directory and applies a [`Tracker`] to every file that
/// finishes being written.
pub struct RetentionWatcher {
    tracker: Tracker,
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<notify::Result<Event>>,
}

impl RetentionWatcher {
    pub fn new(patterns: &[String], keep: usize) -> EngineResult<Self> {
        let tracker = Tracker::new(patterns, keep)?;
        let (tx, rx) = mpsc::channel(100);

        // Sync callback context, so blocking_send.
        let watcher = notify::recommended_watcher(move |res| {
            let _ = tx.blocking_send(res);
        })?;

        Ok(Self {
            tracker,
            _watcher: watcher,
            rx,
        })
    }

    /// Begin watching one spool directory. May be called for several.
    pub fn watch(&mut self, path: &Path) -> EngineResult<()> {
        self._watcher.watch(path, RecursiveMode::NonRecursive)?;
        info!("retention watching {}", path.display());
        Ok(())
    }

    /// Process events until the watcher is dropped.
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            match event {
                Ok(event) => {
                    if !closed_after_write(&event) {
                        continue;
                    }
                    for path in &event.paths {
                        self.tracker.observe(path);
                    }
                }
                Err(e) => warn!("spool watcher error: {e}"),
            }
        }
        info!("retention watcher stopped");
    }
}

/// Only close-after-write marks a file finished; creation and data events
/// fire while the recorder is still streaming.
fn closed_after_write(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

/// Translate a shell glob into an anchored regex. Only `*` and `?` are
/// special; everything else matches literally.
fn glob_to_regex(pattern: &str) -> EngineResult<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str("[^/]*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(&c.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr)
        .map_err(|e| EngineError::Configuration(format!("bad retention pattern {pattern:?}: {e}")))
}
