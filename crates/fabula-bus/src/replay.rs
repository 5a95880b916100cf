//! Durable local replay queue.
//!
//! Bounded FIFO of events that could not reach the transport, mirrored to a
//! JSONL file so undelivered events survive restarts. Overflow drops the
//! oldest entry and bumps a counter (newest-wins). The queue only fills
//! during outages, so the simple rewrite-on-mutation persistence keeps
//! recovery logic trivial at acceptable cost.

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{info, warn};

use fabula_core::events::Event;

use crate::error::Result;

pub struct LocalReplayQueue {
    path: PathBuf,
    capacity: usize,
    inner: Mutex<VecDeque<Event>>,
    dropped: AtomicU64,
}

impl LocalReplayQueue {
    /// Open the queue file, loading any events left over from a previous run.
    /// Malformed lines are skipped; only the newest `capacity` entries are kept.
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut queue = VecDeque::new();
        if path.exists() {
            let content = fs::read_to_string(&path)?;
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Event>(line) {
                    Ok(event) => queue.push_back(event),
                    Err(e) => warn!(error = %e, "skipping malformed replay entry"),
                }
            }
            while queue.len() > capacity {
                queue.pop_front();
            }
            if !queue.is_empty() {
                info!(pending = queue.len(), "replay queue restored from disk");
            }
        }

        Ok(Self {
            path,
            capacity,
            inner: Mutex::new(queue),
            dropped: AtomicU64::new(0),
        })
    }

    /// Append an event, evicting the oldest entry when full.
    pub fn append(&self, event: &Event) -> Result<()> {
        let mut queue = self.inner.lock().unwrap();
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(capacity = self.capacity, "replay queue full, oldest event dropped");
        }
        queue.push_back(event.clone());
        self.persist(&queue)
    }

    /// Oldest undelivered event, if any. The entry stays queued until
    /// [`ack_front`] confirms republication.
    pub fn front(&self) -> Option<Event> {
        self.inner.lock().unwrap().front().cloned()
    }

    /// Remove the front entry after it was successfully republished.
    pub fn ack_front(&self) -> Result<()> {
        let mut queue = self.inner.lock().unwrap();
        queue.pop_front();
        self.persist(&queue)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Events lost to overflow since the queue was opened.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Atomic rewrite: serialize to a sibling tmp file, then rename over the
    /// live file so a crash mid-write never corrupts the queue.
    fn persist(&self, queue: &VecDeque<Event>) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            for event in queue {
                let line = serde_json::to_string(event)?;
                writeln!(file, "{}", line)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
