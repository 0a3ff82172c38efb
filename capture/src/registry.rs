//! Pending-confirmation registry.
//!
//! Tracks captures awaiting a save command and remembers how recently
//! resolved ones ended, so duplicate or late saves can be told apart from
//! ids the agent never issued.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tracing::debug;

/// How many resolved ids to remember.
const RESOLVED_HISTORY: usize = 1024;

/// Lifecycle of a single capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    Captured,
    PendingConfirmation,
    Saved,
    Discarded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct PendingCapture {
    pub captured_at: DateTime<Local>,
    registered: Instant,
}

/// Result of looking up an id referenced by a save command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Pending { captured_at: DateTime<Local> },
    Saved { key: String },
    Discarded,
    Unknown,
}

#[derive(Debug, Clone)]
enum Resolved {
    Saved(String),
    Discarded,
}

pub struct PendingRegistry {
    pending: HashMap<String, PendingCapture>,
    resolved: HashMap<String, Resolved>,
    resolved_order: VecDeque<String>,
    ttl: Duration,
    max_pending: usize,
}

impl PendingRegistry {
    pub fn new(ttl: Duration, max_pending: usize) -> Self {
        Self {
            pending: HashMap::new(),
            resolved: HashMap::new(),
            resolved_order: VecDeque::new(),
            ttl,
            max_pending: max_pending.max(1),
        }
    }

    pub fn register(&mut self, id: &str, captured_at: DateTime<Local>, now: Instant) {
        self.pending.insert(
            id.to_string(),
            PendingCapture {
                captured_at,
                registered: now,
            },
        );
    }

    pub fn lookup(&self, id: &str) -> Lookup {
        if let Some(p) = self.pending.get(id) {
            return Lookup::Pending {
                captured_at: p.captured_at,
            };
        }
        match self.resolved.get(id) {
            Some(Resolved::Saved(key)) => Lookup::Saved { key: key.clone() },
            Some(Resolved::Discarded) => Lookup::Discarded,
            None => Lookup::Unknown,
        }
    }

    pub fn status(&self, id: &str) -> Option<CaptureStatus> {
        match self.lookup(id) {
            Lookup::Pending { .. } => Some(CaptureStatus::PendingConfirmation),
            Lookup::Saved { .. } => Some(CaptureStatus::Saved),
            Lookup::Discarded => Some(CaptureStatus::Discarded),
            Lookup::Unknown => None,
        }
    }

    pub fn mark_saved(&mut self, id: &str, key: &str) {
        self.pending.remove(id);
        self.remember(id, Resolved::Saved(key.to_string()));
    }

    pub fn mark_discarded(&mut self, id: &str) {
        self.pending.remove(id);
        self.remember(id, Resolved::Discarded);
    }

    /// Discard every pending capture older than the TTL.  Returns the
    /// evicted ids so the caller can reclaim their storage.
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let ttl = self.ttl;
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.registered) >= ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            debug!("Capture {id} expired after {:?}", ttl);
            self.mark_discarded(id);
        }
        expired
    }

    /// Make room for one more capture by discarding the oldest pending ones.
    pub fn make_room(&mut self) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.pending.len() >= self.max_pending {
            let Some(oldest) = self
                .pending
                .iter()
                .min_by_key(|(_, p)| p.registered)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            debug!("Capture {oldest} superseded (max pending {})", self.max_pending);
            self.mark_discarded(&oldest);
            evicted.push(oldest);
        }
        evicted
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn remember(&mut self, id: &str, outcome: Resolved) {
        if self.resolved.insert(id.to_string(), outcome).is_none() {
            self.resolved_order.push_back(id.to_string());
        }
        while self.resolved_order.len() > RESOLVED_HISTORY {
            if let Some(old) = self.resolved_order.pop_front() {
                self.resolved.remove(&old);
            }
        }
    }
}
