//! Duplicate suppression for finalized answers.
//!
//! Two independent guards: exact response-id membership (channel-level duplicates) and a
//! pluggable near-equality predicate against the most recently delivered answer.

use crate::config::DedupConfig;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Near-equality predicate over two answer texts.
pub trait SimilarityPolicy: Send + Sync {
    fn is_similar(&self, previous: &str, candidate: &str) -> bool;
}

/// The candidate is identical to, or a prefix/suffix of, the previous text after whitespace
/// and case folding. A longer candidate that merely starts like the previous answer is new.
#[derive(Debug, Clone, Default)]
pub struct PrefixSuffixSimilarity;

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl SimilarityPolicy for PrefixSuffixSimilarity {
    fn is_similar(&self, previous: &str, candidate: &str) -> bool {
        let prev = normalize(previous);
        let cand = normalize(candidate);
        if prev.is_empty() || cand.is_empty() {
            return false;
        }
        prev.starts_with(&cand) || prev.ends_with(&cand)
    }
}

/// Recently finalized answers of one session.
pub struct DedupWindow {
    policy: Box<dyn SimilarityPolicy>,
    window: Duration,
    id_horizon: Duration,
    id_capacity: usize,
    last: Option<(String, Instant)>,
    ids: VecDeque<(String, Instant)>,
    id_set: HashSet<String>,
}

impl DedupWindow {
    pub fn new(config: &DedupConfig) -> Self {
        Self::with_policy(config, Box::new(PrefixSuffixSimilarity))
    }

    pub fn with_policy(config: &DedupConfig, policy: Box<dyn SimilarityPolicy>) -> Self {
        Self {
            policy,
            window: config.near_duplicate_window(),
            id_horizon: config.response_id_horizon(),
            id_capacity: config.response_id_capacity.max(1),
            last: None,
            ids: VecDeque::new(),
            id_set: HashSet::new(),
        }
    }

    /// Record a finalized response id. Returns false when it was already present.
    pub fn mark_processed(&mut self, response_id: &str, now: Instant) -> bool {
        self.expire_ids(now);
        if self.id_set.contains(response_id) {
            return false;
        }
        if self.ids.len() >= self.id_capacity {
            if let Some((oldest, _)) = self.ids.pop_front() {
                self.id_set.remove(&oldest);
            }
        }
        self.ids.push_back((response_id.to_string(), now));
        self.id_set.insert(response_id.to_string());
        true
    }

    pub fn is_processed(&mut self, response_id: &str, now: Instant) -> bool {
        self.expire_ids(now);
        self.id_set.contains(response_id)
    }

    /// Whether `text` repeats the previous answer within the window.
    pub fn is_near_duplicate(&self, text: &str, now: Instant) -> bool {
        match &self.last {
            Some((prev, at)) if now.saturating_duration_since(*at) <= self.window => {
                self.policy.is_similar(prev, text)
            }
            _ => false,
        }
    }

    /// Remember the answer just delivered.
    pub fn record(&mut self, text: &str, now: Instant) {
        self.last = Some((text.to_string(), now));
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.ids.clear();
        self.id_set.clear();
    }

    fn expire_ids(&mut self, now: Instant) {
        while let Some((_, at)) = self.ids.front() {
            if now.saturating_duration_since(*at) > self.id_horizon {
                if let Some((id, _)) = self.ids.pop_front() {
                    self.id_set.remove(&id);
                }
            } else {
                break;
            }
        }
    }
}

impl std::fmt::Debug for DedupWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupWindow")
            .field("window", &self.window)
            .field("last", &self.last.as_ref().map(|(t, _)| t))
            .field("ids", &self.ids.len())
            .finish()
    }
}
