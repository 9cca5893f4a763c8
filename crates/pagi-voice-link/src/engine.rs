//! Response completion and retry engine.
//!
//! Turns streamed answer fragments into exactly one delivered answer per logical answer,
//! and repairs answers the remote peer cut off by asking it to continue. The engine owns
//! no timers: it reports its next deadline and the driver calls [`ResponseEngine::on_deadline`].

use crate::completion::{ClassifierSet, Completeness, Language};
use crate::config::{RetryConfig, VoiceLinkConfig};
use crate::dedup::DedupWindow;
use crate::protocol::{OutboundEvent, ResponseStatus};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A finalized answer handed to the answer consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub text: String,
    pub language: Language,
    /// Id of the last response that contributed to the answer.
    pub response_id: Option<String>,
    /// Continuation requests spent on this answer.
    pub retries: u32,
    /// False when the retry budget ran out and this is the best available text.
    pub complete: bool,
    pub finalized_at: DateTime<Utc>,
}

/// Side effects requested by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineAction {
    /// Hand the answer to the answer consumer.
    Deliver(Answer),
    /// Send a client event to the remote peer.
    Send(OutboundEvent),
    /// The logical answer is over (delivered, dropped or cancelled).
    AnswerEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepairReason {
    Heuristic,
    /// Finalized with a status other than `completed` (e.g. `in_progress`).
    UnconfirmedStatus,
    ExplicitFailure,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Fragments of the current attempt are arriving.
    Streaming,
    /// Waiting out the cooldown before asking for a continuation.
    CoolingDown { due: Instant, wrap_up: bool },
    /// Continuation requested, waiting for the remote peer to start it.
    AwaitingContinuation,
}

/// In-progress assembly of one logical answer.
#[derive(Debug, Clone)]
struct AnswerAccumulator {
    response_id: Option<String>,
    /// Text produced by earlier attempts of this answer.
    committed: String,
    /// Longest text seen for the current attempt.
    current: String,
    started_at: Instant,
    retry_count: u32,
    interrupted: bool,
    phase: Phase,
    completion_deadline: Option<Instant>,
}

impl AnswerAccumulator {
    fn new(response_id: Option<&str>, now: Instant) -> Self {
        Self {
            response_id: response_id.map(str::to_string),
            committed: String::new(),
            current: String::new(),
            started_at: now,
            retry_count: 0,
            interrupted: false,
            phase: Phase::Streaming,
            completion_deadline: None,
        }
    }

    fn full_text(&self) -> String {
        merge_continuation(&self.committed, &self.current)
    }

    /// Keep the longest text for this attempt. Fragments that extend the current text are
    /// cumulative snapshots and replace it; anything else is an incremental delta.
    fn absorb_fragment(&mut self, fragment: &str) {
        if self.current.chars().count() >= 3 && fragment.starts_with(self.current.as_str()) {
            self.current = fragment.to_string();
        } else {
            self.current.push_str(fragment);
        }
    }

    fn absorb_segment(&mut self, text: &str) {
        if text.chars().count() > self.current.chars().count() {
            self.current = text.to_string();
        }
    }
}

/// Join the text of a continuation onto what was already produced. When the remote peer
/// restarted instead of resuming, the longer text wins.
pub fn merge_continuation(previous: &str, next: &str) -> String {
    let prev = previous.trim();
    let next = next.trim();
    if prev.is_empty() {
        return next.to_string();
    }
    if next.is_empty() {
        return prev.to_string();
    }
    if next.starts_with(prev) {
        return next.to_string();
    }
    if prev.ends_with(next) {
        return prev.to_string();
    }
    format!("{prev} {next}")
}

fn tail_chars(text: &str, n: usize) -> &str {
    let count = text.chars().count();
    if count <= n {
        return text;
    }
    let skip = count - n;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// The response completion and retry engine of one session.
pub struct ResponseEngine {
    retry: RetryConfig,
    response_timeout: Duration,
    retry_cooldown: Duration,
    classifiers: ClassifierSet,
    dedup: DedupWindow,
    answer: Option<AnswerAccumulator>,
}

impl ResponseEngine {
    pub fn new(config: &VoiceLinkConfig) -> Self {
        Self::with_parts(
            config,
            ClassifierSet::english(config.retry.min_incomplete_chars),
            DedupWindow::new(&config.dedup),
        )
    }

    pub fn with_parts(config: &VoiceLinkConfig, classifiers: ClassifierSet, dedup: DedupWindow) -> Self {
        Self {
            retry: config.retry.clone(),
            response_timeout: config.timing.response_timeout(),
            retry_cooldown: config.timing.retry_cooldown(),
            classifiers,
            dedup,
            answer: None,
        }
    }

    /// An answer is being assembled, repaired or awaited.
    pub fn in_progress(&self) -> bool {
        self.answer.is_some()
    }

    /// Retry counter of the answer in progress.
    pub fn retry_count(&self) -> u32 {
        self.answer.as_ref().map_or(0, |a| a.retry_count)
    }

    /// Best text seen so far for the answer in progress.
    pub fn partial_text(&self) -> Option<String> {
        self.answer.as_ref().map(AnswerAccumulator::full_text)
    }

    /// Earliest pending retry or completion timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        let answer = self.answer.as_ref()?;
        match answer.phase {
            Phase::CoolingDown { due, .. } => Some(due),
            _ => answer.completion_deadline,
        }
    }

    /// Drop all per-session state. Called on teardown.
    pub fn reset(&mut self) {
        if let Some(answer) = self.answer.take() {
            debug!(
                target: "pagi::voice_link::engine",
                response_id = ?answer.response_id,
                "Discarding answer in progress on session reset"
            );
        }
        self.dedup.reset();
    }

    /// Drop the answer in progress without delivering it, keeping the duplicate history.
    /// Returns true when there was something to drop.
    pub fn abandon(&mut self, now: Instant) -> bool {
        let Some(answer) = self.answer.take() else {
            return false;
        };
        if let Some(id) = answer.response_id.as_deref() {
            self.dedup.mark_processed(id, now);
        }
        true
    }

    /// The user barged in; the answer will not be repaired.
    pub fn mark_interrupted(&mut self) {
        if let Some(answer) = self.answer.as_mut() {
            answer.interrupted = true;
        }
    }

    pub fn on_started(&mut self, response_id: Option<&str>, now: Instant) -> Vec<EngineAction> {
        if let Some(id) = response_id {
            if self.dedup.is_processed(id, now) {
                debug!(target: "pagi::voice_link::engine", response_id = id, "Ignoring start of finalized response");
                return Vec::new();
            }
        }

        let timeout = now + self.response_timeout;
        match self.answer.as_mut() {
            None => {
                let mut answer = AnswerAccumulator::new(response_id, now);
                answer.completion_deadline = Some(timeout);
                self.answer = Some(answer);
            }
            Some(answer) => match answer.phase {
                Phase::CoolingDown { .. } | Phase::AwaitingContinuation => {
                    debug!(
                        target: "pagi::voice_link::engine",
                        response_id = ?response_id,
                        retry = answer.retry_count,
                        "Continuation attempt started"
                    );
                    answer.response_id = response_id.map(str::to_string);
                    answer.current.clear();
                    answer.phase = Phase::Streaming;
                    answer.completion_deadline = Some(timeout);
                }
                Phase::Streaming => {
                    if answer.response_id.as_deref() == response_id || response_id.is_none() {
                        answer.completion_deadline = Some(timeout);
                    } else {
                        warn!(
                            target: "pagi::voice_link::engine",
                            previous = ?answer.response_id,
                            next = ?response_id,
                            "New response started before the previous one finalized; dropping partial answer"
                        );
                        let mut fresh = AnswerAccumulator::new(response_id, now);
                        fresh.completion_deadline = Some(timeout);
                        *answer = fresh;
                    }
                }
            },
        }
        Vec::new()
    }

    /// A text and/or audio fragment. Returns true when the fragment belongs to a live answer.
    pub fn on_fragment(&mut self, response_id: Option<&str>, text: Option<&str>, now: Instant) -> bool {
        if let Some(id) = response_id {
            if self.dedup.is_processed(id, now) {
                debug!(target: "pagi::voice_link::engine", response_id = id, "Dropping late fragment of finalized response");
                return false;
            }
        }

        let answer = self
            .answer
            .get_or_insert_with(|| AnswerAccumulator::new(response_id, now));
        if answer.phase != Phase::Streaming {
            // the continuation began without a start event
            answer.current.clear();
            answer.phase = Phase::Streaming;
            answer.response_id = None;
        }
        if answer.response_id.is_none() {
            answer.response_id = response_id.map(str::to_string);
        }
        if let Some(text) = text {
            answer.absorb_fragment(text);
        }
        answer.completion_deadline = Some(now + self.response_timeout);
        true
    }

    pub fn on_segment_done(&mut self, response_id: Option<&str>, text: Option<&str>, now: Instant) {
        if let Some(id) = response_id {
            if self.dedup.is_processed(id, now) {
                return;
            }
        }
        if let (Some(answer), Some(text)) = (self.answer.as_mut(), text) {
            answer.absorb_segment(text);
            answer.completion_deadline = Some(now + self.response_timeout);
        }
    }

    /// Local barge-in: abandon the answer in progress the way a remote cancel would, and
    /// make sure its eventual finalize cannot deliver it.
    pub fn interrupt(&mut self, now: Instant) -> Vec<EngineAction> {
        let id = self.answer.as_ref().and_then(|a| a.response_id.clone());
        self.on_cancelled(id.as_deref(), now)
    }

    pub fn on_cancelled(&mut self, response_id: Option<&str>, now: Instant) -> Vec<EngineAction> {
        if let Some(id) = response_id {
            self.dedup.mark_processed(id, now);
        }
        if let Some(answer) = self.answer.take() {
            info!(
                target: "pagi::voice_link::engine",
                response_id = ?response_id,
                dropped_chars = answer.full_text().chars().count(),
                "Answer cancelled by remote peer"
            );
        }
        vec![EngineAction::AnswerEnded]
    }

    pub fn on_finalized(
        &mut self,
        response_id: Option<&str>,
        status: ResponseStatus,
        text: Option<&str>,
        now: Instant,
    ) -> Vec<EngineAction> {
        if let Some(id) = response_id {
            if !self.dedup.mark_processed(id, now) {
                debug!(target: "pagi::voice_link::engine", response_id = id, "Dropping duplicate finalize");
                return Vec::new();
            }
        }

        if status == ResponseStatus::Cancelled {
            return self.on_cancelled(None, now);
        }

        let answer = self
            .answer
            .get_or_insert_with(|| AnswerAccumulator::new(response_id, now));
        if answer.phase != Phase::Streaming {
            answer.current.clear();
            answer.phase = Phase::Streaming;
        }
        if response_id.is_some() {
            answer.response_id = response_id.map(str::to_string);
        }
        if let Some(text) = text {
            answer.absorb_segment(text);
        }
        answer.completion_deadline = None;

        let full = answer.full_text();
        if self.dedup.is_near_duplicate(&full, now) {
            info!(
                target: "pagi::voice_link::engine",
                response_id = ?response_id,
                "Suppressing near-duplicate answer"
            );
            self.answer = None;
            return vec![EngineAction::AnswerEnded];
        }

        let language = Language::detect(&full);
        let interrupted = answer.interrupted;
        let reason = if status.is_failure() {
            Some(RepairReason::ExplicitFailure)
        } else if interrupted {
            None
        } else if !status.is_confirmed() {
            Some(RepairReason::UnconfirmedStatus)
        } else if self.classifiers.classify(&full, language) == Completeness::PossiblyIncomplete {
            Some(RepairReason::Heuristic)
        } else {
            None
        };

        if full.trim().is_empty() && reason.is_none() {
            debug!(target: "pagi::voice_link::engine", response_id = ?response_id, "Finalized answer carried no text");
            self.answer = None;
            return vec![EngineAction::AnswerEnded];
        }

        match reason {
            Some(reason) => self.repair_or_deliver(reason, now),
            None => self.deliver(true, now),
        }
    }

    /// Fire whichever of the retry cooldown or completion timeout is due.
    pub fn on_deadline(&mut self, now: Instant) -> Vec<EngineAction> {
        let Some(answer) = self.answer.as_mut() else {
            return Vec::new();
        };

        if let Phase::CoolingDown { due, wrap_up } = answer.phase {
            if due > now {
                return Vec::new();
            }
            answer.retry_count += 1;
            answer.phase = Phase::AwaitingContinuation;
            answer.completion_deadline = Some(now + self.response_timeout);

            let produced = answer.committed.trim();
            let prompt = if produced.is_empty() {
                "Your previous answer did not come through. Please answer again, briefly.".to_string()
            } else {
                let tail = tail_chars(produced, self.retry.continuation_tail_chars);
                if wrap_up {
                    format!(
                        "Please wrap up your previous answer in one sentence. Your last words were: \"...{tail}\""
                    )
                } else {
                    format!(
                        "You were cut off. Continue exactly where you left off without repeating yourself. Your last words were: \"...{tail}\""
                    )
                }
            };
            info!(
                target: "pagi::voice_link::engine",
                retry = answer.retry_count,
                wrap_up,
                "Requesting answer continuation"
            );
            return vec![
                EngineAction::Send(OutboundEvent::user_text(prompt)),
                EngineAction::Send(OutboundEvent::create_response()),
            ];
        }

        match answer.completion_deadline {
            Some(deadline) if deadline <= now => {
                warn!(
                    target: "pagi::voice_link::engine",
                    response_id = ?answer.response_id,
                    elapsed_ms = now.saturating_duration_since(answer.started_at).as_millis() as u64,
                    "Completion timeout; treating answer as possibly incomplete"
                );
                answer.completion_deadline = None;
                if let Some(id) = answer.response_id.clone() {
                    // a late finalize for this attempt must not deliver twice
                    self.dedup.mark_processed(&id, now);
                }
                let empty = self
                    .answer
                    .as_ref()
                    .is_some_and(|a| a.full_text().trim().is_empty());
                if empty && self.request_ceiling(RepairReason::Timeout) == 0 {
                    self.answer = None;
                    return vec![EngineAction::AnswerEnded];
                }
                self.repair_or_deliver(RepairReason::Timeout, now)
            }
            _ => Vec::new(),
        }
    }

    fn allowance(&self, reason: RepairReason) -> u32 {
        match reason {
            RepairReason::ExplicitFailure => self.retry.max_retries,
            RepairReason::Heuristic | RepairReason::UnconfirmedStatus | RepairReason::Timeout => {
                self.retry.heuristic_retries
            }
        }
    }

    /// Requests allowed for `reason`: the plain continuations of its allowance plus one
    /// closing wrap-up request, never more than `max_retries` in total.
    fn request_ceiling(&self, reason: RepairReason) -> u32 {
        self.allowance(reason)
            .saturating_add(1)
            .min(self.retry.max_retries)
    }

    fn repair_or_deliver(&mut self, reason: RepairReason, now: Instant) -> Vec<EngineAction> {
        let ceiling = self.request_ceiling(reason);
        let cooldown = self.retry_cooldown;
        let Some(answer) = self.answer.as_mut() else {
            return vec![EngineAction::AnswerEnded];
        };

        if answer.retry_count < ceiling {
            let wrap_up = answer.retry_count + 1 == ceiling;
            answer.committed = answer.full_text();
            answer.current.clear();
            answer.phase = Phase::CoolingDown {
                due: now + cooldown,
                wrap_up,
            };
            answer.completion_deadline = None;
            info!(
                target: "pagi::voice_link::engine",
                ?reason,
                retry = answer.retry_count,
                ceiling,
                wrap_up,
                "Answer looks incomplete; scheduling continuation"
            );
            return Vec::new();
        }

        warn!(
            target: "pagi::voice_link::engine",
            ?reason,
            retries = answer.retry_count,
            "Retry budget exhausted; delivering best available answer"
        );
        self.deliver(false, now)
    }

    fn deliver(&mut self, complete: bool, now: Instant) -> Vec<EngineAction> {
        let Some(answer) = self.answer.take() else {
            return vec![EngineAction::AnswerEnded];
        };
        let text = answer.full_text();
        if text.trim().is_empty() {
            return vec![EngineAction::AnswerEnded];
        }

        self.dedup.record(&text, now);
        let delivered = Answer {
            language: Language::detect(&text),
            text,
            response_id: answer.response_id,
            retries: answer.retry_count,
            complete,
            finalized_at: Utc::now(),
        };
        info!(
            target: "pagi::voice_link::engine",
            response_id = ?delivered.response_id,
            language = delivered.language.as_tag(),
            retries = delivered.retries,
            chars = delivered.text.chars().count(),
            "Answer finalized"
        );
        vec![EngineAction::Deliver(delivered), EngineAction::AnswerEnded]
    }
}

impl std::fmt::Debug for ResponseEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseEngine")
            .field("answer", &self.answer)
            .field("dedup", &self.dedup)
            .finish()
    }
}
