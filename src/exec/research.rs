//! Research state machine for the planner.
//!
//! During a planning cycle the planner may dispatch research
//! micro-tasks to the executor before finalizing. This module enforces
//! the caps, deduplication, timeouts, and state transitions
//! deterministically; it knows nothing about queues or agents.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::canonical::sha256_hex;

/// Default cap on concurrently in-flight research requests.
const DEFAULT_MAX_IN_FLIGHT: usize = 3;

/// Default cap on total dispatches per planning cycle.
const DEFAULT_MAX_ROUNDS: usize = 5;

/// Default per-request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// States of the planner research lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResearchState {
    Planning,
    AwaitingResearch,
    ReadyToFinalize,
    Expired,
}

/// One research micro-task dispatched to the executor.
#[derive(Debug, Clone)]
pub struct ResearchRequest {
    pub request_id: String,
    pub query: String,
    pub return_format: String,
    pub max_tokens: u32,
    pub dispatched_at: Instant,
}

/// Deterministic dedupe key over the request content.
fn dedupe_key(query: &str, return_format: &str, max_tokens: u32) -> String {
    let raw = format!("{query}|{return_format}|{max_tokens}");
    let mut hash = sha256_hex(raw.as_bytes());
    hash.truncate(16);
    hash
}

/// Tracks research requests through one planning cycle.
#[derive(Debug)]
pub struct ResearchStateMachine {
    max_in_flight: usize,
    max_rounds: usize,
    timeout_secs: u64,
    state: ResearchState,
    in_flight: HashMap<String, ResearchRequest>,
    results: HashMap<String, String>,
    dedupe_keys: HashMap<String, String>,
    total_dispatched: usize,
    seen_message_ids: HashSet<String>,
    last_finalize_was_partial: bool,
}

impl Default for ResearchStateMachine {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IN_FLIGHT, DEFAULT_MAX_ROUNDS, DEFAULT_TIMEOUT_SECS)
    }
}

impl ResearchStateMachine {
    /// Create a machine with explicit caps.
    pub fn new(max_in_flight: usize, max_rounds: usize, timeout_secs: u64) -> Self {
        Self {
            max_in_flight,
            max_rounds,
            timeout_secs,
            state: ResearchState::Planning,
            in_flight: HashMap::new(),
            results: HashMap::new(),
            dedupe_keys: HashMap::new(),
            total_dispatched: 0,
            seen_message_ids: HashSet::new(),
            last_finalize_was_partial: false,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ResearchState {
        self.state
    }

    /// Number of requests currently awaiting results.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Total requests dispatched this cycle.
    pub fn total_dispatched(&self) -> usize {
        self.total_dispatched
    }

    /// Request ids still awaiting results.
    pub fn pending_request_ids(&self) -> Vec<String> {
        self.in_flight.keys().cloned().collect()
    }

    /// Whether any requests were lost to timeout (partial data).
    pub fn has_timed_out_requests(&self) -> bool {
        self.total_dispatched > self.results.len().saturating_add(self.in_flight.len())
    }

    /// Whether the last [`finalize`](Self::finalize) was missing results.
    pub fn last_finalize_was_partial(&self) -> bool {
        self.last_finalize_was_partial
    }

    /// Attempt to dispatch a research request.
    ///
    /// Rejected (returns `false`) on: wrong state, round cap, in-flight
    /// cap, or a duplicate `(query, return_format, max_tokens)`.
    pub fn request_research(
        &mut self,
        request_id: &str,
        query: &str,
        return_format: &str,
        max_tokens: u32,
        now: Instant,
    ) -> bool {
        if matches!(self.state, ResearchState::Expired | ResearchState::ReadyToFinalize) {
            return false;
        }
        if self.total_dispatched >= self.max_rounds {
            return false;
        }
        if self.in_flight.len() >= self.max_in_flight {
            return false;
        }

        let key = dedupe_key(query, return_format, max_tokens);
        if self.dedupe_keys.contains_key(&key) {
            return false;
        }

        self.in_flight.insert(
            request_id.to_owned(),
            ResearchRequest {
                request_id: request_id.to_owned(),
                query: query.to_owned(),
                return_format: return_format.to_owned(),
                max_tokens,
                dispatched_at: now,
            },
        );
        self.dedupe_keys.insert(key, request_id.to_owned());
        self.total_dispatched = self.total_dispatched.saturating_add(1);

        if self.state == ResearchState::Planning {
            self.state = ResearchState::AwaitingResearch;
        }
        true
    }

    /// Record a research result.
    ///
    /// Returns `false` when ignored: a replayed `message_id`, or a
    /// result for a request that was never (or is no longer) in flight.
    pub fn receive_result(
        &mut self,
        request_id: &str,
        result: &str,
        message_id: Option<&str>,
    ) -> bool {
        if let Some(message_id) = message_id {
            if !self.seen_message_ids.insert(message_id.to_owned()) {
                return false;
            }
        }

        if self.in_flight.remove(request_id).is_none() {
            // Late result after cancel/expire.
            return false;
        }
        self.results.insert(request_id.to_owned(), result.to_owned());

        if self.in_flight.is_empty() && self.state == ResearchState::AwaitingResearch {
            self.state = ResearchState::ReadyToFinalize;
        }
        true
    }

    /// Expire timed-out requests; returns the expired request ids.
    ///
    /// When everything in flight expired: with partial results the
    /// machine is ready to finalize; with none it is expired.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<String> {
        let timeout = std::time::Duration::from_secs(self.timeout_secs);
        let expired_ids: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, req)| now.duration_since(req.dispatched_at) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired_ids {
            self.in_flight.remove(id);
        }

        if self.in_flight.is_empty() && self.state == ResearchState::AwaitingResearch {
            self.state = if self.results.is_empty() {
                ResearchState::Expired
            } else {
                ResearchState::ReadyToFinalize
            };
        }
        expired_ids
    }

    /// Force transition to expired, cancelling all in-flight requests.
    pub fn force_expire(&mut self) {
        self.in_flight.clear();
        self.state = ResearchState::Expired;
    }

    /// Consume results and reset to planning for the next cycle.
    ///
    /// Remaining in-flight requests are cancelled; their late results
    /// will be ignored by [`receive_result`](Self::receive_result).
    pub fn finalize(&mut self) -> HashMap<String, String> {
        self.last_finalize_was_partial =
            !self.in_flight.is_empty() || self.has_timed_out_requests();
        self.in_flight.clear();
        let results = std::mem::take(&mut self.results);
        self.state = ResearchState::Planning;
        results
    }

    /// Full reset for a new planning task.
    pub fn reset(&mut self) {
        self.in_flight.clear();
        self.results.clear();
        self.dedupe_keys.clear();
        self.seen_message_ids.clear();
        self.total_dispatched = 0;
        self.state = ResearchState::Planning;
        self.last_finalize_was_partial = false;
    }
}
