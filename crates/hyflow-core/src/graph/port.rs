//! Port state: an append-only token log closed by a terminator.

use std::collections::HashSet;

use hyflow_types::token::{TerminationReason, Token};
use uuid::Uuid;

/// Runtime state of one port.
///
/// Tokens are kept in sequence order until every consumer step has reached a
/// terminal status. Ports listed as workflow outputs keep their tokens for the
/// whole run.
#[derive(Debug)]
pub struct PortState {
    id: String,
    tokens: Vec<Token>,
    ids: HashSet<Uuid>,
    next_seq: u64,
    closed: Option<TerminationReason>,
    pending_consumers: usize,
    retain: bool,
    released: bool,
}

impl PortState {
    pub fn new(id: impl Into<String>, consumer_steps: usize, retain: bool) -> Self {
        Self {
            id: id.into(),
            tokens: Vec::new(),
            ids: HashSet::new(),
            next_seq: 0,
            closed: None,
            pending_consumers: consumer_steps,
            retain,
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn contains(&self, token_id: &Uuid) -> bool {
        self.ids.contains(token_id)
    }

    pub fn closed(&self) -> Option<TerminationReason> {
        self.closed
    }

    /// Sequence number the next appended token will receive.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Append a token that already carries its sequence number.
    ///
    /// Returns `false` (and ignores the token) when it is already present or
    /// the port is closed. Sequence numbers must increase.
    pub fn append(&mut self, token: Token) -> bool {
        if self.closed.is_some() || self.ids.contains(&token.id) || token.seq < self.next_seq {
            return false;
        }
        self.next_seq = token.seq + 1;
        self.ids.insert(token.id);
        self.tokens.push(token);
        true
    }

    /// Close the port. Only the first terminator counts.
    pub fn close(&mut self, reason: TerminationReason) -> bool {
        if self.closed.is_some() {
            return false;
        }
        self.closed = Some(reason);
        true
    }

    /// Record that one consumer step reached a terminal status.
    ///
    /// Returns the tokens that may now be evicted from caches, which is the
    /// whole log once the last consumer finishes (unless retained).
    pub fn consumer_finished(&mut self) -> Vec<Token> {
        self.pending_consumers = self.pending_consumers.saturating_sub(1);
        if self.pending_consumers > 0 || self.retain || self.released {
            return Vec::new();
        }
        self.released = true;
        std::mem::take(&mut self.tokens)
    }
}
