//! In-flight offer/answer/candidate exchanges between device pairs

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use tether_core::{DeviceKey, SignalError};

/// Ordered device pair identifying one negotiation.
///
/// The initiator is whoever sent the offer. Answers travel the other way,
/// so a responder's answer is looked up with the roles swapped relative to
/// its own envelope (sender = responder, target = initiator).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    pub initiator: DeviceKey,
    pub responder: DeviceKey,
}

impl PairKey {
    pub fn new(initiator: DeviceKey, responder: DeviceKey) -> Self {
        Self {
            initiator,
            responder,
        }
    }

    pub fn involves(&self, key: &DeviceKey) -> bool {
        &self.initiator == key || &self.responder == key
    }

    /// The other participant, if `key` is one of the two
    pub fn peer_of(&self, key: &DeviceKey) -> Option<&DeviceKey> {
        if &self.initiator == key {
            Some(&self.responder)
        } else if &self.responder == key {
            Some(&self.initiator)
        } else {
            None
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.initiator, self.responder)
    }
}

/// Which end of a negotiation produced a candidate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Initiator,
    Responder,
}

/// What the caller should do with a submitted candidate
#[derive(Debug, PartialEq)]
pub enum CandidateRoute {
    /// The answer is already out; relay now
    Immediate(Value),
    /// Held until the answer is relayed
    Buffered,
}

/// Candidates released by an answer, in arrival order
#[derive(Debug, Default, PartialEq)]
pub struct AnswerFlush {
    /// Initiator's candidates, bound for the responder
    pub to_responder: Vec<Value>,
    /// Responder's early candidates, bound for the initiator
    pub to_initiator: Vec<Value>,
}

struct NegotiationRecord {
    offer: Value,
    answer: Option<Value>,
    to_responder: Vec<Value>,
    to_initiator: Vec<Value>,
    created_at: Instant,
}

/// All negotiations currently in flight
#[derive(Default)]
pub struct NegotiationTable {
    records: HashMap<PairKey, NegotiationRecord>,
}

impl NegotiationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) a negotiation. Any previous answer and buffered
    /// candidates for the pair are discarded.
    pub fn open_or_replace(&mut self, pair: PairKey, offer: Value, now: Instant) {
        let record = NegotiationRecord {
            offer,
            answer: None,
            to_responder: Vec::new(),
            to_initiator: Vec::new(),
            created_at: now,
        };

        match self.records.insert(pair.clone(), record) {
            Some(previous) if self.records.get(&pair).map(|r| &r.offer) == Some(&previous.offer) => {
                debug!("Negotiation {} restarted by a repeated offer", pair);
            }
            Some(_) => debug!("Negotiation {} restarted by new offer", pair),
            None => debug!("Negotiation {} opened", pair),
        }
    }

    /// Store the answer and hand back everything buffered while waiting for it
    pub fn record_answer(&mut self, pair: &PairKey, answer: Value) -> Result<AnswerFlush, SignalError> {
        let record = self
            .records
            .get_mut(pair)
            .ok_or_else(|| no_such_negotiation(pair))?;

        record.answer = Some(answer);

        Ok(AnswerFlush {
            to_responder: std::mem::take(&mut record.to_responder),
            to_initiator: std::mem::take(&mut record.to_initiator),
        })
    }

    /// Route a candidate sent by `from`
    pub fn append_candidate(
        &mut self,
        pair: &PairKey,
        from: Side,
        candidate: Value,
    ) -> Result<CandidateRoute, SignalError> {
        let record = self
            .records
            .get_mut(pair)
            .ok_or_else(|| no_such_negotiation(pair))?;

        if record.answer.is_some() {
            return Ok(CandidateRoute::Immediate(candidate));
        }

        match from {
            Side::Initiator => record.to_responder.push(candidate),
            Side::Responder => record.to_initiator.push(candidate),
        }
        Ok(CandidateRoute::Buffered)
    }

    pub fn contains(&self, pair: &PairKey) -> bool {
        self.records.contains_key(pair)
    }

    pub fn is_answered(&self, pair: &PairKey) -> bool {
        self.records
            .get(pair)
            .map_or(false, |r| r.answer.is_some())
    }

    pub fn remove(&mut self, pair: &PairKey) -> bool {
        self.records.remove(pair).is_some()
    }

    /// Drop every negotiation `key` takes part in, returning their pair keys
    pub fn remove_all_involving(&mut self, key: &DeviceKey) -> Vec<PairKey> {
        let pairs: Vec<PairKey> = self
            .records
            .keys()
            .filter(|pair| pair.involves(key))
            .cloned()
            .collect();

        for pair in &pairs {
            self.records.remove(pair);
        }
        pairs
    }

    /// Drop unanswered negotiations opened more than `max_age` before `now`.
    /// Answered records are kept until one side disconnects.
    pub fn evict_older_than(&mut self, max_age: Duration, now: Instant) -> Vec<PairKey> {
        let expired: Vec<PairKey> = self
            .records
            .iter()
            .filter(|(_, r)| {
                r.answer.is_none() && now.saturating_duration_since(r.created_at) > max_age
            })
            .map(|(pair, _)| pair.clone())
            .collect();

        for pair in &expired {
            self.records.remove(pair);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn no_such_negotiation(pair: &PairKey) -> SignalError {
    SignalError::NoSuchNegotiation {
        initiator: pair.initiator.to_string(),
        responder: pair.responder.to_string(),
    }
}
