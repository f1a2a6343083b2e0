//! Signaling router
//!
//! Interprets inbound client messages against the shared registry and
//! negotiation table and relays the results to peer channels.
//!
//! All state lives in one [`RelayState`] behind a single mutex. Relays are
//! queued while the lock is held; queueing never blocks (see
//! [`Channel::send`]), and it keeps per-channel delivery order identical to
//! the order of state transitions.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use tether_core::{DeviceKey, LivenessMode, SignalError};

use crate::channel::{Channel, ChannelId};
use crate::messages::{ClientMessage, ServerMessage};
use crate::negotiation::{AnswerFlush, CandidateRoute, NegotiationTable, PairKey, Side};
use crate::registry::DeviceRegistry;

/// One accepted socket: its outbound channel plus the device key it has
/// registered, if any
pub struct Connection {
    channel: Channel,
    device: Option<DeviceKey>,
}

impl Connection {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            device: None,
        }
    }

    pub fn device(&self) -> Option<&DeviceKey> {
        self.device.as_ref()
    }
}

/// Counts from one reaper sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapStats {
    pub negotiations: usize,
    pub devices: usize,
}

#[derive(Default)]
struct RelayState {
    registry: DeviceRegistry,
    negotiations: NegotiationTable,
}

/// Shared handle to the relay state machine
#[derive(Clone, Default)]
pub struct SignalRouter {
    state: Arc<Mutex<RelayState>>,
}

impl SignalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and handle one text frame. Malformed input gets a single
    /// `error` reply.
    pub fn handle_text(&self, conn: &mut Connection, text: &str) {
        match ClientMessage::from_json(text) {
            Ok(msg) => self.handle_message(conn, msg),
            Err(e) => {
                warn!("Malformed message on {}: {}", conn.channel.id(), e);
                let _ = conn.channel.send(ServerMessage::error(&e));
            }
        }
    }

    /// Handle one parsed message
    pub fn handle_message(&self, conn: &mut Connection, msg: ClientMessage) {
        let kind = msg.kind();
        let now = Instant::now();
        let mut state = self.state.lock();

        let result = match msg {
            ClientMessage::Register { device_key } => {
                state.register(conn, device_key, now);
                Ok(())
            }
            ClientMessage::ConnectionRequest {
                source_key,
                target_key,
                offer,
            } => state.connection_request(conn, source_key, target_key, offer, now),
            ClientMessage::ConnectionResponse {
                target_key,
                accepted,
                answer,
                reason,
            } => state.connection_response(conn, target_key, accepted, answer, reason),
            ClientMessage::Offer { target_key, offer } => state.offer(conn, target_key, offer, now),
            ClientMessage::Answer { target_key, answer } => state.answer(conn, target_key, answer),
            ClientMessage::IceCandidate {
                target_key,
                candidate,
            } => state.ice_candidate(conn, target_key, candidate),
            ClientMessage::Heartbeat => {
                state.heartbeat(conn, now);
                Ok(())
            }
            ClientMessage::Disconnect { target_key } => state.disconnect_notice(conn, target_key),
        };

        if let Err(e) = result {
            warn!("Rejected {} from {}: {}", kind, conn.channel.id(), e);
            let _ = conn.channel.send(ServerMessage::error(&e));
        }
    }

    /// Transport pong received on this connection
    pub fn confirm_liveness(&self, conn: &Connection) {
        let mut state = self.state.lock();
        state.heartbeat(conn, Instant::now());
    }

    /// The socket behind `conn` closed or failed
    pub fn channel_closed(&self, conn: &mut Connection) {
        if let Some(key) = conn.device.take() {
            let mut state = self.state.lock();
            state.disconnect(&key, conn.channel.id());
        }
    }

    /// One liveness probe tick. Returns how many devices were dropped.
    pub fn probe_liveness(&self) -> usize {
        let mut state = self.state.lock();
        let dead = state.registry.probe_round();

        for (key, channel_id) in &dead {
            warn!("Device {} missed its liveness probe", key);
            state.evict(key, *channel_id);
        }
        dead.len()
    }

    /// One reaper sweep at the current time
    pub fn reap(&self, mode: LivenessMode, timeout: Duration) -> ReapStats {
        self.reap_at(Instant::now(), mode, timeout)
    }

    /// One reaper sweep as of `now`
    pub fn reap_at(&self, now: Instant, mode: LivenessMode, timeout: Duration) -> ReapStats {
        let mut state = self.state.lock();
        let mut stats = ReapStats::default();

        for pair in state.negotiations.evict_older_than(timeout, now) {
            debug!("Negotiation {} expired", pair);
            stats.negotiations += 1;
        }

        if mode == LivenessMode::Heartbeat {
            for (key, channel_id) in state.registry.stale_since(now, timeout) {
                info!("Device {} heartbeat timed out", key);
                state.evict(&key, channel_id);
                stats.devices += 1;
            }
        }

        stats
    }

    pub fn device_count(&self) -> usize {
        self.state.lock().registry.len()
    }

    pub fn negotiation_count(&self) -> usize {
        self.state.lock().negotiations.len()
    }

    pub fn is_registered(&self, key: &DeviceKey) -> bool {
        self.state.lock().registry.contains(key)
    }
}

impl RelayState {
    /// The device key this connection currently speaks for
    fn sender(&self, conn: &Connection) -> Result<DeviceKey, SignalError> {
        match &conn.device {
            Some(key) if self.registry.is_bound(key, conn.channel.id()) => Ok(key.clone()),
            _ => Err(SignalError::NotRegistered),
        }
    }

    /// Registered device and its channel for a raw target key
    fn resolve_target(&self, raw: &str) -> Result<(DeviceKey, Channel), SignalError> {
        let key = DeviceKey::parse(raw).map_err(|_| SignalError::TargetNotFound(raw.to_string()))?;
        match self.registry.lookup(&key) {
            Some(channel) => Ok((key, channel.clone())),
            None => Err(SignalError::TargetNotFound(raw.to_string())),
        }
    }

    fn register(&mut self, conn: &mut Connection, device_key: Option<String>, now: Instant) {
        let result = require(device_key, "deviceKey")
            .and_then(|raw| self.registry.register(&raw, conn.channel.clone(), now));

        match result {
            Ok(registered) => {
                if let Some(previous) = conn.device.replace(registered.key.clone()) {
                    if previous != registered.key {
                        info!("{} switched from {} to {}", conn.channel.id(), previous, registered.key);
                        self.disconnect(&previous, conn.channel.id());
                    }
                }
                if registered.superseded {
                    self.drop_negotiations(&registered.key);
                }
                let _ = conn.channel.send(ServerMessage::RegistrationSuccess {
                    device_key: registered.key,
                });
            }
            Err(e) => {
                warn!("Registration failed on {}: {}", conn.channel.id(), e);
                let _ = conn.channel.send(ServerMessage::RegistrationError {
                    code: e.code(),
                    message: e.to_string(),
                });
            }
        }
    }

    fn connection_request(
        &mut self,
        conn: &Connection,
        source_key: Option<String>,
        target_key: Option<String>,
        offer: Option<Value>,
        now: Instant,
    ) -> Result<(), SignalError> {
        let source_key = require(source_key, "sourceKey")?;
        let target_key = require(target_key, "targetKey")?;
        let offer = require(offer, "offer")?;

        let sender = self.sender(conn)?;
        if sender.as_str() != source_key {
            return Err(SignalError::NotRegistered);
        }

        let (target, channel) = self.resolve_target(&target_key)?;
        reject_self_target(&sender, &target)?;

        // Only open the record once the request is actually queued
        channel.send(ServerMessage::ConnectionRequest {
            source_key: sender.clone(),
            offer: offer.clone(),
        })?;
        self.negotiations
            .open_or_replace(PairKey::new(sender.clone(), target.clone()), offer, now);

        info!("Connection request {} -> {}", sender, target);
        Ok(())
    }

    fn connection_response(
        &mut self,
        conn: &Connection,
        target_key: Option<String>,
        accepted: Option<bool>,
        answer: Option<Value>,
        reason: Option<String>,
    ) -> Result<(), SignalError> {
        let sender = self.sender(conn)?;
        let target_key = require(target_key, "targetKey")?;
        let accepted = require(accepted, "accepted")?;

        let (target, channel) = self.resolve_target(&target_key)?;
        let pair = PairKey::new(target.clone(), sender.clone());
        if !self.negotiations.contains(&pair) {
            return Err(SignalError::NoSuchNegotiation {
                initiator: target.to_string(),
                responder: sender.to_string(),
            });
        }

        if !accepted {
            self.negotiations.remove(&pair);
            info!("Connection {} rejected", pair);
            channel.send(ServerMessage::ConnectionRejected {
                source_key: sender,
                reason,
            })?;
            return Ok(());
        }

        let flush = match &answer {
            Some(answer) => Some(self.negotiations.record_answer(&pair, answer.clone())?),
            None => None,
        };

        channel.send(ServerMessage::ConnectionAccepted {
            source_key: sender,
            answer,
        })?;
        if let Some(flush) = flush {
            flush_candidates(&pair, flush, &channel, &conn.channel);
        }
        relay(
            &conn.channel,
            ServerMessage::ConnectionEstablished { peer_key: target },
        );

        info!("Connection {} accepted", pair);
        Ok(())
    }

    fn offer(
        &mut self,
        conn: &Connection,
        target_key: Option<String>,
        offer: Option<Value>,
        now: Instant,
    ) -> Result<(), SignalError> {
        let sender = self.sender(conn)?;
        let target_key = require(target_key, "targetKey")?;
        let offer = require(offer, "offer")?;

        let (target, channel) = match self.resolve_target(&target_key) {
            Ok(found) => found,
            Err(e) => {
                warn!("Dropping offer from {}: {}", sender, e);
                return Ok(());
            }
        };
        reject_self_target(&sender, &target)?;

        self.negotiations
            .open_or_replace(PairKey::new(sender.clone(), target.clone()), offer.clone(), now);
        relay(
            &channel,
            ServerMessage::Offer {
                source_key: sender.clone(),
                offer,
            },
        );

        debug!("Relayed offer {} -> {}", sender, target);
        Ok(())
    }

    fn answer(
        &mut self,
        conn: &Connection,
        target_key: Option<String>,
        answer: Option<Value>,
    ) -> Result<(), SignalError> {
        let sender = self.sender(conn)?;
        let target_key = require(target_key, "targetKey")?;
        let answer = require(answer, "answer")?;

        let (target, channel) = match self.resolve_target(&target_key) {
            Ok(found) => found,
            Err(e) => {
                warn!("Dropping answer from {}: {}", sender, e);
                return Ok(());
            }
        };

        // The responder answers the initiator's offer, so the record is
        // keyed (target, sender).
        let pair = PairKey::new(target, sender.clone());
        let flush = match self.negotiations.record_answer(&pair, answer.clone()) {
            Ok(flush) => flush,
            Err(e) => {
                warn!("Dropping answer from {}: {}", sender, e);
                return Ok(());
            }
        };

        relay(
            &channel,
            ServerMessage::Answer {
                source_key: sender,
                answer,
            },
        );
        flush_candidates(&pair, flush, &channel, &conn.channel);

        debug!("Relayed answer for {}", pair);
        Ok(())
    }

    fn ice_candidate(
        &mut self,
        conn: &Connection,
        target_key: Option<String>,
        candidate: Option<Value>,
    ) -> Result<(), SignalError> {
        let sender = self.sender(conn)?;
        let target_key = require(target_key, "targetKey")?;
        let candidate = require(candidate, "candidate")?;

        let (target, channel) = match self.resolve_target(&target_key) {
            Ok(found) => found,
            Err(e) => {
                warn!("Dropping candidate from {}: {}", sender, e);
                return Ok(());
            }
        };

        let outgoing = PairKey::new(sender.clone(), target.clone());
        let (pair, side) = if self.negotiations.contains(&outgoing) {
            (outgoing, Side::Initiator)
        } else {
            (PairKey::new(target, sender.clone()), Side::Responder)
        };

        match self.negotiations.append_candidate(&pair, side, candidate) {
            Ok(CandidateRoute::Immediate(candidate)) => relay(
                &channel,
                ServerMessage::IceCandidate {
                    source_key: sender,
                    candidate,
                },
            ),
            Ok(CandidateRoute::Buffered) => debug!("Buffered candidate from {} for {}", sender, pair),
            Err(e) => warn!("Dropping candidate from {}: {}", sender, e),
        }
        Ok(())
    }

    fn heartbeat(&mut self, conn: &Connection, now: Instant) {
        if let Ok(sender) = self.sender(conn) {
            self.registry.touch(&sender, now);
        }
    }

    fn disconnect_notice(&mut self, conn: &Connection, target_key: Option<String>) -> Result<(), SignalError> {
        let target_key = require(target_key, "targetKey")?;
        let sender = self.sender(conn)?;

        match self.resolve_target(&target_key) {
            Ok((target, channel)) => {
                debug!("{} told {} it is leaving", sender, target);
                relay(&channel, ServerMessage::PeerDisconnected { device_key: sender });
            }
            Err(_) => debug!("Disconnect notice from {} for absent {}", sender, target_key),
        }
        Ok(())
    }

    /// The disconnection path. Only acts while `key` is still bound to
    /// `channel`, so repeated calls are no-ops.
    fn disconnect(&mut self, key: &DeviceKey, channel: ChannelId) -> bool {
        if !self.registry.remove_if_bound(key, channel) {
            return false;
        }
        info!("Device {} disconnected", key);
        self.drop_negotiations(key);
        true
    }

    /// Disconnect a device the relay has given up on and close its socket
    fn evict(&mut self, key: &DeviceKey, channel_id: ChannelId) {
        let channel = self.registry.lookup(key).cloned();
        if self.disconnect(key, channel_id) {
            if let Some(channel) = channel {
                channel.close();
            }
        }
    }

    /// Remove every negotiation involving `key`, telling each peer once
    fn drop_negotiations(&mut self, key: &DeviceKey) {
        let peers: BTreeSet<DeviceKey> = self
            .negotiations
            .remove_all_involving(key)
            .iter()
            .filter_map(|pair| pair.peer_of(key).cloned())
            .collect();

        for peer in peers {
            if let Some(channel) = self.registry.lookup(&peer) {
                relay(
                    channel,
                    ServerMessage::PeerDisconnected {
                        device_key: key.clone(),
                    },
                );
            }
        }
    }
}

/// Deliver candidates released by an answer. Runs after the answer itself
/// has been queued to the initiator.
fn flush_candidates(pair: &PairKey, flush: AnswerFlush, initiator: &Channel, responder: &Channel) {
    for candidate in flush.to_initiator {
        relay(
            initiator,
            ServerMessage::IceCandidate {
                source_key: pair.responder.clone(),
                candidate,
            },
        );
    }
    for candidate in flush.to_responder {
        relay(
            responder,
            ServerMessage::IceCandidate {
                source_key: pair.initiator.clone(),
                candidate,
            },
        );
    }
}

/// Best-effort send; a dead channel is cleaned up by its own close path
fn relay(channel: &Channel, msg: ServerMessage) {
    if let Err(e) = channel.send(msg) {
        debug!("Relay to {} failed: {}", channel.id(), e);
    }
}

fn require<T>(value: Option<T>, field: &str) -> Result<T, SignalError> {
    value.ok_or_else(|| SignalError::missing_field(field))
}

fn reject_self_target(sender: &DeviceKey, target: &DeviceKey) -> Result<(), SignalError> {
    if sender == target {
        return Err(SignalError::MalformedMessage(
            "a device cannot target itself".to_string(),
        ));
    }
    Ok(())
}
