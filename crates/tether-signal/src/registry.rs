//! Device registry: which channel currently speaks for each device key

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use tether_core::{DeviceKey, SignalError};

use crate::channel::{Channel, ChannelId};
use crate::messages::ServerMessage;

/// Reason sent to a channel displaced by a newer registration
pub const SUPERSEDED_REASON: &str = "device key registered from another connection";

/// A registered device
struct RegistryEntry {
    channel: Channel,
    last_heartbeat: Instant,
    probe_outstanding: bool,
}

/// Outcome of a successful registration
#[derive(Debug)]
pub struct Registered {
    pub key: DeviceKey,
    /// A different channel held the key and has been told to go away
    pub superseded: bool,
}

/// Identity to channel map. At most one channel is bound per key.
#[derive(Default)]
pub struct DeviceRegistry {
    entries: HashMap<DeviceKey, RegistryEntry>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `key` to `channel`.
    ///
    /// A different channel already bound to the key receives exactly one
    /// `forced-disconnect` and is then closed.
    pub fn register(
        &mut self,
        key: &str,
        channel: Channel,
        now: Instant,
    ) -> Result<Registered, SignalError> {
        let key = DeviceKey::parse(key)?;
        let channel_id = channel.id();

        let entry = RegistryEntry {
            channel,
            last_heartbeat: now,
            probe_outstanding: false,
        };

        let superseded = match self.entries.insert(key.clone(), entry) {
            Some(previous) if previous.channel.id() != channel_id => {
                info!(
                    "Device {} re-registered, displacing {}",
                    key,
                    previous.channel.id()
                );
                let _ = previous.channel.send(ServerMessage::ForcedDisconnect {
                    reason: SUPERSEDED_REASON.to_string(),
                });
                previous.channel.close();
                true
            }
            Some(_) => {
                debug!("Device {} refreshed its registration", key);
                false
            }
            None => {
                info!("Device {} registered", key);
                false
            }
        };

        Ok(Registered { key, superseded })
    }

    /// Refresh the heartbeat timestamp and confirm the outstanding probe
    pub fn touch(&mut self, key: &DeviceKey, now: Instant) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_heartbeat = now;
            entry.probe_outstanding = false;
        }
    }

    pub fn lookup(&self, key: &DeviceKey) -> Option<&Channel> {
        self.entries.get(key).map(|e| &e.channel)
    }

    /// True if `key` is bound to exactly this channel
    pub fn is_bound(&self, key: &DeviceKey, channel: ChannelId) -> bool {
        self.entries
            .get(key)
            .map_or(false, |e| e.channel.id() == channel)
    }

    pub fn contains(&self, key: &DeviceKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Unconditionally unbind a key
    pub fn remove(&mut self, key: &DeviceKey) -> Option<Channel> {
        self.entries.remove(key).map(|e| e.channel)
    }

    /// Unbind `key` only while it still belongs to `channel`
    pub fn remove_if_bound(&mut self, key: &DeviceKey, channel: ChannelId) -> bool {
        if self.is_bound(key, channel) {
            self.entries.remove(key);
            true
        } else {
            false
        }
    }

    /// Run one probe round.
    ///
    /// Returns the devices that never answered the previous probe. Every
    /// other device is marked unconfirmed and probed again.
    pub fn probe_round(&mut self) -> Vec<(DeviceKey, ChannelId)> {
        let mut dead = Vec::new();

        for (key, entry) in self.entries.iter_mut() {
            if entry.probe_outstanding || entry.channel.probe().is_err() {
                dead.push((key.clone(), entry.channel.id()));
            } else {
                entry.probe_outstanding = true;
            }
        }

        dead
    }

    /// Devices whose last heartbeat is older than `timeout`
    pub fn stale_since(&self, now: Instant, timeout: Duration) -> Vec<(DeviceKey, ChannelId)> {
        self.entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_heartbeat) > timeout)
            .map(|(k, e)| (k.clone(), e.channel.id()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Outbound;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = DeviceRegistry::new();
        let (channel, _rx) = Channel::new();
        let id = channel.id();

        let registered = registry.register("AAAA111111", channel, Instant::now()).unwrap();
        assert!(!registered.superseded);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(&registered.key).unwrap().id(), id);
        assert!(registry.is_bound(&registered.key, id));
    }

    #[test]
    fn test_register_rejects_malformed_key() {
        let mut registry = DeviceRegistry::new();
        let (channel, _rx) = Channel::new();

        let err = registry.register("aaaa111111", channel, Instant::now()).unwrap_err();
        assert!(matches!(err, SignalError::InvalidIdentity(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reregistration_supersedes_previous_channel() {
        let mut registry = DeviceRegistry::new();
        let (first, mut first_rx) = Channel::new();
        let (second, mut second_rx) = Channel::new();
        let second_id = second.id();

        registry.register("AAAA111111", first, Instant::now()).unwrap();
        let registered = registry.register("AAAA111111", second, Instant::now()).unwrap();

        assert!(registered.superseded);
        assert_eq!(registry.len(), 1);
        assert!(registry.is_bound(&registered.key, second_id));

        // exactly one notice, then the close
        let sent = drain(&mut first_rx);
        assert_eq!(sent.len(), 2);
        assert!(matches!(
            &sent[0],
            Outbound::Message(ServerMessage::ForcedDisconnect { .. })
        ));
        assert!(matches!(sent[1], Outbound::Close));

        assert!(drain(&mut second_rx).is_empty());
    }

    #[test]
    fn test_same_channel_reregistration_is_not_supersession() {
        let mut registry = DeviceRegistry::new();
        let (channel, mut rx) = Channel::new();

        registry.register("AAAA111111", channel.clone(), Instant::now()).unwrap();
        let registered = registry.register("AAAA111111", channel, Instant::now()).unwrap();

        assert!(!registered.superseded);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_remove_if_bound_ignores_stale_channel() {
        let mut registry = DeviceRegistry::new();
        let (first, _rx1) = Channel::new();
        let (second, _rx2) = Channel::new();
        let first_id = first.id();
        let second_id = second.id();

        registry.register("AAAA111111", first, Instant::now()).unwrap();
        let key = registry.register("AAAA111111", second, Instant::now()).unwrap().key;

        assert!(!registry.remove_if_bound(&key, first_id));
        assert!(registry.contains(&key));
        assert!(registry.remove_if_bound(&key, second_id));
        assert!(!registry.contains(&key));

        // idempotent
        assert!(registry.remove(&key).is_none());
    }

    #[test]
    fn test_probe_round_detects_missed_probe() {
        let mut registry = DeviceRegistry::new();
        let (quiet, mut quiet_rx) = Channel::new();
        let (chatty, _chatty_rx) = Channel::new();
        let now = Instant::now();

        let quiet_key = registry.register("AAAA111111", quiet, now).unwrap().key;
        let chatty_key = registry.register("BBBB222222", chatty, now).unwrap().key;

        assert!(registry.probe_round().is_empty());
        assert!(matches!(quiet_rx.try_recv().unwrap(), Outbound::Probe));

        // only the chatty device answers
        registry.touch(&chatty_key, now);

        let dead = registry.probe_round();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].0, quiet_key);
    }

    #[test]
    fn test_stale_since() {
        let mut registry = DeviceRegistry::new();
        let (a, _rx_a) = Channel::new();
        let (b, _rx_b) = Channel::new();
        let start = Instant::now();

        let a_key = registry.register("AAAA111111", a, start).unwrap().key;
        let b_key = registry.register("BBBB222222", b, start).unwrap().key;
        registry.touch(&b_key, start + Duration::from_secs(50));

        let stale = registry.stale_since(start + Duration::from_secs(61), Duration::from_secs(60));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].0, a_key);
        assert!(registry
            .stale_since(start + Duration::from_secs(111), Duration::from_secs(60))
            .iter()
            .any(|(key, _)| key == &b_key));
    }

    #[test]
    fn test_touch_unknown_is_noop() {
        let mut registry = DeviceRegistry::new();
        let key = DeviceKey::parse("CCCC333333").unwrap();
        registry.touch(&key, Instant::now());
        assert!(registry.is_empty());
    }
}
