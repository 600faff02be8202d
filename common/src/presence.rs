use crate::{config::PresenceConfig, store::TargetRecord};

#[derive(Debug, Clone)]
pub struct PresenceMonitor {
    pub config: PresenceConfig,

    last_heartbeat_ms: Option<u64>,
    wake_sent_ms: Option<u64>,

    // Last value handed to `poll`, used only for edge detection.
    online: bool,
}

impl PresenceMonitor {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            config,
            last_heartbeat_ms: None,
            wake_sent_ms: None,
            online: false,
        }
    }

    pub fn last_heartbeat_ms(&self) -> Option<u64> {
        self.last_heartbeat_ms
    }

    pub fn wake_sent_ms(&self) -> Option<u64> {
        self.wake_sent_ms
    }

    pub fn heartbeat_received(
        &mut self,
        source: &str,
        target: &TargetRecord,
        now_ms: u64,
    ) -> bool {
        let Some(address) = target.target() else {
            return false;
        };
        if !address.matches_hex(source) {
            return false;
        }

        self.last_heartbeat_ms = Some(now_ms);
        if self.in_wake_grace(now_ms) {
            self.wake_sent_ms = None;
        }
        true
    }

    pub fn wake_issued(&mut self, now_ms: u64) {
        self.wake_sent_ms = Some(now_ms);
    }

    pub fn is_heartbeat_fresh(&self, now_ms: u64) -> bool {
        self.last_heartbeat_ms
            .map(|last| now_ms.saturating_sub(last) < self.config.heartbeat_timeout_ms)
            .unwrap_or(false)
    }

    pub fn in_wake_grace(&self, now_ms: u64) -> bool {
        self.wake_sent_ms
            .map(|sent| now_ms.saturating_sub(sent) < self.config.wake_grace_ms)
            .unwrap_or(false)
    }

    pub fn is_online(&self, now_ms: u64) -> bool {
        self.is_heartbeat_fresh(now_ms) || self.in_wake_grace(now_ms)
    }

    // Recomputes the online signal and returns it only when it flipped
    // since the previous poll.
    pub fn poll(&mut self, now_ms: u64) -> Option<bool> {
        let online = self.is_online(now_ms);
        if online == self.online {
            return None;
        }
        self.online = online;
        Some(online)
    }

    pub fn last_reported(&self) -> bool {
        self.online
    }
}

impl Default for PresenceMonitor {
    fn default() -> Self {
        Self::new(PresenceConfig::default())
    }
}
