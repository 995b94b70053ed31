//! Reconnection supervisor: bounded exponential backoff over abnormal closures.
//!
//! Pure state machine. It decides; the controller owns the timers and connections.

use std::time::Duration;

use super::transport::is_normal_closure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl ReconnectPolicy {
    /// `base_delay * 2^attempt`, saturating.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// What the controller should do after a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    None,
    /// Schedule retry number `attempt` (1-based) after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Attempts exhausted; surface a terminal error and stop.
    GiveUp { attempts: u32 },
}

#[derive(Debug)]
pub struct Supervisor {
    policy: ReconnectPolicy,
    state: LinkState,
    attempt: u32,
}

impl Supervisor {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: LinkState::Idle,
            attempt: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_open(&self) -> bool {
        self.state == LinkState::Open
    }

    /// Explicit open. Returns true when the caller must open a new connection.
    pub fn request_open(&mut self) -> bool {
        match self.state {
            LinkState::Connecting | LinkState::Open => false,
            LinkState::Reconnecting => {
                self.state = LinkState::Connecting;
                true
            }
            LinkState::Idle | LinkState::Failed => {
                self.attempt = 0;
                self.state = LinkState::Connecting;
                true
            }
        }
    }

    pub fn on_open(&mut self) {
        if self.state == LinkState::Connecting {
            self.state = LinkState::Open;
            self.attempt = 0;
        }
    }

    pub fn on_close(&mut self, code: u16) -> CloseAction {
        if is_normal_closure(code) {
            self.close();
            return CloseAction::None;
        }
        match self.state {
            LinkState::Open | LinkState::Connecting => {
                if self.attempt < self.policy.max_attempts {
                    self.state = LinkState::Reconnecting;
                    CloseAction::Retry {
                        attempt: self.attempt + 1,
                        delay: self.policy.delay_for(self.attempt),
                    }
                } else {
                    self.state = LinkState::Failed;
                    CloseAction::GiveUp {
                        attempts: self.attempt,
                    }
                }
            }
            LinkState::Idle | LinkState::Reconnecting | LinkState::Failed => CloseAction::None,
        }
    }

    /// Backoff timer fired. Returns true when the caller must open a new connection.
    pub fn retry_due(&mut self) -> bool {
        if self.state != LinkState::Reconnecting {
            return false;
        }
        self.attempt += 1;
        self.state = LinkState::Connecting;
        true
    }

    /// Intentional close with the normal code.
    pub fn close(&mut self) {
        self.state = LinkState::Idle;
        self.attempt = 0;
    }
}
