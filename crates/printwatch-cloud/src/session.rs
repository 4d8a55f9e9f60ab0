// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Connector session state machine.
//
// Pure bookkeeping: the driver loop feeds it transport events and asks it
// whether another connection attempt is allowed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use printwatch_core::types::ConnectorState;

/// What the health endpoint sees of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: ConnectorState,
    pub reconnect_attempts: u32,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl SessionStatus {
    pub fn connected(&self) -> bool {
        self.state == ConnectorState::Connected
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: ConnectorState::Disconnected,
            reconnect_attempts: 0,
            last_heartbeat_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    state: ConnectorState,
    reconnect_attempts: u32,
    max_reconnect_attempts: u32,
    last_heartbeat_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(max_reconnect_attempts: u32) -> Self {
        Self {
            state: ConnectorState::Disconnected,
            reconnect_attempts: 0,
            max_reconnect_attempts,
            last_heartbeat_at: None,
        }
    }

    pub fn state(&self) -> ConnectorState {
        self.state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            reconnect_attempts: self.reconnect_attempts,
            last_heartbeat_at: self.last_heartbeat_at,
        }
    }

    /// `DISCONNECTED -> CONNECTING`, counting the attempt.
    ///
    /// Returns false, and moves to `GIVEN_UP`, once the attempt budget is
    /// spent. Attempts only reset on a registration ack or `reset`.
    pub fn begin_attempt(&mut self) -> bool {
        if self.state == ConnectorState::GivenUp {
            return false;
        }
        if self.reconnect_attempts >= self.max_reconnect_attempts {
            error!(
                attempts = self.reconnect_attempts,
                "cloud reconnection limit reached, giving up"
            );
            self.state = ConnectorState::GivenUp;
            return false;
        }
        self.reconnect_attempts += 1;
        self.transition(ConnectorState::Connecting);
        true
    }

    /// `CONNECTING -> REGISTERING` once the transport is up.
    pub fn transport_up(&mut self) {
        if self.state == ConnectorState::Connecting {
            self.transition(ConnectorState::Registering);
        }
    }

    /// `REGISTERING -> CONNECTED`. Returns true on the transition itself so
    /// repeated acks do not restart the timers.
    pub fn acknowledged(&mut self) -> bool {
        if self.state != ConnectorState::Registering {
            return false;
        }
        self.reconnect_attempts = 0;
        self.transition(ConnectorState::Connected);
        true
    }

    /// Transport closed, errored or went silent.
    pub fn transport_down(&mut self) {
        if self.state != ConnectorState::GivenUp {
            self.transition(ConnectorState::Disconnected);
        }
    }

    pub fn record_heartbeat(&mut self, at: DateTime<Utc>) {
        self.last_heartbeat_at = Some(at);
    }

    /// Explicit external trigger: forget the failure count and leave
    /// `GIVEN_UP`.
    pub fn reset(&mut self) {
        self.reconnect_attempts = 0;
        if self.state == ConnectorState::GivenUp {
            self.transition(ConnectorState::Disconnected);
        }
    }

    fn transition(&mut self, next: ConnectorState) {
        if self.state != next {
            info!(from = %self.state, to = %next, "cloud connector state change");
            self.state = next;
        }
    }
}
