// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printwatch cloud uplink: wire messages, the session state machine and the
// reconnecting WebSocket connector.

pub mod connector;
pub mod messages;
pub mod session;
pub mod transport;

pub use connector::{CloudConnector, ConnectorSettings, TelemetryProvider};
pub use messages::{AgentIdentity, Outbound};
pub use session::SessionStatus;
pub use transport::{Credentials, WsTransport};
