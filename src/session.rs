//! Per-connection session state machine
//!
//! `Connecting → Active → Closed`. The event loop reads whatever the socket
//! has into [`Session::inbound_mut`] and then calls [`Session::dispatch_one`]
//! until it reports `Pending`; dispatch never touches the socket itself.

use crate::error::{ProtocolError, SessionEnd};
use crate::protocol::{Event, Request};
use crate::state::DisplayState;
use bytes::BytesMut;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

/// Monotonic baseline taken when a session becomes active. Event timestamps
/// sent to that session are relative to it.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    started: Instant,
}

impl SessionClock {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Elapsed milliseconds as carried on the wire. Saturates after ~49 days.
    pub fn elapsed_ms(&self) -> u32 {
        u32::try_from(self.elapsed().as_millis()).unwrap_or(u32::MAX)
    }
}

/// Outcome of one dispatch step.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatched {
    /// Not enough buffered input for a whole command.
    Pending,
    /// One command was applied; `reply` goes back to this client.
    Applied { reply: Option<Event> },
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    state: SessionState,
    clock: Option<SessionClock>,
    inbound: BytesMut,
    commands: u64,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            state: SessionState::Connecting,
            clock: None,
            inbound: BytesMut::with_capacity(4096),
            commands: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of commands applied so far.
    pub fn commands(&self) -> u64 {
        self.commands
    }

    /// Marks the handshake as delivered and starts the session clock.
    pub fn activate(&mut self) -> SessionClock {
        let clock = SessionClock::start();
        self.state = SessionState::Active;
        self.clock = Some(clock);
        clock
    }

    pub fn clock(&self) -> Option<SessionClock> {
        self.clock
    }

    /// Time since the session went active; zero before that.
    pub fn elapsed_since_connect(&self) -> Duration {
        self.clock.map(|c| c.elapsed()).unwrap_or_default()
    }

    /// Buffer the event loop reads socket data into.
    pub fn inbound_mut(&mut self) -> &mut BytesMut {
        &mut self.inbound
    }

    /// Decodes and applies at most one buffered command.
    ///
    /// Logical failures are answered with a `CommandFailed` reply and the
    /// session carries on; malformed input closes the session.
    pub fn dispatch_one(&mut self, display: &mut DisplayState) -> Result<Dispatched, SessionEnd> {
        match self.state {
            SessionState::Active => {}
            SessionState::Connecting => return Ok(Dispatched::Pending),
            SessionState::Closed => return Err(SessionEnd::Closed),
        }

        let request = match Request::decode(&mut self.inbound) {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(Dispatched::Pending),
            Err(e) => {
                self.close();
                return Err(e.into());
            }
        };
        self.commands += 1;
        debug!(session = %self.id, opcode = request.opcode(), "dispatch");

        let reply = match display.apply(self.id, &request) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(session = %self.id, opcode = request.opcode(), "command failed: {}", e);
                Some(Event::CommandFailed {
                    request: request.opcode(),
                    code: e.code(),
                    window: e.window(),
                })
            }
        };
        Ok(Dispatched::Applied { reply })
    }

    /// Called when the peer closes its end. Anything still buffered is a
    /// frame that will never complete.
    pub fn finish(&mut self) -> SessionEnd {
        let buffered = self.inbound.len();
        self.close();
        if buffered > 0 {
            SessionEnd::Protocol(ProtocolError::Truncated { buffered })
        } else {
            SessionEnd::Closed
        }
    }

    /// Enters `Closed`; buffered input is discarded unprocessed.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.inbound.clear();
    }
}
