//! fbws - a small frame-buffer window server
//!
//! One shared-memory frame buffer, a TCP protocol for window and property
//! management, and pointer events fanned out to every connected client.
//! Clients draw straight into the shared buffer; the server only keeps the
//! bookkeeping.

pub mod client;
pub mod config;
pub mod error;
pub mod property;
pub mod protocol;
pub mod server;
pub mod session;
pub mod shm;
pub mod state;
#[cfg(feature = "viewer")]
pub mod viewer;
pub mod window;

pub use client::Client;
pub use config::Config;
pub use error::{CommandError, ProtocolError, SessionEnd, StartupError};
pub use property::{PropertyKey, PropertyMode, PropertyStore};
pub use protocol::{Event, Handshake, Request};
pub use server::{Server, ServerHandle};
pub use shm::{FrameBufferAttachment, Geometry, SharedFrameBuffer};
pub use window::{Rect, Region, WindowId, WindowRegistry};
