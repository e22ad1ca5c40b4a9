//! Minimal client side of the protocol
//!
//! Reads the handshake, attaches the shared frame buffer and speaks requests
//! and events over the socket. Pointer events that arrive while waiting for a
//! reply are kept and handed out by [`Client::next_event`] later.

use crate::property::{PropertyKey, PropertyMode};
use crate::protocol::{Event, Handshake, Request};
use crate::shm::{FrameBufferAttachment, Geometry};
use crate::window::{Region, WindowId};
use anyhow::{bail, Context, Result};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

pub struct Client {
    stream: TcpStream,
    inbound: BytesMut,
    handshake: Handshake,
    pointer_backlog: VecDeque<Event>,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let mut stream = TcpStream::connect(addr)
            .await
            .context("failed to connect to window server")?;
        stream.set_nodelay(true)?;

        let mut inbound = BytesMut::with_capacity(4096);
        let handshake = loop {
            if let Some(hs) = Handshake::decode(&mut inbound)? {
                break hs;
            }
            if stream.read_buf(&mut inbound).await? == 0 {
                bail!("server closed the connection during handshake");
            }
        };

        Ok(Self {
            stream,
            inbound,
            handshake,
            pointer_backlog: VecDeque::new(),
        })
    }

    pub fn handshake(&self) -> Handshake {
        self.handshake
    }

    pub fn geometry(&self) -> Result<Geometry> {
        let hs = self.handshake;
        Ok(Geometry::new(hs.width, hs.height, hs.bits_per_pixel)?)
    }

    /// Maps the server's frame buffer into this process.
    pub fn attach_frame_buffer(&self) -> Result<FrameBufferAttachment> {
        FrameBufferAttachment::attach(self.handshake.shm_handle, self.geometry()?)
            .context("failed to attach shared frame buffer")
    }

    pub async fn send(&mut self, request: &Request) -> Result<()> {
        let mut buf = BytesMut::new();
        request.encode(&mut buf);
        self.stream.write_all(&buf).await?;
        Ok(())
    }

    /// Writes bytes as-is, bypassing the encoder.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Half-closes the connection; the server sees end-of-stream.
    pub async fn close_write(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Next event from the server, or `None` once it hangs up.
    pub async fn next_event(&mut self) -> Result<Option<Event>> {
        if let Some(ev) = self.pointer_backlog.pop_front() {
            return Ok(Some(ev));
        }
        self.read_event().await
    }

    /// Waits for the next non-pointer event.
    pub async fn expect_reply(&mut self) -> Result<Event> {
        loop {
            match self.read_event().await? {
                Some(ev @ Event::Pointer { .. }) => self.pointer_backlog.push_back(ev),
                Some(ev) => return Ok(ev),
                None => bail!("server closed the connection"),
            }
        }
    }

    pub async fn create_window(&mut self, flags: u32) -> Result<WindowId> {
        self.send(&Request::CreateWindow { flags }).await?;
        match self.expect_reply().await? {
            Event::WindowCreated { window } => Ok(window),
            other => bail!("unexpected reply to CreateWindow: {:?}", other),
        }
    }

    pub async fn set_region(&mut self, window: WindowId, region: Region) -> Result<()> {
        self.send(&Request::SetRegion { window, region }).await
    }

    pub async fn add_property(&mut self, window: WindowId, key: PropertyKey) -> Result<()> {
        self.send(&Request::AddProperty { window, key }).await
    }

    pub async fn remove_property(&mut self, window: WindowId, key: PropertyKey) -> Result<()> {
        self.send(&Request::RemoveProperty { window, key }).await
    }

    pub async fn destroy_window(&mut self, window: WindowId) -> Result<()> {
        self.send(&Request::DestroyWindow { window }).await
    }

    pub async fn set_property(
        &mut self,
        window: WindowId,
        key: PropertyKey,
        mode: PropertyMode,
        data: &[u8],
    ) -> Result<()> {
        self.send(&Request::SetProperty {
            window,
            key,
            mode,
            data: Bytes::copy_from_slice(data),
        })
        .await
    }

    pub async fn get_property(&mut self, window: WindowId, key: PropertyKey) -> Result<Bytes> {
        self.send(&Request::GetProperty { window, key }).await?;
        match self.expect_reply().await? {
            Event::PropertyValue { data, .. } => Ok(data),
            Event::CommandFailed { code, .. } => {
                bail!("GetProperty({}, {}) failed with code {}", window, key, code)
            }
            other => bail!("unexpected reply to GetProperty: {:?}", other),
        }
    }

    async fn read_event(&mut self) -> Result<Option<Event>> {
        loop {
            if let Some(ev) = Event::decode(&mut self.inbound)? {
                return Ok(Some(ev));
            }
            if self.stream.read_buf(&mut self.inbound).await? == 0 {
                if self.inbound.is_empty() {
                    return Ok(None);
                }
                bail!("connection closed mid-frame");
            }
        }
    }
}
