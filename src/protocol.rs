//! Wire codec
//!
//! Every frame is a one-byte opcode followed by a fixed or length-prefixed
//! payload. All integers are little-endian; the handshake opens with the
//! byte-order marker `'l'` so that is explicit on the wire.
//!
//! Decoders are incremental: they look at buffered input, return `Ok(None)`
//! without consuming anything while a frame is incomplete, and consume exactly
//! one frame once it is whole.

use crate::error::ProtocolError;
use crate::property::{PropertyKey, PropertyMode};
use crate::window::{Rect, Region, WindowId};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Client → server request opcodes
pub mod opcodes {
    pub const CREATE_WINDOW: u8 = 1;
    pub const SET_REGION: u8 = 2;
    pub const ADD_PROPERTY: u8 = 3;
    pub const SET_PROPERTY: u8 = 4;
    pub const REMOVE_PROPERTY: u8 = 5;
    pub const DESTROY_WINDOW: u8 = 6;
    pub const GET_PROPERTY: u8 = 7;
}

/// Server → client event opcodes
pub mod events {
    pub const POINTER: u8 = 1;
    pub const WINDOW_CREATED: u8 = 2;
    pub const PROPERTY_VALUE: u8 = 3;
    pub const COMMAND_FAILED: u8 = 4;
}

pub const BYTE_ORDER_LITTLE: u8 = b'l';
pub const HANDSHAKE_LEN: usize = 17;

pub const MAX_REGION_RECTS: u32 = 4096;
pub const MAX_PROPERTY_LEN: u32 = 16 * 1024 * 1024;

/// Pointer button bits in `Event::Pointer::state`
pub mod buttons {
    pub const LEFT: u32 = 1;
    pub const RIGHT: u32 = 2;
    pub const MIDDLE: u32 = 4;
}

/// Read cursor over buffered bytes. Every getter returns `None` when the
/// buffer runs out, which callers turn into "frame incomplete".
struct Peek<'a> {
    buf: &'a [u8],
    start: usize,
}

impl<'a> Peek<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            start: buf.len(),
        }
    }

    fn consumed(&self) -> usize {
        self.start - self.buf.len()
    }

    fn u8(&mut self) -> Option<u8> {
        (self.buf.remaining() >= 1).then(|| self.buf.get_u8())
    }

    fn u32(&mut self) -> Option<u32> {
        (self.buf.remaining() >= 4).then(|| self.buf.get_u32_le())
    }

    fn i32(&mut self) -> Option<i32> {
        (self.buf.remaining() >= 4).then(|| self.buf.get_i32_le())
    }

    fn bytes(&mut self, len: usize) -> Option<Bytes> {
        (self.buf.remaining() >= len).then(|| self.buf.copy_to_bytes(len))
    }

    fn window(&mut self) -> Option<WindowId> {
        self.u32().map(WindowId)
    }
}

/// Turns an `Option` from `Peek` into an early `Ok(None)`.
macro_rules! need {
    ($e:expr) => {
        match $e {
            Some(v) => v,
            None => return Ok(None),
        }
    };
}

/// Sent once by the server right after accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
    pub shm_handle: u32,
}

impl Handshake {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HANDSHAKE_LEN);
        dst.put_u8(BYTE_ORDER_LITTLE);
        dst.put_u32_le(self.width);
        dst.put_u32_le(self.height);
        dst.put_u32_le(self.bits_per_pixel);
        dst.put_u32_le(self.shm_handle);
    }

    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        let mut p = Peek::new(src);
        let order = need!(p.u8());
        if order != BYTE_ORDER_LITTLE {
            return Err(ProtocolError::ByteOrder(order));
        }
        let width = need!(p.u32());
        let height = need!(p.u32());
        let bits_per_pixel = need!(p.u32());
        let shm_handle = need!(p.u32());
        let used = p.consumed();
        src.advance(used);
        Ok(Some(Self {
            width,
            height,
            bits_per_pixel,
            shm_handle,
        }))
    }
}

/// A decoded client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    CreateWindow {
        flags: u32,
    },
    SetRegion {
        window: WindowId,
        region: Region,
    },
    AddProperty {
        window: WindowId,
        key: PropertyKey,
    },
    SetProperty {
        window: WindowId,
        key: PropertyKey,
        mode: PropertyMode,
        data: Bytes,
    },
    RemoveProperty {
        window: WindowId,
        key: PropertyKey,
    },
    DestroyWindow {
        window: WindowId,
    },
    GetProperty {
        window: WindowId,
        key: PropertyKey,
    },
}

impl Request {
    pub fn opcode(&self) -> u8 {
        match self {
            Request::CreateWindow { .. } => opcodes::CREATE_WINDOW,
            Request::SetRegion { .. } => opcodes::SET_REGION,
            Request::AddProperty { .. } => opcodes::ADD_PROPERTY,
            Request::SetProperty { .. } => opcodes::SET_PROPERTY,
            Request::RemoveProperty { .. } => opcodes::REMOVE_PROPERTY,
            Request::DestroyWindow { .. } => opcodes::DESTROY_WINDOW,
            Request::GetProperty { .. } => opcodes::GET_PROPERTY,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.opcode());
        match self {
            Request::CreateWindow { flags } => dst.put_u32_le(*flags),
            Request::SetRegion { window, region } => {
                dst.put_u32_le(window.0);
                dst.put_u32_le(region.rects.len() as u32);
                for r in &region.rects {
                    dst.put_i32_le(r.x);
                    dst.put_i32_le(r.y);
                    dst.put_u32_le(r.width);
                    dst.put_u32_le(r.height);
                }
            }
            Request::AddProperty { window, key }
            | Request::RemoveProperty { window, key }
            | Request::GetProperty { window, key } => {
                dst.put_u32_le(window.0);
                dst.put_u32_le(*key);
            }
            Request::SetProperty {
                window,
                key,
                mode,
                data,
            } => {
                dst.put_u32_le(window.0);
                dst.put_u32_le(*key);
                dst.put_u8(mode.to_wire());
                dst.put_u32_le(data.len() as u32);
                dst.put_slice(data);
            }
            Request::DestroyWindow { window } => dst.put_u32_le(window.0),
        }
    }

    /// Decodes one request from the front of `src`.
    ///
    /// An unknown opcode, bad mode or oversized length fails as soon as the
    /// offending field is buffered, without waiting for the rest.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        let mut p = Peek::new(src);
        let opcode = need!(p.u8());
        let request = match opcode {
            opcodes::CREATE_WINDOW => Request::CreateWindow {
                flags: need!(p.u32()),
            },
            opcodes::SET_REGION => {
                let window = need!(p.window());
                let count = need!(p.u32());
                if count > MAX_REGION_RECTS {
                    return Err(ProtocolError::RegionTooLarge(count));
                }
                let mut rects = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let x = need!(p.i32());
                    let y = need!(p.i32());
                    let width = need!(p.u32());
                    let height = need!(p.u32());
                    rects.push(Rect::new(x, y, width, height));
                }
                Request::SetRegion {
                    window,
                    region: Region::new(rects),
                }
            }
            opcodes::ADD_PROPERTY => Request::AddProperty {
                window: need!(p.window()),
                key: need!(p.u32()),
            },
            opcodes::SET_PROPERTY => {
                let window = need!(p.window());
                let key = need!(p.u32());
                let raw_mode = need!(p.u8());
                let mode =
                    PropertyMode::from_wire(raw_mode).ok_or(ProtocolError::InvalidMode(raw_mode))?;
                let len = need!(p.u32());
                if len > MAX_PROPERTY_LEN {
                    return Err(ProtocolError::PropertyTooLarge(len));
                }
                Request::SetProperty {
                    window,
                    key,
                    mode,
                    data: need!(p.bytes(len as usize)),
                }
            }
            opcodes::REMOVE_PROPERTY => Request::RemoveProperty {
                window: need!(p.window()),
                key: need!(p.u32()),
            },
            opcodes::DESTROY_WINDOW => Request::DestroyWindow {
                window: need!(p.window()),
            },
            opcodes::GET_PROPERTY => Request::GetProperty {
                window: need!(p.window()),
                key: need!(p.u32()),
            },
            other => return Err(ProtocolError::UnknownOpcode(other)),
        };
        let used = p.consumed();
        src.advance(used);
        Ok(Some(request))
    }
}

/// A server-originated frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// `window` is `WindowId::NONE` for broadcast. `time_ms` is measured
    /// from the receiving session's own connect time.
    Pointer {
        window: WindowId,
        x: i32,
        y: i32,
        state: u32,
        time_ms: u32,
    },
    WindowCreated {
        window: WindowId,
    },
    PropertyValue {
        window: WindowId,
        key: PropertyKey,
        data: Bytes,
    },
    CommandFailed {
        request: u8,
        code: u8,
        window: WindowId,
    },
}

impl Event {
    pub fn opcode(&self) -> u8 {
        match self {
            Event::Pointer { .. } => events::POINTER,
            Event::WindowCreated { .. } => events::WINDOW_CREATED,
            Event::PropertyValue { .. } => events::PROPERTY_VALUE,
            Event::CommandFailed { .. } => events::COMMAND_FAILED,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.opcode());
        match self {
            Event::Pointer {
                window,
                x,
                y,
                state,
                time_ms,
            } => {
                dst.put_u32_le(window.0);
                dst.put_i32_le(*x);
                dst.put_i32_le(*y);
                dst.put_u32_le(*state);
                dst.put_u32_le(*time_ms);
            }
            Event::WindowCreated { window } => dst.put_u32_le(window.0),
            Event::PropertyValue { window, key, data } => {
                dst.put_u32_le(window.0);
                dst.put_u32_le(*key);
                dst.put_u32_le(data.len() as u32);
                dst.put_slice(data);
            }
            Event::CommandFailed {
                request,
                code,
                window,
            } => {
                dst.put_u8(*request);
                dst.put_u8(*code);
                dst.put_u32_le(window.0);
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        let mut p = Peek::new(src);
        let opcode = need!(p.u8());
        let event = match opcode {
            events::POINTER => Event::Pointer {
                window: need!(p.window()),
                x: need!(p.i32()),
                y: need!(p.i32()),
                state: need!(p.u32()),
                time_ms: need!(p.u32()),
            },
            events::WINDOW_CREATED => Event::WindowCreated {
                window: need!(p.window()),
            },
            events::PROPERTY_VALUE => {
                let window = need!(p.window());
                let key = need!(p.u32());
                let len = need!(p.u32());
                if len > MAX_PROPERTY_LEN {
                    return Err(ProtocolError::PropertyTooLarge(len));
                }
                Event::PropertyValue {
                    window,
                    key,
                    data: need!(p.bytes(len as usize)),
                }
            }
            events::COMMAND_FAILED => Event::CommandFailed {
                request: need!(p.u8()),
                code: need!(p.u8()),
                window: need!(p.window()),
            },
            other => return Err(ProtocolError::UnknownOpcode(other)),
        };
        let used = p.consumed();
        src.advance(used);
        Ok(Some(event))
    }
}
