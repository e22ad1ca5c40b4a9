//! Window registry

use crate::error::CommandError;
use crate::session::SessionId;
use std::collections::BTreeMap;
use std::fmt;

/// Window identifier. Zero is reserved for "no window" / broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct WindowId(pub u32);

impl WindowId {
    pub const NONE: WindowId = WindowId(0);
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }
}

/// Clip region, stored as the rectangle list the client sent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Region {
    pub rects: Vec<Rect>,
}

impl Region {
    pub fn new(rects: Vec<Rect>) -> Self {
        Self { rects }
    }

    pub fn is_empty(&self) -> bool {
        self.rects.iter().all(|r| r.width == 0 || r.height == 0)
    }
}

#[derive(Debug, Clone)]
pub struct Window {
    pub id: WindowId,
    pub owner: SessionId,
    pub flags: u32,
    pub region: Region,
}

/// Owns every window on the server, keyed by id.
///
/// The id counter lives here rather than in a static so every registry
/// (and every server) hands out ids starting at 1.
#[derive(Debug)]
pub struct WindowRegistry {
    windows: BTreeMap<WindowId, Window>,
    next_id: u32,
}

impl Default for WindowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowRegistry {
    pub fn new() -> Self {
        Self {
            windows: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn allocate_id(&mut self) -> WindowId {
        let id = WindowId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    pub fn create_window(&mut self, owner: SessionId, flags: u32) -> WindowId {
        let id = self.allocate_id();
        self.windows.insert(
            id,
            Window {
                id,
                owner,
                flags,
                region: Region::default(),
            },
        );
        id
    }

    pub fn get(&self, id: WindowId) -> Result<&Window, CommandError> {
        self.windows.get(&id).ok_or(CommandError::UnknownWindow(id))
    }

    /// Looks up `id` and checks that `session` owns it.
    pub fn owned(&self, session: SessionId, id: WindowId) -> Result<&Window, CommandError> {
        let window = self.get(id)?;
        if window.owner != session {
            return Err(CommandError::NotOwner(id));
        }
        Ok(window)
    }

    pub fn set_region(
        &mut self,
        session: SessionId,
        id: WindowId,
        region: Region,
    ) -> Result<(), CommandError> {
        self.owned(session, id)?;
        if let Some(window) = self.windows.get_mut(&id) {
            window.region = region;
        }
        Ok(())
    }

    pub fn destroy_window(&mut self, session: SessionId, id: WindowId) -> Result<Window, CommandError> {
        self.owned(session, id)?;
        self.windows.remove(&id).ok_or(CommandError::UnknownWindow(id))
    }

    /// Removes every window owned by `session`, returning their ids.
    pub fn destroy_all_for_session(&mut self, session: SessionId) -> Vec<WindowId> {
        let doomed: Vec<WindowId> = self
            .windows
            .values()
            .filter(|w| w.owner == session)
            .map(|w| w.id)
            .collect();
        for id in &doomed {
            self.windows.remove(id);
        }
        doomed
    }

    pub fn windows_of(&self, session: SessionId) -> impl Iterator<Item = &Window> {
        self.windows.values().filter(move |w| w.owner == session)
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
