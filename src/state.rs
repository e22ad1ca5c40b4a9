//! Server-side display state: windows plus their properties.
//!
//! Every mutation goes through a session id and is ownership-checked, so one
//! client can never reach another client's windows.

use crate::error::CommandError;
use crate::property::{PropertyKey, PropertyMode, PropertyStore};
use crate::protocol::{Event, Request};
use crate::session::SessionId;
use crate::window::{Region, WindowId, WindowRegistry};
use tracing::debug;

#[derive(Debug, Default)]
pub struct DisplayState {
    windows: WindowRegistry,
    properties: PropertyStore,
}

impl DisplayState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn windows(&self) -> &WindowRegistry {
        &self.windows
    }

    pub fn create_window(&mut self, session: SessionId, flags: u32) -> WindowId {
        let id = self.windows.create_window(session, flags);
        debug!(%session, window = %id, flags, "window created");
        id
    }

    pub fn set_region(
        &mut self,
        session: SessionId,
        window: WindowId,
        region: Region,
    ) -> Result<(), CommandError> {
        debug!(
            %session,
            %window,
            rects = region.rects.len(),
            empty = region.is_empty(),
            "set region"
        );
        self.windows.set_region(session, window, region)
    }

    pub fn destroy_window(&mut self, session: SessionId, window: WindowId) -> Result<(), CommandError> {
        self.windows.destroy_window(session, window)?;
        let dropped = self.properties.remove_window(window);
        debug!(%session, %window, properties = dropped, "window destroyed");
        Ok(())
    }

    pub fn add_property(
        &mut self,
        session: SessionId,
        window: WindowId,
        key: PropertyKey,
    ) -> Result<(), CommandError> {
        self.windows.owned(session, window)?;
        self.properties.add_property(window, key)
    }

    pub fn set_property(
        &mut self,
        session: SessionId,
        window: WindowId,
        key: PropertyKey,
        data: &[u8],
        mode: PropertyMode,
    ) -> Result<(), CommandError> {
        self.windows.owned(session, window)?;
        self.properties.set_property(window, key, data, mode)
    }

    pub fn remove_property(
        &mut self,
        session: SessionId,
        window: WindowId,
        key: PropertyKey,
    ) -> Result<(), CommandError> {
        self.windows.owned(session, window)?;
        self.properties.remove_property(window, key)
    }

    pub fn get_property(
        &self,
        session: SessionId,
        window: WindowId,
        key: PropertyKey,
    ) -> Result<&[u8], CommandError> {
        self.windows.owned(session, window)?;
        self.properties.get_property(window, key)
    }

    /// Unscoped read for server-side policy code.
    pub fn property(&self, window: WindowId, key: PropertyKey) -> Result<&[u8], CommandError> {
        self.windows.get(window)?;
        self.properties.get_property(window, key)
    }

    pub fn property_keys(&self, window: WindowId) -> Vec<PropertyKey> {
        self.properties.keys(window)
    }

    /// Tears down everything `session` owns. The only bulk deletion path.
    pub fn destroy_all_for_session(&mut self, session: SessionId) -> Vec<WindowId> {
        let gone = self.windows.destroy_all_for_session(session);
        for window in &gone {
            self.properties.remove_window(*window);
        }
        gone
    }

    /// Applies one decoded request and returns the reply, if the request has one.
    pub fn apply(&mut self, session: SessionId, request: &Request) -> Result<Option<Event>, CommandError> {
        match request {
            Request::CreateWindow { flags } => {
                let window = self.create_window(session, *flags);
                Ok(Some(Event::WindowCreated { window }))
            }
            Request::SetRegion { window, region } => {
                self.set_region(session, *window, region.clone())?;
                Ok(None)
            }
            Request::AddProperty { window, key } => {
                self.add_property(session, *window, *key)?;
                Ok(None)
            }
            Request::SetProperty {
                window,
                key,
                mode,
                data,
            } => {
                self.set_property(session, *window, *key, data, *mode)?;
                Ok(None)
            }
            Request::RemoveProperty { window, key } => {
                self.remove_property(session, *window, *key)?;
                Ok(None)
            }
            Request::DestroyWindow { window } => {
                self.destroy_window(session, *window)?;
                Ok(None)
            }
            Request::GetProperty { window, key } => {
                let data = self.get_property(session, *window, *key)?;
                Ok(Some(Event::PropertyValue {
                    window: *window,
                    key: *key,
                    data: bytes::Bytes::copy_from_slice(data),
                }))
            }
        }
    }
}
