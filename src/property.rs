//! Per-window property store

use crate::error::CommandError;
use crate::window::WindowId;
use std::collections::{BTreeMap, HashMap};

pub type PropertyKey = u32;

/// How `set_property` combines new bytes with the stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyMode {
    Replace,
    Prepend,
    Append,
}

impl PropertyMode {
    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(PropertyMode::Replace),
            1 => Some(PropertyMode::Prepend),
            2 => Some(PropertyMode::Append),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            PropertyMode::Replace => 0,
            PropertyMode::Prepend => 1,
            PropertyMode::Append => 2,
        }
    }
}

/// Keyed byte blobs, grouped by window. Keys iterate in ascending order.
#[derive(Debug, Default)]
pub struct PropertyStore {
    windows: HashMap<WindowId, BTreeMap<PropertyKey, Vec<u8>>>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_property(&mut self, window: WindowId, key: PropertyKey) -> Result<(), CommandError> {
        let props = self.windows.entry(window).or_default();
        if props.contains_key(&key) {
            return Err(CommandError::DuplicateProperty { window, key });
        }
        props.insert(key, Vec::new());
        Ok(())
    }

    pub fn set_property(
        &mut self,
        window: WindowId,
        key: PropertyKey,
        data: &[u8],
        mode: PropertyMode,
    ) -> Result<(), CommandError> {
        let value = self
            .windows
            .get_mut(&window)
            .and_then(|props| props.get_mut(&key))
            .ok_or(CommandError::UnknownProperty { window, key })?;

        match mode {
            PropertyMode::Replace => {
                value.clear();
                value.extend_from_slice(data);
            }
            PropertyMode::Append => value.extend_from_slice(data),
            PropertyMode::Prepend => {
                value.splice(0..0, data.iter().copied());
            }
        }
        Ok(())
    }

    pub fn remove_property(&mut self, window: WindowId, key: PropertyKey) -> Result<(), CommandError> {
        let props = self
            .windows
            .get_mut(&window)
            .ok_or(CommandError::UnknownProperty { window, key })?;
        props
            .remove(&key)
            .ok_or(CommandError::UnknownProperty { window, key })?;
        if props.is_empty() {
            self.windows.remove(&window);
        }
        Ok(())
    }

    pub fn get_property(&self, window: WindowId, key: PropertyKey) -> Result<&[u8], CommandError> {
        self.windows
            .get(&window)
            .and_then(|props| props.get(&key))
            .map(Vec::as_slice)
            .ok_or(CommandError::UnknownProperty { window, key })
    }

    /// Keys currently set on `window`, ascending.
    pub fn keys(&self, window: WindowId) -> Vec<PropertyKey> {
        self.windows
            .get(&window)
            .map(|props| props.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Drops every property of `window`. Returns how many were removed.
    pub fn remove_window(&mut self, window: WindowId) -> usize {
        self.windows.remove(&window).map_or(0, |props| props.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: WindowId = WindowId(1);

    fn store_with(value: &[u8]) -> PropertyStore {
        let mut store = PropertyStore::new();
        store.add_property(W, 7).unwrap();
        store.set_property(W, 7, value, PropertyMode::Replace).unwrap();
        store
    }

    #[test]
    fn modes() {
        let mut s = store_with(b"ab");
        s.set_property(W, 7, b"c", PropertyMode::Append).unwrap();
        assert_eq!(s.get_property(W, 7).unwrap(), b"abc");

        let mut s = store_with(b"ab");
        s.set_property(W, 7, b"c", PropertyMode::Prepend).unwrap();
        assert_eq!(s.get_property(W, 7).unwrap(), b"cab");

        let mut s = store_with(b"ab");
        s.set_property(W, 7, b"c", PropertyMode::Replace).unwrap();
        assert_eq!(s.get_property(W, 7).unwrap(), b"c");
    }

    #[test]
    fn new_property_is_empty() {
        let mut s = PropertyStore::new();
        s.add_property(W, 3).unwrap();
        assert_eq!(s.get_property(W, 3).unwrap(), b"");
    }

    #[test]
    fn duplicate_add_keeps_value() {
        let mut s = store_with(b"keep");
        assert_eq!(
            s.add_property(W, 7),
            Err(CommandError::DuplicateProperty { window: W, key: 7 })
        );
        assert_eq!(s.get_property(W, 7).unwrap(), b"keep");
    }

    #[test]
    fn set_and_remove_require_existing_key() {
        let mut s = PropertyStore::new();
        let missing = Err(CommandError::UnknownProperty { window: W, key: 2 });
        assert_eq!(s.set_property(W, 2, b"x", PropertyMode::Append), missing);
        assert_eq!(s.remove_property(W, 2), missing);

        s.add_property(W, 2).unwrap();
        s.remove_property(W, 2).unwrap();
        assert!(s.get_property(W, 2).is_err());
    }

    #[test]
    fn properties_are_scoped_per_window() {
        let mut s = store_with(b"one");
        s.add_property(WindowId(2), 7).unwrap();
        assert_eq!(s.get_property(WindowId(2), 7).unwrap(), b"");
        assert_eq!(s.get_property(W, 7).unwrap(), b"one");
    }

    #[test]
    fn remove_window_drops_everything() {
        let mut s = store_with(b"x");
        s.add_property(W, 1).unwrap();
        assert_eq!(s.keys(W), vec![1, 7]);
        assert_eq!(s.remove_window(W), 2);
        assert!(s.keys(W).is_empty());
        assert_eq!(s.remove_window(W), 0);
    }

    #[test]
    fn wire_modes() {
        assert_eq!(PropertyMode::from_wire(0), Some(PropertyMode::Replace));
        assert_eq!(PropertyMode::from_wire(1), Some(PropertyMode::Prepend));
        assert_eq!(PropertyMode::from_wire(2), Some(PropertyMode::Append));
        assert_eq!(PropertyMode::from_wire(3), None);
    }
}
