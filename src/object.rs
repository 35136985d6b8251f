//! # Kernel Objects
//!
//! Every kernel object (thread, timer) carries an [`ObjectHeader`] with its
//! name, kind and allocation flavour, and lives in a fixed-capacity [`Slab`].
//! Objects are addressed through generation-checked [`Handle`]s: a handle
//! that outlived its object is a programming error and panics instead of
//! silently aliasing the slot's next occupant.
//!
//! The slab *is* the object registry: an object is registered while its slot
//! is occupied, and `find` walks the occupied slots.

use core::fmt;

use crate::config::NAME_MAX;
use crate::list::NodeId;

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

/// Fixed-capacity object name, truncated to `NAME_MAX` bytes on a char
/// boundary.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Name {
    bytes: [u8; NAME_MAX],
    len: u8,
}

impl Name {
    pub fn new(name: &str) -> Self {
        let mut end = name.len().min(NAME_MAX);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let mut bytes = [0u8; NAME_MAX];
        bytes[..end].copy_from_slice(&name.as_bytes()[..end]);
        Self {
            bytes,
            len: end as u8,
        }
    }

    pub fn as_str(&self) -> &str {
        // Constructed from a &str cut on a char boundary.
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Object header
// ---------------------------------------------------------------------------

/// Kind tag of a kernel object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectClass {
    Thread,
    Timer,
}

/// Fields shared by every kernel object.
#[derive(Debug, Clone, Copy)]
pub struct ObjectHeader {
    pub name: Name,
    pub class: ObjectClass,
    /// Statically allocated ("system") object: destroyed with `detach`,
    /// never frees memory. Dynamic objects are destroyed with `delete`.
    pub is_static: bool,
}

impl ObjectHeader {
    pub fn new(name: &str, class: ObjectClass, is_static: bool) -> Self {
        Self {
            name: Name::new(name),
            class,
            is_static,
        }
    }

    #[inline]
    pub fn is_system_object(&self) -> bool {
        self.is_static
    }
}

/// Implemented by every object stored in a kernel slab.
pub trait KernelObject {
    fn header(&self) -> &ObjectHeader;

    fn name(&self) -> &str {
        self.header().name.as_str()
    }
}

// ---------------------------------------------------------------------------
// Handles and slabs
// ---------------------------------------------------------------------------

/// Slot index plus the generation the slot had when the object was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: NodeId,
    generation: u16,
}

impl Handle {
    #[inline]
    pub fn index(&self) -> NodeId {
        self.index
    }
}

struct Slot<T> {
    generation: u16,
    value: Option<T>,
}

/// Fixed-capacity object table.
pub struct Slab<T, const N: usize> {
    slots: [Slot<T>; N],
}

impl<T, const N: usize> Slab<T, N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot {
                generation: 0,
                value: None,
            }),
        }
    }

    /// Store the value built by `build`, which receives the handle the value
    /// will be reachable under. Returns `None` when the table is full.
    pub fn insert_with(&mut self, build: impl FnOnce(Handle) -> T) -> Option<Handle> {
        let index = self.slots.iter().position(|s| s.value.is_none())?;
        let slot = &mut self.slots[index];
        let handle = Handle {
            index: index as NodeId,
            generation: slot.generation,
        };
        slot.value = Some(build(handle));
        Some(handle)
    }

    /// Handle the next `insert_with` will return, if a slot is free.
    pub fn vacant_handle(&self) -> Option<Handle> {
        let index = self.slots.iter().position(|s| s.value.is_none())?;
        Some(Handle {
            index: index as NodeId,
            generation: self.slots[index].generation,
        })
    }

    /// Take the object out of its slot and retire the handle.
    pub fn remove(&mut self, handle: Handle) -> T {
        let slot = &mut self.slots[handle.index as usize];
        assert!(
            slot.generation == handle.generation && slot.value.is_some(),
            "stale kernel object handle {:?}",
            handle
        );
        slot.generation = slot.generation.wrapping_add(1);
        match slot.value.take() {
            Some(v) => v,
            None => unreachable!(),
        }
    }

    #[inline]
    pub fn contains(&self, handle: Handle) -> bool {
        self.try_get(handle).is_some()
    }

    pub fn try_get(&self, handle: Handle) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get(&self, handle: Handle) -> &T {
        match self.try_get(handle) {
            Some(v) => v,
            None => panic!("stale kernel object handle {:?}", handle),
        }
    }

    pub fn try_get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn get_mut(&mut self, handle: Handle) -> &mut T {
        let slot = &mut self.slots[handle.index as usize];
        match slot.value.as_mut() {
            Some(v) if slot.generation == handle.generation => v,
            _ => panic!("stale kernel object handle {:?}", handle),
        }
    }

    /// Object stored at `index`, for link traversal.
    pub fn at(&self, index: NodeId) -> &T {
        match self.slots[index as usize].value.as_ref() {
            Some(v) => v,
            None => panic!("vacant slot {} reached through a link", index),
        }
    }

    pub fn at_mut(&mut self, index: NodeId) -> &mut T {
        match self.slots[index as usize].value.as_mut() {
            Some(v) => v,
            None => panic!("vacant slot {} reached through a link", index),
        }
    }

    /// Current handle of the occupied slot `index`.
    pub fn handle_at(&self, index: NodeId) -> Option<Handle> {
        let slot = self.slots.get(index as usize)?;
        slot.value.as_ref().map(|_| Handle {
            index,
            generation: slot.generation,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.value.as_ref().map(|v| {
                (
                    Handle {
                        index: i as NodeId,
                        generation: s.generation,
                    },
                    v,
                )
            })
        })
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_some()).count()
    }
}

impl<T: KernelObject, const N: usize> Slab<T, N> {
    /// First registered object called `name`.
    pub fn find(&self, name: &str) -> Option<Handle> {
        self.iter()
            .find(|(_, obj)| obj.header().name.as_str() == name)
            .map(|(h, _)| h)
    }
}

impl<T, const N: usize> Default for Slab<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Obj(ObjectHeader);

    impl KernelObject for Obj {
        fn header(&self) -> &ObjectHeader {
            &self.0
        }
    }

    #[test]
    fn test_name_truncates_on_char_boundary() {
        assert_eq!(Name::new("timer").as_str(), "timer");
        assert_eq!(Name::new("averyverylongname").as_str(), "averyver");
        // 'é' is two bytes; it must not be split.
        assert_eq!(Name::new("abcdefgé").as_str(), "abcdefg");
    }

    #[test]
    fn test_stale_handle_is_not_found_after_reuse() {
        let mut slab: Slab<Obj, 2> = Slab::new();
        let a = slab
            .insert_with(|_| Obj(ObjectHeader::new("a", ObjectClass::Timer, true)))
            .unwrap();
        slab.remove(a);
        let b = slab
            .insert_with(|_| Obj(ObjectHeader::new("b", ObjectClass::Timer, true)))
            .unwrap();
        assert_eq!(a.index(), b.index());
        assert!(slab.try_get_mut(a).is_none());
        assert!(!slab.contains(a));
        assert_eq!(slab.get(b).name(), "b");
    }

    #[test]
    fn test_full_slab_rejects_insert() {
        let mut slab: Slab<Obj, 1> = Slab::new();
        assert!(slab
            .insert_with(|_| Obj(ObjectHeader::new("x", ObjectClass::Thread, false)))
            .is_some());
        assert!(slab
            .insert_with(|_| Obj(ObjectHeader::new("y", ObjectClass::Thread, false)))
            .is_none());
    }

    #[test]
    fn test_find_by_name() {
        let mut slab: Slab<Obj, 4> = Slab::new();
        slab.insert_with(|_| Obj(ObjectHeader::new("idle", ObjectClass::Thread, true)));
        let t = slab
            .insert_with(|_| Obj(ObjectHeader::new("timer", ObjectClass::Thread, true)))
            .unwrap();
        assert_eq!(slab.find("timer"), Some(t));
        assert_eq!(slab.find("nope"), None);
    }

    #[test]
    #[should_panic(expected = "stale kernel object handle")]
    fn test_stale_get_panics() {
        let mut slab: Slab<Obj, 1> = Slab::new();
        let a = slab
            .insert_with(|_| Obj(ObjectHeader::new("a", ObjectClass::Timer, true)))
            .unwrap();
        slab.remove(a);
        slab.get(a);
    }
}
