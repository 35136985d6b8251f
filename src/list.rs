//! Index-linked doubly linked lists.
//!
//! Kernel objects live in fixed slabs and link to each other by slot index.
//! A [`Link`] is embedded in the object; a [`ListHead`] owns head and tail.
//! Insert and remove are O(1), and removing an unlinked node is a no-op, so
//! callers can "unlink wherever it is" without tracking membership first.

/// Slot index of a linked node.
pub type NodeId = u16;

/// Link node embedded in a kernel object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Link {
    prev: Option<NodeId>,
    next: Option<NodeId>,
    linked: bool,
}

impl Link {
    pub const fn new() -> Self {
        Self {
            prev: None,
            next: None,
            linked: false,
        }
    }

    #[inline]
    pub fn is_linked(&self) -> bool {
        self.linked
    }

    #[inline]
    pub fn next(&self) -> Option<NodeId> {
        self.next
    }

    #[inline]
    pub fn prev(&self) -> Option<NodeId> {
        self.prev
    }
}

/// Access to the link nodes of one list family.
///
/// A slab implements this once per embedded link it carries (a timer has one
/// per skip-list level, see `timer::Row`).
pub trait LinkStore {
    fn link(&self, node: NodeId) -> &Link;
    fn link_mut(&mut self, node: NodeId) -> &mut Link;
}

/// Head of an index-linked list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListHead {
    head: Option<NodeId>,
    tail: Option<NodeId>,
    len: usize,
}

impl ListHead {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn front(&self) -> Option<NodeId> {
        self.head
    }

    #[inline]
    pub fn back(&self) -> Option<NodeId> {
        self.tail
    }

    /// Successor of `pos`, where `None` stands for the list head itself.
    #[inline]
    pub fn next<S: LinkStore + ?Sized>(&self, store: &S, pos: Option<NodeId>) -> Option<NodeId> {
        match pos {
            None => self.head,
            Some(n) => store.link(n).next,
        }
    }

    /// True when `pos` has no successor. `None` (the head) is last only in
    /// an empty list.
    #[inline]
    pub fn is_last(&self, pos: Option<NodeId>) -> bool {
        pos == self.tail
    }

    /// Link `node` directly after `pos` (`None` inserts at the front).
    pub fn insert_after<S: LinkStore + ?Sized>(
        &mut self,
        store: &mut S,
        pos: Option<NodeId>,
        node: NodeId,
    ) {
        assert!(!store.link(node).linked, "node {} already linked", node);
        let next = self.next(store, pos);
        {
            let link = store.link_mut(node);
            link.prev = pos;
            link.next = next;
            link.linked = true;
        }
        match pos {
            None => self.head = Some(node),
            Some(p) => store.link_mut(p).next = Some(node),
        }
        match next {
            None => self.tail = Some(node),
            Some(n) => store.link_mut(n).prev = Some(node),
        }
        self.len += 1;
    }

    /// Append `node` at the tail.
    #[inline]
    pub fn push_back<S: LinkStore + ?Sized>(&mut self, store: &mut S, node: NodeId) {
        let tail = self.tail;
        self.insert_after(store, tail, node);
    }

    /// Unlink `node`. Returns `false` if it was not linked.
    ///
    /// The caller must pass the list the node is actually linked into.
    pub fn remove<S: LinkStore + ?Sized>(&mut self, store: &mut S, node: NodeId) -> bool {
        let link = *store.link(node);
        if !link.linked {
            return false;
        }
        match link.prev {
            None => self.head = link.next,
            Some(p) => store.link_mut(p).next = link.next,
        }
        match link.next {
            None => self.tail = link.prev,
            Some(n) => store.link_mut(n).prev = link.prev,
        }
        *store.link_mut(node) = Link::new();
        self.len -= 1;
        true
    }

    /// Unlink and return the first node.
    pub fn pop_front<S: LinkStore + ?Sized>(&mut self, store: &mut S) -> Option<NodeId> {
        let node = self.head?;
        self.remove(store, node);
        Some(node)
    }

    /// Iterate node ids front to back.
    pub fn iter<'a, S: LinkStore + ?Sized>(&self, store: &'a S) -> Iter<'a, S> {
        Iter {
            store,
            cursor: self.head,
        }
    }
}

/// Front-to-back iterator over a [`ListHead`].
pub struct Iter<'a, S: ?Sized> {
    store: &'a S,
    cursor: Option<NodeId>,
}

impl<'a, S: LinkStore + ?Sized> Iterator for Iter<'a, S> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let node = self.cursor?;
        self.cursor = self.store.link(node).next;
        Some(node)
    }
}
