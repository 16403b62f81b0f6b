//! Intrusive doubly linked list backed by a container that stores the links
//! inside its elements.
use core::fmt;

/// Circular linked list header.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ListHead<Index> {
    pub first: Option<Index>,
}

impl<Index> Default for ListHead<Index> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Index: fmt::Debug> fmt::Debug for ListHead<Index> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ListHead({:?})", &self.first)
    }
}

impl<Index> ListHead<Index> {
    pub const fn new() -> Self {
        Self { first: None }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    /// Iterate over the elements from front to back without mutable access
    /// to the pool.
    pub fn iter<'a, Pool: ?Sized>(&self, pool: &'a Pool) -> Iter<'a, Index, Pool>
    where
        Index: Copy,
    {
        Iter {
            pool,
            first: self.first,
            next: self.first,
        }
    }
}

/// Links to neighbor items.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Link<Index> {
    pub prev: Index,
    pub next: Index,
}

/// A container whose elements can be linked into a list.
pub trait LinkPool<Index> {
    fn link(&self, i: Index) -> Option<Link<Index>>;
    fn set_link(&mut self, i: Index, link: Option<Link<Index>>);
}

/// Accessor to a linked list formed by elements of `Pool`.
///
/// Panics if the list is found to be structurally inconsistent.
pub struct ListAccessor<'a, Index, Pool: ?Sized> {
    head: &'a mut ListHead<Index>,
    pool: &'a mut Pool,
}

impl<'a, Index, Pool> ListAccessor<'a, Index, Pool>
where
    Index: PartialEq + Copy,
    Pool: LinkPool<Index> + ?Sized,
{
    pub fn new(head: &'a mut ListHead<Index>, pool: &'a mut Pool) -> Self {
        Self { head, pool }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_empty()
    }

    pub fn pool(&self) -> &Pool {
        self.pool
    }

    #[inline]
    fn link_of(&self, i: Index) -> Link<Index> {
        self.pool.link(i).expect("linked list is inconsistent")
    }

    #[inline]
    fn modify_link(&mut self, i: Index, f: impl FnOnce(&mut Link<Index>)) {
        let mut link = self.link_of(i);
        f(&mut link);
        self.pool.set_link(i, Some(link));
    }

    #[inline]
    pub fn front(&self) -> Option<Index> {
        self.head.first
    }

    /// Get the element following `i`. Returns `None` if `i` is the last one.
    #[inline]
    pub fn next(&self, i: Index) -> Option<Index> {
        let next = self.link_of(i).next;
        if Some(next) == self.head.first {
            None
        } else {
            Some(next)
        }
    }

    /// Insert `item` before the position `p` (if `at` is `Some(p)`) or to the
    /// the list's back (if `at` is `None`).
    ///
    /// Panics if `item` is already linked.
    pub fn insert(&mut self, item: Index, at: Option<Index>) {
        assert!(self.pool.link(item).is_none(), "item is already linked");

        if let Some(first) = self.head.first {
            let (next, update_first) = if let Some(at) = at {
                (at, at == first)
            } else {
                (first, false)
            };

            let prev = self.link_of(next).prev;

            self.modify_link(prev, |l| l.next = item);
            self.modify_link(next, |l| l.prev = item);
            self.pool.set_link(item, Some(Link { prev, next }));

            if update_first {
                self.head.first = Some(item);
            }
        } else {
            debug_assert!(at.is_none());
            self.pool.set_link(
                item,
                Some(Link {
                    prev: item,
                    next: item,
                }),
            );
            self.head.first = Some(item);
        }
    }

    #[inline]
    pub fn push_back(&mut self, item: Index) {
        self.insert(item, None);
    }

    /// Remove `item` from the list. Returns `item`.
    ///
    /// Panics if `item` is not linked.
    pub fn remove(&mut self, item: Index) -> Index {
        let link = self.pool.link(item).expect("item is not linked");

        if self.head.first == Some(item) {
            if link.next == item {
                // The list just became empty
                self.head.first = None;
                self.pool.set_link(item, None);
                return item;
            }

            // Move the head pointer
            self.head.first = Some(link.next);
        }

        self.modify_link(link.prev, |l| l.next = link.next);
        self.modify_link(link.next, |l| l.prev = link.prev);
        self.pool.set_link(item, None);

        item
    }

    #[inline]
    pub fn pop_front(&mut self) -> Option<Index> {
        self.front().map(|item| self.remove(item))
    }

    /// Iterate over the elements from front to back.
    #[cfg(test)]
    pub fn iter(&self) -> Iter<'_, Index, Pool> {
        self.head.iter(self.pool)
    }
}

/// An iterator over the elements of a linked list.
pub struct Iter<'a, Index, Pool: ?Sized> {
    pool: &'a Pool,
    first: Option<Index>,
    next: Option<Index>,
}

impl<Index, Pool> Iterator for Iter<'_, Index, Pool>
where
    Index: PartialEq + Copy,
    Pool: LinkPool<Index> + ?Sized,
{
    type Item = Index;

    fn next(&mut self) -> Option<Index> {
        let item = self.next?;
        let next = self
            .pool
            .link(item)
            .expect("linked list is inconsistent")
            .next;
        self.next = if Some(next) == self.first {
            None
        } else {
            Some(next)
        };
        Some(item)
    }
}
