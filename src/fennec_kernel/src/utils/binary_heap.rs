//! Binary heap with a contextful comparator and position tracking
//!
//! The element positions are reported through [`BinaryHeapCtx::on_move`] so
//! that the owner of an element can remove it from an arbitrary position in
//! logarithmic time.
use alloc::vec::Vec;


/// Context type for [`BinaryHeap`]'s operations.
pub trait BinaryHeapCtx<Element> {
    /// Return `true` iff `x < y`.
    fn lt(&mut self, x: &Element, y: &Element) -> bool;

    /// Called when the element `e` is moved to the new position `new_index`.
    fn on_move(&mut self, e: &mut Element, new_index: usize) {
        let _ = (e, new_index);
    }
}

impl<T: Ord> BinaryHeapCtx<T> for () {
    fn lt(&mut self, x: &T, y: &T) -> bool {
        *x < *y
    }
}

/// Min-heap.
pub trait BinaryHeap {
    type Element;

    /// Remove the item at the specified position and return it.
    fn heap_remove(
        &mut self,
        i: usize,
        ctx: impl BinaryHeapCtx<Self::Element>,
    ) -> Option<Self::Element>;

    /// Push an item onto the heap and return its position.
    fn heap_push(&mut self, item: Self::Element, ctx: impl BinaryHeapCtx<Self::Element>) -> usize;
}

impl<T> BinaryHeap for Vec<T> {
    type Element = T;

    fn heap_remove(&mut self, i: usize, mut ctx: impl BinaryHeapCtx<T>) -> Option<T> {
        if i >= self.len() {
            return None;
        }

        let last = self.len() - 1;
        self.swap(i, last);
        let item = self.pop();

        if i < self.len() {
            // The last item now occupies `[i]`
            ctx.on_move(&mut self[i], i);

            // Sift down or up the item at `i`, restoring the invariant
            if i > 0 && ctx.lt(&self[i], &self[(i - 1) / 2]) {
                sift_up(self, i, &mut ctx);
            } else {
                sift_down(self, i, &mut ctx);
            }
        }

        item
    }

    fn heap_push(&mut self, item: T, mut ctx: impl BinaryHeapCtx<T>) -> usize {
        let i = self.len();
        self.push(item);
        ctx.on_move(&mut self[i], i);
        sift_up(self, i, &mut ctx)
    }
}

/// Move the element at `pos` up the heap while it's less than its parent.
/// Returns the final position.
fn sift_up<Element>(
    this: &mut [Element],
    mut pos: usize,
    ctx: &mut impl BinaryHeapCtx<Element>,
) -> usize {
    while pos > 0 {
        let parent = (pos - 1) / 2;
        if !ctx.lt(&this[pos], &this[parent]) {
            break;
        }

        this.swap(pos, parent);

        // `[pos]` is now filled with the element moved from `[parent]`
        ctx.on_move(&mut this[pos], pos);
        pos = parent;
        ctx.on_move(&mut this[pos], pos);
    }
    pos
}

/// Move the element at `pos` down the heap while its children are less.
fn sift_down<Element>(this: &mut [Element], mut pos: usize, ctx: &mut impl BinaryHeapCtx<Element>) {
    let end = this.len();
    loop {
        let mut child = 2 * pos + 1;
        if child >= end {
            break;
        }

        // compare with the lesser of the two children
        let right = child + 1;
        if right < end && !ctx.lt(&this[child], &this[right]) {
            child = right;
        }

        // if we are already in order, stop.
        if !ctx.lt(&this[child], &this[pos]) {
            break;
        }

        this.swap(pos, child);
        ctx.on_move(&mut this[pos], pos);
        pos = child;
        ctx.on_move(&mut this[pos], pos);
    }
}
