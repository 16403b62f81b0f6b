//! Utility
pub(crate) mod binary_heap;
pub(crate) mod intrusive_list;
mod prio_bitmap;
pub(crate) use self::prio_bitmap::*;
