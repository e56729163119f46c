//! ## eddy-core::collections
//! **Index-linked containers**
//!
//! Objects never embed list nodes. Links live in side tables indexed by the
//! owner's slot number, so one slot can move between several lists (free,
//! partial, full) without any pointer juggling.
//!
//! ### Key Submodules:
//! - `list/`: Doubly linked lists over shared link tables
//! - `hash/`: Chained hash tables with insertion-order iteration

pub mod hash;
pub mod list;

pub use hash::{hash_code, EntryId, HashTable, StringTable};
pub use list::{Links, ListHead, NIL};
