//! # GMMU Page-Table Mirror
//!
//! A software copy of the parts of a GPU page-table tree that translate one
//! surface, and the machinery to edit it.
//!
//! ```text
//!  MmuLevelTreeRegistry ── TreeKey (device, memory, VA, address space)
//!          │
//!          ▼
//!    MmuLevelTree ── one MmuLevel per format level
//!          │
//!          ▼
//!      MmuLevel ── MmuLevelSegment, MmuLevelSegment, …   (partition of the surface)
//!                         │
//!                         ├── staged, decoded entries
//!                         └── flush → GmmuDriver::write_phys  or  CommandChannel
//! ```
//!
//! ## Collaborators
//! - [`GmmuDriver`]: layout queries, physical access, TLB invalidation.
//! - [`CommandChannel`]: method stream for in-band copy-engine work,
//!   encoded by [`CopyEngine`].
//!
//! ## Consistency
//! Segment changes are staged until flushed. [`PmMmuLevel::modify_entries`]
//! flushes per chunk and invalidates the TLB after direct writes, unless the
//! [`WriteMode`] defers it. In-band writes never invalidate; the caller does
//! so once the channel has drained.
//!
//! The registry is a plain value. Nothing here is shared between threads.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod channel;
pub mod driver;
mod error;
mod level;
pub mod modify;
mod registry;
pub mod segment;
mod tree;

pub use crate::channel::{CommandChannel, CopyEngine};
pub use crate::driver::{GmmuDriver, VaSpaceKind};
pub use crate::error::{DriverError, MmuError};
pub use crate::level::MmuLevel;
pub use crate::modify::{EntryArgs, EntryOps, PmMmuLevel, WriteMode};
pub use crate::registry::{MmuLevelTreeRegistry, TreeKey};
pub use crate::segment::MmuLevelSegment;
pub use crate::tree::{MmuLevelTree, QueryPath, Translation, TreeState};
