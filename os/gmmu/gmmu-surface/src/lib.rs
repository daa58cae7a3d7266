//! # Surfaces over a Mirrored GPU Page Table
//!
//! Groups the translations of a buffer into [`PmMemMapping`]s and edits them:
//! page-size changes, flag updates, physical moves and aliasing. The page
//! tables themselves are mirrored by [`gmmu_tree`].
//!
//! ```text
//!   PmContext ── device, tree registry, surfaces, configuration
//!       │
//!       ▼
//!   PmSurface ── buffer, refcount, current + original mappings
//!       │
//!       ▼
//!   PmMemMappingsHelper ── PmMemMapping, PmMemMapping, …  (sorted, contiguous)
//!                              │
//!                              └── MemAttrs: Gmmu (per level) | Smmu | Ats
//! ```
//!
//! A surface is explored on first use; the result is kept as its original
//! mappings. [`PmContext::end_test`] restores every surface whose mappings
//! drifted from that snapshot.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod attrs;
pub mod context;
pub mod device;
mod error;
pub mod helper;
pub mod mapping;
mod range;
pub mod surface;

pub use crate::attrs::{GmmuAttrs, LevelAttrs, MapFlags, MemAttrs};
pub use crate::context::{
    DisposalPolicy, EndTestReport, MoveOptions, MoveReport, PmConfig, PmContext,
};
pub use crate::device::{Buffer, BufferDesc, PmDevice};
pub use crate::error::{JoinMismatch, PmError};
pub use crate::helper::PmMemMappingsHelper;
pub use crate::mapping::{Backing, MapCtx, MappingKind, PmMemMapping};
pub use crate::range::PmMemRange;
pub use crate::surface::{PmSurface, SurfaceId, SurfaceRefCount, SurfaceTable};
