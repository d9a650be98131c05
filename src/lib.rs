//! Albireo index layout
//!
//! The on-disk layout engine of the Albireo deduplication index. It carves a
//! backing block device into a fixed, versioned arrangement of regions,
//! persists a self-describing superblock so the arrangement can be
//! reconstructed on later opens, and manages a small ring of save slots into
//! which the running index periodically checkpoints its in-memory state.
//!
//! ## Layout
//!
//! ```text
//! ┌────────┬────────┬───────────────────────────────────────┬──────┐
//! │ Header │ Config │        Sub-index                      │ Seal │
//! │  (1)   │  (1)   │  Volume │ Save slot 0 │ Save slot 1   │ (1)  │
//! └────────┴────────┴───────────────────────────────────────┴──────┘
//!
//! Save slot:
//! ┌────────┬──────────┬─────────────────────┬──────────────┬───────┐
//! │ Header │ Page map │ Volume index zones  │ Open chapter │ Free  │
//! └────────┴──────────┴─────────────────────┴──────────────┴───────┘
//! ```
//!
//! All sizes are multiples of the 4096-byte block size; every header and
//! region begins on a block boundary. The wire format is little-endian and
//! bit-exact, guarded by magic values and a nonce-chained integrity scheme:
//! the superblock nonce is derived from 32 seed bytes, the sub-index nonce
//! from the superblock nonce, and each save's nonce from the sub-index
//! nonce, binding every checkpoint to the volume that wrote it.
//!
//! ## Save protocol
//!
//! Saves rotate round-robin through the slot ring. The oldest slot is
//! invalidated on disk *before* any new data is written, so a crash at any
//! point leaves either the previous committed save or an explicitly unsaved
//! slot, never a torn one. The slot header is rewritten last, behind the
//! data flushes.
//!
//! ## Modules
//!
//! - [`error`] - Error taxonomy and crate result alias
//! - [`codec`] - Cursor-backed little-endian buffer with bounds checks
//! - [`io`] - Block I/O façade over a named backing store
//! - [`nonce`] - Murmur3-128 based nonce generation
//! - [`geometry`] / [`config`] - Index shape and the saved config record
//! - [`region`] / [`superblock`] - Region tables and the superblock
//! - [`save`] - Per-slot save layout and slot selection
//! - [`layout`] - The top-level engine: create, open, save, load, convert
//! - [`page_map`] - Delta-list boundaries per (chapter, index page)
//! - [`open_chapter`] / [`volume_index`] / [`index`] - Checkpointed state

pub mod codec;
pub mod config;
pub mod error;
pub mod geometry;
pub mod index;
pub mod io;
pub mod layout;
pub mod nonce;
pub mod open_chapter;
pub mod page_map;
pub mod region;
pub mod save;
pub mod superblock;
pub mod volume_index;

pub use config::IndexConfig;
pub use error::{LayoutError, Result};
pub use geometry::Geometry;
pub use index::Index;
pub use io::{BufferedReader, BufferedWriter, FileAccess, IoFactory, BLOCK_SIZE};
pub use layout::{compute_sizes, IndexLayout, SaveLayoutSizes};
pub use open_chapter::{OpenChapter, OpenChapterRecord};
pub use page_map::{IndexPageBounds, IndexPageMap};
pub use region::{LayoutRegion, RegionKind, RegionTable, RegionType};
pub use save::{IndexSaveLayout, IndexSaveType};
pub use superblock::SuperBlockData;
pub use volume_index::{VolumeIndex, VolumeIndexEntry};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
