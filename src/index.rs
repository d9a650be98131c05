//! In-memory index state handed to the layout for save and load.

use crate::config::IndexConfig;
use crate::error::Result;
use crate::open_chapter::OpenChapter;
use crate::page_map::IndexPageMap;
use crate::volume_index::VolumeIndex;

/// The state a checkpoint captures: the chapter counters, the volume index,
/// the open chapter, and the index page map.
#[derive(Debug, Clone)]
pub struct Index {
    pub newest_virtual_chapter: u64,
    pub oldest_virtual_chapter: u64,
    /// Virtual chapter of the last completed save.
    pub last_save: u64,
    pub zone_count: u32,
    pub volume_index: VolumeIndex,
    pub open_chapter: OpenChapter,
    pub page_map: IndexPageMap,
}

impl Index {
    pub fn new(config: &IndexConfig, zone_count: u32) -> Result<Index> {
        Ok(Index {
            newest_virtual_chapter: 0,
            oldest_virtual_chapter: 0,
            last_save: 0,
            zone_count,
            volume_index: VolumeIndex::new(zone_count)?,
            open_chapter: OpenChapter::new(&config.geometry),
            page_map: IndexPageMap::new(&config.geometry)?,
        })
    }
}
