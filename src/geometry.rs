//! Index geometry: how pages, chapters, and delta lists divide the volume.

/// Bytes per record: a 16-byte record name plus 16 bytes of metadata.
pub const BYTES_PER_RECORD: u64 = 32;

/// Static shape of the on-volume index.
///
/// The first five fields are configuration; the rest are derived. The volume
/// always carries one header page ahead of its chapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub bytes_per_page: u64,
    pub record_pages_per_chapter: u32,
    pub index_pages_per_chapter: u32,
    pub chapters_per_volume: u32,
    pub sparse_chapters_per_volume: u32,
    pub delta_lists_per_chapter: u32,

    pub records_per_page: u32,
    pub records_per_chapter: u32,
    pub records_per_volume: u64,
    pub pages_per_chapter: u32,
    pub bytes_per_chapter: u64,
    pub bytes_per_volume: u64,
}

impl Geometry {
    pub fn new(
        bytes_per_page: u64,
        record_pages_per_chapter: u32,
        index_pages_per_chapter: u32,
        chapters_per_volume: u32,
        sparse_chapters_per_volume: u32,
        delta_lists_per_chapter: u32,
    ) -> Geometry {
        let records_per_page = (bytes_per_page / BYTES_PER_RECORD) as u32;
        let records_per_chapter = records_per_page * record_pages_per_chapter;
        let pages_per_chapter = index_pages_per_chapter + record_pages_per_chapter;
        let bytes_per_chapter = bytes_per_page * u64::from(pages_per_chapter);

        Geometry {
            bytes_per_page,
            record_pages_per_chapter,
            index_pages_per_chapter,
            chapters_per_volume,
            sparse_chapters_per_volume,
            delta_lists_per_chapter,
            records_per_page,
            records_per_chapter,
            records_per_volume: u64::from(records_per_chapter)
                * u64::from(chapters_per_volume),
            pages_per_chapter,
            bytes_per_chapter,
            bytes_per_volume: bytes_per_page
                + bytes_per_chapter * u64::from(chapters_per_volume),
        }
    }

    /// A small geometry suitable for tests and tooling.
    pub fn small() -> Geometry {
        Geometry::new(4096, 1, 2, 4, 0, 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_fields() {
        let geometry = Geometry::new(4096, 2, 3, 8, 0, 64);
        assert_eq!(geometry.records_per_page, 128);
        assert_eq!(geometry.records_per_chapter, 256);
        assert_eq!(geometry.records_per_volume, 2048);
        assert_eq!(geometry.pages_per_chapter, 5);
        assert_eq!(geometry.bytes_per_chapter, 5 * 4096);
        // One header page plus eight chapters.
        assert_eq!(geometry.bytes_per_volume, 4096 + 8 * 5 * 4096);
    }
}
