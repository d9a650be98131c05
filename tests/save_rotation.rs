//! Save-slot rotation: round-robin selection, torn-save behavior, and
//! cancellation.

use albireo_layout::{Geometry, Index, IndexConfig, IndexLayout, LayoutError};
use std::thread::sleep;
use std::time::Duration;
use tempfile::NamedTempFile;

fn sized_store() -> (NamedTempFile, IndexConfig) {
    let temp = NamedTempFile::new().unwrap();
    let config = IndexConfig::new(temp.path(), Geometry::small());
    let size = IndexLayout::compute_size(&config).unwrap();
    temp.as_file().set_len(size).unwrap();
    (temp, config)
}

fn index_at_chapter(config: &IndexConfig, chapter: u64) -> Index {
    let mut index = Index::new(config, 1).unwrap();
    index.newest_virtual_chapter = chapter;
    index.last_save = chapter;
    index
}

/// Timestamps are milliseconds; keep successive saves in distinct
/// generations.
fn next_generation() {
    sleep(Duration::from_millis(3));
}

#[test]
fn save_after_invalidate_is_selectable() {
    let (_temp, config) = sized_store();
    let mut layout = IndexLayout::create(&config).unwrap();

    layout.save_state(&index_at_chapter(&config, 1)).unwrap();
    let slot = layout.latest_save().unwrap();
    assert!(layout.validate_save(slot).is_ok());
}

#[test]
fn crash_between_invalidate_and_write_keeps_previous_save() {
    let (_temp, config) = sized_store();
    let mut layout = IndexLayout::create(&config).unwrap();

    layout.save_state(&index_at_chapter(&config, 1)).unwrap();
    let committed = layout.latest_save().unwrap();
    let committed_time = layout.validate_save(committed).unwrap();
    next_generation();

    // Begin the next save: this invalidates the other slot on disk. Then
    // crash before anything else is written.
    let torn = layout.setup_save_slot(1).unwrap();
    assert_ne!(torn, committed);
    drop(layout);

    let reopened = IndexLayout::open(&config).unwrap();
    assert_eq!(reopened.latest_save().unwrap(), committed);
    assert_eq!(reopened.validate_save(committed).unwrap(), committed_time);
    assert!(matches!(
        reopened.validate_save(torn),
        Err(LayoutError::BadState(_))
    ));
}

#[test]
fn crash_with_no_previous_save_is_not_saved_cleanly() {
    let (_temp, config) = sized_store();
    let mut layout = IndexLayout::create(&config).unwrap();

    let _slot = layout.setup_save_slot(1).unwrap();
    drop(layout);

    let reopened = IndexLayout::open(&config).unwrap();
    assert!(matches!(
        reopened.latest_save(),
        Err(LayoutError::IndexNotSavedCleanly)
    ));
}

#[test]
fn cancelled_save_keeps_previous_save() {
    let (_temp, config) = sized_store();
    let mut layout = IndexLayout::create(&config).unwrap();

    layout.save_state(&index_at_chapter(&config, 1)).unwrap();
    let committed = layout.latest_save().unwrap();
    next_generation();

    let slot = layout.setup_save_slot(1).unwrap();
    layout.cancel_save(slot);

    assert_eq!(layout.latest_save().unwrap(), committed);
    assert!(matches!(
        layout.validate_save(slot),
        Err(LayoutError::BadState(_))
    ));
}

#[test]
fn three_saves_rotate_two_slots() {
    let (_temp, config) = sized_store();
    let mut layout = IndexLayout::create(&config).unwrap();

    layout.save_state(&index_at_chapter(&config, 1)).unwrap();
    let first_slot = layout.latest_save().unwrap();
    let t1 = layout.validate_save(first_slot).unwrap();
    next_generation();

    layout.save_state(&index_at_chapter(&config, 2)).unwrap();
    let second_slot = layout.latest_save().unwrap();
    let t2 = layout.validate_save(second_slot).unwrap();
    assert_ne!(second_slot, first_slot);
    assert!(t2 > t1);
    next_generation();

    layout.save_state(&index_at_chapter(&config, 3)).unwrap();
    let third_slot = layout.latest_save().unwrap();
    let t3 = layout.validate_save(third_slot).unwrap();
    assert!(t3 > t2);

    // The third save overwrote the slot holding t1.
    assert_eq!(third_slot, first_slot);
    assert_eq!(layout.oldest_save().unwrap(), second_slot);
    assert_eq!(layout.validate_save(second_slot).unwrap(), t2);
    let times: Vec<u64> = (0..usize::from(layout.max_saves()))
        .filter_map(|slot| layout.validate_save(slot).ok())
        .collect();
    assert!(!times.contains(&t1));

    // The newest generation wins the reload.
    let mut restored = Index::new(&config, 1).unwrap();
    layout.load_state(&mut restored).unwrap();
    assert_eq!(restored.newest_virtual_chapter, 3);
}

#[test]
fn rotation_survives_reopen() {
    let (_temp, config) = sized_store();

    let mut layout = IndexLayout::create(&config).unwrap();
    layout.save_state(&index_at_chapter(&config, 1)).unwrap();
    next_generation();
    layout.save_state(&index_at_chapter(&config, 2)).unwrap();
    drop(layout);

    let mut reopened = IndexLayout::open(&config).unwrap();
    let mut restored = Index::new(&config, 1).unwrap();
    reopened.load_state(&mut restored).unwrap();
    assert_eq!(restored.newest_virtual_chapter, 2);

    next_generation();
    reopened.save_state(&index_at_chapter(&config, 3)).unwrap();
    let mut restored = Index::new(&config, 1).unwrap();
    reopened.load_state(&mut restored).unwrap();
    assert_eq!(restored.newest_virtual_chapter, 3);
}
