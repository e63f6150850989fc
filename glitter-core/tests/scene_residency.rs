use pretty_assertions::assert_eq;

use glitter_core::handle::build_index;
use glitter_core::{
    Handle, HandleTable, IndexRecord, IndexRevision, MemProvider, ResourceConfigBuilder, ResourceError,
    ResourceFlags,
};

const FONT: Handle = Handle::new(0, 0);
const SCENE1: Handle = Handle::new(1, 0);
const SCENE2: Handle = Handle::new(2, 0);
const SCENE3: Handle = Handle::new(3, 0);
const CDPLAY: usize = 4;

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed)).collect()
}

fn table() -> HandleTable<MemProvider> {
    let records = [
        IndexRecord::new("FONT.FNT", 64, ResourceFlags::PRELOAD | ResourceFlags::GRAPHIC),
        IndexRecord::new("SCENE1.SCN", 512, ResourceFlags::DISCARDABLE),
        IndexRecord::new("SCENE2.SCN", 512, ResourceFlags::DISCARDABLE),
        IndexRecord::new("SCENE3.SCN", 512, ResourceFlags::DISCARDABLE),
        IndexRecord::new("CDPLAY", 0x1000, ResourceFlags::DISCARDABLE).with_media(1),
    ];
    let provider = MemProvider::new()
        .with_file("INDEX", build_index(&records, IndexRevision::Current))
        .with_file("FONT.FNT", pattern(64, 1))
        .with_file("SCENE1.SCN", pattern(512, 2))
        .with_file("SCENE2.SCN", pattern(512, 3))
        .with_file("SCENE3.SCN", pattern(512, 4))
        .with_file("CDPLAY.DAT", pattern(0x400, 5));
    let config = ResourceConfigBuilder::new().with_heap_size(1280).get();

    let mut table = HandleTable::new(config, provider);
    table.load_index().unwrap();
    table.initialize_residency().unwrap();
    table
}

#[test]
fn pinned_scene_survives_memory_pressure() {
    let mut table = table();
    assert_eq!(table.provider().opens_of("FONT.FNT"), 1);

    table.lock_resident(SCENE1).unwrap();
    assert_eq!(table.pinned(), Some(SCENE1));
    assert_eq!(table.resolve(SCENE2).unwrap(), &pattern(512, 3)[..]);

    table
        .declare_paged_range(Handle::new(CDPLAY, 0x100), Handle::new(CDPLAY, 0x180), "CDPLAY.DAT")
        .unwrap();
    assert_eq!(table.resolve(Handle::new(CDPLAY, 0x100)).unwrap().len(), 0x80);

    // three 512-byte scenes cannot all fit; the least recently used one goes
    assert_eq!(table.resolve(SCENE3).unwrap(), &pattern(512, 4)[..]);
    assert!(table.is_resident(SCENE1).unwrap());
    assert!(!table.is_resident(SCENE2).unwrap());
    assert_eq!(table.resolve(FONT).unwrap(), &pattern(64, 1)[..]);
    assert_eq!(table.provider().opens_of("FONT.FNT"), 1);

    assert!(matches!(
        table.lock_resident(SCENE2),
        Err(ResourceError::AlreadyPinned { .. })
    ));
    assert!(matches!(table.unlock_resident(SCENE2), Err(ResourceError::NotPinned(_))));
    table.unlock_resident(SCENE1).unwrap();
    table.lock_resident(SCENE2).unwrap();
    assert_eq!(table.resolve(SCENE2).unwrap(), &pattern(512, 3)[..]);
    table.heap().check_integrity().unwrap();
}

#[test]
fn paged_window_reads_only_the_declared_range() {
    let mut table = table();
    let source = pattern(0x400, 5);

    assert!(matches!(
        table.resolve(Handle::new(CDPLAY, 0x10)),
        Err(ResourceError::OutsidePagedRange { .. })
    ));

    table
        .declare_paged_range(Handle::new(CDPLAY, 0x200), Handle::new(CDPLAY, 0x300), "CDPLAY.DAT")
        .unwrap();
    let before = table.provider().bytes_read();
    assert_eq!(
        table.resolve(Handle::new(CDPLAY, 0x240)).unwrap(),
        &source[0x240..0x300]
    );
    assert_eq!(table.provider().bytes_read() - before, 0x100);

    // still resident: no further I/O
    table.resolve(Handle::new(CDPLAY, 0x200)).unwrap();
    assert_eq!(table.provider().opens_of("CDPLAY.DAT"), 1);

    assert!(matches!(
        table.resolve(Handle::new(CDPLAY, 0x300)),
        Err(ResourceError::OutsidePagedRange { .. })
    ));
    assert!(matches!(
        table.lock_resident(Handle::new(CDPLAY, 0x200)),
        Err(ResourceError::PagedNotPinnable(_))
    ));
}

#[test]
fn media_affinity() {
    let mut table = table();
    let window = Handle::new(CDPLAY, 0);
    assert!(table.requires_media_change(window).unwrap());
    table.set_current_media(1);
    assert!(!table.requires_media_change(window).unwrap());
    assert!(!table.requires_media_change(SCENE1).unwrap());
    assert_eq!(table.find("scene2.scn"), Some(SCENE2));
}
