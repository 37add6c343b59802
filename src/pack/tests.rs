use super::delta::DeltaBuilder;
use super::*;
use crate::object::ObjectKind;
use crate::window_cache::{map_window, WindowCacheConfig};

use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::RngCore;
use tempdir::TempDir;

fn small_cache() -> Arc<WindowCache> {
    // Windows round up to one page, so anything bigger than a page spans windows
    Arc::new(WindowCache::new(WindowCacheConfig {
        window_size: 1,
        limit: 64 * 1024,
    }))
}

fn dir() -> Result<(TempDir, Utf8PathBuf)> {
    let dir = TempDir::new("")?;
    let path = Utf8Path::from_path(dir.path()).unwrap().to_owned();
    Ok((dir, path))
}

fn noise(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[test]
fn test_every_indexed_object_resolves_to_its_id() -> Result<()> {
    let (_tmp, root) = dir()?;
    let objects = vec![
        Object::blob("hello\n"),
        Object::blob(noise(20_000)),
        Object::new(ObjectKind::Tree, Vec::new()),
        Object::blob(""),
    ];

    let mut writer = PackWriter::new();
    for object in &objects {
        writer.add(object)?;
    }
    let path = writer.finish().write_to(&root)?;

    let pack = PackFile::open(&path, small_cache())?;
    assert_eq!(pack.index().len(), objects.len());
    for object in &objects {
        assert_eq!(&pack.get(&object.id(), &NoExternalBases)?, object);
    }
    for id in pack.index().ids() {
        assert_eq!(&pack.get(id, &NoExternalBases)?.id(), id);
    }
    pack.verify(&NoExternalBases)?;
    Ok(())
}

#[test]
fn test_pack_name_is_trailer() -> Result<()> {
    let (_tmp, root) = dir()?;
    let mut writer = PackWriter::new();
    writer.add(&Object::blob("x"))?;
    let written = writer.finish();
    let trailer = ObjectId::from_slice(&written.pack[written.pack.len() - 20..]).unwrap();
    assert_eq!(written.name, format!("pack-{trailer:x}"));

    let path = written.write_to(&root)?;
    assert_eq!(path.file_name(), Some(&*format!("{}.pack", written.name)));
    assert!(path.with_extension("idx").is_file());
    Ok(())
}

#[test]
fn test_offset_delta_chain() -> Result<()> {
    let (_tmp, root) = dir()?;
    let mut content = noise(9000);
    let mut writer = PackWriter::new();
    let base = Object::blob(content.clone());
    let mut prev_offset = writer.add(&base)?;

    // Each link appends a few bytes to the previous version
    let mut expected = Vec::new();
    for i in 0..6u8 {
        let tail = vec![i; 100];
        let delta = DeltaBuilder::new(content.len(), content.len() + tail.len())
            .copy(0, content.len() as u32)
            .insert(&tail)
            .build();
        content.extend_from_slice(&tail);
        let target = Object::blob(content.clone());
        prev_offset = writer.add_ofs_delta(target.id(), prev_offset, &delta)?;
        expected.push(target);
    }
    let path = writer.finish().write_to(&root)?;

    let pack = PackFile::open(&path, small_cache())?;
    for target in &expected {
        assert_eq!(&pack.get(&target.id(), &NoExternalBases)?, target);
    }
    pack.verify(&NoExternalBases)?;
    Ok(())
}

#[test]
fn test_ref_delta_within_pack() -> Result<()> {
    let (_tmp, root) = dir()?;
    let base = Object::blob("the quick brown fox");
    let target = Object::blob("quick slow brown fox");
    let delta = DeltaBuilder::new(19, 20)
        .copy(4, 6)
        .insert(b"slow ")
        .copy(10, 9)
        .build();

    let mut writer = PackWriter::new();
    // The delta may come before its base
    writer.add_ref_delta(target.id(), base.id(), &delta)?;
    writer.add(&base)?;
    let path = writer.finish().write_to(&root)?;

    let pack = PackFile::open(&path, small_cache())?;
    let resolved = pack.get(&target.id(), &NoExternalBases)?;
    assert_eq!(resolved.kind(), ObjectKind::Blob);
    assert_eq!(resolved, target);
    Ok(())
}

#[test]
fn test_ref_delta_cycle_is_corrupt_delta() -> Result<()> {
    let (_tmp, root) = dir()?;
    let a = Object::blob("aaaa").id();
    let b = Object::blob("bbbb").id();
    let delta = DeltaBuilder::new(4, 4).copy(0, 4).build();

    let mut writer = PackWriter::new();
    writer.add_ref_delta(a, b, &delta)?;
    writer.add_ref_delta(b, a, &delta)?;
    let path = writer.finish().write_to(&root)?;

    let pack = PackFile::open(&path, small_cache())?;
    let err = pack.get(&a, &NoExternalBases).unwrap_err();
    assert!(matches!(err, Error::CorruptDelta { .. }), "{err:?}");
    Ok(())
}

#[test]
fn test_missing_external_base_is_corrupt_delta() -> Result<()> {
    let (_tmp, root) = dir()?;
    let target = Object::blob("abcd");
    let delta = DeltaBuilder::new(4, 4).copy(0, 4).build();

    let mut writer = PackWriter::new();
    writer.add_ref_delta(target.id(), Object::blob("elsewhere").id(), &delta)?;
    let path = writer.finish().write_to(&root)?;

    let pack = PackFile::open(&path, small_cache())?;
    assert!(pack
        .get(&target.id(), &NoExternalBases)
        .unwrap_err()
        .is_corruption());
    Ok(())
}

#[test]
fn test_bad_trailer_is_invalid_pack() -> Result<()> {
    let (_tmp, root) = dir()?;
    let mut writer = PackWriter::new();
    writer.add(&Object::blob("hello\n"))?;
    let path = writer.finish().write_to(&root)?;

    let mut bytes = std::fs::read(&path)?;
    bytes[13] ^= 0x01;
    std::fs::write(&path, &bytes)?;

    let err = PackFile::open(&path, small_cache()).unwrap_err();
    assert!(
        matches!(&err, Error::InvalidPack { reason, .. } if reason.contains("trailer")),
        "{err:?}"
    );
    Ok(())
}

#[test]
fn test_index_for_another_pack_is_rejected() -> Result<()> {
    let (_tmp, root) = dir()?;
    let mut one = PackWriter::new();
    one.add(&Object::blob("one"))?;
    let one = one.finish();
    let mut two = PackWriter::new();
    two.add(&Object::blob("two"))?;
    let two = two.finish();

    let path = one.write_to(&root)?;
    std::fs::write(path.with_extension("idx"), &two.index)?;
    assert!(PackFile::open(&path, small_cache())
        .unwrap_err()
        .is_corruption());
    Ok(())
}

#[test]
fn test_resolve_gives_record_range() -> Result<()> {
    let (_tmp, root) = dir()?;
    let first = Object::blob("first");
    let second = Object::blob("second");
    let mut writer = PackWriter::new();
    let a = writer.add(&first)?;
    let b = writer.add(&second)?;
    let written = writer.finish();
    let total = written.pack.len() as u64;
    let path = written.write_to(&root)?;

    let pack = PackFile::open(&path, small_cache())?;
    assert_eq!(pack.resolve(&first.id())?, a..b);
    assert_eq!(pack.resolve(&second.id())?, b..total - 20);
    assert!(pack.resolve(&Object::blob("nope").id()).unwrap_err().is_not_found());
    Ok(())
}

#[test]
fn test_exhausted_address_space_is_out_of_memory() -> Result<()> {
    let (_tmp, root) = dir()?;
    let blob = Object::blob(noise(256 * 1024));
    let mut writer = PackWriter::new();
    writer.add(&blob)?;
    let path = writer.finish().write_to(&root)?;

    let refused = |_: &File, _: u64, _: usize| -> std::io::Result<memmap2::Mmap> {
        Err(std::io::Error::from_raw_os_error(libc::ENOMEM))
    };
    let cache = Arc::new(WindowCache::with_mapper(WindowCacheConfig::default(), Box::new(refused)));
    let err = PackFile::open(&path, cache).err().unwrap();
    assert!(matches!(err, Error::OutOfMemory { .. }), "{err:?}");

    // Once open, only the first window can still be mapped, so the entry header reads but
    // the inflate runs out
    let exhausted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&exhausted);
    let cache = Arc::new(WindowCache::with_mapper(
        WindowCacheConfig {
            window_size: 1,
            limit: 1,
        },
        Box::new(move |file: &File, start: u64, len: usize| {
            if start > 0 && flag.load(Ordering::SeqCst) {
                return Err(std::io::Error::from_raw_os_error(libc::ENOMEM));
            }
            map_window(file, start, len)
        }),
    ));
    let pack = PackFile::open(&path, cache)?;
    exhausted.store(true, Ordering::SeqCst);
    let err = pack.get(&blob.id(), &NoExternalBases).unwrap_err();
    assert!(matches!(err, Error::OutOfMemory { .. }), "{err:?}");
    assert!(!err.is_corruption());
    Ok(())
}

#[test]
fn test_parse_header() {
    assert_eq!(parse_header(b"PACK\0\0\0\x02\0\0\0\x05"), Ok((5, 2)));
    assert!(parse_header(b"PACK\0\0\0\x04\0\0\0\x05").is_err());
    assert!(parse_header(b"<html>\0\0\0\0\0\0").is_err());
}
