use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tempfile::tempdir;
use vettore::{
    CancelToken, CollectionSpec, Config, Engine, Metric, PageId, SearchRequest, VectorRecord,
    VettoreError,
};

const PAGE_SIZE: u64 = 4096;
const HDR_LEN: u64 = 32;

fn flip_byte(path: &Path, offset: u64) {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .expect("open data file");
    file.seek(SeekFrom::Start(offset)).expect("seek");
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).expect("read byte");
    byte[0] ^= 0x01;
    file.seek(SeekFrom::Start(offset)).expect("seek back");
    file.write_all(&byte).expect("write byte");
    file.sync_all().expect("sync");
}

fn seeded_dir() -> tempfile::TempDir {
    let dir = tempdir().expect("tempdir");
    let engine = Engine::open(dir.path(), Config::default()).expect("open");
    engine
        .create_collection(CollectionSpec::new("docs", 4, Metric::Cosine))
        .expect("create");
    for i in 1..=10 {
        engine
            .insert(
                "docs",
                VectorRecord::new(format!("r{i}"), vec![i as f32, 0.0, 0.0, 1.0]),
            )
            .expect("insert");
    }
    engine.close().expect("close");
    dir
}

#[test]
fn flipped_payload_byte_poisons_only_the_affected_slot() {
    let dir = seeded_dir();
    // each record chain occupies one page; the third insert landed in page 3
    flip_byte(
        &dir.path().join("docs").join("vectors.data"),
        3 * PAGE_SIZE + HDR_LEN + 20,
    );

    let engine = Engine::open(dir.path(), Config::default()).expect("reopen");
    // the collection still opens and healthy slots read fine
    assert_eq!(
        engine.get("docs", "r1").expect("get healthy").vector,
        vec![1.0, 0.0, 0.0, 1.0]
    );
    let err = engine.get("docs", "r3").unwrap_err();
    match err {
        VettoreError::Corruption { page_id, .. } => assert_eq!(page_id, PageId(3)),
        other => panic!("expected corruption, got {other:?}"),
    }
}

#[test]
fn corruption_quarantines_until_reopen() {
    let dir = seeded_dir();
    flip_byte(
        &dir.path().join("docs").join("vectors.data"),
        3 * PAGE_SIZE + HDR_LEN + 20,
    );
    let engine = Engine::open(dir.path(), Config::default()).expect("reopen");
    assert!(matches!(
        engine.get("docs", "r3"),
        Err(VettoreError::Corruption { .. })
    ));
    // quarantined: even healthy reads and writes now fail fast with the
    // same error kind
    assert!(matches!(
        engine.get("docs", "r1"),
        Err(VettoreError::Corruption { .. })
    ));
    assert!(matches!(
        engine.insert("docs", VectorRecord::new("new", vec![0.0; 4])),
        Err(VettoreError::Corruption { .. })
    ));
    assert!(matches!(
        engine.search(
            "docs",
            &SearchRequest::new(vec![0.0; 4], 1),
            &CancelToken::new()
        ),
        Err(VettoreError::Corruption { .. })
    ));
}

#[test]
fn verify_detects_a_flip_anywhere_in_a_payload() {
    for payload_offset in [0u64, 7, 512, 4000] {
        let dir = seeded_dir();
        flip_byte(
            &dir.path().join("docs").join("vectors.data"),
            5 * PAGE_SIZE + HDR_LEN + payload_offset,
        );
        let engine = Engine::open(dir.path(), Config::default()).expect("reopen");
        let err = engine.verify("docs").unwrap_err();
        assert!(
            matches!(err, VettoreError::Corruption { page_id, .. } if page_id == PageId(5)),
            "offset {payload_offset}: unexpected {err:?}"
        );
    }
}

#[test]
fn damaged_collection_meta_is_quarantined_at_discovery() {
    let dir = seeded_dir();
    flip_byte(&dir.path().join("docs").join("collection.meta"), HDR_LEN + 3);
    let engine = Engine::open(dir.path(), Config::default()).expect("engine still opens");
    assert!(engine.list_collections().is_empty());
    assert!(matches!(
        engine.get("docs", "r1"),
        Err(VettoreError::Corruption { .. })
    ));
}

#[test]
fn newer_format_version_is_refused_not_misread() {
    let dir = seeded_dir();
    let meta_path = dir.path().join("docs").join("collection.meta");
    // bump the on-disk format version in the page header
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&meta_path)
        .expect("open meta");
    file.seek(SeekFrom::Start(4)).expect("seek");
    let mut version = [0u8; 2];
    file.read_exact(&mut version).expect("read version");
    let bumped = u16::from_le_bytes(version) + 1;
    file.seek(SeekFrom::Start(4)).expect("seek back");
    file.write_all(&bumped.to_le_bytes()).expect("write");
    file.sync_all().expect("sync");

    let engine = Engine::open(dir.path(), Config::default()).expect("engine opens");
    assert!(matches!(
        engine.get("docs", "r1"),
        Err(VettoreError::UnsupportedVersion(_))
    ));
}

#[test]
fn corrupt_hnsw_index_rebuilds_from_store() {
    let dir = tempdir().expect("tempdir");
    {
        let engine = Engine::open(dir.path(), Config::default()).expect("open");
        engine
            .create_collection(
                CollectionSpec::new("vecs", 4, Metric::Euclidean)
                    .with_hnsw_params(vettore::HnswParams::default()),
            )
            .expect("create");
        for i in 0..30 {
            engine
                .insert(
                    "vecs",
                    VectorRecord::new(format!("v{i}"), vec![i as f32, 1.0, 2.0, 3.0]),
                )
                .expect("insert");
        }
        engine.close().expect("close");
    }
    flip_byte(
        &dir.path().join("vecs").join("index.data"),
        PAGE_SIZE + HDR_LEN + 4,
    );
    // the graph rebuilds from the vector store and searches still work
    let engine = Engine::open(dir.path(), Config::default()).expect("reopen");
    let hits = engine
        .search(
            "vecs",
            &SearchRequest::new(vec![0.0, 1.0, 2.0, 3.0], 1),
            &CancelToken::new(),
        )
        .expect("search after rebuild");
    assert_eq!(hits[0].id, "v0");
}
