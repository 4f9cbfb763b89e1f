use tempfile::tempdir;
use vettore::{
    CancelToken, CollectionSpec, Config, Engine, HnswParams, MetadataValue, Metric,
    SearchRequest, VectorRecord, VettoreError,
};

#[test]
fn create_insert_get_delete_cycle() {
    let dir = tempdir().expect("tempdir");
    let engine = Engine::open(dir.path(), Config::default()).expect("open engine");
    engine
        .create_collection(CollectionSpec::new("docs", 3, Metric::Euclidean))
        .expect("create");

    let mut record = VectorRecord::new("first", vec![1.0, 2.0, 3.0]);
    record
        .metadata
        .insert("source".into(), MetadataValue::String("unit".into()));
    engine.insert("docs", record.clone()).expect("insert");

    let fetched = engine.get("docs", "first").expect("get");
    assert_eq!(fetched.vector, vec![1.0, 2.0, 3.0]);
    assert_eq!(
        fetched.metadata.get("source"),
        Some(&MetadataValue::String("unit".into()))
    );
    assert!(fetched.created_at > 0);

    engine.delete("docs", "first").expect("delete");
    assert!(matches!(
        engine.get("docs", "first"),
        Err(VettoreError::NotFound(_))
    ));
    assert!(matches!(
        engine.delete("docs", "first"),
        Err(VettoreError::NotFound(_))
    ));
}

#[test]
fn invalid_specs_are_rejected() {
    let dir = tempdir().expect("tempdir");
    let engine = Engine::open(dir.path(), Config::default()).expect("open engine");

    let cases = [
        CollectionSpec::new("", 4, Metric::Cosine),
        CollectionSpec::new("bad name", 4, Metric::Cosine),
        CollectionSpec::new("x".repeat(65), 4, Metric::Cosine),
        CollectionSpec::new("docs", 0, Metric::Cosine),
        CollectionSpec::new("docs", 4, Metric::Cosine).with_page_size(1000),
        CollectionSpec::new("docs", 4, Metric::Cosine).with_hnsw_params(HnswParams {
            m: 1,
            ..HnswParams::default()
        }),
    ];
    for spec in cases {
        assert!(
            matches!(
                engine.create_collection(spec.clone()),
                Err(VettoreError::InvalidSpec(_))
            ),
            "spec should be invalid: {spec:?}"
        );
    }
    assert!(engine.list_collections().is_empty());
}

#[test]
fn duplicate_id_and_dimension_errors_surface() {
    let dir = tempdir().expect("tempdir");
    let engine = Engine::open(dir.path(), Config::default()).expect("open engine");
    engine
        .create_collection(CollectionSpec::new("docs", 2, Metric::Cosine))
        .expect("create");
    engine
        .insert("docs", VectorRecord::new("a", vec![1.0, 0.0]))
        .expect("insert");
    assert!(matches!(
        engine.insert("docs", VectorRecord::new("a", vec![0.0, 1.0])),
        Err(VettoreError::AlreadyExists(_))
    ));
    assert!(matches!(
        engine.insert("docs", VectorRecord::new("b", vec![0.0, 1.0, 2.0])),
        Err(VettoreError::DimensionMismatch {
            expected: 2,
            actual: 3
        })
    ));
    assert!(matches!(
        engine.search(
            "docs",
            &SearchRequest::new(vec![1.0], 1),
            &CancelToken::new()
        ),
        Err(VettoreError::DimensionMismatch { .. })
    ));
}

#[test]
fn drop_then_recreate_starts_empty() {
    let dir = tempdir().expect("tempdir");
    let engine = Engine::open(dir.path(), Config::default()).expect("open engine");
    engine
        .create_collection(CollectionSpec::new("docs", 2, Metric::Cosine))
        .expect("create");
    engine
        .insert("docs", VectorRecord::new("a", vec![1.0, 0.0]))
        .expect("insert");
    engine.drop_collection("docs").expect("drop");
    assert!(!dir.path().join("docs").exists());

    engine
        .create_collection(CollectionSpec::new("docs", 2, Metric::Cosine))
        .expect("recreate");
    assert!(matches!(
        engine.get("docs", "a"),
        Err(VettoreError::NotFound(_))
    ));
    assert_eq!(engine.list_collections()[0].vector_count, 0);
}

#[test]
fn oversized_metadata_is_capacity_exceeded() {
    let dir = tempdir().expect("tempdir");
    let config = Config {
        max_metadata_bytes: 64,
        ..Config::default()
    };
    let engine = Engine::open(dir.path(), config).expect("open engine");
    engine
        .create_collection(CollectionSpec::new("docs", 2, Metric::Cosine))
        .expect("create");
    let mut record = VectorRecord::new("big", vec![0.0, 0.0]);
    record
        .metadata
        .insert("blob".into(), MetadataValue::String("x".repeat(128)));
    assert!(matches!(
        engine.insert("docs", record),
        Err(VettoreError::CapacityExceeded(_))
    ));
}

#[test]
fn custom_page_sizes_work_end_to_end() {
    let dir = tempdir().expect("tempdir");
    let engine = Engine::open(dir.path(), Config::default()).expect("open engine");
    for (name, page_size) in [("small", 512u32), ("large", 16_384)] {
        engine
            .create_collection(
                CollectionSpec::new(name, 8, Metric::Euclidean).with_page_size(page_size),
            )
            .expect("create");
        engine
            .insert(name, VectorRecord::new("v", vec![0.5; 8]))
            .expect("insert");
        assert_eq!(engine.get(name, "v").expect("get").vector, vec![0.5; 8]);
    }
}

#[test]
fn upsert_on_missing_id_inserts() {
    let dir = tempdir().expect("tempdir");
    let engine = Engine::open(dir.path(), Config::default()).expect("open engine");
    engine
        .create_collection(CollectionSpec::new("docs", 2, Metric::Cosine))
        .expect("create");
    engine
        .upsert("docs", VectorRecord::new("fresh", vec![1.0, 0.0]))
        .expect("upsert");
    assert_eq!(engine.get("docs", "fresh").expect("get").vector, vec![1.0, 0.0]);
}
