use std::path::Path;

use tempfile::tempdir;
use vettore::{
    CancelToken, CollectionSpec, Config, Engine, HnswParams, MetadataValue, Metric,
    SearchRequest, SyncPolicy, VectorRecord, VettoreError,
};

fn populate(engine: &Engine, name: &str) {
    engine
        .create_collection(CollectionSpec::new(name, 3, Metric::Euclidean))
        .expect("create");
    for i in 0..25 {
        let mut record =
            VectorRecord::new(format!("v{i}"), vec![i as f32, (i * 2) as f32, 0.5]);
        record.metadata.insert("n".into(), MetadataValue::Int(i));
        engine.insert(name, record).expect("insert");
    }
    engine
        .upsert(name, VectorRecord::new("v3", vec![-1.0, -2.0, -3.0]))
        .expect("upsert");
    engine.delete(name, "v7").expect("delete");
}

fn snapshot(engine: &Engine, name: &str) -> Vec<VectorRecord> {
    let mut records = Vec::new();
    for i in 0..25 {
        if let Ok(record) = engine.get(name, &format!("v{i}")) {
            records.push(record);
        }
    }
    records
}

#[test]
fn mutations_survive_close_and_open() {
    let dir = tempdir().expect("tempdir");
    let before = {
        let engine = Engine::open(dir.path(), Config::default()).expect("open");
        populate(&engine, "docs");
        let before = snapshot(&engine, "docs");
        engine.close().expect("close");
        before
    };
    let engine = Engine::open(dir.path(), Config::default()).expect("reopen");
    let after = snapshot(&engine, "docs");
    assert_eq!(before, after);
    assert!(matches!(
        engine.get("docs", "v7"),
        Err(VettoreError::NotFound(_))
    ));
    let info = &engine.list_collections()[0];
    assert_eq!(info.vector_count, 24);
    assert_eq!(info.tombstone_count, 2);
}

#[test]
fn batch_and_never_policies_are_durable_after_close() {
    for policy in [SyncPolicy::batch(), SyncPolicy::Never] {
        let dir = tempdir().expect("tempdir");
        let config = Config {
            sync_policy: policy,
            ..Config::default()
        };
        {
            let engine = Engine::open(dir.path(), config.clone()).expect("open");
            populate(&engine, "docs");
            engine.close().expect("close");
        }
        let engine = Engine::open(dir.path(), config).expect("reopen");
        assert_eq!(
            engine.get("docs", "v3").expect("get").vector,
            vec![-1.0, -2.0, -3.0]
        );
    }
}

#[test]
fn hnsw_graph_reloads_and_answers_identically() {
    let dir = tempdir().expect("tempdir");
    let spec = CollectionSpec::new("vecs", 8, Metric::Cosine).with_hnsw_params(HnswParams {
        m: 8,
        ef_construction: 64,
        ef_search: 32,
        max_level: 16,
        seed: 42,
    });
    let query = vec![0.3f32; 8];
    let before: Vec<String> = {
        let engine = Engine::open(dir.path(), Config::default()).expect("open");
        engine.create_collection(spec).expect("create");
        for i in 0..200 {
            let vector: Vec<f32> = (0..8).map(|d| ((i * 7 + d * 13) % 17) as f32).collect();
            engine
                .insert("vecs", VectorRecord::new(format!("v{i}"), vector))
                .expect("insert");
        }
        let hits = engine
            .search("vecs", &SearchRequest::new(query.clone(), 10), &CancelToken::new())
            .expect("search");
        engine.close().expect("close");
        hits.into_iter().map(|hit| hit.id).collect()
    };
    let engine = Engine::open(dir.path(), Config::default()).expect("reopen");
    let after: Vec<String> = engine
        .search("vecs", &SearchRequest::new(query, 10), &CancelToken::new())
        .expect("search")
        .into_iter()
        .map(|hit| hit.id)
        .collect();
    assert_eq!(before, after);
}

#[test]
fn compaction_persists_across_reopen() {
    let dir = tempdir().expect("tempdir");
    {
        let engine = Engine::open(dir.path(), Config::default()).expect("open");
        populate(&engine, "docs");
        engine.compact("docs", &CancelToken::new()).expect("compact");
        let info = &engine.list_collections()[0];
        assert_eq!(info.tombstone_count, 0);
        engine.close().expect("close");
    }
    let engine = Engine::open(dir.path(), Config::default()).expect("reopen");
    let info = &engine.list_collections()[0];
    assert_eq!(info.vector_count, 24);
    assert_eq!(info.tombstone_count, 0);
    assert_eq!(
        engine.get("docs", "v3").expect("get").vector,
        vec![-1.0, -2.0, -3.0]
    );
}

#[test]
fn expected_files_exist_on_disk() {
    let dir = tempdir().expect("tempdir");
    let engine = Engine::open(dir.path(), Config::default()).expect("open");
    engine
        .create_collection(
            CollectionSpec::new("flatc", 2, Metric::Euclidean),
        )
        .expect("create flat");
    engine
        .create_collection(
            CollectionSpec::new("hnswc", 2, Metric::Euclidean)
                .with_hnsw_params(HnswParams::default()),
        )
        .expect("create hnsw");
    engine
        .insert("flatc", VectorRecord::new("a", vec![0.0, 1.0]))
        .expect("insert");
    engine
        .insert("hnswc", VectorRecord::new("a", vec![0.0, 1.0]))
        .expect("insert");
    engine.flush().expect("flush");

    let exists = |name: &str, file: &str| Path::new(&dir.path().join(name).join(file)).exists();
    assert!(exists("flatc", "collection.meta"));
    assert!(exists("flatc", "vectors.data"));
    assert!(!exists("flatc", "index.data"));
    assert!(exists("flatc", "free.list"));
    assert!(exists("hnswc", "collection.meta"));
    assert!(exists("hnswc", "vectors.data"));
    assert!(exists("hnswc", "index.data"));
}

#[test]
fn epoch_is_monotonic_across_reopen() {
    let dir = tempdir().expect("tempdir");
    let epoch_before = {
        let engine = Engine::open(dir.path(), Config::default()).expect("open");
        populate(&engine, "docs");
        let epoch = engine.list_collections()[0].epoch;
        engine.close().expect("close");
        epoch
    };
    assert!(epoch_before >= 27);
    let engine = Engine::open(dir.path(), Config::default()).expect("reopen");
    assert_eq!(engine.list_collections()[0].epoch, epoch_before);
    engine
        .insert("docs", VectorRecord::new("new", vec![0.0, 0.0, 0.0]))
        .expect("insert");
    assert_eq!(engine.list_collections()[0].epoch, epoch_before + 1);
}
