use tempfile::tempdir;
use vettore::{
    CancelToken, CollectionSpec, Config, Engine, HnswParams, MetadataValue, Metric,
    SearchRequest, VectorRecord, VettoreError,
};

fn engine() -> (tempfile::TempDir, Engine) {
    let dir = tempdir().expect("tempdir");
    let engine = Engine::open(dir.path(), Config::default()).expect("open engine");
    (dir, engine)
}

#[test]
fn cosine_flat_ranks_exact_then_orthogonal() {
    let (_dir, engine) = engine();
    engine
        .create_collection(CollectionSpec::new("docs", 4, Metric::Cosine))
        .expect("create");
    engine
        .insert("docs", VectorRecord::new("a", vec![1.0, 0.0, 0.0, 0.0]))
        .expect("insert a");
    engine
        .insert("docs", VectorRecord::new("b", vec![0.0, 1.0, 0.0, 0.0]))
        .expect("insert b");

    let hits = engine
        .search(
            "docs",
            &SearchRequest::new(vec![1.0, 0.0, 0.0, 0.0], 2),
            &CancelToken::new(),
        )
        .expect("search");
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].id, "a");
    assert!(hits[0].distance.abs() < 1e-6);
    assert_eq!(hits[1].id, "b");
    assert!((hits[1].distance - 1.0).abs() < 1e-6);
}

#[test]
fn cosine_hnsw_agrees_on_top_hit() {
    let (_dir, engine) = engine();
    engine
        .create_collection(
            CollectionSpec::new("docs", 4, Metric::Cosine).with_hnsw_params(HnswParams {
                m: 16,
                ef_construction: 100,
                ..HnswParams::default()
            }),
        )
        .expect("create");
    engine
        .insert("docs", VectorRecord::new("a", vec![1.0, 0.0, 0.0, 0.0]))
        .expect("insert a");
    engine
        .insert("docs", VectorRecord::new("b", vec![0.0, 1.0, 0.0, 0.0]))
        .expect("insert b");

    let hits = engine
        .search(
            "docs",
            &SearchRequest::new(vec![1.0, 0.0, 0.0, 0.0], 2),
            &CancelToken::new(),
        )
        .expect("search");
    assert_eq!(hits[0].id, "a");
}

#[test]
fn upsert_then_search_finds_new_vector_at_distance_zero() {
    let (_dir, engine) = engine();
    engine
        .create_collection(CollectionSpec::new("docs", 3, Metric::Euclidean))
        .expect("create");
    engine
        .insert("docs", VectorRecord::new("x", vec![1.0, 2.0, 3.0]))
        .expect("insert");
    engine
        .upsert("docs", VectorRecord::new("x", vec![4.0, 5.0, 6.0]))
        .expect("upsert");

    assert_eq!(engine.get("docs", "x").expect("get").vector, vec![4.0, 5.0, 6.0]);
    let hits = engine
        .search(
            "docs",
            &SearchRequest::new(vec![4.0, 5.0, 6.0], 1),
            &CancelToken::new(),
        )
        .expect("search");
    assert_eq!(hits[0].id, "x");
    assert!(hits[0].distance.abs() < 1e-6);
}

#[test]
fn euclidean_grid_breaks_ties_by_insertion_order() {
    let (_dir, engine) = engine();
    engine
        .create_collection(CollectionSpec::new("grid", 2, Metric::Euclidean))
        .expect("create");
    for x in 0..5 {
        for y in 0..2 {
            engine
                .insert(
                    "grid",
                    VectorRecord::new(format!("p{x}_{y}"), vec![x as f32, y as f32]),
                )
                .expect("insert");
        }
    }
    let hits = engine
        .search(
            "grid",
            &SearchRequest::new(vec![0.0, 0.0], 3),
            &CancelToken::new(),
        )
        .expect("search");
    let ids: Vec<&str> = hits.iter().map(|hit| hit.id.as_str()).collect();
    // p0_1 and p1_0 are both at distance 1; p0_1 was inserted first and
    // holds the smaller slot.
    assert_eq!(ids, vec!["p0_0", "p0_1", "p1_0"]);
}

#[test]
fn filter_is_a_conjunction_of_exact_matches() {
    let (_dir, engine) = engine();
    engine
        .create_collection(CollectionSpec::new("docs", 2, Metric::Euclidean))
        .expect("create");
    for (id, lang, year) in [("a", "it", 2020i64), ("b", "it", 2021), ("c", "en", 2020)] {
        let mut record = VectorRecord::new(id, vec![0.0, 0.0]);
        record
            .metadata
            .insert("lang".into(), MetadataValue::String(lang.into()));
        record.metadata.insert("year".into(), MetadataValue::Int(year));
        engine.insert("docs", record).expect("insert");
    }
    let mut request = SearchRequest::new(vec![0.0, 0.0], 10);
    request
        .filter
        .insert("lang".into(), MetadataValue::String("it".into()));
    request.filter.insert("year".into(), MetadataValue::Int(2020));
    let hits = engine
        .search("docs", &request, &CancelToken::new())
        .expect("search");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "a");
}

#[test]
fn include_metadata_false_strips_but_still_filters() {
    let (_dir, engine) = engine();
    engine
        .create_collection(CollectionSpec::new("docs", 2, Metric::Euclidean))
        .expect("create");
    let mut record = VectorRecord::new("a", vec![0.0, 0.0]);
    record
        .metadata
        .insert("keep".into(), MetadataValue::Bool(true));
    engine.insert("docs", record).expect("insert");

    let mut request = SearchRequest::new(vec![0.0, 0.0], 1);
    request.include_metadata = false;
    request.filter.insert("keep".into(), MetadataValue::Bool(true));
    let hits = engine
        .search("docs", &request, &CancelToken::new())
        .expect("search");
    assert_eq!(hits.len(), 1);
    assert!(hits[0].metadata.is_none());
}

#[test]
fn min_score_filters_post_rank() {
    let (_dir, engine) = engine();
    engine
        .create_collection(CollectionSpec::new("docs", 2, Metric::Cosine))
        .expect("create");
    engine
        .insert("docs", VectorRecord::new("aligned", vec![1.0, 0.0]))
        .expect("insert");
    engine
        .insert("docs", VectorRecord::new("opposed", vec![-1.0, 0.0]))
        .expect("insert");
    let mut request = SearchRequest::new(vec![1.0, 0.0], 10);
    request.min_score = Some(0.9);
    let hits = engine
        .search("docs", &request, &CancelToken::new())
        .expect("search");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "aligned");
    assert!(hits[0].score > 0.9);
}

#[test]
fn deleted_records_never_appear_in_results() {
    let (_dir, engine) = engine();
    for (name, spec) in [
        ("flat", CollectionSpec::new("flat", 2, Metric::Euclidean)),
        (
            "hnsw",
            CollectionSpec::new("hnsw", 2, Metric::Euclidean)
                .with_hnsw_params(HnswParams::default()),
        ),
    ] {
        engine.create_collection(spec).expect("create");
        for i in 0..20 {
            engine
                .insert(name, VectorRecord::new(format!("v{i}"), vec![i as f32, 0.0]))
                .expect("insert");
        }
        engine.delete(name, "v0").expect("delete");
        let hits = engine
            .search(
                name,
                &SearchRequest::new(vec![0.0, 0.0], 20),
                &CancelToken::new(),
            )
            .expect("search");
        assert!(hits.iter().all(|hit| hit.id != "v0"));
        assert_eq!(hits.len(), 19);
    }
}

#[test]
fn search_multi_merges_and_truncates_globally() {
    let (_dir, engine) = engine();
    engine
        .create_collection(CollectionSpec::new("alpha", 2, Metric::Euclidean))
        .expect("create");
    engine
        .create_collection(CollectionSpec::new("beta", 2, Metric::Euclidean))
        .expect("create");
    engine
        .insert("alpha", VectorRecord::new("a1", vec![1.0, 0.0]))
        .expect("insert");
    engine
        .insert("alpha", VectorRecord::new("a2", vec![3.0, 0.0]))
        .expect("insert");
    engine
        .insert("beta", VectorRecord::new("b1", vec![2.0, 0.0]))
        .expect("insert");

    let hits = engine
        .search_multi(
            &["alpha", "beta"],
            &SearchRequest::new(vec![0.0, 0.0], 2),
            &CancelToken::new(),
        )
        .expect("multi");
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].id, "a1");
    assert_eq!(hits[1].id, "b1");

    assert!(matches!(
        engine.search_multi(
            &["alpha", "ghost"],
            &SearchRequest::new(vec![0.0, 0.0], 2),
            &CancelToken::new(),
        ),
        Err(VettoreError::NotFound(_))
    ));
}

#[test]
fn canceled_token_aborts_with_no_results() {
    let (_dir, engine) = engine();
    engine
        .create_collection(CollectionSpec::new("docs", 2, Metric::Euclidean))
        .expect("create");
    for i in 0..100 {
        engine
            .insert("docs", VectorRecord::new(format!("v{i}"), vec![i as f32, 0.0]))
            .expect("insert");
    }
    let token = CancelToken::new();
    token.cancel();
    assert!(matches!(
        engine.search("docs", &SearchRequest::new(vec![0.0, 0.0], 5), &token),
        Err(VettoreError::Canceled)
    ));
}

#[test]
fn k_bounds_are_validated() {
    let (_dir, engine) = engine();
    engine
        .create_collection(CollectionSpec::new("docs", 2, Metric::Euclidean))
        .expect("create");
    for k in [0usize, 10_001] {
        assert!(matches!(
            engine.search(
                "docs",
                &SearchRequest::new(vec![0.0, 0.0], k),
                &CancelToken::new()
            ),
            Err(VettoreError::InvalidSpec(_))
        ));
    }
}
