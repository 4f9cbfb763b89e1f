use std::collections::HashSet;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;
use vettore::{
    CancelToken, CollectionSpec, Config, Engine, HnswParams, Metric, SearchRequest,
    VectorRecord,
};

const DIMS: usize = 16;
const VECTORS: usize = 2000;
const QUERIES: usize = 50;

fn random_vector(rng: &mut ChaCha8Rng) -> Vec<f32> {
    (0..DIMS).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

fn build_corpus(engine: &Engine, seed: u64) {
    engine
        .create_collection(CollectionSpec::new("oracle", DIMS, Metric::Cosine))
        .expect("create flat");
    engine
        .create_collection(
            CollectionSpec::new("graph", DIMS, Metric::Cosine).with_hnsw_params(HnswParams {
                m: 16,
                ef_construction: 200,
                ef_search: 50,
                max_level: 16,
                seed: 99,
            }),
        )
        .expect("create hnsw");
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    for i in 0..VECTORS {
        let vector = random_vector(&mut rng);
        engine
            .insert("oracle", VectorRecord::new(format!("v{i}"), vector.clone()))
            .expect("insert oracle");
        engine
            .insert("graph", VectorRecord::new(format!("v{i}"), vector))
            .expect("insert graph");
    }
}

#[test]
fn hnsw_recall_at_10_matches_flat_oracle() {
    let dir = tempdir().expect("tempdir");
    // result caching off so every query exercises the indexes
    let config = Config {
        result_cache_entries: 0,
        sync_policy: vettore::SyncPolicy::Never,
        ..Config::default()
    };
    let engine = Engine::open(dir.path(), config).expect("open");
    build_corpus(&engine, 7);

    let mut rng = ChaCha8Rng::seed_from_u64(1234);
    let token = CancelToken::new();
    let mut overlap_total = 0usize;
    for _ in 0..QUERIES {
        let query = random_vector(&mut rng);
        let mut exact_request = SearchRequest::new(query.clone(), 10);
        exact_request.include_metadata = false;
        let exact: HashSet<String> = engine
            .search("oracle", &exact_request, &token)
            .expect("flat search")
            .into_iter()
            .map(|hit| hit.id)
            .collect();
        let mut approx_request = SearchRequest::new(query, 10);
        approx_request.include_metadata = false;
        approx_request.ef_search = Some(200);
        let approx: Vec<String> = engine
            .search("graph", &approx_request, &token)
            .expect("hnsw search")
            .into_iter()
            .map(|hit| hit.id)
            .collect();
        overlap_total += approx.iter().filter(|id| exact.contains(*id)).count();
    }
    let recall = overlap_total as f64 / (QUERIES * 10) as f64;
    assert!(recall >= 0.95, "recall@10 too low: {recall:.3}");
}

#[test]
fn repeated_searches_return_identical_rankings() {
    let dir = tempdir().expect("tempdir");
    let config = Config {
        result_cache_entries: 0,
        sync_policy: vettore::SyncPolicy::Never,
        ..Config::default()
    };
    let engine = Engine::open(dir.path(), config).expect("open");
    build_corpus(&engine, 21);

    let mut rng = ChaCha8Rng::seed_from_u64(4321);
    let token = CancelToken::new();
    for _ in 0..10 {
        let query = random_vector(&mut rng);
        let mut request = SearchRequest::new(query, 10);
        request.ef_search = Some(100);
        let first: Vec<String> = engine
            .search("graph", &request, &token)
            .expect("search")
            .into_iter()
            .map(|hit| hit.id)
            .collect();
        let second: Vec<String> = engine
            .search("graph", &request, &token)
            .expect("search")
            .into_iter()
            .map(|hit| hit.id)
            .collect();
        assert_eq!(first, second);
    }
}

#[test]
fn flat_and_hnsw_agree_exactly_on_tiny_corpora() {
    let dir = tempdir().expect("tempdir");
    let engine = Engine::open(dir.path(), Config::default()).expect("open");
    engine
        .create_collection(CollectionSpec::new("oracle", 4, Metric::Euclidean))
        .expect("create flat");
    engine
        .create_collection(
            CollectionSpec::new("graph", 4, Metric::Euclidean)
                .with_hnsw_params(HnswParams::default()),
        )
        .expect("create hnsw");
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    for i in 0..40 {
        let vector: Vec<f32> = (0..4).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        engine
            .insert("oracle", VectorRecord::new(format!("v{i}"), vector.clone()))
            .expect("insert");
        engine
            .insert("graph", VectorRecord::new(format!("v{i}"), vector))
            .expect("insert");
    }
    let token = CancelToken::new();
    for _ in 0..10 {
        let query: Vec<f32> = (0..4).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        let mut request = SearchRequest::new(query, 5);
        request.ef_search = Some(64);
        let exact: Vec<String> = engine
            .search("oracle", &request, &token)
            .expect("flat")
            .into_iter()
            .map(|hit| hit.id)
            .collect();
        let approx: Vec<String> = engine
            .search("graph", &request, &token)
            .expect("hnsw")
            .into_iter()
            .map(|hit| hit.id)
            .collect();
        // with ef well above the corpus size the graph search is exhaustive
        assert_eq!(exact, approx);
    }
}
