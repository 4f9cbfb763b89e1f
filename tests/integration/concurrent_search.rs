use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tempfile::tempdir;
use vettore::{
    CancelToken, CollectionSpec, Config, Engine, Metric, SearchRequest, VectorRecord,
};

fn vector_for(i: usize) -> Vec<f32> {
    vec![i as f32, (i % 7) as f32, 1.0]
}

#[test]
fn concurrent_inserts_and_searches_stay_coherent() {
    let dir = tempdir().expect("tempdir");
    let config = Config {
        sync_policy: vettore::SyncPolicy::Never,
        ..Config::default()
    };
    let engine = Engine::open(dir.path(), config).expect("open");
    engine
        .create_collection(CollectionSpec::new("docs", 3, Metric::Euclidean))
        .expect("create");

    const WRITERS: usize = 4;
    const PER_WRITER: usize = 50;
    let stop = AtomicBool::new(false);

    thread::scope(|scope| {
        for writer in 0..WRITERS {
            let engine = &engine;
            scope.spawn(move || {
                for i in 0..PER_WRITER {
                    let id = writer * PER_WRITER + i;
                    engine
                        .insert("docs", VectorRecord::new(format!("v{id}"), vector_for(id)))
                        .expect("insert");
                }
            });
        }
        for _ in 0..2 {
            let engine = &engine;
            let stop = &stop;
            scope.spawn(move || {
                let token = CancelToken::new();
                let mut last_count = 0usize;
                while !stop.load(Ordering::Acquire) {
                    let hits = engine
                        .search(
                            "docs",
                            &SearchRequest::new(vec![0.0, 0.0, 1.0], 500),
                            &token,
                        )
                        .expect("search");
                    // snapshots only ever grow
                    assert!(hits.len() >= last_count);
                    last_count = hits.len();
                }
            });
        }
        // release the readers once every writer id is visible
        let token = CancelToken::new();
        loop {
            let hits = engine
                .search(
                    "docs",
                    &SearchRequest::new(vec![0.0, 0.0, 1.0], 500),
                    &token,
                )
                .expect("search");
            if hits.len() == WRITERS * PER_WRITER {
                break;
            }
            thread::yield_now();
        }
        stop.store(true, Ordering::Release);
    });

    // final state matches a single-threaded replay of the same inserts
    let replay_dir = tempdir().expect("tempdir");
    let replay = Engine::open(replay_dir.path(), Config::default()).expect("open replay");
    replay
        .create_collection(CollectionSpec::new("docs", 3, Metric::Euclidean))
        .expect("create");
    for id in 0..WRITERS * PER_WRITER {
        replay
            .insert("docs", VectorRecord::new(format!("v{id}"), vector_for(id)))
            .expect("insert");
    }
    let token = CancelToken::new();
    let request = SearchRequest::new(vec![0.0, 0.0, 1.0], 20);
    let concurrent: Vec<(String, f32)> = engine
        .search("docs", &request, &token)
        .expect("search")
        .into_iter()
        .map(|hit| (hit.id, hit.distance))
        .collect();
    let replayed: Vec<(String, f32)> = replay
        .search("docs", &request, &token)
        .expect("search")
        .into_iter()
        .map(|hit| (hit.id, hit.distance))
        .collect();
    let concurrent_ids: Vec<&String> = concurrent.iter().map(|(id, _)| id).collect();
    let replayed_ids: Vec<&String> = replayed.iter().map(|(id, _)| id).collect();
    assert_eq!(concurrent_ids, replayed_ids);
}

#[test]
fn concurrent_deletes_never_resurface() {
    let dir = tempdir().expect("tempdir");
    let config = Config {
        sync_policy: vettore::SyncPolicy::Never,
        ..Config::default()
    };
    let engine = Engine::open(dir.path(), config).expect("open");
    engine
        .create_collection(CollectionSpec::new("docs", 3, Metric::Euclidean))
        .expect("create");
    for id in 0..100 {
        engine
            .insert("docs", VectorRecord::new(format!("v{id}"), vector_for(id)))
            .expect("insert");
    }

    thread::scope(|scope| {
        let engine = &engine;
        scope.spawn(move || {
            for id in (0..100).step_by(2) {
                engine.delete("docs", &format!("v{id}")).expect("delete");
            }
        });
        scope.spawn(move || {
            let token = CancelToken::new();
            for _ in 0..50 {
                let hits = engine
                    .search(
                        "docs",
                        &SearchRequest::new(vec![0.0, 0.0, 1.0], 200),
                        &token,
                    )
                    .expect("search");
                assert!(hits.len() >= 50);
            }
        });
    });

    let token = CancelToken::new();
    let hits = engine
        .search(
            "docs",
            &SearchRequest::new(vec![0.0, 0.0, 1.0], 200),
            &token,
        )
        .expect("search");
    assert_eq!(hits.len(), 50);
    assert!(hits
        .iter()
        .all(|hit| hit.id.trim_start_matches('v').parse::<usize>().expect("id") % 2 == 1));
}

#[test]
fn coalesced_searches_share_one_computation() {
    let dir = tempdir().expect("tempdir");
    let engine = Engine::open(dir.path(), Config::default()).expect("open");
    engine
        .create_collection(CollectionSpec::new("docs", 3, Metric::Euclidean))
        .expect("create");
    for id in 0..200 {
        engine
            .insert("docs", VectorRecord::new(format!("v{id}"), vector_for(id)))
            .expect("insert");
    }

    let request = SearchRequest::new(vec![0.0, 0.0, 1.0], 10);
    thread::scope(|scope| {
        for _ in 0..8 {
            let engine = &engine;
            let request = &request;
            scope.spawn(move || {
                let token = CancelToken::new();
                let hits = engine.search("docs", request, &token).expect("search");
                assert_eq!(hits.len(), 10);
            });
        }
    });
    let stats = engine.stats();
    assert!(stats.result_cache.hits + stats.result_cache.coalesced >= 1);
}
