//! Downloader behaviour against an in-memory source
//!
//! Covers single-flight, resume, checksum enforcement, source fallback,
//! eviction and cancellation through the public service API.

mod common;

use common::{Fault, MemoryBackend, config, model, service, source_for};
use model_cache::{CacheError, ErrorKind, ModelKey};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const WEIGHTS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn key(id: &str) -> ModelKey {
    ModelKey::new(id, "fp16")
}

#[tokio::test]
async fn test_second_ensure_is_a_cache_hit() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    backend.put(&source_for("org/a"), WEIGHTS);
    let svc = service(&config(dir.path(), 1_000, vec![model("org/a", WEIGHTS)]), &backend).await;

    let first = svc.ensure("org/a", None).await.unwrap();
    let second = svc.ensure("org/a", Some("fp16")).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(std::fs::read(&first).unwrap(), WEIGHTS);
    assert!(first.ends_with("models--org--a/fp16/model.bin"));
    assert_eq!(backend.fetches(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_download() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::with_delay(Duration::from_millis(100)));
    backend.put(&source_for("org/a"), WEIGHTS);
    let svc = Arc::new(
        service(&config(dir.path(), 1_000, vec![model("org/a", WEIGHTS)]), &backend).await,
    );

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.ensure("org/a", None).await })
        })
        .collect();

    let paths: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    assert!(paths.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(backend.fetches(), 1);
    assert_eq!(svc.downloader().in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_failure() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::with_delay(Duration::from_millis(100)));
    backend.put(&source_for("org/a"), WEIGHTS);

    let mut entry = model("org/a", WEIGHTS);
    entry.sha256 = common::sha256_hex(b"not these weights");
    let svc = Arc::new(service(&config(dir.path(), 1_000, vec![entry]), &backend).await);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.ensure("org/a", None).await })
        })
        .collect();

    let kinds: Vec<ErrorKind> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap_err().kind())
        .collect();

    assert_eq!(kinds, vec![ErrorKind::ChecksumMismatch; 8]);
    assert_eq!(backend.fetches(), 1);
    assert_eq!(svc.downloader().in_flight(), 0);
    assert!(svc.cache().lookup(&key("org/a")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_checksum_mismatch_leaves_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    backend.put(&source_for("org/a"), WEIGHTS);

    let mut entry = model("org/a", WEIGHTS);
    entry.sha256 = common::sha256_hex(b"something else entirely");
    let svc = service(&config(dir.path(), 1_000, vec![entry]), &backend).await;

    let err = svc.ensure("org/a", None).await.unwrap_err();
    assert!(matches!(err, CacheError::ChecksumMismatch { .. }), "{err:?}");

    assert!(svc.cache().lookup(&key("org/a")).await.unwrap().is_none());
    assert!(!svc.cache().layout().temp_path(&key("org/a")).exists());
}

#[tokio::test]
async fn test_oversized_source_is_a_checksum_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let mut longer = WEIGHTS.to_vec();
    longer.extend_from_slice(b"trailing garbage");
    backend.put(&source_for("org/a"), longer);
    let svc = service(&config(dir.path(), 1_000, vec![model("org/a", WEIGHTS)]), &backend).await;

    let err = svc.ensure("org/a", None).await.unwrap_err();
    assert!(matches!(err, CacheError::ChecksumMismatch { .. }), "{err:?}");
    assert!(!svc.cache().layout().temp_path(&key("org/a")).exists());
}

#[tokio::test]
async fn test_interrupted_stream_resumes_from_written_offset() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    backend.put(&source_for("org/a"), WEIGHTS);
    backend.push_fault(Fault::CutAfter(10));
    let svc = service(&config(dir.path(), 1_000, vec![model("org/a", WEIGHTS)]), &backend).await;

    let path = svc.ensure("org/a", None).await.unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), WEIGHTS);
    let starts: Vec<u64> = backend.ranges().iter().map(|r| r.start).collect();
    assert_eq!(starts, vec![0, 10]);
}

#[tokio::test]
async fn test_transient_failures_exhaust_retries() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    backend.put(&source_for("org/a"), WEIGHTS);
    // First attempt plus three retries
    for _ in 0..4 {
        backend.push_fault(Fault::Unavailable);
    }
    let svc = service(&config(dir.path(), 1_000, vec![model("org/a", WEIGHTS)]), &backend).await;

    let err = svc.ensure("org/a", None).await.unwrap_err();
    assert!(matches!(err, CacheError::SourceUnavailable { .. }), "{err:?}");
    assert!(err.is_retryable());
    assert_eq!(backend.fetches(), 4);

    // Faults used up: the next call succeeds
    svc.ensure("org/a", None).await.unwrap();
}

#[tokio::test]
async fn test_progress_on_last_retry_earns_another_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    backend.put(&source_for("org/a"), WEIGHTS);
    for _ in 0..3 {
        backend.push_fault(Fault::Unavailable);
    }
    // Final allowed retry makes progress before failing
    backend.push_fault(Fault::CutAfter(8));
    let svc = service(&config(dir.path(), 1_000, vec![model("org/a", WEIGHTS)]), &backend).await;

    let path = svc.ensure("org/a", None).await.unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), WEIGHTS);
    let starts: Vec<u64> = backend.ranges().iter().map(|r| r.start).collect();
    assert_eq!(starts, vec![0, 0, 0, 0, 8]);
}

#[tokio::test]
async fn test_unknown_model_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let svc = service(&config(dir.path(), 1_000, vec![model("org/a", WEIGHTS)]), &backend).await;

    let err = svc.ensure("org/unknown", None).await.unwrap_err();
    assert!(matches!(err, CacheError::NotFound { .. }), "{err:?}");

    let err = svc.ensure("org/a", Some("int8")).await.unwrap_err();
    assert!(matches!(err, CacheError::NotFound { .. }), "{err:?}");
    assert_eq!(backend.fetches(), 0);
}

#[tokio::test]
async fn test_absent_from_every_source_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let svc = service(&config(dir.path(), 1_000, vec![model("org/a", WEIGHTS)]), &backend).await;

    let err = svc.ensure("org/a", None).await.unwrap_err();
    assert!(matches!(err, CacheError::NotFound { .. }), "{err:?}");
}

#[tokio::test]
async fn test_falls_back_to_next_source() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let mirror = "https://mirror.test/org/a/model.bin";
    backend.put(mirror, WEIGHTS);

    let mut entry = model("org/a", WEIGHTS);
    entry.sources.push(mirror.to_string());
    let svc = service(&config(dir.path(), 1_000, vec![entry]), &backend).await;

    let path = svc.ensure("org/a", None).await.unwrap();
    assert_eq!(std::fs::read(path).unwrap(), WEIGHTS);
    assert_eq!(backend.fetches(), 2);
}

#[tokio::test]
async fn test_model_larger_than_budget() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    backend.put(&source_for("org/a"), WEIGHTS);
    let svc = service(&config(dir.path(), 10, vec![model("org/a", WEIGHTS)]), &backend).await;

    let err = svc.ensure("org/a", None).await.unwrap_err();
    assert!(matches!(err, CacheError::InsufficientSpace { .. }), "{err:?}");
    assert_eq!(backend.fetches(), 0);
}

#[tokio::test]
async fn test_install_evicts_least_recently_used() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let models: Vec<_> = ["org/a", "org/b", "org/c"]
        .iter()
        .map(|id| {
            backend.put(&source_for(id), WEIGHTS);
            model(id, WEIGHTS)
        })
        .collect();
    // Room for two entries
    let budget = 2 * WEIGHTS.len() as u64;
    let svc = service(&config(dir.path(), budget, models), &backend).await;

    svc.ensure("org/a", None).await.unwrap();
    svc.ensure("org/b", None).await.unwrap();
    // Hit refreshes A
    svc.ensure("org/a", None).await.unwrap();
    svc.ensure("org/c", None).await.unwrap();

    let cache = svc.cache();
    assert!(cache.lookup(&key("org/a")).await.unwrap().is_some());
    assert!(cache.lookup(&key("org/b")).await.unwrap().is_none());
    assert!(cache.lookup(&key("org/c")).await.unwrap().is_some());
    assert!(cache.total_size().await.unwrap() <= budget);
}

#[tokio::test]
async fn test_pinned_model_blocks_install() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    backend.put(&source_for("org/a"), WEIGHTS);
    backend.put(&source_for("org/b"), WEIGHTS);
    let models = vec![model("org/a", WEIGHTS), model("org/b", WEIGHTS)];
    let svc = service(&config(dir.path(), WEIGHTS.len() as u64, models), &backend).await;

    svc.ensure("org/a", None).await.unwrap();
    svc.cache().pin(&key("org/a")).await.unwrap();

    let err = svc.ensure("org/b", None).await.unwrap_err();
    assert!(matches!(err, CacheError::InsufficientSpace { .. }), "{err:?}");
    assert!(svc.cache().lookup(&key("org/a")).await.unwrap().is_some());
    assert!(!svc.cache().layout().temp_path(&key("org/b")).exists());
}

#[tokio::test]
async fn test_unverified_entry_is_downloaded_again() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    backend.put(&source_for("org/a"), WEIGHTS);
    let svc = service(&config(dir.path(), 1_000, vec![model("org/a", WEIGHTS)]), &backend).await;

    let path = svc.ensure("org/a", None).await.unwrap();
    let mut corrupted = WEIGHTS.to_vec();
    corrupted[0] ^= 0xff;
    std::fs::write(&path, &corrupted).unwrap();
    assert!(!svc.cache().reverify(&key("org/a")).await.unwrap().verified);

    let path = svc.ensure("org/a", None).await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), WEIGHTS);
    assert_eq!(backend.fetches(), 2);
    assert!(svc.cache().lookup(&key("org/a")).await.unwrap().unwrap().verified);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_services_on_one_root_fetch_once() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::with_delay(Duration::from_millis(100)));
    backend.put(&source_for("org/a"), WEIGHTS);
    let cfg = config(dir.path(), 1_000, vec![model("org/a", WEIGHTS)]);

    // Separate flight tables; only the lock files coordinate them
    let first = service(&cfg, &backend).await;
    let second = service(&cfg, &backend).await;

    let (a, b) = tokio::join!(first.ensure("org/a", None), second.ensure("org/a", None));
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(backend.fetches(), 1);
}

#[tokio::test]
async fn test_cancelled_caller_aborts_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    backend.put(&source_for("org/a"), WEIGHTS);
    backend.push_fault(Fault::StallAfter(8));
    let svc = service(&config(dir.path(), 1_000, vec![model("org/a", WEIGHTS)]), &backend).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = svc
        .ensure_with_cancel("org/a", None, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Aborted { .. }), "{err:?}");

    // The job notices the cancellation and removes its scratch file
    let temp = svc.cache().layout().temp_path(&key("org/a"));
    for _ in 0..100 {
        if !temp.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!temp.exists());
    assert_eq!(svc.downloader().in_flight(), 0);
    assert!(svc.cache().lookup(&key("org/a")).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_cancelled_caller_does_not_stop_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::with_delay(Duration::from_millis(150)));
    backend.put(&source_for("org/a"), WEIGHTS);
    let svc = Arc::new(
        service(&config(dir.path(), 1_000, vec![model("org/a", WEIGHTS)]), &backend).await,
    );

    let patient = {
        let svc = Arc::clone(&svc);
        tokio::spawn(async move { svc.ensure("org/a", None).await })
    };

    let cancel = CancellationToken::new();
    let impatient = {
        let svc = Arc::clone(&svc);
        let cancel = cancel.clone();
        tokio::spawn(async move { svc.ensure_with_cancel("org/a", None, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();

    assert!(matches!(
        impatient.await.unwrap(),
        Err(CacheError::Aborted { .. })
    ));
    let path = patient.await.unwrap().unwrap();
    assert_eq!(std::fs::read(path).unwrap(), WEIGHTS);
    assert_eq!(backend.fetches(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_startup_recovery_keeps_partial_of_running_download() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    backend.put(&source_for("org/a"), WEIGHTS);
    backend.push_fault(Fault::StallAfter(8));
    let mut cfg = config(dir.path(), 1_000, vec![model("org/a", WEIGHTS)]);
    cfg.orphan_grace_secs = 0;

    let first = Arc::new(service(&cfg, &backend).await);
    let cancel = CancellationToken::new();
    let stalled = {
        let svc = Arc::clone(&first);
        let cancel = cancel.clone();
        tokio::spawn(async move { svc.ensure_with_cancel("org/a", None, &cancel).await })
    };

    let temp = first.cache().layout().temp_path(&key("org/a"));
    for _ in 0..100 {
        if std::fs::metadata(&temp).is_ok_and(|m| m.len() == 8) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(temp.exists());

    // A second process starting on the same root runs recovery
    let second = service(&cfg, &backend).await;
    assert!(temp.exists());
    assert!(second.cache().lookup(&key("org/a")).await.unwrap().is_none());

    cancel.cancel();
    assert!(matches!(
        stalled.await.unwrap(),
        Err(CacheError::Aborted { .. })
    ));
}

#[tokio::test]
async fn test_partial_from_previous_run_is_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    backend.put(&source_for("org/a"), WEIGHTS);
    let cfg = config(dir.path(), 1_000, vec![model("org/a", WEIGHTS)]);

    // Scratch file left by a crashed process, younger than the grace period
    let temp = dir.path().join("tmp/models--org--a--fp16.partial");
    std::fs::create_dir_all(temp.parent().unwrap()).unwrap();
    std::fs::write(&temp, &WEIGHTS[..12]).unwrap();

    let svc = service(&cfg, &backend).await;
    let path = svc.ensure("org/a", None).await.unwrap();

    assert_eq!(std::fs::read(path).unwrap(), WEIGHTS);
    let starts: Vec<u64> = backend.ranges().iter().map(|r| r.start).collect();
    assert_eq!(starts, vec![12]);
}
