use std::sync::Arc;
use std::time::Duration;

use indicatif::MultiProgress;

use chunkfill::checksum::ChecksumRecord;
use chunkfill::config::GenerationConfig;
use chunkfill::generate::{generate_file, RunError};
use chunkfill::pattern::Pattern;
use chunkfill::shutdown::{ShutdownCoordinator, ShutdownReason, ShutdownState};
use chunkfill::size_utils::KB;

fn config(output: &std::path::Path, size: u64, chunk: u64, pattern: Pattern, workers: usize) -> GenerationConfig {
    let mut config = GenerationConfig::new(output, size);
    config.chunk_size = chunk;
    config.pattern = pattern;
    config.workers = workers;
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ten_kib_of_zeroes() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("zero.bin");
    let cfg = config(&output, 10 * KB, 4 * KB, Pattern::Zero, 4);

    let summary = generate_file(&cfg, Arc::new(ShutdownCoordinator::new()), MultiProgress::new())
        .await
        .unwrap();

    let data = std::fs::read(&output).unwrap();
    assert_eq!(data.len(), 10_240);
    assert!(data.iter().all(|b| *b == 0));
    assert_eq!(summary.written, 10_240);

    let lengths: Vec<_> = summary.checksum.chunks.iter().map(|c| c.length).collect();
    assert_eq!(lengths, vec![4096, 4096, 2048]);

    let expected = blake3::hash(&[0u8; 10_240]).to_hex().to_string();
    assert_eq!(summary.checksum.digest, expected);

    let line = std::fs::read_to_string(ChecksumRecord::checksum_path(&output)).unwrap();
    assert_eq!(line, format!("{expected}  zero.bin\n"));
    assert!(!ChecksumRecord::manifest_path(&output).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn checksum_matches_file_contents_for_random_data() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("random.bin");
    let mut cfg = config(&output, 1_000_000, 64 * KB, Pattern::Random, 8);
    cfg.manifest = true;

    let summary = generate_file(&cfg, Arc::new(ShutdownCoordinator::new()), MultiProgress::new())
        .await
        .unwrap();

    let data = std::fs::read(&output).unwrap();
    assert_eq!(data.len(), 1_000_000);
    assert_eq!(summary.checksum.digest, blake3::hash(&data).to_hex().to_string());

    for chunk in &summary.checksum.chunks {
        let range = chunk.offset as usize..(chunk.offset + chunk.length) as usize;
        assert_eq!(chunk.digest, blake3::hash(&data[range]).to_hex().to_string());
    }

    let manifest: ChecksumRecord = serde_json::from_slice(
        &std::fs::read(ChecksumRecord::manifest_path(&output)).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest, summary.checksum);
}

#[tokio::test]
async fn single_worker_sequential_file() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("seq.bin");
    let cfg = config(&output, 5000, KB, Pattern::Sequential, 1);

    generate_file(&cfg, Arc::new(ShutdownCoordinator::new()), MultiProgress::new())
        .await
        .unwrap();

    let data = std::fs::read(&output).unwrap();
    assert!(data.iter().enumerate().all(|(i, b)| *b == (i % 256) as u8));
}

#[tokio::test]
async fn refuses_to_clobber_without_force() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("keep.bin");
    std::fs::write(&output, b"precious").unwrap();

    let cfg = config(&output, 4 * KB, KB, Pattern::Zero, 2);
    let err = generate_file(&cfg, Arc::new(ShutdownCoordinator::new()), MultiProgress::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Create(_)));
    assert_eq!(std::fs::read(&output).unwrap(), b"precious");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_before_run_reports_cancelled_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("stopped.bin");
    let cfg = config(&output, 64 * 1024 * KB, 64 * KB, Pattern::Random, 2);

    let coordinator = Arc::new(ShutdownCoordinator::new());
    coordinator.token().cancel();

    let err = generate_file(&cfg, coordinator.clone(), MultiProgress::new())
        .await
        .unwrap_err();
    assert!(err.is_cancelled(), "unexpected error {err}");
    assert_eq!(coordinator.state(), ShutdownState::Done);
    assert!(!ChecksumRecord::checksum_path(&output).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_during_writes_reports_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let mut cancelled = 0;

    for (i, delay_us) in [200u64, 500, 800, 1200, 1600, 2000, 2500, 3200].into_iter().enumerate() {
        let output = dir.path().join(format!("stop-{i}.bin"));
        let mut cfg = config(&output, 32 * 1024 * KB, 16 * KB, Pattern::Random, 8);
        cfg.force = true;

        let coordinator = Arc::new(ShutdownCoordinator::new());
        let run = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { generate_file(&cfg, coordinator, MultiProgress::new()).await })
        };

        tokio::time::sleep(Duration::from_micros(delay_us)).await;
        let report = coordinator.stop(ShutdownReason::Requested).await;

        match run.await.unwrap() {
            Err(err) => {
                assert!(err.is_cancelled(), "stop after {delay_us}us gave {err}");
                assert!(!ChecksumRecord::checksum_path(&output).exists());
                cancelled += 1;
            }
            // the run beat the stop to the finish line
            Ok(summary) => assert_eq!(summary.written, 32 * 1024 * KB),
        }
        if let Some(report) = report {
            assert_eq!(report.reason, ShutdownReason::Requested);
            assert!(report.cleanup_errors.is_empty());
        }
        assert_eq!(coordinator.state(), ShutdownState::Done);
    }
    assert!(cancelled > 0);
}
