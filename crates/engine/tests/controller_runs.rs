//! End-to-end controller scenarios against the local transport.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use engine::{ControlEvent, Controller, JobSource, RunOptions, RunOutcome};
use fastcopy_core::{CopyJob, progress};
use transport::TransportConfig;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 241) as u8).collect()
}

/// Options wired to a temp dir so runs never touch the working directory.
fn options_in(dir: &Path, source: JobSource) -> RunOptions {
    let mut options = RunOptions::new(source);
    options.journal_path = Some(dir.join("fastcopy.journal"));
    options.recovery_dir = Some(dir.to_path_buf());
    options.quiet = true;
    options.transport = TransportConfig { verify_host_keys: false, ..TransportConfig::default() };
    options
}

async fn seed_file(path: &Path, data: &[u8]) {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.expect("parents");
    }
    tokio::fs::write(path, data).await.expect("seed");
}

#[tokio::test(flavor = "multi_thread")]
async fn single_file_run_completes_cleanly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("a.bin");
    let destination = dir.path().join("out/b.bin");
    let data = pattern(1_048_576);
    seed_file(&source, &data).await;

    let options = options_in(
        dir.path(),
        JobSource::SingleFile {
            source: source.clone(),
            destination: destination.display().to_string(),
        },
    );
    let journal_path = options.journal_path.clone().expect("journal path");

    let summary = Controller::new(options)
        .run(None, CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.outcome.exit_code().as_i32(), 0);
    assert_eq!(summary.jobs_produced, 1);
    assert_eq!(summary.jobs_completed, 1);
    assert_eq!(summary.jobs_failed, 0);
    assert_eq!(summary.bytes_transferred, data.len() as u64);
    assert_eq!(summary.recovery_path, None);

    assert_eq!(tokio::fs::read(&destination).await.expect("read"), data);

    // The journal holds nothing once every job completed.
    let journal = journal::Journal::open(&journal_path).expect("reopen journal");
    assert!(journal.resume().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn directory_run_mirrors_the_tree() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("src");
    let out = dir.path().join("dst");
    for name in ["one.bin", "nested/two.bin", "nested/deep/three.bin"] {
        seed_file(&root.join(name), &pattern(30_000)).await;
    }

    let options = options_in(
        dir.path(),
        JobSource::Directory {
            root: root.clone(),
            destination_root: out.display().to_string(),
        },
    );

    let summary = Controller::new(options)
        .run(None, CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.jobs_completed, 3);
    for name in ["one.bin", "nested/two.bin", "nested/deep/three.bin"] {
        let copied = tokio::fs::read(out.join(name)).await.expect("read");
        assert_eq!(copied, pattern(30_000));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn rate_limited_directory_run_respects_the_global_budget() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("src");
    let out = dir.path().join("dst");
    // 200 KiB total at 100 KiB/s: the shared burst covers half, so the
    // run cannot finish in the first half second.
    for index in 0..4 {
        seed_file(&root.join(format!("f{index}.bin")), &pattern(50 * 1024)).await;
    }

    let mut options = options_in(
        dir.path(),
        JobSource::Directory {
            root: root.clone(),
            destination_root: out.display().to_string(),
        },
    );
    options.rate_limit = 100 * 1024;
    options.max_parallelism = 2;

    let started = std::time::Instant::now();
    let summary = Controller::new(options)
        .run(None, CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.jobs_completed, 4);
    assert!(
        started.elapsed() >= Duration::from_millis(500),
        "finished too fast for the configured rate: {:?}",
        started.elapsed()
    );
    for index in 0..4 {
        let copied = tokio::fs::read(out.join(format!("f{index}.bin"))).await.expect("read");
        assert_eq!(copied, pattern(50 * 1024));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn pause_freezes_transferred_bytes_until_resume() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("big.bin");
    let destination = dir.path().join("out.bin");
    let data = pattern(250 * 1024);
    seed_file(&source, &data).await;

    let mut options = options_in(
        dir.path(),
        JobSource::SingleFile {
            source: source.clone(),
            destination: destination.display().to_string(),
        },
    );
    // 100 KiB/s stretches the copy well past the pause window.
    options.rate_limit = 100 * 1024;

    let controller = Controller::new(options);
    let registry = controller.registry();
    let (controls_tx, controls_rx) = mpsc::channel(8);

    let run = tokio::spawn(controller.run(Some(controls_rx), CancellationToken::new()));

    tokio::time::sleep(Duration::from_millis(150)).await;
    controls_tx.send(ControlEvent::TogglePause).await.expect("pause");

    tokio::time::sleep(Duration::from_millis(250)).await;
    let frozen = progress::aggregate(&registry.snapshot()).total_bytes_transferred;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let still_frozen = progress::aggregate(&registry.snapshot()).total_bytes_transferred;
    assert_eq!(frozen, still_frozen, "bytes advanced while paused");

    controls_tx.send(ControlEvent::TogglePause).await.expect("resume");

    let summary = tokio::time::timeout(Duration::from_secs(30), run)
        .await
        .expect("run finished")
        .expect("task")
        .expect("run ok");
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(tokio::fs::read(&destination).await.expect("read"), data);
}

#[tokio::test(flavor = "multi_thread")]
async fn rate_retarget_takes_effect_mid_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("big.bin");
    let destination = dir.path().join("out.bin");
    // At the initial 64 KiB/s this would take ~15s past the burst.
    let data = pattern(1_048_576);
    seed_file(&source, &data).await;

    let mut options = options_in(
        dir.path(),
        JobSource::SingleFile {
            source: source.clone(),
            destination: destination.display().to_string(),
        },
    );
    options.rate_limit = 64 * 1024;

    let controller = Controller::new(options);
    let (controls_tx, controls_rx) = mpsc::channel(8);
    let run = tokio::spawn(controller.run(Some(controls_rx), CancellationToken::new()));

    tokio::time::sleep(Duration::from_millis(200)).await;
    controls_tx.send(ControlEvent::SetRateLimit(0)).await.expect("unlimit");

    let summary = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("finished promptly once unlimited")
        .expect("task")
        .expect("run ok");
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(tokio::fs::read(&destination).await.expect("read"), data);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_sftp_destination_is_dead_lettered_after_retries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("a.bin");
    seed_file(&source, &pattern(10_000)).await;

    // Port 1 on loopback refuses immediately: a classified network error.
    let mut options = options_in(
        dir.path(),
        JobSource::SingleFile {
            source: source.clone(),
            destination: "ssh://127.0.0.1:1/srv/a.bin".to_string(),
        },
    );
    options.max_retries = 2;

    let summary = Controller::new(options)
        .run(None, CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.jobs_failed, 1);
    let recovery_path = summary.recovery_path.expect("recovery file recorded");

    let records: Vec<_> = recovery::read_records(&recovery_path)
        .expect("read recovery")
        .collect::<Result<_, _>>()
        .expect("records parse");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].source, source.display().to_string());
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_on_error_fails_the_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("a.bin");
    seed_file(&source, &pattern(10_000)).await;

    let mut options = options_in(
        dir.path(),
        JobSource::SingleFile {
            source,
            destination: "ssh://127.0.0.1:1/srv/a.bin".to_string(),
        },
    );
    options.max_retries = 0;
    options.stop_on_error = true;

    let summary = Controller::new(options)
        .run(None, CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(summary.outcome.exit_code().as_i32(), 1);
    assert!(summary.first_error.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_on_error_still_reports_completed_work() {
    let dir = tempfile::tempdir().expect("tempdir");
    let good_source = dir.path().join("good.bin");
    let good_destination = dir.path().join("out/good.bin");
    let bad_source = dir.path().join("bad.bin");
    let data = pattern(40_000);
    seed_file(&good_source, &data).await;
    seed_file(&bad_source, &pattern(1_000)).await;

    // One worker: the local job lands before the refused ssh job aborts
    // the run.
    let list = format!(
        "{}|{}\n{}|ssh://127.0.0.1:1/srv/bad.bin\n",
        good_source.display(),
        good_destination.display(),
        bad_source.display(),
    );
    let list_path = dir.path().join("jobs.list");
    tokio::fs::write(&list_path, list).await.expect("write list");

    let mut options = options_in(dir.path(), JobSource::JobList { path: list_path });
    options.max_parallelism = 1;
    options.max_retries = 0;
    options.stop_on_error = true;

    let summary = Controller::new(options)
        .run(None, CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(summary.jobs_completed, 1);
    assert_eq!(summary.jobs_failed, 1);
    assert_eq!(summary.bytes_transferred, data.len() as u64);
    assert!(summary.first_error.is_some());
    assert_eq!(tokio::fs::read(&good_destination).await.expect("read"), data);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_jobs_keep_the_source_despite_delete_source() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("src");
    let marker = dir.path().join("done.marker");
    seed_file(&root.join("a.bin"), &pattern(2_000)).await;
    seed_file(&root.join("b.bin"), &pattern(3_000)).await;

    // Every job dead-letters against the refused port; the drain still
    // counts as Completed, but finalization must not fire.
    let mut options = options_in(
        dir.path(),
        JobSource::Directory {
            root: root.clone(),
            destination_root: "ssh://127.0.0.1:1/backup".to_string(),
        },
    );
    options.max_retries = 0;
    options.delete_source = true;
    options.on_completion = Some(format!("touch {}", marker.display()));

    let summary = Controller::new(options)
        .run(None, CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.jobs_failed, 2);
    assert!(summary.recovery_path.is_some());

    assert!(root.join("a.bin").exists());
    assert!(root.join("b.bin").exists());
    assert!(!marker.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_interrupts_the_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("big.bin");
    let destination = dir.path().join("out.bin");
    seed_file(&source, &pattern(512 * 1024)).await;

    let mut options = options_in(
        dir.path(),
        JobSource::SingleFile {
            source,
            destination: destination.display().to_string(),
        },
    );
    options.rate_limit = 64 * 1024;

    let cancel = CancellationToken::new();
    let run = tokio::spawn(Controller::new(options).run(None, cancel.clone()));

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("cancel is prompt")
        .expect("task")
        .expect("run ok");
    assert_eq!(summary.outcome, RunOutcome::Cancelled);
    assert_eq!(summary.outcome.exit_code().as_i32(), 130);
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_run_replays_the_recovery_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("a.bin");
    let destination = dir.path().join("out/a.bin");
    let data = pattern(20_000);
    seed_file(&source, &data).await;

    // A previous run dead-lettered this job; replay it against a now
    // reachable destination.
    let previous_run_dir = dir.path().join("prev");
    tokio::fs::create_dir_all(&previous_run_dir).await.expect("prev dir");
    let store = recovery::RecoveryStore::create_in(&previous_run_dir).expect("store");
    store.log_failure(
        &CopyJob::with_size(
            source.display().to_string(),
            destination.display().to_string(),
            data.len() as u64,
        ),
        &fastcopy_core::TransferError::network("host was down"),
        None,
    );
    store.flush().expect("flush");
    let store_path = store.path().to_path_buf();
    drop(store);

    let options = options_in(dir.path(), JobSource::RecoveryFile { path: store_path });
    let summary = Controller::new(options)
        .run(None, CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.jobs_completed, 1);
    assert_eq!(tokio::fs::read(&destination).await.expect("read"), data);
}

#[tokio::test(flavor = "multi_thread")]
async fn dry_run_enumerates_without_copying() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("src");
    let out = dir.path().join("dst");
    for name in ["a.bin", "b.bin", "c/d.bin"] {
        seed_file(&root.join(name), &pattern(1_000)).await;
    }

    let mut options = options_in(
        dir.path(),
        JobSource::Directory {
            root: root.clone(),
            destination_root: out.display().to_string(),
        },
    );
    options.dry_run = true;

    let summary = Controller::new(options)
        .run(None, CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.jobs_produced, 3);
    assert_eq!(summary.jobs_completed, 0);
    assert!(!out.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_source_removes_the_file_after_success() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("a.bin");
    let destination = dir.path().join("out.bin");
    let data = pattern(5_000);
    seed_file(&source, &data).await;

    let mut options = options_in(
        dir.path(),
        JobSource::SingleFile {
            source: source.clone(),
            destination: destination.display().to_string(),
        },
    );
    options.delete_source = true;

    let summary = Controller::new(options)
        .run(None, CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(tokio::fs::read(&destination).await.expect("read"), data);
    assert!(!source.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn completion_command_runs_after_a_successful_drain() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("a.bin");
    let destination = dir.path().join("out.bin");
    let marker = dir.path().join("done.marker");
    seed_file(&source, &pattern(1_000)).await;

    let mut options = options_in(
        dir.path(),
        JobSource::SingleFile {
            source,
            destination: destination.display().to_string(),
        },
    );
    options.on_completion = Some(format!("touch {}", marker.display()));

    let summary = Controller::new(options)
        .run(None, CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert!(marker.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn journal_entries_list_what_a_crashed_run_left_behind() {
    let dir = tempfile::tempdir().expect("tempdir");
    let journal_path = dir.path().join("fastcopy.journal");

    // Simulate a run that died mid-transfer: an entry updated, never
    // completed, and the process gone.
    {
        let journal = journal::Journal::open(&journal_path).expect("journal");
        journal.update("/src/big.iso", "/dst/big.iso", 209_715_200).expect("update");
        journal.flush().expect("flush");
    }

    let entries = engine::journal_entries(&journal_path).expect("entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].target, "/dst/big.iso");
    assert_eq!(entries[0].last_offset, 209_715_200);
}

#[tokio::test(flavor = "multi_thread")]
async fn job_list_run_copies_each_pair() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut list = String::from("# retry batch\n");
    let mut expected: Vec<(PathBuf, Vec<u8>)> = Vec::new();
    for index in 0..3 {
        let source = dir.path().join(format!("in-{index}.bin"));
        let destination = dir.path().join(format!("out/out-{index}.bin"));
        let data = pattern(10_000 + index);
        seed_file(&source, &data).await;
        list.push_str(&format!("{}|{}\n", source.display(), destination.display()));
        expected.push((destination, data));
    }
    let list_path = dir.path().join("jobs.list");
    tokio::fs::write(&list_path, list).await.expect("write list");

    let options = options_in(dir.path(), JobSource::JobList { path: list_path });
    let summary = Controller::new(options)
        .run(None, CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.jobs_completed, 3);
    for (destination, data) in expected {
        assert_eq!(tokio::fs::read(&destination).await.expect("read"), data);
    }
}
