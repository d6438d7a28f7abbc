//! End-to-end scenarios from the daemon's testable-properties list, wired
//! against the real leaf crates with the orchestrator driving them directly
//! — no watcher threads, no control-channel socket, no background ticker.

use std::collections::HashSet;
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;

use baseline_store::BaselineStore;
use guard_daemon::orchestrator::{Notifier, Orchestrator};
use guard_daemon::stats::Stats;
use integrity_engine::{compute_file_hashes, IntegrityEngine, RansomwareThresholds};
use mode_manager::{ModeManager, SystemMode};
use recovery_engine::RecoveryEngine;
use tempfile::TempDir;
use watcher::{WatchEvent, WatchEventType, Watcher};

/// Everything an individual scenario needs, all rooted under one temp dir
/// so backups, quarantine and the SQLite store never collide across tests.
struct Harness {
    _storage_dir: TempDir,
    store: Arc<BaselineStore>,
    mode_manager: Arc<ModeManager>,
    orchestrator: Orchestrator,
}

fn build_harness(thresholds: RansomwareThresholds, admins: HashSet<String>) -> Harness {
    let storage_dir = TempDir::new().unwrap();
    let store = Arc::new(BaselineStore::open(storage_dir.path().join("storage")).unwrap());
    let engine = Arc::new(IntegrityEngine::new(thresholds));
    let recovery = Arc::new(
        RecoveryEngine::new(
            storage_dir.path().join("backups"),
            storage_dir.path().join("quarantine"),
        )
        .unwrap(),
    );
    let mode_manager = Arc::new(ModeManager::new(admins));
    let stats = Arc::new(Stats::default());

    // The orchestrator only calls `pause()`/`resume()` on the watcher; this
    // harness never starts it, so those calls are inert flag flips.
    let watcher = Arc::new(Watcher::new(vec![], false, std::time::Duration::from_secs(60), |_| {}));
    let notifier: Arc<Notifier> = Arc::new(|_event, _payload| {});

    let orchestrator = Orchestrator::new(
        store.clone(),
        engine,
        recovery,
        mode_manager.clone(),
        watcher,
        stats,
        10,
        notifier,
    );

    Harness {
        _storage_dir: storage_dir,
        store,
        mode_manager,
        orchestrator,
    }
}

fn write_pattern(path: &std::path::Path, byte: u8, len: usize) {
    let mut f = std::fs::File::create(path).unwrap();
    f.write_all(&vec![byte; len]).unwrap();
}

fn overwrite_at(path: &std::path::Path, offset: u64, bytes: &[u8]) {
    let mut f = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    f.seek(SeekFrom::Start(offset)).unwrap();
    f.write_all(bytes).unwrap();
}

/// Deterministic pseudo-random bytes, high enough Shannon entropy to cross
/// the default 7.5-bit threshold without pulling in a CSPRNG just for a
/// test fixture.
fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed;
    let mut out = vec![0u8; len];
    for b in out.iter_mut() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        *b = (state & 0xff) as u8;
    }
    out
}

fn modify_event(path: &std::path::Path) -> WatchEvent {
    WatchEvent {
        event_type: WatchEventType::Modify,
        file_path: path.to_str().unwrap().to_string(),
        timestamp: chrono::Utc::now(),
    }
}

/// block_size=1024, a 3000-byte file of 0x41 bytes baselines to three
/// blocks, two identical and one 952-byte tail block.
#[test]
fn scenario_baseline_round_trip() {
    let harness = build_harness(RansomwareThresholds::default(), HashSet::new());
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("a");
    write_pattern(&target, 0x41, 3000);

    harness
        .orchestrator
        .initialize_baseline(target.to_str().unwrap(), 1024)
        .unwrap();

    let record = harness.store.get(target.to_str().unwrap()).unwrap().unwrap();
    assert_eq!(record.blocks_count, 3);
    assert_eq!(record.block_hashes[0], record.block_hashes[1]);
    assert_ne!(record.block_hashes[1], record.block_hashes[2]);
}

/// Scenario 2: an edit made while an admin holds Update mode is absorbed
/// into the baseline rather than treated as a violation, so the changed
/// block's hash diverges from the one captured at baseline time but the
/// stored record moves to match the new content.
#[test]
fn scenario_authorized_edit_in_update_mode_updates_baseline() {
    let mut admins = HashSet::new();
    admins.insert("root".to_string());
    let harness = build_harness(RansomwareThresholds::default(), admins);
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("a");
    write_pattern(&target, 0x41, 3000);
    harness
        .orchestrator
        .initialize_baseline(target.to_str().unwrap(), 1024)
        .unwrap();
    let original_block0 = harness
        .store
        .get(target.to_str().unwrap())
        .unwrap()
        .unwrap()
        .block_hashes[0]
        .clone();

    harness.mode_manager.enter_update_mode("root", 120).unwrap();
    assert_eq!(harness.mode_manager.get_mode(), SystemMode::Update);

    overwrite_at(&target, 0, &[0x42u8; 100]);
    harness.orchestrator.handle_watch_event(modify_event(&target));

    let updated = harness.store.get(target.to_str().unwrap()).unwrap().unwrap();
    assert_ne!(updated.block_hashes[0], original_block0);
}

/// Scenario 3: a low-entropy overwrite of a single block from Monitor mode
/// classifies as `UnauthorizedChange` and is repaired via a per-block
/// restore, so the file on disk ends up matching the baseline's block hash
/// again instead of the tampered bytes.
#[test]
fn scenario_unauthorized_low_entropy_edit_triggers_block_restore() {
    let harness = build_harness(RansomwareThresholds::default(), HashSet::new());
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("a");
    write_pattern(&target, 0x41, 3000);
    harness
        .orchestrator
        .initialize_baseline(target.to_str().unwrap(), 1024)
        .unwrap();
    let baseline_block2 = harness
        .store
        .get(target.to_str().unwrap())
        .unwrap()
        .unwrap()
        .block_hashes[2]
        .clone();

    overwrite_at(&target, 2048, &[0x00u8; 52]);
    harness.orchestrator.handle_watch_event(modify_event(&target));

    let (hashes, _) = compute_file_hashes(&target, 1024).unwrap();
    assert_eq!(hashes[2], baseline_block2);
}

/// Scenario 4: overwriting the whole file with high-entropy bytes
/// classifies as `CriticalChange` and triggers a full restore from backup.
#[test]
fn scenario_critical_high_entropy_change_triggers_full_restore() {
    let harness = build_harness(RansomwareThresholds::default(), HashSet::new());
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("a");
    write_pattern(&target, 0x41, 3000);
    harness
        .orchestrator
        .initialize_baseline(target.to_str().unwrap(), 1024)
        .unwrap();
    let (baseline_hashes, _) = compute_file_hashes(&target, 1024).unwrap();

    std::fs::write(&target, noise(3000, 0x1234_5678_9abc_def0)).unwrap();
    harness.orchestrator.handle_watch_event(modify_event(&target));

    let (restored_hashes, _) = compute_file_hashes(&target, 1024).unwrap();
    assert_eq!(restored_hashes, baseline_hashes);
}

/// Scenario 5: a burst of high-entropy rewrites across enough files within
/// the configured window trips the ransomware detector and pushes the mode
/// manager into Emergency, which blocks every protected file's write bits.
#[test]
fn scenario_ransomware_burst_enters_emergency_and_blocks_all_files() {
    let thresholds = RansomwareThresholds {
        files_count_threshold: 5,
        block_change_threshold: 70.0,
        entropy_threshold: 7.5,
    };
    let harness = build_harness(thresholds, HashSet::new());
    let dir = TempDir::new().unwrap();

    let mut targets = Vec::new();
    for i in 0..6 {
        let target = dir.path().join(format!("f{i}"));
        write_pattern(&target, 0x41, 4096);
        harness
            .orchestrator
            .initialize_baseline(target.to_str().unwrap(), 1024)
            .unwrap();
        targets.push(target);
    }

    for (i, target) in targets.iter().enumerate() {
        std::fs::write(target, noise(4096, 0xdead_beef_cafe_f00d ^ i as u64)).unwrap();
        harness.orchestrator.handle_watch_event(modify_event(target));
    }

    assert_eq!(harness.mode_manager.get_mode(), SystemMode::Emergency);
    for target in &targets {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(target).unwrap().permissions();
            assert_eq!(mode.mode() & 0o222, 0, "write bits must be cleared on {target:?}");
        }
    }
}
