//! Content-addressed chunking, diffing, entropy analysis, change
//! classification, and ransomware-pattern mining over a bounded history of
//! modification events.
//!
//! The hashing and diff operations are pure functions of their inputs; the
//! only state carried across calls is the modification-event ring used by
//! [`IntegrityEngine::detect_ransomware_pattern`].

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const DEFAULT_BLOCK_SIZE: u32 = 65_536;
const ENTROPY_SAMPLE_BYTES: usize = 1024 * 1024;
const MODIFICATION_HISTORY_CAPACITY: usize = 1000;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),
    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, IntegrityError>;

fn classify_io_error(path: &Path, err: std::io::Error) -> IntegrityError {
    match err.kind() {
        std::io::ErrorKind::NotFound => IntegrityError::FileNotFound(path.to_path_buf()),
        std::io::ErrorKind::PermissionDenied => IntegrityError::PermissionDenied(path.to_path_buf()),
        _ => IntegrityError::Io {
            path: path.to_path_buf(),
            source: err,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    NoChange,
    AllowedChange,
    CriticalChange,
    SuspiciousChange,
    UnauthorizedChange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityCheckResult {
    pub classification: ChangeType,
    pub changed_indices: Vec<usize>,
    pub current_hashes: Vec<String>,
    pub reference_hashes: Vec<String>,
    pub entropy: f64,
    pub change_percent: f64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModificationEvent {
    pub file_path: String,
    pub timestamp: DateTime<Utc>,
    pub blocks_changed: usize,
    pub blocks_total: usize,
    pub change_percent: f64,
    pub entropy: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RansomwareThresholds {
    pub files_count_threshold: usize,
    pub block_change_threshold: f64,
    pub entropy_threshold: f64,
}

impl Default for RansomwareThresholds {
    fn default() -> Self {
        Self {
            files_count_threshold: 10,
            block_change_threshold: 70.0,
            entropy_threshold: 7.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RansomwareDetection {
    pub detected: bool,
    pub files_affected: usize,
    pub mean_change_percent: f64,
    pub mean_entropy: f64,
    pub critical_count: usize,
    pub affected_paths: Vec<String>,
    pub detection_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModificationStatistics {
    pub total_events: usize,
    pub mean_change_percent: f64,
    pub mean_entropy: f64,
}

/// Diff between a current and reference block-hash vector.
#[derive(Debug, Clone)]
pub struct DiffResult {
    pub changed_indices: Vec<usize>,
    pub change_percent: f64,
}

/// Reads `path` sequentially in `block_size`-byte blocks, hashing each with
/// SHA-256. The final block may be shorter than `block_size`; it is never
/// padded. Returns the ordered lowercase-hex digest vector and total size.
pub fn compute_file_hashes(path: &Path, block_size: u32) -> Result<(Vec<String>, u64)> {
    let mut file = std::fs::File::open(path).map_err(|e| classify_io_error(path, e))?;
    let mut hashes = Vec::new();
    let mut buf = vec![0u8; block_size as usize];
    let mut total_size: u64 = 0;

    loop {
        let mut filled = 0usize;
        while filled < buf.len() {
            let read = file
                .read(&mut buf[filled..])
                .map_err(|e| classify_io_error(path, e))?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        if filled == 0 {
            break;
        }
        let mut hasher = Sha256::new();
        hasher.update(&buf[..filled]);
        hashes.push(hex::encode(hasher.finalize()));
        total_size += filled as u64;
        if filled < buf.len() {
            break;
        }
    }

    Ok((hashes, total_size))
}

/// Compares a current hash vector to a reference vector.
pub fn compare_hashes(current: &[String], reference: &[String]) -> DiffResult {
    let min_len = current.len().min(reference.len());
    let max_len = current.len().max(reference.len());
    let mut changed_indices = Vec::new();

    for i in 0..min_len {
        if current[i] != reference[i] {
            changed_indices.push(i);
        }
    }
    for i in min_len..max_len {
        changed_indices.push(i);
    }

    let change_percent = if max_len == 0 {
        0.0
    } else {
        100.0 * changed_indices.len() as f64 / max_len as f64
    };

    DiffResult {
        changed_indices,
        change_percent,
    }
}

/// Shannon entropy (base-2) over up to the first 1 MiB of `path`.
///
/// Never fails: an unreadable or empty file yields `0.0`.
pub fn calculate_entropy(path: &Path) -> f64 {
    let Ok(mut file) = std::fs::File::open(path) else {
        return 0.0;
    };
    let mut buf = vec![0u8; ENTROPY_SAMPLE_BYTES];
    let mut filled = 0usize;
    loop {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => {
                filled += n;
                if filled >= buf.len() {
                    break;
                }
            }
            Err(_) => return 0.0,
        }
    }
    if filled == 0 {
        return 0.0;
    }

    let mut counts = [0u64; 256];
    for &byte in &buf[..filled] {
        counts[byte as usize] += 1;
    }

    let total = filled as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Classifies a change between `CriticalChange`, `SuspiciousChange` and
/// `UnauthorizedChange`. Callers handle `NoChange`/`AllowedChange` before
/// reaching here, since those depend on the changed-block count and the
/// update-mode flag rather than on percent/entropy thresholds.
pub fn classify_change(
    change_percent: f64,
    entropy: f64,
    thresholds: &RansomwareThresholds,
) -> ChangeType {
    let percent_met = change_percent >= thresholds.block_change_threshold;
    let entropy_met = entropy >= thresholds.entropy_threshold;
    if percent_met && entropy_met {
        ChangeType::CriticalChange
    } else if percent_met || entropy_met {
        ChangeType::SuspiciousChange
    } else {
        ChangeType::UnauthorizedChange
    }
}

pub struct IntegrityEngine {
    thresholds: RansomwareThresholds,
    modification_history: Mutex<VecDeque<ModificationEvent>>,
}

impl IntegrityEngine {
    pub fn new(thresholds: RansomwareThresholds) -> Self {
        Self {
            thresholds,
            modification_history: Mutex::new(VecDeque::with_capacity(MODIFICATION_HISTORY_CAPACITY)),
        }
    }

    pub fn thresholds(&self) -> &RansomwareThresholds {
        &self.thresholds
    }

    /// Verifies `path` against `reference_hashes`.
    ///
    /// A missing file is converted to `CriticalChange` rather than
    /// propagated as an error, mirroring the disposition in the error
    /// table: a file deleted between watch and verify is critical, not a
    /// transient failure.
    pub fn check_integrity(
        &self,
        path: &Path,
        reference_hashes: &[String],
        block_size: u32,
        is_update_mode: bool,
    ) -> Result<IntegrityCheckResult> {
        let (current_hashes, _size) = match compute_file_hashes(path, block_size) {
            Ok(v) => v,
            Err(IntegrityError::FileNotFound(_)) => {
                return Ok(IntegrityCheckResult {
                    classification: ChangeType::CriticalChange,
                    changed_indices: Vec::new(),
                    current_hashes: Vec::new(),
                    reference_hashes: reference_hashes.to_vec(),
                    entropy: 0.0,
                    change_percent: 100.0,
                    message: format!("{} deleted or inaccessible", path.display()),
                });
            }
            Err(e) => return Err(e),
        };

        let diff = compare_hashes(&current_hashes, reference_hashes);

        if diff.changed_indices.is_empty() {
            return Ok(IntegrityCheckResult {
                classification: ChangeType::NoChange,
                changed_indices: Vec::new(),
                current_hashes,
                reference_hashes: reference_hashes.to_vec(),
                entropy: 0.0,
                change_percent: 0.0,
                message: "no change".to_string(),
            });
        }

        if is_update_mode {
            return Ok(IntegrityCheckResult {
                classification: ChangeType::AllowedChange,
                changed_indices: diff.changed_indices,
                current_hashes,
                reference_hashes: reference_hashes.to_vec(),
                entropy: 0.0,
                change_percent: diff.change_percent,
                message: "change allowed in update mode".to_string(),
            });
        }

        let entropy = calculate_entropy(path);
        let classification = classify_change(diff.change_percent, entropy, &self.thresholds);
        let message = change_message(classification, diff.change_percent, entropy);

        {
            let mut history = self.modification_history.lock().unwrap();
            if history.len() == MODIFICATION_HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(ModificationEvent {
                file_path: path.display().to_string(),
                timestamp: Utc::now(),
                blocks_changed: diff.changed_indices.len(),
                blocks_total: current_hashes.len().max(reference_hashes.len()),
                change_percent: diff.change_percent,
                entropy,
            });
        }

        Ok(IntegrityCheckResult {
            classification,
            changed_indices: diff.changed_indices,
            current_hashes,
            reference_hashes: reference_hashes.to_vec(),
            entropy,
            change_percent: diff.change_percent,
            message,
        })
    }

    /// Reports positive iff, over the events within `time_window_sec`:
    /// enough files changed, the mean change percent crosses the
    /// configured threshold, and at least 70% of those events individually
    /// met both thresholds. The 70% is a ratio of the window, not a fixed
    /// absolute count — preserved deliberately.
    pub fn detect_ransomware_pattern(&self, time_window_sec: i64) -> RansomwareDetection {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::seconds(time_window_sec);
        let history = self.modification_history.lock().unwrap();
        let recent: Vec<&ModificationEvent> =
            history.iter().filter(|e| e.timestamp >= cutoff).collect();
        drop(history);

        let recent_count = recent.len();
        let mean_change_percent = if recent_count == 0 {
            0.0
        } else {
            recent.iter().map(|e| e.change_percent).sum::<f64>() / recent_count as f64
        };
        let mean_entropy = if recent_count == 0 {
            0.0
        } else {
            recent.iter().map(|e| e.entropy).sum::<f64>() / recent_count as f64
        };
        let critical_count = recent
            .iter()
            .filter(|e| {
                e.change_percent >= self.thresholds.block_change_threshold
                    && e.entropy >= self.thresholds.entropy_threshold
            })
            .count();

        let detected = recent_count >= self.thresholds.files_count_threshold
            && mean_change_percent >= self.thresholds.block_change_threshold
            && critical_count as f64 >= 0.7 * recent_count as f64;

        let mut affected_paths: Vec<String> =
            recent.iter().map(|e| e.file_path.clone()).collect();
        affected_paths.sort();
        affected_paths.dedup();

        RansomwareDetection {
            detected,
            files_affected: recent_count,
            mean_change_percent,
            mean_entropy,
            critical_count,
            affected_paths,
            detection_time: now,
        }
    }

    /// Reads the requested blocks back off disk. Missing file yields an
    /// empty map rather than an error.
    pub fn get_changed_blocks_data(
        &self,
        path: &Path,
        indices: &[usize],
        block_size: u32,
    ) -> HashMap<usize, Vec<u8>> {
        let mut out = HashMap::new();
        let Ok(mut file) = std::fs::File::open(path) else {
            return out;
        };
        for &index in indices {
            let offset = index as u64 * block_size as u64;
            if file.seek(SeekFrom::Start(offset)).is_err() {
                continue;
            }
            let mut buf = vec![0u8; block_size as usize];
            let mut filled = 0usize;
            while filled < buf.len() {
                match file.read(&mut buf[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(_) => break,
                }
            }
            buf.truncate(filled);
            out.insert(index, buf);
        }
        out
    }

    pub fn clear_modification_history(&self) {
        self.modification_history.lock().unwrap().clear();
    }

    pub fn get_modification_statistics(&self) -> ModificationStatistics {
        let history = self.modification_history.lock().unwrap();
        let total_events = history.len();
        if total_events == 0 {
            return ModificationStatistics {
                total_events: 0,
                mean_change_percent: 0.0,
                mean_entropy: 0.0,
            };
        }
        let mean_change_percent =
            history.iter().map(|e| e.change_percent).sum::<f64>() / total_events as f64;
        let mean_entropy = history.iter().map(|e| e.entropy).sum::<f64>() / total_events as f64;
        ModificationStatistics {
            total_events,
            mean_change_percent,
            mean_entropy,
        }
    }
}

fn change_message(classification: ChangeType, change_percent: f64, entropy: f64) -> String {
    match classification {
        ChangeType::CriticalChange => format!(
            "critical change: {change_percent:.1}% blocks changed, entropy {entropy:.2}"
        ),
        ChangeType::SuspiciousChange => format!(
            "suspicious change: {change_percent:.1}% blocks changed, entropy {entropy:.2}"
        ),
        ChangeType::UnauthorizedChange => format!(
            "unauthorized change: {change_percent:.1}% blocks changed, entropy {entropy:.2}"
        ),
        ChangeType::NoChange => "no change".to_string(),
        ChangeType::AllowedChange => "change allowed".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn hashes_three_blocks_without_padding_the_last() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0x41; 3000]).unwrap();
        let (hashes, size) = compute_file_hashes(file.path(), 1024).unwrap();
        assert_eq!(size, 3000);
        assert_eq!(hashes.len(), 3);
        assert_eq!(hashes[0], hashes[1]); // identical 1024-byte 0x41 blocks
        assert_ne!(hashes[1], hashes[2]); // final 952-byte block differs
    }

    #[test]
    fn compare_hashes_counts_appended_blocks_as_changed() {
        let reference = vec!["a".to_string(), "b".to_string()];
        let current = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let diff = compare_hashes(&current, &reference);
        assert_eq!(diff.changed_indices, vec![2]);
    }

    #[test]
    fn compare_hashes_empty_vectors_yield_zero_percent() {
        let diff = compare_hashes(&[], &[]);
        assert_eq!(diff.change_percent, 0.0);
        assert!(diff.changed_indices.is_empty());
    }

    #[test]
    fn entropy_of_constant_bytes_is_near_zero() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0x00; 4096]).unwrap();
        let entropy = calculate_entropy(file.path());
        assert!(entropy < 0.01, "expected near-zero entropy, got {entropy}");
    }

    #[test]
    fn entropy_of_missing_file_is_zero() {
        let entropy = calculate_entropy(Path::new("/nonexistent/path/does/not/exist"));
        assert_eq!(entropy, 0.0);
    }

    #[test]
    fn classify_requires_both_thresholds_for_critical() {
        let thresholds = RansomwareThresholds {
            files_count_threshold: 10,
            block_change_threshold: 70.0,
            entropy_threshold: 7.5,
        };
        assert_eq!(
            classify_change(80.0, 7.8, &thresholds),
            ChangeType::CriticalChange
        );
        assert_eq!(
            classify_change(80.0, 2.0, &thresholds),
            ChangeType::SuspiciousChange
        );
        assert_eq!(
            classify_change(10.0, 2.0, &thresholds),
            ChangeType::UnauthorizedChange
        );
    }

    #[test]
    fn ransomware_pattern_requires_seventy_percent_ratio_not_absolute_count() {
        let engine = IntegrityEngine::new(RansomwareThresholds {
            files_count_threshold: 5,
            block_change_threshold: 70.0,
            entropy_threshold: 7.5,
        });

        // 5 events at high change but only 3 also cross the entropy bar —
        // that is 60% critical, below the 70% ratio gate.
        for i in 0..5 {
            let mut history = engine.modification_history.lock().unwrap();
            history.push_back(ModificationEvent {
                file_path: format!("/tmp/f{i}"),
                timestamp: Utc::now(),
                blocks_changed: 10,
                blocks_total: 10,
                change_percent: 100.0,
                entropy: if i < 3 { 7.9 } else { 1.0 },
            });
        }
        let result = engine.detect_ransomware_pattern(10);
        assert!(!result.detected, "60% critical ratio must not trip the gate");

        // Bump one more event over the entropy bar: now 4/5 = 80%.
        {
            let mut history = engine.modification_history.lock().unwrap();
            history[3].entropy = 7.9;
        }
        let result = engine.detect_ransomware_pattern(10);
        assert!(result.detected, "80% critical ratio must trip the gate");
    }

    #[test]
    fn check_integrity_missing_file_is_critical_not_an_error() {
        let engine = IntegrityEngine::new(RansomwareThresholds::default());
        let result = engine
            .check_integrity(Path::new("/nonexistent/gone"), &["a".to_string()], 1024, false)
            .unwrap();
        assert_eq!(result.classification, ChangeType::CriticalChange);
    }

    #[test]
    fn check_integrity_update_mode_allows_any_change() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0x42; 2048]).unwrap();
        let engine = IntegrityEngine::new(RansomwareThresholds::default());
        let result = engine
            .check_integrity(file.path(), &["deadbeef".to_string()], 1024, true)
            .unwrap();
        assert_eq!(result.classification, ChangeType::AllowedChange);
    }
}
