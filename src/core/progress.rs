//! Progress model for running jobs.
//!
//! A job carries one `JobProgress` snapshot that the executor overwrites on
//! every tick. Snapshots are never persisted; only logs and the job record
//! reach the durable store. Before a snapshot replaces the previous one it is
//! checked by [`validate_update`] so a misbehaving executor is caught at the
//! source instead of showing viewers a bar that runs backwards.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stage of a job. Declaration order is the only permitted direction of travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Preparing,
    DiskTransfer,
    Archiving,
    Encrypting,
    Uploading,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preparing => "preparing",
            Self::DiskTransfer => "disk_transfer",
            Self::Archiving => "archiving",
            Self::Encrypting => "encrypting",
            Self::Uploading => "uploading",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskStatus {
    Pending,
    Transferring,
    Completed,
    Failed,
}

impl DiskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Transferring => 1,
            Self::Completed | Self::Failed => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverallProgress {
    pub current_phase: Phase,
    pub current_disk_index: u32,
    pub total_disks: u32,
    pub percent: f64,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    /// Null or negative while the rate is still unknown.
    pub eta_seconds: Option<i64>,
}

impl OverallProgress {
    /// ETA with the "not yet computable" encodings folded into `None`.
    pub fn eta(&self) -> Option<u64> {
        self.eta_seconds
            .and_then(|secs| u64::try_from(secs).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskProgress {
    /// Disk identifier, unique within a job (`vda`, `sdb`, ...).
    pub target: String,
    pub status: DiskStatus,
    pub percent: f64,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    pub transfer_rate_bps: u64,
}

impl DiskProgress {
    pub fn new(target: impl Into<String>, bytes_total: u64) -> Self {
        Self {
            target: target.into(),
            status: DiskStatus::Pending,
            percent: 0.0,
            bytes_transferred: 0,
            bytes_total,
            transfer_rate_bps: 0,
        }
    }

    /// Remaining seconds at the current rate, if a rate has been observed.
    pub fn eta_seconds(&self) -> Option<u64> {
        if self.transfer_rate_bps == 0 || self.status.is_terminal() {
            return None;
        }
        let remaining = self.bytes_total.saturating_sub(self.bytes_transferred);
        Some(remaining.div_ceil(self.transfer_rate_bps))
    }
}

/// Current progress snapshot for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub overall: OverallProgress,
    pub disks: Vec<DiskProgress>,
}

impl JobProgress {
    /// Empty snapshot in the preparing phase for the given disks.
    pub fn preparing(disks: Vec<DiskProgress>) -> Self {
        let bytes_total = disks.iter().map(|d| d.bytes_total).sum();
        let total_disks = u32::try_from(disks.len()).unwrap_or(u32::MAX);
        Self {
            overall: OverallProgress {
                current_phase: Phase::Preparing,
                current_disk_index: 0,
                total_disks,
                percent: 0.0,
                bytes_transferred: 0,
                bytes_total,
                eta_seconds: None,
            },
            disks,
        }
    }

    pub fn disk(&self, target: &str) -> Option<&DiskProgress> {
        self.disks.iter().find(|d| d.target == target)
    }

    pub fn disk_mut(&mut self, target: &str) -> Option<&mut DiskProgress> {
        self.disks.iter_mut().find(|d| d.target == target)
    }

    /// Recompute the overall byte counters, percent and ETA from the disks.
    ///
    /// The aggregate ETA uses the sum of the rates of disks still
    /// transferring; when none are, the ETA is left as not computable.
    pub fn recompute_overall(&mut self) {
        let transferred: u64 = self.disks.iter().map(|d| d.bytes_transferred).sum();
        let total: u64 = self.disks.iter().map(|d| d.bytes_total).sum();
        let rate: u64 = self
            .disks
            .iter()
            .filter(|d| d.status == DiskStatus::Transferring)
            .map(|d| d.transfer_rate_bps)
            .sum();

        self.overall.total_disks = u32::try_from(self.disks.len()).unwrap_or(u32::MAX);
        self.overall.bytes_transferred = transferred;
        self.overall.bytes_total = total;
        self.overall.percent = percent_of(transferred, total);
        self.overall.eta_seconds = if rate > 0 {
            let remaining = total.saturating_sub(transferred);
            i64::try_from(remaining.div_ceil(rate)).ok()
        } else {
            None
        };
    }
}

/// `part / whole` as a percentage clamped to 0..=100.
pub fn percent_of(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    ((part as f64 / whole as f64) * 100.0).clamp(0.0, 100.0)
}

/// Ways a progress update can violate the progress invariants.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProgressError {
    #[error("percent {value} for {field} is outside 0..=100")]
    PercentOutOfRange { field: String, value: f64 },

    #[error("phase moved backwards from {from} to {to}")]
    PhaseRegressed { from: &'static str, to: &'static str },

    #[error("disk target {0} appears more than once")]
    DuplicateDisk(String),

    #[error("disk {0} was dropped from the progress snapshot")]
    DiskMissing(String),

    #[error("overall percent decreased from {from} to {to} within phase {phase}")]
    OverallRegressed { phase: &'static str, from: f64, to: f64 },

    #[error("disk {target}: {field} decreased from {from} to {to}")]
    DiskRegressed {
        target: String,
        field: &'static str,
        from: f64,
        to: f64,
    },

    #[error("disk {target}: status cannot move from {from:?} to {to:?}")]
    DiskStatusRegressed {
        target: String,
        from: DiskStatus,
        to: DiskStatus,
    },
}

/// Check that `next` may replace `prev` as a job's current progress.
///
/// Percentages must be finite and within range, phases only move forward,
/// every disk already reported stays in the snapshot, and within one phase
/// a non-terminal disk never loses percent or bytes.
/// Once a disk is terminal its counters are no longer constrained, but its
/// status is fixed.
pub fn validate_update(prev: Option<&JobProgress>, next: &JobProgress) -> Result<(), ProgressError> {
    check_percent("overall", next.overall.percent)?;

    let mut seen = HashSet::new();
    for disk in &next.disks {
        check_percent(&disk.target, disk.percent)?;
        if !seen.insert(disk.target.as_str()) {
            return Err(ProgressError::DuplicateDisk(disk.target.clone()));
        }
    }

    let Some(prev) = prev else {
        return Ok(());
    };

    let (from, to) = (prev.overall.current_phase, next.overall.current_phase);
    if to < from {
        return Err(ProgressError::PhaseRegressed {
            from: from.as_str(),
            to: to.as_str(),
        });
    }
    let same_phase = from == to;

    if same_phase && next.overall.percent < prev.overall.percent {
        return Err(ProgressError::OverallRegressed {
            phase: to.as_str(),
            from: prev.overall.percent,
            to: next.overall.percent,
        });
    }

    if let Some(dropped) = prev.disks.iter().find(|d| next.disk(&d.target).is_none()) {
        return Err(ProgressError::DiskMissing(dropped.target.clone()));
    }

    for disk in &next.disks {
        let Some(before) = prev.disk(&disk.target) else {
            continue;
        };

        if before.status.is_terminal() {
            if disk.status != before.status {
                return Err(ProgressError::DiskStatusRegressed {
                    target: disk.target.clone(),
                    from: before.status,
                    to: disk.status,
                });
            }
            continue;
        }

        if disk.status.rank() < before.status.rank() {
            return Err(ProgressError::DiskStatusRegressed {
                target: disk.target.clone(),
                from: before.status,
                to: disk.status,
            });
        }

        if !same_phase {
            continue;
        }

        if disk.percent < before.percent {
            return Err(ProgressError::DiskRegressed {
                target: disk.target.clone(),
                field: "percent",
                from: before.percent,
                to: disk.percent,
            });
        }
        if disk.bytes_transferred < before.bytes_transferred {
            return Err(ProgressError::DiskRegressed {
                target: disk.target.clone(),
                field: "bytes_transferred",
                from: before.bytes_transferred as f64,
                to: disk.bytes_transferred as f64,
            });
        }
    }

    Ok(())
}

fn check_percent(field: &str, value: f64) -> Result<(), ProgressError> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(ProgressError::PercentOutOfRange {
            field: field.to_string(),
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(phase: Phase, disk_percent: f64) -> JobProgress {
        let mut disk = DiskProgress::new("vda", 1000);
        disk.status = DiskStatus::Transferring;
        disk.percent = disk_percent;
        disk.bytes_transferred = (disk_percent * 10.0) as u64;
        let mut progress = JobProgress::preparing(vec![disk]);
        progress.overall.current_phase = phase;
        progress.overall.percent = disk_percent;
        progress
    }

    #[test]
    fn first_snapshot_only_checks_ranges() {
        assert!(validate_update(None, &snapshot(Phase::DiskTransfer, 40.0)).is_ok());

        let mut bad = snapshot(Phase::DiskTransfer, 40.0);
        bad.disks[0].percent = 140.0;
        assert!(matches!(
            validate_update(None, &bad),
            Err(ProgressError::PercentOutOfRange { .. })
        ));

        let mut nan = snapshot(Phase::DiskTransfer, 40.0);
        nan.overall.percent = f64::NAN;
        assert!(validate_update(None, &nan).is_err());
    }

    #[test]
    fn disk_percent_cannot_decrease_within_phase() {
        let prev = snapshot(Phase::DiskTransfer, 40.0);
        let mut next = snapshot(Phase::DiskTransfer, 40.0);
        next.disks[0].percent = 25.0;

        let err = validate_update(Some(&prev), &next).unwrap_err();
        assert!(matches!(err, ProgressError::DiskRegressed { field: "percent", .. }));
    }

    #[test]
    fn phase_cannot_move_backwards() {
        let prev = snapshot(Phase::Archiving, 100.0);
        let next = snapshot(Phase::DiskTransfer, 100.0);
        assert_eq!(
            validate_update(Some(&prev), &next),
            Err(ProgressError::PhaseRegressed {
                from: "archiving",
                to: "disk_transfer"
            })
        );
    }

    #[test]
    fn new_phase_resets_percent_constraints() {
        let prev = snapshot(Phase::DiskTransfer, 100.0);
        let next = snapshot(Phase::Archiving, 10.0);
        assert!(validate_update(Some(&prev), &next).is_ok());
    }

    #[test]
    fn terminal_disk_status_is_fixed() {
        let mut prev = snapshot(Phase::DiskTransfer, 100.0);
        prev.disks[0].status = DiskStatus::Completed;
        let next = snapshot(Phase::DiskTransfer, 100.0);

        assert!(matches!(
            validate_update(Some(&prev), &next),
            Err(ProgressError::DiskStatusRegressed { .. })
        ));
    }

    #[test]
    fn duplicate_disk_targets_rejected() {
        let mut next = snapshot(Phase::DiskTransfer, 10.0);
        next.disks.push(next.disks[0].clone());
        assert_eq!(
            validate_update(None, &next),
            Err(ProgressError::DuplicateDisk("vda".to_string()))
        );
    }

    #[test]
    fn reported_disks_cannot_disappear() {
        let prev = snapshot(Phase::DiskTransfer, 40.0);
        let mut emptied = snapshot(Phase::DiskTransfer, 40.0);
        emptied.disks.clear();
        assert_eq!(
            validate_update(Some(&prev), &emptied),
            Err(ProgressError::DiskMissing("vda".to_string()))
        );

        // A later phase does not make dropping a disk acceptable either.
        let mut next_phase = snapshot(Phase::Archiving, 0.0);
        next_phase.disks[0].target = "vdb".to_string();
        assert_eq!(
            validate_update(Some(&prev), &next_phase),
            Err(ProgressError::DiskMissing("vda".to_string()))
        );

        // Reintroducing the disk at a lower percent cannot sneak past the
        // regression check.
        let mut back = snapshot(Phase::DiskTransfer, 40.0);
        back.disks[0].percent = 5.0;
        assert!(matches!(
            validate_update(Some(&prev), &back),
            Err(ProgressError::DiskRegressed { .. })
        ));
    }

    #[test]
    fn new_disks_may_be_added() {
        let prev = snapshot(Phase::DiskTransfer, 40.0);
        let mut next = snapshot(Phase::DiskTransfer, 40.0);
        next.disks.push(DiskProgress::new("vdb", 500));
        next.overall.total_disks = 2;
        assert!(validate_update(Some(&prev), &next).is_ok());
    }

    #[test]
    fn negative_eta_means_unknown() {
        let mut progress = snapshot(Phase::DiskTransfer, 10.0);
        progress.overall.eta_seconds = Some(-1);
        assert_eq!(progress.overall.eta(), None);
        progress.overall.eta_seconds = Some(90);
        assert_eq!(progress.overall.eta(), Some(90));
    }

    #[test]
    fn recompute_overall_aggregates_disks() {
        let mut a = DiskProgress::new("vda", 1000);
        a.status = DiskStatus::Completed;
        a.bytes_transferred = 1000;
        a.percent = 100.0;
        let mut b = DiskProgress::new("vdb", 1000);
        b.status = DiskStatus::Transferring;
        b.bytes_transferred = 500;
        b.percent = 50.0;
        b.transfer_rate_bps = 100;

        let mut progress = JobProgress::preparing(vec![a, b]);
        progress.recompute_overall();

        assert_eq!(progress.overall.total_disks, 2);
        assert_eq!(progress.overall.bytes_transferred, 1500);
        assert_eq!(progress.overall.bytes_total, 2000);
        assert_eq!(progress.overall.percent, 75.0);
        assert_eq!(progress.overall.eta(), Some(5));
        assert_eq!(progress.disks[1].eta_seconds(), Some(5));
    }
}
