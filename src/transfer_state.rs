//! Per-item state for a transfer request and the report it produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{VaultError, VaultResult};

/// Lifecycle of one request item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemPhase {
    Pending,
    ResolvingDescriptor,
    TargetComputed,
    ConflictChecked,
    Copying,
    Moving,
    Uploading,
    Created,
    Copied,
    Moved,
    Uploaded,
    Skipped,
    Error,
}

impl ItemPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemPhase::Created
                | ItemPhase::Copied
                | ItemPhase::Moved
                | ItemPhase::Uploaded
                | ItemPhase::Skipped
                | ItemPhase::Error
        )
    }

    fn can_advance_to(self, next: ItemPhase) -> bool {
        use ItemPhase::*;
        if self.is_terminal() {
            return false;
        }
        // any live item can end as skipped or failed
        if matches!(next, Skipped | Error) {
            return true;
        }
        matches!(
            (self, next),
            (Pending, ResolvingDescriptor)
                | (ResolvingDescriptor, TargetComputed)
                | (TargetComputed, ConflictChecked)
                | (ConflictChecked, Created | Copying | Moving | Uploading)
                | (Copying, Copied)
                | (Moving, Moved)
                | (Uploading, Uploaded)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemOutcome {
    Created,
    Copied,
    Moved,
    Uploaded,
    Skipped,
    Error,
}

impl ItemOutcome {
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ItemOutcome::Created | ItemOutcome::Copied | ItemOutcome::Moved | ItemOutcome::Uploaded
        )
    }

    fn from_phase(phase: ItemPhase) -> Option<Self> {
        Some(match phase {
            ItemPhase::Created => ItemOutcome::Created,
            ItemPhase::Copied => ItemOutcome::Copied,
            ItemPhase::Moved => ItemOutcome::Moved,
            ItemPhase::Uploaded => ItemOutcome::Uploaded,
            ItemPhase::Skipped => ItemOutcome::Skipped,
            ItemPhase::Error => ItemOutcome::Error,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferItemResult {
    pub source_path: String,
    pub target_path: Option<String>,
    pub outcome: ItemOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub bytes: u64,
}

/// Tracks one item through its phases.
#[derive(Debug)]
pub struct ItemTracker {
    index: usize,
    source_path: String,
    target_path: Option<String>,
    phase: ItemPhase,
    bytes: u64,
}

impl ItemTracker {
    pub fn new(index: usize, source_path: impl Into<String>) -> Self {
        Self {
            index,
            source_path: source_path.into(),
            target_path: None,
            phase: ItemPhase::Pending,
            bytes: 0,
        }
    }

    pub fn phase(&self) -> ItemPhase {
        self.phase
    }

    pub fn advance(&mut self, next: ItemPhase) -> VaultResult<()> {
        if !self.phase.can_advance_to(next) {
            return Err(VaultError::Internal(format!(
                "item {} cannot go from {:?} to {:?}",
                self.index, self.phase, next
            )));
        }
        debug!("Item {}: {:?} -> {:?}", self.index, self.phase, next);
        self.phase = next;
        Ok(())
    }

    pub fn set_target(&mut self, target: impl Into<String>) {
        self.target_path = Some(target.into());
    }

    pub fn add_bytes(&mut self, bytes: u64) {
        self.bytes += bytes;
    }

    /// Finishes the item in `terminal`, which must be reachable from the
    /// current phase.
    pub fn finish(mut self, terminal: ItemPhase, detail: Option<String>) -> VaultResult<TransferItemResult> {
        self.advance(terminal)?;
        let outcome = ItemOutcome::from_phase(terminal)
            .ok_or_else(|| VaultError::Internal(format!("{terminal:?} is not terminal")))?;
        Ok(TransferItemResult {
            source_path: self.source_path,
            target_path: self.target_path,
            outcome,
            error_detail: detail,
            bytes: self.bytes,
        })
    }

    /// Ends the item as failed from whatever phase it reached.
    pub fn fail(self, err: &VaultError) -> TransferItemResult {
        let (outcome, detail) = if err.is_cancelled() {
            (ItemOutcome::Skipped, "cancelled".to_string())
        } else {
            (ItemOutcome::Error, err.to_string())
        };
        TransferItemResult {
            source_path: self.source_path,
            target_path: self.target_path,
            outcome,
            error_detail: Some(detail),
            bytes: self.bytes,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeCounts {
    pub created: usize,
    pub copied: usize,
    pub moved: usize,
    pub uploaded: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl OutcomeCounts {
    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Created => self.created += 1,
            ItemOutcome::Copied => self.copied += 1,
            ItemOutcome::Moved => self.moved += 1,
            ItemOutcome::Uploaded => self.uploaded += 1,
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Error => self.errors += 1,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.created + self.copied + self.moved + self.uploaded
    }
}

/// Ordered results for a whole request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReport {
    pub items: Vec<TransferItemResult>,
    pub counts: OutcomeCounts,
    pub total_bytes: u64,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for TransferReport {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferReport {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            counts: OutcomeCounts::default(),
            total_bytes: 0,
            cancelled: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn push(&mut self, result: TransferItemResult) {
        self.counts.record(result.outcome);
        self.total_bytes += result.bytes;
        self.items.push(result);
    }

    /// Records an item that was never started because the request was cancelled.
    pub fn push_not_started(&mut self, source_path: impl Into<String>) {
        self.push(TransferItemResult {
            source_path: source_path.into(),
            target_path: None,
            outcome: ItemOutcome::Skipped,
            error_detail: Some("cancelled".into()),
            bytes: 0,
        });
    }

    pub fn finish(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn has_errors(&self) -> bool {
        self.counts.errors > 0
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn through_conflict_check(tracker: &mut ItemTracker) {
        tracker.advance(ItemPhase::ResolvingDescriptor).unwrap();
        tracker.advance(ItemPhase::TargetComputed).unwrap();
        tracker.advance(ItemPhase::ConflictChecked).unwrap();
    }

    #[test]
    fn test_happy_path() {
        let mut tracker = ItemTracker::new(0, "/src/GameA");
        through_conflict_check(&mut tracker);
        tracker.set_target("/dst/Game A/PPSA00001");
        tracker.advance(ItemPhase::Copying).unwrap();
        tracker.add_bytes(1024);
        let result = tracker.finish(ItemPhase::Copied, None).unwrap();
        assert_eq!(result.outcome, ItemOutcome::Copied);
        assert_eq!(result.bytes, 1024);
        assert_eq!(result.target_path.as_deref(), Some("/dst/Game A/PPSA00001"));
    }

    #[test]
    fn test_illegal_transitions() {
        let mut tracker = ItemTracker::new(0, "/src");
        assert!(tracker.advance(ItemPhase::Copying).is_err());
        through_conflict_check(&mut tracker);
        tracker.advance(ItemPhase::Moving).unwrap();
        assert!(tracker.advance(ItemPhase::Copied).is_err());
        assert_eq!(tracker.phase(), ItemPhase::Moving);
        assert!(tracker.finish(ItemPhase::Moved, None).is_ok());
    }

    #[test]
    fn test_skip_from_conflict_check() {
        let mut tracker = ItemTracker::new(1, "/src");
        through_conflict_check(&mut tracker);
        let result = tracker
            .finish(ItemPhase::Skipped, Some("target exists".into()))
            .unwrap();
        assert_eq!(result.outcome, ItemOutcome::Skipped);
    }

    #[test]
    fn test_fail_maps_cancellation_to_skipped() {
        let tracker = ItemTracker::new(2, "/src");
        let result = tracker.fail(&VaultError::Cancelled);
        assert_eq!(result.outcome, ItemOutcome::Skipped);
        assert_eq!(result.error_detail.as_deref(), Some("cancelled"));

        let tracker = ItemTracker::new(3, "/src");
        let result = tracker.fail(&VaultError::SourceNotFound("/src".into()));
        assert_eq!(result.outcome, ItemOutcome::Error);
    }

    #[test]
    fn test_report_counts() {
        let mut report = TransferReport::new();
        let mut tracker = ItemTracker::new(0, "/a");
        through_conflict_check(&mut tracker);
        tracker.advance(ItemPhase::Copying).unwrap();
        tracker.add_bytes(10);
        report.push(tracker.finish(ItemPhase::Copied, None).unwrap());
        report.push(ItemTracker::new(1, "/b").fail(&VaultError::Internal("boom".into())));
        report.push_not_started("/c");
        let report = report.finish();

        assert_eq!(report.counts.copied, 1);
        assert_eq!(report.counts.errors, 1);
        assert_eq!(report.counts.skipped, 1);
        assert_eq!(report.counts.succeeded(), 1);
        assert_eq!(report.total_bytes, 10);
        assert!(report.has_errors());
        assert!(report.duration_ms().is_some());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["items"][0]["outcome"], "copied");
        assert_eq!(json["items"][1]["errorDetail"], "Internal error: boom");
    }
}
