//! One-time reconciliation of the local store with the replicated map.
//!
//! Change notifications that arrive before the drawing tool is ready are not
//! replayed, so once it signals readiness the whole map is compared against
//! the store:
//! - Local ids absent from the map → deleted locally (the shared state wins
//!   over drafts made before the session connected)
//! - Map entries absent locally → imported
//! - Ids present in both with a different payload → replaced by the map's
//! - Ids present in both with the same payload → untouched
//!
//! Local features without an id are left alone.

use crate::bridge::BridgeInner;
use crate::events::{now_millis, BridgeEvent};
use std::collections::BTreeMap;
use tracing::info;

/// Report from reconciliation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Local features removed because the map does not hold them
    pub removed: Vec<String>,
    /// Map features imported into the local store
    pub imported: Vec<String>,
    /// Features whose local payload was replaced by the map's
    pub replaced: Vec<String>,
    /// Features already identical in both stores
    pub retained: usize,
}

impl ReconcileReport {
    /// Check if any changes were made
    pub fn has_changes(&self) -> bool {
        !self.removed.is_empty() || !self.imported.is_empty() || !self.replaced.is_empty()
    }

    /// Total number of local mutations performed
    pub fn total_processed(&self) -> usize {
        self.removed.len() + self.imported.len() + self.replaced.len()
    }
}

impl BridgeInner {
    /// Bring the local store into agreement with the entire replicated map.
    pub(crate) fn reconcile(&self) -> ReconcileReport {
        let report = self.with_remote_apply(|| {
            let mut report = ReconcileReport::default();

            let remote_ids = self.map.keys();
            let local: BTreeMap<String, _> = self
                .store
                .export_features()
                .into_iter()
                .filter_map(|f| f.id().map(str::to_string).map(|id| (id, f)))
                .collect();

            for id in local.keys() {
                if !remote_ids.contains(id) && self.delete_local(id) {
                    report.removed.push(id.clone());
                }
            }

            for (id, feature) in self.map.entries() {
                match local.get(&id) {
                    None => {
                        if self.replace_local(&id, feature, false) {
                            report.imported.push(id);
                        }
                    }
                    Some(existing) if *existing != feature.clone().with_id(id.as_str()) => {
                        if self.replace_local(&id, feature, true) {
                            report.replaced.push(id);
                        }
                    }
                    Some(_) => report.retained += 1,
                }
            }

            report
        });

        if report.has_changes() {
            info!(
                "Reconciled: {} removed, {} imported, {} replaced, {} retained",
                report.removed.len(),
                report.imported.len(),
                report.replaced.len(),
                report.retained
            );
        } else {
            info!("Reconciled: already in agreement ({} features)", report.retained);
        }

        self.monitor.emit(BridgeEvent::Reconciled {
            imported: report.imported.len() + report.replaced.len(),
            removed: report.removed.len(),
            timestamp: now_millis(),
        });

        report
    }
}
