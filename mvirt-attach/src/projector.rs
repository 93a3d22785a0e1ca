//! Read-back projection: turns reconciliation results and live engine state
//! into the persisted attachment state.

use std::collections::{HashMap, HashSet};

use crate::model::{Attachment, DesiredSet, ResolvedAttachment};

/// Persisted state after a pass: one entry per desired disk that resolved
/// to an attachment ID. Unresolved disks are omitted so the next pass
/// treats them as missing.
pub fn project(desired: &DesiredSet, resolved: &HashMap<String, String>) -> Vec<ResolvedAttachment> {
    desired
        .iter()
        .filter_map(|(disk_id, disk_interface)| {
            resolved.get(disk_id).map(|id| ResolvedAttachment {
                disk_id: disk_id.to_string(),
                disk_interface,
                id: id.clone(),
            })
        })
        .collect()
}

/// Observed state for drift detection.
///
/// Declared disks still attached take the live ID and interface, declared
/// disks no longer attached are dropped, and live attachments of undeclared
/// disks are appended in engine order.
pub fn refresh<I, S>(declared: I, actual: &[Attachment]) -> Vec<ResolvedAttachment>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut observed = Vec::new();

    for disk_id in declared {
        let disk_id = disk_id.as_ref();
        if !seen.insert(disk_id.to_string()) {
            continue;
        }
        if let Some(live) = actual.iter().find(|a| a.disk_id == disk_id) {
            observed.push(ResolvedAttachment::from(live));
        }
    }

    for live in actual {
        if seen.insert(live.disk_id.clone()) {
            observed.push(ResolvedAttachment::from(live));
        }
    }

    observed
}
