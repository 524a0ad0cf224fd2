use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::field::FieldId;
use crate::graph::FieldGraph;
use crate::prompt::DependencyValue;
use crate::value::{FieldValue, FieldValues};

/// Dependency fingerprints captured when a field was generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub fingerprints: BTreeMap<FieldId, String>,
    pub recorded_at: DateTime<Utc>,
}

/// Result of comparing a snapshot with current values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StaleReport {
    pub stale: bool,
    /// Names of the dependencies whose value diverged
    pub changed: Vec<String>,
    /// True when the divergence is known but was dismissed
    #[serde(default)]
    pub dismissed: bool,
}

/// Advisory staleness tracking for generated fields. Never blocks editing,
/// export or regeneration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StalenessTracker {
    #[serde(default)]
    snapshots: BTreeMap<FieldId, ContextSnapshot>,
    /// Dependency fingerprints the user acknowledged, per field
    #[serde(default)]
    dismissed: BTreeMap<FieldId, BTreeMap<FieldId, String>>,
}

pub fn fingerprint(value: Option<&FieldValue>) -> String {
    let bytes = serde_json::to_vec(&value).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}

impl StalenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the dependency values a field was just generated from.
    /// Replaces any previous snapshot and clears a dismissal.
    pub fn record_snapshot(&mut self, field_id: &FieldId, dependencies: &[DependencyValue<'_>]) {
        let fingerprints = dependencies
            .iter()
            .map(|dep| (dep.id.clone(), fingerprint(dep.value)))
            .collect();
        self.snapshots.insert(
            field_id.clone(),
            ContextSnapshot {
                fingerprints,
                recorded_at: Utc::now(),
            },
        );
        self.dismissed.remove(field_id);
        debug!(
            "Recorded context snapshot for {} ({} dependencies)",
            field_id,
            dependencies.len()
        );
    }

    pub fn has_generated(&self, field_id: &FieldId) -> bool {
        self.snapshots.contains_key(field_id)
    }

    pub fn snapshot(&self, field_id: &FieldId) -> Option<&ContextSnapshot> {
        self.snapshots.get(field_id)
    }

    /// Compare the stored snapshot against current values.
    pub fn check_stale(
        &self,
        graph: &FieldGraph,
        field_id: &FieldId,
        values: &FieldValues,
    ) -> StaleReport {
        let Some(snapshot) = self.snapshots.get(field_id) else {
            return StaleReport::default();
        };

        let changed: Vec<String> = snapshot
            .fingerprints
            .iter()
            .filter(|(dep, recorded)| fingerprint(values.get(dep)) != **recorded)
            .map(|(dep, _)| {
                graph
                    .name_of(dep)
                    .map(str::to_string)
                    .unwrap_or_else(|| dep.to_string())
            })
            .collect();

        if changed.is_empty() {
            return StaleReport::default();
        }

        if let Some(acknowledged) = self.dismissed.get(field_id) {
            let unchanged_since_dismissal = acknowledged
                .iter()
                .all(|(dep, fp)| fingerprint(values.get(dep)) == *fp);
            if unchanged_since_dismissal {
                return StaleReport {
                    stale: false,
                    changed: Vec::new(),
                    dismissed: true,
                };
            }
        }

        StaleReport {
            stale: true,
            changed,
            dismissed: false,
        }
    }

    /// Hide the advisory for the current divergence. The generation snapshot
    /// is kept, so a further change to any dependency flags the field again.
    pub fn dismiss(&mut self, field_id: &FieldId, values: &FieldValues) -> bool {
        let Some(snapshot) = self.snapshots.get(field_id) else {
            return false;
        };
        let acknowledged = snapshot
            .fingerprints
            .keys()
            .map(|dep| (dep.clone(), fingerprint(values.get(dep))))
            .collect();
        self.dismissed.insert(field_id.clone(), acknowledged);
        true
    }

    /// Ids of every generated field currently reported stale, in graph order.
    pub fn stale_fields(&self, graph: &FieldGraph, values: &FieldValues) -> Vec<FieldId> {
        graph
            .fields()
            .iter()
            .filter(|f| self.check_stale(graph, &f.id, values).stale)
            .map(|f| f.id.clone())
            .collect()
    }

    /// Forget a field's history, e.g. when its value is cleared by hand.
    pub fn forget(&mut self, field_id: &FieldId) {
        self.snapshots.remove(field_id);
        self.dismissed.remove(field_id);
    }
}
