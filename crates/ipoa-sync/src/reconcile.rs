//! Decides which freshly extracted rows become new sheet rows, which fill in
//! blanks on rows already stored, and which are ignored.

use std::collections::{BTreeMap, HashMap};

use ipoa_core::{FieldValue, IpoRecord, RecordField, RecordPatch};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Reconciliation {
    pub to_insert: Vec<IpoRecord>,
    pub to_patch: Vec<RecordPatch>,
    /// Keys of incoming rows that matched a stored row and added nothing.
    pub dropped: Vec<String>,
    /// Input positions of rows without a usable company name.
    pub skipped_invalid: Vec<usize>,
}

impl Reconciliation {
    pub fn is_noop(&self) -> bool {
        self.to_insert.is_empty() && self.to_patch.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub promotable: Vec<RecordField>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            promotable: RecordField::PROMOTABLE.to_vec(),
        }
    }
}

/// Placeholder-promotion merge keyed on the normalized company name.
///
/// A stored field is only ever overwritten when it holds a placeholder and the
/// incoming value is real. Real stored values are kept even when a newer
/// extraction disagrees.
#[derive(Debug, Clone, Default)]
pub struct ReconcileEngine {
    config: ReconcileConfig,
}

impl ReconcileEngine {
    pub fn new(config: ReconcileConfig) -> Self {
        Self { config }
    }

    pub fn reconcile(&self, incoming: &[IpoRecord], existing: &[IpoRecord]) -> Reconciliation {
        let mut lookup: HashMap<String, IpoRecord> = HashMap::with_capacity(existing.len());
        for record in existing {
            let key = record.natural_key();
            if key.is_empty() {
                continue;
            }
            // Duplicate stored rows: the first one is the one we reason about.
            lookup.entry(key).or_insert_with(|| record.clone());
        }

        let mut out = Reconciliation::default();
        for (index, record) in incoming.iter().enumerate() {
            let key = record.natural_key();
            if key.is_empty() {
                out.skipped_invalid.push(index);
                continue;
            }

            match lookup.get_mut(&key) {
                None => {
                    out.to_insert.push(record.clone());
                    lookup.insert(key, record.clone());
                }
                Some(stored) => match self.promotions(stored, record) {
                    Some(updates) => {
                        let patch = RecordPatch {
                            key,
                            company_name: stored.company_name.clone(),
                            updates,
                        };
                        patch.apply_to(stored);
                        out.to_patch.push(patch);
                    }
                    None => out.dropped.push(key),
                },
            }
        }
        out
    }

    fn promotions(
        &self,
        stored: &IpoRecord,
        incoming: &IpoRecord,
    ) -> Option<BTreeMap<RecordField, FieldValue>> {
        let mut updates: BTreeMap<RecordField, FieldValue> = self
            .config
            .promotable
            .iter()
            .filter_map(|&field| {
                let candidate = incoming.get(field);
                (stored.get(field).is_placeholder() && !candidate.is_placeholder())
                    .then_some((field, candidate))
            })
            .collect();

        if updates.is_empty() {
            return None;
        }
        // Status rides along with real data, never on its own, and only when
        // the source actually reported one.
        if incoming.status_reported && incoming.status != stored.status {
            updates.insert(
                RecordField::Status,
                FieldValue::Text(incoming.status.as_str().to_string()),
            );
        }
        Some(updates)
    }
}

/// Reconciles with the default promotable field set.
pub fn reconcile(incoming: &[IpoRecord], existing: &[IpoRecord]) -> Reconciliation {
    ReconcileEngine::default().reconcile(incoming, existing)
}
