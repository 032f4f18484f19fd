use std::collections::{BTreeSet, HashMap};

use ipoa_core::{normalize_record, IpoRecord, RawRecord, RecordField};
use ipoa_sync::{reconcile, Reconciliation};
use serde_json::{json, Value as JsonValue};

fn rows(values: Vec<JsonValue>) -> Vec<IpoRecord> {
    values
        .into_iter()
        .map(|v| {
            let raw: RawRecord = v.as_object().cloned().expect("object literal");
            normalize_record(&raw)
        })
        .collect()
}

fn stored() -> Vec<IpoRecord> {
    rows(vec![
        json!({"company_name": "Acme Corp", "gmp": 0, "lot_size": 200, "ipo_date": "TBA"}),
        json!({"company_name": "Northwind Traders", "price_band_high": 410, "industry": "Retail"}),
        json!({"company_name": "Globex", "application_open": "2026-03-02", "gmp": "35"}),
    ])
}

fn batch() -> Vec<IpoRecord> {
    rows(vec![
        json!({"company_name": " acme corp ", "gmp": 18, "ipo_date": "05/03/2026"}),
        json!({"company_name": "ACME CORP", "gmp": 25, "price_band_low": 90}),
        json!({"company_name": "Northwind Traders", "price_band_high": 450}),
        json!({"company_name": "Initech", "price_band_high": "TBA", "lot_size": "0"}),
        json!({"company_name": "initech", "lot_size": 75}),
        json!({"company_name": "", "gmp": 10}),
        json!({"symbol": "NONAME"}),
        json!({"company_name": "Globex", "gmp": 40, "application_open": "2026-03-09"}),
        json!({"company_name": "Umbrella", "industry": "Pharma", "status": "open"}),
    ])
}

/// Applies a reconciliation to the stored rows the way a store would.
fn apply(existing: &[IpoRecord], out: &Reconciliation) -> Vec<IpoRecord> {
    let mut next: Vec<IpoRecord> = existing.to_vec();
    next.extend(out.to_insert.iter().cloned());
    for patch in &out.to_patch {
        for record in next.iter_mut().filter(|r| r.natural_key() == patch.key) {
            patch.apply_to(record);
        }
    }
    next
}

#[test]
fn every_incoming_row_lands_in_exactly_one_bucket() {
    let incoming = batch();
    let out = reconcile(&incoming, &stored());

    let accounted = out.to_insert.len() + out.to_patch.len() + out.dropped.len() + out.skipped_invalid.len();
    assert_eq!(accounted, incoming.len());
    assert_eq!(out.skipped_invalid, vec![5, 6]);

    let inserted: BTreeSet<String> = out.to_insert.iter().map(IpoRecord::natural_key).collect();
    assert_eq!(
        inserted,
        BTreeSet::from(["initech".to_string(), "umbrella".to_string()])
    );
}

#[test]
fn a_second_pass_over_the_updated_store_is_a_no_op() {
    let incoming = batch();
    let first = reconcile(&incoming, &stored());
    assert!(!first.is_noop());

    let updated = apply(&stored(), &first);
    let second = reconcile(&incoming, &updated);

    assert!(second.to_insert.is_empty());
    assert!(second.to_patch.is_empty());
}

#[test]
fn promoted_fields_never_fall_back_to_placeholders() {
    let existing = stored();
    let first = reconcile(&batch(), &existing);
    let after_first = apply(&existing, &first);

    // A later extraction that has lost most of its data.
    let degraded = rows(vec![
        json!({"company_name": "Acme Corp", "gmp": 0, "ipo_date": "TBA", "price_band_low": "N/A"}),
        json!({"company_name": "Initech", "lot_size": 0}),
    ]);
    let second = reconcile(&degraded, &after_first);
    let after_second = apply(&after_first, &second);

    let by_key: HashMap<String, &IpoRecord> =
        after_first.iter().map(|r| (r.natural_key(), r)).collect();
    for record in &after_second {
        let Some(before) = by_key.get(&record.natural_key()) else {
            continue;
        };
        for field in RecordField::PROMOTABLE {
            if !before.get(field).is_placeholder() {
                assert_eq!(record.get(field), before.get(field), "{field} changed");
            }
        }
    }
}

#[test]
fn case_and_padding_variants_share_one_key() {
    let incoming = rows(vec![
        json!({"company_name": "Acme Corp", "gmp": 10}),
        json!({"company_name": " acme corp ", "lot_size": 50}),
        json!({"company_name": "ACME CORP", "price_band_high": 99}),
    ]);

    let out = reconcile(&incoming, &[]);

    assert_eq!(out.to_insert.len(), 1);
    assert_eq!(out.to_patch.len(), 2);
    assert!(out.to_patch.iter().all(|p| p.key == "acme corp"));
    assert!(out.to_patch.iter().all(|p| p.company_name == "Acme Corp"));
}

#[test]
fn earlier_stored_values_win_over_batch_disagreements() {
    let out = reconcile(&batch(), &stored());

    let acme: Vec<_> = out.to_patch.iter().filter(|p| p.key == "acme corp").collect();
    assert_eq!(acme.len(), 2);
    assert_eq!(
        acme[0].updates.get(&RecordField::Gmp).and_then(|v| v.as_number()),
        Some(18.0)
    );
    assert_eq!(
        acme[0].updates.get(&RecordField::IpoDate).map(ToString::to_string),
        Some("2026-03-05".to_string())
    );
    assert!(!acme[1].updates.contains_key(&RecordField::Gmp));
    assert!(acme[1].updates.contains_key(&RecordField::PriceBandLow));

    assert!(out.dropped.contains(&"northwind traders".to_string()));
    assert!(out.dropped.contains(&"globex".to_string()));
}
