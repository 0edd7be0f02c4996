//! Aggregation behavior through the session: per-CPU merge,
//! generation-based clearing, ordering, and truncation.

use dweave::ast::Ast;
use dweave::stmt::Action;
use dweave_dif::metadesc::AggFunc;
use dweave_runtime::agg::qbin;

use crate::{clause, small_session};

const AGG_VAR: u32 = 0x0600;

fn agg_session(func: AggFunc) -> dweave::Session<dweave_runtime::maps::MemBackend> {
    let mut sess = small_session();
    let mut ast = Ast::new();
    let v = ast.builtin(dweave_dif::vartab::Builtin::Timestamp);
    sess.compile(
        &ast,
        &clause(vec![Action::AggUpdate {
            varid: AGG_VAR,
            func,
            keys: vec![],
            value: Some(v),
        }]),
    )
    .unwrap();
    sess.go().unwrap();
    sess
}

#[test]
fn count_merges_across_cpus() {
    let mut sess = agg_session(AggFunc::Count);
    for cpu in 0..2 {
        sess.record_aggregation(AGG_VAR, cpu, b"", 0).unwrap();
        sess.record_aggregation(AGG_VAR, cpu, b"", 0).unwrap();
    }
    let snap = sess.aggregations().unwrap();
    assert_eq!(snap.entries.len(), 1);
    assert_eq!(snap.entries[0].count, 4);
}

#[test]
fn min_seeded_with_identity_merges_to_the_extremum() {
    let mut sess = agg_session(AggFunc::Min);
    sess.record_aggregation(AGG_VAR, 0, b"", 3).unwrap();
    sess.record_aggregation(AGG_VAR, 1, b"", 5).unwrap();
    let snap = sess.aggregations().unwrap();
    assert_eq!(snap.entries[0].body[0], 3);
}

#[test]
fn quantize_updates_land_in_qbin_buckets() {
    let mut sess = agg_session(AggFunc::Quantize);
    for v in [1i64, 1, 2, -7, 0] {
        sess.record_aggregation(AGG_VAR, 0, b"", v).unwrap();
    }
    let snap = sess.aggregations().unwrap();
    let body = &snap.entries[0].body;
    assert_eq!(body[qbin(1) as usize], 2);
    assert_eq!(body[qbin(2) as usize], 1);
    assert_eq!(body[qbin(-7) as usize], 1);
    assert_eq!(body[qbin(0) as usize], 1);
    assert_eq!(snap.entries[0].count, 5);
}

#[test]
fn clear_returns_the_identity_until_the_next_update() {
    let mut sess = agg_session(AggFunc::Sum);
    sess.record_aggregation(AGG_VAR, 0, b"", 100).unwrap();
    assert_eq!(sess.aggregations().unwrap().entries[0].body[0], 100);

    sess.clear_aggregation(AGG_VAR).unwrap();
    assert!(sess.aggregations().unwrap().entries.is_empty());

    sess.record_aggregation(AGG_VAR, 1, b"", 7).unwrap();
    assert_eq!(sess.aggregations().unwrap().entries[0].body[0], 7);
}

#[test]
fn keyed_entries_sort_lexicographically_and_truncate() {
    let mut sess = agg_session(AggFunc::Count);
    for key in [4u64, 2, 9, 1] {
        sess.record_aggregation(AGG_VAR, 0, &key.to_le_bytes(), 0)
            .unwrap();
    }
    let mut snap = sess.aggregations().unwrap();
    let keys: Vec<u64> = snap
        .entries
        .iter()
        .map(|e| u64::from_le_bytes(e.key[..8].try_into().unwrap()))
        .collect();
    assert_eq!(keys, vec![1, 2, 4, 9]);

    snap.trunc(-2);
    let keys: Vec<u64> = snap
        .entries
        .iter()
        .map(|e| u64::from_le_bytes(e.key[..8].try_into().unwrap()))
        .collect();
    assert_eq!(keys, vec![4, 9]);
}

#[test]
fn normalization_applies_at_display_time() {
    let mut sess = agg_session(AggFunc::Sum);
    sess.record_aggregation(AGG_VAR, 0, b"", 1_000_000).unwrap();
    sess.normalize(AGG_VAR, 1000);
    let snap = sess.aggregations().unwrap();
    assert_eq!(snap.entries[0].normalized(), vec![1000]);
    // The stored body is untouched.
    assert_eq!(snap.entries[0].body[0], 1_000_000);
}
