//! Speculation lifecycle through a session: reserve, speculate,
//! commit or discard, drain, reuse.

use dweave::ast::Ast;
use dweave::stmt::Action;
use dweave_runtime::consume::Event;
use dweave_runtime::spec;

use crate::{clause, raw_record, small_session};

#[test]
fn committed_speculation_is_delivered_in_order() {
    let mut sess = small_session();
    let mut ast = Ast::new();
    let id_expr = ast.builtin(dweave_dif::vartab::Builtin::Arg(0));
    let spec_stid = sess
        .compile(&ast, &clause(vec![Action::Speculate(id_expr)]))
        .unwrap();
    let commit_stid = sess
        .compile(&ast, &clause(vec![Action::Commit(id_expr)]))
        .unwrap();
    sess.go().unwrap();

    let spec_epid = sess.epid_of(spec_stid).unwrap();
    let commit_epid = sess.epid_of(commit_stid).unwrap();

    // Reserve a slot and write two speculative records, as the
    // programs would.
    let id = spec::reserve(sess.backend_mut()).unwrap();
    assert!(id >= 1 && id <= 4);

    for _ in 0..2 {
        assert_eq!(spec::speculate(sess.backend_mut(), id).unwrap(), 0);
        let rec = raw_record(spec_epid, 16, |raw| {
            raw[8..16].copy_from_slice(&u64::from(id).to_le_bytes());
        });
        sess.pebs_mut().unwrap().ring_mut(0).produce(&rec);
    }

    // Nothing reaches the consumer until commit.
    let mut seen = Vec::new();
    sess.consume(|ev| {
        if let Event::Data(d) = ev {
            seen.push(d.epid);
        }
    })
    .unwrap();
    assert!(seen.is_empty());

    // A draining slot refuses new writes once commit lands.
    let commit = raw_record(commit_epid, 16, |raw| {
        raw[8..16].copy_from_slice(&u64::from(id).to_le_bytes());
    });
    sess.pebs_mut().unwrap().ring_mut(0).produce(&commit);
    sess.consume(|ev| {
        if let Event::Data(d) = ev {
            seen.push(d.epid);
        }
    })
    .unwrap();
    assert_eq!(seen, vec![spec_epid, spec_epid]);
    assert_eq!(spec::speculate(sess.backend_mut(), id).unwrap(), -1);

    // Fully drained: the slot is reusable.
    assert!(spec::state(sess.backend_mut(), id).unwrap().is_none());
    assert_eq!(spec::reserve(sess.backend_mut()).unwrap(), id);
}

#[test]
fn discarded_speculation_counts_drops() {
    let mut sess = small_session();
    let mut ast = Ast::new();
    let id_expr = ast.builtin(dweave_dif::vartab::Builtin::Arg(0));
    let spec_stid = sess
        .compile(&ast, &clause(vec![Action::Speculate(id_expr)]))
        .unwrap();
    let discard_stid = sess
        .compile(&ast, &clause(vec![Action::Discard(id_expr)]))
        .unwrap();
    sess.go().unwrap();

    let spec_epid = sess.epid_of(spec_stid).unwrap();
    let discard_epid = sess.epid_of(discard_stid).unwrap();

    let id = spec::reserve(sess.backend_mut()).unwrap();
    spec::speculate(sess.backend_mut(), id).unwrap();
    let rec = raw_record(spec_epid, 16, |raw| {
        raw[8..16].copy_from_slice(&u64::from(id).to_le_bytes());
    });
    sess.pebs_mut().unwrap().ring_mut(1).produce(&rec);
    let discard = raw_record(discard_epid, 16, |raw| {
        raw[8..16].copy_from_slice(&u64::from(id).to_le_bytes());
    });
    sess.pebs_mut().unwrap().ring_mut(1).produce(&discard);

    let mut delivered = 0;
    sess.consume(|ev| {
        if matches!(ev, Event::Data(_)) {
            delivered += 1;
        }
    })
    .unwrap();
    assert_eq!(delivered, 0);
    assert_eq!(sess.drops().unwrap().spec, 1);
    assert!(spec::state(sess.backend_mut(), id).unwrap().is_none());
}

#[test]
fn exhausted_slots_reserve_as_zero() {
    let mut sess = small_session(); // nspec = 4
    let mut ast = Ast::new();
    let v = ast.int(1);
    sess.compile(&ast, &clause(vec![Action::Trace(v)])).unwrap();
    sess.go().unwrap();

    for expect in 1..=4 {
        assert_eq!(spec::reserve(sess.backend_mut()).unwrap(), expect);
    }
    assert_eq!(spec::reserve(sess.backend_mut()).unwrap(), 0);
}
