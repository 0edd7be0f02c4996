//! Compile → link → activate → produce → consume.

use dweave::ast::Ast;
use dweave::stmt::{Action, MAX_TRACED_STR};
use dweave::{DebugSink, Options, Session};
use dweave_dif::dis::Listings;
use dweave_dif::metadesc::{FaultKind, ERROR_EPID, ERROR_RECORD_SIZE};
use dweave_dif::varint;
use dweave_runtime::consume::Event;

use crate::{clause, int_trace_session, raw_record, small_session};

#[test]
fn scalar_record_roundtrip() {
    let (mut sess, _ast, stid) = int_trace_session();
    let epid = sess.epid_of(stid).unwrap();

    // One firing on each CPU, as the loaded program would emit.
    let record = raw_record(epid, 16, |raw| {
        raw[8..16].copy_from_slice(&42u64.to_le_bytes());
    });
    for cpu in 0..2 {
        assert!(sess.pebs_mut().unwrap().ring_mut(cpu).produce(&record));
    }

    let mut got = Vec::new();
    sess.consume(|ev| {
        if let Event::Data(data) = ev {
            got.push((data.cpu, data.value(0).unwrap()));
        }
    })
    .unwrap();
    assert_eq!(got, vec![(0, 42), (1, 42)]);
    assert_eq!(sess.drops().unwrap(), Default::default());
}

#[test]
fn string_records_use_the_varint_prefix() {
    let mut sess = small_session();
    let mut ast = Ast::new();
    let s = ast.str_lit("payload");
    let stid = sess
        .compile(&ast, &clause(vec![Action::TraceString(s)]))
        .unwrap();
    sess.go().unwrap();
    let epid = sess.epid_of(stid).unwrap();

    // Field layout: prefix byte + content, at offset 8.
    let size = 8 + 1 + MAX_TRACED_STR;
    let record = raw_record(epid, (size + 7) & !7, |raw| {
        let mut buf = [0u8; varint::MAX_BYTES];
        let n = varint::encode(7, &mut buf);
        assert_eq!(n, 1);
        raw[8] = buf[0];
        raw[9..16].copy_from_slice(b"payload");
    });
    sess.pebs_mut().unwrap().ring_mut(0).produce(&record);

    let mut strings = Vec::new();
    sess.consume(|ev| {
        if let Event::Data(data) = ev {
            strings.push(data.string(0).unwrap().to_vec());
        }
    })
    .unwrap();
    assert_eq!(strings, vec![b"payload".to_vec()]);
}

#[test]
fn error_records_surface_as_faults() {
    let (mut sess, _ast, _stid) = int_trace_session();

    let record = raw_record(ERROR_EPID, ERROR_RECORD_SIZE, |raw| {
        let args: [u64; 6] = [0, 1, 0, 17, 3, 0xbad];
        for (i, a) in args.iter().enumerate() {
            raw[8 + 8 * i..16 + 8 * i].copy_from_slice(&a.to_le_bytes());
        }
    });
    sess.pebs_mut().unwrap().ring_mut(1).produce(&record);

    let mut faults = Vec::new();
    sess.consume(|ev| {
        if let Event::Error(err) = ev {
            faults.push(err);
        }
    })
    .unwrap();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].fault, Some(FaultKind::DivZero));
    assert_eq!(faults[0].offset, 17);
    assert_eq!(faults[0].value, 0xbad);
}

#[test]
fn exit_record_stops_the_consumer() {
    let mut sess = small_session();
    let mut ast = Ast::new();
    let status = ast.int(0);
    let stid = sess
        .compile(&ast, &clause(vec![Action::Exit(status)]))
        .unwrap();
    sess.go().unwrap();
    let epid = sess.epid_of(stid).unwrap();

    let record = raw_record(epid, 16, |_| {});
    sess.pebs_mut().unwrap().ring_mut(0).produce(&record);

    assert!(!sess.stopped());
    sess.consume(|_| {}).unwrap();
    assert!(sess.stopped());

    // Stopped sessions deliver nothing further.
    sess.pebs_mut().unwrap().ring_mut(0).produce(&record);
    let stats = sess.consume(|_| panic!("stopped")).unwrap();
    assert_eq!(stats.records, 0);
}

#[test]
fn listings_reach_the_debug_sink() {
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Capture(Arc<Mutex<Vec<String>>>);
    impl DebugSink for Capture {
        fn line(&mut self, msg: &str) {
            self.0.lock().unwrap().push(msg.to_string());
        }
    }

    let lines = Arc::new(Mutex::new(Vec::new()));
    let mut opts = Options::default();
    opts.set("disasm", "15").unwrap(); // all four listings
    assert_eq!(opts.listings, Listings::all());

    let mut sess = Session::simulated(opts, 1);
    sess.set_debug_sink(Box::new(Capture(lines.clone())));

    let mut ast = Ast::new();
    let v = ast.int(9);
    sess.compile(&ast, &clause(vec![Action::Trace(v)])).unwrap();
    sess.go().unwrap();

    let lines = lines.lock().unwrap();
    assert!(lines.iter().any(|l| l.contains("clause 0")));
    assert!(lines.iter().any(|l| l.contains("linked statement 0")));
    assert!(lines.iter().any(|l| l.contains("final statement 0")));
    // The linked listing names the support routines it pulled in.
    assert!(lines.iter().any(|l| l.contains("insns")));
}

#[test]
fn rollback_on_failed_activation() {
    // A string table over the cap fails activation; the partial
    // attachment must be rolled back.
    let mut opts = Options::default();
    opts.strsize = 8;
    let mut sess = Session::simulated(opts, 1);
    let mut ast = Ast::new();
    let v = ast.int(1);
    let stid = sess
        .compile(&ast, &clause(vec![Action::Trace(v)]))
        .unwrap();
    assert!(sess.go().is_err());
    assert!(sess.pebs_mut().is_none());
    let _ = stid;
}
