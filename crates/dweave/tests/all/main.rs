//! End-to-end suites driving the whole pipeline against the in-memory
//! backend: compile, link, activate, produce records the way the
//! kernel would, and consume them back.

mod aggregate;
mod pipeline;
mod speculation;

use dweave::ast::Ast;
use dweave::stmt::Clause;
use dweave::{Options, Session};
use dweave_runtime::maps::MemBackend;
use dweave_runtime::probe::ProbeDesc;

/// A session on two simulated CPUs with small buffers.
pub fn small_session() -> Session<MemBackend> {
    let mut opts = Options::default();
    opts.bufsize = 4096;
    opts.nspec = 4;
    Session::simulated(opts, 2)
}

pub fn tick_probe() -> ProbeDesc {
    ProbeDesc::new("profile", "", "", "tick-1s").unwrap()
}

pub fn clause(actions: Vec<dweave::stmt::Action>) -> Clause {
    Clause {
        probe: tick_probe(),
        predicate: None,
        actions,
    }
}

/// Build a raw record: EPID word, pad, then caller-placed bytes.
pub fn raw_record(epid: u32, size: u32, fill: impl FnOnce(&mut [u8])) -> Vec<u8> {
    let mut raw = vec![0u8; size as usize];
    raw[..4].copy_from_slice(&epid.to_le_bytes());
    fill(&mut raw);
    raw
}

/// Shorthand: an empty AST plus one integer-trace clause.
pub fn int_trace_session() -> (Session<MemBackend>, Ast, u32) {
    let mut sess = small_session();
    let mut ast = Ast::new();
    let v = ast.int(42);
    let stid = sess
        .compile(&ast, &clause(vec![dweave::stmt::Action::Trace(v)]))
        .unwrap();
    sess.go().unwrap();
    (sess, ast, stid)
}
