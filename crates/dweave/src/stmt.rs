//! Statements, clauses, and record layout.
//!
//! A clause binds a probe description to an optional predicate and a
//! list of actions. The layout pass here assigns each data-producing
//! action its offset and alignment within the clause's record,
//! producing the [`DataDesc`] that both the code generator (for the
//! stores) and the consumer (for decoding) work from. Records begin
//! with the 4-byte EPID and 4 pad bytes, so the first field lands
//! 8-aligned.

use dweave_dif::metadesc::{ActionKind, AggFunc, DataDesc, RecDesc};
use dweave_obj::Program;
use dweave_runtime::probe::ProbeDesc;

use crate::ast::NodeId;

/// One action of a clause.
#[derive(Clone, Debug)]
pub enum Action {
    /// Evaluate an expression for its side effects only (assignments).
    Expr(NodeId),
    /// Trace a scalar expression into the record.
    Trace(NodeId),
    /// Trace a string-valued expression into the record.
    TraceString(NodeId),
    /// Redirect this clause's record into a speculation.
    Speculate(NodeId),
    /// Commit a speculation into the live stream.
    Commit(NodeId),
    /// Discard a speculation.
    Discard(NodeId),
    /// Stop the session, tracing the exit status.
    Exit(NodeId),
    /// Update an aggregation.
    AggUpdate {
        /// The aggregation's variable id.
        varid: u32,
        /// The aggregating function.
        func: AggFunc,
        /// Key tuple expressions.
        keys: Vec<NodeId>,
        /// The observed value; `None` for `count()`.
        value: Option<NodeId>,
    },
}

/// One compiled clause before binding: probe, predicate, actions.
#[derive(Clone, Debug)]
pub struct Clause {
    /// The probe this clause fires on.
    pub probe: ProbeDesc,
    /// Skip the actions when this evaluates to zero.
    pub predicate: Option<NodeId>,
    /// The actions, in order.
    pub actions: Vec<Action>,
}

/// Maximum bytes of a traced string's content. With this bound the
/// varint length prefix is always a single byte.
pub const MAX_TRACED_STR: u32 = 64;

/// Where record data starts: after the EPID word and its pad.
pub const RECORD_DATA_OFFSET: u32 = 8;

/// Assign offsets and alignments for a clause's data-producing
/// actions.
pub fn layout(actions: &[Action]) -> DataDesc {
    let mut recs = Vec::new();
    let mut cursor = RECORD_DATA_OFFSET;

    let mut place = |action: ActionKind, size: u32, alignment: u16, arg: u64| {
        let align = u32::from(alignment.max(1));
        cursor = (cursor + align - 1) & !(align - 1);
        recs.push(RecDesc {
            action,
            size,
            offset: cursor,
            alignment,
            format: None,
            arg,
        });
        cursor += size;
    };

    for action in actions {
        match action {
            Action::Expr(_) | Action::AggUpdate { .. } => {}
            Action::Trace(_) => place(ActionKind::Difexpr, 8, 8, 0),
            Action::TraceString(_) => {
                place(ActionKind::Difexpr, 1 + MAX_TRACED_STR, 1, u64::from(MAX_TRACED_STR))
            }
            Action::Speculate(_) => place(ActionKind::Speculate, 8, 8, 0),
            Action::Commit(_) => place(ActionKind::Commit, 8, 8, 0),
            Action::Discard(_) => place(ActionKind::Discard, 8, 8, 0),
            Action::Exit(_) => place(ActionKind::Exit, 8, 8, 0),
        }
    }

    DataDesc {
        size: (cursor + 7) & !7,
        recs,
    }
}

/// A clause compiled and bound into the session.
#[derive(Debug)]
pub struct CompiledStmt {
    /// Statement id within the session.
    pub stid: u32,
    /// The probe the statement fires on.
    pub probe: ProbeDesc,
    /// The compiled clause object.
    pub difo: dweave_dif::Difo,
    /// The record layout.
    pub desc: DataDesc,
    /// EPID assigned at attach; 0 until then.
    pub epid: u32,
    /// Probe id assigned at attach; 0 until then.
    pub prid: u32,
    /// The linked, loadable program; present once the session is
    /// activated.
    pub program: Option<Program>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Ast;

    #[test]
    fn layout_aligns_and_pads() {
        let mut ast = Ast::new();
        let a = ast.int(1);
        let b = ast.str_lit("x");
        let c = ast.int(2);
        let desc = layout(&[
            Action::Trace(a),
            Action::TraceString(b),
            Action::Trace(c),
        ]);

        assert_eq!(desc.recs[0].offset, 8);
        assert_eq!(desc.recs[1].offset, 16);
        assert_eq!(desc.recs[1].size, 65);
        // The next 8-aligned slot after the string.
        assert_eq!(desc.recs[2].offset, 88);
        assert_eq!(desc.size, 96);
    }

    #[test]
    fn effect_only_actions_take_no_space() {
        let mut ast = Ast::new();
        let v = ast.int(1);
        let desc = layout(&[Action::Expr(v)]);
        assert!(desc.recs.is_empty());
        assert_eq!(desc.size, 8);
    }
}
