//! Data-stream metadata: record, data, and aggregation descriptors.
//!
//! The trace data stream carries almost no metadata of its own: each
//! record begins with a 4-byte EPID (or an aggregation id), and the
//! consumer uses that token to look up the descriptors here to learn the
//! exact byte layout. Keeping the descriptors out of the stream is what
//! keeps per-firing overhead to a handful of bytes.

use core::fmt;

/// The kind of action a record field was produced by.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub enum ActionKind {
    /// A traced D expression (scalar or string, per the record type).
    Difexpr,
    /// A formatted-output argument; the record's format reference names
    /// the format string.
    Printf,
    /// `exit()`: the record value is the exit status.
    Exit,
    /// A kernel stack trace.
    Stack,
    /// `speculate()`: redirects the clause's output to a speculation.
    Speculate,
    /// `commit()`: drains a speculation into the live stream.
    Commit,
    /// `discard()`: drops a speculation.
    Discard,
    /// An aggregation key field.
    AggKey,
    /// An aggregation data field.
    AggData,
}

/// Describes one field of a data record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecDesc {
    /// What produced this field.
    pub action: ActionKind,
    /// Size of the field in bytes.
    pub size: u32,
    /// Byte offset of the field within the record.
    pub offset: u32,
    /// Required alignment of the field.
    pub alignment: u16,
    /// Reference to a registered format string, if any.
    pub format: Option<u32>,
    /// Action-specific argument.
    pub arg: u64,
}

impl RecDesc {
    /// A scalar expression record of `size` bytes, placed by the layout
    /// pass.
    pub fn difexpr(size: u32, alignment: u16) -> Self {
        RecDesc {
            action: ActionKind::Difexpr,
            size,
            offset: 0,
            alignment,
            format: None,
            arg: 0,
        }
    }
}

/// Describes the complete record an ECB emits: the field descriptors in
/// emission order and the total padded size.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataDesc {
    /// Total record size in bytes, EPID prefix excluded.
    pub size: u32,
    /// Field descriptors in emission order.
    pub recs: Vec<RecDesc>,
}

/// An aggregating function and its binning parameters.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub enum AggFunc {
    /// Number of calls.
    Count,
    /// Running sum.
    Sum,
    /// Minimum value seen.
    Min,
    /// Maximum value seen.
    Max,
    /// Arithmetic mean (sum stored; count supplies the denominator).
    Avg,
    /// Standard deviation (sum and sum of squares stored).
    Stddev,
    /// Power-of-two frequency distribution, 127 buckets.
    Quantize,
    /// Linear frequency distribution.
    Lquantize {
        /// Lowest bucketed value.
        base: i32,
        /// Number of linear levels.
        levels: u16,
        /// Width of each level.
        step: u16,
    },
    /// Log-linear frequency distribution.
    Llquantize {
        /// Logarithm base.
        factor: u16,
        /// Lowest magnitude (power of `factor`).
        low: u16,
        /// Highest magnitude (power of `factor`).
        high: u16,
        /// Linear steps per magnitude.
        nsteps: u16,
    },
}

impl AggFunc {
    /// Number of `u64` body slots in the aggregation value record,
    /// excluding the generation and count headers.
    pub fn body_len(self) -> usize {
        match self {
            AggFunc::Count => 0,
            AggFunc::Sum | AggFunc::Min | AggFunc::Max | AggFunc::Avg => 1,
            AggFunc::Stddev => 2,
            AggFunc::Quantize => 127,
            AggFunc::Lquantize { levels, .. } => usize::from(levels) + 2,
            AggFunc::Llquantize {
                factor,
                low,
                high,
                nsteps,
            } => {
                let factor = factor.max(2);
                let per_mag = usize::from(nsteps) - usize::from(nsteps / factor);
                let mags = usize::from(high) - usize::from(low) + 1;
                mags * per_mag + 2
            }
        }
    }

    /// The seed stored in the first body slot when a value record is
    /// (re)initialized. Nonzero only for the extremum functions.
    pub fn identity(self) -> i64 {
        match self {
            AggFunc::Min => i64::MAX,
            AggFunc::Max => i64::MIN,
            _ => 0,
        }
    }

    /// The source-level name of the function.
    pub fn name(self) -> &'static str {
        match self {
            AggFunc::Count => "count",
            AggFunc::Sum => "sum",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
            AggFunc::Avg => "avg",
            AggFunc::Stddev => "stddev",
            AggFunc::Quantize => "quantize",
            AggFunc::Lquantize { .. } => "lquantize",
            AggFunc::Llquantize { .. } => "llquantize",
        }
    }
}

impl fmt::Display for AggFunc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Describes one named aggregation.
#[derive(Clone, Debug)]
pub struct AggDesc {
    /// Offset of the aggregation's name in the session string table.
    pub name: u32,
    /// Variable id of the aggregation variable.
    pub varid: u32,
    /// The aggregation id tagging records in storage.
    pub id: u32,
    /// The aggregating function.
    pub func: AggFunc,
    /// Signature used to order results with equal keys.
    pub sig: u64,
    /// Normalization divisor; 0 means not normalized.
    pub normal: u64,
    /// Total key size in bytes.
    pub ksize: u32,
    /// Total data size in bytes.
    pub dsize: u32,
    /// Key record descriptors.
    pub krecs: Vec<RecDesc>,
    /// Data record descriptors.
    pub drecs: Vec<RecDesc>,
}

/// The reserved EPID tagging error records. Regular EPIDs are
/// allocated above it.
pub const ERROR_EPID: u32 = 1;

/// Byte size of an error record: the EPID word, pad, and six 64-bit
/// arguments.
pub const ERROR_RECORD_SIZE: u32 = 8 + 6 * 8;

/// Slot indices into the session `state` map.
///
/// Each slot is a 32-bit counter updated atomically by loaded programs
/// and read (never written) by the consumer.
pub mod state {
    /// Dynamic-variable drops: the dvars or tuples map was full.
    pub const DYNVAR_DROPS: i32 = 0;
    /// Aggregation drops: the aggs map was full.
    pub const AGG_DROPS: i32 = 1;
    /// Faults reported via error records.
    pub const FAULTS: i32 = 2;
    /// Speculation records dropped on discard.
    pub const SPEC_DROPS: i32 = 3;
    /// Ring-buffer records dropped because a ring was full.
    pub const BUF_DROPS: i32 = 4;
    /// Number of slots in the state map.
    pub const NUM_SLOTS: u32 = 5;
}

/// Faults a loaded program can report through an error record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub enum FaultKind {
    /// Illegal operation (also: out-of-range speculation id).
    IllegalOp,
    /// Out-of-bounds or unmapped address.
    BadAddr,
    /// Division or remainder by zero.
    DivZero,
    /// Scratch-space exhaustion.
    NoScratch,
    /// Misaligned or otherwise illegal dereference.
    BadDeref,
    /// Associative-array key does not match the variable's tuple shape.
    TupleMismatch,
    /// Speculation buffer busy draining.
    SpecBusy,
    /// A record or dynamic variable was dropped.
    Drop,
}

impl FaultKind {
    /// The numeric fault code carried in error records.
    pub fn code(self) -> u32 {
        match self {
            FaultKind::IllegalOp => 1,
            FaultKind::BadAddr => 2,
            FaultKind::DivZero => 3,
            FaultKind::NoScratch => 4,
            FaultKind::BadDeref => 5,
            FaultKind::TupleMismatch => 6,
            FaultKind::SpecBusy => 7,
            FaultKind::Drop => 8,
        }
    }

    /// Map a numeric fault code back to its kind.
    pub fn from_code(code: u32) -> Option<FaultKind> {
        Some(match code {
            1 => FaultKind::IllegalOp,
            2 => FaultKind::BadAddr,
            3 => FaultKind::DivZero,
            4 => FaultKind::NoScratch,
            5 => FaultKind::BadDeref,
            6 => FaultKind::TupleMismatch,
            7 => FaultKind::SpecBusy,
            8 => FaultKind::Drop,
            _ => return None,
        })
    }

    /// Human-readable fault description.
    pub fn describe(self) -> &'static str {
        match self {
            FaultKind::IllegalOp => "invalid operation",
            FaultKind::BadAddr => "invalid address",
            FaultKind::DivZero => "divide-by-zero",
            FaultKind::NoScratch => "out of scratch space",
            FaultKind::BadDeref => "invalid dereference",
            FaultKind::TupleMismatch => "tuple key mismatch",
            FaultKind::SpecBusy => "speculation busy",
            FaultKind::Drop => "record dropped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_lengths_match_the_layouts() {
        assert_eq!(AggFunc::Count.body_len(), 0);
        assert_eq!(AggFunc::Sum.body_len(), 1);
        assert_eq!(AggFunc::Stddev.body_len(), 2);
        assert_eq!(AggFunc::Quantize.body_len(), 127);
        assert_eq!(
            AggFunc::Lquantize {
                base: 10,
                levels: 5,
                step: 10
            }
            .body_len(),
            7
        );
        // factor 10, magnitudes 0..=2, 10 steps: 9 bins per magnitude
        // plus underflow and overflow.
        assert_eq!(
            AggFunc::Llquantize {
                factor: 10,
                low: 0,
                high: 2,
                nsteps: 10
            }
            .body_len(),
            29
        );
    }

    #[test]
    fn extremum_identities() {
        assert_eq!(AggFunc::Min.identity(), i64::MAX);
        assert_eq!(AggFunc::Max.identity(), i64::MIN);
        assert_eq!(AggFunc::Count.identity(), 0);
    }

    #[test]
    fn fault_codes_roundtrip() {
        for code in 1..=8 {
            let kind = FaultKind::from_code(code).unwrap();
            assert_eq!(kind.code(), code);
        }
        assert_eq!(FaultKind::from_code(0), None);
        assert_eq!(FaultKind::from_code(9), None);
    }
}
