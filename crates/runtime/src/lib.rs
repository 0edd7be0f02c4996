//! The runtime data plane for dweave.
//!
//! Everything that happens after a program is linked lives here: the
//! shared maps between user and kernel ([`maps`]), the dynamic-variable
//! key scheme ([`dvar`]), the aggregation engine ([`agg`]), speculation
//! tracking ([`spec`]), the per-CPU perf-style ring buffers ([`ring`]),
//! the consumer loop ([`consume`]), and the probe/ECB registry that maps
//! the data stream back to record descriptors ([`probe`]).
//!
//! The kernel itself sits behind two seams: [`maps::MapBackend`] for map
//! access and the ring-walk code in [`ring`], both of which have
//! in-memory implementations. The Linux bindings in [`kernel`] provide
//! the real thing; nothing else in the crate performs a syscall.

pub mod agg;
pub mod conf;
pub mod consume;
pub mod dvar;
pub mod maps;
pub mod probe;
pub mod ring;
pub mod spec;

#[cfg(target_os = "linux")]
pub mod kernel;

pub use crate::conf::CpuConfig;
pub use crate::consume::{Consumer, Event};
pub use crate::maps::{MapBackend, MapKind, MapPlan, MapSpec, MemBackend, UpdateFlag};
pub use crate::probe::{Ecb, EpidTable, ProbeDesc};

use dweave_dif::difo::MapRef;
use thiserror::Error;

/// Errors surfaced by the data plane.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A map reached its configured entry cap.
    #[error("map '{0}' is full")]
    MapFull(MapRef),

    /// A key did not match the map's key size.
    #[error("map '{map}' key size mismatch: expected {expected}, got {got}")]
    BadKeySize {
        /// The map.
        map: MapRef,
        /// Key size from the map spec.
        expected: u32,
        /// Size actually supplied.
        got: usize,
    },

    /// A value did not match the map's value size.
    #[error("map '{map}' value size mismatch: expected {expected}, got {got}")]
    BadValueSize {
        /// The map.
        map: MapRef,
        /// Value size from the map spec.
        expected: u32,
        /// Size actually supplied.
        got: usize,
    },

    /// An update-if-absent found the key already present.
    #[error("element already exists in map '{0}'")]
    Exists(MapRef),

    /// An update-if-present found no element.
    #[error("no such element in map '{0}'")]
    NotFound(MapRef),

    /// The map was never created; the planner and the program disagree.
    #[error("map '{0}' has not been created")]
    NoSuchMap(MapRef),

    /// A probe descriptor field exceeded its length bound.
    #[error("probe descriptor field '{field}' exceeds {max} bytes")]
    ProbeNameTooLong {
        /// Which field.
        field: &'static str,
        /// The bound.
        max: usize,
    },

    /// A record in the data stream was shorter than its descriptor.
    #[error("short record: {got} bytes, descriptor wants {want}")]
    ShortRecord {
        /// Bytes present.
        got: usize,
        /// Bytes the descriptor requires.
        want: usize,
    },

    /// A record carried an EPID nobody registered.
    #[error("unknown enabled-probe id {0}")]
    UnknownEpid(u32),

    /// An aggregation id with no registered descriptor.
    #[error("unknown aggregation id {0}")]
    UnknownAgg(u32),

    /// A kernel call failed; the raw errno is preserved.
    #[error("{call} failed with errno {errno}")]
    Sys {
        /// The syscall or ioctl that failed.
        call: &'static str,
        /// Raw errno value.
        errno: i32,
    },

    /// CPU configuration could not be read.
    #[error("cannot determine CPU configuration: {0}")]
    Config(String),
}

/// Convenience alias for data-plane results.
pub type RtResult<T> = Result<T, RuntimeError>;
