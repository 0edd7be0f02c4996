//! The shared maps and the map planner.
//!
//! One tracing session owns a fixed set of maps, one per
//! [`MapRef`](dweave_dif::difo::MapRef) role. The planner computes each
//! map's key size, value size, and entry count from the compile results
//! and the session options; the backend creates them and performs the
//! user-side accesses.
//!
//! [`MapBackend`] is the seam in front of the kernel: the runtime only
//! ever touches maps through it. [`MemBackend`] implements the same
//! semantics in memory, which is what the unit and integration tests
//! run against; the Linux implementation lives in [`crate::kernel`].

use std::collections::BTreeMap;

use dweave_dif::difo::MapRef;
use dweave_dif::metadesc::state;
use rustc_hash::FxHashMap;

use crate::{RtResult, RuntimeError};

/// The kernel map flavor backing a role.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MapKind {
    /// Preallocated array indexed by `u32`.
    Array,
    /// Array with one value instance per CPU.
    PerCpuArray,
    /// Hash table.
    Hash,
    /// Hash table with one value instance per CPU.
    PerCpuHash,
    /// Array of perf ring-buffer descriptors, one per CPU.
    PerfEventArray,
}

/// The shape of one map.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MapSpec {
    /// Which role this map serves.
    pub role: MapRef,
    /// Map flavor.
    pub kind: MapKind,
    /// Key size in bytes.
    pub key_size: u32,
    /// Value size in bytes.
    pub value_size: u32,
    /// Maximum number of entries.
    pub max_entries: u32,
}

/// Everything the planner needs to size the maps.
#[derive(Clone, Debug)]
pub struct PlanInputs {
    /// Number of possible CPUs.
    pub ncpus: u32,
    /// Probes used by the session's programs.
    pub nprobes: u32,
    /// User-defined global variables.
    pub ngvars: u32,
    /// User-defined thread-local variables.
    pub ntvars: u32,
    /// Entry budget shared by the dynamic-variable maps.
    pub dynvar_entries: u32,
    /// Size of the largest associative key tuple, id included.
    pub tuple_key_size: u32,
    /// Size of the largest dynamic-variable value.
    pub dvar_value_size: u32,
    /// Number of aggregations.
    pub naggs: u32,
    /// Entry budget for aggregation storage.
    pub agg_entries: u32,
    /// Size of the largest aggregation key tuple, id included.
    pub agg_key_size: u32,
    /// Size of the largest aggregation value record.
    pub agg_value_size: u32,
    /// Configured speculation slots.
    pub nspec: u32,
    /// Final session string-table size.
    pub strtab_size: u32,
    /// Maximum record length any program emits.
    pub max_rec_len: u32,
}

/// Size of one speculation control block: written, drained, draining.
pub const SPEC_VALUE_SIZE: u32 = 24;

/// Size of one per-probe metadata record: four string-table offsets.
pub const PROBE_VALUE_SIZE: u32 = 16;

/// Size of one cpuinfo record.
pub const CPUINFO_VALUE_SIZE: u32 = 16;

/// The session's map layout.
#[derive(Clone, Debug)]
pub struct MapPlan {
    specs: Vec<MapSpec>,
}

impl MapPlan {
    /// Compute the layout for `inputs`.
    pub fn new(inputs: &PlanInputs) -> Self {
        let nz = |n: u32| n.max(1);
        let specs = vec![
            MapSpec {
                role: MapRef::Buffers,
                kind: MapKind::PerfEventArray,
                key_size: 4,
                value_size: 4,
                max_entries: nz(inputs.ncpus),
            },
            MapSpec {
                role: MapRef::Mem,
                kind: MapKind::PerCpuArray,
                key_size: 4,
                value_size: nz(inputs.max_rec_len),
                max_entries: 1,
            },
            MapSpec {
                role: MapRef::Strtab,
                kind: MapKind::Array,
                key_size: 4,
                value_size: nz(inputs.strtab_size),
                max_entries: 1,
            },
            MapSpec {
                role: MapRef::Gvars,
                kind: MapKind::Array,
                key_size: 4,
                value_size: 8,
                max_entries: nz(inputs.ngvars),
            },
            MapSpec {
                role: MapRef::Tvars,
                kind: MapKind::Array,
                key_size: 4,
                value_size: 8,
                max_entries: nz(inputs.ntvars),
            },
            MapSpec {
                role: MapRef::Dvars,
                kind: MapKind::Hash,
                key_size: 8,
                value_size: nz(inputs.dvar_value_size),
                max_entries: nz(inputs.dynvar_entries),
            },
            MapSpec {
                role: MapRef::Tuples,
                kind: MapKind::Hash,
                key_size: nz(inputs.tuple_key_size),
                value_size: 8,
                max_entries: nz(inputs.dynvar_entries),
            },
            MapSpec {
                role: MapRef::Aggs,
                kind: MapKind::PerCpuHash,
                key_size: nz(inputs.agg_key_size),
                value_size: nz(inputs.agg_value_size),
                max_entries: nz(inputs.agg_entries),
            },
            MapSpec {
                role: MapRef::AggGen,
                kind: MapKind::Array,
                key_size: 4,
                value_size: 8,
                max_entries: nz(inputs.naggs),
            },
            MapSpec {
                role: MapRef::Specs,
                kind: MapKind::Hash,
                key_size: 4,
                value_size: SPEC_VALUE_SIZE,
                max_entries: nz(inputs.nspec),
            },
            MapSpec {
                role: MapRef::State,
                kind: MapKind::Array,
                key_size: 4,
                value_size: 4,
                max_entries: state::NUM_SLOTS,
            },
            MapSpec {
                role: MapRef::Cpuinfo,
                kind: MapKind::PerCpuArray,
                key_size: 4,
                value_size: CPUINFO_VALUE_SIZE,
                max_entries: 1,
            },
            MapSpec {
                role: MapRef::Probes,
                kind: MapKind::Array,
                key_size: 4,
                value_size: PROBE_VALUE_SIZE,
                max_entries: nz(inputs.nprobes),
            },
        ];
        MapPlan { specs }
    }

    /// The spec for `role`.
    pub fn get(&self, role: MapRef) -> &MapSpec {
        self.specs
            .iter()
            .find(|s| s.role == role)
            .expect("every role is planned")
    }

    /// All specs in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &MapSpec> {
        self.specs.iter()
    }

    /// Create every planned map in `backend`.
    pub fn create_all<B: MapBackend>(&self, backend: &mut B) -> RtResult<()> {
        for spec in &self.specs {
            log::debug!(
                "creating map '{}' (key {}, value {}, entries {})",
                spec.role,
                spec.key_size,
                spec.value_size,
                spec.max_entries
            );
            backend.create(spec)?;
        }
        Ok(())
    }
}

/// Update dispositions, mirroring the kernel's map-update flags.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UpdateFlag {
    /// Create or overwrite.
    Any,
    /// Create only; fail if the key exists.
    NoExist,
    /// Overwrite only; fail if the key is absent.
    Exist,
}

/// User-side access to the session maps.
///
/// Multi-operation protocols (create-if-absent and friends) are built
/// on these single operations, each of which is atomic on the kernel
/// side.
pub trait MapBackend {
    /// Create a map. Called once per role at session start.
    fn create(&mut self, spec: &MapSpec) -> RtResult<()>;

    /// The spec a map was created with.
    fn spec(&self, role: MapRef) -> RtResult<&MapSpec>;

    /// Read an element. Array-flavored maps yield zero-filled values
    /// for in-range keys that were never written.
    fn lookup(&self, role: MapRef, key: &[u8]) -> RtResult<Option<Vec<u8>>>;

    /// Read every per-CPU instance of an element.
    fn lookup_percpu(&self, role: MapRef, key: &[u8]) -> RtResult<Option<Vec<Vec<u8>>>>;

    /// Write an element.
    fn update(&mut self, role: MapRef, key: &[u8], value: &[u8], flag: UpdateFlag)
        -> RtResult<()>;

    /// Remove an element.
    fn delete(&mut self, role: MapRef, key: &[u8]) -> RtResult<()>;

    /// Snapshot of all keys currently present.
    fn keys(&self, role: MapRef) -> RtResult<Vec<Vec<u8>>>;
}

struct MemMap {
    spec: MapSpec,
    // Key -> one value per CPU instance (a single instance for global
    // maps). BTreeMap keeps iteration deterministic.
    entries: BTreeMap<Vec<u8>, Vec<Vec<u8>>>,
}

impl MemMap {
    fn is_percpu(&self) -> bool {
        matches!(self.spec.kind, MapKind::PerCpuArray | MapKind::PerCpuHash)
    }

    fn is_array(&self) -> bool {
        matches!(
            self.spec.kind,
            MapKind::Array | MapKind::PerCpuArray | MapKind::PerfEventArray
        )
    }

    fn array_index(&self, key: &[u8]) -> Option<u32> {
        let idx = u32::from_le_bytes(key.try_into().ok()?);
        (idx < self.spec.max_entries).then_some(idx)
    }
}

/// An in-memory [`MapBackend`] with kernel-map semantics.
pub struct MemBackend {
    ncpus: u32,
    maps: FxHashMap<MapRef, MemMap>,
}

impl MemBackend {
    /// Create a backend simulating `ncpus` CPUs.
    pub fn new(ncpus: u32) -> Self {
        MemBackend {
            ncpus: ncpus.max(1),
            maps: FxHashMap::default(),
        }
    }

    /// Number of simulated CPUs.
    pub fn ncpus(&self) -> u32 {
        self.ncpus
    }

    fn map(&self, role: MapRef) -> RtResult<&MemMap> {
        self.maps.get(&role).ok_or(RuntimeError::NoSuchMap(role))
    }

    fn map_mut(&mut self, role: MapRef) -> RtResult<&mut MemMap> {
        self.maps
            .get_mut(&role)
            .ok_or(RuntimeError::NoSuchMap(role))
    }

    fn check_key(m: &MemMap, key: &[u8]) -> RtResult<()> {
        if key.len() != m.spec.key_size as usize {
            return Err(RuntimeError::BadKeySize {
                map: m.spec.role,
                expected: m.spec.key_size,
                got: key.len(),
            });
        }
        Ok(())
    }

    /// Write one CPU's instance of an element, as a probe firing on
    /// that CPU would. Only meaningful for per-CPU maps; used by tests
    /// standing in for the kernel.
    pub fn update_cpu(
        &mut self,
        role: MapRef,
        cpu: u32,
        key: &[u8],
        value: &[u8],
    ) -> RtResult<()> {
        let ncpus = self.ncpus as usize;
        let m = self.map_mut(role)?;
        debug_assert!(m.is_percpu());
        Self::check_key(m, key)?;
        let vsize = m.spec.value_size as usize;
        if value.len() != vsize {
            return Err(RuntimeError::BadValueSize {
                map: m.spec.role,
                expected: m.spec.value_size,
                got: value.len(),
            });
        }
        if !m.entries.contains_key(key) && m.entries.len() >= m.spec.max_entries as usize {
            return Err(RuntimeError::MapFull(role));
        }
        let slot = m
            .entries
            .entry(key.to_vec())
            .or_insert_with(|| vec![vec![0; vsize]; ncpus]);
        slot[cpu as usize] = value.to_vec();
        Ok(())
    }
}

impl MapBackend for MemBackend {
    fn create(&mut self, spec: &MapSpec) -> RtResult<()> {
        self.maps.insert(
            spec.role,
            MemMap {
                spec: *spec,
                entries: BTreeMap::new(),
            },
        );
        Ok(())
    }

    fn spec(&self, role: MapRef) -> RtResult<&MapSpec> {
        Ok(&self.map(role)?.spec)
    }

    fn lookup(&self, role: MapRef, key: &[u8]) -> RtResult<Option<Vec<u8>>> {
        let m = self.map(role)?;
        Self::check_key(m, key)?;
        if let Some(vals) = m.entries.get(key) {
            return Ok(Some(vals[0].clone()));
        }
        if m.is_array() && m.array_index(key).is_some() {
            return Ok(Some(vec![0; m.spec.value_size as usize]));
        }
        Ok(None)
    }

    fn lookup_percpu(&self, role: MapRef, key: &[u8]) -> RtResult<Option<Vec<Vec<u8>>>> {
        let m = self.map(role)?;
        Self::check_key(m, key)?;
        if let Some(vals) = m.entries.get(key) {
            if m.is_percpu() {
                return Ok(Some(vals.clone()));
            }
            return Ok(Some(vec![vals[0].clone()]));
        }
        if m.is_array() && m.array_index(key).is_some() {
            let zero = vec![0; m.spec.value_size as usize];
            let n = if m.is_percpu() { self.ncpus as usize } else { 1 };
            return Ok(Some(vec![zero; n]));
        }
        Ok(None)
    }

    fn update(
        &mut self,
        role: MapRef,
        key: &[u8],
        value: &[u8],
        flag: UpdateFlag,
    ) -> RtResult<()> {
        let ncpus = self.ncpus as usize;
        let m = self.map_mut(role)?;
        Self::check_key(m, key)?;
        if value.len() != m.spec.value_size as usize {
            return Err(RuntimeError::BadValueSize {
                map: m.spec.role,
                expected: m.spec.value_size,
                got: value.len(),
            });
        }

        let present = m.entries.contains_key(key)
            || (m.is_array() && m.array_index(key).is_some());
        match flag {
            UpdateFlag::NoExist if present => return Err(RuntimeError::Exists(role)),
            UpdateFlag::Exist if !present => return Err(RuntimeError::NotFound(role)),
            _ => {}
        }

        if !m.entries.contains_key(key) {
            let cap = m.spec.max_entries as usize;
            if !m.is_array() && m.entries.len() >= cap {
                return Err(RuntimeError::MapFull(role));
            }
            if m.is_array() && m.array_index(key).is_none() {
                return Err(RuntimeError::NotFound(role));
            }
        }

        // A user-side update writes every per-CPU instance.
        let n = if m.is_percpu() { ncpus } else { 1 };
        m.entries.insert(key.to_vec(), vec![value.to_vec(); n]);
        Ok(())
    }

    fn delete(&mut self, role: MapRef, key: &[u8]) -> RtResult<()> {
        let m = self.map_mut(role)?;
        Self::check_key(m, key)?;
        m.entries.remove(key);
        Ok(())
    }

    fn keys(&self, role: MapRef) -> RtResult<Vec<Vec<u8>>> {
        Ok(self.map(role)?.entries.keys().cloned().collect())
    }
}

/// Read a 32-bit state counter.
pub fn read_counter<B: MapBackend>(backend: &B, slot: i32) -> RtResult<u32> {
    let key = slot.to_le_bytes();
    let val = backend
        .lookup(MapRef::State, &key)?
        .unwrap_or_else(|| vec![0; 4]);
    Ok(u32::from_le_bytes(val[..4].try_into().unwrap()))
}

/// Add to a 32-bit state counter, as a program would.
pub fn bump_counter<B: MapBackend>(backend: &mut B, slot: i32, by: u32) -> RtResult<()> {
    let key = slot.to_le_bytes();
    let cur = read_counter(backend, slot)?;
    backend.update(
        MapRef::State,
        &key,
        &(cur + by).to_le_bytes(),
        UpdateFlag::Any,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> PlanInputs {
        PlanInputs {
            ncpus: 4,
            nprobes: 2,
            ngvars: 3,
            ntvars: 1,
            dynvar_entries: 64,
            tuple_key_size: 32,
            dvar_value_size: 16,
            naggs: 2,
            agg_entries: 128,
            agg_key_size: 16,
            agg_value_size: 16 + 127 * 8,
            nspec: 4,
            strtab_size: 512,
            max_rec_len: 256,
        }
    }

    #[test]
    fn plan_covers_every_role() {
        let plan = MapPlan::new(&inputs());
        for role in MapRef::ALL {
            let spec = plan.get(role);
            assert_eq!(spec.role, role);
            assert!(spec.max_entries > 0);
        }
        assert_eq!(plan.get(MapRef::Buffers).max_entries, 4);
        assert_eq!(plan.get(MapRef::Mem).value_size, 256);
        assert_eq!(plan.get(MapRef::Specs).value_size, SPEC_VALUE_SIZE);
        assert_eq!(plan.get(MapRef::State).max_entries, state::NUM_SLOTS);
    }

    #[test]
    fn array_maps_read_zero_when_unwritten() {
        let mut be = MemBackend::new(2);
        MapPlan::new(&inputs()).create_all(&mut be).unwrap();
        let val = be.lookup(MapRef::Gvars, &1u32.to_le_bytes()).unwrap();
        assert_eq!(val, Some(vec![0; 8]));
        // Out of range reads miss.
        let val = be.lookup(MapRef::Gvars, &9u32.to_le_bytes()).unwrap();
        assert_eq!(val, None);
    }

    #[test]
    fn hash_map_caps_and_noexist() {
        let mut be = MemBackend::new(1);
        be.create(&MapSpec {
            role: MapRef::Specs,
            kind: MapKind::Hash,
            key_size: 4,
            value_size: 4,
            max_entries: 2,
        })
        .unwrap();

        let k = |n: u32| n.to_le_bytes();
        be.update(MapRef::Specs, &k(1), &[1; 4], UpdateFlag::NoExist)
            .unwrap();
        assert!(matches!(
            be.update(MapRef::Specs, &k(1), &[2; 4], UpdateFlag::NoExist),
            Err(RuntimeError::Exists(_))
        ));
        be.update(MapRef::Specs, &k(2), &[2; 4], UpdateFlag::Any)
            .unwrap();
        assert!(matches!(
            be.update(MapRef::Specs, &k(3), &[3; 4], UpdateFlag::Any),
            Err(RuntimeError::MapFull(_))
        ));
        be.delete(MapRef::Specs, &k(1)).unwrap();
        be.update(MapRef::Specs, &k(3), &[3; 4], UpdateFlag::Any)
            .unwrap();
    }

    #[test]
    fn percpu_updates_are_isolated() {
        let mut be = MemBackend::new(2);
        MapPlan::new(&inputs()).create_all(&mut be).unwrap();
        let key = vec![0u8; 16];
        let mut v0 = vec![0u8; 16 + 127 * 8];
        v0[8] = 1;
        be.update_cpu(MapRef::Aggs, 0, &key, &v0).unwrap();

        let vals = be.lookup_percpu(MapRef::Aggs, &key).unwrap().unwrap();
        assert_eq!(vals.len(), 2);
        assert_eq!(vals[0][8], 1);
        assert_eq!(vals[1][8], 0);
    }

    #[test]
    fn counters() {
        let mut be = MemBackend::new(1);
        MapPlan::new(&inputs()).create_all(&mut be).unwrap();
        assert_eq!(read_counter(&be, state::FAULTS).unwrap(), 0);
        bump_counter(&mut be, state::FAULTS, 2).unwrap();
        bump_counter(&mut be, state::FAULTS, 1).unwrap();
        assert_eq!(read_counter(&be, state::FAULTS).unwrap(), 3);
    }
}
