//! Speculation control.
//!
//! A speculation is a numbered slot in the `specs` map holding three
//! counters: records `written` into the speculation, records `drained`
//! out of it, and a `draining` flag set by commit or discard. Slots are
//! reserved by a create-if-absent update, so two CPUs can never obtain
//! the same id; a slot becomes reusable only after draining completes
//! and the entry is retired.
//!
//! The consumer holds speculative records user-side until the clause
//! commits or discards them; [`SpecBuffers`] is that holding area.

use rustc_hash::FxHashMap;

use dweave_dif::difo::MapRef;

use crate::maps::{MapBackend, UpdateFlag};
use crate::{RtResult, RuntimeError};

/// The control block of one speculation slot.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SpecState {
    /// Records written into the speculation.
    pub written: u64,
    /// Records drained since commit or discard.
    pub drained: u64,
    /// Set once commit or discard has been issued.
    pub draining: bool,
}

impl SpecState {
    /// Decode from the 24-byte map value.
    pub fn decode(bytes: &[u8]) -> Self {
        SpecState {
            written: u64::from_le_bytes(bytes[..8].try_into().unwrap()),
            drained: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            draining: u64::from_le_bytes(bytes[16..24].try_into().unwrap()) != 0,
        }
    }

    /// Encode to the 24-byte map value.
    pub fn encode(&self) -> [u8; 24] {
        let mut bytes = [0; 24];
        bytes[..8].copy_from_slice(&self.written.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.drained.to_le_bytes());
        bytes[16..24].copy_from_slice(&u64::from(self.draining).to_le_bytes());
        bytes
    }
}

/// The configured number of slots, from the map plan.
pub fn nspec<B: MapBackend>(backend: &B) -> RtResult<u32> {
    Ok(backend.spec(MapRef::Specs)?.max_entries)
}

/// The state of slot `id`, if reserved.
pub fn state<B: MapBackend>(backend: &B, id: u32) -> RtResult<Option<SpecState>> {
    Ok(backend
        .lookup(MapRef::Specs, &id.to_le_bytes())?
        .map(|b| SpecState::decode(&b)))
}

/// Reserve a free slot; returns 0 when all slots are busy.
pub fn reserve<B: MapBackend>(backend: &mut B) -> RtResult<u32> {
    let zero = SpecState::default().encode();
    for id in 1..=nspec(backend)? {
        match backend.update(MapRef::Specs, &id.to_le_bytes(), &zero, UpdateFlag::NoExist) {
            Ok(()) => return Ok(id),
            Err(RuntimeError::Exists(_)) | Err(RuntimeError::MapFull(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(0)
}

/// Note one record written into slot `id`, as a speculating probe
/// would. Returns -1 once the slot is draining or was never reserved.
pub fn speculate<B: MapBackend>(backend: &mut B, id: u32) -> RtResult<i64> {
    let key = id.to_le_bytes();
    let Some(bytes) = backend.lookup(MapRef::Specs, &key)? else {
        return Ok(-1);
    };
    let mut st = SpecState::decode(&bytes);
    if st.draining {
        return Ok(-1);
    }
    st.written += 1;
    backend.update(MapRef::Specs, &key, &st.encode(), UpdateFlag::Any)?;
    Ok(0)
}

/// Mark slot `id` drainable for commit or discard.
///
/// Returns `false` when the slot was never reserved; an id beyond the
/// configured range is the caller's invalid-operation fault.
pub fn mark_drain<B: MapBackend>(backend: &mut B, id: u32) -> RtResult<bool> {
    let key = id.to_le_bytes();
    let Some(bytes) = backend.lookup(MapRef::Specs, &key)? else {
        return Ok(false);
    };
    let mut st = SpecState::decode(&bytes);
    st.draining = true;
    backend.update(MapRef::Specs, &key, &st.encode(), UpdateFlag::Any)?;
    Ok(true)
}

/// Account `n` drained records; once everything written has drained,
/// the slot is retired and becomes reservable again.
pub fn note_drained<B: MapBackend>(backend: &mut B, id: u32, n: u64) -> RtResult<()> {
    let key = id.to_le_bytes();
    let Some(bytes) = backend.lookup(MapRef::Specs, &key)? else {
        return Ok(());
    };
    let mut st = SpecState::decode(&bytes);
    st.drained = st.drained.saturating_add(n);
    if st.draining && st.drained >= st.written {
        backend.delete(MapRef::Specs, &key)?;
        return Ok(());
    }
    backend.update(MapRef::Specs, &key, &st.encode(), UpdateFlag::Any)?;
    Ok(())
}

/// User-side holding area for speculative records awaiting commit or
/// discard.
#[derive(Debug, Default)]
pub struct SpecBuffers {
    held: FxHashMap<u32, Vec<Vec<u8>>>,
}

impl SpecBuffers {
    /// Create an empty holding area.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold one record for slot `id`.
    pub fn hold(&mut self, id: u32, record: Vec<u8>) {
        self.held.entry(id).or_default().push(record);
    }

    /// Take every held record for `id`, in arrival order.
    pub fn take(&mut self, id: u32) -> Vec<Vec<u8>> {
        self.held.remove(&id).unwrap_or_default()
    }

    /// Number of records currently held for `id`.
    pub fn pending(&self, id: u32) -> usize {
        self.held.get(&id).map(Vec::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maps::{MapPlan, MemBackend, PlanInputs};

    fn backend(nspec_slots: u32) -> MemBackend {
        let mut be = MemBackend::new(1);
        MapPlan::new(&PlanInputs {
            ncpus: 1,
            nprobes: 1,
            ngvars: 1,
            ntvars: 1,
            dynvar_entries: 4,
            tuple_key_size: 16,
            dvar_value_size: 16,
            naggs: 1,
            agg_entries: 4,
            agg_key_size: 8,
            agg_value_size: 32,
            nspec: nspec_slots,
            strtab_size: 64,
            max_rec_len: 64,
        })
        .create_all(&mut be)
        .unwrap();
        be
    }

    #[test]
    fn lifecycle() {
        let mut be = backend(2);

        let id = reserve(&mut be).unwrap();
        assert_ne!(id, 0);
        assert_eq!(speculate(&mut be, id).unwrap(), 0);
        assert_eq!(speculate(&mut be, id).unwrap(), 0);
        assert_eq!(state(&be, id).unwrap().unwrap().written, 2);

        assert!(mark_drain(&mut be, id).unwrap());
        // Draining slots refuse further writes.
        assert_eq!(speculate(&mut be, id).unwrap(), -1);

        note_drained(&mut be, id, 1).unwrap();
        assert!(state(&be, id).unwrap().is_some());
        note_drained(&mut be, id, 1).unwrap();
        // Fully drained: the slot retired and can be reserved again.
        assert!(state(&be, id).unwrap().is_none());
        assert_eq!(reserve(&mut be).unwrap(), id);
    }

    #[test]
    fn exhaustion_returns_zero() {
        let mut be = backend(2);
        assert_eq!(reserve(&mut be).unwrap(), 1);
        assert_eq!(reserve(&mut be).unwrap(), 2);
        assert_eq!(reserve(&mut be).unwrap(), 0);
    }

    #[test]
    fn speculate_on_unreserved_slot_fails() {
        let mut be = backend(2);
        assert_eq!(speculate(&mut be, 1).unwrap(), -1);
    }

    #[test]
    fn buffers_hold_and_take_in_order() {
        let mut bufs = SpecBuffers::new();
        bufs.hold(3, vec![1]);
        bufs.hold(3, vec![2]);
        assert_eq!(bufs.pending(3), 2);
        assert_eq!(bufs.take(3), vec![vec![1], vec![2]]);
        assert_eq!(bufs.pending(3), 0);
    }
}
