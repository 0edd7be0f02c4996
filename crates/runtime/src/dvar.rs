//! Dynamic-variable storage: thread-local scalars and associative
//! array elements.
//!
//! Every dynamic variable is addressed by a 64-bit key whose high bit
//! separates the two families:
//!
//! - direct TLS: `((tag & 0x7fffffff) << 32) | var_id`, where the tag
//!   derives from the task id (or the CPU id offset by the CPU count in
//!   idle context) plus one so it is never zero — leaving the high bit
//!   clear;
//! - associative elements: a hashed handle with the high bit set,
//!   registered in the `tuples` map under the element's key tuple.
//!
//! Storing the zero value deletes an entry; reading an absent entry
//! yields the type's default without creating anything; element
//! creation is an update-only-if-absent on `tuples`, and exhaustion
//! bumps the dynamic-variable drop counter instead of failing the
//! probe.
//!
//! The functions here are the user-side model of the semantics the
//! loaded programs implement; the consumer uses them to pre-seed and
//! to verify, and the test suites run the data plane against them.

use std::hash::{BuildHasher, BuildHasherDefault, Hasher};

use dweave_dif::difo::MapRef;
use dweave_dif::metadesc::state;

use crate::maps::{bump_counter, MapBackend, UpdateFlag};
use crate::{RtResult, RuntimeError};

/// High bit marking an associative-element handle.
const ASSOC_BIT: u64 = 1 << 63;

/// The dynamic-variable key for a thread-local scalar.
///
/// `task_id` of zero selects the idle fallback: the CPU id offset by
/// the CPU count, so idle context on each CPU gets its own slot.
pub fn tls_key(id: u32, task_id: u32, cpu: u32, ncpus: u32) -> u64 {
    let tag = if task_id == 0 {
        u64::from(cpu)
    } else {
        u64::from(task_id) + u64::from(ncpus)
    };
    let tag = tag + 1;
    ((tag & 0x7fff_ffff) << 32) | u64::from(id)
}

/// The `tuples` key for an associative element: the variable id word,
/// four pad bytes so the components stay 8-aligned, then the key
/// tuple, zero-padded to the map's key size.
pub fn tuple_key<B: MapBackend>(backend: &B, id: u32, tuple: &[u8]) -> RtResult<Vec<u8>> {
    let ksize = backend.spec(MapRef::Tuples)?.key_size as usize;
    let mut key = vec![0; ksize];
    key[..4].copy_from_slice(&id.to_le_bytes());
    let avail = ksize - 8;
    if tuple.len() > avail {
        return Err(RuntimeError::BadKeySize {
            map: MapRef::Tuples,
            expected: avail as u32,
            got: tuple.len(),
        });
    }
    key[8..8 + tuple.len()].copy_from_slice(tuple);
    Ok(key)
}

/// The stable handle for an associative element, with the high bit
/// set so it can never collide with a TLS key.
fn assoc_handle(key: &[u8]) -> u64 {
    let mut h = BuildHasherDefault::<rustc_hash::FxHasher>::default().build_hasher();
    h.write(key);
    (h.finish() | 1) | ASSOC_BIT
}

fn dvar_key_bytes(key: u64) -> [u8; 8] {
    key.to_le_bytes()
}

fn decode_value(bytes: &[u8]) -> i64 {
    i64::from_le_bytes(bytes[..8].try_into().unwrap())
}

/// Read the dynamic variable named by `key`; absent reads yield the
/// default, zero.
pub fn read<B: MapBackend>(backend: &B, key: u64) -> RtResult<i64> {
    match backend.lookup(MapRef::Dvars, &dvar_key_bytes(key))? {
        Some(bytes) => Ok(decode_value(&bytes)),
        None => Ok(0),
    }
}

/// Store `val` into the dynamic variable named by `key`. Storing zero
/// deletes the entry. Map exhaustion counts a drop and succeeds.
pub fn store<B: MapBackend>(backend: &mut B, key: u64, val: i64) -> RtResult<()> {
    let kb = dvar_key_bytes(key);
    if val == 0 {
        return backend.delete(MapRef::Dvars, &kb);
    }
    let vsize = backend.spec(MapRef::Dvars)?.value_size as usize;
    let mut value = vec![0; vsize];
    value[..8].copy_from_slice(&val.to_le_bytes());
    match backend.update(MapRef::Dvars, &kb, &value, UpdateFlag::Any) {
        Ok(()) => Ok(()),
        Err(RuntimeError::MapFull(_)) => bump_counter(backend, state::DYNVAR_DROPS, 1),
        Err(e) => Err(e),
    }
}

/// Read an associative element; absent tuples yield the default
/// without mutating anything.
pub fn read_assoc<B: MapBackend>(backend: &B, id: u32, tuple: &[u8]) -> RtResult<i64> {
    let tk = tuple_key(backend, id, tuple)?;
    match backend.lookup(MapRef::Tuples, &tk)? {
        Some(handle_bytes) => read(backend, decode_value(&handle_bytes) as u64),
        None => Ok(0),
    }
}

/// Store an associative element. Zero deletes both the element and its
/// tuple registration; creation registers the tuple at most once.
pub fn store_assoc<B: MapBackend>(
    backend: &mut B,
    id: u32,
    tuple: &[u8],
    val: i64,
) -> RtResult<()> {
    let tk = tuple_key(backend, id, tuple)?;
    let existing = backend.lookup(MapRef::Tuples, &tk)?;

    if val == 0 {
        if let Some(handle_bytes) = existing {
            backend.delete(MapRef::Tuples, &tk)?;
            store(backend, decode_value(&handle_bytes) as u64, 0)?;
        }
        return Ok(());
    }

    let handle = match existing {
        Some(handle_bytes) => decode_value(&handle_bytes) as u64,
        None => {
            let handle = assoc_handle(&tk);
            match backend.update(
                MapRef::Tuples,
                &tk,
                &handle.to_le_bytes(),
                UpdateFlag::NoExist,
            ) {
                Ok(()) => handle,
                // Lost the race: someone else registered the tuple.
                Err(RuntimeError::Exists(_)) => {
                    let bytes = backend
                        .lookup(MapRef::Tuples, &tk)?
                        .ok_or(RuntimeError::NotFound(MapRef::Tuples))?;
                    decode_value(&bytes) as u64
                }
                Err(RuntimeError::MapFull(_)) => {
                    return bump_counter(backend, state::DYNVAR_DROPS, 1);
                }
                Err(e) => return Err(e),
            }
        }
    };
    store(backend, handle, val)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maps::{read_counter, MapPlan, MemBackend, PlanInputs};

    fn backend() -> MemBackend {
        let mut be = MemBackend::new(2);
        MapPlan::new(&PlanInputs {
            ncpus: 2,
            nprobes: 1,
            ngvars: 1,
            ntvars: 1,
            dynvar_entries: 4,
            tuple_key_size: 20,
            dvar_value_size: 16,
            naggs: 1,
            agg_entries: 8,
            agg_key_size: 8,
            agg_value_size: 32,
            nspec: 2,
            strtab_size: 64,
            max_rec_len: 64,
        })
        .create_all(&mut be)
        .unwrap();
        be
    }

    #[test]
    fn tls_keys_discriminate_families() {
        let k = tls_key(0x0500, 1234, 0, 8);
        assert_eq!(k & (1 << 63), 0);
        assert_eq!(k as u32, 0x0500);

        let mut be = backend();
        store_assoc(&mut be, 0x0501, b"abcd", 9).unwrap();
        let tk = tuple_key(&be, 0x0501, b"abcd").unwrap();
        let handle = u64::from_le_bytes(
            be.lookup(MapRef::Tuples, &tk).unwrap().unwrap()[..8]
                .try_into()
                .unwrap(),
        );
        assert_ne!(handle & (1 << 63), 0);
    }

    #[test]
    fn idle_context_uses_the_cpu_fallback() {
        let a = tls_key(7, 0, 0, 4);
        let b = tls_key(7, 0, 1, 4);
        assert_ne!(a, b);
        // A task id equal to a CPU id cannot alias it.
        assert_ne!(tls_key(7, 1, 1, 4), b);
    }

    #[test]
    fn store_zero_deletes() {
        let mut be = backend();
        let key = tls_key(0x0500, 42, 0, 2);
        store(&mut be, key, 17).unwrap();
        assert_eq!(read(&be, key).unwrap(), 17);
        store(&mut be, key, 0).unwrap();
        assert_eq!(read(&be, key).unwrap(), 0);
        assert!(be.lookup(MapRef::Dvars, &key.to_le_bytes()).unwrap().is_none());
    }

    #[test]
    fn assoc_duality() {
        let mut be = backend();
        assert_eq!(read_assoc(&be, 0x0501, b"k1").unwrap(), 0);
        store_assoc(&mut be, 0x0501, b"k1", 5).unwrap();
        assert_eq!(read_assoc(&be, 0x0501, b"k1").unwrap(), 5);
        store_assoc(&mut be, 0x0501, b"k1", 0).unwrap();
        assert_eq!(read_assoc(&be, 0x0501, b"k1").unwrap(), 0);
        assert!(be.keys(MapRef::Tuples).unwrap().is_empty());
    }

    #[test]
    fn read_does_not_create() {
        let be = backend();
        assert_eq!(read_assoc(&be, 0x0501, b"nope").unwrap(), 0);
        assert!(be.keys(MapRef::Tuples).unwrap().is_empty());
    }

    #[test]
    fn exhaustion_counts_drops() {
        let mut be = backend();
        // dynvar_entries = 4; the fifth distinct tuple drops.
        for i in 0..4u8 {
            store_assoc(&mut be, 0x0501, &[i], 1).unwrap();
        }
        assert_eq!(read_counter(&be, state::DYNVAR_DROPS).unwrap(), 0);
        store_assoc(&mut be, 0x0501, &[9], 1).unwrap();
        assert_eq!(read_counter(&be, state::DYNVAR_DROPS).unwrap(), 1);
        // The dropped element reads as default.
        assert_eq!(read_assoc(&be, 0x0501, &[9]).unwrap(), 0);
    }
}
