//! The aggregation engine.
//!
//! Aggregation storage is a per-CPU hash keyed by `(agg id, key tuple)`
//! with a value record laid out as `[gen][count][body]`. Probes update
//! their own CPU's record without locks; the consumer merges the
//! per-CPU instances field-wise when it takes a snapshot; `clear()`
//! bumps a per-aggregation generation so stale records reseed on next
//! update instead of being walked and zeroed.
//!
//! The binning functions and the merge rules live here, together with
//! a kernel-stand-in updater used by the test suites.

use rustc_hash::FxHashMap;

use dweave_dif::difo::MapRef;
use dweave_dif::metadesc::{AggDesc, AggFunc};

use crate::maps::{MapBackend, MemBackend, UpdateFlag};
use crate::{RtResult, RuntimeError};

/// Power-of-two bucket index for `quantize()`.
///
/// 63 is the zero bucket; positive magnitudes grow upward to 126,
/// negative magnitudes downward to 1; the most negative values land in
/// bucket 0. Symmetric: `qbin(v) + qbin(-v) == 126` away from the
/// extremes.
pub fn qbin(val: i64) -> u16 {
    if val == 0 {
        return 63;
    }
    if val == i64::MIN {
        return 0;
    }
    let mag = val.unsigned_abs();
    let off = (64 - mag.leading_zeros()) as i32;
    let off = if val < 0 { -off } else { off };
    (off + 63) as u16
}

/// Linear bucket index for `lquantize()`: 0 below the base, then one
/// bucket per step, capped into the over-range bucket `levels + 1`.
pub fn lqbin(val: i64, base: i32, levels: u16, step: u16) -> u64 {
    if step == 0 || val < i64::from(base) {
        return 0;
    }
    let level = (val - i64::from(base)) as u64 / u64::from(step);
    level.min(u64::from(levels)) + 1
}

/// Log-linear bucket index for `llquantize()`.
///
/// Magnitudes `factor^low ..= factor^high` each contribute
/// `nsteps - nsteps/factor` linear buckets; bucket 0 is under-range and
/// the last bucket is over-range.
pub fn llqbin(val: i64, factor: u16, low: u16, high: u16, nsteps: u16) -> u64 {
    let f = u64::from(factor).max(2);
    let nsteps64 = u64::from(nsteps).max(1);
    let skip = nsteps64 / f;
    let per_mag = nsteps64 - skip;
    let mags = u64::from(high) - u64::from(low) + 1;
    let overflow = 1 + mags * per_mag;

    if val < 0 {
        return 0;
    }
    let v = val as u64;
    let Some(low_bound) = f.checked_pow(u32::from(low)) else {
        return 0;
    };
    if v < low_bound {
        return 0;
    }

    let mut mag_end = low_bound;
    for m in 0..mags {
        mag_end = match mag_end.checked_mul(f) {
            Some(e) => e,
            None => return overflow,
        };
        if v < mag_end {
            let divide = (mag_end / nsteps64).max(1);
            let idx = v / divide;
            return 1 + m * per_mag + idx.saturating_sub(skip);
        }
    }
    overflow
}

/// Apply one observed value to a record, as a firing probe would.
pub fn apply(func: AggFunc, count: &mut i64, body: &mut [i64], value: i64) {
    *count = count.wrapping_add(1);
    match func {
        AggFunc::Count => {}
        AggFunc::Sum | AggFunc::Avg => body[0] = body[0].wrapping_add(value),
        AggFunc::Min => body[0] = body[0].min(value),
        AggFunc::Max => body[0] = body[0].max(value),
        AggFunc::Stddev => {
            body[0] = body[0].wrapping_add(value);
            body[1] = body[1].wrapping_add(value.wrapping_mul(value));
        }
        AggFunc::Quantize => body[qbin(value) as usize] += 1,
        AggFunc::Lquantize { base, levels, step } => {
            body[lqbin(value, base, levels, step) as usize] += 1
        }
        AggFunc::Llquantize {
            factor,
            low,
            high,
            nsteps,
        } => body[llqbin(value, factor, low, high, nsteps) as usize] += 1,
    }
}

/// Merge one CPU's record into the accumulator, field-wise.
pub fn merge(func: AggFunc, count: &mut i64, body: &mut [i64], src_count: i64, src_body: &[i64]) {
    *count = count.wrapping_add(src_count);
    match func {
        AggFunc::Count => {}
        AggFunc::Sum | AggFunc::Avg => body[0] = body[0].wrapping_add(src_body[0]),
        AggFunc::Min => body[0] = body[0].min(src_body[0]),
        AggFunc::Max => body[0] = body[0].max(src_body[0]),
        AggFunc::Stddev => {
            body[0] = body[0].wrapping_add(src_body[0]);
            body[1] = body[1].wrapping_add(src_body[1]);
        }
        AggFunc::Quantize | AggFunc::Lquantize { .. } | AggFunc::Llquantize { .. } => {
            for (d, s) in body.iter_mut().zip(src_body) {
                *d = d.wrapping_add(*s);
            }
        }
    }
}

/// Byte size of a value record for `func`.
pub fn value_size(func: AggFunc) -> u32 {
    (16 + 8 * func.body_len()) as u32
}

fn decode_record(bytes: &[u8]) -> (u64, i64, Vec<i64>) {
    let gen = u64::from_le_bytes(bytes[..8].try_into().unwrap());
    let count = i64::from_le_bytes(bytes[8..16].try_into().unwrap());
    let body = bytes[16..]
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    (gen, count, body)
}

fn encode_record(gen: u64, count: i64, body: &[i64], total: usize) -> Vec<u8> {
    let mut bytes = vec![0; total];
    bytes[..8].copy_from_slice(&gen.to_le_bytes());
    bytes[8..16].copy_from_slice(&count.to_le_bytes());
    for (i, v) in body.iter().enumerate() {
        bytes[16 + 8 * i..24 + 8 * i].copy_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// One merged aggregation entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggEntry {
    /// The aggregation id.
    pub id: u32,
    /// The key tuple, id prefix excluded.
    pub key: Vec<u8>,
    /// Merged call count.
    pub count: i64,
    /// Merged body slots.
    pub body: Vec<i64>,
    /// Normalization divisor (0 = none).
    pub normal: u64,
}

impl AggEntry {
    /// The body scaled by the normalization divisor.
    pub fn normalized(&self) -> Vec<i64> {
        if self.normal <= 1 {
            return self.body.clone();
        }
        self.body
            .iter()
            .map(|v| v / self.normal as i64)
            .collect()
    }
}

/// A merged, ordered view of aggregation storage.
#[derive(Clone, Debug, Default)]
pub struct AggSnapshot {
    /// The entries, in snapshot order (stable after [`AggEngine::sort`]).
    pub entries: Vec<AggEntry>,
}

impl AggSnapshot {
    /// Discard all but the first `n` entries (`n > 0`) or the last
    /// `-n` entries (`n < 0`) of the sorted order.
    pub fn trunc(&mut self, n: i64) {
        let len = self.entries.len();
        if n >= 0 {
            self.entries.truncate(n as usize);
        } else {
            let keep = (-n) as usize;
            if keep < len {
                self.entries.drain(..len - keep);
            }
        }
    }
}

/// The per-session aggregation registry and consumer-side engine.
#[derive(Debug, Default)]
pub struct AggEngine {
    descs: FxHashMap<u32, AggDesc>,
    order: Vec<u32>,
}

impl AggEngine {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an aggregation descriptor under its id.
    pub fn register(&mut self, desc: AggDesc) {
        debug_assert!(!self.descs.contains_key(&desc.id));
        self.order.push(desc.id);
        self.descs.insert(desc.id, desc);
    }

    /// The descriptor for `id`.
    pub fn desc(&self, id: u32) -> Option<&AggDesc> {
        self.descs.get(&id)
    }

    /// Number of registered aggregations.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Is the registry empty?
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The largest value-record size across registered aggregations.
    pub fn max_value_size(&self) -> u32 {
        self.descs
            .values()
            .map(|d| value_size(d.func))
            .max()
            .unwrap_or(16)
    }

    /// Set the normalization divisor for `id`.
    pub fn normalize(&mut self, id: u32, divisor: u64) {
        if let Some(d) = self.descs.get_mut(&id) {
            d.normal = divisor;
        }
    }

    fn generation<B: MapBackend>(&self, backend: &B, id: u32) -> RtResult<u64> {
        let bytes = backend
            .lookup(MapRef::AggGen, &id.to_le_bytes())?
            .unwrap_or_else(|| vec![0; 8]);
        Ok(u64::from_le_bytes(bytes[..8].try_into().unwrap()))
    }

    /// Clear aggregation `id` by advancing its generation; storage is
    /// reseeded lazily on the next update.
    pub fn clear<B: MapBackend>(&self, backend: &mut B, id: u32) -> RtResult<()> {
        let gen = self.generation(backend, id)?;
        backend.update(
            MapRef::AggGen,
            &id.to_le_bytes(),
            &(gen + 1).to_le_bytes(),
            UpdateFlag::Any,
        )
    }

    // Aggregation keys share the tuple shape: the id word, pad, then
    // the 8-aligned key components.
    fn full_key<B: MapBackend>(&self, backend: &B, id: u32, key: &[u8]) -> RtResult<Vec<u8>> {
        let ksize = backend.spec(MapRef::Aggs)?.key_size as usize;
        if key.len() + 8 > ksize {
            return Err(RuntimeError::BadKeySize {
                map: MapRef::Aggs,
                expected: (ksize - 8) as u32,
                got: key.len(),
            });
        }
        let mut full = vec![0; ksize];
        full[..4].copy_from_slice(&id.to_le_bytes());
        full[8..8 + key.len()].copy_from_slice(key);
        Ok(full)
    }

    /// Apply one observation on `cpu`, as the loaded program would:
    /// lazily reseeding stale records, then updating in place.
    pub fn record(
        &self,
        backend: &mut MemBackend,
        cpu: u32,
        id: u32,
        key: &[u8],
        value: i64,
    ) -> RtResult<()> {
        let desc = self.descs.get(&id).ok_or(RuntimeError::UnknownAgg(id))?;
        let func = desc.func;
        let total = backend.spec(MapRef::Aggs)?.value_size as usize;
        let gen = self.generation(backend, id)?;
        let full = self.full_key(backend, id, key)?;

        let existing = backend
            .lookup_percpu(MapRef::Aggs, &full)?
            .map(|vals| vals[cpu as usize].clone());

        let (mut count, mut body) = match existing {
            Some(bytes) => {
                let (rec_gen, count, body) = decode_record(&bytes);
                if rec_gen < gen {
                    (0, seed_body(func))
                } else {
                    (count, body)
                }
            }
            None => (0, seed_body(func)),
        };
        apply(func, &mut count, &mut body, value);

        let bytes = encode_record(gen, count, &body, total);
        match backend.update_cpu(MapRef::Aggs, cpu, &full, &bytes) {
            Ok(()) => Ok(()),
            Err(RuntimeError::MapFull(_)) => crate::maps::bump_counter(
                backend,
                dweave_dif::metadesc::state::AGG_DROPS,
                1,
            ),
            Err(e) => Err(e),
        }
    }

    /// Merge the per-CPU storage into a snapshot. Records older than
    /// their aggregation's generation are treated as uninitialized.
    pub fn snapshot<B: MapBackend>(&self, backend: &B) -> RtResult<AggSnapshot> {
        let mut entries = Vec::new();
        for full_key in backend.keys(MapRef::Aggs)? {
            let id = u32::from_le_bytes(full_key[..4].try_into().unwrap());
            let Some(desc) = self.descs.get(&id) else {
                log::warn!("aggregation storage holds unknown id {id}");
                continue;
            };
            let func = desc.func;
            let gen = self.generation(backend, id)?;

            let mut count = 0i64;
            let mut body = seed_body(func);
            let mut live = false;
            if let Some(vals) = backend.lookup_percpu(MapRef::Aggs, &full_key)? {
                for bytes in vals {
                    let (rec_gen, c, b) = decode_record(&bytes);
                    if rec_gen < gen || (c == 0 && rec_gen == 0) {
                        continue;
                    }
                    merge(func, &mut count, &mut body, c, &b);
                    live = true;
                }
            }
            if !live {
                continue;
            }
            entries.push(AggEntry {
                id,
                key: full_key[8..].to_vec(),
                count,
                body,
                normal: desc.normal,
            });
        }
        Ok(AggSnapshot { entries })
    }

    /// Order a snapshot for display: lexicographic by key, ties broken
    /// by the descriptors' signatures, then by id for stability.
    pub fn sort(&self, snap: &mut AggSnapshot) {
        snap.entries.sort_by(|a, b| {
            a.key.cmp(&b.key).then_with(|| {
                let sig = |e: &AggEntry| self.descs.get(&e.id).map(|d| d.sig).unwrap_or(0);
                sig(a).cmp(&sig(b)).then(a.id.cmp(&b.id))
            })
        });
    }
}

fn seed_body(func: AggFunc) -> Vec<i64> {
    let mut body = vec![0i64; func.body_len()];
    let ident = func.identity();
    if ident != 0 {
        body[0] = ident;
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maps::{MapPlan, PlanInputs};

    fn desc(id: u32, func: AggFunc) -> AggDesc {
        AggDesc {
            name: 0,
            varid: 0x0600 + id,
            id,
            func,
            sig: u64::from(id),
            normal: 0,
            ksize: 8,
            dsize: value_size(func),
            krecs: Vec::new(),
            drecs: Vec::new(),
        }
    }

    fn setup(funcs: &[AggFunc]) -> (AggEngine, MemBackend) {
        let mut engine = AggEngine::new();
        for (i, f) in funcs.iter().enumerate() {
            engine.register(desc(i as u32, *f));
        }
        let mut be = MemBackend::new(2);
        MapPlan::new(&PlanInputs {
            ncpus: 2,
            nprobes: 1,
            ngvars: 1,
            ntvars: 1,
            dynvar_entries: 8,
            tuple_key_size: 16,
            dvar_value_size: 16,
            naggs: funcs.len() as u32,
            agg_entries: 16,
            agg_key_size: 12,
            agg_value_size: engine.max_value_size(),
            nspec: 1,
            strtab_size: 64,
            max_rec_len: 64,
        })
        .create_all(&mut be)
        .unwrap();
        (engine, be)
    }

    #[test]
    fn qbin_boundaries() {
        assert_eq!(qbin(0), 63);
        assert_eq!(qbin(1), 64);
        assert_eq!(qbin(-1), 62);
        assert_eq!(qbin(2), 65);
        assert_eq!(qbin(i64::MIN), 0);
        assert_eq!(qbin(i64::MAX), 126);
    }

    #[test]
    fn qbin_symmetry() {
        for v in [1i64, 2, 3, 7, 255, 1 << 20, (1 << 62) - 1] {
            assert_eq!(qbin(v) + qbin(-v), 126, "value {v}");
        }
    }

    #[test]
    fn lqbin_boundaries() {
        // base 10, 5 levels of width 10.
        let f = |v| lqbin(v, 10, 5, 10);
        assert_eq!(f(5), 0);
        assert_eq!(f(10), 1);
        assert_eq!(f(19), 1);
        assert_eq!(f(20), 2);
        assert_eq!(f(55), 5);
        // At and past the limit everything lands in the over-range
        // bucket.
        assert_eq!(f(60), 6);
        assert_eq!(f(i64::MAX), 6);
    }

    #[test]
    fn llqbin_is_monotonic_and_bounded() {
        let f = |v| llqbin(v, 10, 0, 2, 10);
        let bins = AggFunc::Llquantize {
            factor: 10,
            low: 0,
            high: 2,
            nsteps: 10,
        }
        .body_len() as u64;
        let mut last = 0;
        for v in [0i64, 1, 5, 9, 10, 55, 99, 100, 550, 999, 1000, 5000] {
            let bin = f(v);
            assert!(bin >= last, "not monotonic at {v}");
            assert!(bin < bins, "bin {bin} out of range at {v}");
            last = bin;
        }
        assert_eq!(f(-5), 0);
        assert_eq!(f(1000), bins - 1);
    }

    #[test]
    fn count_merges_across_cpus() {
        let (engine, mut be) = setup(&[AggFunc::Count]);
        for cpu in 0..2 {
            engine.record(&mut be, cpu, 0, b"", 0).unwrap();
            engine.record(&mut be, cpu, 0, b"", 0).unwrap();
        }
        let snap = engine.snapshot(&be).unwrap();
        assert_eq!(snap.entries.len(), 1);
        assert_eq!(snap.entries[0].count, 4);
    }

    #[test]
    fn min_takes_the_extremum() {
        let (engine, mut be) = setup(&[AggFunc::Min]);
        engine.record(&mut be, 0, 0, b"", 3).unwrap();
        engine.record(&mut be, 1, 0, b"", 5).unwrap();
        let snap = engine.snapshot(&be).unwrap();
        assert_eq!(snap.entries[0].body[0], 3);
    }

    #[test]
    fn stddev_merges_sums_and_squares() {
        let (engine, mut be) = setup(&[AggFunc::Stddev]);
        engine.record(&mut be, 0, 0, b"", 2).unwrap();
        engine.record(&mut be, 1, 0, b"", 4).unwrap();
        let snap = engine.snapshot(&be).unwrap();
        let e = &snap.entries[0];
        assert_eq!(e.count, 2);
        assert_eq!(e.body[0], 6);
        assert_eq!(e.body[1], 4 + 16);
    }

    #[test]
    fn clear_reseeds_by_generation() {
        let (engine, mut be) = setup(&[AggFunc::Sum]);
        engine.record(&mut be, 0, 0, b"", 10).unwrap();
        assert_eq!(engine.snapshot(&be).unwrap().entries[0].body[0], 10);

        engine.clear(&mut be, 0).unwrap();
        // With no intervening update the entry reads as the identity.
        assert!(engine.snapshot(&be).unwrap().entries.is_empty());

        // The next update reseeds rather than resuming the old sum.
        engine.record(&mut be, 0, 0, b"", 7).unwrap();
        assert_eq!(engine.snapshot(&be).unwrap().entries[0].body[0], 7);
    }

    #[test]
    fn sort_and_trunc() {
        let (engine, mut be) = setup(&[AggFunc::Count]);
        for key in [b"bb".as_slice(), b"aa", b"cc"] {
            engine.record(&mut be, 0, 0, key, 0).unwrap();
        }
        let mut snap = engine.snapshot(&be).unwrap();
        engine.sort(&mut snap);
        let keys: Vec<_> = snap
            .entries
            .iter()
            .map(|e| e.key[..2].to_vec())
            .collect();
        assert_eq!(keys, vec![b"aa".to_vec(), b"bb".to_vec(), b"cc".to_vec()]);

        let mut top = snap.clone();
        top.trunc(2);
        assert_eq!(top.entries.len(), 2);
        assert_eq!(&top.entries[0].key[..2], b"aa");

        snap.trunc(-1);
        assert_eq!(snap.entries.len(), 1);
        assert_eq!(&snap.entries[0].key[..2], b"cc");
    }

    #[test]
    fn normalization_scales_the_body() {
        let (mut engine, mut be) = setup(&[AggFunc::Sum]);
        engine.record(&mut be, 0, 0, b"", 1000).unwrap();
        engine.normalize(0, 10);
        let snap = engine.snapshot(&be).unwrap();
        assert_eq!(snap.entries[0].normalized(), vec![100]);
    }
}
