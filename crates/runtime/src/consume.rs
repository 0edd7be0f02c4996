//! The consumer loop.
//!
//! One pass drains every per-CPU ring, decodes each record by its
//! leading EPID, and hands the results to the caller's callback in
//! per-CPU emission order. Error records surface as structured faults;
//! speculative records are held until their speculation commits or
//! discards; ring-level losses are reported between passes. The
//! callback is only ever invoked from the control thread, never
//! re-entrantly.

use dweave_dif::metadesc::{ActionKind, FaultKind, RecDesc, ERROR_EPID};
use dweave_dif::varint;

use crate::maps::MapBackend;
use crate::probe::{Ecb, EpidTable};
use crate::ring::{ConsumeStats, PebSet, PERF_RECORD_SAMPLE};
use crate::spec::{self, SpecBuffers};
use crate::{RtResult, RuntimeError};

/// One decoded data record.
#[derive(Debug)]
pub struct ProbeData<'a> {
    /// CPU the record was emitted on.
    pub cpu: u32,
    /// The enabled-probe id the record is tagged with.
    pub epid: u32,
    /// The ECB the EPID resolves to.
    pub ecb: &'a Ecb,
    /// The raw record bytes, EPID prefix included; field offsets in
    /// the descriptors index into this slice.
    pub data: &'a [u8],
}

impl<'a> ProbeData<'a> {
    /// The bytes of field `idx`, per its record descriptor.
    pub fn field(&self, idx: usize) -> Option<&'a [u8]> {
        let rec = self.ecb.desc.recs.get(idx)?;
        let start = rec.offset as usize;
        self.data.get(start..start + rec.size as usize)
    }

    /// Field `idx` as an unsigned integer, for the scalar widths.
    pub fn value(&self, idx: usize) -> Option<u64> {
        let bytes = self.field(idx)?;
        Some(match bytes.len() {
            1 => u64::from(bytes[0]),
            2 => u64::from(u16::from_le_bytes(bytes.try_into().ok()?)),
            4 => u64::from(u32::from_le_bytes(bytes.try_into().ok()?)),
            8 => u64::from_le_bytes(bytes.try_into().ok()?),
            _ => return None,
        })
    }

    /// Field `idx` as a traced string: a varint length prefix followed
    /// by that many bytes, not NUL-terminated.
    pub fn string(&self, idx: usize) -> Option<&'a [u8]> {
        let bytes = self.field(idx)?;
        let (len, consumed) = varint::decode(bytes).ok()?;
        bytes.get(consumed..consumed + len as usize)
    }

    /// The record descriptors for this data.
    pub fn recs(&self) -> &'a [RecDesc] {
        &self.ecb.desc.recs
    }
}

/// A decoded error record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ErrorRecord {
    /// Probe id that faulted.
    pub prid: u32,
    /// Statement id that faulted.
    pub stid: u32,
    /// Program offset of the faulting operation, or -1.
    pub offset: i64,
    /// The fault kind; `None` for codes this build does not know.
    pub fault: Option<FaultKind>,
    /// Fault-specific value, usually the offending address.
    pub value: u64,
}

impl ErrorRecord {
    /// Decode from a raw record (EPID prefix included). The record
    /// carries six arguments; the first is always zero.
    pub fn decode(raw: &[u8]) -> RtResult<Self> {
        let want = 8 + 6 * 8;
        if raw.len() < want {
            return Err(RuntimeError::ShortRecord {
                got: raw.len(),
                want,
            });
        }
        let arg = |n: usize| {
            u64::from_le_bytes(raw[8 + 8 * n..16 + 8 * n].try_into().unwrap())
        };
        Ok(ErrorRecord {
            prid: arg(1) as u32,
            stid: arg(2) as u32,
            offset: arg(3) as i64,
            fault: FaultKind::from_code(arg(4) as u32),
            value: arg(5),
        })
    }
}

/// What one consume pass can hand to the callback.
#[derive(Debug)]
pub enum Event<'a> {
    /// A decoded data record.
    Data(ProbeData<'a>),
    /// A fault reported by a program.
    Error(ErrorRecord),
}

/// The consumer: cooperative stop flag plus per-pass bookkeeping.
#[derive(Debug, Default)]
pub struct Consumer {
    stop: bool,
    delivered: u64,
    lost: u64,
}

impl Consumer {
    /// Create a consumer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cooperative termination; checked at the top of each
    /// pass.
    pub fn stop(&mut self) {
        self.stop = true;
    }

    /// Has termination been requested?
    pub fn stopped(&self) -> bool {
        self.stop
    }

    /// Records delivered over the consumer's lifetime.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Ring-level losses observed over the consumer's lifetime.
    pub fn lost(&self) -> u64 {
        self.lost
    }

    /// Drain every ring once.
    ///
    /// Records already copied out are still delivered even if `stop`
    /// was requested mid-pass. Returns the pass statistics; ring-level
    /// losses are accumulated for [`Consumer::lost`].
    pub fn pass<B, F>(
        &mut self,
        pebs: &mut PebSet,
        epids: &EpidTable,
        backend: &mut B,
        held: &mut SpecBuffers,
        mut deliver: F,
    ) -> RtResult<ConsumeStats>
    where
        B: MapBackend,
        F: FnMut(Event<'_>),
    {
        if self.stop {
            return Ok(ConsumeStats::default());
        }

        let mut first_err = None;
        let stats = pebs.consume_all(|cpu, kind, payload| {
            if kind != PERF_RECORD_SAMPLE || first_err.is_some() {
                return;
            }
            if let Err(e) = dispatch(cpu, payload, epids, backend, held, &mut deliver) {
                first_err = Some(e);
            }
        });
        if let Some(e) = first_err {
            return Err(e);
        }

        self.delivered += stats.records;
        self.lost += stats.lost;
        if stats.lost > 0 {
            log::warn!("{} records lost to full ring buffers", stats.lost);
        }
        Ok(stats)
    }
}

fn dispatch<B, F>(
    cpu: u32,
    payload: &[u8],
    epids: &EpidTable,
    backend: &mut B,
    held: &mut SpecBuffers,
    deliver: &mut F,
) -> RtResult<()>
where
    B: MapBackend,
    F: FnMut(Event<'_>),
{
    // Sample payload: raw size, then the raw record.
    if payload.len() < 4 {
        return Err(RuntimeError::ShortRecord {
            got: payload.len(),
            want: 4,
        });
    }
    let raw_len = u32::from_le_bytes(payload[..4].try_into().unwrap()) as usize;
    let raw = payload.get(4..4 + raw_len).ok_or(RuntimeError::ShortRecord {
        got: payload.len() - 4,
        want: raw_len,
    })?;
    if raw.len() < 4 {
        return Err(RuntimeError::ShortRecord {
            got: raw.len(),
            want: 4,
        });
    }

    let epid = u32::from_le_bytes(raw[..4].try_into().unwrap());
    if epid == ERROR_EPID {
        deliver(Event::Error(ErrorRecord::decode(raw)?));
        return Ok(());
    }

    let Some(ecb) = epids.get(epid) else {
        // A record we cannot decode is dropped loudly; guessing at its
        // layout would corrupt everything after it.
        log::warn!("dropping record with unknown EPID {epid}");
        return Ok(());
    };

    match leading_action(ecb) {
        Some((ActionKind::Speculate, rec)) => {
            let id = field_u32(raw, rec)?;
            held.hold(id, raw.to_vec());
        }
        Some((ActionKind::Commit, rec)) => {
            let id = field_u32(raw, rec)?;
            spec::mark_drain(backend, id)?;
            let records = held.take(id);
            let n = records.len() as u64;
            for rec_bytes in &records {
                let spec_epid = u32::from_le_bytes(rec_bytes[..4].try_into().unwrap());
                if let Some(spec_ecb) = epids.get(spec_epid) {
                    deliver(Event::Data(ProbeData {
                        cpu,
                        epid: spec_epid,
                        ecb: spec_ecb,
                        data: rec_bytes,
                    }));
                }
            }
            spec::note_drained(backend, id, n)?;
        }
        Some((ActionKind::Discard, rec)) => {
            let id = field_u32(raw, rec)?;
            spec::mark_drain(backend, id)?;
            let n = held.take(id).len() as u64;
            if n > 0 {
                crate::maps::bump_counter(
                    backend,
                    dweave_dif::metadesc::state::SPEC_DROPS,
                    n as u32,
                )?;
            }
            spec::note_drained(backend, id, n)?;
        }
        _ => deliver(Event::Data(ProbeData {
            cpu,
            epid,
            ecb,
            data: raw,
        })),
    }
    Ok(())
}

fn leading_action(ecb: &Ecb) -> Option<(ActionKind, &RecDesc)> {
    let rec = ecb.desc.recs.first()?;
    Some((rec.action, rec))
}

fn field_u32(raw: &[u8], rec: &RecDesc) -> RtResult<u32> {
    let start = rec.offset as usize;
    let bytes = raw
        .get(start..start + rec.size as usize)
        .ok_or(RuntimeError::ShortRecord {
            got: raw.len(),
            want: start + rec.size as usize,
        })?;
    Ok(match bytes.len() {
        4 => u32::from_le_bytes(bytes.try_into().unwrap()),
        8 => u64::from_le_bytes(bytes.try_into().unwrap()) as u32,
        _ => {
            return Err(RuntimeError::ShortRecord {
                got: bytes.len(),
                want: 4,
            })
        }
    })
}
