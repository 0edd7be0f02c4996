//! Probes, ECBs, and the EPID registry.
//!
//! A probe is named by the `(provider, module, function, name)` tuple
//! and receives a numeric id when the session first uses it; ids are
//! stable from attach to detach and never reused within a session. An
//! ECB binds one probe to the actions of one statement and is tagged by
//! an EPID; every record in the data stream leads with its EPID, which
//! is the consumer's key back into the descriptors here.

use rustc_hash::FxHashMap;

use dweave_dif::difo::MapRef;
use dweave_dif::metadesc::{DataDesc, ERROR_EPID};
use dweave_dif::strtab::StrTab;

use crate::maps::{MapBackend, UpdateFlag};
use crate::{RtResult, RuntimeError};

/// Maximum provider-name length.
pub const PROVIDER_MAX: usize = 64;
/// Maximum module-name length.
pub const MODULE_MAX: usize = 64;
/// Maximum function-name length.
pub const FUNCTION_MAX: usize = 128;
/// Maximum probe-name length.
pub const NAME_MAX: usize = 64;

/// A probe's four-part name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProbeDesc {
    /// Owning provider.
    pub provider: String,
    /// Module, often empty.
    pub module: String,
    /// Function, often empty.
    pub function: String,
    /// The probe name itself.
    pub name: String,
}

impl ProbeDesc {
    /// Build a descriptor, enforcing the per-field length bounds.
    pub fn new(provider: &str, module: &str, function: &str, name: &str) -> RtResult<Self> {
        let check = |field: &'static str, s: &str, max: usize| {
            if s.len() > max {
                Err(RuntimeError::ProbeNameTooLong { field, max })
            } else {
                Ok(())
            }
        };
        check("provider", provider, PROVIDER_MAX)?;
        check("module", module, MODULE_MAX)?;
        check("function", function, FUNCTION_MAX)?;
        check("name", name, NAME_MAX)?;
        Ok(ProbeDesc {
            provider: provider.to_string(),
            module: module.to_string(),
            function: function.to_string(),
            name: name.to_string(),
        })
    }
}

impl core::fmt::Display for ProbeDesc {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.provider, self.module, self.function, self.name
        )
    }
}

/// The probe registry: assigns ids at attach, keeps them stable until
/// detach, and publishes per-probe metadata for stream decoding.
#[derive(Debug, Default)]
pub struct ProbeRegistry {
    next: u32,
    by_id: FxHashMap<u32, ProbeDesc>,
    by_desc: FxHashMap<ProbeDesc, u32>,
}

impl ProbeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        ProbeRegistry {
            next: 1,
            by_id: FxHashMap::default(),
            by_desc: FxHashMap::default(),
        }
    }

    /// The id for `desc`, assigning a fresh one on first use.
    pub fn ensure(&mut self, desc: &ProbeDesc) -> u32 {
        if let Some(&id) = self.by_desc.get(desc) {
            return id;
        }
        let id = self.next;
        self.next += 1;
        self.by_id.insert(id, desc.clone());
        self.by_desc.insert(desc.clone(), id);
        id
    }

    /// The descriptor attached under `id`.
    pub fn get(&self, id: u32) -> Option<&ProbeDesc> {
        self.by_id.get(&id)
    }

    /// Detach `id`. Idempotent: detaching an unknown or already
    /// detached probe is a no-op, so cleanup paths can run
    /// unconditionally. The id is never reassigned.
    pub fn detach(&mut self, id: u32) {
        if let Some(desc) = self.by_id.remove(&id) {
            self.by_desc.remove(&desc);
        }
    }

    /// Number of attached probes.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Is the registry empty?
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Intern each probe's names and write the metadata records the
    /// decoder reads from the `probes` map.
    pub fn publish<B: MapBackend>(
        &self,
        backend: &mut B,
        strtab: &mut StrTab,
    ) -> RtResult<()> {
        for (&id, desc) in &self.by_id {
            let mut value = [0u8; 16];
            let offs = [
                strtab.insert_str(&desc.provider),
                strtab.insert_str(&desc.module),
                strtab.insert_str(&desc.function),
                strtab.insert_str(&desc.name),
            ];
            for (i, off) in offs.iter().enumerate() {
                value[4 * i..4 * i + 4].copy_from_slice(&off.to_le_bytes());
            }
            backend.update(MapRef::Probes, &id.to_le_bytes(), &value, UpdateFlag::Any)?;
        }
        Ok(())
    }
}

/// One enabled control block: a probe bound to one statement's actions.
#[derive(Clone, Debug)]
pub struct Ecb {
    /// The EPID tagging this binding's records.
    pub epid: u32,
    /// The attached probe's id.
    pub prid: u32,
    /// The owning statement's id.
    pub stid: u32,
    /// The probe's name tuple.
    pub probe: ProbeDesc,
    /// Layout of the record this binding emits.
    pub desc: DataDesc,
}

/// EPID allocation and lookup.
///
/// EPIDs start above the reserved error EPID and are never reused
/// within a session.
#[derive(Debug)]
pub struct EpidTable {
    next: u32,
    by_epid: FxHashMap<u32, Ecb>,
}

impl Default for EpidTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EpidTable {
    /// Create an empty table.
    pub fn new() -> Self {
        EpidTable {
            next: ERROR_EPID + 1,
            by_epid: FxHashMap::default(),
        }
    }

    /// Bind `desc` to a fresh EPID.
    pub fn register(&mut self, prid: u32, stid: u32, probe: ProbeDesc, desc: DataDesc) -> u32 {
        let epid = self.next;
        self.next += 1;
        self.by_epid.insert(
            epid,
            Ecb {
                epid,
                prid,
                stid,
                probe,
                desc,
            },
        );
        epid
    }

    /// The ECB behind `epid`.
    pub fn get(&self, epid: u32) -> Option<&Ecb> {
        self.by_epid.get(&epid)
    }

    /// Drop every ECB bound to probe `prid` (detach support). EPIDs
    /// are not reused afterwards.
    pub fn detach_probe(&mut self, prid: u32) {
        self.by_epid.retain(|_, ecb| ecb.prid != prid);
    }

    /// Number of live ECBs.
    pub fn len(&self) -> usize {
        self.by_epid.len()
    }

    /// Is the table empty?
    pub fn is_empty(&self) -> bool {
        self.by_epid.is_empty()
    }

    /// The largest record, EPID prefix included, any ECB emits.
    pub fn max_rec_len(&self) -> u32 {
        self.by_epid
            .values()
            .map(|e| e.desc.size)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_are_enforced() {
        assert!(ProbeDesc::new("syscall", "", "read", "entry").is_ok());
        let long = "x".repeat(65);
        assert!(matches!(
            ProbeDesc::new(&long, "", "", "entry"),
            Err(RuntimeError::ProbeNameTooLong {
                field: "provider",
                ..
            })
        ));
        // The function field is allowed up to 128.
        assert!(ProbeDesc::new("p", "", &"f".repeat(128), "n").is_ok());
        assert!(ProbeDesc::new("p", "", &"f".repeat(129), "n").is_err());
    }

    #[test]
    fn probe_ids_are_stable_and_not_reused() {
        let mut reg = ProbeRegistry::new();
        let a = ProbeDesc::new("prov", "", "", "a").unwrap();
        let b = ProbeDesc::new("prov", "", "", "b").unwrap();

        let ida = reg.ensure(&a);
        let idb = reg.ensure(&b);
        assert_ne!(ida, idb);
        assert_eq!(reg.ensure(&a), ida);

        reg.detach(ida);
        reg.detach(ida); // idempotent
        let idc = reg.ensure(&a);
        assert!(idc > idb);
    }

    #[test]
    fn epids_start_above_the_error_epid() {
        let mut tab = EpidTable::new();
        let probe = ProbeDesc::new("p", "", "", "n").unwrap();
        let epid = tab.register(1, 0, probe.clone(), DataDesc::default());
        assert!(epid > ERROR_EPID);

        tab.detach_probe(1);
        assert!(tab.is_empty());
        let again = tab.register(1, 0, probe, DataDesc::default());
        assert!(again > epid);
    }
}
