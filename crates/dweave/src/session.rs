//! The tracing session.
//!
//! A session owns everything with a lifetime: the options and CPU
//! configuration, the session string table, the support library, the
//! probe and EPID registries, the aggregation engine, the compiled
//! statements, the map backend, and the per-CPU rings. The control
//! flow is compile → go → consume → stop, with detach idempotent so
//! cleanup can run unconditionally.
//!
//! The backend is generic: a kernel-backed session traces for real,
//! while a [`MemBackend`] session exercises the entire pipeline in
//! memory, which is how the test suites drive it.

use anyhow::{bail, Context, Result};
use rustc_hash::FxHashMap;

use dweave_dif::dis::{self, Listings};
use dweave_dif::metadesc::{
    state, ActionKind, AggDesc, AggFunc, RecDesc, ERROR_RECORD_SIZE,
};
use dweave_dif::strtab::StrTab;
use dweave_obj::{Dlib, LinkParams, Linker};
use dweave_runtime::agg::{self, AggEngine, AggSnapshot};
use dweave_runtime::conf::CpuConfig;
use dweave_runtime::consume::{Consumer, Event};
use dweave_runtime::maps::{
    read_counter, MapBackend, MapPlan, MemBackend, PlanInputs, UpdateFlag,
};
use dweave_runtime::probe::{EpidTable, ProbeRegistry};
use dweave_runtime::ring::{ConsumeStats, PebSet};
use dweave_runtime::spec::SpecBuffers;

use crate::ast::Ast;
use crate::cg::{self, MAX_TUPLE_KEYS};
use crate::debug::{DebugSink, LogSink};
use crate::options::Options;
use crate::stmt::{Action, Clause, CompiledStmt};

use dweave_dif::difo::MapRef;

/// Size of a dynamic-variable value slot.
const DVAR_VALUE_SIZE: u32 = 16;

/// Fixed tuple size: id word, pad, [`MAX_TUPLE_KEYS`] components.
const TUPLE_KEY_SIZE: u32 = 8 + 8 * MAX_TUPLE_KEYS as u32;

/// Consumer-visible drop and fault counts.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Drops {
    /// Dynamic-variable drops.
    pub dynvar: u32,
    /// Aggregation drops.
    pub agg: u32,
    /// Discarded speculative records.
    pub spec: u32,
    /// Ring-buffer drops counted by the kernel.
    pub buf: u32,
    /// Faults reported via error records.
    pub faults: u32,
}

/// A tracing session over a map backend.
pub struct Session<B: MapBackend> {
    opts: Options,
    conf: CpuConfig,
    backend: B,
    strtab: StrTab,
    dlib: Dlib,
    probes: ProbeRegistry,
    epids: EpidTable,
    aggs: AggEngine,
    aggids: FxHashMap<u32, u32>,
    next_aggid: u32,
    stmts: Vec<CompiledStmt>,
    pebs: Option<PebSet>,
    held: SpecBuffers,
    consumer: Consumer,
    debug: Box<dyn DebugSink>,
    active: bool,
}

impl Session<MemBackend> {
    /// A fully in-memory session simulating `ncpus` CPUs.
    pub fn simulated(opts: Options, ncpus: u32) -> Self {
        Session::new(opts, CpuConfig::synthetic(ncpus), MemBackend::new(ncpus))
    }

    /// Stand in for a probe firing on `cpu` that updates the
    /// aggregation behind `varid`. Simulated sessions only; the live
    /// path runs this inside the kernel.
    pub fn record_aggregation(
        &mut self,
        varid: u32,
        cpu: u32,
        key: &[u8],
        value: i64,
    ) -> Result<()> {
        let Some(&id) = self.aggids.get(&varid) else {
            bail!("no aggregation registered for variable {varid:#x}");
        };
        self.aggs.record(&mut self.backend, cpu, id, key, value)?;
        Ok(())
    }
}

impl<B: MapBackend> Session<B> {
    /// Create a session; nothing touches the backend until
    /// [`Session::go`].
    pub fn new(opts: Options, conf: CpuConfig, backend: B) -> Self {
        Session {
            opts,
            conf,
            backend,
            strtab: StrTab::default(),
            dlib: Dlib::standard(),
            probes: ProbeRegistry::new(),
            epids: EpidTable::new(),
            aggs: AggEngine::new(),
            aggids: FxHashMap::default(),
            next_aggid: 0,
            stmts: Vec::new(),
            pebs: None,
            held: SpecBuffers::new(),
            consumer: Consumer::new(),
            debug: Box::new(LogSink),
            active: false,
        }
    }

    /// Replace the debug sink.
    pub fn set_debug_sink(&mut self, sink: Box<dyn DebugSink>) {
        self.debug = sink;
    }

    /// Compile one clause into the session, returning its statement
    /// id.
    pub fn compile(&mut self, ast: &Ast, clause: &Clause) -> Result<u32> {
        if self.active {
            bail!("cannot compile into an active session");
        }

        // Aggregating actions register their descriptors first so the
        // generator can reference assigned ids.
        for action in &clause.actions {
            if let Action::AggUpdate { varid, func, keys, .. } = action {
                self.register_agg(*varid, *func, keys.len())?;
            }
        }

        let stid = self.stmts.len() as u32;
        let (difo, desc) = cg::compile(ast, clause, &self.aggids)
            .with_context(|| format!("compiling clause for {}", clause.probe))?;

        if self.opts.listings.contains(Listings::CLAUSE) {
            self.debug
                .line(&dis::dis_to_string(&difo, &format!("clause {stid}")));
        }

        self.stmts.push(CompiledStmt {
            stid,
            probe: clause.probe.clone(),
            difo,
            desc,
            epid: 0,
            prid: 0,
            program: None,
        });
        Ok(stid)
    }

    fn register_agg(&mut self, varid: u32, func: AggFunc, nkeys: usize) -> Result<()> {
        if self.aggids.contains_key(&varid) {
            return Ok(());
        }
        let id = self.next_aggid;
        self.next_aggid += 1;
        self.aggids.insert(varid, id);

        let krecs = (0..nkeys)
            .map(|i| RecDesc {
                action: ActionKind::AggKey,
                size: 8,
                offset: 8 + 8 * i as u32,
                alignment: 8,
                format: None,
                arg: 0,
            })
            .collect();
        let dsize = agg::value_size(func);
        self.aggs.register(AggDesc {
            name: 0,
            varid,
            id,
            func,
            sig: u64::from(id),
            normal: 0,
            ksize: TUPLE_KEY_SIZE,
            dsize,
            krecs,
            drecs: vec![RecDesc {
                action: ActionKind::AggData,
                size: dsize,
                offset: 0,
                alignment: 8,
                format: None,
                arg: 0,
            }],
        });
        Ok(())
    }

    fn var_count(&self, scope: dweave_dif::vartab::VarScope) -> u32 {
        use dweave_dif::vartab::VAR_UBASE;
        self.stmts
            .iter()
            .filter_map(|s| s.difo.vartab.max_id(scope))
            .max()
            .map(|id| id.saturating_sub(VAR_UBASE) + 1)
            .unwrap_or(0)
    }

    /// The record-area size of the per-CPU scratch slot; the zero
    /// default block starts here.
    fn record_area(&self) -> u32 {
        self.stmts
            .iter()
            .map(|s| s.desc.size)
            .max()
            .unwrap_or(0)
            .max(ERROR_RECORD_SIZE)
    }

    /// Activate the session: plan and create the maps, link every
    /// statement, bind probes and EPIDs, publish metadata, and stand up
    /// the rings.
    ///
    /// On failure everything attached so far is rolled back.
    pub fn go(&mut self) -> Result<()> {
        if self.active {
            return Ok(());
        }
        match self.activate() {
            Ok(()) => Ok(()),
            Err(e) => {
                // Roll back the partial attachment; detach is
                // idempotent so this is safe at any point of failure.
                let prids: Vec<u32> = self.stmts.iter().map(|s| s.prid).collect();
                for prid in prids {
                    if prid != 0 {
                        self.detach(prid);
                    }
                }
                self.pebs = None;
                Err(e)
            }
        }
    }

    fn activate(&mut self) -> Result<()> {
        // Bind probes and EPIDs.
        for stmt in &mut self.stmts {
            stmt.prid = self.probes.ensure(&stmt.probe);
            stmt.epid = self
                .epids
                .register(stmt.prid, stmt.stid, stmt.probe.clone(), stmt.desc.clone());
        }

        // Pre-intern every string the session will publish, so the
        // table's final size is known before the maps are created.
        for stmt in &self.stmts {
            let p = &stmt.probe;
            for s in [&p.provider, &p.module, &p.function, &p.name] {
                self.strtab.insert_str(s);
            }
        }
        if self.opts.listings.contains(Listings::PROG) {
            for stmt in &self.stmts {
                self.debug.line(&dis::dis_to_string(
                    &stmt.difo,
                    &format!("program for statement {}", stmt.stid),
                ));
            }
        }

        let linker = Linker::new(&self.dlib);
        for i in 0..self.stmts.len() {
            let params = self.link_params(&self.stmts[i]);
            let program = linker
                .link(&self.stmts[i].difo, &mut self.strtab, &params)
                .with_context(|| format!("linking statement {}", self.stmts[i].stid))?;
            if self.opts.listings.contains(Listings::LINKED) {
                let mut out = String::new();
                let _ = program.dis(&format!("linked statement {}", self.stmts[i].stid), &mut out);
                self.debug.line(&out);
            }
            self.stmts[i].program = Some(program);
        }
        if self.strtab.size() > self.opts.strsize {
            bail!(
                "string table needs {} bytes, over the {} byte cap",
                self.strtab.size(),
                self.opts.strsize
            );
        }

        // Plan and create the maps.
        let max_agg_value = self.aggs.max_value_size();
        let rec_area = self.record_area();
        let dflt_len = max_agg_value.max(DVAR_VALUE_SIZE);
        let inputs = PlanInputs {
            ncpus: self.conf.num_possible(),
            nprobes: self.probes.len() as u32 + 1,
            ngvars: self.var_count(dweave_dif::vartab::VarScope::Global),
            ntvars: self.var_count(dweave_dif::vartab::VarScope::Thread),
            dynvar_entries: self.opts.dynvar_entries,
            tuple_key_size: TUPLE_KEY_SIZE,
            dvar_value_size: DVAR_VALUE_SIZE,
            naggs: self.aggs.len() as u32,
            agg_entries: self.opts.agg_entries,
            agg_key_size: TUPLE_KEY_SIZE,
            agg_value_size: max_agg_value,
            nspec: self.opts.nspec,
            strtab_size: self.strtab.size() as u32,
            max_rec_len: rec_area + dflt_len,
        };
        MapPlan::new(&inputs)
            .create_all(&mut self.backend)
            .context("creating session maps")?;

        // Seed the CPU identity record the built-in variables read.
        let mut cpuinfo = [0u8; 16];
        cpuinfo[..4].copy_from_slice(&self.conf.num_possible().to_le_bytes());
        cpuinfo[4..8].copy_from_slice(&self.conf.max_cpuid().to_le_bytes());
        self.backend
            .update(MapRef::Cpuinfo, &0u32.to_le_bytes(), &cpuinfo, UpdateFlag::Any)
            .context("seeding cpuinfo")?;

        // Publish the string table and the per-probe metadata.
        let mut blob = self.strtab.to_vec();
        blob.resize(inputs.strtab_size as usize, 0);
        self.backend
            .update(MapRef::Strtab, &0u32.to_le_bytes(), &blob, UpdateFlag::Any)
            .context("publishing the string table")?;
        self.probes
            .publish(&mut self.backend, &mut self.strtab)
            .context("publishing probe metadata")?;

        self.pebs = Some(PebSet::new(
            self.conf.num_possible(),
            self.opts.bufsize,
            inputs.max_rec_len as usize,
        ));

        if self.opts.listings.contains(Listings::FINAL) {
            for stmt in &self.stmts {
                if let Some(program) = &stmt.program {
                    let mut out = String::new();
                    let _ = program.dis(&format!("final statement {}", stmt.stid), &mut out);
                    self.debug.line(&out);
                }
            }
        }

        log::debug!(
            "session active: {} statements, {} probes, {} CPUs",
            self.stmts.len(),
            self.probes.len(),
            self.conf.num_possible()
        );
        self.active = true;
        Ok(())
    }

    fn link_params(&self, stmt: &CompiledStmt) -> LinkParams {
        LinkParams {
            epid: stmt.epid,
            prid: stmt.prid,
            stid: stmt.stid,
            ncpus: self.conf.num_possible(),
            nspec: self.opts.nspec,
            // The in-program bound on string offsets; the cap rather
            // than the live size, which may still grow while linking.
            strtab_size: self.opts.strsize as u32,
            max_rec_len: self.record_area(),
        }
    }

    /// Run one consume pass, delivering events to `callback`. An exit
    /// record stops the consumer after the pass completes.
    pub fn consume<F>(&mut self, mut callback: F) -> Result<ConsumeStats>
    where
        F: FnMut(Event<'_>),
    {
        let Some(pebs) = self.pebs.as_mut() else {
            bail!("session is not active");
        };
        let mut exit_seen = false;
        let stats = self.consumer.pass(
            pebs,
            &self.epids,
            &mut self.backend,
            &mut self.held,
            |ev| {
                if let Event::Data(data) = &ev {
                    if data.recs().iter().any(|r| r.action == ActionKind::Exit) {
                        exit_seen = true;
                    }
                }
                callback(ev);
            },
        )?;
        if exit_seen {
            self.consumer.stop();
        }
        Ok(stats)
    }

    /// Request cooperative termination.
    pub fn stop(&mut self) {
        self.consumer.stop();
    }

    /// Has the consumer stopped (by request or by an exit record)?
    pub fn stopped(&self) -> bool {
        self.consumer.stopped()
    }

    /// Detach a probe: its ECBs are freed and its id is never reused.
    /// Idempotent.
    pub fn detach(&mut self, prid: u32) {
        self.probes.detach(prid);
        self.epids.detach_probe(prid);
    }

    /// A merged, sorted snapshot of the aggregations.
    pub fn aggregations(&self) -> Result<AggSnapshot> {
        let mut snap = self.aggs.snapshot(&self.backend)?;
        self.aggs.sort(&mut snap);
        Ok(snap)
    }

    /// Clear the aggregation behind variable `varid`.
    pub fn clear_aggregation(&mut self, varid: u32) -> Result<()> {
        let Some(&id) = self.aggids.get(&varid) else {
            bail!("no aggregation registered for variable {varid:#x}");
        };
        self.aggs.clear(&mut self.backend, id)?;
        Ok(())
    }

    /// Set the normalization divisor of the aggregation behind
    /// `varid`.
    pub fn normalize(&mut self, varid: u32, divisor: u64) {
        if let Some(&id) = self.aggids.get(&varid) {
            self.aggs.normalize(id, divisor);
        }
    }

    /// Current drop and fault counts.
    pub fn drops(&self) -> Result<Drops> {
        Ok(Drops {
            dynvar: read_counter(&self.backend, state::DYNVAR_DROPS)?,
            agg: read_counter(&self.backend, state::AGG_DROPS)?,
            spec: read_counter(&self.backend, state::SPEC_DROPS)?,
            buf: read_counter(&self.backend, state::BUF_DROPS)?,
            faults: read_counter(&self.backend, state::FAULTS)?,
        })
    }

    /// The EPID bound to statement `stid`, once active.
    pub fn epid_of(&self, stid: u32) -> Option<u32> {
        self.stmts.get(stid as usize).map(|s| s.epid)
    }

    /// The probe id bound to statement `stid`, once active.
    pub fn prid_of(&self, stid: u32) -> Option<u32> {
        self.stmts.get(stid as usize).map(|s| s.prid)
    }

    /// The aggregation id assigned to variable `varid`.
    pub fn aggid_of(&self, varid: u32) -> Option<u32> {
        self.aggids.get(&varid).copied()
    }

    /// The linked program of statement `stid`, once active.
    pub fn program_of(&self, stid: u32) -> Option<&dweave_obj::Program> {
        self.stmts.get(stid as usize)?.program.as_ref()
    }

    /// The aggregation engine, for consumers that format output.
    pub fn agg_engine(&self) -> &AggEngine {
        &self.aggs
    }

    /// The map backend. Simulated sessions use this to stand in for
    /// the kernel side.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// The ring set. Simulated sessions produce records through it.
    pub fn pebs_mut(&mut self) -> Option<&mut PebSet> {
        self.pebs.as_mut()
    }
}
