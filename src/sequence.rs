//! Run sequencer.
//!
//! Owns the engine's externally visible behavior: it mirrors the readiness
//! inputs into a served status value, accepts operator run commands, and
//! drives each acquisition through its full life cycle. One run at a time:
//!
//! ```text
//! Idle -> Armed -> Acquiring -> Stopping -> PostProcessing -> Idle
//!                      \________________ Aborting _________/
//! ```
//!
//! Arming snapshots all signal metadata, creates the dated run directory and
//! persists a preliminary header before the hardware is enabled, so a crash
//! mid-run still leaves enough on disk to identify the capture. Stop (or
//! abort) disables acquisition, waits out a flush grace period, discovers the
//! per-chassis capture files, rewrites the header in its final filtered form
//! and fans out conversion. Terminal cleanup always runs, bounded by a
//! timeout so a stalled hardware link cannot wedge the sequencer.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{BusValue, ControlBus};
use crate::cache::ReadinessCache;
use crate::config::Settings;
use crate::convert;
use crate::error::{EngineError, EngineResult};
use crate::header::{format_timestamp, ChassisFiles, RunHeader};
use crate::signals::EngineNames;

const RUN_CHOICES: [&str; 3] = ["Stop", "Run", "Abort"];
const READY_CHOICES: [&str; 2] = ["Not Ready", "Ready"];

const CMD_STOP: u32 = 0;
const CMD_RUN: u32 = 1;
const CMD_ABORT: u32 = 2;

/// The run sequencer plus its readiness mirror.
pub struct Engine {
    bus: Arc<dyn ControlBus>,
    cache: ReadinessCache,
    names: EngineNames,
    settings: Settings,
}

/// Handles to the run currently in flight.
struct ActiveRun {
    stop: Arc<Notify>,
    abort: Arc<Notify>,
    handle: JoinHandle<()>,
}

enum Outcome {
    Success(PathBuf),
    Failure,
    Abort,
}

impl Engine {
    /// Build the engine and begin mirroring every monitored remote value.
    pub fn new(bus: Arc<dyn ControlBus>, settings: Settings) -> Self {
        let cache = ReadinessCache::new(Arc::clone(&bus));
        let names = EngineNames::new(settings.prefix.clone());
        for (name, signed) in names.monitored() {
            cache.subscribe_and_cache(&name, signed);
        }
        Self {
            bus,
            cache,
            names,
            settings,
        }
    }

    pub fn cache(&self) -> &ReadinessCache {
        &self.cache
    }

    /// Serve the run command and process operator writes until the bus
    /// session ends. This is the engine's main loop.
    pub async fn run(self) {
        let engine = Arc::new(self);
        let mut commands = engine
            .bus
            .control(&engine.names.run_command(), &RUN_CHOICES);

        let readiness = {
            let engine = Arc::clone(&engine);
            tokio::spawn(engine.readiness_loop())
        };

        let mut active: Option<ActiveRun> = None;
        while let Some(index) = commands.recv().await {
            if let Some(run) = &active {
                if run.handle.is_finished() {
                    active = None;
                }
            }
            match index {
                CMD_RUN => match &active {
                    Some(_) => warn!("run requested while a run is active, ignored"),
                    None => active = engine.try_start_run(),
                },
                CMD_STOP => match &active {
                    Some(run) => run.stop.notify_one(),
                    None => debug!("stop requested while idle"),
                },
                CMD_ABORT => match &active {
                    Some(run) => run.abort.notify_one(),
                    None => debug!("abort requested while idle"),
                },
                other => warn!("unknown run command index {other}"),
            }
        }

        info!("run command input closed, sequencer exiting");
        readiness.abort();
        if let Some(run) = active {
            run.abort.notify_one();
            if let Err(e) = run.handle.await {
                error!("active run task failed during shutdown: {e}");
            }
        }
    }

    fn try_start_run(self: &Arc<Self>) -> Option<ActiveRun> {
        // A start while not ready is ignored without surfacing an error; the
        // served readiness status already tells the operator why.
        if !self.ready_to_go() {
            warn!(
                "run requested while not ready ({} values disconnected)",
                self.cache.disconnected_names().len()
            );
            return None;
        }
        let stop = Arc::new(Notify::new());
        let abort = Arc::new(Notify::new());
        let handle = {
            let engine = Arc::clone(self);
            let stop = Arc::clone(&stop);
            let abort = Arc::clone(&abort);
            tokio::spawn(async move { engine.run_once(stop, abort).await })
        };
        Some(ActiveRun {
            stop,
            abort,
            handle,
        })
    }

    /// One complete run: sequence body raced against abort, then terminal
    /// cleanup and the outcome message, unconditionally.
    async fn run_once(self: Arc<Self>, stop: Arc<Notify>, abort: Arc<Notify>) {
        // Readback of the accepted command, so observers see the run start.
        self.bus.post(
            &self.names.run_command(),
            BusValue::enumeration(CMD_RUN, &RUN_CHOICES),
        );

        let outcome = tokio::select! {
            _ = abort.notified() => {
                info!("run aborted by operator");
                Outcome::Abort
            }
            result = self.sequence(&stop) => match result {
                Ok(header) => Outcome::Success(header),
                Err(e) => {
                    error!("run failed: {e}");
                    Outcome::Failure
                }
            },
        };

        if tokio::time::timeout(self.settings.cleanup_timeout, self.cleanup())
            .await
            .is_err()
        {
            error!("terminal cleanup timed out");
        }

        // Observers match these three strings exactly; error detail goes to
        // the log, not the message value.
        let msg = match &outcome {
            Outcome::Success(header) => {
                self.bus.post(
                    &self.names.last_file(),
                    BusValue::Str(header.display().to_string()),
                );
                "Success"
            }
            Outcome::Failure => "Failure",
            Outcome::Abort => "Abort",
        };
        info!("run finished: {msg}");
        self.post_msg(msg);
    }

    async fn sequence(&self, stop: &Notify) -> EngineResult<PathBuf> {
        // Arm: snapshot metadata while everything is known connected.
        let full = RunHeader::snapshot(&self.cache, &self.names)?;
        let mut final_header = full.clone();
        if final_header.retain_in_use() == 0 {
            return Err(EngineError::NoSignalsInUse);
        }
        let chassis = final_header.active_chassis();

        let started = Local::now();
        let run_name = run_name(&full.acquisition_id, started);
        let rundir = run_directory(&self.settings.data_root, &full.acquisition_id, started);
        if rundir.exists() {
            return Err(EngineError::RunDirectoryExists(rundir));
        }
        fs::create_dir_all(&rundir)?;
        self.bus
            .post(&self.names.last_name(), BusValue::Str(run_name.clone()));
        info!(
            "run {run_name}: {} signals over {} chassis into {}",
            final_header.signals.len(),
            chassis.len(),
            rundir.display()
        );

        // Point every chassis at the run directory. Recording is written for
        // all 32, not just the active set: a stale enable left by a crash
        // before this process's first run must be cleared, or that chassis
        // records into the new directory.
        let mut writes = Vec::with_capacity(usize::from(crate::signals::CHASSIS_COUNT) * 3);
        for ch in 1..=crate::signals::CHASSIS_COUNT {
            writes.push((
                self.names.file_dir(ch),
                BusValue::Str(rundir.display().to_string()),
            ));
            writes.push((
                self.names.file_base(ch),
                BusValue::Str(format!("{run_name}-CH{ch:02}-")),
            ));
            writes.push((
                self.names.record(ch),
                BusValue::Int(i64::from(chassis.contains(&ch))),
            ));
        }
        self.bus.put_all(writes).await?;

        // Preliminary header: the full unfiltered tree, persisted before the
        // hardware is enabled.
        let header_path = rundir.join(format!("{run_name}.hdr"));
        let mut preliminary = full;
        preliminary.start_date = Some(format_timestamp(started));
        preliminary.write_new(&header_path)?;

        self.set_acquire(true).await?;
        // Acquire is only reported once the enable write has been accepted.
        self.post_msg("Acquire");
        info!("run {run_name}: acquiring");

        stop.notified().await;
        self.post_msg("Stopping...");
        info!("run {run_name}: stopping");

        // Stop: disable, let in-flight packets land, then trust the listing.
        self.set_acquire(false).await?;
        let offs = chassis
            .iter()
            .map(|&ch| (self.names.record(ch), BusValue::Int(0)))
            .collect();
        self.bus.put_all(offs).await?;
        tokio::time::sleep(self.settings.flush_grace).await;
        let ended = Local::now();

        final_header.start_date = Some(format_timestamp(started));
        final_header.end_date = Some(format_timestamp(ended));
        final_header.chassis = discover_captures(&rundir, &run_name, &chassis)?;
        for files in &final_header.chassis {
            if files.dat.len() != 1 {
                warn!(
                    "run {run_name}: chassis {} produced {} capture files",
                    files.chassis,
                    files.dat.len()
                );
            }
        }
        final_header.write(&header_path)?;

        self.post_msg("Post-process");
        let summary =
            convert::convert_run(&header_path, &header_path, self.settings.degraded_chassis)
                .await?;
        summary.into_result()?;
        Ok(header_path)
    }

    /// Return the hardware to its idle state. Failures are logged, never
    /// propagated: cleanup runs on every exit path including abort.
    async fn cleanup(&self) {
        if let Err(e) = self.set_acquire(false).await {
            warn!("cleanup: disabling acquisition failed: {e}");
        }
        let mut writes = Vec::new();
        for ch in 1..=crate::signals::CHASSIS_COUNT {
            writes.push((self.names.record(ch), BusValue::Int(0)));
            writes.push((self.names.file_dir(ch), BusValue::Str(String::new())));
            writes.push((self.names.file_base(ch), BusValue::Str(String::new())));
        }
        if let Err(e) = self.bus.put_all(writes).await {
            warn!("cleanup: clearing recorder configuration failed: {e}");
        }
        // Readback of the run command returns to Stop.
        self.bus.post(
            &self.names.run_command(),
            BusValue::enumeration(CMD_STOP, &RUN_CHOICES),
        );
    }

    fn post_msg(&self, msg: &str) {
        self.bus
            .post(&self.names.last_msg(), BusValue::Str(msg.to_string()));
    }

    async fn set_acquire(&self, enable: bool) -> EngineResult<()> {
        self.bus
            .put(
                &self.names.acq_enable(),
                BusValue::enumeration(u32::from(enable), &["Disable", "Enable"]),
            )
            .await
    }

    /// Mirror readiness into the served status value. Edge-triggered: only a
    /// change of state is published. The notified future is enabled before
    /// the cache is read so no update between recompute and suspension is
    /// lost.
    async fn readiness_loop(self: Arc<Self>) {
        let mut last: Option<bool> = None;
        loop {
            let changed = self.cache.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let ready = self.ready_to_go();
            if last != Some(ready) {
                last = Some(ready);
                if ready {
                    info!("ready to acquire");
                } else {
                    debug!(
                        "not ready ({} values disconnected)",
                        self.cache.disconnected_names().len()
                    );
                }
                self.bus.post(
                    &self.names.ready_status(),
                    BusValue::enumeration(u32::from(ready), &READY_CHOICES),
                );
            }

            changed.await;
        }
    }

    /// Ready to start a run: every monitored value connected, the aggregate
    /// hardware status reads `Ready`, and acquisition is currently disabled.
    pub fn ready_to_go(&self) -> bool {
        self.cache.all_connected()
            && self.cache_str(&self.names.ready_input(), "Ready")
            && self.cache_str(&self.names.acq_enable(), "Disable")
    }

    fn cache_str(&self, name: &str, expected: &str) -> bool {
        matches!(self.cache.get(name), Some(BusValue::Str(s)) if s == expected)
    }
}

/// File name prefix shared by the header and every capture file of a run.
fn run_name(acquisition_id: &str, started: DateTime<Local>) -> String {
    format!("{}-{}", acquisition_id, started.format("%Y%m%d-%H%M%S"))
}

/// `root/YYYY/MM/YYYYMMDD-HHMMSS-<id>`, dated so runs sort chronologically
/// within each month.
fn run_directory(root: &Path, acquisition_id: &str, started: DateTime<Local>) -> PathBuf {
    root.join(started.format("%Y").to_string())
        .join(started.format("%m").to_string())
        .join(format!(
            "{}-{}",
            started.format("%Y%m%d-%H%M%S"),
            acquisition_id
        ))
}

/// List each chassis's capture files, in name order. A healthy chassis
/// produces exactly one; zero or several are recorded as found and left for
/// the conversion policy to judge.
fn discover_captures(
    rundir: &Path,
    run_name: &str,
    chassis: &BTreeSet<u8>,
) -> EngineResult<Vec<ChassisFiles>> {
    let mut names: Vec<String> = Vec::new();
    for entry in fs::read_dir(rundir)? {
        let entry = entry?;
        if let Ok(name) = entry.file_name().into_string() {
            names.push(name);
        }
    }
    names.sort();

    Ok(chassis
        .iter()
        .map(|&ch| {
            let prefix = format!("{run_name}-CH{ch:02}-");
            ChassisFiles {
                chassis: ch,
                dat: names
                    .iter()
                    .filter(|n| n.starts_with(&prefix) && n.ends_with(".dat"))
                    .cloned()
                    .collect(),
            }
        })
        .collect())
}
