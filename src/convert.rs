//! Chassis fan-out scheduler.
//!
//! Takes a run header with discovered per-chassis capture files and drives
//! one [`crate::codec`] invocation per chassis, in parallel on blocking
//! workers. Each invocation decodes into a private scratch directory created
//! *inside* the output tree, so promoting a finished channel artifact to its
//! final location is a same-volume rename, not a copy.
//!
//! Partial failure is tolerated throughout: one chassis's diagnostics (or
//! hard failure) never stop its siblings, and the final header plus all
//! successful artifacts are written regardless. The caller sees a nonzero
//! [`ConvertSummary::total_diagnostics`] and decides whether that makes the
//! whole job degraded.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::{self, DecodeOutput};
use crate::config::DegradedChassisPolicy;
use crate::error::{EngineError, EngineResult};
use crate::header::RunHeader;
use crate::signals::{SignalAddress, CHANNELS_PER_CHASSIS};

/// Aggregate result of one fan-out job.
#[derive(Debug, Default)]
pub struct ConvertSummary {
    /// Decode diagnostics plus hard per-chassis failures, across all chassis.
    pub total_diagnostics: usize,
    /// Chassis skipped under [`DegradedChassisPolicy::Skip`].
    pub skipped_chassis: Vec<u8>,
}

impl ConvertSummary {
    /// Error form: nonzero diagnostics make the job degraded.
    pub fn into_result(self) -> EngineResult<()> {
        if self.total_diagnostics > 0 {
            Err(EngineError::DegradedDecode(self.total_diagnostics))
        } else {
            Ok(())
        }
    }
}

/// Convert every chassis named in `input_header`, writing channel artifacts
/// and the finalized header (with per-signal `OutDataFile` paths) relative to
/// `output_header`.
pub async fn convert_run(
    input_header: &Path,
    output_header: &Path,
    policy: DegradedChassisPolicy,
) -> EngineResult<ConvertSummary> {
    let mut info = RunHeader::load(input_header)?;
    let indir = parent_of(input_header);
    let outdir = parent_of(output_header);
    fs::create_dir_all(&outdir)?;

    let stem = output_header
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| {
            EngineError::Configuration(format!(
                "Output header has no usable stem: {}",
                output_header.display()
            ))
        })?
        .to_string();

    // Index (chassis, channel) -> offset in the signal list.
    let index: HashMap<SignalAddress, usize> = info
        .signals
        .iter()
        .enumerate()
        .map(|(i, sig)| (sig.address, i))
        .collect();

    // Scratch lives on the output volume so relocation is a cheap rename.
    let scratch = tempfile::Builder::new()
        .prefix(".convert-")
        .tempdir_in(&outdir)?;

    let mut summary = ConvertSummary::default();
    let mut jobs: Vec<(u8, JoinHandle<EngineResult<DecodeOutput>>)> = Vec::new();

    for entry in &info.chassis {
        let chassis = entry.chassis;
        if entry.dat.len() != 1 {
            warn!(
                "Not 1 .dat for chassis {}: {:?}",
                chassis, entry.dat
            );
            if policy == DegradedChassisPolicy::Skip {
                summary.skipped_chassis.push(chassis);
                continue;
            }
        }
        let inputs: Vec<PathBuf> = entry.dat.iter().map(|d| indir.join(d)).collect();
        let chassis_scratch = scratch.path().join(format!("CH{chassis:02}"));
        fs::create_dir(&chassis_scratch)?;

        debug!("dispatching decode for chassis {chassis} ({} files)", inputs.len());
        jobs.push((
            chassis,
            tokio::task::spawn_blocking(move || codec::convert_capture(&inputs, &chassis_scratch)),
        ));
    }

    for (chassis, job) in jobs {
        match job.await {
            Ok(Ok(output)) => {
                for diag in &output.diagnostics {
                    warn!("chassis {chassis}: {diag}");
                }
                summary.total_diagnostics += output.diagnostics.len();
                info!(
                    "chassis {chassis}: {} samples/channel, {} diagnostics",
                    output.samples_per_channel,
                    output.diagnostics.len()
                );
                relocate_chassis(
                    chassis,
                    &scratch.path().join(format!("CH{chassis:02}")),
                    &outdir,
                    &stem,
                    &index,
                    &mut info,
                )?;
            }
            Ok(Err(e)) => {
                error!("chassis {chassis} decode failed: {e}");
                summary.total_diagnostics += 1;
            }
            Err(e) => {
                error!("chassis {chassis} decode worker died: {e}");
                summary.total_diagnostics += 1;
            }
        }
    }

    info.write(output_header)?;
    Ok(summary)
}

/// Move one chassis's finished artifacts out of scratch and record their
/// relative paths in the header.
fn relocate_chassis(
    chassis: u8,
    chassis_scratch: &Path,
    outdir: &Path,
    stem: &str,
    index: &HashMap<SignalAddress, usize>,
    info: &mut RunHeader,
) -> EngineResult<()> {
    let chassis_dirname = format!("{stem}-CH{chassis:02}");
    let chassis_dir = outdir.join(&chassis_dirname);

    for channel in 1..=CHANNELS_PER_CHASSIS {
        let addr = SignalAddress { chassis, channel };
        let Some(&idx) = index.get(&addr) else {
            continue;
        };
        if !info.signals[idx].is_in_use() {
            continue;
        }

        fs::create_dir_all(&chassis_dir)?;
        let src = chassis_scratch.join(codec::channel_artifact_name(usize::from(channel) - 1));
        let relative = format!("{chassis_dirname}/ch{channel}.j");
        fs::rename(&src, outdir.join(&relative))?;
        info.signals[idx].out_data_file = Some(relative);
    }
    Ok(())
}

fn parent_of(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
