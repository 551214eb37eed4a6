//! Run header document.
//!
//! A run is described by one JSON header written twice: a *preliminary* form
//! persisted before acquisition is enabled (so a crash mid-run still leaves
//! recoverable context), and a *final* form rewritten after stop with the
//! discovered per-chassis capture files and, once conversion completes, the
//! per-channel output artifact paths.
//!
//! Field values snapshotted from the control bus are kept as raw JSON values:
//! the engine routes them, it does not interpret calibration.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::ReadinessCache;
use crate::error::EngineResult;
use crate::signals::{all_addresses, EngineNames, SignalAddress};

/// Timestamp format used for all header dates. Local time is a customer
/// requirement for string representations.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d %H%M%S%z";

pub fn format_timestamp(t: DateTime<Local>) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

/// Metadata for one signal, snapshotted at arm time and immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalMeta {
    #[serde(rename = "Address")]
    pub address: SignalAddress,
    #[serde(rename = "SigNum")]
    pub signum: u16,
    #[serde(rename = "Inuse")]
    pub in_use: Value,
    #[serde(rename = "Name")]
    pub name: Value,
    #[serde(rename = "Desc")]
    pub desc: Value,
    #[serde(rename = "Egu")]
    pub egu: Value,
    #[serde(rename = "Slope")]
    pub slope: Value,
    #[serde(rename = "Intercept")]
    pub intercept: Value,
    #[serde(rename = "Coupling")]
    pub coupling: Value,
    #[serde(rename = "ResponseNode")]
    pub response_node: Value,
    #[serde(rename = "ResponseDirection")]
    pub response_direction: Value,
    #[serde(rename = "Type")]
    pub signal_type: Value,
    #[serde(rename = "LastCal")]
    pub last_cal: Value,
    #[serde(rename = "ReferenceNode")]
    pub reference_node: i64,
    #[serde(rename = "ReferenceDirection")]
    pub reference_direction: i64,
    /// Relative path of the converted channel artifact; final form only.
    #[serde(rename = "OutDataFile", default, skip_serializing_if = "Option::is_none")]
    pub out_data_file: Option<String>,
}

impl SignalMeta {
    pub fn is_in_use(&self) -> bool {
        self.in_use == Value::from("Yes")
    }
}

/// Capture files discovered for one chassis after stop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChassisFiles {
    #[serde(rename = "Chassis")]
    pub chassis: u8,
    /// File names relative to the header's directory. May be empty or hold
    /// several entries for a degraded chassis.
    #[serde(rename = "Dat")]
    pub dat: Vec<String>,
}

/// The run header document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunHeader {
    #[serde(rename = "AcquisitionId")]
    pub acquisition_id: String,
    #[serde(rename = "CCCR")]
    pub cccr: Value,
    #[serde(rename = "CCCR_SHA256")]
    pub cccr_sha256: Value,
    #[serde(rename = "SampleRate")]
    pub sample_rate: Value,
    #[serde(rename = "AcquisitionStartDate")]
    pub start_date: Option<String>,
    #[serde(rename = "AcquisitionEndDate")]
    pub end_date: Option<String>,
    #[serde(rename = "Signals")]
    pub signals: Vec<SignalMeta>,
    #[serde(rename = "Chassis")]
    pub chassis: Vec<ChassisFiles>,
}

impl RunHeader {
    /// Snapshot the full 1024-signal metadata tree from the readiness cache.
    /// Fails with `Disconnected` if any required value has no live reading.
    pub fn snapshot(cache: &ReadinessCache, names: &EngineNames) -> EngineResult<Self> {
        let acquisition_id = match cache.read(&names.acquisition_id())? {
            crate::bus::BusValue::Str(s) => s,
            other => other.to_json().to_string(),
        };

        let mut signals = Vec::with_capacity(1024);
        for addr in all_addresses() {
            let sig = names.signal(addr);
            signals.push(SignalMeta {
                address: addr,
                signum: addr.signum(),
                in_use: cache.read_json(&sig.in_use)?,
                name: cache.read_json(&sig.name)?,
                desc: cache.read_json(&sig.desc)?,
                egu: cache.read_json(&sig.egu)?,
                slope: cache.read_json(&sig.slope)?,
                intercept: cache.read_json(&sig.intercept)?,
                coupling: cache.read_json(&sig.coupling)?,
                response_node: cache.read_json(&sig.response_node)?,
                response_direction: cache.read_json(&sig.response_direction)?,
                signal_type: cache.read_json(&sig.signal_type)?,
                last_cal: cache.read_json(&sig.last_cal)?,
                reference_node: 0,
                reference_direction: 0,
                out_data_file: None,
            });
        }

        Ok(Self {
            acquisition_id,
            cccr: cache.read_json(&names.cccr())?,
            cccr_sha256: cache.read_json(&names.cccr_sha256())?,
            sample_rate: cache.read_json(&names.sample_rate())?,
            start_date: None,
            end_date: None,
            signals,
            chassis: Vec::new(),
        })
    }

    /// Drop signals not in use. Returns how many remain.
    pub fn retain_in_use(&mut self) -> usize {
        self.signals.retain(SignalMeta::is_in_use);
        self.signals.len()
    }

    /// The set of chassis with at least one in-use signal.
    pub fn active_chassis(&self) -> BTreeSet<u8> {
        self.signals
            .iter()
            .filter(|s| s.is_in_use())
            .map(|s| s.address.chassis)
            .collect()
    }

    /// Write the preliminary form; the file must not already exist.
    pub fn write_new(&self, path: &Path) -> EngineResult<()> {
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// Rewrite the header in place.
    pub fn write(&self, path: &Path) -> EngineResult<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> EngineResult<Self> {
        let file = fs::File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sig(chassis: u8, channel: u8, in_use: &str) -> SignalMeta {
        SignalMeta {
            address: SignalAddress { chassis, channel },
            signum: SignalAddress { chassis, channel }.signum(),
            in_use: json!(in_use),
            name: json!("SIG"),
            desc: json!(""),
            egu: json!("V"),
            slope: json!(1.0),
            intercept: json!(0.0),
            coupling: json!("AC"),
            response_node: json!(0),
            response_direction: json!(1),
            signal_type: json!(3),
            last_cal: json!(0),
            reference_node: 0,
            reference_direction: 0,
            out_data_file: None,
        }
    }

    fn header() -> RunHeader {
        RunHeader {
            acquisition_id: "shot42".into(),
            cccr: json!("cccr.xlsx"),
            cccr_sha256: json!("deadbeef"),
            sample_rate: json!(250_000),
            start_date: Some("20250101 120000+0000".into()),
            end_date: None,
            signals: vec![sig(1, 1, "Yes"), sig(1, 2, "No"), sig(5, 1, "Yes")],
            chassis: Vec::new(),
        }
    }

    #[test]
    fn json_keys_match_document_convention() {
        let text = serde_json::to_string(&header()).unwrap();
        for key in [
            "\"AcquisitionId\"",
            "\"CCCR_SHA256\"",
            "\"SampleRate\"",
            "\"AcquisitionStartDate\"",
            "\"Signals\"",
            "\"SigNum\"",
            "\"Inuse\"",
            "\"ReferenceDirection\"",
        ] {
            assert!(text.contains(key), "missing {key} in {text}");
        }
        // OutDataFile is omitted until conversion fills it in.
        assert!(!text.contains("OutDataFile"));
    }

    #[test]
    fn retain_in_use_and_active_chassis() {
        let mut hdr = header();
        assert_eq!(hdr.active_chassis().into_iter().collect::<Vec<_>>(), vec![1, 5]);
        assert_eq!(hdr.retain_in_use(), 2);
        assert!(hdr.signals.iter().all(SignalMeta::is_in_use));
    }

    #[test]
    fn write_new_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.hdr");
        let hdr = header();
        hdr.write_new(&path).unwrap();
        assert!(hdr.write_new(&path).is_err());
        let loaded = RunHeader::load(&path).unwrap();
        assert_eq!(loaded, hdr);
    }

    #[test]
    fn timestamp_format_shape() {
        let t = format_timestamp(Local::now());
        // YYYYMMDD HHMMSS±ZZZZ
        assert_eq!(t.len(), "20250101 120000+0000".len());
        assert_eq!(t.as_bytes()[8], b' ');
    }
}
