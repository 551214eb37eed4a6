//! Signal addressing and remote-value naming.
//!
//! The instrument is up to 32 chassis of 32 channels each. Every per-signal
//! attribute, per-chassis recording knob and engine-level status lives under
//! one global name prefix on the control bus; this module is the single place
//! those names are spelled.

use serde::{Deserialize, Serialize};

pub const CHASSIS_COUNT: u8 = 32;
pub const CHANNELS_PER_CHASSIS: u8 = 32;

/// Physical address of one acquisition channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignalAddress {
    #[serde(rename = "Chassis")]
    pub chassis: u8,
    #[serde(rename = "Channel")]
    pub channel: u8,
}

impl SignalAddress {
    /// Global signal number; total and unique over the 1024 possible pairs.
    pub fn signum(self) -> u16 {
        (u16::from(self.chassis) - 1) * u16::from(CHANNELS_PER_CHASSIS) + u16::from(self.channel)
    }
}

/// Every address in chassis-major order.
pub fn all_addresses() -> impl Iterator<Item = SignalAddress> {
    (1..=CHASSIS_COUNT).flat_map(|chassis| {
        (1..=CHANNELS_PER_CHASSIS).map(move |channel| SignalAddress { chassis, channel })
    })
}

/// Remote-value names for one signal's metadata fields.
pub struct SignalNames {
    pub in_use: String,
    pub name: String,
    pub desc: String,
    pub egu: String,
    pub slope: String,
    pub intercept: String,
    pub coupling: String,
    pub response_node: String,
    pub response_direction: String,
    pub signal_type: String,
    pub last_cal: String,
}

/// Name builder rooted at the global prefix (e.g. `FDAS:`).
#[derive(Debug, Clone)]
pub struct EngineNames {
    prefix: String,
}

impl EngineNames {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    // Readiness inputs.
    pub fn ready_input(&self) -> String {
        format!("{}SA:READY", self.prefix)
    }
    pub fn acq_enable(&self) -> String {
        format!("{}ACQ:enable", self.prefix)
    }

    // Run metadata inputs.
    pub fn acquisition_id(&self) -> String {
        format!("{}SA:DESC", self.prefix)
    }
    pub fn cccr(&self) -> String {
        format!("{}SA:FILE", self.prefix)
    }
    pub fn cccr_sha256(&self) -> String {
        format!("{}SA:FILEHASH", self.prefix)
    }
    pub fn sample_rate(&self) -> String {
        format!("{}ACQ:rate.RVAL", self.prefix)
    }

    // Per-chassis recording configuration.
    pub fn file_dir(&self, chassis: u8) -> String {
        format!("{}{:02}:FileDir-SP", self.prefix, chassis)
    }
    pub fn file_base(&self, chassis: u8) -> String {
        format!("{}{:02}:FileBase-SP", self.prefix, chassis)
    }
    pub fn record(&self, chassis: u8) -> String {
        format!("{}{:02}:Record-Sel", self.prefix, chassis)
    }

    // Served values owned by the engine.
    pub fn run_command(&self) -> String {
        format!("{}CTRL:Run-SP", self.prefix)
    }
    pub fn ready_status(&self) -> String {
        format!("{}SA:READY_", self.prefix)
    }
    pub fn last_name(&self) -> String {
        format!("{}CTRL:LastName-I", self.prefix)
    }
    pub fn last_msg(&self) -> String {
        format!("{}CTRL:LastMsg-I", self.prefix)
    }
    pub fn last_file(&self) -> String {
        format!("{}CTRL:LastFile-I", self.prefix)
    }

    /// Every remote value the engine monitors, with its signed-read hint.
    /// Raw enumeration reads come back as unsigned words; only the response
    /// direction field encodes a negative axis and needs re-interpretation.
    pub fn monitored(&self) -> Vec<(String, bool)> {
        let mut names = vec![
            (self.ready_input(), false),
            (self.acq_enable(), false),
            (self.acquisition_id(), false),
            (self.cccr(), false),
            (self.cccr_sha256(), false),
            (self.sample_rate(), false),
        ];
        for addr in all_addresses() {
            let sig = self.signal(addr);
            names.push((sig.in_use, false));
            names.push((sig.name, false));
            names.push((sig.desc, false));
            names.push((sig.egu, false));
            names.push((sig.slope, false));
            names.push((sig.intercept, false));
            names.push((sig.coupling, false));
            names.push((sig.response_node, false));
            names.push((sig.response_direction, true));
            names.push((sig.signal_type, false));
            names.push((sig.last_cal, false));
        }
        names
    }

    pub fn signal(&self, addr: SignalAddress) -> SignalNames {
        let sa = format!("{}{:02}:SA:Ch{:02}", self.prefix, addr.chassis, addr.channel);
        SignalNames {
            in_use: format!("{sa}:USE"),
            name: format!("{sa}:NAME"),
            desc: format!("{sa}:DESC"),
            egu: format!("{sa}:EGU"),
            slope: format!("{sa}:SLO"),
            intercept: format!("{sa}:OFF"),
            coupling: format!(
                "{}{:02}:ACQ:coupling:{:02}",
                self.prefix, addr.chassis, addr.channel
            ),
            response_node: format!("{sa}:RESPNODE"),
            response_direction: format!("{sa}:RESPDIR.RVAL"),
            signal_type: format!("{sa}:SDTYP.RVAL"),
            last_cal: format!("{sa}:TCAL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signum_is_total_and_unique() {
        let nums: Vec<u16> = all_addresses().map(SignalAddress::signum).collect();
        assert_eq!(nums.len(), 1024);
        assert_eq!(nums.first(), Some(&1));
        assert_eq!(nums.last(), Some(&1024));
        let mut sorted = nums.clone();
        sorted.dedup();
        assert_eq!(sorted.len(), 1024);
    }

    #[test]
    fn names_carry_prefix_and_zero_padding() {
        let names = EngineNames::new("FDAS:");
        assert_eq!(names.ready_input(), "FDAS:SA:READY");
        assert_eq!(names.file_dir(3), "FDAS:03:FileDir-SP");
        let sig = names.signal(SignalAddress {
            chassis: 1,
            channel: 7,
        });
        assert_eq!(sig.in_use, "FDAS:01:SA:Ch07:USE");
        assert_eq!(sig.coupling, "FDAS:01:ACQ:coupling:07");
        assert_eq!(sig.response_direction, "FDAS:01:SA:Ch07:RESPDIR.RVAL");
    }

    #[test]
    fn monitored_covers_every_signal_field() {
        let names = EngineNames::new("FDAS:").monitored();
        assert_eq!(names.len(), 6 + 1024 * 11);
        let signed: Vec<&String> = names.iter().filter(|(_, s)| *s).map(|(n, _)| n).collect();
        assert_eq!(signed.len(), 1024);
        assert!(signed.iter().all(|n| n.ends_with(":RESPDIR.RVAL")));
    }
}
