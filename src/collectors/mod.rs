//! Metric Collectors (C4): four collectors that issue their command set in
//! parallel through the executor and fold the results into a
//! [`crate::model::MetricSample`].

mod cpu;
mod disk;
mod memory;
mod network;

pub use cpu::CpuCollector;
pub use disk::DiskCollector;
pub use memory::MemoryCollector;
pub use network::NetworkCollector;

use crate::config::ThresholdsConfig;
use crate::model::AlertLevel;

/// Maps a numeric observation to an alert level given a warn/crit pair,
/// shared by all four collectors.
pub fn classify(value: f64, warn: f64, crit: f64) -> AlertLevel {
    if value >= crit {
        AlertLevel::Critical
    } else if value >= warn {
        AlertLevel::Warning
    } else {
        AlertLevel::Ok
    }
}

/// Bundles the four collectors behind one handle the push service can
/// drive, each holding its own per-target snapshot state.
pub struct Collectors {
    pub cpu: CpuCollector,
    pub memory: MemoryCollector,
    pub disk: DiskCollector,
    pub network: NetworkCollector,
}

impl Collectors {
    pub fn new(thresholds: ThresholdsConfig) -> Self {
        Collectors {
            cpu: CpuCollector::new(thresholds.cpu, thresholds.load),
            memory: MemoryCollector::new(thresholds.memory),
            disk: DiskCollector::new(thresholds.disk),
            network: NetworkCollector::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_respects_warn_and_crit_boundaries() {
        assert_eq!(classify(10.0, 80.0, 90.0), AlertLevel::Ok);
        assert_eq!(classify(80.0, 80.0, 90.0), AlertLevel::Warning);
        assert_eq!(classify(90.0, 80.0, 90.0), AlertLevel::Critical);
    }
}
