//! Resource pressure sampling and the pre-dispatch gate

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::error::{Result, SyncError};

/// Source of a utilization percentage (0-100)
pub trait PressureGauge: Send + Sync {
    fn utilization(&self) -> f64;
}

/// System memory utilization via sysinfo
pub struct SystemMemoryGauge {
    system: Mutex<System>,
}

impl SystemMemoryGauge {
    pub fn new() -> Self {
        SystemMemoryGauge {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemoryGauge {
    fn default() -> Self {
        Self::new()
    }
}

impl PressureGauge for SystemMemoryGauge {
    fn utilization(&self) -> f64 {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return 0.0;
        }
        system.used_memory() as f64 / total as f64 * 100.0
    }
}

/// Thresholds for the backpressure gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Above this, wait and re-sample before dispatching
    pub warn_percent: f64,
    /// A re-sample at or above this aborts the run
    pub hard_percent: f64,
    /// Wait before re-sampling
    #[serde(with = "duration_secs")]
    pub settle: Duration,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        BackpressureConfig {
            warn_percent: 80.0,
            hard_percent: 92.0,
            settle: Duration::from_secs(5),
        }
    }
}

/// Serialize a `Duration` as fractional seconds
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Outcome of a passed pressure check
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PressureLevel {
    Normal(f64),
    /// Above the warning threshold, below the hard limit after re-sampling
    Elevated(f64),
}

/// Decides whether another batch may be dispatched
#[derive(Clone)]
pub struct PressureGate {
    gauge: Arc<dyn PressureGauge>,
    config: BackpressureConfig,
}

impl PressureGate {
    pub fn new(gauge: Arc<dyn PressureGauge>, config: BackpressureConfig) -> Self {
        PressureGate { gauge, config }
    }

    pub async fn check(&self) -> Result<PressureLevel> {
        let first = self.gauge.utilization();
        if first < self.config.warn_percent {
            return Ok(PressureLevel::Normal(first));
        }

        log::warn!(
            "Memory utilization {:.1}% above warning threshold {:.1}%, re-sampling in {:?}",
            first,
            self.config.warn_percent,
            self.config.settle
        );
        tokio::time::sleep(self.config.settle).await;

        let second = self.gauge.utilization();
        if second >= self.config.hard_percent {
            log::error!(
                "Memory utilization {:.1}% at hard limit {:.1}%",
                second,
                self.config.hard_percent
            );
            return Err(SyncError::BackpressureExceeded {
                utilization: second,
                limit: self.config.hard_percent,
            });
        }
        Ok(PressureLevel::Elevated(second))
    }
}

/// Gauge replaying a fixed sequence of samples; the last one repeats
#[cfg(test)]
pub(crate) struct ScriptedGauge {
    samples: Mutex<std::collections::VecDeque<f64>>,
}

#[cfg(test)]
impl ScriptedGauge {
    pub(crate) fn new(samples: &[f64]) -> Self {
        ScriptedGauge {
            samples: Mutex::new(samples.iter().copied().collect()),
        }
    }
}

#[cfg(test)]
impl PressureGauge for ScriptedGauge {
    fn utilization(&self) -> f64 {
        let mut samples = self.samples.lock().unwrap();
        if samples.len() > 1 {
            samples.pop_front().unwrap()
        } else {
            samples.front().copied().unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(samples: &[f64]) -> PressureGate {
        let config = BackpressureConfig {
            settle: Duration::from_millis(1),
            ..BackpressureConfig::default()
        };
        PressureGate::new(Arc::new(ScriptedGauge::new(samples)), config)
    }

    #[tokio::test]
    async fn test_below_warning_passes() {
        assert_eq!(gate(&[40.0]).check().await.unwrap(), PressureLevel::Normal(40.0));
    }

    #[tokio::test]
    async fn test_warning_then_recovery_passes() {
        assert_eq!(
            gate(&[85.0, 70.0]).check().await.unwrap(),
            PressureLevel::Elevated(70.0)
        );
    }

    #[tokio::test]
    async fn test_sustained_hard_pressure_aborts() {
        let err = gate(&[95.0, 93.0]).check().await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::BackpressureExceeded { utilization, limit } if utilization == 93.0 && limit == 92.0
        ));
    }

    #[test]
    fn test_config_from_toml() {
        let config: BackpressureConfig = toml::from_str("warn_percent = 75.0\nsettle = 0.5").unwrap();
        assert_eq!(config.warn_percent, 75.0);
        assert_eq!(config.hard_percent, 92.0);
        assert_eq!(config.settle, Duration::from_millis(500));
    }

    #[test]
    fn test_system_gauge_in_range() {
        let value = SystemMemoryGauge::new().utilization();
        assert!((0.0..=100.0).contains(&value));
    }
}
