//! Scheduler configuration.
//!
//! Mirrors the layout of the node's config files: a `[qos]` section with one
//! `(reservation_ratio, weight, limit_ratio)` triple per class, a
//! `[capacity]` section with per-device-class hardware hints, and top-level
//! selectors for the QoS profile and the priority cutoff. Loadable from TOML
//! or JSON by file extension.
//!
//! Live reconfiguration is message-shaped: the host computes a
//! [`ConfigDelta`] (new snapshot plus the set of changed [`ConfigKey`]s) and
//! hands it to the scheduler on the shard's executor. The scheduler holds no
//! global observer state.

use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use weir_core::{Result, WeirError};

use crate::profile::Profile;

/// Message priority below which ops are fair-share scheduled when the cutoff
/// selector is `low`.
pub const PRIO_LOW_CUTOFF: u32 = 64;

/// Message priority below which ops are fair-share scheduled when the cutoff
/// selector is `high`.
pub const PRIO_HIGH_CUTOFF: u32 = 196;

/// Selects the message-priority threshold above which items bypass
/// fair-share arbitration. Read once at scheduler construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutoffSelector {
    Low,
    #[default]
    High,
    /// Picks `low` or `high` uniformly at process start. Test-only knob for
    /// shaking out ordering assumptions.
    DebugRandom,
}

impl CutoffSelector {
    /// Resolve to a concrete priority threshold.
    #[must_use]
    pub fn resolve(self) -> u32 {
        match self {
            CutoffSelector::Low => PRIO_LOW_CUTOFF,
            CutoffSelector::High => PRIO_HIGH_CUTOFF,
            CutoffSelector::DebugRandom => {
                if rand::rng().random_bool(0.5) {
                    PRIO_HIGH_CUTOFF
                } else {
                    PRIO_LOW_CUTOFF
                }
            }
        }
    }
}

impl FromStr for CutoffSelector {
    type Err = WeirError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(CutoffSelector::Low),
            "high" => Ok(CutoffSelector::High),
            "debug_random" => Ok(CutoffSelector::DebugRandom),
            other => Err(WeirError::Config(format!(
                "unknown op queue cutoff: {other}"
            ))),
        }
    }
}

/// Per-class QoS knobs, expressed as ratios of the shard's capacity.
///
/// A ratio of `0.0` means "no minimum" for reservations and "no ceiling" for
/// limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassQos {
    #[serde(default)]
    pub reservation_ratio: f64,
    #[serde(default = "default_weight")]
    pub weight: u64,
    #[serde(default)]
    pub limit_ratio: f64,
}

impl Default for ClassQos {
    fn default() -> Self {
        Self {
            reservation_ratio: 0.0,
            weight: 1,
            limit_ratio: 0.0,
        }
    }
}

fn default_weight() -> u64 {
    1
}

/// Explicit per-class settings, honoured when the profile is `custom`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QosSettings {
    #[serde(default)]
    pub client: ClassQos,
    #[serde(default)]
    pub background_recovery: ClassQos,
    #[serde(default)]
    pub background_best_effort: ClassQos,
}

/// Raw hardware capacity hints, one pair per device class. The shard's
/// `is_rotational` flag selects which pair applies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapacitySettings {
    /// Sequential bandwidth of a rotational device, bytes/s.
    #[serde(default = "default_bandwidth_hdd")]
    pub max_sequential_bandwidth_hdd: u64,
    /// Sequential bandwidth of a solid-state device, bytes/s.
    #[serde(default = "default_bandwidth_ssd")]
    pub max_sequential_bandwidth_ssd: u64,
    /// IOPS capacity of a rotational device.
    #[serde(default = "default_iops_hdd")]
    pub max_capacity_iops_hdd: f64,
    /// IOPS capacity of a solid-state device.
    #[serde(default = "default_iops_ssd")]
    pub max_capacity_iops_ssd: f64,
}

impl Default for CapacitySettings {
    fn default() -> Self {
        Self {
            max_sequential_bandwidth_hdd: default_bandwidth_hdd(),
            max_sequential_bandwidth_ssd: default_bandwidth_ssd(),
            max_capacity_iops_hdd: default_iops_hdd(),
            max_capacity_iops_ssd: default_iops_ssd(),
        }
    }
}

fn default_bandwidth_hdd() -> u64 {
    150 * 1024 * 1024 // 150 MiB/s
}

fn default_bandwidth_ssd() -> u64 {
    1200 * 1024 * 1024 // 1200 MiB/s
}

fn default_iops_hdd() -> f64 {
    315.0
}

fn default_iops_ssd() -> f64 {
    21500.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub profile: Profile,
    #[serde(default)]
    pub op_queue_cutoff: CutoffSelector,
    /// How long a drained client's tag state is retained, in seconds.
    /// `0.0` disables anticipation: tag state is discarded as soon as the
    /// client goes idle.
    #[serde(default)]
    pub anticipation_timeout_secs: f64,
    /// Upper bound on tracked per-tenant QoS entries; least-recently-seen
    /// tenants are evicted beyond this.
    #[serde(default = "default_max_external_clients")]
    pub max_external_clients: usize,
    #[serde(default)]
    pub qos: QosSettings,
    #[serde(default)]
    pub capacity: CapacitySettings,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            profile: Profile::default(),
            op_queue_cutoff: CutoffSelector::default(),
            anticipation_timeout_secs: 0.0,
            max_external_clients: default_max_external_clients(),
            qos: QosSettings::default(),
            capacity: CapacitySettings::default(),
        }
    }
}

fn default_max_external_clients() -> usize {
    1024
}

impl SchedulerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match ext {
            "toml" => toml::from_str(&content)
                .map_err(|e| WeirError::Config(format!("TOML parse error: {e}"))),
            "json" => serde_json::from_str(&content)
                .map_err(|e| WeirError::Config(format!("JSON parse error: {e}"))),
            _ => Err(WeirError::Config(format!(
                "unknown config file extension: {ext}"
            ))),
        }
    }
}

/// One tracked configuration key.
///
/// Exhaustive: reconfiguration reacts only to keys named here, and the
/// handling logic matches on the key kind rather than string names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigKey {
    ClientReservation,
    ClientWeight,
    ClientLimit,
    BackgroundRecoveryReservation,
    BackgroundRecoveryWeight,
    BackgroundRecoveryLimit,
    BackgroundBestEffortReservation,
    BackgroundBestEffortWeight,
    BackgroundBestEffortLimit,
    MaxCapacityIopsHdd,
    MaxCapacityIopsSsd,
    MaxSequentialBandwidthHdd,
    MaxSequentialBandwidthSsd,
    Profile,
}

impl ConfigKey {
    /// True for keys that feed the capacity model.
    #[must_use]
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            ConfigKey::MaxCapacityIopsHdd
                | ConfigKey::MaxCapacityIopsSsd
                | ConfigKey::MaxSequentialBandwidthHdd
                | ConfigKey::MaxSequentialBandwidthSsd
        )
    }

    /// True for per-class reservation/weight/limit keys.
    #[must_use]
    pub fn is_qos(&self) -> bool {
        matches!(
            self,
            ConfigKey::ClientReservation
                | ConfigKey::ClientWeight
                | ConfigKey::ClientLimit
                | ConfigKey::BackgroundRecoveryReservation
                | ConfigKey::BackgroundRecoveryWeight
                | ConfigKey::BackgroundRecoveryLimit
                | ConfigKey::BackgroundBestEffortReservation
                | ConfigKey::BackgroundBestEffortWeight
                | ConfigKey::BackgroundBestEffortLimit
        )
    }
}

/// A live configuration change: the new snapshot plus which keys moved.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDelta {
    pub config: SchedulerConfig,
    pub changed: BTreeSet<ConfigKey>,
}

impl ConfigDelta {
    /// Diff two snapshots into a delta carrying `new`.
    #[must_use]
    pub fn between(old: &SchedulerConfig, new: SchedulerConfig) -> Self {
        let mut changed = BTreeSet::new();

        let class = |changed: &mut BTreeSet<ConfigKey>,
                     old: &ClassQos,
                     new: &ClassQos,
                     keys: [ConfigKey; 3]| {
            if old.reservation_ratio != new.reservation_ratio {
                changed.insert(keys[0]);
            }
            if old.weight != new.weight {
                changed.insert(keys[1]);
            }
            if old.limit_ratio != new.limit_ratio {
                changed.insert(keys[2]);
            }
        };

        class(
            &mut changed,
            &old.qos.client,
            &new.qos.client,
            [
                ConfigKey::ClientReservation,
                ConfigKey::ClientWeight,
                ConfigKey::ClientLimit,
            ],
        );
        class(
            &mut changed,
            &old.qos.background_recovery,
            &new.qos.background_recovery,
            [
                ConfigKey::BackgroundRecoveryReservation,
                ConfigKey::BackgroundRecoveryWeight,
                ConfigKey::BackgroundRecoveryLimit,
            ],
        );
        class(
            &mut changed,
            &old.qos.background_best_effort,
            &new.qos.background_best_effort,
            [
                ConfigKey::BackgroundBestEffortReservation,
                ConfigKey::BackgroundBestEffortWeight,
                ConfigKey::BackgroundBestEffortLimit,
            ],
        );

        if old.capacity.max_capacity_iops_hdd != new.capacity.max_capacity_iops_hdd {
            changed.insert(ConfigKey::MaxCapacityIopsHdd);
        }
        if old.capacity.max_capacity_iops_ssd != new.capacity.max_capacity_iops_ssd {
            changed.insert(ConfigKey::MaxCapacityIopsSsd);
        }
        if old.capacity.max_sequential_bandwidth_hdd != new.capacity.max_sequential_bandwidth_hdd {
            changed.insert(ConfigKey::MaxSequentialBandwidthHdd);
        }
        if old.capacity.max_sequential_bandwidth_ssd != new.capacity.max_sequential_bandwidth_ssd {
            changed.insert(ConfigKey::MaxSequentialBandwidthSsd);
        }
        if old.profile != new.profile {
            changed.insert(ConfigKey::Profile);
        }

        Self {
            config: new,
            changed,
        }
    }
}
