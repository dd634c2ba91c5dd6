//! Shard capacity model.
//!
//! Translates raw hardware hints (sequential bandwidth, IOPS) into the two
//! numbers the rest of the scheduler consumes: the bandwidth cost of one IO
//! and the bandwidth share of a single shard.

use tracing::info;

use crate::config::CapacitySettings;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapacityModel {
    /// Bytes of bandwidth one IO is worth: `bandwidth / iops`.
    /// Admission charges every request at least this much.
    pub bandwidth_cost_per_io: f64,
    /// Bytes/s available to one shard: `bandwidth / num_shards`.
    pub capacity_per_shard: f64,
}

impl CapacityModel {
    /// Compute the model from configured hints.
    ///
    /// Pure: same inputs always produce the same outputs. Zero hints clamp
    /// to one, so both outputs are strictly positive.
    #[must_use]
    pub fn from_config(settings: &CapacitySettings, is_rotational: bool, num_shards: u32) -> Self {
        let (bandwidth, iops) = if is_rotational {
            (
                settings.max_sequential_bandwidth_hdd,
                settings.max_capacity_iops_hdd,
            )
        } else {
            (
                settings.max_sequential_bandwidth_ssd,
                settings.max_capacity_iops_ssd,
            )
        };

        #[allow(clippy::cast_precision_loss)]
        let bandwidth = bandwidth.max(1) as f64;
        let iops = iops.max(1.0);

        let model = Self {
            bandwidth_cost_per_io: bandwidth / iops,
            capacity_per_shard: bandwidth / f64::from(num_shards.max(1)),
        };
        info!(
            target: "weir::capacity",
            cost_per_io_bytes = format_args!("{:.2}", model.bandwidth_cost_per_io),
            capacity_per_shard_bytes_per_sec = format_args!("{:.2}", model.capacity_per_shard),
            is_rotational,
            "computed shard capacity"
        );
        model
    }
}
