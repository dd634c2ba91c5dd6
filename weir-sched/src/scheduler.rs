//! Scheduler façade.
//!
//! One instance per shard. Routes each enqueued item to the strict-priority
//! bypass (immediate class, or message priority at/above the cutoff) or into
//! the dmClock tag engine, and drains the bypass ahead of fair-share work.
//! All operations are non-blocking and must be called from the shard's
//! owning executor; there is no internal locking.

use std::fmt;

use serde::Serialize;
use tracing::{debug, info, trace};
use weir_core::{ClientProfileId, MonotonicClock, SchedulerClock, Tick, WorkItemView};

use crate::capacity::CapacityModel;
use crate::config::{ConfigDelta, ConfigKey, SchedulerConfig};
use crate::dmclock::{MclockEngine, Pull};
use crate::high_priority::{FRONT_DIVERT_PRIORITY, HighPriorityQueue, IMMEDIATE_CLASS_PRIORITY};
use crate::profile::Profile;
use crate::registry::{ClientInfo, ClientRegistry, SchedulerId};

/// Per-shard identity and hardware facts, fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct ShardParams {
    /// Node id, for log context only.
    pub whoami: u32,
    pub num_shards: u32,
    pub shard_id: u32,
    pub is_rotational: bool,
}

/// Outcome of a [`MclockScheduler::dequeue`] call.
#[derive(Debug, PartialEq)]
pub enum DequeueResult<T> {
    /// The next item to dispatch.
    Item(T),
    /// Work is pending but throttled; call `dequeue` again at or after the
    /// given tick. Arm exactly one timer per shard.
    WaitUntil(Tick),
    /// Nothing is queued.
    Empty,
}

/// Cheap per-shard operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardStats {
    pub enqueued_immediate: u64,
    pub enqueued_cutoff: u64,
    pub enqueued_fair: u64,
    /// `enqueue_front` calls diverted from the tag engine to bypass
    /// priority 0.
    pub front_diverted: u64,
    pub dequeued_high: u64,
    pub dequeued_fair: u64,
    pub waits: u64,
}

/// Stable-format observability snapshot.
#[derive(Debug, Serialize)]
pub struct SchedulerDump {
    pub queue_sizes: QueueSizes,
    #[serde(rename = "mClockClients")]
    pub mclock_clients: MclockClients,
    #[serde(rename = "mClockQueues")]
    pub mclock_queues: MclockQueues,
    #[serde(rename = "HighPriorityQueue")]
    pub high_priority_queue: Vec<PriorityBucketDepth>,
}

#[derive(Debug, Serialize)]
pub struct QueueSizes {
    pub high_priority_queue: usize,
    pub scheduler: usize,
}

#[derive(Debug, Serialize)]
pub struct MclockClients {
    pub client_count: usize,
    pub clients: String,
}

#[derive(Debug, Serialize)]
pub struct MclockQueues {
    pub queues: String,
}

#[derive(Debug, Serialize)]
pub struct PriorityBucketDepth {
    pub priority: u32,
    pub queue_size: usize,
}

enum Route {
    Immediate,
    Cutoff(u32),
    FairShare(SchedulerId),
}

pub struct MclockScheduler<T, C = MonotonicClock> {
    shard: ShardParams,
    config: SchedulerConfig,
    cutoff_priority: u32,
    capacity: CapacityModel,
    registry: ClientRegistry,
    engine: MclockEngine<T, C>,
    high_priority: HighPriorityQueue<T>,
    stats: ShardStats,
}

impl<T: WorkItemView> MclockScheduler<T, MonotonicClock> {
    #[must_use]
    pub fn new(config: SchedulerConfig, shard: ShardParams) -> Self {
        Self::with_clock(config, shard, MonotonicClock::new())
    }
}

impl<T: WorkItemView, C: SchedulerClock> MclockScheduler<T, C> {
    /// Build a shard scheduler around an explicit clock.
    ///
    /// # Panics
    ///
    /// A node hosts at least one shard; `num_shards == 0` is a caller bug.
    #[must_use]
    pub fn with_clock(config: SchedulerConfig, shard: ShardParams, clock: C) -> Self {
        assert!(shard.num_shards > 0, "num_shards must be positive");

        let cutoff_priority = config.op_queue_cutoff.resolve();
        let capacity =
            CapacityModel::from_config(&config.capacity, shard.is_rotational, shard.num_shards);

        let mut registry = ClientRegistry::new(config.max_external_clients);
        let table = config.profile.materialize(&config.qos);
        registry.update_from_config(&table, capacity.capacity_per_shard);

        let engine = MclockEngine::new(clock, config.anticipation_timeout_secs);

        info!(
            target: "weir::sched",
            whoami = shard.whoami,
            shard_id = shard.shard_id,
            num_shards = shard.num_shards,
            profile = %config.profile,
            cutoff_priority,
            "shard scheduler ready"
        );

        Self {
            shard,
            config,
            cutoff_priority,
            capacity,
            registry,
            engine,
            high_priority: HighPriorityQueue::new(),
            stats: ShardStats::default(),
        }
    }

    fn route(&self, item: &T) -> Route {
        match SchedulerId::for_item(item) {
            None => Route::Immediate,
            Some(_) if item.priority() >= self.cutoff_priority => Route::Cutoff(item.priority()),
            Some(id) => Route::FairShare(id),
        }
    }

    /// Every admitted request is charged at least one IO's worth of
    /// bandwidth, and never less than one byte.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn calc_scaled_cost(&self, item_cost: i32) -> u32 {
        let cost = item_cost.max(1) as u32;
        let cost_per_io = (self.capacity.bandwidth_cost_per_io as u32).max(1);
        cost.max(cost_per_io)
    }

    pub fn enqueue(&mut self, item: T) {
        match self.route(&item) {
            Route::Immediate => {
                self.stats.enqueued_immediate += 1;
                self.high_priority
                    .enqueue_high(IMMEDIATE_CLASS_PRIORITY, item, false);
            }
            Route::Cutoff(priority) => {
                self.stats.enqueued_cutoff += 1;
                self.high_priority.enqueue_high(priority, item, false);
            }
            Route::FairShare(id) => {
                let cost = self.calc_scaled_cost(item.cost());
                let info = self.registry.get_info(&id);
                trace!(
                    target: "weir::sched",
                    client = %id,
                    item_cost = item.cost(),
                    scaled_cost = cost,
                    "admit to tag engine"
                );
                self.engine.add_request(item, id, cost, info);
                self.stats.enqueued_fair += 1;
            }
        }
    }

    /// Enqueue ahead of waiting peers. The tag engine cannot express "skip
    /// ahead", so fair-share items land in bypass bucket 0: below every
    /// configurable priority, still ahead of all fair-share work.
    pub fn enqueue_front(&mut self, item: T) {
        match self.route(&item) {
            Route::Immediate => {
                self.stats.enqueued_immediate += 1;
                self.high_priority
                    .enqueue_high(IMMEDIATE_CLASS_PRIORITY, item, true);
            }
            Route::Cutoff(priority) => {
                self.stats.enqueued_cutoff += 1;
                self.high_priority.enqueue_high(priority, item, true);
            }
            Route::FairShare(_) => {
                self.stats.front_diverted += 1;
                self.high_priority
                    .enqueue_high(FRONT_DIVERT_PRIORITY, item, true);
            }
        }
    }

    /// Next item, wake-up token, or emptiness. Never blocks.
    pub fn dequeue(&mut self) -> DequeueResult<T> {
        if let Some(item) = self.high_priority.dequeue_high() {
            self.stats.dequeued_high += 1;
            return DequeueResult::Item(item);
        }
        match self.engine.pull_request() {
            Pull::Item {
                item,
                client,
                cost,
                phase,
            } => {
                self.stats.dequeued_fair += 1;
                trace!(
                    target: "weir::sched",
                    client = %client,
                    cost,
                    phase = ?phase,
                    "pulled from tag engine"
                );
                DequeueResult::Item(item)
            }
            Pull::Future { wake_at } => {
                self.stats.waits += 1;
                DequeueResult::WaitUntil(wake_at)
            }
            Pull::Empty => DequeueResult::Empty,
        }
    }

    /// Apply a live configuration change delivered by the host.
    pub fn apply_config_delta(&mut self, delta: ConfigDelta) {
        let ConfigDelta { config, changed } = delta;
        if changed.is_empty() {
            return;
        }

        let mut refresh = false;

        if changed.iter().any(ConfigKey::is_capacity) {
            self.capacity = CapacityModel::from_config(
                &config.capacity,
                self.shard.is_rotational,
                self.shard.num_shards,
            );
            refresh = true;
        }

        if changed.contains(&ConfigKey::Profile) {
            info!(
                target: "weir::sched",
                shard_id = self.shard.shard_id,
                old = %self.config.profile,
                new = %config.profile,
                "switching QoS profile"
            );
            refresh = true;
        }

        // Direct per-class edits only matter under the custom profile; a
        // named profile would re-assert its own values anyway.
        if !refresh
            && changed.iter().any(ConfigKey::is_qos)
            && config.profile == Profile::Custom
        {
            refresh = true;
        }

        self.config = config;

        if refresh {
            let table = self.config.profile.materialize(&self.config.qos);
            self.registry
                .update_from_config(&table, self.capacity.capacity_per_shard);
            debug!(
                target: "weir::sched",
                shard_id = self.shard.shard_id,
                capacity_per_shard = self.capacity.capacity_per_shard,
                "client registry refreshed"
            );
        }
    }

    /// Install explicit QoS rates for one external tenant.
    pub fn set_client_qos(&mut self, profile: ClientProfileId, qos: ClientInfo) {
        self.registry.set_external_client(profile, qos);
    }

    /// Drop a tenant's explicit QoS entry.
    pub fn remove_client_qos(&mut self, profile: ClientProfileId) -> bool {
        self.registry.remove_external_client(profile)
    }

    /// The QoS parameters currently governing `id`.
    pub fn qos_info(&mut self, id: &SchedulerId) -> ClientInfo {
        self.registry.get_info(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.high_priority.len() + self.engine.request_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clients tracked by the tag engine (bypass traffic never counts).
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.engine.client_count()
    }

    #[must_use]
    pub fn stats(&self) -> ShardStats {
        self.stats
    }

    #[must_use]
    pub fn capacity(&self) -> CapacityModel {
        self.capacity
    }

    /// Current scheduler time, for arming `WaitUntil` timers.
    #[must_use]
    pub fn now(&self) -> Tick {
        self.engine.clock_now()
    }

    /// Human-readable tag engine snapshot.
    #[must_use]
    pub fn display_queues(&self) -> String {
        self.engine.display_queues_string()
    }

    /// Structured observability snapshot with stable section names.
    #[must_use]
    pub fn dump(&self) -> SchedulerDump {
        SchedulerDump {
            queue_sizes: QueueSizes {
                high_priority_queue: self.high_priority.len(),
                scheduler: self.engine.request_count(),
            },
            mclock_clients: MclockClients {
                client_count: self.engine.client_count(),
                clients: self.describe_registry(),
            },
            mclock_queues: MclockQueues {
                queues: self.display_queues(),
            },
            high_priority_queue: self
                .high_priority
                .depths()
                .map(|(priority, queue_size)| PriorityBucketDepth {
                    priority,
                    queue_size,
                })
                .collect(),
        }
    }

    fn describe_registry(&self) -> String {
        use fmt::Write as _;
        let mut out = String::new();
        let default = self.registry.default_external_info();
        let _ = write!(
            out,
            "default_client: {{ res: {:.2}, wgt: {}, lim: {:.2} }}, external_clients: {}",
            default.reservation,
            default.weight,
            default.limit,
            self.registry.external_client_count()
        );
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{CapacitySettings, ClassQos, CutoffSelector};
    use weir_core::{SchedulerClass, VirtualClock};

    #[derive(Debug, PartialEq)]
    struct Op {
        id: u64,
        priority: u32,
        cost: i32,
        class: SchedulerClass,
        tenant: ClientProfileId,
    }

    impl Op {
        fn client(id: u64, priority: u32, cost: i32) -> Self {
            Self {
                id,
                priority,
                cost,
                class: SchedulerClass::Client,
                tenant: ClientProfileId(1),
            }
        }

        fn immediate(id: u64) -> Self {
            Self {
                id,
                priority: 0,
                cost: 1,
                class: SchedulerClass::Immediate,
                tenant: ClientProfileId::default(),
            }
        }

        fn recovery(id: u64, cost: i32) -> Self {
            Self {
                id,
                priority: 0,
                cost,
                class: SchedulerClass::BackgroundRecovery,
                tenant: ClientProfileId::default(),
            }
        }
    }

    impl WorkItemView for Op {
        fn priority(&self) -> u32 {
            self.priority
        }

        fn cost(&self) -> i32 {
            self.cost
        }

        fn scheduler_class(&self) -> SchedulerClass {
            self.class
        }

        fn client_profile_id(&self) -> ClientProfileId {
            self.tenant
        }
    }

    fn shard() -> ShardParams {
        ShardParams {
            whoami: 0,
            num_shards: 1,
            shard_id: 0,
            is_rotational: false,
        }
    }

    /// 1000 bytes/s per shard, 1 byte per IO.
    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            capacity: CapacitySettings {
                max_sequential_bandwidth_hdd: 1000,
                max_sequential_bandwidth_ssd: 1000,
                max_capacity_iops_hdd: 1000.0,
                max_capacity_iops_ssd: 1000.0,
            },
            anticipation_timeout_secs: 60.0,
            ..SchedulerConfig::default()
        }
    }

    fn scheduler(config: SchedulerConfig) -> (MclockScheduler<Op, VirtualClock>, VirtualClock) {
        let clock = VirtualClock::new();
        (
            MclockScheduler::with_clock(config, shard(), clock.clone()),
            clock,
        )
    }

    fn expect_item(sched: &mut MclockScheduler<Op, VirtualClock>) -> Op {
        match sched.dequeue() {
            DequeueResult::Item(item) => item,
            other => panic!("expected an item, got {other:?}"),
        }
    }

    #[test]
    #[should_panic(expected = "num_shards must be positive")]
    fn test_zero_shards_is_fatal() {
        let params = ShardParams {
            num_shards: 0,
            ..shard()
        };
        let _ = MclockScheduler::<Op, VirtualClock>::with_clock(
            SchedulerConfig::default(),
            params,
            VirtualClock::new(),
        );
    }

    #[test]
    fn test_immediate_bypasses_fair_share() {
        let (mut sched, _clock) = scheduler(test_config());
        sched.enqueue(Op::client(1, 100, 1));
        sched.enqueue(Op::immediate(2));

        assert_eq!(expect_item(&mut sched).id, 2);
        assert_eq!(expect_item(&mut sched).id, 1);
        assert_eq!(sched.dequeue(), DequeueResult::Empty);
    }

    #[test]
    fn test_cutoff_priority_bypasses_engine() {
        let config = SchedulerConfig {
            op_queue_cutoff: CutoffSelector::High,
            ..test_config()
        };
        let (mut sched, _clock) = scheduler(config);
        sched.enqueue(Op::client(1, 200, 1));

        assert_eq!(sched.client_count(), 0);
        assert_eq!(expect_item(&mut sched).id, 1);
        assert_eq!(sched.stats().enqueued_cutoff, 1);
        assert_eq!(sched.stats().dequeued_high, 1);
    }

    #[test]
    fn test_below_cutoff_goes_through_engine() {
        let (mut sched, _clock) = scheduler(test_config());
        sched.enqueue(Op::client(1, 100, 1));

        assert_eq!(sched.client_count(), 1);
        assert_eq!(expect_item(&mut sched).id, 1);
        assert_eq!(sched.stats().dequeued_fair, 1);
    }

    #[test]
    fn test_priority_dominance_over_backlog() {
        let (mut sched, _clock) = scheduler(test_config());
        for i in 0..10 {
            sched.enqueue(Op::client(i, 10, 50));
        }
        sched.enqueue(Op::client(100, 250, 1));
        sched.enqueue(Op::immediate(101));

        assert_eq!(expect_item(&mut sched).id, 101);
        assert_eq!(expect_item(&mut sched).id, 100);
        let next = expect_item(&mut sched);
        assert!(next.id < 10);
    }

    #[test]
    fn test_enqueue_front_diverts_fair_share_to_bucket_zero() {
        let (mut sched, _clock) = scheduler(test_config());
        sched.enqueue(Op::client(1, 10, 1));
        sched.enqueue_front(Op::client(2, 10, 1));

        assert_eq!(sched.stats().front_diverted, 1);
        // The front-enqueued item drains from the bypass before the engine.
        assert_eq!(expect_item(&mut sched).id, 2);
        assert_eq!(expect_item(&mut sched).id, 1);
    }

    #[test]
    fn test_scaled_cost_clamps_to_cost_per_io() {
        let mut config = test_config();
        // 4096 bytes per IO.
        config.capacity.max_sequential_bandwidth_ssd = 4096 * 1000;
        config.capacity.max_capacity_iops_ssd = 1000.0;
        let (sched, _clock) = scheduler(config);

        assert_eq!(sched.calc_scaled_cost(-5), 4096);
        assert_eq!(sched.calc_scaled_cost(0), 4096);
        assert_eq!(sched.calc_scaled_cost(1), 4096);
        assert_eq!(sched.calc_scaled_cost(8192), 8192);
    }

    #[test]
    fn test_limit_throttle_reports_wake_up() {
        let mut config = test_config();
        config.profile = Profile::Custom;
        config.qos.client = ClassQos {
            reservation_ratio: 0.0,
            weight: 1,
            limit_ratio: 0.1, // 100 bytes/s of the 1000-byte shard
        };
        let (mut sched, clock) = scheduler(config);

        for i in 0..10 {
            sched.enqueue(Op::client(i, 10, 100));
        }

        assert_eq!(expect_item(&mut sched).id, 0);
        match sched.dequeue() {
            DequeueResult::WaitUntil(t) => assert_eq!(t, 1.0),
            other => panic!("expected WaitUntil, got {other:?}"),
        }

        clock.set(1.0);
        assert_eq!(expect_item(&mut sched).id, 1);
    }

    #[test]
    fn test_profile_switch_rescales_registry() {
        let (mut sched, _clock) = scheduler(test_config()); // balanced
        let cap = sched.capacity().capacity_per_shard;

        let client = sched.qos_info(&SchedulerId::Client(ClientProfileId(1)));
        assert_eq!(client.reservation, 0.5 * cap);

        let mut new = sched.config.clone();
        new.profile = Profile::HighRecoveryOps;
        let delta = ConfigDelta::between(&sched.config, new);
        sched.apply_config_delta(delta);

        let recovery = sched.qos_info(&SchedulerId::BackgroundRecovery);
        let client = sched.qos_info(&SchedulerId::Client(ClientProfileId(1)));
        assert_eq!(recovery.reservation, 0.7 * cap);
        assert_eq!(recovery.weight, 2);
        assert_eq!(client.reservation, 0.3 * cap);
    }

    #[test]
    fn test_qos_edits_ignored_under_named_profile() {
        let (mut sched, _clock) = scheduler(test_config()); // balanced
        let cap = sched.capacity().capacity_per_shard;

        let mut new = sched.config.clone();
        new.qos.client.reservation_ratio = 0.9;
        let delta = ConfigDelta::between(&sched.config, new);
        sched.apply_config_delta(delta);

        let client = sched.qos_info(&SchedulerId::Client(ClientProfileId(1)));
        assert_eq!(client.reservation, 0.5 * cap);
    }

    #[test]
    fn test_qos_edits_apply_under_custom_profile() {
        let mut config = test_config();
        config.profile = Profile::Custom;
        config.qos.client.reservation_ratio = 0.2;
        let (mut sched, _clock) = scheduler(config);
        let cap = sched.capacity().capacity_per_shard;

        let mut new = sched.config.clone();
        new.qos.client.reservation_ratio = 0.9;
        let delta = ConfigDelta::between(&sched.config, new);
        sched.apply_config_delta(delta);

        let client = sched.qos_info(&SchedulerId::Client(ClientProfileId(1)));
        assert_eq!(client.reservation, 0.9 * cap);
    }

    #[test]
    fn test_capacity_change_rescales_reservations() {
        let (mut sched, _clock) = scheduler(test_config()); // balanced, cap 1000

        let mut new = sched.config.clone();
        new.capacity.max_sequential_bandwidth_ssd = 2000;
        let delta = ConfigDelta::between(&sched.config, new);
        sched.apply_config_delta(delta);

        assert_eq!(sched.capacity().capacity_per_shard, 2000.0);
        let client = sched.qos_info(&SchedulerId::Client(ClientProfileId(1)));
        assert_eq!(client.reservation, 1000.0);
    }

    #[test]
    fn test_repeated_profile_application_is_idempotent() {
        let (mut sched, _clock) = scheduler(test_config());
        let before = sched.qos_info(&SchedulerId::BackgroundRecovery);

        let delta = ConfigDelta {
            config: sched.config.clone(),
            changed: [ConfigKey::Profile].into_iter().collect(),
        };
        sched.apply_config_delta(delta.clone());
        sched.apply_config_delta(delta);

        assert_eq!(sched.qos_info(&SchedulerId::BackgroundRecovery), before);
    }

    #[test]
    fn test_dump_sections() {
        let (mut sched, _clock) = scheduler(test_config());
        sched.enqueue(Op::immediate(1));
        sched.enqueue(Op::client(2, 200, 1));
        sched.enqueue(Op::client(3, 10, 1));
        sched.enqueue(Op::recovery(4, 64));

        let dump = sched.dump();
        assert_eq!(dump.queue_sizes.high_priority_queue, 2);
        assert_eq!(dump.queue_sizes.scheduler, 2);
        assert_eq!(dump.mclock_clients.client_count, 2);
        assert!(!dump.mclock_queues.queues.is_empty());
        // descending priority order
        assert_eq!(dump.high_priority_queue[0].priority, u32::MAX);
        assert_eq!(dump.high_priority_queue[1].priority, 200);

        let rendered = serde_json::to_value(&dump).unwrap();
        assert!(rendered.get("queue_sizes").is_some());
        assert!(rendered.get("mClockClients").is_some());
        assert!(rendered.get("mClockQueues").is_some());
        assert!(rendered.get("HighPriorityQueue").is_some());
    }

    #[test]
    fn test_len_spans_both_queues() {
        let (mut sched, _clock) = scheduler(test_config());
        assert!(sched.is_empty());
        sched.enqueue(Op::immediate(1));
        sched.enqueue(Op::client(2, 10, 1));
        assert_eq!(sched.len(), 2);
        let _ = sched.dequeue();
        assert_eq!(sched.len(), 1);
    }
}
