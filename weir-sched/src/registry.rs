//! Per-class and per-tenant QoS parameters.
//!
//! The registry owns one [`ClientInfo`] per internal class plus a sparse,
//! bounded per-tenant table for the client class. Ratios from configuration
//! are materialized into absolute rates against the shard's capacity; a zero
//! ratio resolves to the floor (no minimum) or sentinel (no ceiling) rate.

use std::collections::HashMap;
use std::fmt;

use weir_core::{ClientProfileId, SchedulerClass, WorkItemView};

use crate::config::{ClassQos, QosSettings};

/// Key under which the tag engine tracks per-client state.
///
/// Only fair-share classes are representable; immediate work is routed
/// around the tag engine before a `SchedulerId` ever exists, so "schedule an
/// immediate item" is not expressible here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SchedulerId {
    Client(ClientProfileId),
    BackgroundRecovery,
    BackgroundBestEffort,
}

impl SchedulerId {
    /// The fair-share identity of an item, or `None` for immediate work.
    #[must_use]
    pub fn for_item<T: WorkItemView>(item: &T) -> Option<Self> {
        match item.scheduler_class() {
            SchedulerClass::Immediate => None,
            SchedulerClass::Client => Some(SchedulerId::Client(item.client_profile_id())),
            SchedulerClass::BackgroundRecovery => Some(SchedulerId::BackgroundRecovery),
            SchedulerClass::BackgroundBestEffort => Some(SchedulerId::BackgroundBestEffort),
        }
    }
}

impl fmt::Display for SchedulerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerId::Client(profile) => write!(f, "client:{profile}"),
            SchedulerId::BackgroundRecovery => write!(f, "background_recovery"),
            SchedulerId::BackgroundBestEffort => write!(f, "background_best_effort"),
        }
    }
}

/// Reservation, weight, and limit for one scheduling identity.
///
/// `reservation` and `limit` are in bytes/s; `weight` is unitless.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientInfo {
    pub reservation: f64,
    pub weight: u64,
    pub limit: f64,
}

impl ClientInfo {
    /// Floor rate standing in for "no reservation". Strictly positive so tag
    /// arithmetic never divides by zero; small enough that a floored client
    /// is never selected on reservation.
    pub const MIN_RATE: f64 = 1e-6;

    /// Sentinel rate standing in for "no limit". Infinite, so the limit
    /// charge of an uncapped client is exactly zero.
    pub const MAX_RATE: f64 = f64::INFINITY;

    /// Materialize absolute rates from capacity ratios.
    #[must_use]
    pub fn from_ratios(qos: &ClassQos, capacity_per_shard: f64) -> Self {
        let reservation = if qos.reservation_ratio > 0.0 {
            (qos.reservation_ratio * capacity_per_shard).clamp(Self::MIN_RATE, Self::MAX_RATE)
        } else {
            Self::MIN_RATE
        };
        let limit = if qos.limit_ratio > 0.0 {
            (qos.limit_ratio * capacity_per_shard).clamp(Self::MIN_RATE, Self::MAX_RATE)
        } else {
            Self::MAX_RATE
        };
        Self {
            reservation,
            weight: qos.weight.max(1),
            limit,
        }
    }

    fn unconstrained() -> Self {
        Self {
            reservation: Self::MIN_RATE,
            weight: 1,
            limit: Self::MAX_RATE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ExternalSlot {
    info: ClientInfo,
    last_seen: u64,
}

/// QoS parameter table for one shard.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRegistry {
    background_recovery: ClientInfo,
    background_best_effort: ClientInfo,
    default_external: ClientInfo,
    external: HashMap<ClientProfileId, ExternalSlot>,
    max_external: usize,
    access_seq: u64,
}

impl ClientRegistry {
    #[must_use]
    pub fn new(max_external: usize) -> Self {
        Self {
            background_recovery: ClientInfo::unconstrained(),
            background_best_effort: ClientInfo::unconstrained(),
            default_external: ClientInfo::unconstrained(),
            external: HashMap::new(),
            max_external: max_external.max(1),
            access_seq: 0,
        }
    }

    /// Recompute the internal-class entries and the default external entry
    /// from an effective QoS table. Idempotent: identical inputs leave the
    /// registry in identical state.
    ///
    /// Host-installed per-tenant overrides are absolute rates and are left
    /// untouched.
    pub fn update_from_config(&mut self, table: &QosSettings, capacity_per_shard: f64) {
        self.default_external = ClientInfo::from_ratios(&table.client, capacity_per_shard);
        self.background_recovery =
            ClientInfo::from_ratios(&table.background_recovery, capacity_per_shard);
        self.background_best_effort =
            ClientInfo::from_ratios(&table.background_best_effort, capacity_per_shard);
    }

    /// The QoS parameters governing `id`. Total over all representable ids.
    pub fn get_info(&mut self, id: &SchedulerId) -> ClientInfo {
        match id {
            SchedulerId::Client(profile) => self.get_external_client(*profile),
            SchedulerId::BackgroundRecovery => self.background_recovery,
            SchedulerId::BackgroundBestEffort => self.background_best_effort,
        }
    }

    /// Per-tenant entry, falling back to the default external entry on miss.
    /// A hit refreshes the tenant's eviction recency.
    pub fn get_external_client(&mut self, profile: ClientProfileId) -> ClientInfo {
        self.access_seq += 1;
        let seq = self.access_seq;
        match self.external.get_mut(&profile) {
            Some(slot) => {
                slot.last_seen = seq;
                slot.info
            }
            None => self.default_external,
        }
    }

    /// Install explicit QoS parameters for one tenant. When the table is at
    /// its bound, the least-recently-seen tenant is evicted first.
    pub fn set_external_client(&mut self, profile: ClientProfileId, info: ClientInfo) {
        self.access_seq += 1;
        let seq = self.access_seq;
        if !self.external.contains_key(&profile) && self.external.len() >= self.max_external {
            if let Some(oldest) = self
                .external
                .iter()
                .min_by_key(|(_, slot)| slot.last_seen)
                .map(|(id, _)| *id)
            {
                self.external.remove(&oldest);
            }
        }
        self.external
            .insert(profile, ExternalSlot { info, last_seen: seq });
    }

    /// Drop a tenant's explicit entry; subsequent lookups fall back to the
    /// default external entry.
    pub fn remove_external_client(&mut self, profile: ClientProfileId) -> bool {
        self.external.remove(&profile).is_some()
    }

    #[must_use]
    pub fn external_client_count(&self) -> usize {
        self.external.len()
    }

    #[must_use]
    pub fn default_external_info(&self) -> ClientInfo {
        self.default_external
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::QosSettings;
    use crate::profile::Profile;

    const CAP: f64 = 1000.0;

    fn balanced_registry() -> ClientRegistry {
        let mut registry = ClientRegistry::new(4);
        let table = Profile::Balanced.materialize(&QosSettings::default());
        registry.update_from_config(&table, CAP);
        registry
    }

    #[test]
    fn test_ratios_scale_against_capacity() {
        let mut registry = balanced_registry();
        let client = registry.get_info(&SchedulerId::Client(ClientProfileId(1)));
        assert_eq!(client.reservation, 500.0);
        assert_eq!(client.weight, 1);
        assert_eq!(client.limit, ClientInfo::MAX_RATE);

        let best_effort = registry.get_info(&SchedulerId::BackgroundBestEffort);
        assert_eq!(best_effort.reservation, ClientInfo::MIN_RATE);
        assert_eq!(best_effort.limit, 900.0);
    }

    #[test]
    fn test_invariants_after_update() {
        let mut registry = balanced_registry();
        for id in [
            SchedulerId::Client(ClientProfileId(9)),
            SchedulerId::BackgroundRecovery,
            SchedulerId::BackgroundBestEffort,
        ] {
            let info = registry.get_info(&id);
            assert!(info.reservation >= ClientInfo::MIN_RATE);
            assert!(info.reservation <= ClientInfo::MAX_RATE);
            assert!(info.limit >= ClientInfo::MIN_RATE);
            assert!(info.limit <= ClientInfo::MAX_RATE);
            assert!(info.weight >= 1);
        }
    }

    #[test]
    fn test_zero_weight_clamps_to_one() {
        let qos = ClassQos {
            reservation_ratio: 0.5,
            weight: 0,
            limit_ratio: 0.0,
        };
        let info = ClientInfo::from_ratios(&qos, CAP);
        assert_eq!(info.weight, 1);
    }

    #[test]
    fn test_update_is_idempotent() {
        let mut a = balanced_registry();
        let b = balanced_registry();
        let table = Profile::Balanced.materialize(&QosSettings::default());
        a.update_from_config(&table, CAP);
        assert_eq!(a, b);
    }

    #[test]
    fn test_unknown_tenant_falls_back_to_default() {
        let mut registry = balanced_registry();
        let seen = registry.get_external_client(ClientProfileId(42));
        assert_eq!(seen, registry.default_external_info());
        assert_eq!(registry.external_client_count(), 0);
    }

    #[test]
    fn test_tenant_override_and_removal() {
        let mut registry = balanced_registry();
        let gold = ClientInfo {
            reservation: 800.0,
            weight: 2,
            limit: ClientInfo::MAX_RATE,
        };
        registry.set_external_client(ClientProfileId(7), gold);
        assert_eq!(registry.get_external_client(ClientProfileId(7)), gold);

        assert!(registry.remove_external_client(ClientProfileId(7)));
        assert_eq!(
            registry.get_external_client(ClientProfileId(7)),
            registry.default_external_info()
        );
        assert!(!registry.remove_external_client(ClientProfileId(7)));
    }

    #[test]
    fn test_lru_eviction_at_bound() {
        let mut registry = balanced_registry(); // bound of 4
        let info = ClientInfo {
            reservation: 100.0,
            weight: 1,
            limit: ClientInfo::MAX_RATE,
        };
        for tenant in 0..4 {
            registry.set_external_client(ClientProfileId(tenant), info);
        }
        // Touch tenant 0 so tenant 1 becomes the eviction candidate.
        registry.get_external_client(ClientProfileId(0));
        registry.set_external_client(ClientProfileId(99), info);

        assert_eq!(registry.external_client_count(), 4);
        assert_eq!(registry.get_external_client(ClientProfileId(0)), info);
        assert_eq!(
            registry.get_external_client(ClientProfileId(1)),
            registry.default_external_info()
        );
    }

    #[test]
    fn test_scheduler_id_ordering_is_stable() {
        let a = SchedulerId::Client(ClientProfileId(1));
        let b = SchedulerId::Client(ClientProfileId(2));
        assert!(a < b);
        assert!(b < SchedulerId::BackgroundRecovery);
        assert!(SchedulerId::BackgroundRecovery < SchedulerId::BackgroundBestEffort);
    }
}
