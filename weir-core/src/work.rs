//! Work-item attributes the scheduler is allowed to observe.
//!
//! The scheduler treats queued payloads as opaque. Producers expose exactly
//! three things through [`WorkItemView`]: a message-level priority, a declared
//! cost in bytes, and a quality-of-service class.

use std::fmt;

/// Quality-of-service class of a work item.
///
/// Determines which reservation/weight/limit triple governs the item.
/// `Immediate` work bypasses fair-share arbitration entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SchedulerClass {
    /// Latency-sensitive operations dispatched ahead of everything else.
    Immediate,
    /// Foreground client requests, keyed by tenant.
    Client,
    /// Background recovery traffic.
    BackgroundRecovery,
    /// Background best-effort work (scrub, trim, deferred cleanup).
    BackgroundBestEffort,
}

impl fmt::Display for SchedulerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerClass::Immediate => write!(f, "immediate"),
            SchedulerClass::Client => write!(f, "client"),
            SchedulerClass::BackgroundRecovery => write!(f, "background_recovery"),
            SchedulerClass::BackgroundBestEffort => write!(f, "background_best_effort"),
        }
    }
}

/// Identifies an external tenant within the client class.
///
/// Ignored for every other class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ClientProfileId(pub u64);

impl fmt::Display for ClientProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The scheduler-facing view of a queued work item.
///
/// Cost is a caller-declared size in bytes and may be any `i32`; the
/// scheduler clamps it on admission. `client_profile_id` only matters when
/// the class is [`SchedulerClass::Client`].
pub trait WorkItemView {
    fn priority(&self) -> u32;
    fn cost(&self) -> i32;
    fn scheduler_class(&self) -> SchedulerClass;

    fn client_profile_id(&self) -> ClientProfileId {
        ClientProfileId::default()
    }
}
