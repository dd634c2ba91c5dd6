//! dmClock tag engine.
//!
//! Each admitted request carries three virtual-time tags: reservation,
//! proportion, and limit. Selection runs in two phases: reservation first
//! (smallest reservation tag at or before now), then proportion (smallest
//! proportion tag among clients not held by their limit). A client whose
//! next request would exceed its limit waits; it is never downgraded or
//! rejected.
//!
//! A request's reservation and limit tags are `max(prev, now) + cost/rate`:
//! the client's previous tag is clamped forward to now, then the request's
//! own charge goes on top, so an idle gap never banks credit and every
//! admission pays in full. A client's first request is tagged at `now` on
//! both axes and is eligible immediately. Proportion tags have no time axis:
//! they accumulate `cost * W_REF / weight` per request on top of an
//! engine-wide floor, so only their relative order matters.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Write as _};

use weir_core::{SchedulerClock, Tick};

use crate::registry::{ClientInfo, SchedulerId};

/// Reference weight of the proportional axis. With `W_REF = 1`, a client of
/// weight `w` advances its proportion tag by `cost / w`, mirroring the
/// reservation formula with the weight standing in for a rate.
pub(crate) const W_REF: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
struct RequestTag {
    reservation: Tick,
    proportion: Tick,
    limit: Tick,
}

#[derive(Debug)]
struct TaggedRequest<T> {
    item: T,
    tag: RequestTag,
    cost: u32,
    seq: u64,
}

#[derive(Debug)]
struct ClientQueue<T> {
    /// Tag of the most recently admitted request; `None` until the first
    /// admission after creation.
    prev: Option<RequestTag>,
    queue: VecDeque<TaggedRequest<T>>,
    /// Set when the queue drains; cleared on the next admission.
    idle_since: Option<Tick>,
}

impl<T> ClientQueue<T> {
    fn fresh() -> Self {
        Self {
            prev: None,
            queue: VecDeque::new(),
            idle_since: None,
        }
    }
}

/// Which phase selected a pulled request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPhase {
    Reservation,
    Proportion,
}

/// Outcome of one pull.
#[derive(Debug, PartialEq)]
pub enum Pull<T> {
    /// A request was selected and removed.
    Item {
        item: T,
        client: SchedulerId,
        cost: u32,
        phase: SelectionPhase,
    },
    /// Requests are pending but none is eligible before `wake_at`.
    Future { wake_at: Tick },
    /// No requests are pending.
    Empty,
}

pub struct MclockEngine<T, C> {
    clock: C,
    /// Seconds a drained client's tag state survives before being reaped.
    anticipation_timeout: f64,
    clients: BTreeMap<SchedulerId, ClientQueue<T>>,
    requests: usize,
    admit_seq: u64,
    /// Proportion tag of the most recent proportional selection. New clients
    /// start from here so they compete with incumbents instead of replaying
    /// virtual time from zero.
    virtual_p: Tick,
}

impl<T, C: SchedulerClock> MclockEngine<T, C> {
    pub fn new(clock: C, anticipation_timeout: f64) -> Self {
        Self {
            clock,
            anticipation_timeout: anticipation_timeout.max(0.0),
            clients: BTreeMap::new(),
            requests: 0,
            admit_seq: 0,
            virtual_p: 0.0,
        }
    }

    /// Admit one request for `id`, charged `cost` against `info`'s rates.
    /// `cost` must already be scaled and non-zero.
    pub fn add_request(&mut self, item: T, id: SchedulerId, cost: u32, info: ClientInfo) {
        let now = self.clock.now();
        self.reap_idle(now);

        let p_floor = self.virtual_p;
        let seq = self.admit_seq;
        self.admit_seq += 1;

        let entry = self.clients.entry(id).or_insert_with(ClientQueue::fresh);
        entry.idle_since = None;

        let cost_f = f64::from(cost.max(1));
        #[allow(clippy::cast_precision_loss)]
        let weight = info.weight.max(1) as f64;
        let tag = match entry.prev {
            Some(prev) => RequestTag {
                reservation: prev.reservation.max(now) + cost_f / info.reservation,
                proportion: prev.proportion + cost_f * W_REF / weight,
                limit: prev.limit.max(now) + cost_f / info.limit,
            },
            None => RequestTag {
                reservation: now,
                proportion: p_floor + cost_f * W_REF / weight,
                limit: now,
            },
        };
        entry.prev = Some(tag);
        entry.queue.push_back(TaggedRequest {
            item,
            tag,
            cost,
            seq,
        });
        self.requests += 1;
    }

    /// Select the next request, or report when one will become eligible.
    pub fn pull_request(&mut self) -> Pull<T> {
        let now = self.clock.now();
        self.reap_idle(now);

        // Phase R: earliest eligible reservation tag, ties by admission order.
        let mut reservation: Option<(SchedulerId, Tick, u64)> = None;
        for (id, client) in &self.clients {
            let Some(head) = client.queue.front() else {
                continue;
            };
            if head.tag.reservation <= now {
                let candidate = (head.tag.reservation, head.seq);
                if reservation.is_none_or(|(_, r, s)| candidate < (r, s)) {
                    reservation = Some((*id, head.tag.reservation, head.seq));
                }
            }
        }
        if let Some((id, _, _)) = reservation {
            return self.emit(id, now, SelectionPhase::Reservation);
        }

        // Phase P: smallest proportion tag among clients not held by their
        // limit. Strict `<` keeps ties on the lowest SchedulerId.
        let mut proportion: Option<(SchedulerId, Tick)> = None;
        for (id, client) in &self.clients {
            let Some(head) = client.queue.front() else {
                continue;
            };
            if head.tag.limit <= now && proportion.is_none_or(|(_, p)| head.tag.proportion < p) {
                proportion = Some((*id, head.tag.proportion));
            }
        }
        if let Some((id, p)) = proportion {
            self.virtual_p = self.virtual_p.max(p);
            return self.emit(id, now, SelectionPhase::Proportion);
        }

        // Every head is throttled. A head becomes servable at its
        // reservation tag (phase R) or its limit tag (phase P), whichever
        // comes first.
        let mut wake_at: Option<Tick> = None;
        for client in self.clients.values() {
            if let Some(head) = client.queue.front() {
                let t = head.tag.reservation.min(head.tag.limit);
                wake_at = Some(wake_at.map_or(t, |w| w.min(t)));
            }
        }
        match wake_at {
            Some(wake_at) => Pull::Future { wake_at },
            None => Pull::Empty,
        }
    }

    fn emit(&mut self, id: SchedulerId, now: Tick, phase: SelectionPhase) -> Pull<T> {
        let Some(client) = self.clients.get_mut(&id) else {
            return Pull::Empty;
        };
        let Some(request) = client.queue.pop_front() else {
            return Pull::Empty;
        };
        self.requests -= 1;
        if client.queue.is_empty() {
            client.idle_since = Some(now);
        }
        Pull::Item {
            item: request.item,
            client: id,
            cost: request.cost,
            phase,
        }
    }

    /// Discard tag state of clients that have been idle past the
    /// anticipation window.
    fn reap_idle(&mut self, now: Tick) {
        let timeout = self.anticipation_timeout;
        self.clients.retain(|_, client| {
            let expired = client.queue.is_empty()
                && client
                    .idle_since
                    .is_some_and(|idle_at| now - idle_at >= timeout);
            !expired
        });
    }

    /// Current reading of the engine's clock.
    #[must_use]
    pub fn clock_now(&self) -> Tick {
        self.clock.now()
    }

    /// Tracked clients, including drained ones inside their anticipation
    /// window.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests == 0
    }

    /// Human-readable queue snapshot. No stable format.
    pub fn display_queues(&self, out: &mut impl fmt::Write) -> fmt::Result {
        for (id, client) in &self.clients {
            write!(out, "{{ client: {id}, depth: {}", client.queue.len())?;
            if let Some(head) = client.queue.front() {
                write!(
                    out,
                    ", head: [r: {:.3}, p: {:.3}, l: {:.3}, cost: {}]",
                    head.tag.reservation, head.tag.proportion, head.tag.limit, head.cost
                )?;
            }
            writeln!(out, " }}")?;
        }
        Ok(())
    }

    /// Convenience for log lines and dumps.
    #[must_use]
    pub fn display_queues_string(&self) -> String {
        let mut out = String::new();
        // Infallible for String targets.
        let _ = self.display_queues(&mut out);
        out
    }
}
