// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single-slot reservoirs and the stratified reservoir that maps trace
//! signatures to them.
//!
//! Each stratum keeps at most one candidate trace: the one with the highest
//! trace ID seen since the last flush. Trace IDs are uniformly distributed,
//! so keeping the maximum selects uniformly at random without a random
//! source and without state across restarts.
//!
//! Admission is bounded: the aggregate byte estimate of all reservoirs is
//! capped, and once the cap is reached every new signature spills into the
//! overflow stratum (`Signature(0)`).

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::warn;

use super::signature::Signature;
use crate::model::ProcessedTrace;

/// Default admission cap on the aggregate reservoir byte estimate.
pub const DEFAULT_MEMORY_LIMIT: u64 = 100 * 1024 * 1024;

/// Called with every trace the sampler decides not to keep.
pub type DropCallback = Box<dyn Fn(ProcessedTrace) + Send + Sync>;

/// A single-slot reservoir for one stratum.
pub struct Reservoir {
    slot: Mutex<Option<ProcessedTrace>>,
    trace_count: AtomicU64,
    size: AtomicU64,
    // End timestamp (epoch ns) of the held trace, 0 when none was ever held.
    latest_end_ns: AtomicI64,
}

impl Reservoir {
    fn with_size(size: u64) -> Self {
        Reservoir {
            slot: Mutex::new(None),
            trace_count: AtomicU64::new(0),
            size: AtomicU64::new(size),
            latest_end_ns: AtomicI64::new(0),
        }
    }

    /// Offers a trace to the reservoir. Returns the displaced candidate, or
    /// the offered trace itself when the held candidate wins.
    pub fn add(&self, trace: ProcessedTrace) -> Option<ProcessedTrace> {
        self.trace_count.fetch_add(1, Ordering::Relaxed);
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            None => {
                self.latest_end_ns.store(trace.end_ns(), Ordering::Relaxed);
                *slot = Some(trace);
                None
            }
            Some(held) if held.trace_id() < trace.trace_id() => {
                self.latest_end_ns.store(trace.end_ns(), Ordering::Relaxed);
                slot.replace(trace)
            }
            Some(_) => Some(trace),
        }
    }

    /// Takes the held candidate and the number of traces seen.
    pub fn take(&self) -> (Option<ProcessedTrace>, u64) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        (slot.take(), self.trace_count.load(Ordering::Relaxed))
    }

    pub fn seen(&self) -> u64 {
        self.trace_count.load(Ordering::Relaxed)
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }
}

/// Signature-partitioned reservoirs under a shared byte budget.
pub struct StratifiedReservoir {
    reservoirs: RwLock<HashMap<Signature, Arc<Reservoir>>>,
    size: AtomicU64,
    limit: u64,
    shrunk: AtomicBool,
    limit_logged: Once,
    new_sig_tx: mpsc::Sender<Signature>,
    on_drop: DropCallback,
}

impl StratifiedReservoir {
    /// `new_sig_tx` feeds the flush scheduler with newly created signatures;
    /// `on_drop` receives every trace that loses its slot.
    pub fn new(limit: u64, new_sig_tx: mpsc::Sender<Signature>, on_drop: DropCallback) -> Self {
        StratifiedReservoir {
            reservoirs: RwLock::new(HashMap::with_capacity(2)),
            size: AtomicU64::new(0),
            limit,
            shrunk: AtomicBool::new(false),
            limit_logged: Once::new(),
            new_sig_tx,
            on_drop,
        }
    }

    /// Admits a trace into the reservoir for `sig`, creating it on first
    /// sight. When the byte budget is exhausted (or after [`shrink`]), new
    /// arrivals divert to the overflow stratum instead.
    ///
    /// [`shrink`]: StratifiedReservoir::shrink
    pub fn add(&self, sig: Signature, trace: ProcessedTrace) {
        let sig = if self.shrunk.load(Ordering::Relaxed) {
            Signature(0)
        } else {
            sig
        };

        let existing = self
            .read_map()
            .get(&sig)
            .cloned();

        let reservoir = match existing {
            Some(reservoir) => reservoir,
            None => {
                if sig != Signature(0) && self.is_full() {
                    self.limit_logged.call_once(|| {
                        warn!(
                            limit = self.limit,
                            "reservoir byte limit reached, diverting new signatures to the overflow stratum"
                        );
                    });
                    return self.add(Signature(0), trace);
                }
                self.create_reservoir(sig, &trace)
            }
        };

        if let Some(dropped) = reservoir.add(trace) {
            (self.on_drop)(dropped);
        }
    }

    fn create_reservoir(&self, sig: Signature, trace: &ProcessedTrace) -> Arc<Reservoir> {
        let trace_size = trace_approximate_size(trace);
        let mut created = false;
        let reservoir = {
            let mut map = self.write_map();
            match map.entry(sig) {
                Entry::Occupied(e) => e.get().clone(),
                Entry::Vacant(v) => {
                    created = true;
                    v.insert(Arc::new(Reservoir::with_size(trace_size))).clone()
                }
            }
        };
        if created {
            self.size.fetch_add(trace_size, Ordering::Relaxed);
            if self.new_sig_tx.try_send(sig).is_err() {
                // The scheduler will only learn about this stratum if a later
                // notification for it gets through; meanwhile it still admits.
                warn!(signature = %sig, "new-signature queue full, flush scheduling delayed");
            }
        }
        reservoir
    }

    /// Snapshots and resets the reservoir for `sig`. Returns `None` when the
    /// stratum is unknown or has seen no traces since the last flush.
    pub fn drain_and_reset(&self, sig: Signature) -> Option<Arc<Reservoir>> {
        let reservoir = self.read_map().get(&sig).cloned()?;
        if reservoir.seen() == 0 {
            return None;
        }
        let fresh = Arc::new(Reservoir::with_size(reservoir.size()));
        self.write_map().insert(sig, fresh);
        Some(reservoir)
    }

    /// Deletes the reservoir for `sig`, releasing its byte estimate.
    pub fn remove(&self, sig: Signature) {
        let removed = self.write_map().remove(&sig);
        if let Some(reservoir) = removed {
            self.size.fetch_sub(reservoir.size(), Ordering::Relaxed);
        }
    }

    /// Routes all subsequent arrivals to the overflow stratum. Set-only:
    /// pressure never un-shrinks a reservoir.
    pub fn shrink(&self) {
        self.shrunk.store(true, Ordering::Relaxed);
    }

    pub fn is_full(&self) -> bool {
        self.size.load(Ordering::Relaxed) >= self.limit
    }

    /// Aggregate byte estimate of all current reservoirs.
    pub fn memory_size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Number of strata currently held.
    pub fn signature_cardinality(&self) -> usize {
        self.read_map().len()
    }

    /// End timestamp of the oldest trace currently held in any stratum, or
    /// `default_ns` when nothing is held.
    pub fn oldest_trace_end_ns(&self, default_ns: i64) -> i64 {
        self.read_map()
            .values()
            .filter_map(|r| {
                let end = r.latest_end_ns.load(Ordering::Relaxed);
                (end != 0).then_some(end)
            })
            .min()
            .unwrap_or(default_ns)
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Signature, Arc<Reservoir>>> {
        self.reservoirs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_map(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Signature, Arc<Reservoir>>> {
        self.reservoirs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cheap, monotonic byte estimate of a processed trace, used only for
/// admission control. The constant 44 accounts for the fixed-width span
/// fields.
pub fn trace_approximate_size(trace: &ProcessedTrace) -> u64 {
    let mut size = trace.env.len();
    for span in &trace.trace {
        size += 44;
        size += span.service.len() + span.name.len() + span.resource.len();
        for (k, v) in &span.meta {
            size += k.len() + v.len();
        }
        for k in span.metrics.keys() {
            size += k.len() + 8;
        }
        if let Some(values) = trace.sublayers.get(&span.span_id) {
            for value in values {
                let tag_len = value.tag.as_ref().map(|t| t.to_string().len()).unwrap_or(0);
                size += 8 + tag_len + value.metric.len();
            }
        }
    }
    size as u64
}
