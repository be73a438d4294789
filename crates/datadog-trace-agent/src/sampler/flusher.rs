// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Flush scheduling: paced, fair emission out of the stratified reservoir.
//!
//! The scheduler keeps one bucket per stratum in least-recently-flushed-first
//! order and emits at most one trace per flush tick. A non-empty drain moves
//! its bucket to the back of the queue, which yields round-robin fairness
//! across strata; a stratum that stays empty past `max_no_flush_interval` is
//! evicted together with its reservoir.
//!
//! On top of the steady tick, a small ticket pool allows the pipeline to pull
//! flushes forward when traces have been sitting for too long, without
//! exceeding the configured overall rate: tickets replenish at a fixed rate
//! and an unused ticket is refunded.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::reservoir::StratifiedReservoir;
use super::signature::Signature;
use crate::model::{span, ProcessedTrace};

/// Root meta key flagging traces emitted from the overflow stratum.
pub const KEY_RES_LIMIT: &str = "res.limit";
/// Root metric keys describing the reservoir the trace came from.
pub const KEY_RES_SLOTS: &str = "res.slots";
pub const KEY_RES_SEEN: &str = "res.seen";
pub const KEY_RES_RATE: &str = "res.rate";

/// Called with every trace the scheduler emits.
pub type FlushCallback = Box<dyn Fn(ProcessedTrace) + Send + Sync>;

/// Scheduler record for one stratum.
struct FlushBucket {
    signature: Signature,
    last_successful_flush: Instant,
}

/// The flush scheduler. Owns the bucket queue; runs on its own task.
pub struct Flusher {
    target_fps: f64,
    max_no_flush_interval: Duration,
    ticket_capacity: usize,
    tickets: Arc<Semaphore>,
    ticket_rx: mpsc::Receiver<()>,
    new_sig_rx: mpsc::Receiver<Signature>,
    buckets: VecDeque<FlushBucket>,
    reservoir: Arc<StratifiedReservoir>,
    on_flush: FlushCallback,
}

/// Cheaply cloneable handle used to request out-of-band ticket flushes.
#[derive(Clone)]
pub struct FlusherHandle {
    tickets: Arc<Semaphore>,
    ticket_tx: mpsc::Sender<()>,
}

impl FlusherHandle {
    /// Consumes a ticket and asks the scheduler for an immediate flush
    /// attempt. Returns false when no ticket is available.
    pub fn ticket_flush(&self) -> bool {
        match self.tickets.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.ticket_tx.try_send(()).is_ok()
            }
            Err(_) => false,
        }
    }
}

impl Flusher {
    pub fn new(
        target_fps: f64,
        max_no_flush_interval: Duration,
        num_tickets: usize,
        reservoir: Arc<StratifiedReservoir>,
        new_sig_rx: mpsc::Receiver<Signature>,
        on_flush: FlushCallback,
    ) -> (Self, FlusherHandle) {
        let ticket_capacity = num_tickets.max(1);
        let tickets = Arc::new(Semaphore::new(ticket_capacity));
        let (ticket_tx, ticket_rx) = mpsc::channel(ticket_capacity);

        let handle = FlusherHandle {
            tickets: tickets.clone(),
            ticket_tx,
        };
        let flusher = Flusher {
            target_fps,
            max_no_flush_interval,
            ticket_capacity,
            tickets,
            ticket_rx,
            new_sig_rx,
            buckets: VecDeque::new(),
            reservoir,
            on_flush,
        };
        (flusher, handle)
    }

    /// Ticker loop. Exits when `shutdown` is cancelled; any in-flight flush
    /// attempt completes first.
    pub async fn run(mut self, shutdown: CancellationToken) {
        if self.target_fps <= 0.0 {
            warn!(target_fps = self.target_fps, "flush scheduler disabled");
            shutdown.cancelled().await;
            return;
        }

        let mut flush_ticker = interval(Duration::from_secs_f64(1.0 / self.target_fps));
        flush_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticket_ticker =
            interval(Duration::from_secs_f64(1.0 / self.ticket_capacity as f64));
        ticket_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("flush scheduler exiting");
                    return;
                }
                _ = flush_ticker.tick() => {
                    self.flush_once();
                }
                _ = ticket_ticker.tick() => {
                    self.refund_ticket();
                }
                Some(()) = self.ticket_rx.recv() => {
                    if self.flush_once().is_none() {
                        // Nothing was ready; the ticket was not spent.
                        self.refund_ticket();
                    }
                }
                Some(sig) = self.new_sig_rx.recv() => {
                    self.handle_new_signature(sig);
                }
            }
        }
    }

    fn refund_ticket(&self) {
        if self.tickets.available_permits() < self.ticket_capacity {
            self.tickets.add_permits(1);
        }
    }

    fn handle_new_signature(&mut self, signature: Signature) {
        if self.buckets.iter().any(|b| b.signature == signature) {
            return;
        }
        self.buckets.push_back(FlushBucket {
            signature,
            last_successful_flush: Instant::now(),
        });
    }

    /// Walks buckets least-recently-flushed first and emits the first
    /// non-empty drain, splicing its bucket to the back. Dormant buckets
    /// encountered on the way are evicted. At most one trace is emitted.
    fn flush_once(&mut self) -> Option<Signature> {
        let mut i = 0;
        while i < self.buckets.len() {
            let signature = self.buckets[i].signature;
            match self.reservoir.drain_and_reset(signature) {
                None => {
                    if self.buckets[i].last_successful_flush.elapsed() > self.max_no_flush_interval
                    {
                        debug!(signature = %signature, "evicting dormant stratum");
                        self.reservoir.remove(signature);
                        let _ = self.buckets.remove(i);
                        continue;
                    }
                    i += 1;
                }
                Some(drained) => {
                    let (slot, seen) = drained.take();
                    let Some(mut trace) = slot else {
                        // A concurrent add bumped the counter before
                        // installing its trace; treat as empty this round.
                        i += 1;
                        continue;
                    };

                    if let Some(mut bucket) = self.buckets.remove(i) {
                        bucket.last_successful_flush = Instant::now();
                        self.buckets.push_back(bucket);
                    }

                    annotate_flushed_trace(&mut trace, signature, seen);
                    (self.on_flush)(trace);
                    return Some(signature);
                }
            }
        }
        None
    }
}

/// Stamps reservoir statistics onto the emitted trace's root span.
fn annotate_flushed_trace(trace: &mut ProcessedTrace, signature: Signature, seen: u64) {
    let num_slots: u64 = 1;
    let seen = seen.max(1);
    let root = trace.root_span_mut();
    root.meta.insert(
        KEY_RES_LIMIT.to_string(),
        (signature == Signature(0)).to_string(),
    );
    span::set_metric(root, KEY_RES_SLOTS, num_slots as f64);
    span::set_metric(root, KEY_RES_SEEN, seen as f64);
    // Integer division kept on purpose: emitted rates stay comparable with
    // historical payloads.
    span::set_metric(root, KEY_RES_RATE, (num_slots / seen) as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::reservoir::DEFAULT_MEMORY_LIMIT;
    use crate::model::Span;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn generate_trace(trace_id: u64) -> ProcessedTrace {
        let root = Span {
            trace_id,
            span_id: 1,
            start: 1_500_000_000_000_000_000,
            duration: 1_000,
            ..Default::default()
        };
        ProcessedTrace {
            trace: vec![root],
            root: 0,
            env: String::new(),
            sublayers: HashMap::new(),
        }
    }

    struct Setup {
        flusher: Flusher,
        reservoir: Arc<StratifiedReservoir>,
        emitted: Arc<Mutex<Vec<ProcessedTrace>>>,
    }

    fn setup(max_no_flush_interval: Duration) -> Setup {
        let (sig_tx, sig_rx) = mpsc::channel(50);
        let reservoir = Arc::new(StratifiedReservoir::new(
            DEFAULT_MEMORY_LIMIT,
            sig_tx,
            Box::new(|_| {}),
        ));
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = emitted.clone();
        let (flusher, _handle) = Flusher::new(
            10.0,
            max_no_flush_interval,
            5,
            reservoir.clone(),
            sig_rx,
            Box::new(move |t| sink.lock().unwrap().push(t)),
        );
        Setup {
            flusher,
            reservoir,
            emitted,
        }
    }

    #[test]
    fn test_flush_once_empty() {
        let mut s = setup(Duration::from_secs(30));
        assert_eq!(s.flusher.flush_once(), None);
    }

    #[test]
    fn test_round_robin_fairness() {
        let mut s = setup(Duration::from_secs(30));
        let sigs = [Signature(1), Signature(2), Signature(3)];

        for round in 0u64..3 {
            for (i, &sig) in sigs.iter().enumerate() {
                s.reservoir.add(sig, generate_trace(100 * round + i as u64 + 1));
                s.flusher.handle_new_signature(sig);
            }
            for &expected in &sigs {
                assert_eq!(s.flusher.flush_once(), Some(expected));
            }
            assert_eq!(s.flusher.flush_once(), None, "all strata drained");
        }

        // Nine emissions, each stratum exactly once per round.
        let emitted = s.emitted.lock().unwrap();
        assert_eq!(emitted.len(), 9);
    }

    #[test]
    fn test_one_emission_per_tick() {
        let mut s = setup(Duration::from_secs(30));
        for sig in [Signature(1), Signature(2)] {
            s.reservoir.add(sig, generate_trace(sig.0));
            s.flusher.handle_new_signature(sig);
        }

        assert_eq!(s.flusher.flush_once(), Some(Signature(1)));
        assert_eq!(s.emitted.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_dormant_bucket_evicted() {
        let mut s = setup(Duration::ZERO);
        let sig = Signature(9);
        s.reservoir.add(sig, generate_trace(1));
        s.flusher.handle_new_signature(sig);

        assert_eq!(s.flusher.flush_once(), Some(sig));
        assert_eq!(s.reservoir.signature_cardinality(), 1);
        std::thread::sleep(Duration::from_millis(1));

        // The stratum stayed empty past the interval: bucket and reservoir go.
        assert_eq!(s.flusher.flush_once(), None);
        assert_eq!(s.reservoir.signature_cardinality(), 0);
        assert!(s.flusher.buckets.is_empty());
    }

    #[test]
    fn test_flush_annotations() {
        let mut s = setup(Duration::from_secs(30));
        let sig = Signature(4);
        for id in [10, 20, 5] {
            s.reservoir.add(sig, generate_trace(id));
        }
        s.flusher.handle_new_signature(sig);
        s.flusher.flush_once();

        let emitted = s.emitted.lock().unwrap();
        let root = emitted[0].root_span();
        assert_eq!(emitted[0].trace_id(), 20);
        assert_eq!(root.meta.get(KEY_RES_LIMIT).map(String::as_str), Some("false"));
        assert_eq!(root.metrics.get(KEY_RES_SLOTS), Some(&1.0));
        assert_eq!(root.metrics.get(KEY_RES_SEEN), Some(&3.0));
        // 1 / 3 in integer arithmetic.
        assert_eq!(root.metrics.get(KEY_RES_RATE), Some(&0.0));
    }

    #[test]
    fn test_overflow_annotation() {
        let mut s = setup(Duration::from_secs(30));
        s.reservoir.add(Signature(0), generate_trace(11));
        s.flusher.handle_new_signature(Signature(0));
        s.flusher.flush_once();

        let emitted = s.emitted.lock().unwrap();
        let root = emitted[0].root_span();
        assert_eq!(root.meta.get(KEY_RES_LIMIT).map(String::as_str), Some("true"));
        assert_eq!(root.metrics.get(KEY_RES_RATE), Some(&1.0));
    }

    #[test]
    fn test_duplicate_signature_notification_ignored() {
        let mut s = setup(Duration::from_secs(30));
        s.flusher.handle_new_signature(Signature(1));
        s.flusher.handle_new_signature(Signature(1));
        assert_eq!(s.flusher.buckets.len(), 1);
    }
}
