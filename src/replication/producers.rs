#![forbid(unsafe_code)]
//! The set of producers attached to one graph.
//!
//! Each producer lives in a slot with its own mutex and exchange worker.
//! Commits from the emitter go to every active producer in turn, waiting
//! (bounded by the commit timeout) for output buffer room.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::operation::emitter::{Backlog, TransactionSink};
use crate::replication::producer::{
    AttachMode, Endpoint, ProducerId, ProducerOptions, ProducerStats, TransactionalProducer, TX_OVERHEAD,
};
use crate::types::{ObjectId, Result, SombraError};

const EXCHANGE_BUDGET: Duration = Duration::from_millis(50);

struct Slot {
    id: ProducerId,
    producer: Mutex<TransactionalProducer>,
    /// Wakes the exchange worker.
    wakeup: Condvar,
    /// Signalled by the worker after each exchange.
    progress: Condvar,
    stop: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Slot {
    fn run(self: Arc<Self>) {
        let mut producer = self.producer.lock();
        let poll = producer.options().poll_interval;
        while !self.stop.load(Ordering::Acquire) {
            if let Err(err) = producer.exchange(EXCHANGE_BUDGET) {
                warn!(producer = %self.id, error = %err, "producers.exchange_failed");
            }
            self.progress.notify_all();
            if !producer.is_active() && producer.is_connected() {
                producer.abandon();
            }
            self.wakeup.wait_for(&mut producer, poll);
        }
        self.progress.notify_all();
        debug!(producer = %self.id, "producers.worker_exit");
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.wakeup.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!(producer = %self.id, "producers.worker_panicked");
            }
        }
    }
}

/// Owned, indexable collection of a graph's producers.
pub struct TransactionalProducers {
    options: ProducerOptions,
    slots: RwLock<Vec<Option<Arc<Slot>>>>,
    fingerprint: Mutex<ObjectId>,
    master_serial: AtomicU64,
}

impl TransactionalProducers {
    pub fn new(options: ProducerOptions) -> Self {
        Self {
            options: options.normalize(),
            slots: RwLock::new(Vec::new()),
            fingerprint: Mutex::new(ObjectId::NONE),
            master_serial: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> &ProducerOptions {
        &self.options
    }

    /// Fingerprint announced by producers attached from now on.
    pub fn set_fingerprint(&self, fingerprint: ObjectId) {
        *self.fingerprint.lock() = fingerprint;
    }

    /// Master serial carried by the last committed transaction.
    pub fn master_serial(&self) -> u64 {
        self.master_serial.load(Ordering::Acquire)
    }

    fn active(&self) -> Vec<Arc<Slot>> {
        self.slots.read().iter().flatten().cloned().collect()
    }

    fn slot(&self, id: ProducerId) -> Option<Arc<Slot>> {
        self.slots.read().get(id.0).cloned().flatten()
    }

    /// Attaches a producer to the first reachable of `uris`.
    pub fn attach<S: AsRef<str>>(&self, uris: &[S], mode: AttachMode, timeout: Option<Duration>) -> Result<ProducerId> {
        if uris.is_empty() {
            return Err(SombraError::Invalid("no subscriber uri given"));
        }
        let mut options = self.options.clone();
        if let Some(timeout) = timeout {
            options.handshake_timeout = timeout;
            options.connect_timeout = options.connect_timeout.min(timeout);
        }
        let fingerprint = *self.fingerprint.lock();
        let mut last_err = None;
        for uri in uris {
            let uri = uri.as_ref();
            let endpoint: Endpoint = match uri.parse() {
                Ok(endpoint) => endpoint,
                Err(err) => {
                    warn!(uri, error = %err, "producers.bad_uri");
                    last_err = Some(err);
                    continue;
                }
            };
            let mut producer = TransactionalProducer::new(endpoint, mode, options.clone());
            producer.set_fingerprint(fingerprint);
            match producer.attach() {
                Ok(()) => return self.install(producer),
                Err(err) => {
                    warn!(uri, error = %err, "producers.attach_failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or(SombraError::Invalid("no subscriber reachable")))
    }

    fn install(&self, producer: TransactionalProducer) -> Result<ProducerId> {
        let name = producer.name().to_string();
        let mut slots = self.slots.write();
        let index = slots.iter().position(Option::is_none).unwrap_or(slots.len());
        let id = ProducerId(index);
        let slot = Arc::new(Slot {
            id,
            producer: Mutex::new(producer),
            wakeup: Condvar::new(),
            progress: Condvar::new(),
            stop: AtomicBool::new(false),
            worker: Mutex::new(None),
        });
        let worker = Arc::clone(&slot);
        let handle = thread::Builder::new()
            .name(format!("producer-{index}"))
            .spawn(move || worker.run())?;
        *slot.worker.lock() = Some(handle);
        if index == slots.len() {
            slots.push(Some(slot));
        } else {
            slots[index] = Some(slot);
        }
        info!(producer = %id, endpoint = %name, "producers.attached");
        Ok(id)
    }

    /// Cleanly detaches one producer and frees its slot.
    pub fn detach(&self, id: ProducerId) -> Result<()> {
        let slot = self
            .slots
            .write()
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or(SombraError::NotFound)?;
        slot.producer.lock().detach();
        slot.stop();
        info!(producer = %id, "producers.detached");
        Ok(())
    }

    /// Detaches every producer.
    pub fn detach_all(&self) -> usize {
        let slots: Vec<_> = self.slots.write().drain(..).flatten().collect();
        for slot in &slots {
            slot.producer.lock().detach();
            slot.stop();
        }
        slots.len()
    }

    /// Number of attached producers, abandoned ones included.
    pub fn len(&self) -> usize {
        self.slots.read().iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counters of one producer.
    pub fn get(&self, id: ProducerId) -> Option<ProducerStats> {
        self.slot(id).map(|slot| slot.producer.lock().stats())
    }

    pub fn stats(&self) -> Vec<(ProducerId, ProducerStats)> {
        self.active()
            .into_iter()
            .map(|slot| (slot.id, slot.producer.lock().stats()))
            .collect()
    }

    /// Largest outstanding work among the producers.
    pub fn max_backlog(&self) -> Backlog {
        self.active().iter().fold(Backlog::default(), |acc, slot| {
            let backlog = slot.producer.lock().backlog();
            Backlog {
                bytes: acc.bytes.max(backlog.bytes),
                transactions: acc.transactions.max(backlog.transactions),
            }
        })
    }

    /// Mutes or unmutes a producer's output.
    pub fn set_muted(&self, id: ProducerId, muted: bool) -> Result<()> {
        let slot = self.slot(id).ok_or(SombraError::NotFound)?;
        slot.producer.lock().set_muted(muted);
        slot.wakeup.notify_all();
        Ok(())
    }

    /// Waits until every active producer has nothing left unacknowledged.
    pub fn wait_settled(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        for slot in self.active() {
            let mut producer = slot.producer.lock();
            while producer.is_active() && !producer.is_settled() {
                slot.wakeup.notify_all();
                if slot.progress.wait_until(&mut producer, deadline).timed_out()
                    && producer.is_active()
                    && !producer.is_settled()
                {
                    return Err(SombraError::Timeout("producers settle"));
                }
            }
        }
        Ok(())
    }

    fn abandon(&self, slot: &Slot) {
        slot.producer.lock().abandon();
        slot.stop();
    }

    /// Stops every worker; producers stay listed for inspection.
    pub fn shutdown(&self) {
        for slot in self.active() {
            slot.stop();
        }
    }
}

impl TransactionSink for TransactionalProducers {
    fn commit(&self, data: &[u8], master_serial: u64) -> Result<()> {
        self.master_serial.store(master_serial, Ordering::Release);
        let required = data.len() + TX_OVERHEAD;
        let mut failed = Vec::new();
        for slot in self.active() {
            let mut producer = slot.producer.lock();
            if !producer.is_active() {
                continue;
            }
            let deadline = Instant::now() + self.options.commit_timeout;
            let mut throttled = false;
            let mut starved = false;
            while !producer.committable(required, throttled) {
                if !throttled {
                    debug!(producer = %slot.id, backlog = ?producer.backlog(), "producers.commit_waiting");
                }
                throttled = true;
                slot.wakeup.notify_all();
                if slot.progress.wait_until(&mut producer, deadline).timed_out()
                    && !producer.committable(required, throttled)
                {
                    starved = true;
                    break;
                }
            }
            if starved {
                error!(producer = %slot.id, bytes = data.len(), "producers.output_buffer_full");
                drop(producer);
                failed.push(slot);
                continue;
            }
            match producer.commit(data, master_serial) {
                Ok(_) => {
                    slot.wakeup.notify_all();
                }
                Err(err) => {
                    error!(producer = %slot.id, error = %err, "producers.commit_failed");
                    drop(producer);
                    failed.push(slot);
                }
            }
        }
        for slot in failed {
            self.abandon(&slot);
        }
        Ok(())
    }

    fn backlog(&self) -> Backlog {
        self.max_backlog()
    }
}

impl Drop for TransactionalProducers {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TransactionalProducers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalProducers")
            .field("len", &self.len())
            .field("master_serial", &self.master_serial())
            .finish()
    }
}
