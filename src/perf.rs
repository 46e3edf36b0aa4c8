//! Optional counters for where offload time goes.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfEvent {
    Kernel,
    HostToDevice,
    DeviceToHost,
    Runtime,
    UpdatePtr,
}

impl PerfEvent {
    pub const ALL: [Self; 5] = [
        Self::Runtime,
        Self::Kernel,
        Self::HostToDevice,
        Self::DeviceToHost,
        Self::UpdatePtr,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Kernel => "Kernel",
            Self::HostToDevice => "H2D",
            Self::DeviceToHost => "D2H",
            Self::Runtime => "Runtime",
            Self::UpdatePtr => "UpdatePtr",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Kernel => 0,
            Self::HostToDevice => 1,
            Self::DeviceToHost => 2,
            Self::Runtime => 3,
            Self::UpdatePtr => 4,
        }
    }
}

#[derive(Debug, Default)]
struct EventCounter {
    count: AtomicU64,
    nanos: AtomicU64,
}

/// Snapshot of one event's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventStats {
    pub count: u64,
    pub total: Duration,
}

/// Per-runtime performance record. All methods take `&self`; counters are atomics so devices
/// on different threads can share one record.
#[derive(Debug, Default)]
pub struct PerfRecord {
    events: [EventCounter; 5],
    table_sizes: Mutex<Vec<usize>>,
    target_mem: AtomicUsize,
}

impl PerfRecord {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start timing `event`; the time is recorded when the guard drops.
    #[must_use = "the event is recorded when the timer is dropped"]
    pub fn start(&self, event: PerfEvent) -> PerfTimer<'_> {
        PerfTimer {
            record: self,
            event,
            started: Instant::now(),
        }
    }

    pub fn record(&self, event: PerfEvent, elapsed: Duration) {
        let counter = &self.events[event.index()];
        counter.count.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        counter.nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    #[must_use]
    pub fn stats(&self, event: PerfEvent) -> EventStats {
        let counter = &self.events[event.index()];
        EventStats {
            count: counter.count.load(Ordering::Relaxed),
            total: Duration::from_nanos(counter.nanos.load(Ordering::Relaxed)),
        }
    }

    /// Record the size, in entries, of a translation table sent to a device.
    pub fn sample_table_size(&self, entries: usize) {
        if let Ok(mut sizes) = self.table_sizes.lock() {
            sizes.push(entries);
        }
    }

    #[must_use]
    pub fn table_sizes(&self) -> Vec<usize> {
        self.table_sizes
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Record the bytes currently covered by bulk segments.
    pub fn set_target_mem(&self, bytes: usize) {
        self.target_mem.store(bytes, Ordering::Relaxed);
    }

    #[must_use]
    pub fn target_mem(&self) -> usize {
        self.target_mem.load(Ordering::Relaxed)
    }

    pub fn dump(&self) {
        log::info!("PerfRecord dump");
        for event in PerfEvent::ALL {
            let s = self.stats(event);
            log::info!(
                "{:<11} , {:>7} , {:>10.6}",
                event.name(),
                s.count,
                s.total.as_secs_f64()
            );
        }
        let sizes = self.table_sizes();
        if let Some(&max) = sizes.iter().max() {
            log::info!(
                "TableSize   , {:>7} samples , max {max}, last {}",
                sizes.len(),
                sizes.last().copied().unwrap_or(0)
            );
        }
        log::info!("TargetMem   , {:>7}", self.target_mem());
    }
}

/// Times one event occurrence.
#[derive(Debug)]
pub struct PerfTimer<'a> {
    record: &'a PerfRecord,
    event: PerfEvent,
    started: Instant,
}

impl Drop for PerfTimer<'_> {
    fn drop(&mut self) {
        self.record.record(self.event, self.started.elapsed());
    }
}
