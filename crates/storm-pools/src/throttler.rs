//! Per-thread QPS throttler.
//!
//! Each worker thread gets its own slice of the configured rate:
//! `floor(maxQPS / threadCount)` queries per second, with the remainder
//! going one-each to the lowest thread ids. A thread's second is divided
//! into as many chunks as it has tokens; each chunk admits exactly one
//! request, which spreads admissions evenly instead of letting a burst
//! drain the whole second up front.
//!
//! Time is passed in explicitly (as an offset from the throttler's epoch)
//! so tests are deterministic; [`Throttler::throttle_now`] is the wall-clock
//! convenience wrapper.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use storm_common::prelude::*;
use tracing::{debug, info};

const SECOND: Duration = Duration::from_secs(1);

/// Per-thread chunked token bucket.
#[derive(Debug)]
struct ThreadThrottler {
    /// Tokens per second for this thread. Zero means no admission at all.
    rate: u64,
    /// Index of the last chunk that admitted a request.
    last_admitted_chunk: Option<u64>,
    finished: bool,
}

impl ThreadThrottler {
    fn new(rate: u64) -> Self {
        Self {
            rate,
            last_admitted_chunk: None,
            finished: false,
        }
    }

    /// `None` admits the request; `Some(backoff)` is the wait until the
    /// next chunk boundary.
    fn throttle(&mut self, now: Duration) -> Option<Duration> {
        if self.rate == 0 {
            // Zero rate never admits; callers back off a full second.
            return Some(SECOND);
        }
        let chunk_nanos = SECOND.as_nanos() as u64 / self.rate;
        let chunk = now.as_nanos() as u64 / chunk_nanos;
        match self.last_admitted_chunk {
            Some(last) if chunk <= last => {
                let next_boundary = (last + 1) * chunk_nanos;
                Some(Duration::from_nanos(next_boundary - now.as_nanos() as u64))
            }
            _ => {
                self.last_admitted_chunk = Some(chunk);
                None
            }
        }
    }
}

/// Admission throttler shared by a fixed set of worker threads.
pub struct Throttler {
    threads: Vec<Mutex<ThreadThrottler>>,
    max_rate: Mutex<u64>,
    epoch: Instant,
    closed: AtomicBool,
}

impl Throttler {
    /// `max_qps == 0` disables admission entirely: every call backs off.
    pub fn new(thread_count: usize, max_qps: u64) -> Result<Self> {
        if thread_count == 0 {
            return Err(Error::invalid_argument("thread_count must be > 0"));
        }
        let throttler = Self {
            threads: (0..thread_count)
                .map(|_| Mutex::new(ThreadThrottler::new(0)))
                .collect(),
            max_rate: Mutex::new(0),
            epoch: Instant::now(),
            closed: AtomicBool::new(false),
        };
        throttler.set_max_rate(max_qps);
        Ok(throttler)
    }

    /// Distribute `max_qps` across unfinished threads: `floor(q/n)` each,
    /// plus one extra for the first `q mod n` of them. If the rate is lower
    /// than the thread count, it is raised so no thread starves.
    pub fn set_max_rate(&self, max_qps: u64) {
        assert!(
            !self.closed.load(Ordering::SeqCst),
            "throttler used after close"
        );
        let mut current = self.max_rate.lock();
        *current = max_qps;

        let live: Vec<usize> = (0..self.threads.len())
            .filter(|&i| !self.threads[i].lock().finished)
            .collect();
        if live.is_empty() {
            return;
        }

        if max_qps == 0 {
            for &i in &live {
                self.threads[i].lock().rate = 0;
            }
            info!("throttler disabled: zero max rate");
            return;
        }

        let n = live.len() as u64;
        let qps = max_qps.max(n);
        let base = qps / n;
        let remainder = qps % n;
        for (pos, &i) in live.iter().enumerate() {
            let extra = if (pos as u64) < remainder { 1 } else { 0 };
            self.threads[i].lock().rate = base + extra;
        }
        debug!(max_qps = qps, threads = n, "throttler rates reallocated");
    }

    pub fn max_rate(&self) -> u64 {
        *self.max_rate.lock()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Ask for admission at `now` (offset from the throttler epoch).
    /// `None` admits; `Some(backoff)` tells the thread how long to wait.
    ///
    /// Panics if called after `close` or for a retired thread: both are
    /// caller bugs that must fail loudly.
    pub fn throttle(&self, thread_id: usize, now: Duration) -> Option<Duration> {
        assert!(
            !self.closed.load(Ordering::SeqCst),
            "throttler used after close"
        );
        let mut thread = self.threads[thread_id].lock();
        assert!(
            !thread.finished,
            "throttle called for retired thread {}",
            thread_id
        );
        thread.throttle(now)
    }

    /// Wall-clock wrapper over [`Self::throttle`].
    pub fn throttle_now(&self, thread_id: usize) -> Option<Duration> {
        self.throttle(thread_id, self.epoch.elapsed())
    }

    /// Permanently retire a thread. Its tokens are reallocated among the
    /// survivors at the next rate update.
    pub fn thread_finished(&self, thread_id: usize) {
        assert!(
            !self.closed.load(Ordering::SeqCst),
            "throttler used after close"
        );
        self.threads[thread_id].lock().finished = true;
        let rate = self.max_rate();
        self.set_max_rate(rate);
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
