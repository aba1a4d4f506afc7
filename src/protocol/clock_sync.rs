//! # Clock Sync
//!
//! Estimates `server_time - client_time` from `SMSG_TIME_SYNC_REQ` /
//! `CMSG_TIME_SYNC_RESP` round trips.
//!
//! Each response yields a sample `(delta, round_trip)` with
//! `delta = sent + round_trip / 2 - client_time`. The authoritative delta is
//! the mean of the samples whose round trip is at most
//! `median + standard deviation` of the window, which drops the samples
//! inflated by TCP retransmits. A new mean is only adopted when it moves by
//! more than the hysteresis.
//!
//! Statistics use integer truncation for the median, deviation and mean so
//! that results match the reference server bit for bit.

use std::collections::HashMap;

use crate::config::SessionConfig;
use crate::error::{ProtocolError, Result};
use crate::utils::ring_buffer::SampleRing;
use crate::utils::time::ms_diff;

/// Outstanding requests are kept for at least this many later counters.
const MIN_PENDING: u32 = 8;

/// One completed time-sync round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    pub delta: i64,
    pub round_trip: u32,
}

#[derive(Debug, Clone)]
pub struct ClockSync {
    pending: HashMap<u32, u32>,
    samples: SampleRing<ClockSample>,
    delta: Option<i64>,
    hysteresis_ms: i64,
    next_counter: u32,
    timer_ms: u32,
    first_interval_ms: u32,
    interval_ms: u32,
}

impl ClockSync {
    pub fn new(window: usize, hysteresis_ms: i64) -> Self {
        Self {
            pending: HashMap::new(),
            samples: SampleRing::new(window),
            delta: None,
            hysteresis_ms,
            next_counter: 0,
            timer_ms: 0,
            first_interval_ms: 5_000,
            interval_ms: 10_000,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        let mut sync = Self::new(config.clock_sample_window, config.clock_delta_hysteresis_ms);
        sync.first_interval_ms = interval_ms(config.time_sync_first_interval);
        sync.interval_ms = interval_ms(config.time_sync_interval);
        sync
    }

    /// Forget outstanding requests and restart the counter. The sample window
    /// and the current delta survive.
    pub fn reset(&mut self) {
        self.next_counter = 0;
        self.pending.clear();
    }

    /// Register a probe sent at server time `now` and return its counter.
    ///
    /// The next probe is due after the first interval when this was counter
    /// 0, after the regular interval otherwise.
    ///
    /// Requests more than `max(window, 8)` counters old are forgotten, so a
    /// client that never answers cannot grow the pending set.
    pub fn begin_request(&mut self, now: u32) -> u32 {
        let counter = self.next_counter;
        let keep = MIN_PENDING.max(u32::try_from(self.samples.capacity()).unwrap_or(u32::MAX));
        self.pending
            .retain(|&pending, _| counter.wrapping_sub(pending) < keep);
        self.pending.insert(counter, now);
        self.timer_ms = if counter == 0 {
            self.first_interval_ms
        } else {
            self.interval_ms
        };
        self.next_counter = self.next_counter.wrapping_add(1);
        counter
    }

    /// Advance the probe timer by `diff_ms`; true when a probe is due.
    ///
    /// Nothing is scheduled until the first [`ClockSync::begin_request`].
    pub fn tick(&mut self, diff_ms: u32) -> bool {
        if self.timer_ms == 0 {
            return false;
        }
        if diff_ms >= self.timer_ms {
            return true;
        }
        self.timer_ms -= diff_ms;
        false
    }

    /// Feed a response received at server time `received_ms`.
    ///
    /// Responses for unknown counters are ignored and return `None`.
    pub fn handle_response(
        &mut self,
        counter: u32,
        client_time: u32,
        received_ms: u32,
    ) -> Option<ClockSample> {
        let sent = self.pending.remove(&counter)?;

        let round_trip = ms_diff(sent, received_ms);
        let lag = round_trip / 2;
        let sample = ClockSample {
            delta: i64::from(sent) + i64::from(lag) - i64::from(client_time),
            round_trip,
        };

        self.samples.push(sample);
        self.recompute();
        Some(sample)
    }

    fn recompute(&mut self) {
        let mut latencies: Vec<u32> = self.samples.iter().map(|s| s.round_trip).collect();
        if latencies.is_empty() {
            return;
        }
        let limit = u64::from(median(&mut latencies)) + u64::from(standard_deviation(&latencies));

        let kept: Vec<i64> = self
            .samples
            .iter()
            .filter(|s| u64::from(s.round_trip) <= limit)
            .map(|s| s.delta)
            .collect();

        if !kept.is_empty() {
            let mean = (kept.iter().map(|&d| d as f64).sum::<f64>() / kept.len() as f64) as i64;
            let moved = match self.delta {
                Some(current) => (mean - current).abs() > self.hysteresis_ms,
                None => true,
            };
            if moved {
                self.delta = Some(mean);
            }
        } else if self.delta.is_none() {
            self.delta = self.samples.back().map(|s| s.delta);
        }
    }

    pub fn delta(&self) -> Option<i64> {
        self.delta
    }

    pub fn samples(&self) -> impl Iterator<Item = &ClockSample> {
        self.samples.iter()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Translate a client timestamp onto the server timeline.
    ///
    /// Fails with [`ProtocolError::ClockSyncAnomaly`] when no delta is known
    /// yet or the result leaves the 32-bit range.
    pub fn to_server_time(&self, client_time: u32) -> Result<u32> {
        let anomaly = || ProtocolError::ClockSyncAnomaly {
            delta: self.delta,
            client_time,
        };
        let delta = self.delta.ok_or_else(anomaly)?;
        u32::try_from(i64::from(client_time) + delta).map_err(|_| anomaly())
    }
}

/// Timer value for a configured interval. Zero would read as "nothing
/// scheduled", so it is raised to 1 ms.
fn interval_ms(interval: std::time::Duration) -> u32 {
    u32::try_from(interval.as_millis())
        .unwrap_or(u32::MAX)
        .max(1)
}

/// Median of `values`; even counts average the two middle values.
fn median(values: &mut [u32]) -> u32 {
    values.sort_unstable();
    let n = values.len();
    if n % 2 == 0 {
        ((u64::from(values[n / 2 - 1]) + u64::from(values[n / 2])) / 2) as u32
    } else {
        values[n / 2]
    }
}

/// Population standard deviation, truncated.
fn standard_deviation(values: &[u32]) -> u32 {
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
    let variance = values
        .iter()
        .map(|&v| (f64::from(v) - mean).powi(2))
        .sum::<f64>()
        / n;
    variance.sqrt() as u32
}
