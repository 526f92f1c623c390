/*!
Timing samples.

Two clock domains exist. The host clock is [`Instant`]. The device clock counts
nanoseconds from the creation of the device, stamped by the device's workers as
work-groups start and finish, see [`ProfilingInfo`].
*/

use anyhow::Result;
use std::{
    fmt::{self, Display},
    time::{Duration, Instant},
};

/// The clock a [`TimingSample`] was read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum Clock {
    #[display(fmt = "host")]
    Host,
    #[display(fmt = "device")]
    Device,
}

/// A start and end timestamp in one clock domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimingSample {
    clock: Clock,
    start: Duration,
    end: Duration,
}

impl TimingSample {
    pub(crate) fn new(clock: Clock, start: Duration, end: Duration) -> Self {
        Self { clock, start, end }
    }
    pub fn clock(&self) -> Clock {
        self.clock
    }
    pub fn start(&self) -> Duration {
        self.start
    }
    pub fn end(&self) -> Duration {
        self.end
    }
    /// `end - start`, never negative.
    pub fn elapsed(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
    /// Elapsed seconds.
    pub fn secs(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }
}

/// Prints the elapsed seconds with microsecond precision.
impl Display for TimingSample {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:.6}", self.secs())
    }
}

/// Wall clock timer for host work.
#[derive(Clone, Copy, Debug)]
pub struct HostTimer {
    start: Instant,
}

impl HostTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }
    pub fn stop(self) -> TimingSample {
        TimingSample::new(Clock::Host, Duration::ZERO, self.start.elapsed())
    }
}

/// Runs `f`, bracketing it with a [`HostTimer`].
pub fn time<T>(f: impl FnOnce() -> Result<T>) -> Result<(T, TimingSample)> {
    let timer = HostTimer::start();
    let output = f()?;
    Ok((output, timer.stop()))
}

/** Timestamps of a dispatch, in nanoseconds.

- `command_submit`: the dispatch was queued.
- `command_start`: the first work-group began.
- `command_end`: the last work-group finished.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProfilingInfo {
    pub(crate) clock: Clock,
    pub(crate) command_submit: u64,
    pub(crate) command_start: u64,
    pub(crate) command_end: u64,
}

impl ProfilingInfo {
    pub fn clock(&self) -> Clock {
        self.clock
    }
    pub fn command_submit(&self) -> u64 {
        self.command_submit
    }
    pub fn command_start(&self) -> u64 {
        self.command_start
    }
    pub fn command_end(&self) -> u64 {
        self.command_end
    }
    /// Execution time only, excluding the time spent queued.
    pub fn sample(&self) -> TimingSample {
        TimingSample::new(
            self.clock,
            Duration::from_nanos(self.command_start),
            Duration::from_nanos(self.command_end),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_saturates() {
        let sample = TimingSample::new(
            Clock::Device,
            Duration::from_nanos(10),
            Duration::from_nanos(4),
        );
        assert_eq!(sample.elapsed(), Duration::ZERO);
        assert_eq!(sample.secs(), 0.0);
    }

    #[test]
    fn profiling_sample_is_start_to_end() {
        let info = ProfilingInfo {
            clock: Clock::Device,
            command_submit: 1_000,
            command_start: 1_500_000,
            command_end: 2_500_000,
        };
        let sample = info.sample();
        assert_eq!(sample.clock(), Clock::Device);
        assert_eq!(sample.elapsed(), Duration::from_millis(1));
        assert_eq!(sample.to_string(), "0.001000");
    }

    #[test]
    fn host_time() {
        let (x, sample) = time(|| Ok(1 + 1)).unwrap();
        assert_eq!(x, 2);
        assert_eq!(sample.clock(), Clock::Host);
        assert!(sample.secs() >= 0.0);
        assert_eq!(Clock::Host.to_string(), "host");
    }
}
