//! Tick pacing: the scheduler contract and the wall-clock implementation.

use std::thread;
use std::time::{Duration, Instant};

use pulssi_score::SongLock;

/// Error from a scheduler backend. The engine reacts by stopping the run.
#[derive(Debug)]
pub struct SchedulerError(pub String);

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Scheduler error: {}", self.0)
    }
}

impl std::error::Error for SchedulerError {}

/// A clock that paces the engine at tick granularity. Playing with no
/// scheduler at all runs as fast as possible, which is what SMF export
/// wants.
pub trait Scheduler: Send {
    /// Record the start of a run and return the wall-clock start moment.
    fn start(&mut self) -> Instant;

    /// Block until the next tick boundary is due. The tick interval follows
    /// the song's current tempo and ticks-per-line; `scheduler_changed`
    /// signals that pacing just switched over to this scheduler and any
    /// accumulated deadline should be dropped.
    fn wait_for_tick(&mut self, song: &SongLock, scheduler_changed: bool)
        -> Result<(), SchedulerError>;

    /// Release any clock resources at the end of a run.
    fn stop(&mut self);

    fn name(&self) -> &'static str;
}

/// Wall-clock scheduler: sleeps towards an absolute next-tick deadline so
/// jitter does not accumulate.
#[derive(Debug, Default)]
pub struct TimerScheduler {
    next: Option<Instant>,
}

impl TimerScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for TimerScheduler {
    fn start(&mut self) -> Instant {
        let now = Instant::now();
        self.next = Some(now);
        now
    }

    fn wait_for_tick(
        &mut self,
        song: &SongLock,
        scheduler_changed: bool,
    ) -> Result<(), SchedulerError> {
        let (tempo, ticks_per_line) = {
            let song = song.lock();
            (song.tempo() as u64, song.ticks_per_line() as u64)
        };
        // One line is one beat: tempo * TPL ticks per minute
        let interval = Duration::from_micros(60_000_000 / (tempo * ticks_per_line).max(1));

        let mut next = self.next.take().unwrap_or_else(Instant::now);
        if scheduler_changed {
            next = Instant::now();
        }
        next += interval;

        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        } else {
            // Fell behind (editor held the score lock, system hiccup):
            // resynchronise instead of bursting to catch up
            next = now;
        }
        self.next = Some(next);
        Ok(())
    }

    fn stop(&mut self) {
        self.next = None;
    }

    fn name(&self) -> &'static str {
        "timer"
    }
}
