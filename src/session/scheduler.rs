//! Periodic schedule loops that enqueue read batches onto a session's queue
//! (`SPEC_FULL.md` §3, §4.2).
//!
//! Each schedule is its own thread, grounded on the same dedicated-thread
//! pattern the session worker itself uses: a schedule loop only ever talks
//! to the outside world by pushing [`Command`]s down an `mpsc::Sender`,
//! never by touching session state directly.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use super::queue::Command;

/// How often a cancelled/stopped schedule loop re-checks its flags while
/// sleeping out its period, so `stop()` is noticed promptly rather than
/// after the full period elapses.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn interruptible_sleep(total: Duration, running: &AtomicBool, stop: &AtomicBool) -> bool {
    let mut slept = Duration::ZERO;
    while slept < total {
        if !running.load(Ordering::Acquire) || stop.load(Ordering::Acquire) {
            return false;
        }
        let step = POLL_INTERVAL.min(total - slept);
        std::thread::sleep(step);
        slept += step;
    }
    running.load(Ordering::Acquire) && !stop.load(Ordering::Acquire)
}

/// A single running (or just-finished) schedule loop.
#[derive(Debug)]
struct ScheduleHandle {
    stop: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl ScheduleHandle {
    fn cancel(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Owns every schedule loop for one session, keyed by period in seconds.
///
/// Multiple schedules may coexist; their ticks are independent, and
/// conflicts over the same DID are resolved naturally by the command queue
/// FIFO (`SPEC_FULL.md` §4.2).
#[derive(Debug, Default)]
pub struct Scheduler {
    loops: BTreeMap<u32, ScheduleHandle>,
}

impl Scheduler {
    /// Creates a scheduler with no loops running.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs (replacing any existing loop at the same period) a schedule
    /// that enqueues `Command::Read` for every DID in `dids`.
    ///
    /// `period_secs == 0` fires once immediately and then exits; otherwise
    /// it fires once immediately and then every `period_secs` seconds.
    /// `running` is the session-wide terminal flag shared with the worker
    /// thread; the loop exits as soon as either flag clears.
    pub fn add(
        &mut self,
        period_secs: u32,
        dids: Vec<u16>,
        command_tx: mpsc::Sender<Command>,
        running: Arc<AtomicBool>,
    ) {
        if let Some(old) = self.loops.remove(&period_secs) {
            old.cancel();
        }
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();
        let join = std::thread::spawn(move || {
            if !running.load(Ordering::Acquire) || stop_thread.load(Ordering::Acquire) {
                return;
            }
            for &did in &dids {
                if command_tx.send(Command::Read(did)).is_err() {
                    return;
                }
            }
            if period_secs == 0 {
                return;
            }
            let period = Duration::from_secs(u64::from(period_secs));
            loop {
                if !interruptible_sleep(period, &running, &stop_thread) {
                    return;
                }
                for &did in &dids {
                    if command_tx.send(Command::Read(did)).is_err() {
                        return;
                    }
                }
            }
        });
        self.loops.insert(period_secs, ScheduleHandle { stop, join: Some(join) });
    }

    /// Cancels and joins every schedule loop.
    pub fn cancel_all(&mut self) {
        for (_, handle) in std::mem::take(&mut self.loops) {
            handle.cancel();
        }
    }

    /// How many distinct periods have an active schedule.
    pub fn active_count(&self) -> usize {
        self.loops.len()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn one_shot_schedule_fires_once_and_exits() {
        let (tx, rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        let mut scheduler = Scheduler::new();
        scheduler.add(0, vec![0x100, 0x200], tx, running);

        let first = rx.recv_timeout(Duration::from_millis(500)).unwrap();
        let second = rx.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(first, Command::Read(0x100));
        assert_eq!(second, Command::Read(0x200));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn periodic_schedule_fires_more_than_once() {
        let (tx, rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        let mut scheduler = Scheduler::new();
        // Use the minimum whole-second period; the test just needs a second tick.
        scheduler.add(1, vec![0x100], tx, running.clone());

        let start = Instant::now();
        let _ = rx.recv_timeout(Duration::from_millis(500)).unwrap();
        let _ = rx.recv_timeout(Duration::from_millis(2000)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(900));
        running.store(false, Ordering::Release);
        scheduler.cancel_all();
    }

    #[test]
    fn cancel_all_stops_future_ticks() {
        let (tx, rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        let mut scheduler = Scheduler::new();
        scheduler.add(1, vec![0x100], tx, running);
        let _ = rx.recv_timeout(Duration::from_millis(500)).unwrap();
        scheduler.cancel_all();
        assert_eq!(scheduler.active_count(), 0);
    }
}
