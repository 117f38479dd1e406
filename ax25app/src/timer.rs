use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Stopped,
    Running,
    Expired,
}

/// How a timer callback run ended: the deadline passed, or `stop` was called
/// first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerResult {
    Expired,
    Cancelled,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimerError {
    #[error("timer already running")]
    AlreadyRunning,
    #[error("timer already stopped")]
    AlreadyStopped,
    #[error("cannot change timeout while timer is running")]
    TimeoutWhileRunning,
}

struct TimerControl {
    state: TimerState,
    // Bumped on every start and every cancel so a stale worker thread can
    // never fire for a start it no longer belongs to.
    epoch: u64,
    timeout: Duration,
}

struct TimerShared {
    control: Mutex<TimerControl>,
    wakeup: Condvar,
    callback: Box<dyn Fn(TimerResult) + Send + Sync>,
}

/// A cancelable single-shot timer.
///
/// The callback runs exactly once per `start`: with `Expired` from the worker
/// thread if the deadline passes, or with `Cancelled` from the caller of
/// `stop`. The race between the two is decided under the timer's mutex -
/// whichever transitions the state first wins and the loser does nothing.
pub struct Timer {
    shared: Arc<TimerShared>,
}

impl Timer {
    pub fn new<F: Fn(TimerResult) + Send + Sync + 'static>(timeout: Duration, callback: F) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                control: Mutex::new(TimerControl {
                    state: TimerState::Stopped,
                    epoch: 0,
                    timeout,
                }),
                wakeup: Condvar::new(),
                callback: Box::new(callback),
            }),
        }
    }

    pub fn state(&self) -> TimerState {
        self.shared.control.lock().unwrap().state
    }

    pub fn timeout(&self) -> Duration {
        self.shared.control.lock().unwrap().timeout
    }

    pub fn set_timeout(&self, timeout: Duration) -> Result<(), TimerError> {
        let mut control = self.shared.control.lock().unwrap();
        if control.state == TimerState::Running {
            return Err(TimerError::TimeoutWhileRunning);
        }
        control.timeout = timeout;
        Ok(())
    }

    /// Begin the countdown. Valid from `Stopped` or `Expired`.
    pub fn start(&self) -> Result<(), TimerError> {
        let (epoch, timeout) = {
            let mut control = self.shared.control.lock().unwrap();
            if control.state == TimerState::Running {
                return Err(TimerError::AlreadyRunning);
            }
            control.state = TimerState::Running;
            control.epoch += 1;
            (control.epoch, control.timeout)
        };
        let shared = self.shared.clone();
        thread::spawn(move || run_timer(shared, epoch, timeout));
        Ok(())
    }

    /// Cancel a running timer, invoking the callback with `Cancelled`.
    /// Stopping an expired timer just returns it to `Stopped`; its callback
    /// has already run.
    pub fn stop(&self) -> Result<(), TimerError> {
        let fire = {
            let mut control = self.shared.control.lock().unwrap();
            match control.state {
                TimerState::Stopped => return Err(TimerError::AlreadyStopped),
                TimerState::Running => {
                    control.state = TimerState::Stopped;
                    control.epoch += 1;
                    true
                }
                TimerState::Expired => {
                    control.state = TimerState::Stopped;
                    false
                }
            }
        };
        self.shared.wakeup.notify_all();
        if fire {
            (self.shared.callback)(TimerResult::Cancelled);
        }
        Ok(())
    }
}

fn run_timer(shared: Arc<TimerShared>, epoch: u64, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    let mut control = shared.control.lock().unwrap();
    loop {
        if control.epoch != epoch || control.state != TimerState::Running {
            // Cancelled, or superseded by a later start.
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            control.state = TimerState::Expired;
            break;
        }
        let (guard, _) = shared.wakeup.wait_timeout(control, deadline - now).unwrap();
        control = guard;
    }
    drop(control);
    (shared.callback)(TimerResult::Expired);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn collecting_timer(timeout: Duration) -> (Timer, mpsc::Receiver<TimerResult>) {
        let (tx, rx) = mpsc::channel();
        let timer = Timer::new(timeout, move |result| {
            let _ = tx.send(result);
        });
        (timer, rx)
    }

    #[test]
    fn natural_expiry() {
        let (timer, rx) = collecting_timer(Duration::from_millis(20));
        timer.start().unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)),
            Ok(TimerResult::Expired)
        );
        assert_eq!(timer.state(), TimerState::Expired);
    }

    #[test]
    fn cancel_fires_exactly_once() {
        let (timer, rx) = collecting_timer(Duration::from_secs(30));
        timer.start().unwrap();
        assert_eq!(timer.state(), TimerState::Running);
        timer.stop().unwrap();
        assert_eq!(rx.try_recv(), Ok(TimerResult::Cancelled));
        assert_eq!(timer.state(), TimerState::Stopped);
        // No late expiry from the worker thread.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn start_while_running_is_an_error() {
        let (timer, _rx) = collecting_timer(Duration::from_secs(30));
        timer.start().unwrap();
        assert_eq!(timer.start(), Err(TimerError::AlreadyRunning));
        timer.stop().unwrap();
    }

    #[test]
    fn stop_while_stopped_is_an_error() {
        let (timer, _rx) = collecting_timer(Duration::from_secs(30));
        assert_eq!(timer.stop(), Err(TimerError::AlreadyStopped));
    }

    #[test]
    fn timeout_locked_while_running() {
        let (timer, _rx) = collecting_timer(Duration::from_secs(30));
        timer.start().unwrap();
        assert_eq!(
            timer.set_timeout(Duration::from_secs(1)),
            Err(TimerError::TimeoutWhileRunning)
        );
        timer.stop().unwrap();
        timer.set_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(timer.timeout(), Duration::from_secs(1));
    }

    #[test]
    fn restart_after_expiry() {
        let (timer, rx) = collecting_timer(Duration::from_millis(10));
        timer.start().unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)),
            Ok(TimerResult::Expired)
        );
        timer.start().unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)),
            Ok(TimerResult::Expired)
        );
    }

    #[test]
    fn stop_after_expiry_is_quiet() {
        let (timer, rx) = collecting_timer(Duration::from_millis(10));
        timer.start().unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)),
            Ok(TimerResult::Expired)
        );
        timer.stop().unwrap();
        assert_eq!(timer.state(), TimerState::Stopped);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn restart_cycle_counts_callbacks() {
        let (timer, rx) = collecting_timer(Duration::from_secs(30));
        for _ in 0..3 {
            timer.start().unwrap();
            timer.stop().unwrap();
        }
        let mut cancels = 0;
        while rx.try_recv().is_ok() {
            cancels += 1;
        }
        assert_eq!(cancels, 3);
    }
}
