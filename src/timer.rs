use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

/// Handle returned by `timer_add`; use with `timer_cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

/// Scheduling options for one timer.
#[derive(Debug, Clone, Copy)]
pub struct TimerOpts {
    /// Re-arm after each firing; otherwise the timer fires once.
    pub repeat: bool,
    /// Invoke the callback immediately inside `timer_add`.
    pub run_now: bool,
    /// Unlink automatically once a one-shot has fired (repeating
    /// timers are unlinked at manager teardown either way).
    pub autodelete: bool,
}

impl Default for TimerOpts {
    fn default() -> Self {
        Self {
            repeat: false,
            run_now: false,
            autodelete: true,
        }
    }
}

struct Timer {
    id: u64,
    period: Duration,
    deadline: Instant,
    repeat: bool,
    autodelete: bool,
    called: bool,
    callback: Box<dyn FnMut()>,
}

/// Timers stored in insertion order; each tick scans the list, which is
/// the right shape for the handful of timers a loop carries in
/// practice.
#[derive(Default)]
pub(crate) struct TimerList {
    timers: Vec<Timer>,
    next_id: u64,
}

fn invoke(callback: &mut Box<dyn FnMut()>, id: u64) {
    if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
        log::error!("timer {} callback panicked", id);
    }
}

impl TimerList {
    pub fn add(
        &mut self,
        period_ms: u64,
        opts: TimerOpts,
        mut callback: Box<dyn FnMut()>,
    ) -> TimerId {
        self.next_id += 1;
        let id = self.next_id;
        let period = Duration::from_millis(period_ms);

        if opts.run_now {
            invoke(&mut callback, id);
            if !opts.repeat {
                // Fired already; a one-shot without autodelete stays
                // linked as CALLED so cancel remains valid.
                if !opts.autodelete {
                    self.timers.push(Timer {
                        id,
                        period,
                        deadline: Instant::now() + period,
                        repeat: false,
                        autodelete: false,
                        called: true,
                        callback,
                    });
                }
                return TimerId(id);
            }
        }

        self.timers.push(Timer {
            id,
            period,
            deadline: Instant::now() + period,
            repeat: opts.repeat,
            autodelete: opts.autodelete,
            called: false,
            callback,
        });
        TimerId(id)
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| t.id != id.0);
        self.timers.len() != before
    }

    /// Fires every due timer, in insertion order, against a single
    /// `now` computed by the caller for this tick.
    pub fn tick(&mut self, now: Instant) {
        for timer in &mut self.timers {
            if timer.called || timer.deadline > now {
                continue;
            }
            invoke(&mut timer.callback, timer.id);
            if timer.repeat {
                // Advance by whole periods so firings stay at T, T+P,
                // T+2P even when a tick arrives late.
                while timer.deadline <= now {
                    timer.deadline += timer.period;
                }
            } else {
                timer.called = true;
            }
        }
        self.timers.retain(|t| !(t.called && t.autodelete));
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn counter() -> (Rc<Cell<u32>>, Box<dyn FnMut()>) {
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        (count, Box::new(move || c.set(c.get() + 1)))
    }

    #[test]
    fn test_one_shot_fires_once() {
        let mut list = TimerList::default();
        let (count, cb) = counter();
        list.add(10, TimerOpts::default(), cb);

        let later = Instant::now() + Duration::from_millis(20);
        list.tick(later);
        list.tick(later + Duration::from_millis(50));
        assert_eq!(count.get(), 1);
        // AUTODELETE one-shot unlinks after firing.
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_repeat_advances_by_whole_periods() {
        let mut list = TimerList::default();
        let (count, cb) = counter();
        list.add(
            10,
            TimerOpts {
                repeat: true,
                ..Default::default()
            },
            cb,
        );

        let t0 = Instant::now();
        list.tick(t0 + Duration::from_millis(15));
        assert_eq!(count.get(), 1);
        // A late tick spanning several periods still fires once.
        list.tick(t0 + Duration::from_millis(55));
        assert_eq!(count.get(), 2);
        list.tick(t0 + Duration::from_millis(65));
        assert_eq!(count.get(), 3);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_run_now_fires_inside_add() {
        let mut list = TimerList::default();
        let (count, cb) = counter();
        list.add(
            1000,
            TimerOpts {
                run_now: true,
                ..Default::default()
            },
            cb,
        );
        assert_eq!(count.get(), 1);
        list.tick(Instant::now());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_cancel_unlinks() {
        let mut list = TimerList::default();
        let (count, cb) = counter();
        let id = list.add(
            10,
            TimerOpts {
                repeat: true,
                ..Default::default()
            },
            cb,
        );
        assert!(list.cancel(id));
        assert!(!list.cancel(id));
        list.tick(Instant::now() + Duration::from_millis(100));
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn test_insertion_order_within_a_tick() {
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut list = TimerList::default();
        for label in ["a", "b", "c"] {
            let o = order.clone();
            list.add(
                5,
                TimerOpts {
                    repeat: true,
                    ..Default::default()
                },
                Box::new(move || o.borrow_mut().push(label)),
            );
        }
        list.tick(Instant::now() + Duration::from_millis(10));
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_callback_panic_is_trapped() {
        let mut list = TimerList::default();
        let (count, cb) = counter();
        list.add(
            5,
            TimerOpts {
                repeat: true,
                ..Default::default()
            },
            Box::new(|| panic!("timer bug")),
        );
        list.add(
            5,
            TimerOpts {
                repeat: true,
                ..Default::default()
            },
            cb,
        );
        list.tick(Instant::now() + Duration::from_millis(10));
        // The panicking timer did not stop the one after it.
        assert_eq!(count.get(), 1);
    }
}
