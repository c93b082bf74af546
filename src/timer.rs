//! Process-wide timer service.
//!
//! Two delivery modes: worker-dispatched timers submit a timer event to the
//! executor's scheduling group and run on a worker thread via
//! `exec_callback`; inline timers run directly on the timer thread, which
//! keeps supervision/shutdown paths alive after the workers have exited.
//!
//! Guarantees: after `delete` returns the callback is never invoked again;
//! `stop` flips the armed flag atomically under the timer table lock.
//! Resolution is milliseconds and periodic timers are re-armed by absolute
//! deadline, so drift stays below one period.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::driver::{DevId, Driver, EventId, EventInfo, GroupId};
use crate::error::{FlowError, FlowResult};

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeMode {
    /// Submit a timer event; a worker runs the callback.
    Worker,
    /// Run on the timer thread itself.
    Inline,
}

struct TimerInfo {
    next_deadline: Instant,
    period: Duration,
    oneshot: bool,
    armed: bool,
    mode: InvokeMode,
    callback: TimerCallback,
    /// Serialises callback execution against delete.
    exec_lock: Arc<Mutex<()>>,
}

struct Shared {
    timers: Mutex<HashMap<u32, TimerInfo>>,
    wakeup: Condvar,
    running: AtomicBool,
}

pub struct TimerService {
    shared: Arc<Shared>,
    next_id: AtomicU32,
    thread: Mutex<Option<JoinHandle<()>>>,
    epoch: Instant,
    drv: Driver,
    dev: DevId,
    group: GroupId,
}

const IDLE_WAIT: Duration = Duration::from_millis(100);

impl TimerService {
    /// Starts the timer thread. Worker-dispatched timers submit their events
    /// to `group` on `dev`.
    pub fn new(drv: Driver, dev: DevId, group: GroupId) -> Arc<Self> {
        let shared = Arc::new(Shared {
            timers: Mutex::new(HashMap::new()),
            wakeup: Condvar::new(),
            running: AtomicBool::new(true),
        });
        let service = Arc::new(Self {
            shared: shared.clone(),
            next_id: AtomicU32::new(1),
            thread: Mutex::new(None),
            epoch: Instant::now(),
            drv,
            dev,
            group,
        });
        let loop_service = service.clone();
        let handle = thread::Builder::new()
            .name("flow_timer".into())
            .spawn(move || loop_service.timer_loop())
            .expect("spawn timer thread");
        *service.thread.lock() = Some(handle);
        service
    }

    /// Monotonic microseconds since service creation.
    pub fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    pub fn create(&self, callback: TimerCallback, mode: InvokeMode) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = TimerInfo {
            next_deadline: Instant::now(),
            period: Duration::ZERO,
            oneshot: false,
            armed: false,
            mode,
            callback,
            exec_lock: Arc::new(Mutex::new(())),
        };
        self.shared.timers.lock().insert(id, info);
        id
    }

    pub fn start(&self, id: u32, period_ms: u64, oneshot: bool) -> FlowResult<()> {
        let mut timers = self.shared.timers.lock();
        let t = timers
            .get_mut(&id)
            .ok_or_else(|| FlowError::ParamInvalid(format!("unknown timer {id}")))?;
        t.period = Duration::from_millis(period_ms.max(1));
        t.oneshot = oneshot;
        t.next_deadline = Instant::now() + t.period;
        t.armed = true;
        self.shared.wakeup.notify_all();
        Ok(())
    }

    pub fn stop(&self, id: u32) -> FlowResult<()> {
        let mut timers = self.shared.timers.lock();
        let t = timers
            .get_mut(&id)
            .ok_or_else(|| FlowError::ParamInvalid(format!("unknown timer {id}")))?;
        t.armed = false;
        self.shared.wakeup.notify_all();
        Ok(())
    }

    /// Removes the timer and waits out any in-flight callback run, so the
    /// callback cannot fire once this returns.
    pub fn delete(&self, id: u32) -> FlowResult<()> {
        let exec_lock = {
            let mut timers = self.shared.timers.lock();
            match timers.remove(&id) {
                Some(t) => t.exec_lock,
                None => {
                    return Err(FlowError::ParamInvalid(format!("unknown timer {id}")))
                }
            }
        };
        drop(exec_lock.lock());
        Ok(())
    }

    /// Runs the stored callback of a worker-dispatched timer. Invoked by the
    /// executor's timer event handler on a worker thread.
    pub fn exec_callback(&self, id: u32) {
        let exec_lock = {
            let timers = self.shared.timers.lock();
            match timers.get(&id) {
                Some(t) => t.exec_lock.clone(),
                None => {
                    debug!("timer {id} fired after delete, skipping");
                    return;
                }
            }
        };
        let _guard = exec_lock.lock();
        // re-check under the table lock: delete may have won the race
        let callback = {
            let timers = self.shared.timers.lock();
            match timers.get(&id) {
                Some(t) => t.callback.clone(),
                None => return,
            }
        };
        callback();
    }

    /// Stops the timer thread; no callback runs after this returns.
    pub fn finalize(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.wakeup.notify_all();
        let handle = self.thread.lock().take();
        if let Some(h) = handle {
            // a callback dropping the last owner would deadlock joining
            // its own thread
            if h.thread().id() == thread::current().id() {
                warn!("finalize called from timer thread, skipping join");
            } else {
                let _ = h.join();
            }
        }
        self.shared.timers.lock().clear();
    }

    fn timer_loop(&self) {
        while self.shared.running.load(Ordering::SeqCst) {
            let mut due = Vec::new();
            let mut timers = self.shared.timers.lock();
            let now = Instant::now();
            let mut nearest: Option<Instant> = None;
            for (id, t) in timers.iter_mut() {
                if !t.armed {
                    continue;
                }
                if t.next_deadline <= now {
                    due.push((*id, t.mode, t.callback.clone(), t.exec_lock.clone()));
                    if t.oneshot {
                        t.armed = false;
                        continue;
                    }
                    // re-arm on the absolute grid, skipping missed periods
                    while t.next_deadline <= now {
                        t.next_deadline += t.period;
                    }
                }
                nearest = Some(match nearest {
                    Some(n) if n <= t.next_deadline => n,
                    _ => t.next_deadline,
                });
            }
            if due.is_empty() {
                let wait = nearest
                    .map(|n| n.saturating_duration_since(Instant::now()))
                    .unwrap_or(IDLE_WAIT)
                    .min(IDLE_WAIT);
                let _ = self
                    .shared
                    .wakeup
                    .wait_for(&mut timers, wait.max(Duration::from_millis(1)));
                continue;
            }
            drop(timers);
            for (id, mode, callback, exec_lock) in due {
                match mode {
                    InvokeMode::Worker => {
                        if let Err(e) = self.drv.submit_event(
                            self.dev,
                            self.group,
                            EventInfo::new(EventId::Timer, id),
                        ) {
                            warn!("failed to submit timer event {id}: {e}");
                        }
                    }
                    InvokeMode::Inline => {
                        let _guard = exec_lock.lock();
                        // skip when deleted between collection and here
                        if self.shared.timers.lock().contains_key(&id) {
                            callback();
                        }
                    }
                }
            }
        }
    }
}
