//! In-process HAL: queues, event broker and message buffers.
//!
//! Software rendition of the device driver contract the executor is written
//! against. Queues are bounded FIFOs with edge-triggered empty-to-not-empty
//! and full-to-not-full events; the event broker delivers each event to
//! exactly one of the threads waiting on its scheduling group.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use dashmap::DashMap;
use log::debug;
use parking_lot::Mutex;

use crate::msg::FlowMsgRef;

pub type DevId = u32;
pub type QueueId = u32;
pub type GroupId = u32;

const ATTACH_POLL_MS: u64 = 10;

/// Raw driver error codes. Callers outside `driver` never see these; the
/// façade maps them to the uniform error set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrvError {
    RepeatedInit,
    QueueNotFound,
    QueueEmpty,
    QueueFull,
    WaitTimeout,
    NoEvent,
    GroupNotFound,
    Internal(String),
}

pub type DrvResult<T> = Result<T, DrvError>;

/// Fixed event-id set used when submitting through the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventId {
    QueueEmptyToNotEmpty = 0,
    QueueFullToNotFull = 1,
    ProcessorInit = 2,
    FlowFuncInit = 3,
    SingleFlowFuncInit = 4,
    FlowFuncExecute = 5,
    Timer = 6,
    ReportStatus = 7,
    NotifyThreadExit = 8,
    SuspendFinished = 9,
    RecoverFinished = 10,
    SwitchToSoftSched = 11,
    RaiseException = 12,
}

impl EventId {
    pub const fn mask(self) -> u64 {
        1u64 << (self as u32)
    }
}

/// Small typed payload piggybacked on an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPayload {
    None,
    /// Result code reported by a processor (suspend/recover acks).
    Code(i32),
    /// Transaction id of an exception to forward.
    TransId(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInfo {
    pub event_id: EventId,
    pub subevent_id: u32,
    pub payload: EventPayload,
}

impl EventInfo {
    pub fn new(event_id: EventId, subevent_id: u32) -> Self {
        Self {
            event_id,
            subevent_id,
            payload: EventPayload::None,
        }
    }

    pub fn with_payload(event_id: EventId, subevent_id: u32, payload: EventPayload) -> Self {
        Self {
            event_id,
            subevent_id,
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkMode {
    Push,
    Pull,
}

struct HalQueue {
    capacity: usize,
    buf: Mutex<VecDeque<FlowMsgRef>>,
    work_mode: Mutex<WorkMode>,
    /// Group receiving empty-to-not-empty events, if subscribed.
    e2ne_group: Mutex<Option<GroupId>>,
    /// Group receiving full-to-not-full events, if subscribed.
    f2nf_group: Mutex<Option<GroupId>>,
}

impl HalQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buf: Mutex::new(VecDeque::new()),
            work_mode: Mutex::new(WorkMode::Push),
            e2ne_group: Mutex::new(None),
            f2nf_group: Mutex::new(None),
        }
    }
}

struct EventGroup {
    tx: Sender<EventInfo>,
    rx: Receiver<EventInfo>,
    /// Union of the masks the subscribed threads asked for.
    mask: Mutex<u64>,
}

/// The process-wide driver instance. Constructed once and shared as `Arc`;
/// tests construct their own.
#[derive(Default)]
pub struct Hal {
    queues: DashMap<(DevId, QueueId), HalQueue>,
    groups: DashMap<GroupId, EventGroup>,
    inited_devs: Mutex<HashSet<DevId>>,
}

impl Hal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a queue. In a real deployment the deployer creates queues
    /// before the executor attaches; tests and the bootstrap path use this.
    pub fn queue_create(&self, dev: DevId, qid: QueueId, capacity: usize) -> DrvResult<()> {
        if self.queues.contains_key(&(dev, qid)) {
            return Err(DrvError::RepeatedInit);
        }
        self.queues.insert((dev, qid), HalQueue::new(capacity));
        Ok(())
    }

    pub fn queue_init(&self, dev: DevId) -> DrvResult<()> {
        let mut devs = self.inited_devs.lock();
        if !devs.insert(dev) {
            return Err(DrvError::RepeatedInit);
        }
        Ok(())
    }

    /// Bounded wait for the queue to exist.
    pub fn queue_attach(&self, dev: DevId, qid: QueueId, timeout: Duration) -> DrvResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.queues.contains_key(&(dev, qid)) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DrvError::QueueNotFound);
            }
            std::thread::sleep(Duration::from_millis(ATTACH_POLL_MS));
        }
    }

    pub fn queue_set_work_mode(&self, dev: DevId, qid: QueueId, mode: WorkMode) -> DrvResult<()> {
        let q = self
            .queues
            .get(&(dev, qid))
            .ok_or(DrvError::QueueNotFound)?;
        *q.work_mode.lock() = mode;
        Ok(())
    }

    /// Subscribes the queue's empty-to-not-empty transitions to `group`.
    pub fn queue_subscribe(&self, dev: DevId, qid: QueueId, group: GroupId) -> DrvResult<()> {
        let q = self
            .queues
            .get(&(dev, qid))
            .ok_or(DrvError::QueueNotFound)?;
        *q.e2ne_group.lock() = Some(group);
        Ok(())
    }

    pub fn queue_unsubscribe(&self, dev: DevId, qid: QueueId) -> DrvResult<()> {
        let q = self
            .queues
            .get(&(dev, qid))
            .ok_or(DrvError::QueueNotFound)?;
        *q.e2ne_group.lock() = None;
        Ok(())
    }

    pub fn queue_sub_f2nf(&self, dev: DevId, qid: QueueId, group: GroupId) -> DrvResult<()> {
        let q = self
            .queues
            .get(&(dev, qid))
            .ok_or(DrvError::QueueNotFound)?;
        *q.f2nf_group.lock() = Some(group);
        Ok(())
    }

    pub fn queue_unsub_f2nf(&self, dev: DevId, qid: QueueId) -> DrvResult<()> {
        let q = self
            .queues
            .get(&(dev, qid))
            .ok_or(DrvError::QueueNotFound)?;
        *q.f2nf_group.lock() = None;
        Ok(())
    }

    pub fn queue_enqueue(&self, dev: DevId, qid: QueueId, msg: FlowMsgRef) -> DrvResult<()> {
        let q = self
            .queues
            .get(&(dev, qid))
            .ok_or(DrvError::QueueNotFound)?;
        let e2ne;
        {
            let mut buf = q.buf.lock();
            if buf.len() >= q.capacity {
                return Err(DrvError::QueueFull);
            }
            let was_empty = buf.is_empty();
            buf.push_back(msg);
            e2ne = if was_empty { *q.e2ne_group.lock() } else { None };
        }
        if let Some(group) = e2ne {
            self.deliver(group, EventInfo::new(EventId::QueueEmptyToNotEmpty, qid));
        }
        Ok(())
    }

    /// Non-blocking dequeue; `QueueEmpty` is the normal empty signal.
    pub fn queue_dequeue(&self, dev: DevId, qid: QueueId) -> DrvResult<FlowMsgRef> {
        let q = self
            .queues
            .get(&(dev, qid))
            .ok_or(DrvError::QueueNotFound)?;
        let msg;
        let f2nf;
        {
            let mut buf = q.buf.lock();
            let was_full = buf.len() >= q.capacity;
            msg = buf.pop_front().ok_or(DrvError::QueueEmpty)?;
            f2nf = if was_full { *q.f2nf_group.lock() } else { None };
        }
        if let Some(group) = f2nf {
            self.deliver(group, EventInfo::new(EventId::QueueFullToNotFull, qid));
        }
        Ok(msg)
    }

    pub fn queue_depth(&self, dev: DevId, qid: QueueId) -> DrvResult<usize> {
        let q = self
            .queues
            .get(&(dev, qid))
            .ok_or(DrvError::QueueNotFound)?;
        let depth = q.buf.lock().len();
        Ok(depth)
    }

    pub fn queue_has_space(&self, dev: DevId, qid: QueueId) -> DrvResult<bool> {
        let q = self
            .queues
            .get(&(dev, qid))
            .ok_or(DrvError::QueueNotFound)?;
        let has = q.buf.lock().len() < q.capacity;
        Ok(has)
    }

    /// Registers `thread` of `group` for the events in `mask`. The broker
    /// delivers by group; the mask records what the group's threads expect.
    pub fn subscribe_event(
        &self,
        _dev: DevId,
        group: GroupId,
        _thread: u32,
        mask: u64,
    ) -> DrvResult<()> {
        let g = self.group_entry(group);
        *g.mask.lock() |= mask;
        Ok(())
    }

    /// Timed blocking wait for the next event of `group`. A zero timeout
    /// polls and reports `NoEvent` when nothing is pending. Waiting on a
    /// group nobody has touched yet simply blocks until the timeout.
    pub fn wait_event(
        &self,
        _dev: DevId,
        group: GroupId,
        _thread: u32,
        timeout: Duration,
    ) -> DrvResult<EventInfo> {
        let rx = {
            let g = self.group_entry(group);
            g.rx.clone()
        };
        if timeout.is_zero() {
            return match rx.try_recv() {
                Ok(ev) => Ok(ev),
                Err(TryRecvError::Empty) => Err(DrvError::NoEvent),
                Err(TryRecvError::Disconnected) => {
                    Err(DrvError::Internal("event group closed".into()))
                }
            };
        }
        match rx.recv_timeout(timeout) {
            Ok(ev) => Ok(ev),
            Err(RecvTimeoutError::Timeout) => Err(DrvError::WaitTimeout),
            Err(RecvTimeoutError::Disconnected) => {
                Err(DrvError::Internal("event group closed".into()))
            }
        }
    }

    pub fn submit_event(&self, _dev: DevId, group: GroupId, event: EventInfo) -> DrvResult<()> {
        self.deliver(group, event);
        Ok(())
    }

    fn deliver(&self, group: GroupId, event: EventInfo) {
        let g = self.group_entry(group);
        debug!(
            "deliver event {:?} sub={} to group {}",
            event.event_id, event.subevent_id, group
        );
        // unbounded channel: send only fails when every receiver is gone,
        // which happens during teardown and is safe to ignore
        let _ = g.tx.send(event);
    }

    fn group_entry(&self, group: GroupId) -> dashmap::mapref::one::Ref<'_, GroupId, EventGroup> {
        if let Some(g) = self.groups.get(&group) {
            return g;
        }
        let (tx, rx) = unbounded();
        self.groups.entry(group).or_insert(EventGroup {
            tx,
            rx,
            mask: Mutex::new(0),
        });
        self.groups.get(&group).expect("group just inserted")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::FlowMsg;

    fn msg() -> FlowMsgRef {
        FlowMsg::empty().into_ref()
    }

    #[test]
    fn queue_init_is_repeated_on_second_call() {
        let hal = Hal::new();
        assert!(hal.queue_init(0).is_ok());
        assert_eq!(hal.queue_init(0), Err(DrvError::RepeatedInit));
    }

    #[test]
    fn e2ne_fires_only_on_transition() {
        let hal = Hal::new();
        hal.queue_create(0, 1, 4).unwrap();
        hal.queue_subscribe(0, 1, 9).unwrap();
        hal.subscribe_event(0, 9, 0, EventId::QueueEmptyToNotEmpty.mask())
            .unwrap();

        hal.queue_enqueue(0, 1, msg()).unwrap();
        hal.queue_enqueue(0, 1, msg()).unwrap();

        let ev = hal.wait_event(0, 9, 0, Duration::from_millis(50)).unwrap();
        assert_eq!(ev.event_id, EventId::QueueEmptyToNotEmpty);
        assert_eq!(ev.subevent_id, 1);
        // second enqueue was not a transition
        assert_eq!(
            hal.wait_event(0, 9, 0, Duration::from_millis(20)),
            Err(DrvError::WaitTimeout)
        );
    }

    #[test]
    fn f2nf_fires_when_full_queue_drains() {
        let hal = Hal::new();
        hal.queue_create(0, 2, 1).unwrap();
        hal.queue_sub_f2nf(0, 2, 7).unwrap();
        hal.subscribe_event(0, 7, 0, EventId::QueueFullToNotFull.mask())
            .unwrap();

        hal.queue_enqueue(0, 2, msg()).unwrap();
        assert_eq!(hal.queue_enqueue(0, 2, msg()), Err(DrvError::QueueFull));
        hal.queue_dequeue(0, 2).unwrap();

        let ev = hal.wait_event(0, 7, 0, Duration::from_millis(50)).unwrap();
        assert_eq!(ev.event_id, EventId::QueueFullToNotFull);
        assert_eq!(ev.subevent_id, 2);
    }

    #[test]
    fn dequeue_empty_is_control_signal() {
        let hal = Hal::new();
        hal.queue_create(0, 3, 2).unwrap();
        assert_eq!(hal.queue_dequeue(0, 3).unwrap_err(), DrvError::QueueEmpty);
    }

    #[test]
    fn subscribe_unsubscribe_roundtrip_is_idempotent() {
        let hal = Hal::new();
        hal.queue_create(0, 4, 2).unwrap();
        for _ in 0..5 {
            hal.queue_subscribe(0, 4, 1).unwrap();
            hal.queue_unsubscribe(0, 4).unwrap();
        }
        // no subscriber: enqueue raises nothing, queue still works
        hal.queue_enqueue(0, 4, msg()).unwrap();
        assert_eq!(hal.queue_depth(0, 4).unwrap(), 1);
        hal.queue_dequeue(0, 4).unwrap();
        assert_eq!(hal.queue_depth(0, 4).unwrap(), 0);
    }

    #[test]
    fn attach_times_out_for_missing_queue() {
        let hal = Hal::new();
        assert_eq!(
            hal.queue_attach(0, 99, Duration::from_millis(30)),
            Err(DrvError::QueueNotFound)
        );
    }

    #[test]
    fn events_are_delivered_to_one_waiter() {
        let hal = Hal::new();
        hal.subscribe_event(0, 5, 0, EventId::FlowFuncExecute.mask())
            .unwrap();
        hal.submit_event(0, 5, EventInfo::new(EventId::FlowFuncExecute, 3))
            .unwrap();
        let ev = hal.wait_event(0, 5, 0, Duration::from_millis(50)).unwrap();
        assert_eq!(ev.subevent_id, 3);
        assert_eq!(
            hal.wait_event(0, 5, 1, Duration::from_millis(10)),
            Err(DrvError::WaitTimeout)
        );
    }
}
