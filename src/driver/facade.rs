//! Uniform error-code façade over the HAL.
//!
//! Callers never touch raw driver codes: every `DrvError` is mapped into the
//! executor's error set here. `queue_init` returning "already initialised"
//! is success by contract.

use std::sync::Arc;
use std::time::Duration;

use crate::driver::hal::{DevId, DrvError, EventInfo, GroupId, Hal, QueueId, WorkMode};
use crate::error::{FlowError, FlowResult};
use crate::msg::FlowMsgRef;

/// Default attach wait; proxy queues are granted a longer window.
pub const ATTACH_TIMEOUT: Duration = Duration::from_secs(10);
pub const PROXY_ATTACH_TIMEOUT: Duration = Duration::from_secs(60);

fn map_err(err: DrvError) -> FlowError {
    match err {
        DrvError::QueueEmpty => FlowError::QueueEmpty,
        DrvError::QueueFull | DrvError::QueueNotFound => {
            FlowError::QueueError(format!("{err:?}"))
        }
        DrvError::RepeatedInit
        | DrvError::WaitTimeout
        | DrvError::NoEvent
        | DrvError::GroupNotFound => FlowError::DrvError(format!("{err:?}")),
        DrvError::Internal(msg) => FlowError::Internal(msg),
    }
}

/// Thin wrapper owning the shared HAL handle.
#[derive(Clone)]
pub struct Driver {
    hal: Arc<Hal>,
}

impl Driver {
    pub fn new(hal: Arc<Hal>) -> Self {
        Self { hal }
    }

    pub fn hal(&self) -> &Arc<Hal> {
        &self.hal
    }

    pub fn queue_create(&self, dev: DevId, qid: QueueId, capacity: usize) -> FlowResult<()> {
        match self.hal.queue_create(dev, qid, capacity) {
            Ok(()) | Err(DrvError::RepeatedInit) => Ok(()),
            Err(e) => Err(map_err(e)),
        }
    }

    /// Idempotent: repeated initialisation of a device is success.
    pub fn queue_init(&self, dev: DevId) -> FlowResult<()> {
        match self.hal.queue_init(dev) {
            Ok(()) | Err(DrvError::RepeatedInit) => Ok(()),
            Err(e) => Err(map_err(e)),
        }
    }

    pub fn queue_attach(&self, dev: DevId, qid: QueueId, timeout: Duration) -> FlowResult<()> {
        self.hal.queue_attach(dev, qid, timeout).map_err(map_err)
    }

    /// Subscribes E2NE events and configures the queue to pull mode.
    pub fn queue_subscribe(&self, dev: DevId, qid: QueueId, group: GroupId) -> FlowResult<()> {
        self.hal
            .queue_set_work_mode(dev, qid, WorkMode::Pull)
            .map_err(map_err)?;
        self.hal.queue_subscribe(dev, qid, group).map_err(map_err)
    }

    pub fn queue_unsubscribe(&self, dev: DevId, qid: QueueId) -> FlowResult<()> {
        self.hal.queue_unsubscribe(dev, qid).map_err(map_err)
    }

    pub fn queue_sub_f2nf(&self, dev: DevId, qid: QueueId, group: GroupId) -> FlowResult<()> {
        self.hal.queue_sub_f2nf(dev, qid, group).map_err(map_err)
    }

    pub fn queue_unsub_f2nf(&self, dev: DevId, qid: QueueId) -> FlowResult<()> {
        self.hal.queue_unsub_f2nf(dev, qid).map_err(map_err)
    }

    pub fn queue_enqueue(&self, dev: DevId, qid: QueueId, msg: FlowMsgRef) -> FlowResult<()> {
        match self.hal.queue_enqueue(dev, qid, msg) {
            Ok(()) => Ok(()),
            Err(DrvError::QueueFull) => Err(FlowError::QueueError("queue full".into())),
            Err(e) => Err(map_err(e)),
        }
    }

    /// True when the enqueue failed because the queue is at capacity.
    pub fn queue_is_full_error(err: &FlowError) -> bool {
        matches!(err, FlowError::QueueError(msg) if msg == "queue full")
    }

    pub fn queue_dequeue(&self, dev: DevId, qid: QueueId) -> FlowResult<FlowMsgRef> {
        self.hal.queue_dequeue(dev, qid).map_err(map_err)
    }

    /// Polling dequeue with deadline; used only on the bootstrap notify path.
    pub fn queue_dequeue_timeout(
        &self,
        dev: DevId,
        qid: QueueId,
        timeout: Duration,
    ) -> FlowResult<FlowMsgRef> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match self.hal.queue_dequeue(dev, qid) {
                Ok(msg) => return Ok(msg),
                Err(DrvError::QueueEmpty) => {
                    if std::time::Instant::now() >= deadline {
                        return Err(FlowError::QueueEmpty);
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(map_err(e)),
            }
        }
    }

    pub fn queue_depth(&self, dev: DevId, qid: QueueId) -> FlowResult<usize> {
        self.hal.queue_depth(dev, qid).map_err(map_err)
    }

    pub fn queue_has_space(&self, dev: DevId, qid: QueueId) -> FlowResult<bool> {
        self.hal.queue_has_space(dev, qid).map_err(map_err)
    }

    pub fn subscribe_event(
        &self,
        dev: DevId,
        group: GroupId,
        thread: u32,
        mask: u64,
    ) -> FlowResult<()> {
        self.hal
            .subscribe_event(dev, group, thread, mask)
            .map_err(map_err)
    }

    /// Timed event wait. Timeouts come back as `Err(DrvError..)` from the
    /// HAL; the executor distinguishes them via `is_wait_timeout`.
    pub fn wait_event(
        &self,
        dev: DevId,
        group: GroupId,
        thread: u32,
        timeout: Duration,
    ) -> Result<EventInfo, DrvError> {
        self.hal.wait_event(dev, group, thread, timeout)
    }

    pub fn submit_event(&self, dev: DevId, group: GroupId, event: EventInfo) -> FlowResult<()> {
        self.hal.submit_event(dev, group, event).map_err(map_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::FlowMsg;

    #[test]
    fn queue_init_is_idempotent() {
        let drv = Driver::new(Arc::new(Hal::new()));
        assert!(drv.queue_init(3).is_ok());
        assert!(drv.queue_init(3).is_ok());
    }

    #[test]
    fn empty_maps_to_control_signal() {
        let drv = Driver::new(Arc::new(Hal::new()));
        drv.queue_create(0, 1, 2).unwrap();
        assert_eq!(drv.queue_dequeue(0, 1).unwrap_err(), FlowError::QueueEmpty);
    }

    #[test]
    fn full_error_is_detectable() {
        let drv = Driver::new(Arc::new(Hal::new()));
        drv.queue_create(0, 1, 1).unwrap();
        drv.queue_enqueue(0, 1, FlowMsg::empty().into_ref()).unwrap();
        let err = drv
            .queue_enqueue(0, 1, FlowMsg::empty().into_ref())
            .unwrap_err();
        assert!(Driver::queue_is_full_error(&err));
    }
}
