//! Queue wrapper: binds one (device-id, queue-id) to the façade.
//!
//! Proxy queues live on another device; their empty/full transitions are
//! handled there, so the executor never subscribes events for them and only
//! reads/writes through the wrapper.

use std::time::Duration;

use crate::driver::facade::{Driver, ATTACH_TIMEOUT, PROXY_ATTACH_TIMEOUT};
use crate::driver::hal::GroupId;
use crate::error::FlowResult;
use crate::manifest::QueueDevInfo;
use crate::msg::FlowMsgRef;

#[derive(Clone)]
pub struct QueueWrapper {
    info: QueueDevInfo,
    drv: Driver,
}

impl QueueWrapper {
    pub fn new(info: QueueDevInfo, drv: Driver) -> Self {
        Self { info, drv }
    }

    pub fn info(&self) -> &QueueDevInfo {
        &self.info
    }

    pub fn queue_id(&self) -> u32 {
        self.info.queue_id
    }

    pub fn device_id(&self) -> u32 {
        self.info.device_id
    }

    pub fn is_proxy(&self) -> bool {
        self.info.is_proxy
    }

    pub fn attach(&self) -> FlowResult<()> {
        let timeout = if self.info.is_proxy {
            PROXY_ATTACH_TIMEOUT
        } else {
            ATTACH_TIMEOUT
        };
        self.attach_with_timeout(timeout)
    }

    pub fn attach_with_timeout(&self, timeout: Duration) -> FlowResult<()> {
        self.drv
            .queue_attach(self.info.device_id, self.info.queue_id, timeout)
    }

    /// Subscribes E2NE events to `group` and configures pull mode. Proxy
    /// queues are skipped: their events are not delivered locally.
    pub fn subscribe(&self, group: GroupId) -> FlowResult<()> {
        if self.info.is_proxy {
            return Ok(());
        }
        self.drv
            .queue_subscribe(self.info.device_id, self.info.queue_id, group)
    }

    pub fn unsubscribe(&self) -> FlowResult<()> {
        if self.info.is_proxy {
            return Ok(());
        }
        self.drv
            .queue_unsubscribe(self.info.device_id, self.info.queue_id)
    }

    pub fn sub_full_to_not_full(&self, group: GroupId) -> FlowResult<()> {
        if self.info.is_proxy {
            return Ok(());
        }
        self.drv
            .queue_sub_f2nf(self.info.device_id, self.info.queue_id, group)
    }

    pub fn unsub_full_to_not_full(&self) -> FlowResult<()> {
        if self.info.is_proxy {
            return Ok(());
        }
        self.drv
            .queue_unsub_f2nf(self.info.device_id, self.info.queue_id)
    }

    pub fn enqueue(&self, msg: FlowMsgRef) -> FlowResult<()> {
        self.drv
            .queue_enqueue(self.info.device_id, self.info.queue_id, msg)
    }

    pub fn dequeue(&self) -> FlowResult<FlowMsgRef> {
        self.drv.queue_dequeue(self.info.device_id, self.info.queue_id)
    }

    pub fn dequeue_with_timeout(&self, timeout: Duration) -> FlowResult<FlowMsgRef> {
        self.drv
            .queue_dequeue_timeout(self.info.device_id, self.info.queue_id, timeout)
    }

    pub fn depth(&self) -> FlowResult<usize> {
        self.drv.queue_depth(self.info.device_id, self.info.queue_id)
    }

    pub fn has_space(&self) -> FlowResult<bool> {
        self.drv
            .queue_has_space(self.info.device_id, self.info.queue_id)
    }

    pub fn is_empty(&self) -> bool {
        self.depth().map(|d| d == 0).unwrap_or(true)
    }
}
