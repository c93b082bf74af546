//! Event submission handle shared by the executor and its processors.

use crate::driver::{DevId, Driver, EventInfo, GroupId};
use crate::error::FlowResult;

/// Scheduling-group ids are configuration; these are the defaults used when
/// the deployer does not override them.
pub const MAIN_GROUP: GroupId = 0;
pub const WORKER_GROUP: GroupId = 1;
pub const INVOKE_MODEL_GROUP: GroupId = 2;
pub const FLOW_MSG_GROUP: GroupId = 3;

#[derive(Clone)]
pub struct EventBus {
    drv: Driver,
    dev: DevId,
    main_group: GroupId,
    worker_group: GroupId,
}

impl EventBus {
    pub fn new(drv: Driver, dev: DevId, main_group: GroupId, worker_group: GroupId) -> Self {
        Self {
            drv,
            dev,
            main_group,
            worker_group,
        }
    }

    pub fn drv(&self) -> &Driver {
        &self.drv
    }

    pub fn dev(&self) -> DevId {
        self.dev
    }

    pub fn main_group(&self) -> GroupId {
        self.main_group
    }

    pub fn worker_group(&self) -> GroupId {
        self.worker_group
    }

    /// Main-thread events: lifecycle, acks, status.
    pub fn submit_to_main(&self, event: EventInfo) -> FlowResult<()> {
        self.drv.submit_event(self.dev, self.main_group, event)
    }

    /// Worker events: flow-function execution.
    pub fn submit_to_worker(&self, event: EventInfo) -> FlowResult<()> {
        self.drv.submit_event(self.dev, self.worker_group, event)
    }
}
