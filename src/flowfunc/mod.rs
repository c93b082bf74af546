//! Operator surface: the `FlowFunc` capability set, the execution context
//! handed to operators, and the registry mapping type names to factories.
//!
//! An operator sees the world only through `FuncContext`: typed attributes
//! from the manifest, tensor allocation, `set_output`, the timer service and
//! the dump-step filter. The processor injects the output sink, which lets
//! tests run operators against a collector without any queues.

pub mod count_batch;
pub mod registry;
pub mod time_batch;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::dump::DumpStepFilter;
use crate::error::{FlowError, FlowResult};
use crate::manifest::AttrValue;
use crate::msg::{DataType, FlowMsg, FlowMsgRef, Tensor};
use crate::timer::TimerService;

pub use registry::FlowFuncRegistry;

/// Where published outputs go. Implemented by the processor's output ports
/// and by test collectors.
pub trait OutputSink: Send + Sync {
    fn output_num(&self) -> usize;
    fn set_output(&self, index: usize, msg: FlowMsgRef) -> FlowResult<()>;
}

/// User- or system-supplied tensor processing unit.
pub trait FlowFunc: Send {
    fn init(&mut self, ctx: Arc<FuncContext>) -> FlowResult<()>;

    /// Processes one aligned row of inputs. Errors inside `proc` are
    /// reported downstream as error-tagged messages, never thrown out of
    /// the processor.
    fn proc(&mut self, inputs: &[FlowMsgRef]) -> FlowResult<()>;

    /// Clears internal state in place during recover. `false` means the
    /// operator cannot, and the processor re-instantiates it instead.
    fn reset_state(&mut self) -> bool {
        false
    }
}

/// Execution context shared between a processor and its operator.
pub struct FuncContext {
    attrs: BTreeMap<String, AttrValue>,
    sink: Arc<dyn OutputSink>,
    timers: Arc<TimerService>,
    dump_filter: Arc<DumpStepFilter>,
}

impl FuncContext {
    pub fn new(
        attrs: BTreeMap<String, AttrValue>,
        sink: Arc<dyn OutputSink>,
        timers: Arc<TimerService>,
        dump_filter: Arc<DumpStepFilter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            attrs,
            sink,
            timers,
            dump_filter,
        })
    }

    pub fn attr_i64(&self, name: &str) -> FlowResult<i64> {
        self.attrs
            .get(name)
            .and_then(AttrValue::as_i64)
            .ok_or_else(|| FlowError::ParamInvalid(format!("missing int attr [{name}]")))
    }

    pub fn attr_bool(&self, name: &str) -> FlowResult<bool> {
        self.attrs
            .get(name)
            .and_then(AttrValue::as_bool)
            .ok_or_else(|| FlowError::ParamInvalid(format!("missing bool attr [{name}]")))
    }

    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).and_then(AttrValue::as_str)
    }

    pub fn output_num(&self) -> usize {
        self.sink.output_num()
    }

    pub fn set_output(&self, index: usize, msg: FlowMsgRef) -> FlowResult<()> {
        self.sink.set_output(index, msg)
    }

    /// Fresh zero-filled tensor message of the given shape.
    pub fn alloc_tensor_msg(&self, shape: Vec<i64>, dtype: DataType) -> FlowResult<FlowMsg> {
        Ok(FlowMsg::with_tensor(Tensor::zeroed(shape, dtype)?))
    }

    pub fn timers(&self) -> &Arc<TimerService> {
        &self.timers
    }

    pub fn now_us(&self) -> u64 {
        self.timers.now_us()
    }

    pub fn dump_filter(&self) -> &DumpStepFilter {
        &self.dump_filter
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Collector sink and timer pump used by the batcher unit tests.

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread::JoinHandle;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::driver::{Driver, EventId, Hal};

    pub struct CollectSink {
        outputs: usize,
        pub published: Mutex<Vec<(usize, FlowMsgRef)>>,
    }

    impl CollectSink {
        pub fn new(outputs: usize) -> Arc<Self> {
            Arc::new(Self {
                outputs,
                published: Mutex::new(Vec::new()),
            })
        }

        pub fn take(&self) -> Vec<(usize, FlowMsgRef)> {
            std::mem::take(&mut *self.published.lock())
        }
    }

    impl OutputSink for CollectSink {
        fn output_num(&self) -> usize {
            self.outputs
        }

        fn set_output(&self, index: usize, msg: FlowMsgRef) -> FlowResult<()> {
            self.published.lock().push((index, msg));
            Ok(())
        }
    }

    /// Context plus a pump thread standing in for the executor's worker
    /// loop: it drains timer events and runs their callbacks.
    pub struct TestRig {
        pub ctx: Arc<FuncContext>,
        pub timers: Arc<TimerService>,
        stop: Arc<AtomicBool>,
        pump: Option<JoinHandle<()>>,
    }

    impl TestRig {
        pub fn new(attrs: BTreeMap<String, AttrValue>, sink: Arc<CollectSink>) -> Self {
            let hal = Arc::new(Hal::new());
            let drv = Driver::new(hal.clone());
            let timers = TimerService::new(drv, 0, 99);
            hal.subscribe_event(0, 99, 0, EventId::Timer.mask())
                .expect("subscribe pump group");
            let ctx = FuncContext::new(
                attrs,
                sink,
                timers.clone(),
                Arc::new(DumpStepFilter::default()),
            );
            let stop = Arc::new(AtomicBool::new(false));
            let pump_stop = stop.clone();
            let pump_timers = timers.clone();
            let pump = std::thread::spawn(move || {
                while !pump_stop.load(Ordering::SeqCst) {
                    if let Ok(ev) = hal.wait_event(0, 99, 0, Duration::from_millis(10)) {
                        if ev.event_id == EventId::Timer {
                            pump_timers.exec_callback(ev.subevent_id);
                        }
                    }
                }
            });
            Self {
                ctx,
                timers,
                stop,
                pump: Some(pump),
            }
        }
    }

    impl Drop for TestRig {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::SeqCst);
            if let Some(h) = self.pump.take() {
                let _ = h.join();
            }
            self.timers.finalize();
        }
    }
}
