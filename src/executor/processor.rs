//! Flow-function processor: the per-operator adapter.
//!
//! One processor drives one operator instance. It owns the input queue
//! bindings and an output-port set, enforces input alignment, runs the
//! operator's `proc`, and reports suspend/recover/exception outcomes back
//! to the executor through the event bus. Exactly one thread runs
//! `schedule` for a given processor at any instant; the schedule lock
//! enforces that when extra execute events race in.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::driver::facade::Driver;
use crate::driver::hal::{EventId, EventInfo, EventPayload};
use crate::driver::queue::QueueWrapper;
use crate::dump::DumpStepFilter;
use crate::error::{FlowError, FlowResult, InitOutcome, CODE_SUCCESS};
use crate::executor::bus::EventBus;
use crate::flowfunc::{FlowFunc, FlowFuncRegistry, FuncContext, OutputSink};
use crate::manifest::{AlignPolicy, AttrValue, QueueDevInfo};
use crate::metrics::{MetricsSnapshot, ProcessorMetrics};
use crate::msg::{FlowMsg, FlowMsgRef};
use crate::timer::TimerService;
use crate::wire::ExceptionNotify;

/// An exception recorded against this processor, waiting to be forwarded on
/// the status output queue.
#[derive(Debug, Clone)]
pub struct ExceptionRecord {
    pub trans_id: u64,
    pub user_context_id: u64,
    pub exception_code: i32,
    pub context: Vec<u8>,
    pub forwarded: bool,
}

/// Output side of a processor. Shared with the operator context so
/// `set_output` works from both `proc` and batcher timer callbacks.
pub struct OutputPorts {
    queues: Vec<QueueWrapper>,
    /// Outputs that hit a full queue, kept in publish order.
    pending: Mutex<VecDeque<(usize, FlowMsgRef)>>,
    /// Output indices published during the current proc invocation.
    published_this_proc: AtomicUsize,
    metrics: Arc<ProcessorMetrics>,
}

impl OutputPorts {
    fn new(queues: Vec<QueueWrapper>, metrics: Arc<ProcessorMetrics>) -> Arc<Self> {
        Arc::new(Self {
            queues,
            pending: Mutex::new(VecDeque::new()),
            published_this_proc: AtomicUsize::new(0),
            metrics,
        })
    }

    fn begin_proc(&self) {
        self.published_this_proc.store(0, Ordering::Relaxed);
    }

    fn published(&self) -> usize {
        self.published_this_proc.load(Ordering::Relaxed)
    }

    /// Retries queued-up outputs; true when everything went through.
    fn flush_pending(&self) -> FlowResult<bool> {
        let mut pending = self.pending.lock();
        while let Some((index, msg)) = pending.front() {
            match self.queues[*index].enqueue(msg.clone()) {
                Ok(()) => {
                    self.metrics.record_produced();
                    pending.pop_front();
                }
                Err(e) if Driver::queue_is_full_error(&e) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn blocked(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// Every output queue can take at least one message.
    fn has_room(&self) -> bool {
        if self.blocked() {
            return false;
        }
        self.queues
            .iter()
            .all(|q| q.has_space().unwrap_or(false))
    }

    pub fn queue_infos(&self) -> Vec<QueueDevInfo> {
        self.queues.iter().map(|q| q.info().clone()).collect()
    }
}

impl OutputSink for OutputPorts {
    fn output_num(&self) -> usize {
        self.queues.len()
    }

    fn set_output(&self, index: usize, msg: FlowMsgRef) -> FlowResult<()> {
        if index >= self.queues.len() {
            return Err(FlowError::ParamInvalid(format!(
                "output index {index} out of range [0, {})",
                self.queues.len()
            )));
        }
        self.published_this_proc.store(index + 1, Ordering::Relaxed);
        {
            let mut pending = self.pending.lock();
            if !pending.is_empty() {
                // keep publish order: everything after a full hit queues up
                pending.push_back((index, msg));
                return Ok(());
            }
        }
        match self.queues[index].enqueue(msg.clone()) {
            Ok(()) => {
                self.metrics.record_produced();
                Ok(())
            }
            Err(e) if Driver::queue_is_full_error(&e) => {
                debug!("output queue {index} full, buffering message");
                self.pending.lock().push_back((index, msg));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

pub struct ProcessorParams {
    pub idx: usize,
    pub func_name: String,
    pub instance_name: String,
    pub scope: String,
    pub model_uuid: u32,
    pub need_report_status: bool,
    pub input_queue_infos: Vec<QueueDevInfo>,
    pub output_queue_infos: Vec<QueueDevInfo>,
    pub status_queue_info: Option<QueueDevInfo>,
    pub align: AlignPolicy,
    pub attrs: BTreeMap<String, AttrValue>,
}

pub struct FlowFuncProcessor {
    idx: usize,
    func_name: String,
    instance_name: String,
    scope: String,
    model_uuid: u32,
    need_report_status: bool,
    align: AlignPolicy,
    attrs: BTreeMap<String, AttrValue>,

    input_queues: Vec<QueueWrapper>,
    ports: Arc<OutputPorts>,
    status_queue: Option<QueueWrapper>,

    registry: Arc<FlowFuncRegistry>,
    timers: Arc<TimerService>,
    dump_filter: Arc<DumpStepFilter>,
    bus: EventBus,
    metrics: Arc<ProcessorMetrics>,

    operator: Mutex<Option<Box<dyn FlowFunc>>>,
    sched_lock: Mutex<()>,
    align_cache: Mutex<Vec<VecDeque<FlowMsgRef>>>,
    exceptions: Mutex<Vec<ExceptionRecord>>,

    clear_and_suspend: AtomicBool,
    clear_and_recover: AtomicBool,
    suspended: AtomicBool,
    running_ok: AtomicBool,
    /// Execute events submitted but not yet consumed; guards against both
    /// event storms and lost wake-ups.
    sched_inflight: AtomicU32,
}

impl FlowFuncProcessor {
    pub fn new(
        params: ProcessorParams,
        drv: Driver,
        registry: Arc<FlowFuncRegistry>,
        timers: Arc<TimerService>,
        dump_filter: Arc<DumpStepFilter>,
        bus: EventBus,
    ) -> Arc<Self> {
        let metrics = Arc::new(ProcessorMetrics::new(params.input_queue_infos.len()));
        let input_queues = params
            .input_queue_infos
            .iter()
            .map(|info| QueueWrapper::new(info.clone(), drv.clone()))
            .collect::<Vec<_>>();
        let output_queues = params
            .output_queue_infos
            .iter()
            .map(|info| QueueWrapper::new(info.clone(), drv.clone()))
            .collect::<Vec<_>>();
        let status_queue = params
            .status_queue_info
            .map(|info| QueueWrapper::new(info, drv.clone()));
        let align_cache = (0..input_queues.len()).map(|_| VecDeque::new()).collect();
        Arc::new(Self {
            idx: params.idx,
            func_name: params.func_name,
            instance_name: params.instance_name,
            scope: params.scope,
            model_uuid: params.model_uuid,
            need_report_status: params.need_report_status,
            align: params.align,
            attrs: params.attrs,
            input_queues,
            ports: OutputPorts::new(output_queues, metrics.clone()),
            status_queue,
            registry,
            timers,
            dump_filter,
            bus,
            metrics,
            operator: Mutex::new(None),
            sched_lock: Mutex::new(()),
            align_cache: Mutex::new(align_cache),
            exceptions: Mutex::new(Vec::new()),
            clear_and_suspend: AtomicBool::new(false),
            clear_and_recover: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            running_ok: AtomicBool::new(true),
            sched_inflight: AtomicU32::new(0),
        })
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn flow_func_info(&self) -> String {
        format!("{}/{}[{}]", self.instance_name, self.func_name, self.idx)
    }

    pub fn model_uuid(&self) -> u32 {
        self.model_uuid
    }

    pub fn need_report_status(&self) -> bool {
        self.need_report_status
    }

    pub fn input_queue_infos(&self) -> Vec<QueueDevInfo> {
        self.input_queues.iter().map(|q| q.info().clone()).collect()
    }

    pub fn input_queues(&self) -> &[QueueWrapper] {
        &self.input_queues
    }

    pub fn output_queue_infos(&self) -> Vec<QueueDevInfo> {
        self.ports.queue_infos()
    }

    pub fn status_queue_info(&self) -> Option<QueueDevInfo> {
        self.status_queue.as_ref().map(|q| q.info().clone())
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn consumed_total(&self) -> u64 {
        self.metrics.consumed_total()
    }

    /// Attaches every bound queue. Queue subscription stays with the
    /// executor, which owns the scheduling groups.
    pub fn init(&self) -> FlowResult<()> {
        for q in &self.input_queues {
            q.attach()?;
        }
        for q in &self.ports.queues {
            q.attach()?;
        }
        if let Some(status) = &self.status_queue {
            status.attach()?;
        }
        info!("processor {} attached queues", self.flow_func_info());
        Ok(())
    }

    /// Lazily instantiates the operator and runs its user `init`.
    pub fn init_flow_func(&self) -> InitOutcome {
        let mut slot = self.operator.lock();
        if slot.is_some() {
            return InitOutcome::Done;
        }
        let mut operator = match self.registry.create(&self.func_name) {
            Ok(op) => op,
            Err(e) => return InitOutcome::Fatal(e),
        };
        let ctx = FuncContext::new(
            self.attrs.clone(),
            self.ports.clone() as Arc<dyn OutputSink>,
            self.timers.clone(),
            self.dump_filter.clone(),
        );
        match operator.init(ctx) {
            Ok(()) => {
                *slot = Some(operator);
                info!("flow func {} initialised", self.flow_func_info());
                InitOutcome::Done
            }
            Err(FlowError::InitAgain) => InitOutcome::RetryLater,
            Err(e) => {
                error!("flow func {} init failed: {e}", self.flow_func_info());
                InitOutcome::Fatal(e)
            }
        }
    }

    pub fn set_clear_and_suspend(&self) {
        self.clear_and_suspend.store(true, Ordering::SeqCst);
    }

    pub fn set_clear_and_recover(&self) {
        self.clear_and_recover.store(true, Ordering::SeqCst);
    }

    pub fn is_ok(&self) -> bool {
        self.running_ok.load(Ordering::SeqCst)
    }

    fn suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn note_schedule_submitted(&self) {
        self.sched_inflight.fetch_add(1, Ordering::SeqCst);
    }

    /// The hot path. Returns true when another execute event should be
    /// dispatched for this processor.
    pub fn schedule(&self, worker: u32) -> bool {
        let _guard = self.sched_lock.lock();
        let _ = self
            .sched_inflight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
        self.metrics.record_schedule();
        debug!("schedule {} on worker {worker}", self.flow_func_info());

        if self.clear_and_suspend.swap(false, Ordering::SeqCst) {
            self.drain_for_suspend();
            return false;
        }
        if self.clear_and_recover.swap(false, Ordering::SeqCst) {
            self.recover_operator();
        }
        self.forward_pending_exceptions();
        if self.suspended() {
            return false;
        }

        match self.ports.flush_pending() {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                error!("{} failed to flush outputs: {e}", self.flow_func_info());
                self.running_ok.store(false, Ordering::SeqCst);
                return false;
            }
        }
        if !self.ports.has_room() {
            return false;
        }

        let row = match self.collect_aligned_row() {
            Ok(Some(row)) => row,
            Ok(None) => return false,
            Err(e) => {
                error!("{} input collection failed: {e}", self.flow_func_info());
                self.running_ok.store(false, Ordering::SeqCst);
                return false;
            }
        };

        // lazy operator path: recover may have released the instance
        {
            let has_op = self.operator.lock().is_some();
            if !has_op {
                match self.init_flow_func() {
                    InitOutcome::Done => {}
                    InitOutcome::RetryLater => {
                        self.push_back_row(row);
                        let _ = self.bus.submit_to_main(EventInfo::new(
                            EventId::SingleFlowFuncInit,
                            self.idx as u32,
                        ));
                        return false;
                    }
                    InitOutcome::Fatal(e) => {
                        error!("{} re-init failed: {e}", self.flow_func_info());
                        self.running_ok.store(false, Ordering::SeqCst);
                        return false;
                    }
                }
            }
        }

        self.ports.begin_proc();
        let proc_result = {
            let mut slot = self.operator.lock();
            match slot.as_mut() {
                Some(op) => op.proc(&row),
                None => Err(FlowError::Internal("operator vanished".into())),
            }
        };
        if let Err(e) = proc_result {
            warn!("{} proc returned error: {e}", self.flow_func_info());
            self.metrics.record_proc_error();
            self.abnormal_proc(e.code());
        }

        self.more_work_ready()
    }

    /// Suspend drain: push pending outputs where possible, drop the aligned
    /// row cache, ack the executor.
    fn drain_for_suspend(&self) {
        let _ = self.ports.flush_pending();
        self.align_cache.lock().iter_mut().for_each(VecDeque::clear);
        self.suspended.store(true, Ordering::SeqCst);
        info!("{} suspended", self.flow_func_info());
        let _ = self.bus.submit_to_main(EventInfo::with_payload(
            EventId::SuspendFinished,
            self.idx as u32,
            EventPayload::Code(CODE_SUCCESS),
        ));
    }

    /// Recover: reset the operator in place, or drop it so the next
    /// schedule re-instantiates.
    fn recover_operator(&self) {
        {
            let mut slot = self.operator.lock();
            match slot.as_mut() {
                Some(op) => {
                    if op.reset_state() {
                        debug!("{} operator state reset in place", self.flow_func_info());
                    } else {
                        info!(
                            "{} operator declined reset, releasing instance",
                            self.flow_func_info()
                        );
                        *slot = None;
                    }
                }
                None => {}
            }
        }
        self.suspended.store(false, Ordering::SeqCst);
        info!("{} recovered", self.flow_func_info());
        let _ = self.bus.submit_to_main(EventInfo::with_payload(
            EventId::RecoverFinished,
            self.idx as u32,
            EventPayload::Code(CODE_SUCCESS),
        ));
    }

    /// Drops the live operator instance; used when a suspend-wide reset
    /// fell back to full re-instantiation.
    pub fn release_operator(&self) {
        *self.operator.lock() = None;
    }

    /// Asks the live operator to clear state in place; true on success or
    /// when no instance exists.
    pub fn reset_operator_state(&self) -> bool {
        match self.operator.lock().as_mut() {
            Some(op) => op.reset_state(),
            None => true,
        }
    }

    fn forward_pending_exceptions(&self) {
        let mut exceptions = self.exceptions.lock();
        for record in exceptions.iter_mut().filter(|r| !r.forwarded) {
            record.forwarded = true;
            let _ = self.bus.submit_to_main(EventInfo::with_payload(
                EventId::RaiseException,
                self.idx as u32,
                EventPayload::TransId(record.trans_id),
            ));
        }
    }

    /// Pulls one message per input into the alignment cache and pops a full
    /// row when every input has one.
    fn collect_aligned_row(&self) -> FlowResult<Option<Vec<FlowMsgRef>>> {
        let mut cache = self.align_cache.lock();
        let cap = match self.align {
            AlignPolicy::Strict | AlignPolicy::DropWhenMisaligned => 1,
            AlignPolicy::CacheUpTo { max } => max.max(1) as usize,
        };
        for (i, q) in self.input_queues.iter().enumerate() {
            while cache[i].len() < cap {
                match q.dequeue() {
                    Ok(msg) => {
                        self.metrics.record_consumed(i);
                        cache[i].push_back(msg);
                    }
                    Err(FlowError::QueueEmpty) => break,
                    Err(e) => return Err(e),
                }
            }
        }
        let ready = cache.iter().filter(|c| !c.is_empty()).count();
        if ready == cache.len() {
            let row = cache
                .iter_mut()
                .map(|c| c.pop_front().expect("checked non-empty"))
                .collect();
            return Ok(Some(row));
        }
        if ready > 0 && self.align == AlignPolicy::DropWhenMisaligned {
            warn!(
                "{} dropping {ready}/{} misaligned inputs",
                self.flow_func_info(),
                cache.len()
            );
            cache.iter_mut().for_each(VecDeque::clear);
        }
        Ok(None)
    }

    /// Returns a popped row to the cache front (retry-later path).
    fn push_back_row(&self, row: Vec<FlowMsgRef>) {
        let mut cache = self.align_cache.lock();
        for (i, msg) in row.into_iter().enumerate() {
            cache[i].push_front(msg);
        }
    }

    /// Operator failure: tag every output index the proc did not publish,
    /// then clear in-flight input state.
    fn abnormal_proc(&self, error_code: i32) {
        let error_msg = FlowMsg::error(error_code).into_ref();
        for i in self.ports.published()..self.ports.output_num() {
            if let Err(e) = self.ports.set_output(i, error_msg.clone()) {
                error!(
                    "{} failed to publish error output[{i}]: {e}",
                    self.flow_func_info()
                );
            }
        }
        self.align_cache.lock().iter_mut().for_each(VecDeque::clear);
    }

    fn more_work_ready(&self) -> bool {
        if self.suspended()
            || self.clear_and_suspend.load(Ordering::SeqCst)
            || !self.ports.has_room()
        {
            return false;
        }
        let cache = self.align_cache.lock();
        self.input_queues
            .iter()
            .zip(cache.iter())
            .all(|(q, c)| !c.is_empty() || !q.is_empty())
    }

    /// Pure transition: an input queue went non-empty.
    pub fn empty_to_not_empty(&self) -> bool {
        !self.suspended() && self.sched_inflight.load(Ordering::SeqCst) == 0
    }

    /// Pure transition: one of the output queues freed a slot.
    pub fn full_to_not_full(&self) -> bool {
        !self.suspended() && self.sched_inflight.load(Ordering::SeqCst) == 0
    }

    /// Missed-event detection: input pending but nothing scheduled.
    pub fn need_replenish_schedule(&self) -> bool {
        if self.suspended() || !self.is_ok() {
            return false;
        }
        if self.sched_inflight.load(Ordering::SeqCst) != 0 {
            return false;
        }
        let has_input = {
            let cache = self.align_cache.lock();
            self.input_queues
                .iter()
                .zip(cache.iter())
                .any(|(q, c)| !c.is_empty() || !q.is_empty())
        };
        has_input || self.ports.blocked()
    }

    /// Exception scope matching: mechanical textual prefix against the
    /// model's configured scope.
    pub fn check_same_scope(&self, scope: &str) -> bool {
        scope.is_empty() || self.scope.starts_with(scope)
    }

    pub fn record_exception(&self, notify: &ExceptionNotify) {
        let mut exceptions = self.exceptions.lock();
        exceptions.push(ExceptionRecord {
            trans_id: notify.trans_id,
            user_context_id: notify.user_context_id,
            exception_code: notify.exception_code,
            context: notify.context.clone(),
            forwarded: false,
        });
    }

    pub fn delete_exception(&self, trans_id: u64) {
        self.exceptions.lock().retain(|r| r.trans_id != trans_id);
    }

    pub fn find_exception(&self, trans_id: u64) -> Option<ExceptionRecord> {
        self.exceptions
            .lock()
            .iter()
            .find(|r| r.trans_id == trans_id)
            .cloned()
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Writes a serialized status/exception payload to the status output
    /// queue. Queue errors are retried once.
    pub fn write_status_output_queue<F>(&self, generate: F) -> FlowResult<()>
    where
        F: FnOnce() -> FlowResult<Vec<u8>>,
    {
        let queue = self.status_queue.as_ref().ok_or_else(|| {
            FlowError::ParamInvalid(format!(
                "{} has no status output queue",
                self.flow_func_info()
            ))
        })?;
        let bytes = generate()?;
        let msg = FlowMsg::from_bytes(bytes).into_ref();
        match queue.enqueue(msg.clone()) {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(
                    "{} status enqueue failed ({first}), retrying once",
                    self.flow_func_info()
                );
                queue.enqueue(msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::driver::hal::Hal;
    use crate::executor::bus::{MAIN_GROUP, WORKER_GROUP};
    use crate::msg::{DataType, Tensor};

    struct Rig {
        hal: Arc<Hal>,
        drv: Driver,
        timers: Arc<TimerService>,
    }

    impl Rig {
        fn new() -> Self {
            let hal = Arc::new(Hal::new());
            let drv = Driver::new(hal.clone());
            let timers = TimerService::new(drv.clone(), 0, WORKER_GROUP);
            Self { hal, drv, timers }
        }

        fn processor(&self, inputs: &[u32], outputs: &[u32], cap: usize) -> Arc<FlowFuncProcessor> {
            for &q in inputs.iter().chain(outputs) {
                self.drv.queue_create(0, q, cap).unwrap();
            }
            let mut attrs = BTreeMap::new();
            attrs.insert("batch_size".into(), AttrValue::Int(2));
            attrs.insert("timeout".into(), AttrValue::Int(0));
            attrs.insert("padding".into(), AttrValue::Bool(false));
            attrs.insert("slide_stride".into(), AttrValue::Int(0));
            let params = ProcessorParams {
                idx: 0,
                func_name: "_BuiltIn_CountBatch".into(),
                instance_name: "t".into(),
                scope: "root/a/".into(),
                model_uuid: 1,
                need_report_status: false,
                input_queue_infos: inputs.iter().map(|&q| QueueDevInfo::local(0, q)).collect(),
                output_queue_infos: outputs.iter().map(|&q| QueueDevInfo::local(0, q)).collect(),
                status_queue_info: None,
                align: AlignPolicy::Strict,
                attrs,
            };
            FlowFuncProcessor::new(
                params,
                self.drv.clone(),
                Arc::new(FlowFuncRegistry::new()),
                self.timers.clone(),
                Arc::new(DumpStepFilter::default()),
                EventBus::new(self.drv.clone(), 0, MAIN_GROUP, WORKER_GROUP),
            )
        }
    }

    fn tensor_msg(v: i32) -> FlowMsgRef {
        FlowMsg::with_tensor(Tensor::new(vec![1], DataType::I32, v.to_le_bytes().to_vec()).unwrap())
            .into_ref()
    }

    #[test]
    fn schedules_operator_and_publishes_batch() {
        let rig = Rig::new();
        let p = rig.processor(&[1], &[2], 8);
        p.init().unwrap();
        assert!(matches!(p.init_flow_func(), InitOutcome::Done));

        rig.drv.queue_enqueue(0, 1, tensor_msg(4)).unwrap();
        rig.drv.queue_enqueue(0, 1, tensor_msg(5)).unwrap();
        // first row consumed, second row still ready
        assert!(p.schedule(0));
        assert!(!p.schedule(0));

        let out = rig.drv.queue_dequeue(0, 2).unwrap();
        assert_eq!(out.tensor().unwrap().shape(), &[2, 1]);
        assert_eq!(p.consumed_total(), 2);
        rig.timers.finalize();
    }

    #[test]
    fn suspend_acks_and_blocks_scheduling() {
        let rig = Rig::new();
        let p = rig.processor(&[3], &[4], 8);
        p.init().unwrap();
        assert!(matches!(p.init_flow_func(), InitOutcome::Done));

        p.set_clear_and_suspend();
        assert!(!p.schedule(0));
        let ev = rig
            .hal
            .wait_event(0, MAIN_GROUP, 0, std::time::Duration::from_millis(50))
            .unwrap();
        assert_eq!(ev.event_id, EventId::SuspendFinished);
        assert!(!p.empty_to_not_empty());

        p.set_clear_and_recover();
        assert!(!p.schedule(0)); // nothing queued, but recover ack fires
        let ev = rig
            .hal
            .wait_event(0, MAIN_GROUP, 0, std::time::Duration::from_millis(50))
            .unwrap();
        assert_eq!(ev.event_id, EventId::RecoverFinished);
        assert!(p.empty_to_not_empty());
        rig.timers.finalize();
    }

    #[test]
    fn backpressure_buffers_and_flushes() {
        let rig = Rig::new();
        let p = rig.processor(&[5], &[6], 1);
        p.init().unwrap();
        assert!(matches!(p.init_flow_func(), InitOutcome::Done));

        for v in 0..4 {
            rig.drv.queue_enqueue(0, 5, tensor_msg(v)).unwrap();
        }
        // first batch fills the size-1 output queue
        while p.schedule(0) {}
        assert_eq!(rig.drv.queue_depth(0, 6).unwrap(), 1);
        // second batch is stuck behind the full queue
        assert!(p.need_replenish_schedule() || rig.drv.queue_depth(0, 5).unwrap() > 0);

        rig.drv.queue_dequeue(0, 6).unwrap();
        assert!(p.full_to_not_full());
        while p.schedule(0) {}
        assert_eq!(rig.drv.queue_depth(0, 6).unwrap(), 1);
        rig.timers.finalize();
    }

    #[test]
    fn scope_matching_is_prefix_based() {
        let rig = Rig::new();
        let p = rig.processor(&[7], &[8], 2);
        assert!(p.check_same_scope(""));
        assert!(p.check_same_scope("root/"));
        assert!(p.check_same_scope("root/a/"));
        assert!(!p.check_same_scope("other/"));
        rig.timers.finalize();
    }

    #[test]
    fn exception_records_roundtrip() {
        let rig = Rig::new();
        let p = rig.processor(&[9], &[10], 2);
        let notify = ExceptionNotify {
            kind: crate::wire::ExceptionKind::Add,
            trans_id: 77,
            user_context_id: 5,
            exception_code: -9,
            scope: "root/".into(),
            context: vec![1, 2],
        };
        p.record_exception(&notify);
        assert!(p.find_exception(77).is_some());
        p.delete_exception(77);
        assert!(p.find_exception(77).is_none());
        rig.timers.finalize();
    }
}
