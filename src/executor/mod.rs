//! The executor: worker pool, event dispatch and global lifecycle.
//!
//! `init` builds every processor from the manifest and wires the
//! queue-to-processor maps; `start` spins up the workers, subscribes the
//! event groups and kicks off processor initialisation through the event
//! bus; `stop` flips the exit flag; `wait_for_stop` joins the workers and
//! finalises the timers. All runtime work happens in event handlers
//! dispatched from the per-thread wait loop.

pub mod bus;
pub mod control;
pub mod processor;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::driver::facade::ATTACH_TIMEOUT;
use crate::driver::hal::{DrvError, EventId, EventInfo, EventPayload};
use crate::driver::{Driver, GroupId, QueueWrapper};
use crate::dump::DumpConfig;
use crate::error::{FlowError, FlowResult, InitOutcome};
use crate::flowfunc::FlowFuncRegistry;
use crate::manifest::{ModelManifest, QueueDevInfo, UNSET_PRIORITY};
use crate::metrics;
use crate::timer::{InvokeMode, TimerService};

pub use bus::{EventBus, FLOW_MSG_GROUP, INVOKE_MODEL_GROUP, MAIN_GROUP, WORKER_GROUP};
pub use processor::{FlowFuncProcessor, ProcessorParams};

/// Events the main thread handles.
const MAIN_EVENT_MASK: u64 = EventId::ProcessorInit.mask()
    | EventId::FlowFuncInit.mask()
    | EventId::SingleFlowFuncInit.mask()
    | EventId::QueueEmptyToNotEmpty.mask()
    | EventId::QueueFullToNotFull.mask()
    | EventId::Timer.mask()
    | EventId::ReportStatus.mask()
    | EventId::NotifyThreadExit.mask()
    | EventId::SuspendFinished.mask()
    | EventId::RecoverFinished.mask()
    | EventId::SwitchToSoftSched.mask()
    | EventId::RaiseException.mask();

/// Events worker threads handle.
const WORKER_EVENT_MASK: u64 =
    EventId::FlowFuncExecute.mask() | EventId::NotifyThreadExit.mask();

const WAIT_EVENT_TIMEOUT: Duration = Duration::from_millis(2000);
const SUBMIT_RETRY_NUM: u32 = 3;
const SUBMIT_RETRY_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_METRICS_PERIOD_MS: u64 = 80_000;
const DEFAULT_REPORT_PERIOD_MS: u64 = 10_000;
const TERM_MONITOR_PERIOD_MS: u64 = 10;
const PARENT_MONITOR_PERIOD_MS: u64 = 1_000;
const PARENT_STOP_ATTEMPTS: u32 = 5;

/// Set by the process signal handler; the term-signal monitor polls it.
static TERM_SIGNAL: AtomicBool = AtomicBool::new(false);

pub fn mark_term_signal() {
    TERM_SIGNAL.store(true, Ordering::SeqCst);
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub device_id: u32,
    pub req_queue_id: Option<u32>,
    pub rsp_queue_id: Option<u32>,
    pub main_group: GroupId,
    pub worker_group: GroupId,
    /// On-device deployments merge the main and worker masks on every
    /// thread (single shared group).
    pub on_device: bool,
    pub monitor_parent: bool,
    pub metrics_period_ms: u64,
    pub metrics_csv: Option<PathBuf>,
    pub dump: DumpConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            req_queue_id: None,
            rsp_queue_id: None,
            main_group: MAIN_GROUP,
            worker_group: WORKER_GROUP,
            on_device: false,
            monitor_parent: false,
            metrics_period_ms: DEFAULT_METRICS_PERIOD_MS,
            metrics_csv: None,
            dump: DumpConfig::default(),
        }
    }
}

pub struct FlowFuncExecutor {
    cfg: ExecutorConfig,
    drv: Driver,
    bus: EventBus,
    registry: Arc<FlowFuncRegistry>,
    timers: Arc<TimerService>,
    dump_filter: Arc<crate::dump::DumpStepFilter>,

    processors: Vec<Arc<FlowFuncProcessor>>,
    input_to_processor: HashMap<u32, usize>,
    output_to_processors: HashMap<u32, Vec<usize>>,
    queue_devs: HashSet<u32>,
    with_proxy_queue: bool,
    report_interval_ms: u64,

    request_queue: Option<QueueWrapper>,
    response_queue: Option<QueueWrapper>,

    suspend_pending: Mutex<HashSet<usize>>,
    recover_pending: Mutex<HashSet<usize>>,

    running: Arc<AtomicBool>,
    abnormal: AtomicBool,
    recv_term_signal: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cpu_num: u32,
    esched_process_priority: i32,
    esched_event_priority: i32,
    supervisor_timers: Mutex<Vec<u32>>,
}

impl FlowFuncExecutor {
    pub fn new(cfg: ExecutorConfig, drv: Driver, registry: Arc<FlowFuncRegistry>) -> Self {
        let worker_group = if cfg.on_device {
            cfg.main_group
        } else {
            cfg.worker_group
        };
        let bus = EventBus::new(drv.clone(), cfg.device_id, cfg.main_group, worker_group);
        // timer events land on the main mask
        let timers = TimerService::new(drv.clone(), cfg.device_id, cfg.main_group);
        let dump_filter = Arc::new(cfg.dump.step_filter.clone());
        Self {
            cfg,
            drv,
            bus,
            registry,
            timers,
            dump_filter,
            processors: Vec::new(),
            input_to_processor: HashMap::new(),
            output_to_processors: HashMap::new(),
            queue_devs: HashSet::new(),
            with_proxy_queue: false,
            report_interval_ms: DEFAULT_REPORT_PERIOD_MS,
            request_queue: None,
            response_queue: None,
            suspend_pending: Mutex::new(HashSet::new()),
            recover_pending: Mutex::new(HashSet::new()),
            running: Arc::new(AtomicBool::new(false)),
            abnormal: AtomicBool::new(false),
            recv_term_signal: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            cpu_num: 0,
            esched_process_priority: UNSET_PRIORITY,
            esched_event_priority: UNSET_PRIORITY,
            supervisor_timers: Mutex::new(Vec::new()),
        }
    }

    // ------------------------------------------------------------------
    // accessors shared with the control handler
    // ------------------------------------------------------------------

    pub(crate) fn processors(&self) -> &[Arc<FlowFuncProcessor>] {
        &self.processors
    }

    pub(crate) fn request_queue(&self) -> Option<&QueueWrapper> {
        self.request_queue.as_ref()
    }

    pub(crate) fn response_queue(&self) -> Option<&QueueWrapper> {
        self.response_queue.as_ref()
    }

    pub(crate) fn suspend_pending(&self) -> &Mutex<HashSet<usize>> {
        &self.suspend_pending
    }

    pub(crate) fn recover_pending(&self) -> &Mutex<HashSet<usize>> {
        &self.recover_pending
    }

    pub(crate) fn set_abnormal(&self, value: bool) {
        self.abnormal.store(value, Ordering::SeqCst);
    }

    pub fn is_abnormal(&self) -> bool {
        self.abnormal.load(Ordering::SeqCst)
    }

    pub(crate) fn driver(&self) -> &Driver {
        &self.drv
    }

    pub fn timers(&self) -> &Arc<TimerService> {
        &self.timers
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    /// Builds every processor and wires the queue-index maps. No threads
    /// are spawned; a failure here leaves the process clean.
    pub fn init(&mut self, manifest: &ModelManifest) -> FlowResult<()> {
        info!("executor init start, model num={}", manifest.models.len());
        self.init_message_queue()?;

        let mut attr_cpu: Option<u32> = None;
        for model in &manifest.models {
            model.validate()?;
            Self::update_priority(
                model.esched_process_priority,
                &mut self.esched_process_priority,
            );
            Self::update_priority(
                model.esched_event_priority,
                &mut self.esched_event_priority,
            );
            if let Some(cpu) = model.cpu_num {
                attr_cpu = Some(attr_cpu.unwrap_or(0).max(cpu));
            }
            if let Some(interval) = model.report_interval_ms {
                self.report_interval_ms = self.report_interval_ms.min(interval.max(1));
            }
            let status_info = model.status_output_queue.clone();
            if let Some(status) = &status_info {
                self.note_queue(status);
            }
            for sub in model.sub_funcs() {
                let idx = self.processors.len();
                for qinfo in &sub.input_queues {
                    self.note_queue(qinfo);
                    if qinfo.is_proxy {
                        continue;
                    }
                    if let Some(&owner) = self.input_to_processor.get(&qinfo.queue_id) {
                        error!(
                            "input queue {} of {} already bound to processor {owner}",
                            qinfo.queue_id, sub.func_name
                        );
                        return Err(FlowError::QueueBindingConflict {
                            queue_id: qinfo.queue_id,
                            owner,
                        });
                    }
                    self.input_to_processor.insert(qinfo.queue_id, idx);
                }
                let output_infos: Vec<QueueDevInfo> = sub
                    .output_indexes
                    .iter()
                    .map(|&i| model.output_queues[i as usize].clone())
                    .collect();
                for out in &output_infos {
                    self.note_queue(out);
                    if !out.is_proxy {
                        self.output_to_processors
                            .entry(out.queue_id)
                            .or_default()
                            .push(idx);
                    }
                }
                let params = ProcessorParams {
                    idx,
                    func_name: sub.func_name.clone(),
                    instance_name: model.instance_name.clone(),
                    scope: model.scope.clone(),
                    model_uuid: model.model_uuid,
                    need_report_status: model.need_report_status,
                    input_queue_infos: sub.input_queues.clone(),
                    output_queue_infos: output_infos,
                    status_queue_info: status_info.clone(),
                    align: model.input_align,
                    attrs: model.attrs.clone(),
                };
                let p = FlowFuncProcessor::new(
                    params,
                    self.drv.clone(),
                    self.registry.clone(),
                    self.timers.clone(),
                    self.dump_filter.clone(),
                    self.bus.clone(),
                );
                info!("created processor {}", p.flow_func_info());
                self.processors.push(p);
            }
        }
        let n = self.processors.len() as u32;
        self.cpu_num = match attr_cpu {
            // one extra thread for handling events
            Some(cpu) => (cpu + 1).max(n + 1),
            None => n + 1,
        }
        .max(2);
        info!(
            "worker pool size {} for {} processors (host cores {})",
            self.cpu_num,
            n,
            num_cpus::get()
        );
        for dev in &self.queue_devs {
            self.drv.queue_init(*dev)?;
        }
        if self.with_proxy_queue {
            info!("proxy queues present, extended attach timeouts in effect");
        }
        info!(
            "executor init end, priorities process={} event={}",
            self.esched_process_priority, self.esched_event_priority
        );
        Ok(())
    }

    fn note_queue(&mut self, info: &QueueDevInfo) {
        self.queue_devs.insert(info.device_id);
        self.with_proxy_queue |= info.is_proxy;
    }

    /// The numerically smallest positive request wins across models.
    fn update_priority(user_priority: i32, priority: &mut i32) {
        if user_priority != UNSET_PRIORITY
            && (*priority == UNSET_PRIORITY || user_priority < *priority)
        {
            *priority = user_priority;
        }
    }

    fn init_message_queue(&mut self) -> FlowResult<()> {
        let (Some(req), Some(rsp)) = (self.cfg.req_queue_id, self.cfg.rsp_queue_id) else {
            info!("message queues are not configured");
            return Ok(());
        };
        let dev = self.cfg.device_id;
        self.drv.queue_init(dev)?;
        let request = QueueWrapper::new(QueueDevInfo::local(dev, req), self.drv.clone());
        let response = QueueWrapper::new(QueueDevInfo::local(dev, rsp), self.drv.clone());
        request.attach_with_timeout(ATTACH_TIMEOUT)?;
        response.attach_with_timeout(ATTACH_TIMEOUT)?;
        request.subscribe(self.cfg.main_group)?;
        info!("attached message queues req={req} rsp={rsp}");
        self.request_queue = Some(request);
        self.response_queue = Some(response);
        Ok(())
    }

    /// Spins up the worker pool and kicks off processor initialisation.
    pub fn start(self: &Arc<Self>) -> FlowResult<()> {
        self.running.store(true, Ordering::SeqCst);

        let pool = self.cpu_num.max(2);
        let mut workers = self.workers.lock();
        for i in 0..pool {
            let exec = self.clone();
            let handle = std::thread::Builder::new()
                .name(format!("udf_worker_{i}"))
                .spawn(move || {
                    exec.apply_thread_priority();
                    exec.thread_loop(i);
                })
                .map_err(|e| FlowError::Internal(format!("spawn worker {i}: {e}")))?;
            workers.push(handle);
        }
        drop(workers);

        self.submit_with_retry(EventInfo::new(EventId::ProcessorInit, 0))?;
        // try switch to driver soft sched mode; outcome is informational
        let _ = self
            .bus
            .submit_to_main(EventInfo::new(EventId::SwitchToSoftSched, 0));

        self.start_supervisor_timers();
        info!("executor started with {pool} threads");
        Ok(())
    }

    fn apply_thread_priority(&self) {
        let priority = self.esched_process_priority;
        if priority <= 0 {
            return;
        }
        let value = match u8::try_from(priority).ok().and_then(|v| {
            thread_priority::ThreadPriorityValue::try_from(v).ok()
        }) {
            Some(v) => v,
            None => {
                warn!("priority {priority} not representable, skipping");
                return;
            }
        };
        if let Err(e) = thread_priority::set_current_thread_priority(
            thread_priority::ThreadPriority::Crossplatform(value),
        ) {
            warn!("failed to set thread priority {priority}: {e:?}");
        }
    }

    fn submit_with_retry(&self, event: EventInfo) -> FlowResult<()> {
        let mut attempt = 0;
        loop {
            match self.bus.submit_to_main(event.clone()) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < SUBMIT_RETRY_NUM => {
                    attempt += 1;
                    info!("submit {:?} will retry ({attempt}): {e}", event.event_id);
                    std::thread::sleep(SUBMIT_RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn start_supervisor_timers(self: &Arc<Self>) {
        let mut ids = self.supervisor_timers.lock();

        // metrics dump; period is long because running logs are rate-limited
        let weak = Arc::downgrade(self);
        let id = self.timers.create(
            Arc::new(move || {
                if let Some(exec) = weak.upgrade() {
                    exec.dump_metrics(false);
                }
            }),
            InvokeMode::Inline,
        );
        let _ = self.timers.start(id, self.cfg.metrics_period_ms.max(1), false);
        ids.push(id);

        // term-signal monitor translates SIGTERM/SIGINT into thread exits
        let weak = Arc::downgrade(self);
        let id = self.timers.create(
            Arc::new(move || {
                let Some(exec) = weak.upgrade() else { return };
                let external = TERM_SIGNAL.swap(false, Ordering::SeqCst);
                let internal = exec.recv_term_signal.swap(false, Ordering::SeqCst);
                if external || internal {
                    info!("term signal received, notifying all threads to exit");
                    exec.running.store(false, Ordering::SeqCst);
                    exec.broadcast_thread_exit();
                }
            }),
            InvokeMode::Inline,
        );
        let _ = self.timers.start(id, TERM_MONITOR_PERIOD_MS, false);
        ids.push(id);

        if self.cfg.monitor_parent {
            let weak = Arc::downgrade(self);
            let start_parent = unsafe { libc::getppid() };
            let attempts = std::sync::atomic::AtomicU32::new(0);
            let id = self.timers.create(
                Arc::new(move || {
                    let Some(exec) = weak.upgrade() else { return };
                    let current_parent = unsafe { libc::getppid() };
                    if current_parent == start_parent || start_parent == 1 {
                        return;
                    }
                    let tries = attempts.fetch_add(1, Ordering::SeqCst);
                    if tries < PARENT_STOP_ATTEMPTS {
                        info!(
                            "parent pid {start_parent} exited (now {current_parent}), stopping ({tries})"
                        );
                        exec.stop(false);
                    } else {
                        error!("parent exited but executor will not stop, killing self");
                        unsafe {
                            libc::kill(libc::getpid(), libc::SIGKILL);
                        }
                    }
                }),
                InvokeMode::Inline,
            );
            let _ = self.timers.start(id, PARENT_MONITOR_PERIOD_MS, false);
            ids.push(id);
        }

        if self.processors.iter().any(|p| p.need_report_status()) {
            let weak = Arc::downgrade(self);
            let id = self.timers.create(
                Arc::new(move || {
                    let Some(exec) = weak.upgrade() else { return };
                    for p in exec.processors() {
                        if p.need_report_status() {
                            let _ = exec.bus.submit_to_main(EventInfo::new(
                                EventId::ReportStatus,
                                p.idx() as u32,
                            ));
                        }
                    }
                }),
                InvokeMode::Worker,
            );
            let _ = self.timers.start(id, self.report_interval_ms, false);
            ids.push(id);
        }
    }

    fn broadcast_thread_exit(&self) {
        let pool = self.cpu_num.max(2);
        for i in 0..pool {
            let event = EventInfo::new(EventId::NotifyThreadExit, i);
            let result = if i == pool - 1 {
                self.bus.submit_to_main(event)
            } else {
                self.bus.submit_to_worker(event)
            };
            if let Err(e) = result {
                warn!("failed to submit notify-thread-exit: {e}");
            }
        }
    }

    /// Flips the exit flag; workers observe it within one wait timeout.
    pub fn stop(&self, recv_term_signal: bool) {
        self.running.store(false, Ordering::SeqCst);
        if recv_term_signal {
            self.recv_term_signal.store(true, Ordering::SeqCst);
        }
    }

    /// Joins workers, finalises timers and flushes one last metrics dump.
    pub fn wait_for_stop(&self) {
        self.broadcast_thread_exit();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        let ids: Vec<u32> = self.supervisor_timers.lock().drain(..).collect();
        for id in ids {
            let _ = self.timers.stop(id);
            let _ = self.timers.delete(id);
        }
        self.timers.finalize();
        self.dump_metrics(true);
        self.unsubscribe_queues();
        info!("executor stopped");
    }

    fn unsubscribe_queues(&self) {
        for p in &self.processors {
            for info in p.input_queue_infos() {
                if !info.is_proxy {
                    let _ = self.drv.queue_unsubscribe(info.device_id, info.queue_id);
                }
            }
            for info in p.output_queue_infos() {
                if !info.is_proxy {
                    let _ = self.drv.queue_unsub_f2nf(info.device_id, info.queue_id);
                }
            }
        }
    }

    fn dump_metrics(&self, with_queue_info: bool) {
        let rows: Vec<_> = self
            .processors
            .iter()
            .map(|p| (p.flow_func_info(), p.metrics_snapshot()))
            .collect();
        metrics::dump_metrics(&rows, self.cfg.metrics_csv.as_deref());
        if with_queue_info {
            for p in &self.processors {
                for info in p.input_queue_infos() {
                    let depth = self
                        .drv
                        .queue_depth(info.device_id, info.queue_id)
                        .unwrap_or(usize::MAX);
                    info!(
                        "[Metrics] {} input queue {} depth {depth}",
                        p.flow_func_info(),
                        info.queue_id
                    );
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // event loop
    // ------------------------------------------------------------------

    fn thread_loop(self: &Arc<Self>, thread_idx: u32) {
        let pool = self.cpu_num.max(2);
        let is_main = thread_idx == pool - 1;
        let group = if is_main {
            self.bus.main_group()
        } else {
            self.bus.worker_group()
        };
        let mask = if self.cfg.on_device {
            MAIN_EVENT_MASK | WORKER_EVENT_MASK
        } else if is_main {
            MAIN_EVENT_MASK
        } else {
            WORKER_EVENT_MASK
        };
        if let Err(e) =
            self.drv
                .subscribe_event(self.cfg.device_id, group, thread_idx, mask)
        {
            error!("thread {thread_idx} failed to subscribe events: {e}");
            self.stop(false);
            return;
        }
        info!("thread {thread_idx} subscribed group {group} mask {mask:#x}");

        let mut timeout_times = 0u32;
        while self.running.load(Ordering::SeqCst) {
            match self
                .drv
                .wait_event(self.cfg.device_id, group, thread_idx, WAIT_EVENT_TIMEOUT)
            {
                Ok(event) => {
                    self.process_event(&event, thread_idx);
                    timeout_times = 0;
                }
                Err(DrvError::WaitTimeout) => {
                    if timeout_times % 10 == 0 {
                        debug!(
                            "thread {thread_idx} wait timeout, continuous={timeout_times}"
                        );
                    }
                    timeout_times += 1;
                    if is_main {
                        self.check_replenish_schedule();
                    }
                }
                Err(e) => {
                    error!("thread {thread_idx} wait event failed: {e:?}");
                }
            }
        }
        info!("flow func thread {thread_idx} exit");
    }

    fn process_event(self: &Arc<Self>, event: &EventInfo, thread_idx: u32) {
        debug!(
            "thread {thread_idx} event {:?} sub={}",
            event.event_id, event.subevent_id
        );
        match event.event_id {
            EventId::ProcessorInit => self.handle_processor_init(),
            EventId::FlowFuncInit => self.handle_flow_func_init(),
            EventId::SingleFlowFuncInit => {
                self.handle_single_flow_func_init(event.subevent_id as usize)
            }
            EventId::FlowFuncExecute => {
                self.handle_flow_func_execute(event.subevent_id as usize, thread_idx)
            }
            EventId::QueueEmptyToNotEmpty => self.handle_empty_to_not_empty(event.subevent_id),
            EventId::QueueFullToNotFull => self.handle_full_to_not_full(event.subevent_id),
            EventId::Timer => self.timers.exec_callback(event.subevent_id),
            EventId::ReportStatus => {
                let idx = event.subevent_id as usize;
                if idx >= self.processors.len() {
                    error!("report status event with bad index {idx}");
                    self.stop(false);
                    return;
                }
                if let Err(e) = self.report_status(idx) {
                    error!("report status failed for processor {idx}: {e}");
                    self.stop(false);
                }
            }
            EventId::SuspendFinished => {
                let (idx, code) = Self::processor_event_params(event);
                self.handle_suspend_finished(idx, code);
            }
            EventId::RecoverFinished => {
                let (idx, code) = Self::processor_event_params(event);
                self.handle_recover_finished(idx, code);
            }
            EventId::RaiseException => {
                let idx = event.subevent_id as usize;
                let trans_id = match event.payload {
                    EventPayload::TransId(id) => id,
                    _ => {
                        error!("raise exception event without transaction id");
                        self.stop(false);
                        return;
                    }
                };
                if idx >= self.processors.len() {
                    error!("raise exception event with bad index {idx}");
                    self.stop(false);
                    return;
                }
                if let Err(e) = self.handle_raise_exception(idx, trans_id) {
                    error!("processor {idx} exception report failed: {e}");
                    self.stop(false);
                }
            }
            EventId::SwitchToSoftSched => {
                info!("switch to soft sched mode event");
            }
            EventId::NotifyThreadExit => {
                info!("thread {thread_idx} received notify-thread-exit");
            }
        }
    }

    fn processor_event_params(event: &EventInfo) -> (usize, i32) {
        let code = match event.payload {
            EventPayload::Code(code) => code,
            _ => FlowError::Internal("missing result code".into()).code(),
        };
        (event.subevent_id as usize, code)
    }

    fn handle_processor_init(self: &Arc<Self>) {
        info!("process processor init event start");
        for p in &self.processors {
            if let Err(e) = p.init() {
                error!("processor {} init failed: {e}", p.flow_func_info());
                self.stop(false);
                return;
            }
        }
        if let Err(e) = self.subscribe_data_queues() {
            error!("queue subscription failed: {e}");
            self.stop(false);
            return;
        }
        if let Err(e) = self
            .bus
            .submit_to_main(EventInfo::new(EventId::FlowFuncInit, 0))
        {
            error!("failed to submit flow func init event: {e}");
            self.stop(false);
        }
        info!("process processor init event end");
    }

    fn subscribe_data_queues(&self) -> FlowResult<()> {
        // outputs first so full-to-not-full wakeups are armed before any
        // data flows
        for p in &self.processors {
            for info in p.output_queue_infos() {
                if !info.is_proxy {
                    self.drv
                        .queue_sub_f2nf(info.device_id, info.queue_id, self.cfg.main_group)?;
                }
            }
        }
        for p in &self.processors {
            for info in p.input_queue_infos() {
                if !info.is_proxy {
                    self.drv
                        .queue_subscribe(info.device_id, info.queue_id, self.cfg.main_group)?;
                }
            }
        }
        Ok(())
    }

    fn handle_flow_func_init(self: &Arc<Self>) {
        info!("flow func init event start");
        let mut need_re_init = 0u32;
        for p in &self.processors {
            match p.init_flow_func() {
                InitOutcome::Done => {}
                InitOutcome::RetryLater => need_re_init += 1,
                InitOutcome::Fatal(e) => {
                    error!("flow func {} init failed: {e}", p.flow_func_info());
                    self.stop(false);
                    return;
                }
            }
        }
        if need_re_init > 0 {
            info!("flow funcs need re-init, count={need_re_init}");
            std::thread::sleep(SUBMIT_RETRY_DELAY);
            if let Err(e) = self
                .bus
                .submit_to_main(EventInfo::new(EventId::FlowFuncInit, 0))
            {
                error!("failed to re-submit flow func init: {e}");
                self.stop(false);
            }
            return;
        }
        for idx in 0..self.processors.len() {
            if let Err(e) = self.schedule_flow_func(idx) {
                error!("schedule flow func {idx} failed: {e}");
                self.stop(false);
                return;
            }
        }
        // requests may have queued up while initialising
        if self.request_queue.is_some() {
            if let Err((cmd, e)) = self.process_request_message_queue() {
                error!("request drain during init failed: {e}");
                let _ = self.send_response(cmd, e.code());
                self.stop(false);
                return;
            }
        }
        info!("flow func init event end");
    }

    fn handle_single_flow_func_init(self: &Arc<Self>, idx: usize) {
        if idx >= self.processors.len() {
            error!("single flow func init with bad index {idx}");
            return;
        }
        let p = &self.processors[idx];
        match p.init_flow_func() {
            InitOutcome::RetryLater => {
                std::thread::sleep(SUBMIT_RETRY_DELAY);
                if let Err(e) = self
                    .bus
                    .submit_to_main(EventInfo::new(EventId::SingleFlowFuncInit, idx as u32))
                {
                    error!("failed to re-submit single init for {idx}: {e}");
                }
            }
            InitOutcome::Fatal(e) => {
                error!("flow func {} init failed: {e}", p.flow_func_info());
                self.stop(false);
            }
            InitOutcome::Done => {
                if let Err(e) = self.schedule_flow_func(idx) {
                    error!("schedule after single init failed for {idx}: {e}");
                    self.stop(false);
                }
            }
        }
    }

    fn handle_flow_func_execute(self: &Arc<Self>, idx: usize, thread_idx: u32) {
        if idx >= self.processors.len() {
            error!("flow func execute event with bad index {idx}");
            return;
        }
        let p = &self.processors[idx];
        let need_sched = p.schedule(thread_idx);
        if need_sched {
            let _ = self.schedule_flow_func(idx);
        } else if !p.is_ok() {
            error!(
                "executor exits: processor {} schedule failed",
                p.flow_func_info()
            );
            self.stop(false);
        }
    }

    fn handle_empty_to_not_empty(self: &Arc<Self>, queue_id: u32) {
        if Some(queue_id) == self.cfg.req_queue_id {
            if let Err((cmd, e)) = self.process_request_message_queue() {
                error!("request queue {queue_id} processing failed: {e}");
                let _ = self.send_response(cmd, e.code());
                self.stop(false);
            }
            return;
        }
        let Some(&idx) = self.input_to_processor.get(&queue_id) else {
            warn!("skip E2NE event for unowned queue {queue_id}");
            return;
        };
        if self.processors[idx].empty_to_not_empty() {
            let _ = self.schedule_flow_func(idx);
        }
    }

    fn handle_full_to_not_full(self: &Arc<Self>, queue_id: u32) {
        let Some(indices) = self.output_to_processors.get(&queue_id) else {
            warn!("no flow func writes output queue {queue_id}");
            return;
        };
        for &idx in indices {
            if self.processors[idx].full_to_not_full() {
                let _ = self.schedule_flow_func(idx);
            }
        }
    }

    /// Submits one execute event for the processor.
    pub(crate) fn schedule_flow_func(&self, idx: usize) -> FlowResult<()> {
        debug!("schedule flow func {idx}");
        self.processors[idx].note_schedule_submitted();
        self.bus
            .submit_to_worker(EventInfo::new(EventId::FlowFuncExecute, idx as u32))
    }

    /// Timed-wait fallback: re-submit execute events for processors that
    /// report missed wake-ups.
    fn check_replenish_schedule(&self) {
        for (idx, p) in self.processors.iter().enumerate() {
            if p.need_replenish_schedule() {
                info!(
                    "processor {} needs replenish schedule event",
                    p.flow_func_info()
                );
                let _ = self.schedule_flow_func(idx);
            }
        }
    }
}

impl Drop for FlowFuncExecutor {
    fn drop(&mut self) {
        self.timers.finalize();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::driver::Hal;
    use crate::manifest::{AlignPolicy, AttrValue, ModelDesc};

    fn count_batch_model(inputs: &[u32], outputs: &[u32]) -> ModelDesc {
        let mut attrs = BTreeMap::new();
        attrs.insert("batch_size".into(), AttrValue::Int(2));
        attrs.insert("timeout".into(), AttrValue::Int(0));
        attrs.insert("padding".into(), AttrValue::Bool(false));
        attrs.insert("slide_stride".into(), AttrValue::Int(0));
        ModelDesc {
            name: "g/m".into(),
            instance_name: "m".into(),
            flow_func_name: "_BuiltIn_CountBatch".into(),
            input_queues: inputs.iter().map(|&q| QueueDevInfo::local(0, q)).collect(),
            output_queues: outputs.iter().map(|&q| QueueDevInfo::local(0, q)).collect(),
            func_input_maps: BTreeMap::new(),
            func_output_maps: BTreeMap::new(),
            status_output_queue: None,
            need_report_status: false,
            enable_raise_exception: false,
            report_interval_ms: None,
            input_align: AlignPolicy::Strict,
            esched_process_priority: UNSET_PRIORITY,
            esched_event_priority: UNSET_PRIORITY,
            cpu_num: None,
            scope: String::new(),
            model_uuid: 7,
            attrs,
        }
    }

    #[test]
    fn binding_conflict_fails_init_without_threads() {
        let hal = Arc::new(Hal::new());
        let drv = Driver::new(hal);
        for q in [7, 8, 9] {
            drv.queue_create(0, q, 4).unwrap();
        }
        let mut model = count_batch_model(&[7], &[8]);
        model
            .func_input_maps
            .insert("f0".into(), vec![0]);
        model
            .func_input_maps
            .insert("f1".into(), vec![0]);
        let manifest = ModelManifest {
            models: vec![model],
        };
        let mut exec = FlowFuncExecutor::new(
            ExecutorConfig::default(),
            drv,
            Arc::new(FlowFuncRegistry::new()),
        );
        let err = exec.init(&manifest).unwrap_err();
        assert!(matches!(err, FlowError::QueueBindingConflict { queue_id: 7, .. }));
        assert!(exec.workers.lock().is_empty());
    }

    #[test]
    fn cross_model_queue_sharing_is_binding_conflict() {
        let hal = Arc::new(Hal::new());
        let drv = Driver::new(hal);
        for q in [1, 2, 3] {
            drv.queue_create(0, q, 4).unwrap();
        }
        let manifest = ModelManifest {
            models: vec![
                count_batch_model(&[1], &[2]),
                count_batch_model(&[1], &[3]),
            ],
        };
        let mut exec = FlowFuncExecutor::new(
            ExecutorConfig::default(),
            drv,
            Arc::new(FlowFuncRegistry::new()),
        );
        let err = exec.init(&manifest).unwrap_err();
        assert!(matches!(err, FlowError::QueueBindingConflict { queue_id: 1, .. }));
        assert!(exec.workers.lock().is_empty());
    }

    #[test]
    fn priority_takes_smallest_positive() {
        let mut priority = UNSET_PRIORITY;
        FlowFuncExecutor::update_priority(5, &mut priority);
        assert_eq!(priority, 5);
        FlowFuncExecutor::update_priority(3, &mut priority);
        assert_eq!(priority, 3);
        FlowFuncExecutor::update_priority(9, &mut priority);
        assert_eq!(priority, 3);
        FlowFuncExecutor::update_priority(UNSET_PRIORITY, &mut priority);
        assert_eq!(priority, 3);
    }

    #[test]
    fn pool_size_covers_processors_plus_one() {
        let hal = Arc::new(Hal::new());
        let drv = Driver::new(hal);
        for q in [1, 2, 3, 4] {
            drv.queue_create(0, q, 4).unwrap();
        }
        let manifest = ModelManifest {
            models: vec![
                count_batch_model(&[1], &[2]),
                count_batch_model(&[3], &[4]),
            ],
        };
        let mut exec = FlowFuncExecutor::new(
            ExecutorConfig::default(),
            drv,
            Arc::new(FlowFuncRegistry::new()),
        );
        exec.init(&manifest).unwrap();
        assert_eq!(exec.cpu_num, 3);
    }
}
