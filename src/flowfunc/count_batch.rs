//! Built-in count-batch operator.
//!
//! Buffers one deque of messages per input stream and republishes them
//! concatenated along a new leading dimension once `batch_size` messages
//! are cached. An optional timeout flushes a short batch, zero-padding it
//! to `batch_size` when `padding` is set; `slide_stride` turns the batch
//! into a sliding window by keeping all but the first `stride` messages.
//!
//! `proc` and the timeout callback contend on one mutex, so only one of
//! them touches the cache at a time. A timeout that loses the race against
//! a `proc` which already published re-checks the elapsed window after
//! acquiring the lock and backs off.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, error};
use parking_lot::Mutex;

use crate::dump::DumpStepFilter;
use crate::error::{FlowError, FlowResult};
use crate::flowfunc::{FlowFunc, FuncContext};
use crate::msg::{FlowMsg, FlowMsgRef, Tensor};
use crate::timer::InvokeMode;

const MS_TO_US: u64 = 1000;

/// Cached message plus whether it is real user data (false = zero padding).
type CachedMsg = (FlowMsgRef, bool);

#[derive(Default)]
struct CountState {
    /// One deque per input stream; the outer vec is sized on first proc and
    /// cleared only by the abnormal path.
    streams: Vec<VecDeque<CachedMsg>>,
    total_outputs: usize,
    published: usize,
    timer_armed: bool,
    window_start_us: u64,
}

pub struct CountBatchFunc {
    ctx: Option<Arc<FuncContext>>,
    batch_size: i64,
    timeout_ms: i64,
    padding: bool,
    slide_stride: i64,
    state: Arc<Mutex<CountState>>,
    timer_id: Arc<AtomicU32>,
}

impl CountBatchFunc {
    pub fn new() -> Self {
        Self {
            ctx: None,
            batch_size: 0,
            timeout_ms: 0,
            padding: false,
            slide_stride: 0,
            state: Arc::new(Mutex::new(CountState::default())),
            timer_id: Arc::new(AtomicU32::new(0)),
        }
    }

    fn get_batch_attrs(&mut self, ctx: &FuncContext) -> FlowResult<()> {
        self.batch_size = ctx.attr_i64("batch_size")?;
        if self.batch_size <= 0 {
            return Err(FlowError::ParamInvalid(format!(
                "attr [batch_size] must be positive, got {}",
                self.batch_size
            )));
        }
        self.timeout_ms = ctx.attr_i64("timeout")?;
        if self.timeout_ms < 0 || self.timeout_ms >= u32::MAX as i64 {
            return Err(FlowError::ParamInvalid(format!(
                "attr [timeout] {} out of range [0, {})",
                self.timeout_ms,
                u32::MAX
            )));
        }
        self.padding = ctx.attr_bool("padding")?;
        self.slide_stride = ctx.attr_i64("slide_stride")?;
        if self.slide_stride < 0 {
            return Err(FlowError::ParamInvalid(format!(
                "attr [slide_stride] must not be negative, got {}",
                self.slide_stride
            )));
        }
        debug!(
            "count batch attrs: batch_size={}, timeout={}ms, padding={}, slide_stride={}",
            self.batch_size, self.timeout_ms, self.padding, self.slide_stride
        );
        Ok(())
    }

    /// Structural input validation. Returns the error code to tag outputs
    /// with (input return codes pass through unchanged).
    fn check_input(state: &CountState, inputs: &[FlowMsgRef]) -> Result<(), i32> {
        if inputs.is_empty() {
            error!("count batch input is empty");
            return Err(FlowError::ParamInvalid(String::new()).code());
        }
        for (i, msg) in inputs.iter().enumerate() {
            if !msg.is_ok() {
                error!("count batch input[{i}] carries error code {}", msg.ret_code());
                return Err(msg.ret_code());
            }
        }
        if !state.streams.is_empty() && inputs.len() != state.streams.len() {
            error!(
                "count batch input num {} != cached stream num {}",
                inputs.len(),
                state.streams.len()
            );
            return Err(FlowError::ParamInvalid(String::new()).code());
        }
        for (i, msg) in inputs.iter().enumerate() {
            let tensor = match msg.tensor() {
                Some(t) => t,
                None => {
                    error!("count batch input[{i}] has no tensor");
                    return Err(FlowError::ParamInvalid(String::new()).code());
                }
            };
            if let Some(stream) = state.streams.get(i) {
                if let Some((front, _)) = stream.front() {
                    let cached = front.tensor().expect("cached msgs carry tensors");
                    if cached.shape() != tensor.shape() {
                        error!("count batch input[{i}] shape changed mid-batch");
                        return Err(FlowError::ParamInvalid(String::new()).code());
                    }
                    if cached.dtype() != tensor.dtype() {
                        error!("count batch input[{i}] dtype changed mid-batch");
                        return Err(FlowError::ParamInvalid(String::new()).code());
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for CountBatchFunc {
    fn default() -> Self {
        Self::new()
    }
}

/// Error path shared by proc and the timeout callback: tag every output
/// index that has not been published this invocation, then drop the cache.
fn abnormal_proc(state: &mut CountState, ctx: &FuncContext, error_code: i32) {
    let error_msg = FlowMsg::error(error_code).into_ref();
    for i in state.published..state.total_outputs {
        if let Err(e) = ctx.set_output(i, error_msg.clone()) {
            error!("count batch failed to publish error output[{i}]: {e}");
        }
    }
    state.streams.clear();
    state.timer_armed = false;
    debug!("count batch abnormal proc finished, code={error_code}");
}

/// Concatenates the whole cached stream along a new leading dimension. The
/// output step-id is the largest dump-enabled step-id seen in the batch.
fn build_batch_output(
    stream: &VecDeque<CachedMsg>,
    filter: &DumpStepFilter,
) -> FlowResult<FlowMsg> {
    let (front, _) = stream
        .front()
        .ok_or_else(|| FlowError::Internal("batch stream drained unexpectedly".into()))?;
    let t0 = front
        .tensor()
        .ok_or_else(|| FlowError::ParamInvalid("cached msg lost its tensor".into()))?;
    let mut shape = Vec::with_capacity(t0.shape().len() + 1);
    shape.push(stream.len() as i64);
    shape.extend_from_slice(t0.shape());
    let dtype = t0.dtype();

    let mut data = Vec::with_capacity(t0.data_size() * stream.len());
    let mut max_step = 0u32;
    for (msg, _) in stream {
        let tensor = msg
            .tensor()
            .ok_or_else(|| FlowError::ParamInvalid("cached msg lost its tensor".into()))?;
        data.extend_from_slice(tensor.data());
        let step = msg.step_id();
        if filter.contains(step) && step > max_step {
            max_step = step;
        }
    }
    let mut out = FlowMsg::with_tensor(Tensor::new(shape, dtype, data)?);
    out.set_step_id(max_step);
    Ok(out)
}

/// Post-publish cache update: plain batching clears the stream, sliding
/// mode pops `stride` entries and trims trailing padding.
fn slide_or_clear(stream: &mut VecDeque<CachedMsg>, stride: i64) {
    if stride == 0 {
        stream.clear();
        return;
    }
    let n = (stride as usize).min(stream.len());
    for _ in 0..n {
        stream.pop_front();
    }
    while let Some((_, is_real)) = stream.back() {
        if *is_real {
            break;
        }
        stream.pop_back();
    }
}

fn pad_stream(
    stream: &mut VecDeque<CachedMsg>,
    padding_cnt: i64,
    ctx: &FuncContext,
) -> FlowResult<()> {
    debug!("count batch padding {padding_cnt} msgs");
    let template = {
        let (front, _) = stream
            .front()
            .ok_or_else(|| FlowError::Internal("padding an empty stream".into()))?;
        let t = front
            .tensor()
            .ok_or_else(|| FlowError::ParamInvalid("cached msg lost its tensor".into()))?;
        (t.shape().to_vec(), t.dtype())
    };
    for _ in 0..padding_cnt {
        let msg = ctx.alloc_tensor_msg(template.0.clone(), template.1)?;
        stream.push_back((msg.into_ref(), false));
    }
    Ok(())
}

/// The timeout sweep. Runs under the shared state mutex on a worker thread.
#[allow(clippy::too_many_arguments)]
fn timeout_sweep(
    state: &Mutex<CountState>,
    ctx: &FuncContext,
    batch_size: i64,
    padding: bool,
    slide_stride: i64,
    timeout_ms: i64,
    timer_id: &AtomicU32,
) {
    let mut st = state.lock();
    let now = ctx.now_us();
    if !st.timer_armed || now.saturating_sub(st.window_start_us) < timeout_ms as u64 * MS_TO_US {
        debug!("count batch timeout superseded by a proc publish, skipping");
        return;
    }
    for i in 0..st.streams.len() {
        if st.streams[i].is_empty() {
            st.timer_armed = false;
            return;
        }
        st.published = i;
        let cached = st.streams[i].len() as i64;
        if padding && cached < batch_size {
            if let Err(e) = pad_stream(&mut st.streams[i], batch_size - cached, ctx) {
                error!("count batch padding failed: {e}");
                abnormal_proc(&mut st, ctx, e.code());
                return;
            }
        }
        let out = match build_batch_output(&st.streams[i], ctx.dump_filter()) {
            Ok(out) => out,
            Err(e) => {
                error!("count batch timeout output build failed: {e}");
                abnormal_proc(&mut st, ctx, e.code());
                return;
            }
        };
        if let Err(e) = ctx.set_output(i, out.into_ref()) {
            error!("count batch timeout set_output[{i}] failed: {e}");
            abnormal_proc(&mut st, ctx, e.code());
            return;
        }
        slide_or_clear(&mut st.streams[i], slide_stride);
        st.published = i + 1;
    }
    let id = timer_id.load(Ordering::Acquire);
    if id != 0 {
        let _ = ctx.timers().start(id, timeout_ms as u64, true);
    }
    st.window_start_us = now;
}

impl FlowFunc for CountBatchFunc {
    fn init(&mut self, ctx: Arc<FuncContext>) -> FlowResult<()> {
        self.get_batch_attrs(&ctx)?;
        if self.timeout_ms != 0 {
            let state = self.state.clone();
            let cb_ctx = ctx.clone();
            let (batch_size, padding, slide_stride, timeout_ms) =
                (self.batch_size, self.padding, self.slide_stride, self.timeout_ms);
            let id_cell = self.timer_id.clone();
            let cb_id_cell = id_cell.clone();
            let id = ctx.timers().create(
                Arc::new(move || {
                    timeout_sweep(
                        &state,
                        &cb_ctx,
                        batch_size,
                        padding,
                        slide_stride,
                        timeout_ms,
                        &cb_id_cell,
                    );
                }),
                InvokeMode::Worker,
            );
            id_cell.store(id, Ordering::Release);
        }
        self.state.lock().streams.clear();
        self.ctx = Some(ctx);
        Ok(())
    }

    fn proc(&mut self, inputs: &[FlowMsgRef]) -> FlowResult<()> {
        let ctx = self
            .ctx
            .clone()
            .ok_or_else(|| FlowError::Internal("count batch proc before init".into()))?;
        let mut st = self.state.lock();
        if st.streams.is_empty() {
            st.total_outputs = inputs.len();
        }
        st.published = 0;
        if let Err(code) = Self::check_input(&st, inputs) {
            abnormal_proc(&mut st, &ctx, code);
            return Ok(());
        }
        if !st.timer_armed {
            st.timer_armed = true;
            if st.streams.len() != inputs.len() {
                st.streams.resize_with(inputs.len(), VecDeque::new);
            }
            let id = self.timer_id.load(Ordering::Acquire);
            if self.timeout_ms != 0 && id != 0 {
                let _ = ctx.timers().start(id, self.timeout_ms as u64, true);
                st.window_start_us = ctx.now_us();
            }
        }
        for (i, msg) in inputs.iter().enumerate() {
            st.streams[i].push_back((msg.clone(), true));
            if st.streams[i].len() as i64 >= self.batch_size {
                let out = match build_batch_output(&st.streams[i], ctx.dump_filter()) {
                    Ok(out) => out,
                    Err(e) => {
                        error!("count batch output build failed: {e}");
                        abnormal_proc(&mut st, &ctx, e.code());
                        return Ok(());
                    }
                };
                if let Err(e) = ctx.set_output(i, out.into_ref()) {
                    error!("count batch set_output[{i}] failed: {e}");
                    abnormal_proc(&mut st, &ctx, e.code());
                    return Ok(());
                }
                slide_or_clear(&mut st.streams[i], self.slide_stride);
                st.timer_armed = false;
            }
            st.published = i + 1;
        }
        Ok(())
    }

    fn reset_state(&mut self) -> bool {
        let mut st = self.state.lock();
        st.streams.clear();
        st.timer_armed = false;
        st.published = 0;
        true
    }
}

impl Drop for CountBatchFunc {
    fn drop(&mut self) {
        self.state.lock().timer_armed = false;
        let id = self.timer_id.load(Ordering::Acquire);
        if id != 0 {
            if let Some(ctx) = &self.ctx {
                let _ = ctx.timers().delete(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::flowfunc::testing::{CollectSink, TestRig};
    use crate::manifest::AttrValue;
    use crate::msg::DataType;

    fn attrs(batch: i64, timeout: i64, padding: bool, stride: i64) -> BTreeMap<String, AttrValue> {
        let mut map = BTreeMap::new();
        map.insert("batch_size".into(), AttrValue::Int(batch));
        map.insert("timeout".into(), AttrValue::Int(timeout));
        map.insert("padding".into(), AttrValue::Bool(padding));
        map.insert("slide_stride".into(), AttrValue::Int(stride));
        map
    }

    fn i32_msg(shape: Vec<i64>, values: &[i32], step: u32) -> FlowMsgRef {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut msg = FlowMsg::with_tensor(Tensor::new(shape, DataType::I32, bytes).unwrap());
        msg.set_step_id(step);
        msg.into_ref()
    }

    fn i8_msg(values: &[i8]) -> FlowMsgRef {
        let bytes: Vec<u8> = values.iter().map(|v| *v as u8).collect();
        FlowMsg::with_tensor(Tensor::new(vec![values.len() as i64], DataType::I8, bytes).unwrap())
            .into_ref()
    }

    fn as_i32(data: &[u8]) -> Vec<i32> {
        data.chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn exact_batch_concatenates_with_leading_dim() {
        let sink = CollectSink::new(1);
        let rig = TestRig::new(attrs(4, 0, false, 0), sink.clone());
        let mut func = CountBatchFunc::new();
        func.init(rig.ctx.clone()).unwrap();

        for (k, step) in (0..4).zip([3u32, 9, 7, 2]) {
            let base = (k * 6 + 1) as i32;
            let vals: Vec<i32> = (base..base + 6).collect();
            func.proc(&[i32_msg(vec![2, 3], &vals, step)]).unwrap();
        }
        let published = sink.take();
        assert_eq!(published.len(), 1);
        let (idx, out) = &published[0];
        assert_eq!(*idx, 0);
        let tensor = out.tensor().unwrap();
        assert_eq!(tensor.shape(), &[4, 2, 3]);
        assert_eq!(as_i32(tensor.data()), (1..=24).collect::<Vec<i32>>());
        assert_eq!(out.step_id(), 9);
    }

    #[test]
    fn timeout_pads_to_batch_size() {
        let sink = CollectSink::new(1);
        let rig = TestRig::new(attrs(3, 10, true, 0), sink.clone());
        let mut func = CountBatchFunc::new();
        func.init(rig.ctx.clone()).unwrap();

        func.proc(&[i8_msg(&[5])]).unwrap();
        func.proc(&[i8_msg(&[6])]).unwrap();
        thread::sleep(Duration::from_millis(80));

        let published = sink.take();
        assert_eq!(published.len(), 1, "timeout should flush exactly once");
        let tensor = published[0].1.tensor().unwrap();
        assert_eq!(tensor.shape(), &[3, 1]);
        assert_eq!(tensor.data(), &[5, 6, 0]);
    }

    #[test]
    fn timeout_with_empty_cache_stays_silent() {
        let sink = CollectSink::new(1);
        let rig = TestRig::new(attrs(3, 10, true, 0), sink.clone());
        let mut func = CountBatchFunc::new();
        func.init(rig.ctx.clone()).unwrap();
        thread::sleep(Duration::from_millis(60));
        assert!(sink.take().is_empty());
    }

    #[test]
    fn sliding_window_keeps_tail() {
        let sink = CollectSink::new(1);
        let rig = TestRig::new(attrs(2, 0, false, 1), sink.clone());
        let mut func = CountBatchFunc::new();
        func.init(rig.ctx.clone()).unwrap();

        func.proc(&[i32_msg(vec![1], &[1], 0)]).unwrap();
        func.proc(&[i32_msg(vec![1], &[2], 0)]).unwrap();
        func.proc(&[i32_msg(vec![1], &[3], 0)]).unwrap();

        let published = sink.take();
        assert_eq!(published.len(), 2);
        assert_eq!(as_i32(published[0].1.tensor().unwrap().data()), vec![1, 2]);
        assert_eq!(as_i32(published[1].1.tensor().unwrap().data()), vec![2, 3]);
    }

    #[test]
    fn error_input_tags_all_outputs_and_clears_cache() {
        let sink = CollectSink::new(2);
        let rig = TestRig::new(attrs(4, 0, false, 0), sink.clone());
        let mut func = CountBatchFunc::new();
        func.init(rig.ctx.clone()).unwrap();

        let good = i32_msg(vec![1], &[1], 0);
        let mut bad = FlowMsg::with_tensor(Tensor::zeroed(vec![1], DataType::I32).unwrap());
        bad.set_ret_code(42);
        func.proc(&[good, bad.into_ref()]).unwrap();

        let published = sink.take();
        assert_eq!(published.len(), 2);
        for (i, (idx, msg)) in published.iter().enumerate() {
            assert_eq!(*idx, i);
            assert_eq!(msg.ret_code(), 42);
            assert_eq!(msg.tensor().unwrap().shape(), &[1]);
        }
        // cache dropped: a fresh window accepts a different stream count
        func.proc(&[i32_msg(vec![1], &[1], 0)]).unwrap();
    }

    #[test]
    fn shape_change_mid_batch_is_error() {
        let sink = CollectSink::new(1);
        let rig = TestRig::new(attrs(3, 0, false, 0), sink.clone());
        let mut func = CountBatchFunc::new();
        func.init(rig.ctx.clone()).unwrap();

        func.proc(&[i32_msg(vec![2], &[1, 2], 0)]).unwrap();
        func.proc(&[i32_msg(vec![3], &[1, 2, 3], 0)]).unwrap();

        let published = sink.take();
        assert_eq!(published.len(), 1);
        assert_ne!(published[0].1.ret_code(), 0);
    }

    #[test]
    fn rejects_bad_attrs() {
        let sink = CollectSink::new(1);
        let rig = TestRig::new(attrs(0, 0, false, 0), sink);
        let mut func = CountBatchFunc::new();
        assert!(func.init(rig.ctx.clone()).is_err());
    }
}
