//! Built-in time-batch operator.
//!
//! Accumulates per-stream windows of messages and republishes each window
//! as one concatenated tensor. The flush triggers are: the accumulated
//! window exactly reaching `window` microseconds, an EOS flag, or a SEG
//! flag; accumulating past the window is an error. `batch_dim` selects the
//! concatenation dimension (-1 adds a new leading dimension). With
//! `drop_remainder`, a short window at flush time is discarded instead of
//! published. Once EOS is observed, empty EOS markers go out on every
//! output after any data.

use std::sync::Arc;

use log::{debug, error, info};
use parking_lot::Mutex;

use crate::dump::DumpStepFilter;
use crate::error::{FlowError, FlowResult};
use crate::flowfunc::{FlowFunc, FuncContext};
use crate::msg::{FlowFlags, FlowMsg, FlowMsgRef, Tensor};

/// `window` value selecting flag-driven (dynamic) windows.
const DYNAMIC_WINDOW: i64 = -1;
/// `batch_dim` value selecting a new leading dimension.
const ADD_DIM: i64 = -1;

#[derive(Default)]
struct TimeState {
    cache: Vec<Vec<FlowMsgRef>>,
    start_time: u64,
    end_time: u64,
    batch_ok: bool,
    eos: bool,
    empty_msgs: bool,
    published: usize,
}

impl TimeState {
    fn reset(&mut self) {
        self.cache.clear();
        self.start_time = 0;
        self.end_time = 0;
        self.batch_ok = false;
        self.eos = false;
        self.empty_msgs = false;
        self.published = 0;
        debug!("time batch state reset");
    }
}

pub struct TimeBatchFunc {
    ctx: Option<Arc<FuncContext>>,
    window: i64,
    batch_dim: i64,
    drop_remainder: bool,
    output_num: usize,
    state: Mutex<TimeState>,
}

impl TimeBatchFunc {
    pub fn new() -> Self {
        Self {
            ctx: None,
            window: 0,
            batch_dim: ADD_DIM,
            drop_remainder: false,
            output_num: 0,
            state: Mutex::new(TimeState::default()),
        }
    }

    fn check_flow_info(state: &TimeState, inputs: &[FlowMsgRef]) -> FlowResult<()> {
        let msg0 = &inputs[0];
        if msg0.start_time() > msg0.end_time() {
            error!(
                "input start time {} greater than end time {}",
                msg0.start_time(),
                msg0.end_time()
            );
            return Err(FlowError::ParamInvalid("start time after end time".into()));
        }
        if !state.cache.is_empty() && msg0.start_time() < state.end_time {
            error!(
                "input start time {} precedes last end time {}",
                msg0.start_time(),
                state.end_time
            );
            return Err(FlowError::ParamInvalid("non-monotonic window times".into()));
        }
        for (i, msg) in inputs.iter().enumerate().skip(1) {
            if msg.start_time() != msg0.start_time()
                || msg.end_time() != msg0.end_time()
                || msg.flags() != msg0.flags()
            {
                error!("input[{i}] flow info differs from input[0]");
                return Err(FlowError::ParamInvalid("misaligned flow info".into()));
            }
        }
        Ok(())
    }

    fn shape_fits(&self, base: &[i64], shape: &[i64]) -> bool {
        if shape.len() != base.len() {
            return false;
        }
        if self.batch_dim == ADD_DIM {
            return shape == base;
        }
        shape
            .iter()
            .zip(base)
            .enumerate()
            .all(|(i, (s, b))| i as i64 == self.batch_dim || s == b)
    }

    fn check_tensor_info(&self, state: &TimeState, inputs: &[FlowMsgRef]) -> FlowResult<()> {
        for (i, msg) in inputs.iter().enumerate() {
            let tensor = msg
                .tensor()
                .ok_or_else(|| FlowError::ParamInvalid(format!("input[{i}] has no tensor")))?;
            if tensor.element_count() <= 0 {
                error!("input[{i}] element count {} <= 0", tensor.element_count());
                return Err(FlowError::ParamInvalid("empty tensor in batch".into()));
            }
            if let Some(cached) = state.cache.get(i).and_then(|c| c.first()) {
                let base = cached.tensor().expect("cached msgs carry tensors");
                if !self.shape_fits(base.shape(), tensor.shape()) {
                    error!("input[{i}] shape invalid for time batch");
                    return Err(FlowError::ParamInvalid("shape mismatch".into()));
                }
                if tensor.dtype() != base.dtype() {
                    error!("input[{i}] dtype differs from cached dtype");
                    return Err(FlowError::ParamInvalid("dtype mismatch".into()));
                }
            } else if self.batch_dim >= tensor.shape().len() as i64 {
                error!(
                    "batch dim {} out of range for input[{i}] rank {}",
                    self.batch_dim,
                    tensor.shape().len()
                );
                return Err(FlowError::ParamInvalid("batch dim out of range".into()));
            }
        }
        Ok(())
    }

    /// Returns the error code to tag outputs with when the row is invalid.
    fn check_input(&self, state: &mut TimeState, inputs: &[FlowMsgRef]) -> Result<(), i32> {
        let param_invalid = FlowError::ParamInvalid(String::new()).code();
        if inputs.len() != self.output_num {
            error!(
                "input num {} != output num {}",
                inputs.len(),
                self.output_num
            );
            return Err(param_invalid);
        }
        for (i, msg) in inputs.iter().enumerate() {
            if !msg.is_ok() {
                error!("input[{i}] carries error code {}", msg.ret_code());
                return Err(msg.ret_code());
            }
            let is_empty = msg.tensor().is_none();
            if state.empty_msgs != is_empty {
                if i == 0 {
                    state.empty_msgs = true;
                } else {
                    error!("input[{i}] empty={is_empty} differs from input[0]");
                    return Err(param_invalid);
                }
            }
        }
        if state.empty_msgs {
            debug!("current input row is empty msgs");
            return Ok(());
        }
        if !state.cache.is_empty() && inputs.len() != state.cache.len() {
            error!(
                "input num {} != cached stream num {}",
                inputs.len(),
                state.cache.len()
            );
            return Err(param_invalid);
        }
        if Self::check_flow_info(state, inputs).is_err() {
            return Err(param_invalid);
        }
        self.check_tensor_info(state, inputs)
            .map_err(|e| e.code())
    }

    /// Folds the row into the window state and decides whether to flush.
    fn update_state(&self, state: &mut TimeState, inputs: &[FlowMsgRef]) -> Result<(), i32> {
        let msg0 = &inputs[0];
        if state.empty_msgs {
            if msg0.flags().contains(FlowFlags::EOS) {
                state.batch_ok = true;
                state.eos = true;
                return Ok(());
            }
            error!("empty msg without EOS flag");
            return Err(FlowError::ParamInvalid(String::new()).code());
        }
        if state.cache.is_empty() {
            state.start_time = msg0.start_time();
        }
        state.end_time = msg0.end_time();
        let current = state.end_time - state.start_time;
        if self.window > 0 && current > self.window as u64 {
            error!("accumulated window {current} exceeds window {}", self.window);
            return Err(FlowError::ParamInvalid(String::new()).code());
        }
        if self.window > 0 && current == self.window as u64 {
            state.batch_ok = true;
        } else {
            if msg0.flags().contains(FlowFlags::EOS) {
                state.eos = true;
                state.batch_ok = true;
            }
            if msg0.flags().contains(FlowFlags::SEG) {
                state.batch_ok = true;
            }
        }
        if state.cache.is_empty() {
            state.cache = inputs.iter().map(|m| vec![m.clone()]).collect();
        } else {
            for (stream, msg) in state.cache.iter_mut().zip(inputs) {
                stream.push(msg.clone());
            }
        }
        Ok(())
    }

    fn publish_error_out(&self, ctx: &FuncContext, state: &TimeState, error_code: i32) {
        let mut msg = FlowMsg::empty();
        msg.set_ret_code(error_code);
        let msg = msg.into_ref();
        for i in state.published..self.output_num {
            if let Err(e) = ctx.set_output(i, msg.clone()) {
                error!("failed to set error output[{i}], code={error_code}: {e}");
                return;
            }
        }
    }

    fn publish_empty_eos(&self, ctx: &FuncContext, state: &mut TimeState) -> FlowResult<()> {
        let mut msg = FlowMsg::empty();
        msg.set_flags(FlowFlags::EOS);
        let msg = msg.into_ref();
        for i in 0..self.output_num {
            if let Err(e) = ctx.set_output(i, msg.clone()) {
                error!("failed to set empty eos output[{i}]: {e}");
                self.publish_error_out(ctx, state, e.code());
                return Err(e);
            }
            state.published += 1;
        }
        debug!("published empty eos msgs");
        Ok(())
    }

    fn batch_all(&self, ctx: &FuncContext, state: &mut TimeState) -> FlowResult<()> {
        for i in 0..state.cache.len() {
            let mut out =
                build_window_output(&state.cache[i], self.batch_dim, ctx.dump_filter())?;
            out.set_time_range(state.start_time, state.end_time);
            ctx.set_output(i, out.into_ref())?;
            state.published += 1;
        }
        Ok(())
    }
}

impl Default for TimeBatchFunc {
    fn default() -> Self {
        Self::new()
    }
}

/// Concatenates one stream's window. `batch_dim == -1` stacks along a new
/// leading dimension; otherwise tensors are interleaved slice-by-slice
/// along `batch_dim`.
fn build_window_output(
    cache: &[FlowMsgRef],
    batch_dim: i64,
    filter: &DumpStepFilter,
) -> FlowResult<FlowMsg> {
    let t0 = cache
        .first()
        .and_then(|m| m.tensor())
        .ok_or_else(|| FlowError::Internal("time batch window is empty".into()))?;
    let mut max_step = cache[0].step_id();
    let mut out_shape = t0.shape().to_vec();
    let dtype = t0.dtype();

    let data = if batch_dim == ADD_DIM {
        out_shape.insert(0, cache.len() as i64);
        let mut data = Vec::with_capacity(t0.data_size() * cache.len());
        for msg in cache {
            let tensor = msg.tensor().expect("validated non-empty");
            data.extend_from_slice(tensor.data());
            let step = msg.step_id();
            if filter.contains(step) && step > max_step {
                max_step = step;
            }
        }
        data
    } else {
        let dim = batch_dim as usize;
        let elem_size = t0.data_size() / t0.element_count() as usize;
        // bytes each tensor contributes per outer slice
        let mut copy_sizes = Vec::with_capacity(cache.len());
        let outer: i64 = t0.shape()[..dim].iter().product();
        for (i, msg) in cache.iter().enumerate() {
            let tensor = msg.tensor().expect("validated non-empty");
            let copy_elems: i64 = tensor.shape()[dim..].iter().product();
            copy_sizes.push(copy_elems as usize * elem_size);
            if i > 0 {
                out_shape[dim] += tensor.shape()[dim];
                let step = msg.step_id();
                if filter.contains(step) && step > max_step {
                    max_step = step;
                }
            }
        }
        let total: usize = copy_sizes.iter().map(|s| s * outer.max(1) as usize).sum();
        let mut data = Vec::with_capacity(total);
        let mut offsets = vec![0usize; cache.len()];
        for _ in 0..outer.max(1) {
            for (i, msg) in cache.iter().enumerate() {
                let bytes = msg.tensor().expect("validated non-empty").data();
                data.extend_from_slice(&bytes[offsets[i]..offsets[i] + copy_sizes[i]]);
                offsets[i] += copy_sizes[i];
            }
        }
        data
    };

    let mut out = FlowMsg::with_tensor(Tensor::new(out_shape, dtype, data)?);
    out.set_step_id(max_step);
    Ok(out)
}

impl FlowFunc for TimeBatchFunc {
    fn init(&mut self, ctx: Arc<FuncContext>) -> FlowResult<()> {
        debug!("time batch init begin");
        self.window = ctx.attr_i64("window")?;
        if self.window != DYNAMIC_WINDOW && self.window <= 0 {
            return Err(FlowError::ParamInvalid(format!(
                "attr [window] must be {} or positive, got {}",
                DYNAMIC_WINDOW, self.window
            )));
        }
        self.batch_dim = ctx.attr_i64("batch_dim")?;
        if self.batch_dim < ADD_DIM {
            return Err(FlowError::ParamInvalid(format!(
                "attr [batch_dim] must be >= {}, got {}",
                ADD_DIM, self.batch_dim
            )));
        }
        self.drop_remainder = ctx.attr_bool("drop_remainder")?;
        self.output_num = ctx.output_num();
        if self.output_num == 0 {
            return Err(FlowError::ParamInvalid("output num must be > 0".into()));
        }
        self.state.lock().reset();
        debug!(
            "time batch init end, window={}, batch_dim={}, drop_remainder={}",
            self.window, self.batch_dim, self.drop_remainder
        );
        self.ctx = Some(ctx);
        Ok(())
    }

    fn proc(&mut self, inputs: &[FlowMsgRef]) -> FlowResult<()> {
        let ctx = self
            .ctx
            .clone()
            .ok_or_else(|| FlowError::Internal("time batch proc before init".into()))?;
        let mut st = self.state.lock();
        if let Err(code) = self.check_input(&mut st, inputs) {
            self.publish_error_out(&ctx, &st, code);
            st.reset();
            return Ok(());
        }
        if let Err(code) = self.update_state(&mut st, inputs) {
            self.publish_error_out(&ctx, &st, code);
            st.reset();
            return Ok(());
        }
        let current = st.end_time - st.start_time;
        if !st.batch_ok {
            info!(
                "window at {current} of {}, waiting for more data",
                self.window
            );
            return Ok(());
        }
        if st.empty_msgs && st.cache.is_empty() {
            let _ = self.publish_empty_eos(&ctx, &mut st);
            st.reset();
            return Ok(());
        }
        let short_window = self.window > 0 && current < self.window as u64;
        if short_window && self.drop_remainder {
            debug!(
                "window {current} < {} with drop_remainder, dropping data",
                self.window
            );
            if st.eos {
                let _ = self.publish_empty_eos(&ctx, &mut st);
            }
            st.reset();
            return Ok(());
        }
        match self.batch_all(&ctx, &mut st) {
            Ok(()) => {
                if st.eos {
                    let _ = self.publish_empty_eos(&ctx, &mut st);
                }
            }
            Err(e) => {
                error!("time batch publish failed: {e}");
                self.publish_error_out(&ctx, &st, e.code());
            }
        }
        st.reset();
        Ok(())
    }

    fn reset_state(&mut self) -> bool {
        self.state.lock().reset();
        true
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::flowfunc::testing::{CollectSink, TestRig};
    use crate::manifest::AttrValue;
    use crate::msg::DataType;

    fn attrs(window: i64, batch_dim: i64, drop_remainder: bool) -> BTreeMap<String, AttrValue> {
        let mut map = BTreeMap::new();
        map.insert("window".into(), AttrValue::Int(window));
        map.insert("batch_dim".into(), AttrValue::Int(batch_dim));
        map.insert("drop_remainder".into(), AttrValue::Bool(drop_remainder));
        map
    }

    fn f32_msg(values: &[f32], start: u64, end: u64, flags: FlowFlags) -> FlowMsgRef {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut msg = FlowMsg::with_tensor(
            Tensor::new(vec![values.len() as i64], DataType::F32, bytes).unwrap(),
        );
        msg.set_time_range(start, end);
        msg.set_flags(flags);
        msg.into_ref()
    }

    fn eos_msg(start: u64, end: u64) -> FlowMsgRef {
        let mut msg = FlowMsg::empty();
        msg.set_time_range(start, end);
        msg.set_flags(FlowFlags::EOS);
        msg.into_ref()
    }

    fn as_f32(data: &[u8]) -> Vec<f32> {
        data.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn make_func(rig: &TestRig) -> TimeBatchFunc {
        let mut func = TimeBatchFunc::new();
        func.init(rig.ctx.clone()).unwrap();
        func
    }

    #[test]
    fn window_closes_exactly_by_time() {
        let sink = CollectSink::new(1);
        let rig = TestRig::new(attrs(1000, 0, false), sink.clone());
        let mut func = make_func(&rig);

        func.proc(&[f32_msg(&[1.0], 0, 300, FlowFlags::empty())]).unwrap();
        func.proc(&[f32_msg(&[2.0], 300, 600, FlowFlags::empty())]).unwrap();
        assert!(sink.take().is_empty(), "window still open");
        func.proc(&[f32_msg(&[3.0], 600, 1000, FlowFlags::empty())]).unwrap();

        let published = sink.take();
        assert_eq!(published.len(), 1);
        let out = &published[0].1;
        let tensor = out.tensor().unwrap();
        assert_eq!(tensor.shape(), &[3]);
        assert_eq!(as_f32(tensor.data()), vec![1.0, 2.0, 3.0]);
        assert_eq!(out.start_time(), 0);
        assert_eq!(out.end_time(), 1000);
    }

    #[test]
    fn eos_with_drop_remainder_drops_data_and_emits_eos() {
        let sink = CollectSink::new(1);
        let rig = TestRig::new(attrs(1000, 0, true), sink.clone());
        let mut func = make_func(&rig);

        func.proc(&[f32_msg(&[1.0], 0, 500, FlowFlags::empty())]).unwrap();
        func.proc(&[eos_msg(500, 500)]).unwrap();

        let published = sink.take();
        assert_eq!(published.len(), 1);
        let out = &published[0].1;
        assert!(out.tensor().is_none());
        assert!(out.flags().contains(FlowFlags::EOS));
    }

    #[test]
    fn eos_flush_publishes_data_then_eos_marker() {
        let sink = CollectSink::new(1);
        let rig = TestRig::new(attrs(1000, 0, false), sink.clone());
        let mut func = make_func(&rig);

        func.proc(&[f32_msg(&[7.0], 0, 400, FlowFlags::EOS)]).unwrap();

        let published = sink.take();
        assert_eq!(published.len(), 2);
        assert_eq!(as_f32(published[0].1.tensor().unwrap().data()), vec![7.0]);
        assert!(published[1].1.tensor().is_none());
        assert!(published[1].1.flags().contains(FlowFlags::EOS));
    }

    #[test]
    fn seg_flag_flushes_dynamic_window() {
        let sink = CollectSink::new(1);
        let rig = TestRig::new(attrs(-1, -1, false), sink.clone());
        let mut func = make_func(&rig);

        func.proc(&[f32_msg(&[1.0, 2.0], 0, 100, FlowFlags::empty())]).unwrap();
        func.proc(&[f32_msg(&[3.0, 4.0], 100, 200, FlowFlags::SEG)]).unwrap();

        let published = sink.take();
        assert_eq!(published.len(), 1);
        let tensor = published[0].1.tensor().unwrap();
        // add-dim mode stacks the two cached msgs
        assert_eq!(tensor.shape(), &[2, 2]);
        assert_eq!(as_f32(tensor.data()), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn over_window_is_error() {
        let sink = CollectSink::new(1);
        let rig = TestRig::new(attrs(1000, 0, false), sink.clone());
        let mut func = make_func(&rig);

        func.proc(&[f32_msg(&[1.0], 0, 1500, FlowFlags::empty())]).unwrap();

        let published = sink.take();
        assert_eq!(published.len(), 1);
        assert_ne!(published[0].1.ret_code(), 0);
    }

    #[test]
    fn non_monotonic_start_is_error() {
        let sink = CollectSink::new(1);
        let rig = TestRig::new(attrs(1000, 0, false), sink.clone());
        let mut func = make_func(&rig);

        func.proc(&[f32_msg(&[1.0], 0, 400, FlowFlags::empty())]).unwrap();
        func.proc(&[f32_msg(&[2.0], 200, 600, FlowFlags::empty())]).unwrap();

        let published = sink.take();
        assert_eq!(published.len(), 1);
        assert_ne!(published[0].1.ret_code(), 0);
    }

    #[test]
    fn mismatched_flow_info_across_streams_is_error() {
        let sink = CollectSink::new(2);
        let rig = TestRig::new(attrs(1000, 0, false), sink.clone());
        let mut func = make_func(&rig);

        func.proc(&[
            f32_msg(&[1.0], 0, 300, FlowFlags::empty()),
            f32_msg(&[2.0], 0, 400, FlowFlags::empty()),
        ])
        .unwrap();

        let published = sink.take();
        assert_eq!(published.len(), 2);
        assert!(published.iter().all(|(_, m)| m.ret_code() != 0));
    }

    #[test]
    fn batch_dim_zero_sums_leading_dimension() {
        let sink = CollectSink::new(1);
        let rig = TestRig::new(attrs(-1, 0, false), sink.clone());
        let mut func = make_func(&rig);

        func.proc(&[f32_msg(&[1.0, 2.0], 0, 100, FlowFlags::empty())]).unwrap();
        func.proc(&[f32_msg(&[3.0], 100, 200, FlowFlags::SEG)]).unwrap();

        let published = sink.take();
        assert_eq!(published.len(), 1);
        let tensor = published[0].1.tensor().unwrap();
        assert_eq!(tensor.shape(), &[3]);
        assert_eq!(as_f32(tensor.data()), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn rejects_zero_window() {
        let sink = CollectSink::new(1);
        let rig = TestRig::new(attrs(0, 0, false), sink);
        let mut func = TimeBatchFunc::new();
        assert!(func.init(rig.ctx.clone()).is_err());
    }
}
