//! Tensor messages flowing between processors.
//!
//! A `FlowMsg` is logically a tagged union of {tensor data, empty marker,
//! error marker}: an error marker has a non-zero return code, an empty
//! marker carries no tensor. Messages are shared behind `Arc`; the executor
//! holds a strong reference only while the message is in flight.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, FlowResult, CODE_SUCCESS};

/// Element type of a tensor. `F16`/`Bf16` payloads are raw 16-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    F32,
    F16,
    Bf16,
    F64,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    Bool,
}

impl DataType {
    pub fn size(&self) -> usize {
        match self {
            DataType::I8 | DataType::U8 | DataType::Bool => 1,
            DataType::F16 | DataType::Bf16 | DataType::I16 | DataType::U16 => 2,
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
        }
    }
}

bitflags! {
    /// Flow control flags carried on every message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FlowFlags: u32 {
        /// End of stream: the producer will send nothing further.
        const EOS = 0b01;
        /// Segment boundary: close the current batching window.
        const SEG = 0b10;
    }
}

/// Dense tensor: shape, element type and contiguous bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<i64>,
    dtype: DataType,
    data: Vec<u8>,
}

impl Tensor {
    /// Builds a tensor after validating that the byte length matches the
    /// shape. Negative dimensions are rejected.
    pub fn new(shape: Vec<i64>, dtype: DataType, data: Vec<u8>) -> FlowResult<Self> {
        if shape.iter().any(|&d| d < 0) {
            return Err(FlowError::ParamInvalid(format!(
                "negative dimension in shape {:?}",
                shape
            )));
        }
        let expect = element_count(&shape) as usize * dtype.size();
        if expect != data.len() {
            return Err(FlowError::ParamInvalid(format!(
                "shape {:?} needs {} bytes but buffer holds {}",
                shape,
                expect,
                data.len()
            )));
        }
        Ok(Self { shape, dtype, data })
    }

    /// Allocates a zero-filled tensor of the given shape.
    pub fn zeroed(shape: Vec<i64>, dtype: DataType) -> FlowResult<Self> {
        if shape.iter().any(|&d| d < 0) {
            return Err(FlowError::ParamInvalid(format!(
                "negative dimension in shape {:?}",
                shape
            )));
        }
        let size = element_count(&shape) as usize * dtype.size();
        Ok(Self {
            shape,
            dtype,
            data: vec![0u8; size],
        })
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn element_count(&self) -> i64 {
        element_count(&self.shape)
    }

    pub fn data_size(&self) -> usize {
        self.data.len()
    }
}

fn element_count(shape: &[i64]) -> i64 {
    shape.iter().product::<i64>()
}

/// Shared reference to a message in flight.
pub type FlowMsgRef = Arc<FlowMsg>;

/// One message buffer: tensor payload or raw bytes, plus flow metadata.
#[derive(Debug, Clone, Default)]
pub struct FlowMsg {
    tensor: Option<Tensor>,
    raw: Vec<u8>,
    ret_code: i32,
    flags: FlowFlags,
    start_time: u64,
    end_time: u64,
    step_id: u32,
}

impl FlowMsg {
    pub fn with_tensor(tensor: Tensor) -> Self {
        Self {
            tensor: Some(tensor),
            ..Default::default()
        }
    }

    /// Empty marker (no tensor). Used as EOS carrier and for errors on
    /// tensorless paths.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Raw payload message for the control / status wire.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            raw: bytes,
            ..Default::default()
        }
    }

    /// Error marker: dummy-shape one-byte tensor tagged with `code`.
    pub fn error(code: i32) -> Self {
        let tensor = Tensor::zeroed(vec![1], DataType::I8).expect("1-byte tensor");
        Self {
            tensor: Some(tensor),
            ret_code: code,
            ..Default::default()
        }
    }

    pub fn tensor(&self) -> Option<&Tensor> {
        self.tensor.as_ref()
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn ret_code(&self) -> i32 {
        self.ret_code
    }

    pub fn set_ret_code(&mut self, code: i32) {
        self.ret_code = code;
    }

    pub fn is_ok(&self) -> bool {
        self.ret_code == CODE_SUCCESS
    }

    pub fn flags(&self) -> FlowFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: FlowFlags) {
        self.flags = flags;
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    pub fn end_time(&self) -> u64 {
        self.end_time
    }

    pub fn set_time_range(&mut self, start: u64, end: u64) {
        self.start_time = start;
        self.end_time = end;
    }

    pub fn step_id(&self) -> u32 {
        self.step_id
    }

    pub fn set_step_id(&mut self, step_id: u32) {
        self.step_id = step_id;
    }

    pub fn into_ref(self) -> FlowMsgRef {
        Arc::new(self)
    }
}

impl fmt::Display for FlowMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tensor {
            Some(t) => write!(
                f,
                "FlowMsg(shape={:?}, dtype={:?}, ret={}, flags={:?}, t=[{},{}], step={})",
                t.shape(),
                t.dtype(),
                self.ret_code,
                self.flags,
                self.start_time,
                self.end_time,
                self.step_id
            ),
            None => write!(
                f,
                "FlowMsg(empty, ret={}, flags={:?}, t=[{},{}])",
                self.ret_code, self.flags, self.start_time, self.end_time
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_size_math() {
        let t = Tensor::zeroed(vec![2, 3], DataType::I32).unwrap();
        assert_eq!(t.element_count(), 6);
        assert_eq!(t.data_size(), 24);
    }

    #[test]
    fn tensor_rejects_mismatched_buffer() {
        let err = Tensor::new(vec![4], DataType::F32, vec![0u8; 8]).unwrap_err();
        assert_eq!(err.code(), FlowError::ParamInvalid(String::new()).code());
    }

    #[test]
    fn tensor_rejects_negative_dim() {
        assert!(Tensor::zeroed(vec![-1, 2], DataType::U8).is_err());
    }

    #[test]
    fn zero_element_tensor_is_legal() {
        // legal as an EOS carrier, invalid only for batching ops
        let t = Tensor::zeroed(vec![0, 4], DataType::F32).unwrap();
        assert_eq!(t.element_count(), 0);
        assert_eq!(t.data_size(), 0);
    }

    #[test]
    fn error_msg_has_dummy_shape() {
        let msg = FlowMsg::error(6);
        assert!(!msg.is_ok());
        assert_eq!(msg.tensor().unwrap().shape(), &[1]);
    }
}
