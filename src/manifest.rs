//! Model manifest: what the graph compiler hands the executor.
//!
//! A manifest is a JSON list of model descriptions. Each description
//! declares the flat input/output queue lists, per-sub-operator index maps
//! into those lists, an optional status-output queue, alignment policy,
//! scheduling priority hints and the free-form attribute map the built-in
//! operators read. The executor never mutates a manifest after `Init`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, FlowResult};

/// Priority value meaning "not requested by the user".
pub const UNSET_PRIORITY: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDevInfo {
    pub device_id: u32,
    pub queue_id: u32,
    #[serde(default)]
    pub is_proxy: bool,
    #[serde(default)]
    pub logic_queue_id: u32,
    #[serde(default)]
    pub device_type: i32,
}

impl QueueDevInfo {
    pub fn local(device_id: u32, queue_id: u32) -> Self {
        Self {
            device_id,
            queue_id,
            is_proxy: false,
            logic_queue_id: queue_id,
            device_type: 0,
        }
    }

    /// Two queues are the same queue iff (device-id, queue-id) match.
    pub fn same_queue(&self, other: &QueueDevInfo) -> bool {
        self.device_id == other.device_id && self.queue_id == other.queue_id
    }

    pub fn key(&self) -> (u32, u32) {
        (self.device_id, self.queue_id)
    }
}

/// Typed attribute values referenced by name from operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl AttrValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

/// How a processor aligns messages across several input queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AlignPolicy {
    /// One pending message per input; wait until every input has one.
    #[default]
    Strict,
    /// Buffer up to `max` messages per input while waiting for stragglers.
    CacheUpTo { max: u32 },
    /// Discard a partially assembled row when siblings stay empty.
    DropWhenMisaligned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDesc {
    pub name: String,
    pub instance_name: String,
    /// Operator type name for the single-func case; sub-operator names come
    /// from the index maps otherwise.
    pub flow_func_name: String,
    pub input_queues: Vec<QueueDevInfo>,
    pub output_queues: Vec<QueueDevInfo>,
    #[serde(default)]
    pub func_input_maps: BTreeMap<String, Vec<u32>>,
    #[serde(default)]
    pub func_output_maps: BTreeMap<String, Vec<u32>>,
    #[serde(default)]
    pub status_output_queue: Option<QueueDevInfo>,
    #[serde(default)]
    pub need_report_status: bool,
    #[serde(default)]
    pub enable_raise_exception: bool,
    #[serde(default)]
    pub report_interval_ms: Option<u64>,
    #[serde(default)]
    pub input_align: AlignPolicy,
    #[serde(default = "unset_priority")]
    pub esched_process_priority: i32,
    #[serde(default = "unset_priority")]
    pub esched_event_priority: i32,
    #[serde(default)]
    pub cpu_num: Option<u32>,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub model_uuid: u32,
    #[serde(default)]
    pub attrs: BTreeMap<String, AttrValue>,
}

fn unset_priority() -> i32 {
    UNSET_PRIORITY
}

/// One sub-operator resolved against the model's flat queue lists.
#[derive(Debug, Clone)]
pub struct SubFunc {
    pub func_name: String,
    pub input_queues: Vec<QueueDevInfo>,
    pub output_indexes: Vec<u32>,
}

impl ModelDesc {
    /// Index-map validity per the manifest contract: input indices refer to
    /// entries of the input list, output indices to the output list.
    /// Duplicate input references across sub-operators surface later, in
    /// executor init, as a queue-binding conflict.
    pub fn validate(&self) -> FlowResult<()> {
        if self.input_queues.is_empty() {
            return Err(FlowError::ParamInvalid(format!(
                "model {} declares no input queues",
                self.instance_name
            )));
        }
        let inputs = self.input_queues.len() as u32;
        let outputs = self.output_queues.len() as u32;
        for (func, indexes) in &self.func_input_maps {
            for &idx in indexes {
                if idx >= inputs {
                    return Err(FlowError::ParamInvalid(format!(
                        "func {func} input index {idx} out of range [0, {inputs})"
                    )));
                }
            }
        }
        for (func, indexes) in &self.func_output_maps {
            for &idx in indexes {
                if idx >= outputs {
                    return Err(FlowError::ParamInvalid(format!(
                        "func {func} output index {idx} out of range [0, {outputs})"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolves the per-sub-operator queue bindings. An empty input map
    /// means a single operator consuming the whole input list; a missing
    /// output map entry grants the operator every output index.
    pub fn sub_funcs(&self) -> Vec<SubFunc> {
        if self.func_input_maps.is_empty() {
            return vec![SubFunc {
                func_name: self.flow_func_name.clone(),
                input_queues: self.input_queues.clone(),
                output_indexes: (0..self.output_queues.len() as u32).collect(),
            }];
        }
        self.func_input_maps
            .iter()
            .map(|(func, indexes)| {
                let input_queues = indexes
                    .iter()
                    .map(|&i| self.input_queues[i as usize].clone())
                    .collect();
                let output_indexes = match self.func_output_maps.get(func) {
                    Some(map) => map.clone(),
                    None => (0..self.output_queues.len() as u32).collect(),
                };
                SubFunc {
                    func_name: func.clone(),
                    input_queues,
                    output_indexes,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelManifest {
    pub models: Vec<ModelDesc>,
}

impl ModelManifest {
    pub fn load(path: &Path) -> FlowResult<Self> {
        let bytes = fs::read(path).map_err(|e| {
            FlowError::ParamInvalid(format!("read manifest {}: {e}", path.display()))
        })?;
        let manifest: ModelManifest = serde_json::from_slice(&bytes).map_err(|e| {
            FlowError::ParamInvalid(format!("parse manifest {}: {e}", path.display()))
        })?;
        for model in &manifest.models {
            model.validate()?;
        }
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_model() -> ModelDesc {
        ModelDesc {
            name: "graph/a".into(),
            instance_name: "a".into(),
            flow_func_name: "_BuiltIn_CountBatch".into(),
            input_queues: vec![QueueDevInfo::local(0, 1), QueueDevInfo::local(0, 2)],
            output_queues: vec![QueueDevInfo::local(0, 3)],
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
            model_uuid: 0,
            attrs: BTreeMap::new(),
        }
    }

    #[test]
    fn single_func_consumes_all_inputs() {
        let model = base_model();
        model.validate().unwrap();
        let subs = model.sub_funcs();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].input_queues.len(), 2);
        assert_eq!(subs[0].output_indexes, vec![0]);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut model = base_model();
        model.func_input_maps.insert("f0".into(), vec![5]);
        assert!(model.validate().is_err());
        let mut model = base_model();
        model.func_output_maps.insert("f0".into(), vec![9]);
        model.func_input_maps.insert("f0".into(), vec![0]);
        assert!(model.validate().is_err());
    }

    #[test]
    fn attrs_parse_typed_values() {
        let json = r#"{
            "models": [{
                "name": "g/m", "instance_name": "m",
                "flow_func_name": "_BuiltIn_TimeBatch",
                "input_queues": [{"device_id": 0, "queue_id": 1}],
                "output_queues": [{"device_id": 0, "queue_id": 2}],
                "attrs": {"window": 1000, "drop_remainder": true, "tag": "x"}
            }]
        }"#;
        let manifest: ModelManifest = serde_json::from_str(json).unwrap();
        let attrs = &manifest.models[0].attrs;
        assert_eq!(attrs["window"].as_i64(), Some(1000));
        assert_eq!(attrs["drop_remainder"].as_bool(), Some(true));
        assert_eq!(attrs["tag"].as_str(), Some("x"));
    }

    #[test]
    fn align_policy_parses() {
        let strict: AlignPolicy = serde_json::from_str(r#""strict""#).unwrap();
        assert_eq!(strict, AlignPolicy::Strict);
        let cached: AlignPolicy =
            serde_json::from_str(r#"{"cache_up_to": {"max": 4}}"#).unwrap();
        assert_eq!(cached, AlignPolicy::CacheUpTo { max: 4 });
    }
}
