use std::collections::BTreeMap;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use rand::Rng;

use flow_executor::driver::{Driver, Hal};
use flow_executor::dump::DumpStepFilter;
use flow_executor::error::FlowResult;
use flow_executor::flowfunc::count_batch::CountBatchFunc;
use flow_executor::flowfunc::{FlowFunc, FuncContext, OutputSink};
use flow_executor::manifest::AttrValue;
use flow_executor::msg::{DataType, FlowMsg, FlowMsgRef, Tensor};
use flow_executor::timer::TimerService;

struct NullSink;

impl OutputSink for NullSink {
    fn output_num(&self) -> usize {
        1
    }

    fn set_output(&self, _index: usize, _msg: FlowMsgRef) -> FlowResult<()> {
        Ok(())
    }
}

fn count_batch_proc_bench(c: &mut Criterion) {
    const BATCH: i64 = 8;
    let mut attrs = BTreeMap::new();
    attrs.insert("batch_size".to_string(), AttrValue::Int(BATCH));
    attrs.insert("timeout".to_string(), AttrValue::Int(0));
    attrs.insert("padding".to_string(), AttrValue::Bool(false));
    attrs.insert("slide_stride".to_string(), AttrValue::Int(0));

    let timers = TimerService::new(Driver::new(Arc::new(Hal::new())), 0, 1);
    let ctx = FuncContext::new(
        attrs,
        Arc::new(NullSink),
        timers.clone(),
        Arc::new(DumpStepFilter::default()),
    );
    let mut func = CountBatchFunc::new();
    func.init(ctx).unwrap();

    let mut rng = rand::rng();
    let msgs: Vec<FlowMsgRef> = (0..BATCH)
        .map(|_| {
            let data: Vec<u8> = (0..1024).map(|_| rng.random()).collect();
            FlowMsg::with_tensor(Tensor::new(vec![1024], DataType::U8, data).unwrap()).into_ref()
        })
        .collect();

    c.bench_function("count_batch_full_window", |b| {
        b.iter(|| {
            for msg in &msgs {
                func.proc(std::slice::from_ref(msg)).unwrap();
            }
        })
    });
    timers.finalize();
}

criterion_group!(benches, count_batch_proc_bench);
criterion_main!(benches);
