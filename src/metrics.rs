//! Per-processor counters and the periodic metrics dump.
//!
//! Counters are plain atomics updated on the hot path; the dumper snapshots
//! them on a timer, logs a summary line per processor and appends a CSV row
//! so a run can be analysed offline.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{error, info};

/// Counters owned by one processor.
#[derive(Debug)]
pub struct ProcessorMetrics {
    /// Messages consumed per input queue.
    consumed: Vec<AtomicU64>,
    produced: AtomicU64,
    proc_errors: AtomicU64,
    schedule_runs: AtomicU64,
}

impl ProcessorMetrics {
    pub fn new(input_num: usize) -> Self {
        Self {
            consumed: (0..input_num).map(|_| AtomicU64::new(0)).collect(),
            produced: AtomicU64::new(0),
            proc_errors: AtomicU64::new(0),
            schedule_runs: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_consumed(&self, input_idx: usize) {
        if let Some(counter) = self.consumed.get(input_idx) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_produced(&self) {
        self.produced.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_proc_error(&self) {
        self.proc_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_schedule(&self) {
        self.schedule_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consumed_total(&self) -> u64 {
        self.consumed.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            consumed: self.consumed.iter().map(|c| c.load(Ordering::Relaxed)).collect(),
            produced: self.produced.load(Ordering::Relaxed),
            proc_errors: self.proc_errors.load(Ordering::Relaxed),
            schedule_runs: self.schedule_runs.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub consumed: Vec<u64>,
    pub produced: u64,
    pub proc_errors: u64,
    pub schedule_runs: u64,
}

/// Logs one line per processor and optionally appends CSV rows.
pub fn dump_metrics(rows: &[(String, MetricsSnapshot)], csv_path: Option<&Path>) {
    for (name, snap) in rows {
        info!(
            "[Metrics] {name}: consumed={:?} produced={} errors={} schedules={}",
            snap.consumed, snap.produced, snap.proc_errors, snap.schedule_runs
        );
    }
    let Some(path) = csv_path else {
        return;
    };
    let new_file = !path.exists();
    let file = match OpenOptions::new().create(true).append(true).open(path) {
        Ok(f) => f,
        Err(e) => {
            error!("failed to open metrics csv {}: {e}", path.display());
            return;
        }
    };
    let mut wtr = csv::Writer::from_writer(file);
    if new_file {
        let _ = wtr.write_record(["processor", "consumed", "produced", "errors", "schedules"]);
    }
    for (name, snap) in rows {
        let consumed: u64 = snap.consumed.iter().sum();
        let _ = wtr.write_record([
            name.clone(),
            consumed.to_string(),
            snap.produced.to_string(),
            snap.proc_errors.to_string(),
            snap.schedule_runs.to_string(),
        ]);
    }
    if let Err(e) = wtr.flush() {
        error!("failed to flush metrics csv: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = ProcessorMetrics::new(2);
        m.record_consumed(0);
        m.record_consumed(0);
        m.record_consumed(1);
        m.record_produced();
        m.record_proc_error();
        let snap = m.snapshot();
        assert_eq!(snap.consumed, vec![2, 1]);
        assert_eq!(snap.produced, 1);
        assert_eq!(snap.proc_errors, 1);
        assert_eq!(m.consumed_total(), 3);
    }

    #[test]
    fn out_of_range_input_is_ignored() {
        let m = ProcessorMetrics::new(1);
        m.record_consumed(5);
        assert_eq!(m.consumed_total(), 0);
    }

    #[test]
    fn csv_dump_appends_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        let m = ProcessorMetrics::new(1);
        m.record_consumed(0);
        dump_metrics(&[("p0".into(), m.snapshot())], Some(&path));
        dump_metrics(&[("p0".into(), m.snapshot())], Some(&path));
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("processor,"));
        assert_eq!(text.lines().count(), 3);
    }
}
