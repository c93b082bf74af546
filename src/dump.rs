//! Dump configuration and the step filter used by the batchers.
//!
//! The step grammar is a `_`-separated token list; each token is either a
//! decimal step id or an inclusive `low-high` range. An unset filter accepts
//! every step.

use log::warn;

use crate::error::{FlowError, FlowResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpMode {
    Input,
    Output,
    #[default]
    All,
}

impl DumpMode {
    pub fn parse(s: &str) -> FlowResult<Self> {
        match s {
            "input" => Ok(DumpMode::Input),
            "output" => Ok(DumpMode::Output),
            "all" => Ok(DumpMode::All),
            other => Err(FlowError::ParamInvalid(format!(
                "dump mode must be input/output/all, got {other}"
            ))),
        }
    }
}

/// Which step ids are selected for dumping.
#[derive(Debug, Clone, Default)]
pub struct DumpStepFilter {
    spec: String,
    steps: Vec<u32>,
    ranges: Vec<(u32, u32)>,
}

impl DumpStepFilter {
    pub fn parse(spec: &str) -> FlowResult<Self> {
        let mut filter = DumpStepFilter {
            spec: spec.to_string(),
            ..Default::default()
        };
        if spec.is_empty() {
            return Ok(filter);
        }
        for token in spec.split('_') {
            match token.split_once('-') {
                None => {
                    let step: u32 = token.parse().map_err(|_| {
                        FlowError::ParamInvalid(format!("invalid dump step token {token}"))
                    })?;
                    filter.steps.push(step);
                }
                Some((lo, hi)) => {
                    let lo: u32 = lo.parse().map_err(|_| {
                        FlowError::ParamInvalid(format!("invalid dump step range {token}"))
                    })?;
                    let hi: u32 = hi.parse().map_err(|_| {
                        FlowError::ParamInvalid(format!("invalid dump step range {token}"))
                    })?;
                    if lo > hi {
                        return Err(FlowError::ParamInvalid(format!(
                            "dump step range {token} is reversed"
                        )));
                    }
                    filter.ranges.push((lo, hi));
                }
            }
        }
        Ok(filter)
    }

    /// Unset spec selects every step.
    pub fn contains(&self, step_id: u32) -> bool {
        if self.spec.is_empty() {
            return true;
        }
        self.steps.contains(&step_id)
            || self.ranges.iter().any(|&(lo, hi)| step_id >= lo && step_id <= hi)
    }
}

/// Dump attributes handed in on the command line.
#[derive(Debug, Clone, Default)]
pub struct DumpConfig {
    pub enabled: bool,
    pub path: String,
    pub mode: DumpMode,
    pub step_filter: DumpStepFilter,
}

impl DumpConfig {
    pub fn from_attrs(
        enabled: bool,
        path: Option<&str>,
        step: Option<&str>,
        mode: Option<&str>,
    ) -> FlowResult<Self> {
        let step_filter = match step {
            Some(s) => match DumpStepFilter::parse(s) {
                Ok(f) => f,
                Err(e) => {
                    // malformed step spec disables dumping rather than
                    // failing startup
                    warn!("invalid dump step spec, dump disabled: {e}");
                    return Ok(DumpConfig::default());
                }
            },
            None => DumpStepFilter::default(),
        };
        let mode = match mode {
            Some(m) => DumpMode::parse(m)?,
            None => DumpMode::default(),
        };
        Ok(DumpConfig {
            enabled,
            path: path.unwrap_or("").to_string(),
            mode,
            step_filter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_accepts_all() {
        let f = DumpStepFilter::parse("").unwrap();
        assert!(f.contains(0));
        assert!(f.contains(12345));
    }

    #[test]
    fn singles_and_ranges() {
        let f = DumpStepFilter::parse("1_4_10-20").unwrap();
        assert!(f.contains(1));
        assert!(f.contains(4));
        assert!(!f.contains(5));
        assert!(f.contains(10));
        assert!(f.contains(15));
        assert!(f.contains(20));
        assert!(!f.contains(21));
    }

    #[test]
    fn rejects_garbage() {
        assert!(DumpStepFilter::parse("1_x").is_err());
        assert!(DumpStepFilter::parse("9-3").is_err());
    }

    #[test]
    fn mode_parse() {
        assert_eq!(DumpMode::parse("input").unwrap(), DumpMode::Input);
        assert_eq!(DumpMode::parse("all").unwrap(), DumpMode::All);
        assert!(DumpMode::parse("weird").is_err());
    }
}
