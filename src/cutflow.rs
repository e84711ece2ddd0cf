use std::fmt::Display;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{DimuonError, DimuonResult};

/// Ordered selection stages with the number of events passing each.
///
/// An event passes stage `k` only if it passed every stage before it, so the counts never
/// increase along the list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CutFlow {
    total: u64,
    stages: IndexMap<String, u64>,
}

impl CutFlow {
    /// Create a [`CutFlow`] with the given stage names, all counts zero.
    pub fn new<I, S>(stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            total: 0,
            stages: stages.into_iter().map(|name| (name.into(), 0)).collect(),
        }
    }

    /// Record one event which passed the first `passed` stages (and failed the next one, if any).
    pub fn record(&mut self, passed: usize) {
        self.total += 1;
        for count in self.stages.values_mut().take(passed) {
            *count += 1;
        }
    }

    /// Add the counts of another cut flow with the same stages.
    pub fn merge(&mut self, other: &CutFlow) -> DimuonResult<()> {
        if !self.stages.keys().eq(other.stages.keys()) {
            return Err(DimuonError::Configuration(format!(
                "cannot merge cut flows with different stages: {:?} and {:?}",
                self.stages.keys().collect::<Vec<_>>(),
                other.stages.keys().collect::<Vec<_>>()
            )));
        }
        self.total += other.total;
        for (count, other_count) in self.stages.values_mut().zip(other.stages.values()) {
            *count += other_count;
        }
        Ok(())
    }

    /// The number of recorded events.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn n_stages(&self) -> usize {
        self.stages.len()
    }

    /// The number of events passing the named stage.
    pub fn passed(&self, stage: &str) -> Option<u64> {
        self.stages.get(stage).copied()
    }

    /// An empty cut flow with the same stages.
    pub fn zeroed(&self) -> Self {
        Self::new(self.stages.keys().cloned())
    }

    /// A read-only snapshot of the current counts.
    pub fn report(&self) -> CutFlowReport {
        let mut all = self.total;
        let stages = self
            .stages
            .iter()
            .map(|(name, passed)| {
                let stage = StageReport {
                    name: name.clone(),
                    passed: *passed,
                    all,
                };
                all = *passed;
                stage
            })
            .collect();
        CutFlowReport {
            total: self.total,
            stages,
        }
    }
}

/// One line of a [`CutFlowReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    /// Events passing this stage.
    pub passed: u64,
    /// Events entering this stage.
    pub all: u64,
}

impl StageReport {
    /// Percentage of entering events which pass.
    pub fn efficiency(&self) -> f64 {
        percentage(self.passed, self.all)
    }
}

/// A snapshot of a [`CutFlow`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CutFlowReport {
    total: u64,
    stages: Vec<StageReport>,
}

impl CutFlowReport {
    /// The number of events entering the first stage.
    pub fn total(&self) -> u64 {
        self.total
    }
    pub fn stages(&self) -> &[StageReport] {
        &self.stages
    }
    pub fn get(&self, stage: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == stage)
    }
    /// The number of events passing the named stage.
    pub fn passed(&self, stage: &str) -> Option<u64> {
        self.get(stage).map(|s| s.passed)
    }
    /// Events passing the last stage.
    pub fn selected(&self) -> u64 {
        self.stages.last().map_or(self.total, |s| s.passed)
    }
    /// Percentage of all events passing the named stage and every stage before it.
    pub fn cumulative_efficiency(&self, stage: &str) -> Option<f64> {
        self.passed(stage)
            .map(|passed| percentage(passed, self.total))
    }
}

fn percentage(passed: u64, all: u64) -> f64 {
    if all == 0 {
        0.0
    } else {
        passed as f64 / all as f64 * 100.0
    }
}

impl Display for CutFlowReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let width = self.stages.iter().map(|s| s.name.len()).max().unwrap_or(0);
        for stage in &self.stages {
            writeln!(
                f,
                "{:<width$}: pass={:<10} all={:<10} -- eff={:.2} % cumulative eff={:.2} %",
                stage.name,
                stage.passed,
                stage.all,
                stage.efficiency(),
                percentage(stage.passed, self.total),
            )?;
        }
        Ok(())
    }
}
