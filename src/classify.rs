//! Named dimuon categories as a declarative rule table.
//!
//! A [`Category`] combines event-level filters (which become cut-flow stages) with a
//! [`CandidateRule`] evaluated per accepted pair. Categories are not mutually exclusive: one pair
//! may be counted in several of them.
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    data::{DimuonCandidate, Event},
    histogram::Binning,
    selection::{PairSelector, PairingMode, QualityGate},
    DimuonError, DimuonResult,
};

/// The quarkonium trigger of the low-$`p_T`$ family.
pub const QUARKONIUM_TRIGGER: &str = "HLT_DoubleMu3_Quarkonium";
/// The numeric dimuon trigger threshold of the high-$`p_T`$ sample.
pub const DIMUON_THRESHOLD: &str = "Trig_DoubleMuThresh";
/// The numeric J/$`\psi`$ trigger threshold.
pub const JPSI_THRESHOLD: &str = "Trig_JpsiThresh";
/// Marks MuOnia events also present in the DoubleMu sample.
pub const ALSO_IN_DOUBLE_MU: &str = "Alsoon_DoubleMu";

pub const UPSILON_TRIGGERS: [&str; 5] = [
    "HLT_Dimuon0_Upsilon",
    "HLT_Dimuon0_Barrel_Upsilon",
    "HLT_DoubleMu3_Upsilon",
    "HLT_Dimuon5_Upsilon_Barrel",
    "HLT_Dimuon7_Upsilon_Barrel",
];
pub const BS_TRIGGERS: [&str; 6] = [
    "HLT_Dimuon6_Bs",
    "HLT_Dimuon4_Bs_Barrel",
    "HLT_DoubleMu4_Dimuon6_Bs",
    "HLT_DoubleMu4_Dimuon4_Bs_Barrel",
    "HLT_DoubleMu3_Bs",
    "HLT_DoubleMu2_Bs",
];
pub const JPSI_6P5_TRIGGERS: [&str; 2] = ["HLT_Dimuon6p5_Jpsi", "HLT_Dimuon6p5_Barrel_Jpsi"];
pub const JPSI_TRIGGERS: [&str; 3] = [
    "HLT_Dimuon0_Jpsi",
    "HLT_Dimuon13_Jpsi_Barrel",
    "HLT_Dimuon10_Jpsi_Barrel",
];
pub const PSI_PRIME_TRIGGERS: [&str; 3] = [
    "HLT_Dimuon11_PsiPrime",
    "HLT_Dimuon9_PsiPrime",
    "HLT_Dimuon7_PsiPrime",
];
pub const DISPLACED_TRIGGERS: [&str; 2] = [
    "HLT_Dimuon7_LowMass_Displaced",
    "HLT_Dimuon6p5_LowMass_Displaced",
];
/// Displaced and L2 triggers vetoed by the historic J/$`\psi`$-threshold category.
pub const JPSI_THRESHOLD_VETO_TRIGGERS: [&str; 10] = [
    "HLT_DoubleMu4_LowMass_Displaced",
    "HLT_DoubleMu4p5_LowMass_Displaced",
    "HLT_DoubleMu5_LowMass_Displaced",
    "HLT_Dimuon6p5_LowMass_Displaced",
    "HLT_Dimuon7_LowMass_Displaced",
    "HLT_DoubleMu4_Jpsi_Displaced",
    "HLT_DoubleMu5_Jpsi_Displaced",
    "HLT_Dimuon6p5_Jpsi_Displaced",
    "HLT_Dimuon7_Jpsi_Displaced",
    "HLT_Mu5_L2Mu2",
];

/// Names of all built-in categories, see [`Category::standard`].
pub const STANDARD_CATEGORIES: [&str; 10] = [
    "high_pt",
    "low_pt",
    "upsilon",
    "bs",
    "jpsi",
    "psi_prime",
    "low_mass_displaced",
    "jpsi_threshold",
    "global_muon",
    "leading_pair",
];

/// A half-open mass interval $`[\text{lo}, \text{hi})`$.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MassWindow {
    pub lo: f64,
    pub hi: f64,
}

impl MassWindow {
    pub const fn new(lo: f64, hi: f64) -> Self {
        Self { lo, hi }
    }

    pub fn contains(&self, mass: f64) -> bool {
        mass >= self.lo && mass < self.hi
    }
}

/// The kinematics of one accepted pair that candidate conditions look at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairContext {
    /// The invariant mass of the pair.
    pub mass: f64,
    /// The smaller transverse momentum of both legs.
    pub min_leg_pt: f64,
}

impl PairContext {
    /// Gather the kinematics of a candidate in `event`.
    pub fn new(event: &Event, candidate: &DimuonCandidate) -> DimuonResult<Self> {
        let (a, b) = event.legs(candidate.first, candidate.second)?;
        Ok(Self {
            mass: candidate.mass_in(event)?,
            min_leg_pt: a.pt.min(b.pt),
        })
    }
}

/// A predicate over an event and, optionally, one of its pairs.
///
/// Pair conditions evaluated without a pair are false. Unknown trigger flags read as not fired,
/// and unknown trigger values never exceed a threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    /// Always true.
    Always,
    /// The run number is below the given value.
    RunBelow(u32),
    /// The named trigger value is strictly greater than `threshold`.
    ValueAbove { name: String, threshold: f64 },
    /// The named trigger value is present and non-zero.
    ValueNonZero(String),
    /// The named trigger fired.
    Trigger(String),
    /// At least one of the named triggers fired.
    AnyTrigger(Vec<String>),
    /// The pair mass is strictly above the value.
    MassAbove(f64),
    /// The pair mass is strictly below the value.
    MassBelow(f64),
    /// The pair mass is inside the window.
    MassWithin(MassWindow),
    /// Both legs have a transverse momentum strictly above the value.
    LegsPtAbove(f64),
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn trigger<S: Into<String>>(name: S) -> Self {
        Condition::Trigger(name.into())
    }

    pub fn any_trigger<S: AsRef<str>>(names: &[S]) -> Self {
        Condition::AnyTrigger(names.iter().map(|name| name.as_ref().to_string()).collect())
    }

    pub fn value_above<S: Into<String>>(name: S, threshold: f64) -> Self {
        Condition::ValueAbove {
            name: name.into(),
            threshold,
        }
    }

    pub fn within(lo: f64, hi: f64) -> Self {
        Condition::MassWithin(MassWindow::new(lo, hi))
    }

    pub fn and(self, other: Condition) -> Self {
        match self {
            Condition::All(mut conditions) => {
                conditions.push(other);
                Condition::All(conditions)
            }
            condition => Condition::All(vec![condition, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Condition::Not(Box::new(self))
    }

    /// Evaluate the condition.
    pub fn evaluate(&self, event: &Event, pair: Option<&PairContext>) -> bool {
        match self {
            Condition::Always => true,
            Condition::RunBelow(cutoff) => event.run < *cutoff,
            Condition::ValueAbove { name, threshold } => event
                .trigger_value(name)
                .map_or(false, |value| value > *threshold),
            Condition::ValueNonZero(name) => event
                .trigger_value(name)
                .map_or(false, |value| value != 0.0),
            Condition::Trigger(name) => event.trigger(name),
            Condition::AnyTrigger(names) => names.iter().any(|name| event.trigger(name)),
            Condition::MassAbove(min) => pair.map_or(false, |p| p.mass > *min),
            Condition::MassBelow(max) => pair.map_or(false, |p| p.mass < *max),
            Condition::MassWithin(window) => pair.map_or(false, |p| window.contains(p.mass)),
            Condition::LegsPtAbove(min) => pair.map_or(false, |p| p.min_leg_pt > *min),
            Condition::All(conditions) => conditions.iter().all(|c| c.evaluate(event, pair)),
            Condition::Any(conditions) => conditions.iter().any(|c| c.evaluate(event, pair)),
            Condition::Not(condition) => !condition.evaluate(event, pair),
        }
    }

    /// Whether the condition looks at a pair anywhere inside it.
    pub fn needs_pair(&self) -> bool {
        match self {
            Condition::MassAbove(_)
            | Condition::MassBelow(_)
            | Condition::MassWithin(_)
            | Condition::LegsPtAbove(_) => true,
            Condition::All(conditions) | Condition::Any(conditions) => {
                conditions.iter().any(Condition::needs_pair)
            }
            Condition::Not(condition) => condition.needs_pair(),
            _ => false,
        }
    }

    /// Reject `NaN` thresholds, empty windows and empty trigger names.
    pub fn validate(&self) -> DimuonResult<()> {
        let invalid = |reason: String| Err(DimuonError::Configuration(reason));
        match self {
            Condition::ValueAbove { name, threshold } => {
                if name.is_empty() || threshold.is_nan() {
                    return invalid(format!("invalid threshold condition {self:?}"));
                }
            }
            Condition::ValueNonZero(name) | Condition::Trigger(name) => {
                if name.is_empty() {
                    return invalid("empty trigger name".to_string());
                }
            }
            Condition::AnyTrigger(names) => {
                if names.is_empty() || names.iter().any(String::is_empty) {
                    return invalid(format!("invalid trigger list {names:?}"));
                }
            }
            Condition::MassAbove(value)
            | Condition::MassBelow(value)
            | Condition::LegsPtAbove(value) => {
                if value.is_nan() {
                    return invalid(format!("NaN threshold in {self:?}"));
                }
            }
            Condition::MassWithin(window) => {
                if window.lo.is_nan() || window.hi.is_nan() || window.lo >= window.hi {
                    return invalid(format!("empty mass window {window:?}"));
                }
            }
            Condition::All(conditions) | Condition::Any(conditions) => {
                for condition in conditions {
                    condition.validate()?;
                }
            }
            Condition::Not(condition) => condition.validate()?,
            Condition::Always | Condition::RunBelow(_) => {}
        }
        Ok(())
    }
}

/// The per-pair part of a category.
///
/// A pair is accepted if `base` holds, at least one of `clauses` holds (an empty list always
/// holds), and `veto` does not hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRule {
    pub base: Condition,
    pub clauses: Vec<Condition>,
    pub veto: Option<Condition>,
}

impl Default for CandidateRule {
    fn default() -> Self {
        Self {
            base: Condition::Always,
            clauses: Vec::new(),
            veto: None,
        }
    }
}

impl CandidateRule {
    pub fn new(base: Condition) -> Self {
        Self {
            base,
            ..Self::default()
        }
    }

    pub fn with_clause(mut self, clause: Condition) -> Self {
        self.clauses.push(clause);
        self
    }

    pub fn with_veto(mut self, veto: Condition) -> Self {
        self.veto = Some(veto);
        self
    }

    pub fn accepts(&self, event: &Event, pair: &PairContext) -> bool {
        self.base.evaluate(event, Some(pair))
            && (self.clauses.is_empty()
                || self.clauses.iter().any(|c| c.evaluate(event, Some(pair))))
            && !self
                .veto
                .as_ref()
                .map_or(false, |veto| veto.evaluate(event, Some(pair)))
    }

    pub fn validate(&self) -> DimuonResult<()> {
        self.base.validate()?;
        for clause in &self.clauses {
            clause.validate()?;
        }
        if let Some(veto) = &self.veto {
            veto.validate()?;
        }
        Ok(())
    }
}

/// Thresholds of the built-in categories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryThresholds {
    /// Events from runs at or above this number are dropped.
    pub run_cutoff: u32,
    /// Minimum of the numeric dimuon trigger threshold for the high-$`p_T`$ sample.
    pub dimuon_threshold: f64,
    pub high_pt_leg_pt: f64,
    pub low_pt_leg_pt: f64,
    pub jpsi_leg_pt: f64,
    /// Leg threshold of the quarkonium clause of the J/$`\psi`$ family and of the displaced
    /// selections.
    pub quarkonium_leg_pt: f64,
    pub min_mass: f64,
    pub displaced_max_mass: f64,
    pub leading_pair_leg_pt: f64,
    /// Gate of all 2011 categories.
    pub gate: QualityGate,
    /// Gate of the 2010 global-muon category.
    pub legacy_gate: QualityGate,
}

impl Default for CategoryThresholds {
    fn default() -> Self {
        Self {
            run_cutoff: 170_000,
            dimuon_threshold: 12.0,
            high_pt_leg_pt: 6.0,
            low_pt_leg_pt: 2.0,
            jpsi_leg_pt: 1.5,
            quarkonium_leg_pt: 3.0,
            min_mass: 2.0,
            displaced_max_mass: 5.1,
            leading_pair_leg_pt: 3.0,
            gate: QualityGate::medium(),
            legacy_gate: QualityGate::global_legacy(),
        }
    }
}

impl CategoryThresholds {
    fn muonia_filters(&self) -> IndexMap<String, Condition> {
        IndexMap::from([
            ("Run number".to_string(), Condition::RunBelow(self.run_cutoff)),
            (
                "Dimuon threshold and sample overlap".to_string(),
                Condition::trigger(ALSO_IN_DOUBLE_MU)
                    .and(Condition::value_above(DIMUON_THRESHOLD, self.dimuon_threshold))
                    .not(),
            ),
        ])
    }

    fn jpsi_clauses(&self, jpsi_6p5_window: MassWindow) -> Vec<Condition> {
        vec![
            Condition::trigger(QUARKONIUM_TRIGGER)
                .and(Condition::LegsPtAbove(self.quarkonium_leg_pt)),
            Condition::any_trigger(&JPSI_6P5_TRIGGERS).and(Condition::MassWithin(jpsi_6p5_window)),
            Condition::any_trigger(&JPSI_TRIGGERS).and(Condition::within(2.8, 3.4)),
        ]
    }
}

/// A named selection category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    /// Gate applied to both legs at pairing time.
    pub gate: QualityGate,
    /// Leg $`p_T`$ threshold applied at pairing time.
    pub min_leg_pt: f64,
    pub pairing: PairingMode,
    /// Event-level filters by cut-flow stage name, in application order.
    pub event_filters: IndexMap<String, Condition>,
    pub rule: CandidateRule,
    /// Overrides the analysis-wide log-mass binning.
    pub log_binning: Option<Binning>,
    /// Overrides the analysis-wide linear mass binning.
    pub linear_binning: Option<Binning>,
    /// Books an additional linear mass histogram with this binning.
    pub extended_binning: Option<Binning>,
}

impl Category {
    /// A category pairing all muons passing `gate` and `min_leg_pt`, with no further
    /// requirements.
    pub fn new<S: Into<String>>(name: S, gate: QualityGate, min_leg_pt: f64) -> Self {
        Self {
            name: name.into(),
            gate,
            min_leg_pt,
            pairing: PairingMode::AllPairs,
            event_filters: IndexMap::new(),
            rule: CandidateRule::default(),
            log_binning: None,
            linear_binning: None,
            extended_binning: None,
        }
    }

    pub fn with_pairing(mut self, pairing: PairingMode) -> Self {
        self.pairing = pairing;
        self
    }

    /// Append an event filter, which is also a cut-flow stage.
    pub fn with_filter<S: Into<String>>(mut self, stage: S, condition: Condition) -> Self {
        self.event_filters.insert(stage.into(), condition);
        self
    }

    pub fn with_filters(mut self, filters: IndexMap<String, Condition>) -> Self {
        self.event_filters.extend(filters);
        self
    }

    pub fn with_rule(mut self, rule: CandidateRule) -> Self {
        self.rule = rule;
        self
    }

    pub fn with_log_binning(mut self, binning: Binning) -> Self {
        self.log_binning = Some(binning);
        self
    }

    pub fn with_linear_binning(mut self, binning: Binning) -> Self {
        self.linear_binning = Some(binning);
        self
    }

    /// Also fill a linear mass histogram with `binning`, for example to cover the
    /// $`\Upsilon`$ and Z range next to a low-mass linear histogram.
    pub fn with_extended_binning(mut self, binning: Binning) -> Self {
        self.extended_binning = Some(binning);
        self
    }

    /// The [`PairSelector`] forming this category's pairs.
    pub fn selector(&self, force_raw: bool) -> PairSelector {
        PairSelector::new(self.gate, self.min_leg_pt)
            .with_mode(self.pairing)
            .with_force_raw(force_raw)
    }

    /// The number of leading event filters the event passes.
    ///
    /// An event passes stage `k` only if it passed every earlier stage, so evaluation stops at the
    /// first failing filter.
    pub fn filters_passed(&self, event: &Event) -> usize {
        self.event_filters
            .values()
            .take_while(|condition| condition.evaluate(event, None))
            .count()
    }

    /// Whether an accepted pair belongs to this category.
    pub fn accepts(&self, event: &Event, pair: &PairContext) -> bool {
        self.rule.accepts(event, pair)
    }

    /// Check names, thresholds and binning overrides.
    pub fn validate(&self) -> DimuonResult<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(DimuonError::Configuration(format!(
                "invalid category name \"{}\"",
                self.name
            )));
        }
        if self.min_leg_pt.is_nan() {
            return Err(DimuonError::Configuration(format!(
                "{}: leg pT threshold is NaN",
                self.name
            )));
        }
        self.gate.validate()?;
        for (stage, condition) in &self.event_filters {
            if condition.needs_pair() {
                return Err(DimuonError::Configuration(format!(
                    "{}: event filter \"{stage}\" depends on a pair",
                    self.name
                )));
            }
            condition.validate()?;
        }
        self.rule.validate()?;
        for binning in self
            .log_binning
            .iter()
            .chain(&self.linear_binning)
            .chain(&self.extended_binning)
        {
            binning.validate()?;
        }
        Ok(())
    }

    /// Look up a built-in category by name.
    ///
    /// # Errors
    ///
    /// [`DimuonError::Configuration`] for a name outside [`STANDARD_CATEGORIES`].
    pub fn standard(name: &str, thresholds: &CategoryThresholds) -> DimuonResult<Self> {
        Ok(match name {
            "high_pt" => Self::high_pt(thresholds),
            "low_pt" => Self::low_pt(thresholds),
            "upsilon" => Self::upsilon(thresholds),
            "bs" => Self::bs(thresholds),
            "jpsi" => Self::jpsi(thresholds),
            "psi_prime" => Self::psi_prime(thresholds),
            "low_mass_displaced" => Self::low_mass_displaced(thresholds),
            "jpsi_threshold" => Self::jpsi_threshold(thresholds),
            "global_muon" => Self::global_muon(thresholds),
            "leading_pair" => Self::leading_pair(thresholds),
            _ => {
                return Err(DimuonError::Configuration(format!(
                    "unknown category \"{name}\" (expected one of {STANDARD_CATEGORIES:?})"
                )))
            }
        })
    }

    /// High-$`p_T`$ double-muon sample.
    pub fn high_pt(t: &CategoryThresholds) -> Self {
        Self::new("high_pt", t.gate, t.high_pt_leg_pt)
            .with_filter("Run number", Condition::RunBelow(t.run_cutoff))
            .with_filter(
                "Dimuon threshold",
                Condition::value_above(DIMUON_THRESHOLD, t.dimuon_threshold),
            )
    }

    /// Low-$`p_T`$ quarkonium-triggered sample.
    pub fn low_pt(t: &CategoryThresholds) -> Self {
        Self::new("low_pt", t.gate, t.low_pt_leg_pt)
            .with_filters(t.muonia_filters())
            .with_filter("HLT", Condition::trigger(QUARKONIUM_TRIGGER))
            .with_rule(CandidateRule::new(Condition::MassAbove(t.min_mass)))
    }

    pub fn upsilon(t: &CategoryThresholds) -> Self {
        Self::new("upsilon", t.gate, t.low_pt_leg_pt)
            .with_filters(t.muonia_filters())
            .with_rule(
                CandidateRule::new(Condition::MassAbove(t.min_mass))
                    .with_clause(Condition::trigger(QUARKONIUM_TRIGGER))
                    .with_clause(
                        Condition::any_trigger(&UPSILON_TRIGGERS).and(Condition::within(7.0, 14.0)),
                    ),
            )
    }

    pub fn bs(t: &CategoryThresholds) -> Self {
        Self::new("bs", t.gate, t.low_pt_leg_pt)
            .with_filters(t.muonia_filters())
            .with_rule(
                CandidateRule::new(Condition::MassAbove(t.min_mass))
                    .with_clause(
                        Condition::trigger(QUARKONIUM_TRIGGER)
                            .and(Condition::LegsPtAbove(t.low_pt_leg_pt)),
                    )
                    .with_clause(
                        Condition::any_trigger(&BS_TRIGGERS).and(Condition::within(4.0, 7.0)),
                    ),
            )
    }

    /// J/$`\psi`$ sample, vetoing pairs the displaced category takes.
    pub fn jpsi(t: &CategoryThresholds) -> Self {
        let mut rule = CandidateRule::new(Condition::MassAbove(t.min_mass)).with_veto(
            Condition::any_trigger(&DISPLACED_TRIGGERS)
                .and(Condition::LegsPtAbove(t.quarkonium_leg_pt)),
        );
        rule.clauses = t.jpsi_clauses(MassWindow::new(2.8, 4.3));
        Self::new("jpsi", t.gate, t.jpsi_leg_pt)
            .with_filters(t.muonia_filters())
            .with_rule(rule)
    }

    /// $`\psi'`$ sample. The 6.5 GeV J/$`\psi`$ triggers take a wider window starting at 2.5.
    pub fn psi_prime(t: &CategoryThresholds) -> Self {
        let mut rule = CandidateRule::new(Condition::MassAbove(t.min_mass));
        rule.clauses = t.jpsi_clauses(MassWindow::new(2.5, 4.3));
        Self::new("psi_prime", t.gate, t.jpsi_leg_pt)
            .with_filters(t.muonia_filters())
            .with_rule(rule.with_clause(
                Condition::any_trigger(&PSI_PRIME_TRIGGERS).and(Condition::within(3.4, 4.3)),
            ))
    }

    /// Low-mass displaced sample, $`2 < m < 5.1`$ with both ends exclusive.
    pub fn low_mass_displaced(t: &CategoryThresholds) -> Self {
        Self::new("low_mass_displaced", t.gate, t.quarkonium_leg_pt)
            .with_filters(t.muonia_filters())
            .with_filter("HLT", Condition::any_trigger(&DISPLACED_TRIGGERS))
            .with_rule(CandidateRule::new(
                Condition::MassAbove(t.min_mass).and(Condition::MassBelow(t.displaced_max_mass)),
            ))
    }

    /// Historic J/$`\psi`$-threshold sample; only kept for its combination.
    pub fn jpsi_threshold(t: &CategoryThresholds) -> Self {
        Self::new("jpsi_threshold", t.gate, t.quarkonium_leg_pt)
            .with_filters(t.muonia_filters())
            .with_filter(
                "J/Psi threshold",
                Condition::ValueNonZero(JPSI_THRESHOLD.to_string()),
            )
            .with_filter(
                "HLT",
                Condition::any_trigger(&JPSI_THRESHOLD_VETO_TRIGGERS).not(),
            )
            .with_rule(CandidateRule::new(Condition::MassAbove(t.min_mass)))
    }

    /// All opposite-charge pairs of global muons, binned as the 2010 spectrum.
    pub fn global_muon(t: &CategoryThresholds) -> Self {
        Self::new("global_muon", t.legacy_gate, 0.0)
            .with_log_binning(Binning::log10(644, (-0.52, 2.7), 200.0))
            .with_linear_binning(Binning::uniform(400, (0.0, 4.0)))
            .with_extended_binning(Binning::uniform(240, (0.0, 120.0)))
    }

    /// The opposite-charge leading pair, binned as the 2012 spectrum.
    pub fn leading_pair(t: &CategoryThresholds) -> Self {
        Self::new("leading_pair", QualityGate::any(), t.leading_pair_leg_pt)
            .with_pairing(PairingMode::LeadingPair)
            .with_linear_binning(Binning::uniform(30_000, (0.25, 300.0)))
    }
}
