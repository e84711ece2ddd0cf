//! The per-event pipeline: pair selection, classification and histogram filling.
//!
//! Lifecycle:
//! - Describe the run with an [`AnalysisConfig`] and validate it once with [`Analysis::new`].
//!   Every configuration error surfaces here, before any event is seen.
//! - Feed events into one [`Accumulator`] per worker (or a single [`SharedAccumulator`] when
//!   events are pushed from several ingestion threads), or let [`Analysis::run`] fan out over a
//!   [`Dataset`].
//! - Merge the accumulators and [`Accumulator::finish`] them into an [`AnalysisOutput`], which
//!   adds the stacked combinations and freezes the cut flows.
//!
//! Events which fail validation are skipped and counted, never fatal. An accumulator is a valid
//! partial result at every point between events.
use indexmap::IndexMap;
use parking_lot::Mutex;
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    classify::{Category, CategoryThresholds, PairContext},
    combine::{combine_all, Combination, STACK_ORDER},
    cutflow::{CutFlow, CutFlowReport},
    data::{Dataset, Event, EventColumns},
    histogram::{
        mass_histogram_name, Binning, Histogram, HistogramSet, LOG_MASS, MASS, MASS_EXTENDED,
    },
    monitor,
    selection::{PairBuffer, PairSelector},
    DimuonError, DimuonResult,
};

/// Cut-flow stages every category records after its own event filters.
pub const PAIR_STAGES: [&str; 4] = [
    "Two or more muons",
    "Muon quality",
    "Opposite charge",
    "Category selection",
];

/// Where [`Analysis::run`] executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadPolicy {
    /// Run on the current thread.
    Single,
    /// Use the global Rayon pool.
    GlobalPool,
    /// Use a dedicated Rayon pool with `n_threads`.
    Dedicated(usize),
}

impl Default for ThreadPolicy {
    fn default() -> Self {
        if cfg!(feature = "rayon") {
            ThreadPolicy::GlobalPool
        } else {
            ThreadPolicy::Single
        }
    }
}

/// Everything that describes an analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Thresholds of the built-in categories, including the run cutoff.
    pub thresholds: CategoryThresholds,
    /// Log-mass binning of every category without an override.
    pub log_binning: Binning,
    /// Linear mass binning of every category without an override.
    pub linear_binning: Binning,
    /// Built-in categories to run, by name.
    pub categories: Vec<String>,
    /// Additional user-defined categories.
    pub custom_categories: Vec<Category>,
    /// Stacked histograms to derive at the end of the run.
    pub combinations: Vec<Combination>,
    /// Also fill the single-muon monitor histograms.
    pub monitor: bool,
    /// Pair raw muons even when events carry precomputed candidates.
    pub force_raw_pairing: bool,
    pub threads: ThreadPolicy,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            thresholds: CategoryThresholds::default(),
            log_binning: Binning::log_mass_default(),
            linear_binning: Binning::uniform(400, (0.0, 4.0)),
            categories: [
                "high_pt",
                "low_pt",
                "upsilon",
                "bs",
                "jpsi",
                "psi_prime",
                "low_mass_displaced",
                "jpsi_threshold",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            custom_categories: Vec::new(),
            combinations: Combination::standard(),
            monitor: false,
            force_raw_pairing: false,
            threads: ThreadPolicy::default(),
        }
    }
}

impl AnalysisConfig {
    /// A configuration running only the given built-in categories, without combinations.
    pub fn with_categories<I, S>(categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            categories: categories.into_iter().map(Into::into).collect(),
            combinations: Vec::new(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
struct CategoryPlan {
    category: Category,
    selector: PairSelector,
    mass_name: String,
    log_mass_name: String,
    extended_name: Option<String>,
}

/// A validated analysis, shared read-only by all workers.
#[derive(Debug)]
pub struct Analysis {
    config: AnalysisConfig,
    plans: Vec<CategoryPlan>,
    template: Accumulator,
    #[cfg(feature = "rayon")]
    dedicated_pool: Option<rayon::ThreadPool>,
}

impl Analysis {
    /// Validate `config` and book all histograms and cut flows.
    ///
    /// # Errors
    ///
    /// [`DimuonError::Configuration`] for unknown or duplicate category names, invalid
    /// thresholds or binnings, and combinations of inactive or incompatible categories.
    /// [`DimuonError::ThreadPoolError`] if a dedicated pool cannot be built.
    pub fn new(config: AnalysisConfig) -> DimuonResult<Self> {
        config.log_binning.validate()?;
        config.linear_binning.validate()?;
        config.thresholds.gate.validate()?;
        config.thresholds.legacy_gate.validate()?;

        let mut categories = config
            .categories
            .iter()
            .map(|name| Category::standard(name, &config.thresholds))
            .collect::<DimuonResult<Vec<_>>>()?;
        categories.extend(config.custom_categories.iter().cloned());
        if categories.is_empty() {
            return Err(DimuonError::Configuration(
                "at least one category is required".to_string(),
            ));
        }

        let mut plans: Vec<CategoryPlan> = Vec::with_capacity(categories.len());
        for category in categories {
            category.validate()?;
            if plans.iter().any(|plan| plan.category.name == category.name) {
                return Err(DimuonError::Configuration(format!(
                    "category \"{}\" is listed twice",
                    category.name
                )));
            }
            plans.push(CategoryPlan {
                selector: category.selector(config.force_raw_pairing),
                mass_name: mass_histogram_name(&category.name, MASS),
                log_mass_name: mass_histogram_name(&category.name, LOG_MASS),
                extended_name: category
                    .extended_binning
                    .as_ref()
                    .map(|_| mass_histogram_name(&category.name, MASS_EXTENDED)),
                category,
            });
        }

        let active: Vec<&str> = plans.iter().map(|p| p.category.name.as_str()).collect();
        for (i, combination) in config.combinations.iter().enumerate() {
            combination.validate(&active)?;
            if config.combinations[..i]
                .iter()
                .any(|other| other.name == combination.name)
            {
                return Err(DimuonError::Configuration(format!(
                    "combination \"{}\" is listed twice",
                    combination.name
                )));
            }
        }

        let mut histograms = HistogramSet::new();
        let mut cutflows = IndexMap::with_capacity(plans.len());
        for plan in &plans {
            let category = &plan.category;
            histograms.book(
                &plan.mass_name,
                category
                    .linear_binning
                    .as_ref()
                    .unwrap_or(&config.linear_binning),
            )?;
            histograms.book(
                &plan.log_mass_name,
                category.log_binning.as_ref().unwrap_or(&config.log_binning),
            )?;
            if let (Some(name), Some(binning)) = (&plan.extended_name, &category.extended_binning) {
                histograms.book(name, binning)?;
            }
            let stages = category
                .event_filters
                .keys()
                .map(String::as_str)
                .chain(PAIR_STAGES);
            cutflows.insert(category.name.clone(), CutFlow::new(stages));
        }
        if config.monitor {
            monitor::book(&mut histograms)?;
        }

        // constituents of a combination must share their binning
        for combination in &config.combinations {
            for variant in [MASS, LOG_MASS] {
                let mut constituents = combination
                    .constituents
                    .iter()
                    .filter_map(|c| histograms.get(&mass_histogram_name(c, variant)));
                if let Some(first) = constituents.next() {
                    for other in constituents {
                        if other.bin_edges() != first.bin_edges()
                            || other.is_log_mass() != first.is_log_mass()
                        {
                            return Err(DimuonError::Configuration(format!(
                                "combination \"{}\": {} and {} have different binning",
                                combination.name,
                                first.name(),
                                other.name()
                            )));
                        }
                    }
                }
            }
        }

        if cfg!(not(feature = "rayon")) && config.threads != ThreadPolicy::Single {
            return Err(DimuonError::Configuration(
                "the rayon feature is required for parallel thread policies".to_string(),
            ));
        }
        #[cfg(feature = "rayon")]
        let dedicated_pool = match config.threads {
            ThreadPolicy::Dedicated(0) => {
                return Err(DimuonError::Configuration(
                    "dedicated thread pool size must be >= 1".to_string(),
                ))
            }
            ThreadPolicy::Dedicated(n_threads) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n_threads)
                    .build()?,
            ),
            ThreadPolicy::Single | ThreadPolicy::GlobalPool => None,
        };

        log::debug!(
            "booked {} histograms for categories {:?}",
            histograms.len(),
            active
        );
        let template = Accumulator {
            histograms,
            cutflows,
            events: 0,
            discarded: 0,
            buffer: PairBuffer::new(),
        };
        Ok(Self {
            config,
            plans,
            template,
            #[cfg(feature = "rayon")]
            dedicated_pool,
        })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// The active categories in processing order.
    pub fn categories(&self) -> impl Iterator<Item = &Category> {
        self.plans.iter().map(|plan| &plan.category)
    }

    /// A fresh, empty accumulator for this analysis.
    pub fn accumulator(&self) -> Accumulator {
        self.template.clone()
    }

    /// Process a whole [`Dataset`] under the configured [`ThreadPolicy`].
    pub fn run(&self, dataset: &Dataset) -> DimuonResult<AnalysisOutput> {
        match self.config.threads {
            ThreadPolicy::Single => self.run_sequential(dataset),
            #[cfg(feature = "rayon")]
            ThreadPolicy::GlobalPool => self.run_parallel(dataset),
            #[cfg(feature = "rayon")]
            ThreadPolicy::Dedicated(_) => match &self.dedicated_pool {
                Some(pool) => pool.install(|| self.run_parallel(dataset)),
                None => self.run_parallel(dataset),
            },
            #[cfg(not(feature = "rayon"))]
            _ => self.run_sequential(dataset),
        }
    }

    /// Process a [`Dataset`] on the current thread.
    pub fn run_sequential(&self, dataset: &Dataset) -> DimuonResult<AnalysisOutput> {
        let mut accumulator = self.accumulator();
        for event in dataset.iter() {
            accumulator.process(self, event);
        }
        accumulator.finish(self)
    }

    /// Process a [`Dataset`] with one accumulator per Rayon task, merged at the end.
    ///
    /// Results match [`Analysis::run_sequential`] up to floating-point rounding in the bin sums.
    #[cfg(feature = "rayon")]
    pub fn run_parallel(&self, dataset: &Dataset) -> DimuonResult<AnalysisOutput> {
        let accumulator = dataset
            .par_iter()
            .fold(
                || self.accumulator(),
                |mut accumulator, event| {
                    accumulator.process(self, event);
                    accumulator
                },
            )
            .map(Ok::<Accumulator, DimuonError>)
            .try_reduce(
                || self.accumulator(),
                |mut a, b| {
                    a.merge(&b)?;
                    Ok(a)
                },
            )?;
        accumulator.finish(self)
    }
}

/// Histograms and cut flows filled by one worker.
#[derive(Debug, Clone)]
pub struct Accumulator {
    histograms: HistogramSet,
    cutflows: IndexMap<String, CutFlow>,
    events: u64,
    discarded: u64,
    buffer: PairBuffer,
}

impl Accumulator {
    /// Process one event. Invalid events are logged, counted as discarded and leave the
    /// accumulator untouched.
    pub fn process(&mut self, analysis: &Analysis, event: &Event) {
        self.events += 1;
        if let Err(err) = event
            .check_candidates()
            .and_then(|_| self.fill_event(analysis, event))
        {
            self.discard(event.run, event.event, &err);
        }
    }

    /// Assemble an event from ingestion columns and process it.
    pub fn process_columns(&mut self, analysis: &Analysis, columns: EventColumns) {
        let (run, event_number) = (columns.run.unwrap_or(0), columns.event.unwrap_or(0));
        match columns.into_event() {
            Ok(event) => self.process(analysis, &event),
            Err(err) => {
                self.events += 1;
                self.discard(run, event_number, &err);
            }
        }
    }

    fn discard(&mut self, run: u32, event: u64, err: &DimuonError) {
        self.discarded += 1;
        if err.is_event_level() {
            log::warn!("skipping event {event} of run {run}: {err}");
        } else {
            log::error!("unexpected failure on event {event} of run {run}: {err}");
        }
    }

    fn fill_event(&mut self, analysis: &Analysis, event: &Event) -> DimuonResult<()> {
        if analysis.config.monitor {
            monitor::fill(&mut self.histograms, event)?;
        }
        for (index, plan) in analysis.plans.iter().enumerate() {
            let (_, cutflow) = self
                .cutflows
                .get_index_mut(index)
                .ok_or_else(|| DimuonError::Custom(format!("no cut flow for {}", plan.category.name)))?;
            let n_filters = plan.category.event_filters.len();
            let mut passed = plan.category.filters_passed(event);
            if passed < n_filters {
                cutflow.record(passed);
                continue;
            }
            plan.selector.select(event, &mut self.buffer)?;
            let stages = self.buffer.stages();
            for stage_passed in [
                stages.has_two_muons(),
                stages.has_quality_pair(),
                stages.has_opposite_sign_pair(),
            ] {
                if !stage_passed {
                    break;
                }
                passed += 1;
            }
            let mut selected = false;
            for candidate in self.buffer.candidates() {
                let pair = PairContext::new(event, candidate)?;
                if plan.category.accepts(event, &pair) {
                    selected = true;
                    self.histograms.fill_mass(&plan.mass_name, pair.mass)?;
                    self.histograms.fill_mass(&plan.log_mass_name, pair.mass)?;
                    if let Some(name) = &plan.extended_name {
                        self.histograms.fill_mass(name, pair.mass)?;
                    }
                }
            }
            if selected {
                passed += 1;
            }
            cutflow.record(passed);
        }
        Ok(())
    }

    /// Add the results of another accumulator of the same analysis.
    pub fn merge(&mut self, other: &Accumulator) -> DimuonResult<()> {
        self.histograms.merge(&other.histograms)?;
        for (name, cutflow) in &other.cutflows {
            match self.cutflows.get_mut(name) {
                Some(existing) => existing.merge(cutflow)?,
                None => {
                    self.cutflows.insert(name.clone(), cutflow.clone());
                }
            }
        }
        self.events += other.events;
        self.discarded += other.discarded;
        Ok(())
    }

    pub fn histograms(&self) -> &HistogramSet {
        &self.histograms
    }
    pub fn cutflow(&self, category: &str) -> Option<&CutFlow> {
        self.cutflows.get(category)
    }
    /// Events seen, including discarded ones.
    pub fn events(&self) -> u64 {
        self.events
    }
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Derive the combinations and freeze the cut flows.
    pub fn finish(self, analysis: &Analysis) -> DimuonResult<AnalysisOutput> {
        let mut histograms = self.histograms;
        let combined = combine_all(&analysis.config.combinations, &histograms, &[MASS, LOG_MASS])?;
        histograms.extend(combined)?;
        let cutflows = self
            .cutflows
            .iter()
            .map(|(name, cutflow)| (name.clone(), cutflow.report()))
            .collect();
        log::info!(
            "processed {} events ({} discarded)",
            self.events,
            self.discarded
        );
        Ok(AnalysisOutput {
            histograms,
            cutflows,
            events: self.events,
            discarded: self.discarded,
        })
    }
}

/// An [`Accumulator`] behind a lock, for ingestion threads which push events as they read them.
#[derive(Debug)]
pub struct SharedAccumulator<'a> {
    analysis: &'a Analysis,
    inner: Mutex<Accumulator>,
}

impl<'a> SharedAccumulator<'a> {
    pub fn new(analysis: &'a Analysis) -> Self {
        Self {
            analysis,
            inner: Mutex::new(analysis.accumulator()),
        }
    }

    pub fn push(&self, event: &Event) {
        self.inner.lock().process(self.analysis, event);
    }

    pub fn push_columns(&self, columns: EventColumns) {
        self.inner.lock().process_columns(self.analysis, columns);
    }

    /// Merge a privately filled accumulator in one step.
    pub fn absorb(&self, accumulator: &Accumulator) -> DimuonResult<()> {
        self.inner.lock().merge(accumulator)
    }

    /// The output of everything pushed so far.
    pub fn snapshot(&self) -> DimuonResult<AnalysisOutput> {
        self.inner.lock().clone().finish(self.analysis)
    }

    pub fn into_inner(self) -> Accumulator {
        self.inner.into_inner()
    }
}

/// The result of an analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutput {
    /// Category, combination and monitor histograms.
    pub histograms: HistogramSet,
    /// Cut flow of each category.
    pub cutflows: IndexMap<String, CutFlowReport>,
    /// Events seen, including discarded ones.
    pub events: u64,
    /// Events skipped because of invalid input.
    pub discarded: u64,
}

impl AnalysisOutput {
    /// The linear mass histogram of a category or combination.
    pub fn mass(&self, name: &str) -> Option<&Histogram> {
        self.histograms.get(&mass_histogram_name(name, MASS))
    }

    /// The log-mass histogram of a category or combination.
    pub fn log_mass(&self, name: &str) -> Option<&Histogram> {
        self.histograms.get(&mass_histogram_name(name, LOG_MASS))
    }

    /// The wide-range linear mass histogram of a category, if it books one.
    pub fn mass_extended(&self, name: &str) -> Option<&Histogram> {
        self.histograms.get(&mass_histogram_name(name, MASS_EXTENDED))
    }

    /// The available log-mass histograms in [`STACK_ORDER`].
    pub fn stack(&self) -> Vec<&Histogram> {
        STACK_ORDER
            .iter()
            .filter_map(|name| self.log_mass(name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::f64::consts::LN_10;

    use super::*;
    use crate::{
        classify::{Condition, DIMUON_THRESHOLD, QUARKONIUM_TRIGGER},
        data::{tests::good_muon, DimuonCandidate, Muon},
        selection::QualityGate,
        utils::vectors::mass_of_pair,
    };
    use approx::assert_relative_eq;

    fn high_pt_event(charges: (i32, i32)) -> Event {
        Event::new(
            165_000,
            1,
            1,
            vec![
                good_muon(10.0, 0.1, 0.0, charges.0),
                good_muon(12.0, -0.2, 1.5, charges.1),
            ],
        )
        .with_trigger_value(DIMUON_THRESHOLD, 13.0)
    }

    fn random_event(rng: &mut fastrand::Rng, number: u64) -> Event {
        let n = rng.usize(0..6);
        let muons: Vec<Muon> = (0..n)
            .map(|_| {
                let mut muon = good_muon(
                    0.5 + rng.f64() * 25.0,
                    rng.f64() * 4.8 - 2.4,
                    rng.f64() * 6.28 - 3.14,
                    if rng.bool() { 1 } else { -1 },
                );
                muon.medium_id = rng.f64() < 0.85;
                muon.is_global = rng.f64() < 0.9;
                muon
            })
            .collect();
        let mut event = Event::new(160_000 + rng.u32(0..20_000), number, 1, muons)
            .with_trigger(QUARKONIUM_TRIGGER, rng.bool())
            .with_trigger("HLT_Dimuon0_Jpsi", rng.bool())
            .with_trigger("HLT_Dimuon0_Upsilon", rng.bool())
            .with_trigger("HLT_Dimuon7_LowMass_Displaced", rng.f64() < 0.2)
            .with_trigger("Alsoon_DoubleMu", rng.f64() < 0.3)
            .with_trigger_value(DIMUON_THRESHOLD, if rng.bool() { 13.0 } else { 0.0 })
            .with_trigger_value("Trig_JpsiThresh", rng.u32(0..2) as f64);
        if rng.f64() < 0.1 {
            event.muons.iter_mut().for_each(|muon| muon.mass = 0.10566);
        }
        event
    }

    fn random_dataset(seed: u64, n_events: u64) -> Dataset {
        let mut rng = fastrand::Rng::with_seed(seed);
        (0..n_events).map(|i| random_event(&mut rng, i)).collect()
    }

    #[test]
    fn test_single_high_pt_pair() {
        let analysis = Analysis::new(AnalysisConfig::with_categories(["high_pt"])).unwrap();
        let mut accumulator = analysis.accumulator();
        accumulator.process(&analysis, &high_pt_event((1, -1)));
        let output = accumulator.finish(&analysis).unwrap();

        let mass = mass_of_pair(10.0, 0.1, 0.0, 0.105, 12.0, -0.2, 1.5, 0.105);
        let log_mass = output.log_mass("high_pt").unwrap();
        assert_eq!(log_mass.entries(), 1);
        assert_relative_eq!(log_mass.integral(), 2.0 / LN_10 / mass, max_relative = 1e-12);
        assert_eq!(output.mass("high_pt").unwrap().entries(), 1);

        let cutflow = &output.cutflows["high_pt"];
        for stage in cutflow.stages() {
            assert_eq!(stage.passed, 1, "{}", stage.name);
        }
        assert_eq!(cutflow.stages().len(), 6);
        assert_eq!(output.discarded, 0);
    }

    #[test]
    fn test_precomputed_columns_fill_high_pt() {
        let analysis = Analysis::new(AnalysisConfig::with_categories(["high_pt"])).unwrap();
        let mut trigger_values = IndexMap::new();
        trigger_values.insert(DIMUON_THRESHOLD.to_string(), 13.0);
        let columns = EventColumns {
            run: Some(165_000),
            event: Some(1),
            luminosity_block: Some(1),
            n_muon: Some(2),
            muon_pt: Some(vec![10.0, 12.0]),
            muon_medium_id: Some(vec![true, true]),
            dimu_charge: Some(vec![0]),
            dimu_mass: Some(vec![91.0]),
            dimu_first_index: Some(vec![0]),
            dimu_second_index: Some(vec![1]),
            trigger_values,
            ..Default::default()
        };
        let mut accumulator = analysis.accumulator();
        accumulator.process_columns(&analysis, columns);
        let output = accumulator.finish(&analysis).unwrap();

        assert_eq!(output.discarded, 0);
        let log_mass = output.log_mass("high_pt").unwrap();
        assert_eq!(log_mass.entries(), 1);
        assert_relative_eq!(log_mass.integral(), 2.0 / LN_10 / 91.0, max_relative = 1e-12);
        assert_eq!(output.cutflows["high_pt"].selected(), 1);
    }

    #[test]
    fn test_same_sign_pair_stops_at_opposite_charge() {
        let analysis = Analysis::new(AnalysisConfig::with_categories(["high_pt"])).unwrap();
        let mut accumulator = analysis.accumulator();
        accumulator.process(&analysis, &high_pt_event((1, 1)));
        let output = accumulator.finish(&analysis).unwrap();
        assert_eq!(output.log_mass("high_pt").unwrap().entries(), 0);
        let cutflow = &output.cutflows["high_pt"];
        assert_eq!(cutflow.passed("Two or more muons"), Some(1));
        assert_eq!(cutflow.passed("Muon quality"), Some(1));
        assert_eq!(cutflow.passed("Opposite charge"), Some(0));
        assert_eq!(cutflow.passed("Category selection"), Some(0));
    }

    #[test]
    fn test_failing_muon_never_pairs() {
        let analysis = Analysis::new(AnalysisConfig::with_categories(["high_pt"])).unwrap();
        let mut event = high_pt_event((1, -1));
        let mut bad = good_muon(30.0, 1.0, -2.0, -1);
        bad.medium_id = false;
        event.muons.insert(1, bad);
        let mut accumulator = analysis.accumulator();
        accumulator.process(&analysis, &event);
        let output = accumulator.finish(&analysis).unwrap();
        let mass = mass_of_pair(10.0, 0.1, 0.0, 0.105, 12.0, -0.2, 1.5, 0.105);
        let log_mass = output.log_mass("high_pt").unwrap();
        assert_eq!(log_mass.entries(), 1);
        assert_relative_eq!(log_mass.integral(), 2.0 / LN_10 / mass, max_relative = 1e-12);
    }

    #[test]
    fn test_jpsi_mass_with_upsilon_bit() {
        let analysis = Analysis::new(AnalysisConfig::with_categories([
            "upsilon", "jpsi", "low_pt",
        ]))
        .unwrap();
        let event = Event::new(
            165_000,
            1,
            1,
            vec![good_muon(4.0, 0.1, 0.0, 1), good_muon(5.0, -0.2, 2.5, -1)],
        )
        .with_dimuons(vec![DimuonCandidate {
            first: 0,
            second: 1,
            charge_sum: 0,
            mass: Some(3.0),
        }])
        .with_trigger("HLT_Dimuon0_Upsilon", true)
        .with_trigger("HLT_Dimuon0_Jpsi", true);
        let mut accumulator = analysis.accumulator();
        accumulator.process(&analysis, &event);
        let output = accumulator.finish(&analysis).unwrap();
        assert_eq!(output.log_mass("upsilon").unwrap().entries(), 0);
        assert_eq!(output.log_mass("jpsi").unwrap().entries(), 1);
        assert_eq!(output.mass("jpsi").unwrap().integral(), 1.0);
        assert_eq!(output.cutflows["upsilon"].passed("Opposite charge"), Some(1));
        assert_eq!(output.cutflows["upsilon"].passed("Category selection"), Some(0));
        // low_pt is gated on the quarkonium trigger
        assert_eq!(output.cutflows["low_pt"].passed("HLT"), Some(0));
    }

    #[test]
    fn test_malformed_candidate_is_discarded() {
        let analysis = Analysis::new(AnalysisConfig::default()).unwrap();
        let event = high_pt_event((1, -1)).with_dimuons(vec![DimuonCandidate {
            first: 0,
            second: 4,
            charge_sum: 0,
            mass: None,
        }]);
        let mut accumulator = analysis.accumulator();
        accumulator.process(&analysis, &event);
        accumulator.process(&analysis, &high_pt_event((1, -1)));
        assert_eq!(accumulator.discarded(), 1);
        assert_eq!(accumulator.events(), 2);
        assert_eq!(accumulator.cutflow("high_pt").unwrap().total(), 1);
        let output = accumulator.finish(&analysis).unwrap();
        assert_eq!(output.discarded, 1);
        assert_eq!(output.log_mass("high_pt").unwrap().entries(), 1);
    }

    #[test]
    fn test_missing_column_is_discarded() {
        let analysis = Analysis::new(AnalysisConfig::with_categories(["high_pt"])).unwrap();
        let columns = EventColumns {
            run: Some(165_000),
            event: Some(3),
            luminosity_block: Some(1),
            n_muon: Some(2),
            muon_pt: Some(vec![10.0, 12.0]),
            ..Default::default()
        };
        let mut accumulator = analysis.accumulator();
        accumulator.process_columns(&analysis, columns);
        assert_eq!(accumulator.discarded(), 1);
        assert_eq!(accumulator.cutflow("high_pt").unwrap().total(), 0);
    }

    #[test]
    fn test_counts_are_conserved() {
        let analysis = Analysis::new(AnalysisConfig {
            threads: ThreadPolicy::Single,
            ..AnalysisConfig::default()
        })
        .unwrap();
        let dataset = random_dataset(17, 2000);
        let output = analysis.run(&dataset).unwrap();
        assert_eq!(output.events, 2000);
        for category in analysis.categories() {
            let name = category.name.as_str();
            let linear = output.mass(name).unwrap();
            let log_mass = output.log_mass(name).unwrap();
            // unit weights: every accepted pair lands in a bin or a flow counter
            assert_eq!(linear.total(), linear.entries() as f64);
            assert_eq!(linear.entries(), log_mass.entries());
            let cutflow = &output.cutflows[name];
            assert_eq!(cutflow.total(), 2000);
            let counts: Vec<u64> = cutflow.stages().iter().map(|s| s.passed).collect();
            assert!(counts.windows(2).all(|w| w[0] >= w[1]), "{name}: {counts:?}");
            assert!(linear.entries() >= cutflow.selected());
        }
        assert!(output.log_mass("high_pt").unwrap().entries() > 0);
        assert!(output.log_mass("jpsi").unwrap().entries() > 0);
    }

    #[test]
    fn test_combinations_in_output() {
        let analysis = Analysis::new(AnalysisConfig::default()).unwrap();
        let output = analysis.run_sequential(&random_dataset(23, 1000)).unwrap();
        let stack = output.log_mass("low_pt_stack").unwrap();
        let high = output.log_mass("high_pt").unwrap();
        let low = output.log_mass("low_pt").unwrap();
        for bin in 0..stack.n_bins() {
            assert_eq!(stack.contents()[bin], high.contents()[bin] + low.contents()[bin]);
        }
        assert_eq!(output.stack().len(), STACK_ORDER.len());
        assert_eq!(output.stack()[0].name(), "upsilon_stack/log_mass");
    }

    #[cfg(feature = "rayon")]
    #[test]
    fn test_parallel_matches_sequential() {
        let analysis = Analysis::new(AnalysisConfig {
            monitor: true,
            ..AnalysisConfig::default()
        })
        .unwrap();
        let dataset = random_dataset(2011, 3000);
        let sequential = analysis.run_sequential(&dataset).unwrap();
        let parallel = analysis.run_parallel(&dataset).unwrap();
        assert_eq!(sequential.cutflows, parallel.cutflows);
        assert_eq!(sequential.events, parallel.events);
        assert_eq!(
            sequential.histograms.names().collect::<Vec<_>>(),
            parallel.histograms.names().collect::<Vec<_>>()
        );
        for (name, histogram) in &sequential.histograms {
            let other = parallel.histograms.get(name).unwrap();
            assert_eq!(histogram.entries(), other.entries(), "{name}");
            for (a, b) in histogram.contents().iter().zip(other.contents()) {
                assert_relative_eq!(*a, *b, max_relative = 1e-9);
            }
        }

        let dedicated = Analysis::new(AnalysisConfig {
            threads: ThreadPolicy::Dedicated(2),
            ..AnalysisConfig::default()
        })
        .unwrap();
        assert_eq!(dedicated.run(&dataset).unwrap().cutflows, sequential.cutflows);
    }

    #[test]
    fn test_shared_accumulator() {
        let analysis = Analysis::new(AnalysisConfig::default()).unwrap();
        let dataset = random_dataset(5, 400);
        let shared = SharedAccumulator::new(&analysis);
        std::thread::scope(|scope| {
            for chunk in dataset.events().chunks(100) {
                let shared = &shared;
                scope.spawn(move || {
                    for event in chunk {
                        shared.push(event);
                    }
                });
            }
        });
        let pushed = shared.snapshot().unwrap();
        let sequential = analysis.run_sequential(&dataset).unwrap();
        assert_eq!(pushed.cutflows, sequential.cutflows);
        assert_eq!(
            shared.into_inner().histograms().get("high_pt/log_mass").unwrap().entries(),
            sequential.log_mass("high_pt").unwrap().entries()
        );
    }

    #[test]
    fn test_monitor_histograms() {
        let analysis = Analysis::new(AnalysisConfig {
            monitor: true,
            ..AnalysisConfig::with_categories(["global_muon"])
        })
        .unwrap();
        let mut accumulator = analysis.accumulator();
        accumulator.process(&analysis, &high_pt_event((1, -1)));
        let output = accumulator.finish(&analysis).unwrap();
        assert_eq!(output.histograms.get("monitor/pt").unwrap().entries(), 2);
        let log_mass = output.log_mass("global_muon").unwrap();
        let mass = mass_of_pair(10.0, 0.1, 0.0, 0.105, 12.0, -0.2, 1.5, 0.105);
        assert_relative_eq!(log_mass.integral(), 200.0 / LN_10 / mass, max_relative = 1e-12);
        assert_eq!(log_mass.n_bins(), 644);
    }

    #[test]
    fn test_global_muon_extended_mass_covers_z() {
        let analysis = Analysis::new(AnalysisConfig::with_categories(["global_muon"])).unwrap();
        let event = Event::new(
            148_000,
            1,
            1,
            vec![good_muon(45.0, 0.0, 0.0, 1), good_muon(45.0, 0.0, 3.1, -1)],
        );
        let mut accumulator = analysis.accumulator();
        accumulator.process(&analysis, &event);
        let output = accumulator.finish(&analysis).unwrap();

        let mass = mass_of_pair(45.0, 0.0, 0.0, 0.105, 45.0, 0.0, 3.1, 0.105);
        assert_eq!(output.mass("global_muon").unwrap().overflow(), 1.0);
        let extended = output.mass_extended("global_muon").unwrap();
        assert_eq!(extended.n_bins(), 240);
        assert_eq!(extended.overflow(), 0.0);
        assert_eq!(extended.integral(), 1.0);
        assert_eq!(extended.contents()[(mass / 0.5).floor() as usize], 1.0);
        assert!(output.mass_extended("high_pt").is_none());
    }

    #[test]
    fn test_custom_category() {
        let custom = Category::new("z_peak", QualityGate::medium(), 20.0).with_rule(
            crate::classify::CandidateRule::new(Condition::within(60.0, 120.0)),
        );
        let analysis = Analysis::new(AnalysisConfig {
            custom_categories: vec![custom],
            ..AnalysisConfig::with_categories(Vec::<String>::new())
        })
        .unwrap();
        let event = Event::new(
            190_000,
            1,
            1,
            vec![good_muon(45.0, 0.0, 0.0, 1), good_muon(45.0, 0.0, 3.1, -1)],
        );
        let mut accumulator = analysis.accumulator();
        accumulator.process(&analysis, &event);
        let output = accumulator.finish(&analysis).unwrap();
        assert_eq!(output.log_mass("z_peak").unwrap().entries(), 1);
        assert_eq!(output.cutflows["z_peak"].stages().len(), 4);
    }

    #[test]
    fn test_invalid_configurations() {
        let err = Analysis::new(AnalysisConfig::with_categories(["dark_photon"])).unwrap_err();
        assert!(matches!(err, DimuonError::Configuration(_)));
        assert!(Analysis::new(AnalysisConfig::with_categories(["high_pt", "high_pt"])).is_err());
        assert!(Analysis::new(AnalysisConfig::with_categories(Vec::<String>::new())).is_err());
        assert!(Analysis::new(AnalysisConfig {
            categories: vec!["high_pt".to_string()],
            ..AnalysisConfig::default()
        })
        .is_err());
        assert!(Analysis::new(AnalysisConfig {
            linear_binning: Binning::Edges(vec![0.0, 1.0, 1.0]),
            ..AnalysisConfig::default()
        })
        .is_err());
        assert!(Analysis::new(AnalysisConfig {
            combinations: vec![Combination::new("mixed", ["high_pt", "global_muon"])],
            ..AnalysisConfig::with_categories(["high_pt", "global_muon"])
        })
        .is_err());
        assert!(Analysis::new(AnalysisConfig {
            threads: ThreadPolicy::Dedicated(0),
            ..AnalysisConfig::default()
        })
        .is_err());
    }
}
