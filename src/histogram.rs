use std::f64::consts::LN_10;

use accurate::{sum::Klein, traits::*};
use auto_ops::impl_op_ex;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    utils::{edges_are_valid, find_bin, get_bin_edges},
    DimuonError, DimuonResult,
};

/// Suffix of the linear mass histogram of a category or combination.
pub const MASS: &str = "mass";
/// Suffix of the log-mass histogram of a category or combination.
pub const LOG_MASS: &str = "log_mass";
/// Suffix of the optional wide-range linear mass histogram of a category.
pub const MASS_EXTENDED: &str = "mass_extended";

/// The name of a mass histogram, `"{prefix}/{variant}"`.
pub fn mass_histogram_name(prefix: &str, variant: &str) -> String {
    format!("{prefix}/{variant}")
}

/// The binning of a [`Histogram`], fixed when it is booked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Binning {
    /// Evenly spaced `bins` over a linear `range`.
    Uniform {
        /// Number of bins.
        bins: usize,
        /// Lower and upper edge.
        range: (f64, f64),
    },
    /// Evenly spaced `bins` over a `range` of $`\log_{10}`$ values.
    ///
    /// Masses filled into such a histogram are weighted by
    /// $`w = s / (\ln 10 \cdot m)`$ with $`s`$ the `jacobian_scale`, so bin contents read as a
    /// density per unit of linear mass. With 200 bins per decade, $`s = 200`$ gives events per
    /// mass unit and $`s = 2`$ gives events per hundredth of a mass unit (10 MeV).
    Log10 {
        /// Number of bins.
        bins: usize,
        /// Lower and upper edge in $`\log_{10}`$ units.
        range: (f64, f64),
        /// Scale factor of the Jacobian weight.
        jacobian_scale: f64,
    },
    /// Explicit, strictly increasing bin edges.
    Edges(Vec<f64>),
}

impl Binning {
    /// Evenly spaced linear bins.
    pub fn uniform(bins: usize, range: (f64, f64)) -> Self {
        Binning::Uniform { bins, range }
    }

    /// Evenly spaced bins in $`\log_{10}`$ with the given Jacobian scale.
    pub fn log10(bins: usize, range: (f64, f64), jacobian_scale: f64) -> Self {
        Binning::Log10 {
            bins,
            range,
            jacobian_scale,
        }
    }

    /// The log-mass binning of the 2011 spectrum: 620 bins over $`[-0.4, 2.7)`$, normalized to
    /// events per 10 MeV.
    pub fn log_mass_default() -> Self {
        Binning::log10(620, (-0.4, 2.7), 2.0)
    }

    /// Check that the binning describes at least one bin with strictly increasing edges.
    pub fn validate(&self) -> DimuonResult<()> {
        let describe = |reason: &str| Err(DimuonError::Configuration(format!("{self:?}: {reason}")));
        match self {
            Binning::Uniform { bins, range } | Binning::Log10 { bins, range, .. } => {
                if *bins == 0 {
                    return describe("number of bins must be greater than zero");
                }
                if !(range.0.is_finite() && range.1.is_finite() && range.0 < range.1) {
                    return describe("the lower edge must be finite and below the upper edge");
                }
                if let Binning::Log10 { jacobian_scale, .. } = self {
                    if !(jacobian_scale.is_finite() && *jacobian_scale > 0.0) {
                        return describe("the Jacobian scale must be positive");
                    }
                }
                Ok(())
            }
            Binning::Edges(edges) => {
                if edges_are_valid(edges) {
                    Ok(())
                } else {
                    describe("bin edges must be finite and strictly increasing")
                }
            }
        }
    }

    /// The bin edges on the filled axis (in $`\log_{10}`$ units for [`Binning::Log10`]).
    pub fn edges(&self) -> Vec<f64> {
        match self {
            Binning::Uniform { bins, range } | Binning::Log10 { bins, range, .. } => {
                get_bin_edges(*bins, *range)
            }
            Binning::Edges(edges) => edges.clone(),
        }
    }

    fn axis(&self) -> Axis {
        match self {
            Binning::Log10 { jacobian_scale, .. } => Axis::Log10 {
                jacobian_scale: *jacobian_scale,
            },
            _ => Axis::Linear,
        }
    }
}

/// The weight which turns a uniform count in $`\log_{10} m`$ into a density in $`m`$.
///
/// This is $`d\log_{10} m / dm = 1 / (m \ln 10)`$ times the `jacobian_scale`.
#[inline]
pub fn log_mass_weight(mass: f64, jacobian_scale: f64) -> f64 {
    jacobian_scale / LN_10 / mass
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
enum Axis {
    Linear,
    Log10 { jacobian_scale: f64 },
}

/// A weighted one-dimensional histogram with under- and overflow.
///
/// Bin edges are fixed at construction. Every fill adds its weight to a bin (or to the
/// under/overflow) and its squared weight to the matching `sumw2` entry, so per-bin uncertainties
/// are available downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    name: String,
    axis: Axis,
    bin_edges: Vec<f64>,
    contents: Vec<f64>,
    sumw2: Vec<f64>,
    underflow: f64,
    overflow: f64,
    underflow_sumw2: f64,
    overflow_sumw2: f64,
    entries: u64,
}

impl Histogram {
    /// Book an empty histogram.
    ///
    /// # Errors
    ///
    /// [`DimuonError::Configuration`] if the binning is invalid.
    pub fn new<S: Into<String>>(name: S, binning: &Binning) -> DimuonResult<Self> {
        binning.validate()?;
        let bin_edges = binning.edges();
        let n_bins = bin_edges.len() - 1;
        Ok(Self {
            name: name.into(),
            axis: binning.axis(),
            bin_edges,
            contents: vec![0.0; n_bins],
            sumw2: vec![0.0; n_bins],
            underflow: 0.0,
            overflow: 0.0,
            underflow_sumw2: 0.0,
            overflow_sumw2: 0.0,
            entries: 0,
        })
    }

    /// Add `weight` to the bin containing `value`.
    ///
    /// Values below the first edge (including `NaN`) go to the underflow, values at or above the
    /// last edge go to the overflow.
    pub fn fill_weighted(&mut self, value: f64, weight: f64) {
        let w2 = weight * weight;
        self.entries += 1;
        match find_bin(&self.bin_edges, value) {
            Some(bin) => {
                self.contents[bin] += weight;
                self.sumw2[bin] += w2;
            }
            None if value >= self.bin_edges[self.bin_edges.len() - 1] => {
                self.overflow += weight;
                self.overflow_sumw2 += w2;
            }
            None => {
                self.underflow += weight;
                self.underflow_sumw2 += w2;
            }
        }
    }

    /// Add a unit weight to the bin containing `value`.
    pub fn fill(&mut self, value: f64) {
        self.fill_weighted(value, 1.0);
    }

    /// Fill a dimuon mass.
    ///
    /// Linear histograms take the mass with unit weight. Log-mass histograms take
    /// $`\log_{10} m`$ with the Jacobian weight from [`log_mass_weight`]. A non-positive mass
    /// has no logarithm and is counted in the underflow with unit weight.
    pub fn fill_mass(&mut self, mass: f64) {
        match self.axis {
            Axis::Linear => self.fill(mass),
            Axis::Log10 { jacobian_scale } => {
                if mass > 0.0 {
                    self.fill_weighted(mass.log10(), log_mass_weight(mass, jacobian_scale));
                } else {
                    self.fill_weighted(f64::NEG_INFINITY, 1.0);
                }
            }
        }
    }

    /// Add the contents of another histogram with identical binning, bin by bin.
    ///
    /// # Errors
    ///
    /// [`DimuonError::IncompatibleBinning`] if edges or axis differ.
    pub fn merge(&mut self, other: &Histogram) -> DimuonResult<()> {
        if self.bin_edges != other.bin_edges || self.axis != other.axis {
            return Err(DimuonError::IncompatibleBinning {
                left: self.name.clone(),
                right: other.name.clone(),
            });
        }
        for (lhs, rhs) in self.contents.iter_mut().zip(&other.contents) {
            *lhs += rhs;
        }
        for (lhs, rhs) in self.sumw2.iter_mut().zip(&other.sumw2) {
            *lhs += rhs;
        }
        self.underflow += other.underflow;
        self.overflow += other.overflow;
        self.underflow_sumw2 += other.underflow_sumw2;
        self.overflow_sumw2 += other.overflow_sumw2;
        self.entries += other.entries;
        Ok(())
    }

    /// An empty histogram with the same name and binning.
    pub fn zeroed(&self) -> Self {
        let n_bins = self.contents.len();
        Self {
            name: self.name.clone(),
            axis: self.axis,
            bin_edges: self.bin_edges.clone(),
            contents: vec![0.0; n_bins],
            sumw2: vec![0.0; n_bins],
            underflow: 0.0,
            overflow: 0.0,
            underflow_sumw2: 0.0,
            overflow_sumw2: 0.0,
            entries: 0,
        }
    }

    /// The same histogram under a different name.
    pub fn renamed<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn n_bins(&self) -> usize {
        self.contents.len()
    }
    /// The edges of each bin (length is one greater than [`Histogram::contents`]).
    pub fn bin_edges(&self) -> &[f64] {
        &self.bin_edges
    }
    /// The sum of weights in each bin.
    pub fn contents(&self) -> &[f64] {
        &self.contents
    }
    /// The sum of squared weights in each bin.
    pub fn sumw2(&self) -> &[f64] {
        &self.sumw2
    }
    /// The statistical uncertainty of each bin, $`\sqrt{\sum w^2}`$.
    pub fn errors(&self) -> Vec<f64> {
        self.sumw2.iter().map(|w2| w2.sqrt()).collect()
    }
    pub fn underflow(&self) -> f64 {
        self.underflow
    }
    pub fn overflow(&self) -> f64 {
        self.overflow
    }
    pub fn underflow_sumw2(&self) -> f64 {
        self.underflow_sumw2
    }
    pub fn overflow_sumw2(&self) -> f64 {
        self.overflow_sumw2
    }
    /// The number of fill calls, in range or not.
    pub fn entries(&self) -> u64 {
        self.entries
    }
    /// Whether masses are filled on a $`\log_{10}`$ axis.
    pub fn is_log_mass(&self) -> bool {
        matches!(self.axis, Axis::Log10 { .. })
    }

    /// The compensated sum of all in-range bin contents.
    pub fn integral(&self) -> f64 {
        self.contents
            .iter()
            .copied()
            .sum_with_accumulator::<Klein<f64>>()
    }

    /// The compensated sum of all contents including under- and overflow.
    pub fn total(&self) -> f64 {
        self.contents
            .iter()
            .copied()
            .chain([self.underflow, self.overflow])
            .sum_with_accumulator::<Klein<f64>>()
    }
}

// bin-wise sum keeping the name of the left operand
impl_op_ex!(+ |a: &Histogram, b: &Histogram| -> DimuonResult<Histogram> {
    let mut sum = a.clone();
    sum.merge(b)?;
    Ok(sum)
});

/// A named, ordered collection of [`Histogram`]s.
///
/// One set is owned by each accumulator; sets from different workers are combined with
/// [`HistogramSet::merge`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSet {
    histograms: IndexMap<String, Histogram>,
}

impl HistogramSet {
    /// Create an empty [`HistogramSet`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Book a new histogram.
    ///
    /// # Errors
    ///
    /// [`DimuonError::Configuration`] if the name is taken or the binning is invalid.
    pub fn book<S: Into<String>>(&mut self, name: S, binning: &Binning) -> DimuonResult<()> {
        self.insert(Histogram::new(name, binning)?)
    }

    /// Add an existing histogram under its own name.
    pub fn insert(&mut self, histogram: Histogram) -> DimuonResult<()> {
        if self.histograms.contains_key(histogram.name()) {
            return Err(DimuonError::Configuration(format!(
                "a histogram named \"{}\" is already booked",
                histogram.name()
            )));
        }
        self.histograms
            .insert(histogram.name().to_string(), histogram);
        Ok(())
    }

    /// Add `weight` at `value` to the named histogram.
    pub fn fill(&mut self, name: &str, value: f64, weight: f64) -> DimuonResult<()> {
        self.get_mut(name)?.fill_weighted(value, weight);
        Ok(())
    }

    /// Fill a mass into the named histogram, see [`Histogram::fill_mass`].
    pub fn fill_mass(&mut self, name: &str, mass: f64) -> DimuonResult<()> {
        self.get_mut(name)?.fill_mass(mass);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Histogram> {
        self.histograms.get(name)
    }

    fn get_mut(&mut self, name: &str) -> DimuonResult<&mut Histogram> {
        self.histograms
            .get_mut(name)
            .ok_or_else(|| DimuonError::UnknownHistogram {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.histograms.contains_key(name)
    }
    pub fn len(&self) -> usize {
        self.histograms.len()
    }
    pub fn is_empty(&self) -> bool {
        self.histograms.is_empty()
    }
    /// Histogram names in booking order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.histograms.keys().map(String::as_str)
    }
    pub fn iter(&self) -> impl Iterator<Item = &Histogram> {
        self.histograms.values()
    }

    /// A set with the same histograms, all emptied.
    pub fn zeroed(&self) -> Self {
        Self {
            histograms: self
                .histograms
                .iter()
                .map(|(name, histogram)| (name.clone(), histogram.zeroed()))
                .collect(),
        }
    }

    /// Add another set into this one. Histograms only present in `other` are copied over.
    pub fn merge(&mut self, other: &HistogramSet) -> DimuonResult<()> {
        for (name, histogram) in &other.histograms {
            match self.histograms.get_mut(name) {
                Some(existing) => existing.merge(histogram)?,
                None => {
                    self.histograms.insert(name.clone(), histogram.clone());
                }
            }
        }
        Ok(())
    }

    /// Move all histograms of `other` into this set.
    pub fn extend(&mut self, other: HistogramSet) -> DimuonResult<()> {
        for histogram in other.histograms.into_values() {
            self.insert(histogram)?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a HistogramSet {
    type Item = (&'a String, &'a Histogram);
    type IntoIter = indexmap::map::Iter<'a, String, Histogram>;

    fn into_iter(self) -> Self::IntoIter {
        self.histograms.iter()
    }
}
