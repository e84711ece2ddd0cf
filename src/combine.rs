use serde::{Deserialize, Serialize};

use crate::{
    histogram::{mass_histogram_name, Histogram, HistogramSet},
    DimuonError, DimuonResult,
};

/// Order in which stacked histograms are drawn, back to front.
pub const STACK_ORDER: [&str; 7] = [
    "upsilon_stack",
    "bs_stack",
    "psi_prime_stack",
    "jpsi_stack",
    "displaced_stack",
    "low_pt_stack",
    "high_pt",
];

/// A derived histogram formed by the bin-wise sum of two or three category histograms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Combination {
    pub name: String,
    pub constituents: Vec<String>,
}

impl Combination {
    pub fn new<S, I, T>(name: S, constituents: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            name: name.into(),
            constituents: constituents.into_iter().map(Into::into).collect(),
        }
    }

    /// The stacked spectra of the 2011 analysis.
    pub fn standard() -> Vec<Combination> {
        vec![
            Combination::new("low_pt_stack", ["high_pt", "low_pt"]),
            Combination::new("jpsi_threshold_stack", ["high_pt", "jpsi_threshold"]),
            Combination::new("upsilon_stack", ["high_pt", "upsilon"]),
            Combination::new("bs_stack", ["high_pt", "bs"]),
            Combination::new("jpsi_stack", ["high_pt", "jpsi", "low_mass_displaced"]),
            Combination::new("psi_prime_stack", ["high_pt", "psi_prime"]),
            Combination::new("displaced_stack", ["high_pt", "low_mass_displaced", "low_pt"]),
        ]
    }

    /// Check the combination against the names of the active categories.
    ///
    /// # Errors
    ///
    /// [`DimuonError::Configuration`] if the number of constituents is not two or three, if a
    /// constituent is not active, or if the name clashes with a category.
    pub fn validate(&self, categories: &[&str]) -> DimuonResult<()> {
        if !(2..=3).contains(&self.constituents.len()) {
            return Err(DimuonError::Configuration(format!(
                "combination \"{}\" needs two or three constituents, got {}",
                self.name,
                self.constituents.len()
            )));
        }
        if self.name.is_empty() || self.name.contains('/') || categories.contains(&self.name.as_str())
        {
            return Err(DimuonError::Configuration(format!(
                "invalid combination name \"{}\"",
                self.name
            )));
        }
        if let Some(missing) = self
            .constituents
            .iter()
            .find(|constituent| !categories.contains(&constituent.as_str()))
        {
            return Err(DimuonError::Configuration(format!(
                "combination \"{}\" refers to inactive category \"{missing}\"",
                self.name
            )));
        }
        Ok(())
    }

    /// Sum the `variant` histograms of all constituents into a new histogram named
    /// `"{name}/{variant}"`. The constituents are not modified.
    pub fn combine(&self, histograms: &HistogramSet, variant: &str) -> DimuonResult<Histogram> {
        let mut constituents = self.constituents.iter().map(|constituent| {
            let name = mass_histogram_name(constituent, variant);
            histograms
                .get(&name)
                .ok_or(DimuonError::UnknownHistogram { name })
        });
        let first = constituents.next().ok_or_else(|| {
            DimuonError::Configuration(format!("combination \"{}\" is empty", self.name))
        })??;
        let mut combined = first.clone().renamed(mass_histogram_name(&self.name, variant));
        for histogram in constituents {
            combined.merge(histogram?)?;
        }
        Ok(combined)
    }
}

/// Build every combination for each histogram variant.
pub fn combine_all(
    combinations: &[Combination],
    histograms: &HistogramSet,
    variants: &[&str],
) -> DimuonResult<HistogramSet> {
    let mut combined = HistogramSet::new();
    for combination in combinations {
        for variant in variants {
            combined.insert(combination.combine(histograms, variant)?)?;
        }
    }
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::{Binning, LOG_MASS, MASS};

    fn filled_set(names: &[&str], seed: u64) -> HistogramSet {
        let mut rng = fastrand::Rng::with_seed(seed);
        let mut set = HistogramSet::new();
        for name in names {
            let log_name = mass_histogram_name(name, LOG_MASS);
            let linear_name = mass_histogram_name(name, MASS);
            set.book(&log_name, &Binning::log_mass_default()).unwrap();
            set.book(&linear_name, &Binning::uniform(400, (0.0, 4.0))).unwrap();
            for _ in 0..200 {
                let mass = 0.3 + rng.f64() * 100.0;
                set.fill_mass(&log_name, mass).unwrap();
                set.fill_mass(&linear_name, mass).unwrap();
            }
        }
        set
    }

    #[test]
    fn test_combination_is_linear() {
        let set = filled_set(&["high_pt", "jpsi", "low_mass_displaced"], 5);
        let combination = Combination::new("jpsi_stack", ["high_pt", "jpsi", "low_mass_displaced"]);
        let combined = combination.combine(&set, LOG_MASS).unwrap();
        assert_eq!(combined.name(), "jpsi_stack/log_mass");
        let parts: Vec<&Histogram> = ["high_pt", "jpsi", "low_mass_displaced"]
            .iter()
            .map(|c| set.get(&mass_histogram_name(c, LOG_MASS)).unwrap())
            .collect();
        for bin in 0..combined.n_bins() {
            let expected: f64 = parts.iter().map(|h| h.contents()[bin]).sum();
            let expected_w2: f64 = parts.iter().map(|h| h.sumw2()[bin]).sum();
            assert_eq!(combined.contents()[bin], expected);
            assert_eq!(combined.sumw2()[bin], expected_w2);
        }
        let overflow: f64 = parts.iter().map(|h| h.overflow()).sum();
        assert_eq!(combined.overflow(), overflow);
        assert_eq!(combined.entries(), 600);
        // constituents are untouched
        assert_eq!(parts[0].entries(), 200);
    }

    #[test]
    fn test_combine_all_standard() {
        let names = [
            "high_pt",
            "low_pt",
            "upsilon",
            "bs",
            "jpsi",
            "psi_prime",
            "low_mass_displaced",
            "jpsi_threshold",
        ];
        let set = filled_set(&names, 9);
        let combinations = Combination::standard();
        for combination in &combinations {
            combination.validate(&names).unwrap();
        }
        let combined = combine_all(&combinations, &set, &[MASS, LOG_MASS]).unwrap();
        assert_eq!(combined.len(), 14);
        for name in STACK_ORDER {
            assert!(
                combined.contains(&mass_histogram_name(name, LOG_MASS))
                    || set.contains(&mass_histogram_name(name, LOG_MASS))
            );
        }
    }

    #[test]
    fn test_validation() {
        let active = ["high_pt", "low_pt"];
        assert!(Combination::new("a", ["high_pt"]).validate(&active).is_err());
        assert!(Combination::new("a", ["high_pt", "upsilon"])
            .validate(&active)
            .is_err());
        assert!(Combination::new("low_pt", ["high_pt", "low_pt"])
            .validate(&active)
            .is_err());
        assert!(Combination::new("a", ["high_pt", "low_pt"])
            .validate(&active)
            .is_ok());
    }

    #[test]
    fn test_missing_constituent_histogram() {
        let set = filled_set(&["high_pt"], 1);
        let combination = Combination::new("a", ["high_pt", "low_pt"]);
        assert!(matches!(
            combination.combine(&set, MASS),
            Err(DimuonError::UnknownHistogram { .. })
        ));
    }
}
