use serde::{Deserialize, Serialize};

use crate::{
    data::{DimuonCandidate, Event, Muon},
    utils::{enums::MuonId, vectors::mass_of_pair},
    DimuonError, DimuonResult,
};

/// A predicate over the identification and track-quality attributes of a single [`Muon`].
///
/// Every requirement is optional except the identification flag, which defaults to
/// [`MuonId::Any`]. Gates are configured per category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityGate {
    /// The identification flag the muon must carry.
    pub id: MuonId,
    /// Minimum of [`Muon::combined_valid_hits`] (inclusive).
    pub min_valid_hits: Option<u32>,
    /// Minimum number of pixel hits (inclusive).
    pub min_pixel_hits: Option<u32>,
    /// Maximum normalized $`\chi^2`$ (exclusive).
    pub max_normalized_chi2: Option<f64>,
}

impl QualityGate {
    /// A gate which every muon passes.
    pub fn any() -> Self {
        Self::default()
    }

    /// Require the medium identification working point and nothing else.
    pub fn medium() -> Self {
        Self {
            id: MuonId::Medium,
            ..Self::default()
        }
    }

    /// The global-muon gate of the 2010 analysis: a global muon with at least 12 valid hits,
    /// at least 2 pixel hits and a normalized $`\chi^2`$ below 4.
    pub fn global_legacy() -> Self {
        Self {
            id: MuonId::Global,
            min_valid_hits: Some(12),
            min_pixel_hits: Some(2),
            max_normalized_chi2: Some(4.0),
        }
    }

    /// Check a single muon against the gate.
    pub fn passes(&self, muon: &Muon) -> bool {
        self.id.is_satisfied_by(muon)
            && self
                .min_valid_hits
                .map_or(true, |min| muon.combined_valid_hits() >= min)
            && self
                .min_pixel_hits
                .map_or(true, |min| muon.pixel_hits >= min)
            && self
                .max_normalized_chi2
                .map_or(true, |max| muon.normalized_chi2 < max)
    }

    /// Reject a `NaN` or non-positive $`\chi^2`$ ceiling, which no muon could pass.
    pub fn validate(&self) -> DimuonResult<()> {
        if let Some(max) = self.max_normalized_chi2 {
            if max.is_nan() || max <= 0.0 {
                return Err(DimuonError::Configuration(format!(
                    "maximum normalized chi2 must be positive (got {max})"
                )));
            }
        }
        Ok(())
    }
}

/// Which muons of an event are paired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairingMode {
    /// Every unordered pair of distinct eligible muons.
    #[default]
    AllPairs,
    /// Only the first two muons in storage order.
    LeadingPair,
}

/// Per-event counts the cut flow is built from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairStages {
    /// Muons in the event.
    pub n_muons: usize,
    /// Muons passing the gate and the leg $`p_T`$ threshold.
    pub n_eligible: usize,
    /// Pairs whose legs are both eligible.
    pub quality_pairs: usize,
    /// Eligible pairs with opposite charges, i.e. accepted pairs.
    pub opposite_sign_pairs: usize,
}

impl PairStages {
    pub fn has_two_muons(&self) -> bool {
        self.n_muons >= 2
    }
    pub fn has_quality_pair(&self) -> bool {
        self.quality_pairs > 0
    }
    pub fn has_opposite_sign_pair(&self) -> bool {
        self.opposite_sign_pairs > 0
    }
}

/// Scratch space for [`PairSelector::select`], reused across events to avoid per-event
/// allocation.
#[derive(Debug, Clone, Default)]
pub struct PairBuffer {
    eligible: Vec<bool>,
    indices: Vec<usize>,
    candidates: Vec<DimuonCandidate>,
    stages: PairStages,
}

impl PairBuffer {
    pub fn new() -> Self {
        Self::default()
    }
    /// The accepted pairs of the last selected event.
    pub fn candidates(&self) -> &[DimuonCandidate] {
        &self.candidates
    }
    /// The stage counts of the last selected event.
    pub fn stages(&self) -> PairStages {
        self.stages
    }

    fn reset(&mut self, n_muons: usize) {
        self.eligible.clear();
        self.indices.clear();
        self.candidates.clear();
        self.stages = PairStages {
            n_muons,
            ..PairStages::default()
        };
    }
}

/// Forms opposite-charge muon pairs from an [`Event`].
///
/// Each leg must pass the [`QualityGate`] and exceed the leg $`p_T`$ threshold before a mass is
/// computed. When the event ships precomputed [`DimuonCandidate`]s those are filtered with the
/// same leg and charge requirements instead, unless raw pairing is forced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PairSelector {
    gate: QualityGate,
    min_leg_pt: f64,
    mode: PairingMode,
    force_raw: bool,
}

impl PairSelector {
    /// A selector pairing all eligible muons.
    pub fn new(gate: QualityGate, min_leg_pt: f64) -> Self {
        Self {
            gate,
            min_leg_pt,
            mode: PairingMode::AllPairs,
            force_raw: false,
        }
    }

    pub fn with_mode(mut self, mode: PairingMode) -> Self {
        self.mode = mode;
        self
    }

    /// Ignore precomputed candidates and always pair the raw muons.
    pub fn with_force_raw(mut self, force_raw: bool) -> Self {
        self.force_raw = force_raw;
        self
    }

    pub fn gate(&self) -> &QualityGate {
        &self.gate
    }
    pub fn min_leg_pt(&self) -> f64 {
        self.min_leg_pt
    }
    pub fn mode(&self) -> PairingMode {
        self.mode
    }

    /// Whether a single muon may be used as a leg.
    pub fn leg_passes(&self, muon: &Muon) -> bool {
        muon.pt > self.min_leg_pt && self.gate.passes(muon)
    }

    /// Select the accepted pairs of `event` into `buffer`.
    ///
    /// Every returned candidate has a charge sum of zero and a mass. Stage counts for the cut
    /// flow are left in [`PairBuffer::stages`].
    ///
    /// # Errors
    ///
    /// [`DimuonError::MalformedPairIndex`] if a precomputed candidate points outside the muon
    /// list. The buffer content is unspecified afterwards.
    pub fn select<'b>(
        &self,
        event: &Event,
        buffer: &'b mut PairBuffer,
    ) -> DimuonResult<&'b [DimuonCandidate]> {
        buffer.reset(event.n_muons());
        buffer
            .eligible
            .extend(event.muons.iter().map(|muon| self.leg_passes(muon)));
        buffer.stages.n_eligible = buffer.eligible.iter().filter(|e| **e).count();
        match (&event.dimuons, self.mode, self.force_raw) {
            (Some(dimuons), PairingMode::AllPairs, false) => {
                self.select_precomputed(event, dimuons, buffer)?
            }
            (_, PairingMode::LeadingPair, _) => self.select_leading(event, buffer),
            _ => self.select_all_pairs(event, buffer),
        }
        Ok(&buffer.candidates)
    }

    fn select_all_pairs(&self, event: &Event, buffer: &mut PairBuffer) {
        buffer.indices.extend(
            buffer
                .eligible
                .iter()
                .enumerate()
                .filter_map(|(index, eligible)| eligible.then_some(index)),
        );
        let n = buffer.indices.len();
        buffer.stages.quality_pairs = n * n.saturating_sub(1) / 2;
        for (k, &i) in buffer.indices.iter().enumerate() {
            for &j in &buffer.indices[k + 1..] {
                if let Some(candidate) = opposite_sign_pair(event, i, j) {
                    buffer.candidates.push(candidate);
                }
            }
        }
        buffer.stages.opposite_sign_pairs = buffer.candidates.len();
    }

    fn select_leading(&self, event: &Event, buffer: &mut PairBuffer) {
        if event.n_muons() < 2 || !(buffer.eligible[0] && buffer.eligible[1]) {
            return;
        }
        buffer.stages.quality_pairs = 1;
        if let Some(candidate) = opposite_sign_pair(event, 0, 1) {
            buffer.candidates.push(candidate);
            buffer.stages.opposite_sign_pairs = 1;
        }
    }

    fn select_precomputed(
        &self,
        event: &Event,
        dimuons: &[DimuonCandidate],
        buffer: &mut PairBuffer,
    ) -> DimuonResult<()> {
        let n_muons = event.n_muons();
        for dimuon in dimuons {
            for index in [dimuon.first, dimuon.second] {
                if index >= n_muons {
                    return Err(DimuonError::MalformedPairIndex { index, n_muons });
                }
            }
            if dimuon.first == dimuon.second
                || !(buffer.eligible[dimuon.first] && buffer.eligible[dimuon.second])
            {
                continue;
            }
            buffer.stages.quality_pairs += 1;
            if dimuon.charge_sum != 0 {
                continue;
            }
            let mass = dimuon.mass_in(event)?;
            buffer.candidates.push(DimuonCandidate {
                mass: Some(mass),
                ..*dimuon
            });
        }
        buffer.stages.opposite_sign_pairs = buffer.candidates.len();
        Ok(())
    }
}

fn opposite_sign_pair(event: &Event, i: usize, j: usize) -> Option<DimuonCandidate> {
    let (a, b) = (&event.muons[i], &event.muons[j]);
    let charge_sum = a.charge + b.charge;
    // a charge of zero marks a muon read without its charge
    if a.charge == 0 || charge_sum != 0 {
        return None;
    }
    let mass = mass_of_pair(a.pt, a.eta, a.phi, a.mass, b.pt, b.eta, b.phi, b.mass);
    Some(DimuonCandidate {
        first: i,
        second: j,
        charge_sum,
        mass: Some(mass),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::good_muon;
    use approx::assert_relative_eq;

    fn event_with(muons: Vec<Muon>) -> Event {
        Event::new(165_000, 1, 1, muons)
    }

    #[test]
    fn test_gate_presets() {
        let mut muon = good_muon(10.0, 0.0, 0.0, 1);
        assert!(QualityGate::any().passes(&muon));
        assert!(QualityGate::medium().passes(&muon));
        assert!(QualityGate::global_legacy().passes(&muon));

        muon.valid_hits = 6;
        muon.valid_muon_hits = 5;
        assert!(!QualityGate::global_legacy().passes(&muon));
        muon.valid_muon_hits = 6;
        assert!(QualityGate::global_legacy().passes(&muon));

        muon.normalized_chi2 = 4.0;
        assert!(!QualityGate::global_legacy().passes(&muon));
        muon.normalized_chi2 = 3.99;
        muon.pixel_hits = 1;
        assert!(!QualityGate::global_legacy().passes(&muon));
        muon.pixel_hits = 2;
        muon.is_global = false;
        assert!(!QualityGate::global_legacy().passes(&muon));
        assert!(QualityGate::medium().passes(&muon));
    }

    #[test]
    fn test_gate_validation() {
        assert!(QualityGate::global_legacy().validate().is_ok());
        let gate = QualityGate {
            max_normalized_chi2: Some(f64::NAN),
            ..QualityGate::any()
        };
        assert!(gate.validate().is_err());
    }

    #[test]
    fn test_single_opposite_sign_pair() {
        let event = event_with(vec![
            good_muon(10.0, 0.1, 0.0, 1),
            good_muon(12.0, -0.2, 1.5, -1),
        ]);
        let selector = PairSelector::new(QualityGate::medium(), 6.0);
        let mut buffer = PairBuffer::new();
        let pairs = selector.select(&event, &mut buffer).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!((pairs[0].first, pairs[0].second), (0, 1));
        let expected = mass_of_pair(10.0, 0.1, 0.0, 0.105, 12.0, -0.2, 1.5, 0.105);
        assert_relative_eq!(pairs[0].mass.unwrap(), expected);
    }

    #[test]
    fn test_same_sign_pair_is_rejected() {
        let event = event_with(vec![good_muon(10.0, 0.1, 0.0, 1), good_muon(12.0, -0.2, 1.5, 1)]);
        let selector = PairSelector::new(QualityGate::medium(), 6.0);
        let mut buffer = PairBuffer::new();
        assert!(selector.select(&event, &mut buffer).unwrap().is_empty());
        let stages = buffer.stages();
        assert!(stages.has_two_muons());
        assert!(stages.has_quality_pair());
        assert!(!stages.has_opposite_sign_pair());
    }

    #[test]
    fn test_failing_muon_is_never_paired() {
        let mut bad = good_muon(20.0, 0.5, 2.0, -1);
        bad.medium_id = false;
        let event = event_with(vec![
            good_muon(10.0, 0.1, 0.0, 1),
            bad,
            good_muon(12.0, -0.2, 1.5, -1),
        ]);
        let selector = PairSelector::new(QualityGate::medium(), 2.0);
        let mut buffer = PairBuffer::new();
        let pairs = selector.select(&event, &mut buffer).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!((pairs[0].first, pairs[0].second), (0, 2));
        assert_eq!(buffer.stages().n_eligible, 2);
        assert_eq!(buffer.stages().quality_pairs, 1);
    }

    #[test]
    fn test_fewer_than_two_eligible() {
        let selector = PairSelector::new(QualityGate::medium(), 6.0);
        let mut buffer = PairBuffer::new();
        let empty = event_with(Vec::new());
        assert!(selector.select(&empty, &mut buffer).unwrap().is_empty());
        let single = event_with(vec![good_muon(10.0, 0.0, 0.0, 1)]);
        assert!(selector.select(&single, &mut buffer).unwrap().is_empty());
        // the soft leg fails the threshold
        let soft = event_with(vec![good_muon(10.0, 0.0, 0.0, 1), good_muon(6.0, 0.0, 1.0, -1)]);
        assert!(selector.select(&soft, &mut buffer).unwrap().is_empty());
        assert!(!buffer.stages().has_quality_pair());
    }

    #[test]
    fn test_random_events_only_yield_opposite_charges() {
        let mut rng = fastrand::Rng::with_seed(2011);
        let selector = PairSelector::new(QualityGate::medium(), 2.0);
        let mut buffer = PairBuffer::new();
        for _ in 0..500 {
            let n = rng.usize(0..7);
            let muons: Vec<Muon> = (0..n)
                .map(|_| {
                    let mut muon = good_muon(
                        rng.f64() * 20.0,
                        rng.f64() * 4.8 - 2.4,
                        rng.f64() * 6.28 - 3.14,
                        if rng.bool() { 1 } else { -1 },
                    );
                    muon.medium_id = rng.f64() < 0.8;
                    muon
                })
                .collect();
            let event = event_with(muons);
            let pairs = selector.select(&event, &mut buffer).unwrap();
            let mut seen = std::collections::HashSet::new();
            for pair in pairs {
                assert_eq!(pair.charge_sum, 0);
                assert!(pair.first < pair.second);
                assert!(seen.insert((pair.first, pair.second)));
                let (a, b) = event.legs(pair.first, pair.second).unwrap();
                assert_eq!(a.charge + b.charge, 0);
                assert!(selector.leg_passes(a) && selector.leg_passes(b));
                let mass = pair.mass.unwrap();
                assert!(mass.is_finite() && mass >= 0.0);
            }
        }
    }

    #[test]
    fn test_leading_pair_mode() {
        let event = event_with(vec![
            good_muon(10.0, 0.1, 0.0, 1),
            good_muon(2.0, -0.2, 1.5, -1),
            good_muon(12.0, -0.2, 1.5, -1),
        ]);
        let all = PairSelector::new(QualityGate::any(), 3.0);
        let leading = all.with_mode(PairingMode::LeadingPair);
        let mut buffer = PairBuffer::new();
        assert_eq!(all.select(&event, &mut buffer).unwrap().len(), 1);
        assert!(leading.select(&event, &mut buffer).unwrap().is_empty());
        let event = event_with(vec![good_muon(10.0, 0.1, 0.0, 1), good_muon(4.0, -0.2, 1.5, -1)]);
        assert_eq!(leading.select(&event, &mut buffer).unwrap().len(), 1);
    }

    #[test]
    fn test_precomputed_candidates() {
        let muons = vec![
            good_muon(10.0, 0.1, 0.0, 1),
            good_muon(12.0, -0.2, 1.5, -1),
            good_muon(1.0, -0.2, 1.5, -1),
        ];
        let event = event_with(muons).with_dimuons(vec![
            DimuonCandidate {
                first: 0,
                second: 1,
                charge_sum: 0,
                mass: Some(3.1),
            },
            DimuonCandidate {
                first: 0,
                second: 2,
                charge_sum: 0,
                mass: Some(9.4),
            },
        ]);
        let selector = PairSelector::new(QualityGate::medium(), 2.0);
        let mut buffer = PairBuffer::new();
        let pairs = selector.select(&event, &mut buffer).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].mass, Some(3.1));

        let raw = selector
            .with_force_raw(true)
            .select(&event, &mut buffer)
            .unwrap();
        assert_eq!(raw.len(), 1);
        assert_ne!(raw[0].mass, Some(3.1));

        let broken = event.with_dimuons(vec![DimuonCandidate {
            first: 0,
            second: 7,
            charge_sum: 0,
            mass: None,
        }]);
        assert!(matches!(
            selector.select(&broken, &mut buffer),
            Err(DimuonError::MalformedPairIndex { index: 7, n_muons: 3 })
        ));
    }

    #[test]
    fn test_muons_without_charge_are_not_paired() {
        let event = event_with(vec![good_muon(10.0, 0.1, 0.0, 0), good_muon(12.0, -0.2, 1.5, 0)]);
        let selector = PairSelector::new(QualityGate::medium(), 2.0);
        let mut buffer = PairBuffer::new();
        assert!(selector.select(&event, &mut buffer).unwrap().is_empty());
        assert!(buffer.stages().has_quality_pair());
        let leading = selector.with_mode(PairingMode::LeadingPair);
        assert!(leading.select(&event, &mut buffer).unwrap().is_empty());
    }
}
