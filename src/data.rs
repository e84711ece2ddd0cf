use std::{fmt::Display, ops::Index, sync::Arc};

use indexmap::IndexMap;
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    utils::{enums::Charge, vectors::Vec4},
    DimuonError, DimuonResult,
};

/// A reconstructed muon as delivered by the ingestion layer.
///
/// The position of a [`Muon`] in [`Event::muons`] is its identity within the event; dimuon
/// candidates refer to muons by that index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Muon {
    /// Transverse momentum.
    pub pt: f64,
    /// Pseudorapidity.
    pub eta: f64,
    /// Azimuthal angle.
    pub phi: f64,
    /// Rest mass assigned to the track.
    pub mass: f64,
    /// Electric charge, `+1` or `-1`, or `0` when the record carries no charge.
    pub charge: i32,
    /// Reconstructed as a global muon.
    pub is_global: bool,
    /// Reconstructed as a tracker muon.
    pub is_tracker: bool,
    /// Number of valid hits on the (global) track.
    pub valid_hits: u32,
    /// Number of valid muon-system hits on the global track.
    ///
    /// This is read from the `Muon_gnValidMu` column, which upstream documentation flags as a
    /// possibly mislabelled `nValidMu`. It is summed with [`Muon::valid_hits`] as documented, but
    /// its meaning is unverified.
    pub valid_muon_hits: u32,
    /// Number of pixel hits.
    pub pixel_hits: u32,
    /// Normalized $`\chi^2`$ of the track fit.
    pub normalized_chi2: f64,
    /// Passes the medium identification working point.
    pub medium_id: bool,
}

impl Muon {
    /// The four-momentum of the muon.
    pub fn p4(&self) -> Vec4 {
        Vec4::from_pt_eta_phi_m(self.pt, self.eta, self.phi, self.mass)
    }

    /// Sum of [`Muon::valid_hits`] and [`Muon::valid_muon_hits`], the quantity the legacy
    /// quality gate cuts on.
    pub fn combined_valid_hits(&self) -> u32 {
        self.valid_hits.saturating_add(self.valid_muon_hits)
    }
}

/// A pair of muons within one event.
///
/// Candidates are either built by the [`PairSelector`](crate::selection::PairSelector) or shipped
/// precomputed with the event, in which case the mass may already be known.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimuonCandidate {
    /// Index of the first leg in [`Event::muons`].
    pub first: usize,
    /// Index of the second leg in [`Event::muons`].
    pub second: usize,
    /// Sum of the charges of both legs.
    pub charge_sum: i32,
    /// The invariant mass, if it was precomputed.
    pub mass: Option<f64>,
}

impl DimuonCandidate {
    /// Build a candidate from two muon indices of the given event, computing charge sum and
    /// mass from the legs.
    pub fn from_legs(event: &Event, first: usize, second: usize) -> DimuonResult<Self> {
        let (a, b) = event.legs(first, second)?;
        Ok(Self {
            first,
            second,
            charge_sum: a.charge + b.charge,
            mass: Some((a.p4() + b.p4()).mag()),
        })
    }

    /// The invariant mass, using the precomputed value when present.
    pub fn mass_in(&self, event: &Event) -> DimuonResult<f64> {
        match self.mass {
            Some(mass) => Ok(mass),
            None => {
                let (a, b) = event.legs(self.first, self.second)?;
                Ok((a.p4() + b.p4()).mag())
            }
        }
    }
}

/// A single collision event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Run number.
    pub run: u32,
    /// Event number within the run.
    pub event: u64,
    /// Luminosity block (lumi section).
    pub luminosity_block: u32,
    /// All muons of the event, in storage order.
    pub muons: Vec<Muon>,
    /// Precomputed dimuon candidates, for datasets which ship them.
    pub dimuons: Option<Vec<DimuonCandidate>>,
    /// Boolean trigger decisions by name.
    pub triggers: IndexMap<String, bool>,
    /// Numeric trigger quantities by name (for instance a dimuon trigger threshold).
    pub trigger_values: IndexMap<String, f64>,
}

impl Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Event {} (run {}, lumi {}):",
            self.event, self.run, self.luminosity_block
        )?;
        writeln!(f, "  muons:")?;
        for (idx, muon) in self.muons.iter().enumerate() {
            writeln!(
                f,
                "    [{idx}] q={:+} pt={:.3} eta={:.3} phi={:.3}",
                muon.charge, muon.pt, muon.eta, muon.phi
            )?;
        }
        if let Some(dimuons) = &self.dimuons {
            writeln!(f, "  dimuons: {}", dimuons.len())?;
        }
        let fired: Vec<&str> = self
            .triggers
            .iter()
            .filter_map(|(name, fired)| fired.then_some(name.as_str()))
            .collect();
        writeln!(f, "  triggers: [{}]", fired.join(", "))?;
        Ok(())
    }
}

impl Event {
    /// Create an [`Event`] with the given identifiers and muons and no trigger information.
    pub fn new(run: u32, event: u64, luminosity_block: u32, muons: Vec<Muon>) -> Self {
        Self {
            run,
            event,
            luminosity_block,
            muons,
            ..Default::default()
        }
    }

    /// Builder-style helper to set a boolean trigger decision.
    pub fn with_trigger<S: Into<String>>(mut self, name: S, fired: bool) -> Self {
        self.triggers.insert(name.into(), fired);
        self
    }

    /// Builder-style helper to set a numeric trigger quantity.
    pub fn with_trigger_value<S: Into<String>>(mut self, name: S, value: f64) -> Self {
        self.trigger_values.insert(name.into(), value);
        self
    }

    /// Builder-style helper to attach precomputed dimuon candidates.
    pub fn with_dimuons(mut self, dimuons: Vec<DimuonCandidate>) -> Self {
        self.dimuons = Some(dimuons);
        self
    }

    /// Number of muons in the event.
    pub fn n_muons(&self) -> usize {
        self.muons.len()
    }

    /// The decision of the named trigger. Unknown triggers did not fire.
    pub fn trigger(&self, name: &str) -> bool {
        self.triggers.get(name).copied().unwrap_or(false)
    }

    /// The named numeric trigger quantity, if present.
    pub fn trigger_value(&self, name: &str) -> Option<f64> {
        self.trigger_values.get(name).copied()
    }

    /// Both legs of a candidate, bounds-checked against the muon array.
    pub fn legs(&self, first: usize, second: usize) -> DimuonResult<(&Muon, &Muon)> {
        let n_muons = self.muons.len();
        let a = self
            .muons
            .get(first)
            .ok_or(DimuonError::MalformedPairIndex {
                index: first,
                n_muons,
            })?;
        let b = self
            .muons
            .get(second)
            .ok_or(DimuonError::MalformedPairIndex {
                index: second,
                n_muons,
            })?;
        Ok((a, b))
    }

    /// Check that every precomputed candidate refers to muons of this event.
    pub fn check_candidates(&self) -> DimuonResult<()> {
        for dimuon in self.dimuons.iter().flatten() {
            self.legs(dimuon.first, dimuon.second)?;
        }
        Ok(())
    }
}

/// Per-event parallel arrays, the shape in which the ingestion layer hands over records.
///
/// Numeric per-muon arrays are required whenever the event has muons; boolean arrays and trigger
/// maps may be absent, in which case every flag reads as `false`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventColumns {
    pub run: Option<u32>,
    pub event: Option<u64>,
    pub luminosity_block: Option<u32>,
    pub n_muon: Option<usize>,
    pub muon_mass: Option<Vec<f64>>,
    pub muon_pt: Option<Vec<f64>>,
    pub muon_eta: Option<Vec<f64>>,
    pub muon_phi: Option<Vec<f64>>,
    pub muon_charge: Option<Vec<i32>>,
    pub muon_is_tracker: Option<Vec<bool>>,
    pub muon_is_global: Option<Vec<bool>>,
    pub muon_medium_id: Option<Vec<bool>>,
    pub muon_valid_hits: Option<Vec<u32>>,
    pub muon_valid_muon_hits: Option<Vec<u32>>,
    pub muon_pixel_hits: Option<Vec<u32>>,
    pub muon_normalized_chi2: Option<Vec<f64>>,
    pub dimu_charge: Option<Vec<i32>>,
    pub dimu_mass: Option<Vec<f64>>,
    pub dimu_first_index: Option<Vec<i64>>,
    pub dimu_second_index: Option<Vec<i64>>,
    pub triggers: IndexMap<String, bool>,
    pub trigger_values: IndexMap<String, f64>,
}

fn required<'a, T>(
    field: &str,
    column: &'a Option<Vec<T>>,
    expected: usize,
) -> DimuonResult<&'a [T]> {
    let values = column.as_deref().ok_or_else(|| DimuonError::MissingField {
        field: field.to_string(),
    })?;
    check_length(field, values.len(), expected)?;
    Ok(values)
}

fn optional<'a, T>(
    field: &str,
    column: &'a Option<Vec<T>>,
    expected: usize,
) -> DimuonResult<Option<&'a [T]>> {
    match column.as_deref() {
        Some(values) => {
            check_length(field, values.len(), expected)?;
            Ok(Some(values))
        }
        None => Ok(None),
    }
}

fn check_length(field: &str, found: usize, expected: usize) -> DimuonResult<()> {
    if found != expected {
        return Err(DimuonError::MismatchedLength {
            field: field.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

fn leg_column<'a, T>(
    field: &str,
    column: &'a Option<Vec<T>>,
    expected: usize,
    needed: bool,
) -> DimuonResult<Option<&'a [T]>> {
    if needed {
        required(field, column, expected).map(Some)
    } else {
        optional(field, column, expected)
    }
}

fn leg_index(raw: i64, n_muons: usize) -> DimuonResult<usize> {
    usize::try_from(raw)
        .ok()
        .filter(|index| *index < n_muons)
        .ok_or(DimuonError::MalformedPairIndex {
            // negative indices wrap and are reported as out of bounds
            index: raw as usize,
            n_muons,
        })
}

impl EventColumns {
    /// Validate the columns and assemble an [`Event`].
    ///
    /// Events shipping precomputed candidates (`Dimu_t1muIdx` and friends) only need the
    /// transverse momentum of each muon. Their pseudorapidity, azimuth and mass then read as
    /// `NaN` and their charge as `0` when absent, and such muons never form a raw pair.
    ///
    /// # Errors
    ///
    /// [`DimuonError::MissingField`] if an identifier or a required per-muon array is absent, or
    /// if a candidate has neither a mass nor leg kinematics. [`DimuonError::MismatchedLength`]
    /// if array lengths disagree with the muon count, [`DimuonError::InvalidCharge`] for a charge
    /// other than `+1` or `-1`, and [`DimuonError::MalformedPairIndex`] if a precomputed
    /// candidate points outside the muon arrays. All of these only invalidate this one event.
    pub fn into_event(self) -> DimuonResult<Event> {
        let missing = |field: &str| DimuonError::MissingField {
            field: field.to_string(),
        };
        let run = self.run.ok_or_else(|| missing("run"))?;
        let event = self.event.ok_or_else(|| missing("event"))?;
        let luminosity_block = self
            .luminosity_block
            .ok_or_else(|| missing("luminosityBlock"))?;
        let n_muon = match (self.n_muon, self.muon_pt.as_ref()) {
            (Some(n), _) => n,
            (None, Some(pt)) => pt.len(),
            (None, None) => 0,
        };
        let needs_legs = self.dimu_first_index.is_none();

        let mut muons = Vec::with_capacity(n_muon);
        let mut has_kinematics = true;
        if n_muon > 0 {
            let pt = required("Muon_pt", &self.muon_pt, n_muon)?;
            let eta = leg_column("Muon_eta", &self.muon_eta, n_muon, needs_legs)?;
            let phi = leg_column("Muon_phi", &self.muon_phi, n_muon, needs_legs)?;
            let mass = leg_column("Muon_mass", &self.muon_mass, n_muon, needs_legs)?;
            let charge = leg_column("Muon_charge", &self.muon_charge, n_muon, needs_legs)?;
            has_kinematics = eta.is_some() && phi.is_some() && mass.is_some();
            let is_tracker = optional("Muon_isTracker", &self.muon_is_tracker, n_muon)?;
            let is_global = optional("Muon_isGlobal", &self.muon_is_global, n_muon)?;
            let medium_id = optional("Muon_mediumId", &self.muon_medium_id, n_muon)?;
            let valid_hits = optional("Muon_gnValid", &self.muon_valid_hits, n_muon)?;
            let valid_muon_hits = optional("Muon_gnValidMu", &self.muon_valid_muon_hits, n_muon)?;
            let pixel_hits = optional("Muon_gnPix", &self.muon_pixel_hits, n_muon)?;
            let chi2 = optional("Muon_gChi2", &self.muon_normalized_chi2, n_muon)?;
            let flag = |column: Option<&[bool]>, i: usize| column.map_or(false, |c| c[i]);
            let count = |column: Option<&[u32]>, i: usize| column.map_or(0, |c| c[i]);
            let value = |column: Option<&[f64]>, i: usize| column.map_or(f64::NAN, |c| c[i]);
            for i in 0..n_muon {
                let leg_charge = match charge {
                    Some(charge) => Charge::try_from(charge[i])?.value(),
                    None => 0,
                };
                muons.push(Muon {
                    pt: pt[i],
                    eta: value(eta, i),
                    phi: value(phi, i),
                    mass: value(mass, i),
                    charge: leg_charge,
                    is_global: flag(is_global, i),
                    is_tracker: flag(is_tracker, i),
                    valid_hits: count(valid_hits, i),
                    valid_muon_hits: count(valid_muon_hits, i),
                    pixel_hits: count(pixel_hits, i),
                    // an absent fit quality can never pass a chi2 cut
                    normalized_chi2: chi2.map_or(f64::INFINITY, |c| c[i]),
                    medium_id: flag(medium_id, i),
                });
            }
        }

        let dimuons = match self.dimu_first_index.as_ref() {
            None => None,
            Some(first) => {
                let n_dimu = first.len();
                let second = required("Dimu_t2muIdx", &self.dimu_second_index, n_dimu)?;
                let charge = required("Dimu_charge", &self.dimu_charge, n_dimu)?;
                let mass = optional("Dimu_mass", &self.dimu_mass, n_dimu)?;
                let mut dimuons = Vec::with_capacity(n_dimu);
                for i in 0..n_dimu {
                    let candidate = DimuonCandidate {
                        first: leg_index(first[i], n_muon)?,
                        second: leg_index(second[i], n_muon)?,
                        charge_sum: charge[i],
                        mass: mass.map(|m| m[i]),
                    };
                    if candidate.mass.is_none() && !has_kinematics {
                        return Err(missing("Dimu_mass"));
                    }
                    dimuons.push(candidate);
                }
                Some(dimuons)
            }
        };

        Ok(Event {
            run,
            event,
            luminosity_block,
            muons,
            dimuons,
            triggers: self.triggers,
            trigger_values: self.trigger_values,
        })
    }
}

impl TryFrom<EventColumns> for Event {
    type Error = DimuonError;

    fn try_from(columns: EventColumns) -> Result<Self, Self::Error> {
        columns.into_event()
    }
}

/// An ordered collection of [`Event`]s.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    events: Vec<Arc<Event>>,
}

impl Dataset {
    /// Create a [`Dataset`] from a list of shared [`Event`]s.
    pub fn new(events: Vec<Arc<Event>>) -> Self {
        Self { events }
    }

    /// The number of [`Event`]s in the [`Dataset`].
    pub fn n_events(&self) -> usize {
        self.events.len()
    }

    /// Whether the [`Dataset`] holds no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// All events as a slice.
    pub fn events(&self) -> &[Arc<Event>] {
        &self.events
    }

    /// Iterate over the [`Event`]s in storage order.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().map(|event| event.as_ref())
    }

    /// Iterate over the [`Event`]s in parallel.
    #[cfg(feature = "rayon")]
    pub fn par_iter(&self) -> impl IndexedParallelIterator<Item = &Event> {
        self.events.par_iter().map(|event| event.as_ref())
    }

    /// Append an [`Event`].
    pub fn push(&mut self, event: Event) {
        self.events.push(Arc::new(event));
    }
}

impl FromIterator<Event> for Dataset {
    fn from_iter<T: IntoIterator<Item = Event>>(iter: T) -> Self {
        Self {
            events: iter.into_iter().map(Arc::new).collect(),
        }
    }
}

impl Index<usize> for Dataset {
    type Output = Event;

    fn index(&self, index: usize) -> &Self::Output {
        &self.events[index]
    }
}
