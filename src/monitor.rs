//! Event and single-muon control distributions for global muons.
use crate::{
    data::Event,
    histogram::{Binning, HistogramSet},
    utils::enums::MuonId,
    DimuonResult,
};

/// Prefix of all monitor histogram names.
pub const PREFIX: &str = "monitor";

const RUN: &str = "monitor/run";
const EVENT: &str = "monitor/event";
const LUMI: &str = "monitor/luminosity_block";
const MULTIPLICITY: &str = "monitor/global_multiplicity";
const MOMENTUM: &str = "monitor/momentum";
const PT: &str = "monitor/pt";
const ETA: &str = "monitor/eta";
const PHI: &str = "monitor/phi";
const CHI2: &str = "monitor/normalized_chi2";
const VALID_HITS: &str = "monitor/valid_hits";
const PIXEL_HITS: &str = "monitor/pixel_hits";

/// Book all monitor histograms into `histograms`.
pub fn book(histograms: &mut HistogramSet) -> DimuonResult<()> {
    let layout: [(&str, usize, (f64, f64)); 11] = [
        (RUN, 3100, (146_400.0, 149_500.0)),
        (EVENT, 2000, (0.0, 2.0e9)),
        (LUMI, 300, (0.0, 3000.0)),
        (MULTIPLICITY, 8, (0.0, 8.0)),
        (MOMENTUM, 240, (0.0, 120.0)),
        (PT, 240, (0.0, 120.0)),
        (ETA, 140, (-3.5, 3.5)),
        (PHI, 314, (-3.15, 3.15)),
        (CHI2, 200, (0.0, 20.0)),
        (VALID_HITS, 100, (0.0, 100.0)),
        (PIXEL_HITS, 14, (0.0, 14.0)),
    ];
    for (name, bins, range) in layout {
        histograms.book(name, &Binning::uniform(bins, range))?;
    }
    Ok(())
}

/// Fill the event-level histograms once and the muon histograms once per global muon.
pub fn fill(histograms: &mut HistogramSet, event: &Event) -> DimuonResult<()> {
    histograms.fill(RUN, event.run as f64, 1.0)?;
    histograms.fill(EVENT, event.event as f64, 1.0)?;
    histograms.fill(LUMI, event.luminosity_block as f64, 1.0)?;
    let mut n_global = 0usize;
    for muon in event
        .muons
        .iter()
        .filter(|muon| MuonId::Global.is_satisfied_by(muon))
    {
        n_global += 1;
        histograms.fill(MOMENTUM, muon.p4().p(), 1.0)?;
        histograms.fill(PT, muon.pt, 1.0)?;
        histograms.fill(ETA, muon.eta, 1.0)?;
        histograms.fill(PHI, muon.phi, 1.0)?;
        histograms.fill(CHI2, muon.normalized_chi2, 1.0)?;
        histograms.fill(VALID_HITS, muon.combined_valid_hits() as f64, 1.0)?;
        histograms.fill(PIXEL_HITS, muon.pixel_hits as f64, 1.0)?;
    }
    histograms.fill(MULTIPLICITY, n_global as f64, 1.0)
}
