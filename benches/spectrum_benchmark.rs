use std::{f64::consts::PI, time::Duration};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dimuon::prelude::*;

const TIERS: [(&str, u64); 2] = [("small", 1_000), ("large", 50_000)];
const TRIGGERS: [&str; 4] = [
    "HLT_DoubleMu3_Quarkonium",
    "HLT_Dimuon0_Jpsi",
    "HLT_Dimuon0_Upsilon",
    "HLT_Dimuon7_LowMass_Displaced",
];

fn synthetic_dataset(n_events: u64) -> Dataset {
    let mut rng = fastrand::Rng::with_seed(0);
    (0..n_events)
        .map(|number| {
            let muons = (0..rng.usize(0..5))
                .map(|_| Muon {
                    pt: 0.5 + rng.f64() * 30.0,
                    eta: rng.f64() * 4.8 - 2.4,
                    phi: (rng.f64() * 2.0 - 1.0) * PI,
                    mass: 0.10566,
                    charge: if rng.bool() { 1 } else { -1 },
                    is_global: true,
                    is_tracker: true,
                    valid_hits: 15,
                    valid_muon_hits: 5,
                    pixel_hits: 3,
                    normalized_chi2: rng.f64() * 5.0,
                    medium_id: rng.f64() < 0.9,
                })
                .collect();
            let mut event = Event::new(165_000, number, 1, muons)
                .with_trigger_value("Trig_DoubleMuThresh", if rng.bool() { 13.0 } else { 0.0 });
            for trigger in TRIGGERS {
                event = event.with_trigger(trigger, rng.bool());
            }
            event
        })
        .collect()
}

fn mass_benchmark(c: &mut Criterion) {
    c.bench_function("mass_of_pair", |b| {
        b.iter(|| {
            black_box(mass_of_pair(
                black_box(10.0),
                0.1,
                0.0,
                0.105,
                black_box(12.0),
                -0.2,
                1.5,
                0.105,
            ))
        })
    });
}

fn histogram_benchmark(c: &mut Criterion) {
    let mut histogram =
        Histogram::new("log_mass", &Binning::log_mass_default()).expect("valid binning");
    let mut rng = fastrand::Rng::with_seed(1);
    c.bench_function("fill_log_mass", |b| {
        b.iter(|| histogram.fill_mass(black_box(0.3 + rng.f64() * 100.0)))
    });
}

fn spectrum_benchmark(c: &mut Criterion) {
    let analysis = Analysis::new(AnalysisConfig::default()).expect("default configuration");
    let mut group = c.benchmark_group("spectrum");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(5));
    for (tier, n_events) in TIERS {
        let dataset = synthetic_dataset(n_events);
        group.bench_with_input(BenchmarkId::new("sequential", tier), &dataset, |b, dataset| {
            b.iter(|| black_box(analysis.run_sequential(dataset).expect("run")))
        });
        #[cfg(feature = "rayon")]
        group.bench_with_input(BenchmarkId::new("parallel", tier), &dataset, |b, dataset| {
            b.iter(|| black_box(analysis.run_parallel(dataset).expect("run")))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    mass_benchmark,
    histogram_benchmark,
    spectrum_benchmark
);
criterion_main!(benches);
