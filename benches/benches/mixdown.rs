use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use harmoniq_mixdown::{
    EffectStage, GainStaging, Limiter, OfflineRenderer, OnePoleLowpass, RenderOptions, SineSource,
    SoftClip, Track, TrackEffects,
};
use harmoniq_plugin_host::formats::fake::{FakeBinding, FakeDsp, FakePlugin};
use harmoniq_plugin_host::registry::Registry;
use harmoniq_plugin_host::{HostConfig, InstanceManager};

fn options(parallel: bool) -> RenderOptions {
    RenderOptions {
        sample_rate: 96_000.0,
        block_size: 64,
        duration_seconds: 1.0,
        gain_staging: GainStaging::default(),
        parallel,
        ..RenderOptions::default()
    }
}

fn builtin_tracks(count: usize) -> Vec<Track> {
    (0..count)
        .map(|track| {
            Track::new(
                format!("t{track}"),
                SineSource::new(110.0 + track as f64, 0.5),
            )
            .with_stage(EffectStage::builtin(OnePoleLowpass::new(4_000.0)))
            .with_stage(EffectStage::builtin(SoftClip::new(1.5)))
        })
        .collect()
}

fn render_48_tracks(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixdown");
    group.measurement_time(Duration::from_secs(15));
    group.sample_size(20);

    for (label, parallel) in [("48_tracks_96k_block64", true), ("48_tracks_serial", false)] {
        group.bench_function(label, |b| {
            let mut tracks = builtin_tracks(48);
            let mut master =
                TrackEffects::stages([EffectStage::builtin(Limiter::default())]);
            let renderer = OfflineRenderer::new(options(parallel));
            b.iter(|| {
                renderer
                    .render(&mut tracks, &mut master)
                    .expect("render")
            });
        });
    }

    group.bench_function("16_hosted_tracks", |b| {
        let binding = Arc::new(FakeBinding::new());
        let config = HostConfig::default()
            .with_sample_rate(96_000.0)
            .with_max_block_size(64);
        let manager =
            InstanceManager::empty(Arc::new(Registry::new()), config).with_binding(binding.clone());
        let descriptor = binding.install(
            "/bench/gain.clap",
            FakePlugin::new("bench.gain", FakeDsp::Gain),
        );
        let mut tracks: Vec<Track> = (0..16)
            .map(|track| {
                let instance = manager.load_plugin(&descriptor).expect("load");
                Track::new(
                    format!("t{track}"),
                    SineSource::new(110.0 + track as f64, 0.5),
                )
                .with_stage(EffectStage::hosted(instance))
            })
            .collect();
        let renderer = OfflineRenderer::new(options(true)).with_host(&manager);
        b.iter(|| {
            renderer
                .render(&mut tracks, &mut TrackEffects::None)
                .expect("render")
        });
    });

    group.finish();
}

criterion_group!(benches, render_48_tracks);
criterion_main!(benches);
