use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use harmoniq_mixdown::host::formats::fake::{FakeBinding, FakeDsp, FakePlugin};
use harmoniq_mixdown::host::registry::Registry;
use harmoniq_mixdown::host::{
    AudioBuffer, HostConfig, HostDiagnostic, HostError, InstanceId, InstanceManager, PluginBinding, PluginState,
};
use harmoniq_mixdown::{
    render_offline, BuiltinStage, CancelToken, EffectStage, GainStaging, Limiter, OfflineRenderer,
    RenderError, RenderMetrics, RenderOptions, SineSource, Track, TrackEffects, WarningKind,
};
use pretty_assertions::assert_eq;

fn host() -> (InstanceManager, Arc<FakeBinding>) {
    let binding = Arc::new(FakeBinding::new());
    let manager = InstanceManager::empty(Arc::new(Registry::new()), HostConfig::default())
        .with_binding(binding.clone());
    (manager, binding)
}

fn load(manager: &InstanceManager, binding: &FakeBinding, id: &str, plugin: FakePlugin) -> InstanceId {
    let descriptor = binding.install(format!("/fake/{id}.clap"), plugin);
    manager.load_plugin(&descriptor).expect("load")
}

fn unity(seconds: f64) -> RenderOptions {
    RenderOptions::default()
        .with_duration(seconds)
        .with_gain_staging(GainStaging::Unity)
}

fn sine_track(id: &str, frequency: f64, amplitude: f32) -> Track {
    Track::new(id, SineSource::new(frequency, amplitude))
}

#[test]
fn single_full_scale_sine_lands_near_minus_22() {
    let mut tracks = vec![sine_track("lead", 1_000.0, 1.0)];
    let options = RenderOptions::default().with_duration(1.0);
    let output = render_offline(&mut tracks, &options).expect("render");

    assert!((output.gain.per_track - 0.159).abs() < 1e-3);
    assert_eq!(output.gain.master, 0.5);
    let rms = output.metrics.rms_db;
    assert!((-24.0..=-20.0).contains(&rms), "rms {rms}");
    assert!(!output.metrics.clipped);
    assert!(!output.metrics.empty);
    assert_eq!(output.metrics.dropout_count, 0);
    assert_eq!(output.mix.frames(), 48_000);
}

#[test]
fn three_equal_tracks_land_near_minus_16() {
    let mut tracks = vec![
        sine_track("a", 1_000.0, 1.0),
        sine_track("b", 1_250.0, 1.0),
        sine_track("c", 1_500.0, 1.0),
    ];
    let options = RenderOptions::default().with_duration(1.0);
    let output = render_offline(&mut tracks, &options).expect("render");

    assert!((output.gain.per_track - 0.114).abs() < 1e-3);
    let rms = output.metrics.rms_db;
    assert!((-18.0..=-14.0).contains(&rms), "rms {rms}");
    let lufs = output.metrics.lufs_integrated.expect("gated loudness");
    assert!(lufs < 0.0 && lufs > -40.0, "lufs {lufs}");
}

#[test]
fn independent_tracks_sum_in_power() {
    let per_track_db = -20.0f32;
    for count in [1usize, 2, 3, 5] {
        let mut tracks: Vec<Track> = (0..count)
            .map(|i| sine_track(&format!("t{i}"), 220.0 + 110.0 * i as f64, 0.1))
            .collect();
        let output = render_offline(&mut tracks, &unity(1.0)).expect("render");
        let expected = per_track_db + 10.0 * (count as f32).log10();
        let rms = output.metrics.rms_db;
        assert!((rms - expected).abs() <= 1.0, "{count} tracks: rms {rms}, expected {expected}");
    }
}

#[test]
fn nothing_active_renders_silence() {
    let mut tracks = vec![
        sine_track("a", 440.0, 0.5).muted(true),
        sine_track("b", 660.0, 0.5).muted(true),
    ];
    let output = render_offline(&mut tracks, &unity(0.5)).expect("render");
    assert_eq!(output.metrics, RenderMetrics::empty());
    assert!(output.metrics.empty);
    assert_eq!(output.mix.frames(), 24_000);
    assert_eq!(output.mix.channels(), 2);
    assert!(output.mix.samples().iter().all(|sample| *sample == 0.0));
    assert!(output.warnings.is_empty());

    let output = render_offline(&mut [], &unity(0.25)).expect("render");
    assert!(output.metrics.empty);
    assert_eq!(output.mix.frames(), 12_000);
}

#[test]
fn solo_selects_the_active_set() {
    let mut soloed = vec![
        sine_track("a", 440.0, 0.5).soloed(true),
        sine_track("b", 660.0, 0.5),
    ];
    let mut alone = vec![sine_track("a", 440.0, 0.5)];
    let soloed = render_offline(&mut soloed, &unity(0.2)).expect("render");
    let alone = render_offline(&mut alone, &unity(0.2)).expect("render");
    assert_eq!(soloed.mix, alone.mix);
}

#[test]
fn hosted_nan_stage_is_isolated_and_the_dry_signal_survives() {
    let (manager, binding) = host();
    let poisoned = load(
        &manager,
        &binding,
        "nan",
        FakePlugin::new("fake.nan", FakeDsp::NanAfter { blocks: 10 }),
    );
    let diagnostics = manager.diagnostics();

    let mut tracks = vec![sine_track("vox", 500.0, 0.5)
        .with_stage(EffectStage::hosted(poisoned))];
    let renderer = OfflineRenderer::new(unity(0.5)).with_host(&manager);
    let output = renderer
        .render(&mut tracks, &mut TrackEffects::None)
        .expect("render survives");

    let mut dry = vec![sine_track("vox", 500.0, 0.5)];
    let dry = render_offline(&mut dry, &unity(0.5)).expect("render");
    assert_eq!(output.mix, dry.mix);
    assert_eq!(output.metrics.rms_db, dry.metrics.rms_db);

    let kinds: Vec<_> = output.warnings.iter().map(|w| w.kind.clone()).collect();
    assert_eq!(
        kinds,
        vec![
            WarningKind::NonFinite,
            WarningKind::InstanceDegraded { instance: poisoned }
        ]
    );
    assert_eq!(output.warnings[0].block, Some(10));
    assert!(manager.is_degraded(poisoned).expect("instance"));
    assert!(diagnostics
        .try_iter()
        .any(|d| d == HostDiagnostic::Degraded { instance: poisoned }));
    assert_eq!(manager.instance_state(poisoned).expect("state"), PluginState::Active);
}

#[test]
fn truncated_output_is_treated_as_an_anomaly() {
    let (manager, binding) = host();
    let short = load(&manager, &binding, "short", FakePlugin::new("fake.short", FakeDsp::Truncate));
    let mut tracks = vec![sine_track("a", 300.0, 0.5).with_stage(EffectStage::hosted(short))];
    let output = OfflineRenderer::new(unity(0.1))
        .with_host(&manager)
        .render(&mut tracks, &mut TrackEffects::None)
        .expect("render");
    assert_eq!(
        output.warnings[0].kind,
        WarningKind::FrameMismatch {
            expected: 512,
            actual: 511
        }
    );
    assert_eq!(output.warnings[0].block, Some(0));
}

#[test]
fn reordering_a_chain_changes_the_output_but_not_its_latency() {
    let (manager, binding) = host();
    let gain = load(
        &manager,
        &binding,
        "gain",
        FakePlugin::new("fake.gain", FakeDsp::Gain).with_latency(32),
    );
    let clip = load(
        &manager,
        &binding,
        "clip",
        FakePlugin::new("fake.clip", FakeDsp::SoftClip).with_latency(64),
    );
    manager.set_parameter_value(gain, 0, 2.0).expect("gain");
    let chain = manager.create_chain("drive");
    manager.add_to_chain(chain, gain, None).expect("add");
    manager.add_to_chain(chain, clip, None).expect("add");

    let mut tracks = vec![sine_track("gtr", 330.0, 0.4).with_effects(TrackEffects::Chain(chain))];
    let renderer = OfflineRenderer::new(unity(0.2)).with_host(&manager);

    let first = renderer.render(&mut tracks, &mut TrackEffects::None).expect("render");
    let again = renderer.render(&mut tracks, &mut TrackEffects::None).expect("render");
    assert_eq!(first.mix, again.mix);
    assert_eq!(manager.get_chain_latency(chain).expect("latency"), 96);

    manager.reorder_chain(chain, &[clip, gain]).expect("reorder");
    let swapped = renderer.render(&mut tracks, &mut TrackEffects::None).expect("render");
    assert_ne!(first.mix, swapped.mix);
    assert!(swapped.metrics.peak_db > first.metrics.peak_db);
    assert_eq!(manager.get_chain_latency(chain).expect("latency"), 96);
}

struct CancelAfter {
    token: CancelToken,
    blocks: usize,
    calls: usize,
}

impl BuiltinStage for CancelAfter {
    fn name(&self) -> &str {
        "cancel-after"
    }

    fn prepare(&mut self, _sample_rate: f64, _max_block: usize, _channels: usize) {}

    fn reset(&mut self) {
        self.calls = 0;
    }

    fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) {
        output.copy_from(input);
        self.calls += 1;
        if self.calls == self.blocks {
            self.token.cancel();
        }
    }
}

#[test]
fn cancellation_stops_between_blocks_and_keeps_instances_reusable() {
    let (manager, binding) = host();
    let gain = load(&manager, &binding, "gain", FakePlugin::new("fake.gain", FakeDsp::Gain));
    let token = CancelToken::new();
    let mut tracks = vec![sine_track("a", 440.0, 0.5)
        .with_stage(EffectStage::builtin(CancelAfter {
            token: token.clone(),
            blocks: 4,
            calls: 0,
        }))
        .with_stage(EffectStage::hosted(gain))];

    let renderer = OfflineRenderer::new(unity(2.0))
        .with_host(&manager)
        .with_cancel_token(token.clone());
    let err = renderer
        .render(&mut tracks, &mut TrackEffects::None)
        .expect_err("cancelled");
    match err {
        RenderError::Cancelled {
            frames_rendered,
            metrics,
        } => {
            assert_eq!(frames_rendered, 4 * 512);
            assert!(!metrics.empty);
            assert!(metrics.rms_db > -30.0);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(manager.instance_state(gain).expect("state"), PluginState::Active);
    assert_eq!(manager.outstanding_handles(), 1);
    let lease = manager.acquire_render_lease(gain).expect("lease released");
    drop(lease);
}

#[test]
fn a_refused_sample_rate_bypasses_the_stage() {
    let (manager, binding) = host();
    let gain = load(
        &manager,
        &binding,
        "gain",
        FakePlugin::new("fake.gain", FakeDsp::Gain).with_sample_rates([48_000.0]),
    );
    manager.set_parameter_value(gain, 0, 0.5).expect("gain");

    let options = unity(0.2).with_sample_rate(44_100.0);
    let mut tracks = vec![sine_track("a", 440.0, 0.5).with_stage(EffectStage::hosted(gain))];
    let output = OfflineRenderer::new(options.clone())
        .with_host(&manager)
        .render(&mut tracks, &mut TrackEffects::None)
        .expect("render");

    assert_eq!(
        output.warnings[0].kind,
        WarningKind::SampleRateUnsupported {
            active: 48_000.0,
            requested: 44_100.0
        }
    );
    assert_eq!(output.warnings[0].block, None);
    let dry = render_offline(&mut [sine_track("a", 440.0, 0.5)], &options).expect("render");
    assert_eq!(output.mix, dry.mix);
    assert_eq!(manager.outstanding_handles(), 1);
}

#[test]
fn another_sample_rate_runs_when_the_plugin_accepts_it() {
    let (manager, binding) = host();
    let gain = load(
        &manager,
        &binding,
        "gain",
        FakePlugin::new("fake.gain", FakeDsp::Gain).with_sample_rates([44_100.0, 48_000.0]),
    );
    manager.set_parameter_value(gain, 0, 0.5).expect("gain");

    let options = unity(0.2).with_sample_rate(44_100.0);
    let mut tracks = vec![sine_track("a", 440.0, 0.5).with_stage(EffectStage::hosted(gain))];
    let output = OfflineRenderer::new(options.clone())
        .with_host(&manager)
        .render(&mut tracks, &mut TrackEffects::None)
        .expect("render");

    assert!(output.warnings.is_empty(), "{:?}", output.warnings);
    let dry = render_offline(&mut [sine_track("a", 440.0, 0.5)], &options).expect("render");
    let halved: Vec<f32> = dry.mix.samples().iter().map(|sample| sample * 0.5).collect();
    assert_eq!(output.mix.samples(), halved.as_slice());
    assert_eq!(output.mix.sample_rate(), 44_100.0);
    assert_eq!(manager.outstanding_handles(), 1);
    assert_eq!(manager.instance_state(gain).expect("state"), PluginState::Active);
}

#[test]
fn a_leased_instance_cannot_join_a_second_render() {
    let (manager, binding) = host();
    let gain = load(&manager, &binding, "gain", FakePlugin::new("fake.gain", FakeDsp::Gain));
    let _held = manager.acquire_render_lease(gain).expect("lease");

    let mut tracks = vec![sine_track("a", 440.0, 0.5).with_stage(EffectStage::hosted(gain))];
    let err = OfflineRenderer::new(unity(0.1))
        .with_host(&manager)
        .render(&mut tracks, &mut TrackEffects::None)
        .expect_err("busy");
    assert!(matches!(err, RenderError::Host(HostError::Busy(id)) if id == gain));

    // A duplicate gives the second render its own state.
    let copy = manager.duplicate_instance(gain).expect("duplicate");
    let mut tracks = vec![sine_track("a", 440.0, 0.5).with_stage(EffectStage::hosted(copy))];
    OfflineRenderer::new(unity(0.1))
        .with_host(&manager)
        .render(&mut tracks, &mut TrackEffects::None)
        .expect("isolated render");
}

#[test]
fn hosted_tracks_need_a_host() {
    let mut tracks = vec![sine_track("a", 440.0, 0.5)
        .with_stage(EffectStage::hosted(InstanceId::from_raw(1)))];
    let err = render_offline(&mut tracks, &unity(0.1)).expect_err("no host");
    assert!(matches!(err, RenderError::NoHost { ref track } if track == "a"));
}

#[test]
fn master_limiter_holds_the_ceiling() {
    let mut tracks: Vec<Track> = (0..4)
        .map(|i| sine_track(&format!("t{i}"), 100.0 * (i + 1) as f64, 0.6))
        .collect();
    let mut master = TrackEffects::stages([EffectStage::builtin(Limiter::new(-1.0, 50.0))]);
    let output = OfflineRenderer::new(unity(0.5))
        .render(&mut tracks, &mut master)
        .expect("render");
    assert!(output.metrics.peak_db <= -0.99, "peak {}", output.metrics.peak_db);
    assert!(!output.metrics.clipped);
}

#[test]
fn renders_leave_no_native_handles_behind() {
    let (manager, binding) = host();
    let gain = load(&manager, &binding, "gain", FakePlugin::new("fake.gain", FakeDsp::Gain));
    let clip = load(&manager, &binding, "clip", FakePlugin::new("fake.clip", FakeDsp::SoftClip));
    let mut tracks = vec![
        sine_track("a", 440.0, 0.5).with_stage(EffectStage::hosted(gain)),
        sine_track("b", 550.0, 0.5),
    ];
    let mut master = TrackEffects::stages([EffectStage::hosted(clip)]);
    OfflineRenderer::new(RenderOptions::default().with_duration(0.2))
        .with_host(&manager)
        .render(&mut tracks, &mut master)
        .expect("render");

    assert_eq!(manager.outstanding_handles(), 2);
    manager.shutdown().expect("shutdown");
    assert_eq!(manager.outstanding_handles(), 0);
    assert_eq!(binding.outstanding_handles(), 0);
}

#[test]
fn control_queries_during_a_render_do_not_change_the_mix() {
    let (manager, binding) = host();
    let gain = load(&manager, &binding, "gain", FakePlugin::new("fake.gain", FakeDsp::Gain));
    let clip = load(&manager, &binding, "clip", FakePlugin::new("fake.clip", FakeDsp::SoftClip));
    manager.set_parameter_value(gain, 0, 1.5).expect("gain");
    let chain = manager.create_chain("bus");
    manager.add_to_chain(chain, gain, None).expect("add");
    let manager = Arc::new(manager);

    let mut tracks = vec![
        sine_track("a", 440.0, 0.5).with_effects(TrackEffects::Chain(chain)),
        sine_track("b", 660.0, 0.5),
    ];
    let mut master = TrackEffects::stages([EffectStage::hosted(clip)]);
    let renderer = OfflineRenderer::new(unity(1.0)).with_host(&manager);
    let quiet = renderer.render(&mut tracks, &mut master).expect("quiet render");

    let stop = Arc::new(AtomicBool::new(false));
    let querier = {
        let manager = Arc::clone(&manager);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut queries = 0u64;
            while !stop.load(Ordering::Relaxed) {
                for id in [gain, clip] {
                    manager.instance_state(id).expect("state");
                    manager.instance_latency(id).expect("latency");
                    manager.parameter_value(id, 0).expect("value");
                }
                manager.get_stats();
                manager.refresh_chain_metrics(chain).expect("chain");
                queries += 1;
            }
            queries
        })
    };
    let busy = renderer.render(&mut tracks, &mut master).expect("busy render");
    stop.store(true, Ordering::Relaxed);
    assert!(querier.join().expect("querier") > 0);

    assert!(busy.warnings.is_empty(), "{:?}", busy.warnings);
    assert_eq!(busy.mix, quiet.mix);
    assert_eq!(busy.metrics, quiet.metrics);
    assert!(!manager.is_degraded(gain).expect("gain") && !manager.is_degraded(clip).expect("clip"));
}

struct CancelAt {
    token: CancelToken,
    block: usize,
    calls: usize,
    block_times: Arc<Mutex<Vec<Instant>>>,
}

impl BuiltinStage for CancelAt {
    fn name(&self) -> &str {
        "cancel-at"
    }

    fn prepare(&mut self, _sample_rate: f64, _max_block: usize, _channels: usize) {}

    fn reset(&mut self) {
        self.calls = 0;
    }

    fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) {
        output.copy_from(input);
        self.calls += 1;
        self.block_times.lock().expect("times").push(Instant::now());
        if self.calls == self.block {
            self.token.cancel();
        }
    }
}

#[test]
fn a_late_cancel_returns_within_a_few_blocks() {
    let (manager, binding) = host();
    let gain = load(&manager, &binding, "gain", FakePlugin::new("fake.gain", FakeDsp::Gain));
    let token = CancelToken::new();
    let block_times = Arc::new(Mutex::new(Vec::new()));
    let options = unity(120.0).with_block_size(4_800);
    let blocks = 1_200;
    let mut tracks = vec![sine_track("a", 440.0, 0.5)
        .with_stage(EffectStage::builtin(CancelAt {
            token: token.clone(),
            block: blocks - 10,
            calls: 0,
            block_times: Arc::clone(&block_times),
        }))
        .with_stage(EffectStage::hosted(gain))];

    let renderer = OfflineRenderer::new(options)
        .with_host(&manager)
        .with_cancel_token(token);
    let err = renderer
        .render(&mut tracks, &mut TrackEffects::None)
        .expect_err("cancelled");
    let returned = Instant::now();

    let times = block_times.lock().expect("times");
    let (first, cancelled) = (times[0], times[times.len() - 1]);
    let per_block = (cancelled - first) / (times.len() as u32 - 1);
    let latency = returned - cancelled;
    let bound = (per_block * 25).max(Duration::from_millis(20));
    assert!(latency <= bound, "cancel took {latency:?}, bound {bound:?}");

    match err {
        RenderError::Cancelled {
            frames_rendered,
            metrics,
        } => {
            assert_eq!(frames_rendered, (blocks - 10) * 4_800);
            assert!(metrics.lufs_integrated.is_some());
            assert!(metrics.rms_db > -30.0);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(manager.instance_state(gain).expect("state"), PluginState::Active);
}

#[test]
fn chain_latency_is_current_after_a_render() {
    let (manager, binding) = host();
    let look = load(
        &manager,
        &binding,
        "lookahead",
        FakePlugin::new("fake.lookahead", FakeDsp::Lookahead { max: 512 }),
    );
    let delay = load(
        &manager,
        &binding,
        "delay",
        FakePlugin::new("fake.delay", FakeDsp::Delay { samples: 8 }),
    );
    let chain = manager.create_chain("lookahead");
    manager.add_to_chain(chain, look, None).expect("add");
    manager.add_to_chain(chain, delay, None).expect("add");
    assert_eq!(manager.get_chain_latency(chain).expect("latency"), 8);

    manager.set_parameter_value(look, 0, 64.0).expect("lookahead");
    let mut tracks = vec![sine_track("a", 440.0, 0.5).with_effects(TrackEffects::Chain(chain))];
    OfflineRenderer::new(unity(0.1))
        .with_host(&manager)
        .render(&mut tracks, &mut TrackEffects::None)
        .expect("render");

    let expected = manager.instance_latency(look).expect("look")
        + manager.instance_latency(delay).expect("delay");
    assert_eq!(expected, 72);
    assert_eq!(manager.get_chain_latency(chain).expect("latency"), expected);
}

/// Writes a parameter from inside the render, the way an automation lane
/// running on another thread would land between two blocks.
struct WriteAt {
    manager: Arc<InstanceManager>,
    instance: InstanceId,
    value: f64,
    call: usize,
    calls: usize,
}

impl BuiltinStage for WriteAt {
    fn name(&self) -> &str {
        "write-at"
    }

    fn prepare(&mut self, _sample_rate: f64, _max_block: usize, _channels: usize) {}

    fn reset(&mut self) {
        self.calls = 0;
    }

    fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) {
        output.copy_from(input);
        self.calls += 1;
        if self.calls == self.call {
            self.manager
                .set_parameter_value(self.instance, 0, self.value)
                .expect("write");
        }
    }
}

#[test]
fn a_parameter_write_mid_render_lands_on_a_block_boundary() {
    let (manager, binding) = host();
    let gain = load(&manager, &binding, "gain", FakePlugin::new("fake.gain", FakeDsp::Gain));
    let manager = Arc::new(manager);
    let mut tracks = vec![sine_track("a", 440.0, 0.5)
        .with_stage(EffectStage::builtin(WriteAt {
            manager: Arc::clone(&manager),
            instance: gain,
            value: 0.5,
            call: 4,
            calls: 0,
        }))
        .with_stage(EffectStage::hosted(gain))];
    let options = unity(0.1);
    let output = OfflineRenderer::new(options.clone())
        .with_host(&manager)
        .render(&mut tracks, &mut TrackEffects::None)
        .expect("render");
    assert!(output.warnings.is_empty(), "{:?}", output.warnings);

    // Written while block 3 was in flight, applied when the plugin starts it.
    let boundary = 3 * options.block_size;
    let dry = render_offline(&mut [sine_track("a", 440.0, 0.5)], &options).expect("render");
    for channel in 0..output.mix.channels() {
        let (wet, dry) = (output.mix.channel(channel), dry.mix.channel(channel));
        assert_eq!(&wet[..boundary], &dry[..boundary]);
        let halved: Vec<f32> = dry[boundary..].iter().map(|sample| sample * 0.5).collect();
        assert_eq!(&wet[boundary..], halved.as_slice());
    }
    assert_eq!(manager.parameter_value(gain, 0).expect("value"), 0.5);
}
