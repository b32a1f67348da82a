use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use harmoniq_mixdown::{
    EffectStage, GainCalibration, GainStaging, Limiter, OfflineRenderer, RenderOptions,
    RenderOutput, SineSource, Track, TrackEffects,
};
use harmoniq_plugin_host::formats::is_hostable;
use harmoniq_plugin_host::{BindingProber, HostConfig, InstanceManager};
use harmoniq_plugin_registry::{
    DescriptorStore, ManifestProber, PluginDescriptor, PluginFormat, PluginProber, ProbeError,
    Registry, ScanConfig,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Scan(args) => execute_scan(args),
        Commands::List(args) => execute_list(args),
        Commands::Inspect(args) => execute_inspect(args),
        Commands::RenderTestTone(args) => execute_render_test_tone(args),
    }
}

#[derive(Parser)]
#[command(author, version, about = "Plugin hosting and offline mixdown tools for Harmoniq Studio")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan plugin folders and cache what was found.
    Scan(ScanArgs),
    /// Print the cached plugin descriptors.
    List(ListArgs),
    /// Load a plugin binary and print what it reports about itself.
    Inspect(InspectArgs),
    /// Render sine tracks through the mixdown pipeline and print the metrics.
    RenderTestTone(RenderTestToneArgs),
}

#[derive(Args)]
struct CacheArgs {
    /// Descriptor cache file; defaults to the per-user configuration folder.
    #[arg(long)]
    cache: Option<PathBuf>,
    /// Print JSON instead of one line per plugin.
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ScanArgs {
    /// Folder to scan; repeat for several. Defaults to the standard locations.
    #[arg(long = "path")]
    paths: Vec<PathBuf>,
    /// Restrict the scan to these formats.
    #[arg(long = "format", value_enum)]
    formats: Vec<FormatArg>,
    /// Read manifest sidecars only and never load plugin code.
    #[arg(long)]
    manifest_only: bool,
    #[command(flatten)]
    cache: CacheArgs,
}

#[derive(Args)]
struct ListArgs {
    #[command(flatten)]
    cache: CacheArgs,
}

#[derive(Args)]
struct InspectArgs {
    /// Plugin binary to load.
    binary: PathBuf,
    /// Host configuration (JSON).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct RenderTestToneArgs {
    /// Number of sine tracks.
    #[arg(long, default_value_t = 1)]
    tracks: usize,
    /// Length of the render in seconds.
    #[arg(long, default_value_t = 1.0)]
    seconds: f64,
    #[arg(long, default_value_t = 48_000.0)]
    sample_rate: f64,
    #[arg(long, default_value_t = 512)]
    block_size: usize,
    /// Peak amplitude of every tone.
    #[arg(long, default_value_t = 1.0)]
    amplitude: f32,
    /// Skip automatic gain staging.
    #[arg(long, conflicts_with = "calibration")]
    unity: bool,
    /// Gain calibration table (JSON) replacing the built-in one.
    #[arg(long)]
    calibration: Option<PathBuf>,
    /// Put a brickwall limiter with this ceiling (dBFS) on the master bus.
    #[arg(long)]
    limit: Option<f32>,
    /// CLAP binary inserted on every track.
    #[arg(long)]
    plugin: Option<PathBuf>,
    /// Also write the mix as a 32-bit float WAV file.
    #[arg(long)]
    wav: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatArg {
    Clap,
    Vst3,
}

impl From<FormatArg> for PluginFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Clap => PluginFormat::Clap,
            FormatArg::Vst3 => PluginFormat::Vst3,
        }
    }
}

/// Probes hostable formats through their binding and everything else from
/// manifest sidecars.
struct CliProber {
    native: Option<BindingProber>,
}

impl PluginProber for CliProber {
    fn probe(&self, format: PluginFormat, path: &Path) -> Result<Vec<PluginDescriptor>, ProbeError> {
        match &self.native {
            Some(native) if is_hostable(format) => native.probe(format, path),
            _ => ManifestProber.probe(format, path),
        }
    }
}

fn open_store(path: Option<PathBuf>) -> Result<DescriptorStore> {
    let path = match path {
        Some(path) => path,
        None => DescriptorStore::default_path().context("no configuration folder for the cache")?,
    };
    DescriptorStore::open(&path)
        .with_context(|| format!("failed to open descriptor cache {}", path.display()))
}

fn print_descriptors(descriptors: &[PluginDescriptor], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(descriptors)?);
        return Ok(());
    }
    if descriptors.is_empty() {
        println!("No plugins found.");
    }
    for descriptor in descriptors {
        let flag = if descriptor.quarantined { " [quarantined]" } else { "" };
        println!(
            "{}  {}  {}{flag}",
            descriptor.id,
            descriptor,
            descriptor.binary_path.display()
        );
    }
    Ok(())
}

fn execute_scan(args: ScanArgs) -> Result<()> {
    let mut config = if args.paths.is_empty() {
        ScanConfig::default()
    } else {
        ScanConfig::with_roots(args.paths)
    };
    if !args.formats.is_empty() {
        config.formats = args.formats.into_iter().map(PluginFormat::from).collect();
    }

    let store = open_store(args.cache.cache)?;
    let registry = Registry::with_store(store);
    let prober = CliProber {
        native: (!args.manifest_only).then(BindingProber::native),
    };
    let report = registry.scan(&config, &prober).context("scan failed")?;

    for (path, err) in &report.errors {
        eprintln!("skipped {} for now: {err}", path.display());
    }
    let quarantined = report.quarantined().count();
    print_descriptors(&report.descriptors, args.cache.json)?;
    if !args.cache.json {
        println!(
            "{} plugins, {quarantined} quarantined, {} deferred",
            report.descriptors.len(),
            report.errors.len()
        );
    }
    Ok(())
}

fn execute_list(args: ListArgs) -> Result<()> {
    let store = open_store(args.cache.cache)?;
    let mut descriptors = store.descriptors();
    descriptors.sort_by(|a, b| a.name.cmp(&b.name));
    print_descriptors(&descriptors, args.cache.json)
}

fn host_config(path: Option<&Path>) -> Result<HostConfig> {
    match path {
        Some(path) => HostConfig::load(path)
            .with_context(|| format!("failed to load host configuration {}", path.display())),
        None => Ok(HostConfig::default()),
    }
}

fn execute_inspect(args: InspectArgs) -> Result<()> {
    let config = host_config(args.config.as_deref())?;
    let manager = InstanceManager::new(Arc::new(Registry::new()), config);
    let instance = manager
        .load_plugin_path(&args.binary)
        .with_context(|| format!("failed to load {}", args.binary.display()))?;

    let descriptor = manager.instance_descriptor(instance)?;
    println!("{descriptor}");
    println!("  id:       {}", descriptor.id);
    println!("  category: {:?}", descriptor.category);
    println!(
        "  audio:    {} in / {} out{}",
        descriptor.audio_inputs,
        descriptor.audio_outputs,
        if descriptor.supports_midi { ", midi" } else { "" }
    );
    println!("  latency:  {} samples", manager.instance_latency(instance)?);
    let count = manager.parameter_count(instance)?;
    println!("  parameters: {count}");
    for index in 0..count {
        let info = manager.parameter_info(instance, index)?;
        let value = manager.parameter_value(instance, index)?;
        println!(
            "    [{index}] {} = {value:.3} {} ({} .. {})",
            info.name, info.unit, info.min, info.max
        );
    }

    manager
        .unload_plugin(instance)
        .context("failed to unload plugin")?;
    Ok(())
}

#[derive(Serialize)]
struct RenderReport<'a> {
    tracks: usize,
    frames: usize,
    sample_rate: f64,
    per_track_gain: f32,
    master_gain: f32,
    metrics: &'a harmoniq_mixdown::RenderMetrics,
    warnings: Vec<String>,
}

fn execute_render_test_tone(args: RenderTestToneArgs) -> Result<()> {
    if args.tracks == 0 {
        bail!("at least one track is required");
    }
    let gain_staging = if args.unity {
        GainStaging::Unity
    } else if let Some(path) = &args.calibration {
        GainStaging::Calibrated(GainCalibration::load(path)?)
    } else {
        GainStaging::default()
    };
    let options = RenderOptions {
        sample_rate: args.sample_rate,
        block_size: args.block_size,
        duration_seconds: args.seconds,
        gain_staging,
        ..RenderOptions::default()
    };

    let manager = args.plugin.as_ref().map(|_| {
        let config = HostConfig::default()
            .with_sample_rate(args.sample_rate)
            .with_max_block_size(args.block_size as u32);
        InstanceManager::new(Arc::new(Registry::new()), config)
    });

    let mut tracks = Vec::with_capacity(args.tracks);
    for index in 0..args.tracks {
        let frequency = 220.0 + 110.0 * index as f64;
        let mut track = Track::new(
            format!("tone-{}", index + 1),
            SineSource::new(frequency, args.amplitude),
        );
        if let (Some(manager), Some(plugin)) = (&manager, &args.plugin) {
            let instance = manager
                .load_plugin_path(plugin)
                .with_context(|| format!("failed to load {}", plugin.display()))?;
            track = track.with_stage(EffectStage::hosted(instance));
        }
        tracks.push(track);
    }
    let mut master = match args.limit {
        Some(ceiling) => TrackEffects::stages([EffectStage::builtin(Limiter::new(ceiling, 80.0))]),
        None => TrackEffects::None,
    };

    let mut renderer = OfflineRenderer::new(options);
    if let Some(manager) = &manager {
        renderer = renderer.with_host(manager);
    }
    let output = renderer.render(&mut tracks, &mut master)?;
    drop(renderer);
    if let Some(manager) = &manager {
        manager.shutdown().context("failed to unload plugins")?;
    }

    if let Some(path) = &args.wav {
        write_wav(path, &output)?;
    }

    let report = RenderReport {
        tracks: args.tracks,
        frames: output.mix.frames(),
        sample_rate: output.mix.sample_rate(),
        per_track_gain: output.gain.per_track,
        master_gain: output.gain.master,
        metrics: &output.metrics,
        warnings: output.warnings.iter().map(ToString::to_string).collect(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn write_wav(path: &Path, output: &RenderOutput) -> Result<()> {
    let spec = hound::WavSpec {
        channels: output.mix.channels() as u16,
        sample_rate: output.mix.sample_rate().round() as u32,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for sample in output.mix.interleaved() {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    tracing::info!("wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_line_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn render_test_tone_arguments_parse() {
        let cli = Cli::try_parse_from([
            "harmoniq-mixdown",
            "render-test-tone",
            "--tracks",
            "3",
            "--seconds",
            "2.5",
            "--unity",
        ])
        .unwrap();
        let Commands::RenderTestTone(args) = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(args.tracks, 3);
        assert_eq!(args.seconds, 2.5);
        assert_eq!(args.sample_rate, 48_000.0);
        assert!(args.unity);
    }

    #[test]
    fn unity_and_calibration_conflict() {
        let parsed = Cli::try_parse_from([
            "harmoniq-mixdown",
            "render-test-tone",
            "--unity",
            "--calibration",
            "tiers.json",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn scan_accepts_repeated_paths_and_formats() {
        let cli = Cli::try_parse_from([
            "harmoniq-mixdown",
            "scan",
            "--path",
            "/a",
            "--path",
            "/b",
            "--format",
            "clap",
            "--manifest-only",
        ])
        .unwrap();
        let Commands::Scan(args) = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(args.paths, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert!(matches!(args.formats.as_slice(), [FormatArg::Clap]));
        assert!(args.manifest_only);
    }
}
