//! `apipe`: drives the audio pipeline from the command line.
//!
//! Every input file becomes one Track running a linear stage chain:
//! source and decoder picked by extension, then format and rate conversion,
//! the optional filters, and a sink chosen by the subcommand.
//!
//! ## Modes
//! - `play`: decode and play through an output device.
//! - `convert`: write a WAV file in the requested format. `-` as input reads
//!   a WAV stream from stdin; `-` as output writes raw PCM to stdout.
//! - `info`: print format, length and tags without decoding audio.
//! - `peaks`: measure per-channel levels.
//! - `devices`: list output devices.

mod cli;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use audio_pipeline::filter::{PeaksFactory, PeaksHandle};
use audio_pipeline::{
    ErrorKind, PipelineConfig, PipelineError, Position, Registry, STDIO_PATH, Scheduler,
    StopHandle, Track, input_stages,
};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// The Track currently running, for the Ctrl-C handler.
type ActiveTrack = Arc<Mutex<Option<StopHandle>>>;

struct Runner {
    registry: Registry,
    cfg: PipelineConfig,
    seek: Option<Duration>,
    active: ActiveTrack,
    interrupted: Arc<AtomicBool>,
    next_id: u64,
}

impl Runner {
    /// Stage names for `input`, ending in `sink`.
    fn chain(&self, input: &Path, sink: &str) -> Vec<String> {
        let mut names: Vec<String> = input_stages(input).iter().map(|s| s.to_string()).collect();
        names.push("convert.format".into());
        names.push("convert.resample".into());
        if self.cfg.filters.gain_db != 0.0 {
            names.push("filter.gain".into());
        }
        if self.cfg.filters.until.is_some() {
            names.push("filter.until".into());
        }
        names.push(sink.into());
        names
    }

    fn run(&mut self, mut track: Track, names: &[String]) -> Result<Track, PipelineError> {
        if let Some(at) = self.seek {
            track.seek_request = Some(Position::Time(at));
        }
        let stages = self.registry.chain(names)?;
        let mut sched = Scheduler::new(track, stages)?;
        tracing::debug!(stages = ?sched.stage_names(), "chain");

        *lock(&self.active) = Some(sched.stop_handle());
        let result = sched.run_blocking();
        *lock(&self.active) = None;
        result?;

        let mut done = Track::new(sched.track().id());
        std::mem::swap(&mut done, sched.track_mut());
        Ok(done)
    }

    fn new_track(&mut self, input: &Path) -> Track {
        self.next_id += 1;
        Track::new(self.next_id).with_input(input)
    }

    /// Run `per_file` over `files`, skipping the ones that do not exist.
    fn batch(
        &mut self,
        files: &[std::path::PathBuf],
        mut per_file: impl FnMut(&mut Self, &Path) -> Result<(), PipelineError>,
    ) -> Result<()> {
        for path in files {
            match per_file(self, path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::SourceAbsent => {
                    tracing::warn!(path = %path.display(), "skipping: {e}");
                }
                Err(e) => return Err(e).with_context(|| format!("processing {}", path.display())),
            }
            if self.interrupted.load(Ordering::SeqCst) {
                break;
            }
        }
        Ok(())
    }
}

fn lock(active: &ActiveTrack) -> MutexGuard<'_, Option<StopHandle>> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

fn main() -> Result<()> {
    let args = cli::Args::parse();
    let fallback = if args.verbose {
        "debug,audio_pipeline=debug,apipe=debug"
    } else {
        "info,audio_pipeline=info,apipe=info"
    };
    // Logs go to stderr so stdout can carry audio.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .init();

    if let cli::Command::Devices = args.cmd {
        return list_devices();
    }

    let cfg = args.pipeline_config()?;
    let active: ActiveTrack = Arc::new(Mutex::new(None));
    let interrupted = Arc::new(AtomicBool::new(false));
    let for_signal = active.clone();
    let flag = interrupted.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
        match lock(&for_signal).as_ref() {
            Some(handle) => handle.stop(),
            None => std::process::exit(130),
        }
    }) {
        tracing::warn!("ctrl-c handler not installed: {e}");
    }

    let mut runner = Runner {
        registry: Registry::with_builtins(&cfg),
        cfg,
        seek: args.seek_position()?,
        active,
        interrupted,
        next_id: 0,
    };

    match &args.cmd {
        cli::Command::Play { files, .. } => runner.batch(files, |r, path| {
            let names = r.chain(path, "out.device");
            let track = r.new_track(path);
            let track = r.run(track, &names)?;
            tracing::info!(
                path = %path.display(),
                frames = track.current_position,
                "finished"
            );
            Ok(())
        })?,
        cli::Command::Convert { input, output, .. } => {
            let to_stdout = output.as_path() == Path::new(STDIO_PATH);
            let sink = if to_stdout { "out.stdout" } else { "out.wav" };
            let names = runner.chain(input, sink);
            let mut track = runner.new_track(input);
            if !to_stdout {
                track = track.with_output(output);
            }
            let track = runner
                .run(track, &names)
                .with_context(|| format!("convert {}", input.display()))?;
            tracing::info!(
                output = %output.display(),
                frames = track.current_position,
                "converted"
            );
        }
        cli::Command::Info { files } => runner.batch(files, |r, path| {
            let tags: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
            let sink = tags.clone();
            let mut track = r.new_track(path).with_meta_sink(move |k: &str, v: &str| {
                sink.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((k.to_string(), v.to_string()));
            });
            track.info_only = true;
            let names: Vec<String> = input_stages(path)
                .iter()
                .map(|s| s.to_string())
                .chain(["out.null".to_string()])
                .collect();
            let track = r.run(track, &names)?;
            print_info(path, &track, &tags.lock().unwrap_or_else(PoisonError::into_inner));
            Ok(())
        })?,
        cli::Command::Peaks { files } => runner.batch(files, |r, path| {
            let handle = PeaksHandle::new();
            r.registry
                .register(Arc::new(PeaksFactory::with_handle(handle.clone())))?;
            let mut names = r.chain(path, "out.null");
            let sink = names.len() - 1;
            names.insert(sink, "filter.peaks".into());
            let track = r.new_track(path);
            r.run(track, &names)?;
            print_peaks(path, &handle);
            Ok(())
        })?,
        cli::Command::Devices => {}
    }

    Ok(())
}

fn list_devices() -> Result<()> {
    let devices = audio_pipeline::sink::list_devices().context("enumerate output devices")?;
    for (i, d) in devices.iter().enumerate() {
        let mark = if d.is_default { " (default)" } else { "" };
        if d.min_rate == d.max_rate {
            println!("#{i}: {}{mark} [{} Hz]", d.name, d.min_rate);
        } else {
            println!("#{i}: {}{mark} [{}-{} Hz]", d.name, d.min_rate, d.max_rate);
        }
    }
    Ok(())
}

fn print_info(path: &Path, track: &Track, tags: &[(String, String)]) {
    println!("{}", path.display());
    if let Some(codec) = &track.codec {
        println!("  codec:    {codec}");
    }
    if let Some(fmt) = &track.source_format {
        println!("  format:   {fmt}");
        if let Some(total) = track.total_length {
            let d = fmt.frames_to_duration(total);
            println!("  duration: {:.3}s ({total} frames)", d.as_secs_f64());
        }
    }
    if let Some(size) = track.input_size {
        println!("  size:     {size} bytes");
    }
    for (k, v) in tags {
        println!("  {k}: {v}");
    }
}

fn print_peaks(path: &Path, handle: &PeaksHandle) {
    println!("{}", path.display());
    for (i, ch) in handle.channels().iter().enumerate() {
        println!(
            "  ch{i}: highest {:.2} dB, average {:.2} dB, clipped {}",
            ch.highest_db(),
            ch.average_db(),
            ch.clipped
        );
    }
}
