use std::path::PathBuf;

use audio_pipeline::{PipelineConfig, SampleFormat};
use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "apipe", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Size of one read-ahead block in bytes
    #[arg(long, global = true, default_value_t = 64 * 1024)]
    pub buffer_size: usize,

    /// Number of read-ahead blocks
    #[arg(long, global = true, default_value_t = 3)]
    pub buffers: usize,

    /// Block memory and file offset alignment (power of two)
    #[arg(long, global = true, default_value_t = 4096)]
    pub align: usize,

    /// Read through the OS page cache
    #[arg(long, global = true)]
    pub no_direct_io: bool,

    /// Resampler input chunk size in frames (higher => more latency, lower => more overhead)
    #[arg(long, global = true, default_value_t = 1024)]
    pub chunk_frames: usize,

    /// Start position in seconds
    #[arg(long, global = true)]
    pub seek: Option<f64>,

    /// Stop after this many seconds of audio
    #[arg(long, global = true)]
    pub until: Option<f64>,

    /// Gain in dB
    #[arg(long, global = true, default_value_t = 0.0, allow_negative_numbers = true)]
    pub gain: f64,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play files on an output device
    Play {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Convert one file to WAV; `-` reads WAV from stdin or writes raw PCM to stdout
    Convert {
        input: PathBuf,
        output: PathBuf,

        /// Output sample format: s16, s24, s32, f32
        #[arg(long)]
        format: Option<SampleFormat>,

        /// Output sample rate in Hz
        #[arg(long)]
        rate: Option<u32>,

        /// Output channel count
        #[arg(long)]
        channels: Option<u16>,
    },

    /// Print format, length and tags
    Info {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Measure per-channel peak and average levels
    Peaks {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// List output devices
    Devices,
}

#[derive(ClapArgs, Debug)]
pub struct OutputArgs {
    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Playback queue target in seconds
    #[arg(long, default_value_t = 2.0)]
    pub buffer_seconds: f32,

    /// Playback callback refill cap (frames). Larger reduces lock churn but can add latency.
    #[arg(long, default_value_t = 4096)]
    pub refill_max_frames: usize,
}

impl Args {
    pub fn pipeline_config(&self) -> anyhow::Result<PipelineConfig> {
        let mut cfg = PipelineConfig::default();
        cfg.input.buffer_size = self.buffer_size;
        cfg.input.buffers = self.buffers;
        cfg.input.align = self.align;
        cfg.input.direct_io = !self.no_direct_io;
        cfg.resample.chunk_frames = self.chunk_frames;
        cfg.filters.gain_db = self.gain;
        cfg.filters.until = self.until.map(secs).transpose()?;

        match &self.cmd {
            Command::Play { output, .. } => {
                cfg.output.device = output.device.clone();
                cfg.output.buffer_seconds = output.buffer_seconds;
                cfg.output.refill_max_frames = output.refill_max_frames;
            }
            Command::Convert {
                format,
                rate,
                channels,
                ..
            } => {
                cfg.encode.format = *format;
                cfg.encode.rate = *rate;
                cfg.encode.channels = *channels;
            }
            _ => {}
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn seek_position(&self) -> anyhow::Result<Option<std::time::Duration>> {
        self.seek.map(secs).transpose()
    }
}

fn secs(v: f64) -> anyhow::Result<std::time::Duration> {
    std::time::Duration::try_from_secs_f64(v)
        .map_err(|e| anyhow::anyhow!("invalid duration {v}: {e}"))
}
