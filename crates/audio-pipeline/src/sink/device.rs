//! Output device discovery and selection.

use cpal::traits::{DeviceTrait, HostTrait};

use crate::error::PipelineError;

/// Output device as shown by `apipe devices`.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub min_rate: u32,
    pub max_rate: u32,
    pub is_default: bool,
}

/// Pick the first output device whose name contains `needle`
/// (case-insensitive), or the host default.
pub(crate) fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device, PipelineError> {
    if let Some(needle) = needle {
        let mut devices = host
            .output_devices()
            .map_err(|e| PipelineError::Device(format!("no output devices: {e}")))?;
        return devices
            .find(|d| {
                d.description()
                    .ok()
                    .is_some_and(|n| matches_device_name(&n.name(), needle))
            })
            .ok_or_else(|| PipelineError::Device(format!("no output device matched: {needle}")));
    }
    host.default_output_device()
        .ok_or_else(|| PipelineError::Device("no default output device".into()))
}

/// Choose the best output config for a target sample rate.
///
/// Prefers the highest supported rate not above the target, then the
/// richest sample format.
pub(crate) fn pick_output_config(
    device: &cpal::Device,
    target_rate: Option<u32>,
) -> Result<cpal::SupportedStreamConfig, PipelineError> {
    let ranges = device
        .supported_output_configs()
        .map_err(|e| PipelineError::Device(format!("output configs: {e}")))?;

    let mut best: Option<(bool, u32, u8, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let below = target_rate.is_none_or(|t| rate <= t);
        let rank = sample_format_rank(range.sample_format());
        let replace = match &best {
            None => true,
            Some((b_below, b_rate, b_rank, _)) => {
                is_better_candidate(below, rate, rank, *b_below, *b_rate, *b_rank)
            }
        };
        if replace {
            best = Some((below, rate, rank, range.with_sample_rate(rate)));
        }
    }
    best.map(|b| b.3)
        .ok_or_else(|| PipelineError::Device("no supported output configs".into()))
}

/// Prefer a fixed, large buffer when the device advertises a range.
pub(crate) fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    const MAX_FRAMES: u32 = 16_384;
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            Some(cpal::BufferSize::Fixed((*max).min(MAX_FRAMES).max(*min)))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

fn pick_rate_for_range(min: u32, max: u32, target_rate: Option<u32>) -> u32 {
    match target_rate {
        Some(t) => t.clamp(min, max.max(min)),
        None => max,
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn is_better_candidate(
    below: bool,
    rate: u32,
    format_rank: u8,
    best_below: bool,
    best_rate: u32,
    best_rank: u8,
) -> bool {
    if below != best_below {
        below
    } else if rate != best_rate {
        rate > best_rate
    } else {
        format_rank < best_rank
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    !needle.is_empty() && name.to_lowercase().contains(&needle.to_lowercase())
}

/// Output devices of the default host with their sample rate ranges.
pub fn list_devices() -> Result<Vec<DeviceInfo>, PipelineError> {
    let host = cpal::default_host();
    let default_name = host
        .default_output_device()
        .and_then(|d| d.description().ok())
        .map(|d| d.name().to_string());
    let devices = host
        .output_devices()
        .map_err(|e| PipelineError::Device(format!("no output devices: {e}")))?;

    let mut out = Vec::new();
    for d in devices {
        let Ok(desc) = d.description() else {
            continue;
        };
        let name = desc.name().to_string();
        let (mut min_rate, mut max_rate) = (u32::MAX, 0u32);
        if let Ok(ranges) = d.supported_output_configs() {
            for r in ranges {
                min_rate = min_rate.min(r.min_sample_rate());
                max_rate = max_rate.max(r.max_sample_rate());
            }
        }
        if max_rate == 0 {
            match d.default_output_config() {
                Ok(cfg) => {
                    min_rate = cfg.sample_rate();
                    max_rate = min_rate;
                }
                Err(_) => {
                    tracing::warn!(device = %name, "skipping device without a usable sample rate");
                    continue;
                }
            }
        }
        out.push(DeviceInfo {
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            min_rate,
            max_rate,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_device_name_is_case_insensitive() {
        assert!(matches_device_name("USB DAC", "dac"));
        assert!(matches_device_name("usb dac", "USB"));
        assert!(!matches_device_name("USB DAC", "speaker"));
        assert!(!matches_device_name("USB DAC", "  "));
    }

    #[test]
    fn pick_rate_for_range_clamps_target() {
        assert_eq!(pick_rate_for_range(44_100, 96_000, Some(48_000)), 48_000);
        assert_eq!(pick_rate_for_range(44_100, 96_000, Some(22_050)), 44_100);
        assert_eq!(pick_rate_for_range(44_100, 96_000, Some(192_000)), 96_000);
        assert_eq!(pick_rate_for_range(44_100, 96_000, None), 96_000);
    }

    #[test]
    fn better_candidate_ordering() {
        assert!(is_better_candidate(true, 48_000, 1, false, 48_000, 1));
        assert!(is_better_candidate(true, 96_000, 2, true, 48_000, 2));
        assert!(is_better_candidate(true, 48_000, 0, true, 48_000, 2));
        assert!(!is_better_candidate(false, 192_000, 0, true, 44_100, 3));
    }
}
