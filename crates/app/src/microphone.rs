//! Default input device capture with cpal.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Sample, SampleFormat, StreamConfig};
use voice_orb_core::{
    AudioHost, MediaStream, OrbError, PcmGraph, Result, SampleTap, TappedStream,
};

/// Audio host that opens the system's default input device.
pub struct CpalAudioHost {
    host: cpal::Host,
    fft_size: usize,
}

impl CpalAudioHost {
    pub fn new(fft_size: usize) -> Self {
        Self {
            host: cpal::default_host(),
            fft_size,
        }
    }
}

impl AudioHost for CpalAudioHost {
    type Stream = CpalStream;
    type Graph = PcmGraph<CpalStream>;

    fn request_microphone(&mut self) -> Result<CpalStream> {
        let device = self
            .host
            .default_input_device()
            .ok_or_else(|| OrbError::Device("no input device found".to_string()))?;
        let config = device
            .default_input_config()
            .map_err(|e| OrbError::Device(e.to_string()))?;

        let channels = usize::from(config.channels()).max(1);
        tracing::info!(
            device = %device.name().unwrap_or_default(),
            sample_rate = config.sample_rate().0,
            channels,
            "opening microphone"
        );

        let tap = SampleTap::for_window(self.fft_size);
        let stream_config = config.config();
        let writer = tap.clone();
        let stream = match config.sample_format() {
            SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, writer, channels),
            SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, writer, channels),
            SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, writer, channels),
            other => {
                return Err(OrbError::Device(format!("unsupported sample format {other:?}")));
            }
        }
        .map_err(map_build_error)?;

        stream.play().map_err(|e| OrbError::Device(e.to_string()))?;

        Ok(CpalStream {
            stream: Some(stream),
            tap,
        })
    }

    fn open_graph(&mut self) -> Result<PcmGraph<CpalStream>> {
        Ok(PcmGraph::new())
    }
}

fn map_build_error(err: cpal::BuildStreamError) -> OrbError {
    use cpal::BuildStreamError;

    match err {
        BuildStreamError::DeviceNotAvailable => {
            OrbError::Device("the input device is no longer available".to_string())
        }
        BuildStreamError::StreamConfigNotSupported
        | BuildStreamError::InvalidArgument
        | BuildStreamError::StreamIdOverflow => OrbError::Device(err.to_string()),
        // Backends only report a refused microphone as free text.
        BuildStreamError::BackendSpecific { err } => {
            if err.description.to_ascii_lowercase().contains("permission") {
                OrbError::Permission(err.description)
            } else {
                OrbError::Device(err.description)
            }
        }
    }
}

/// Builds an input stream that downmixes to mono and feeds `tap`.
fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    tap: SampleTap,
    channels: usize,
) -> std::result::Result<cpal::Stream, cpal::BuildStreamError>
where
    T: Sample + cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let mono: Vec<f32> = data
                .chunks(channels)
                .map(|frame| {
                    let sum: f32 = frame.iter().map(|&s| <f32 as Sample>::from_sample(s)).sum();
                    sum / channels as f32
                })
                .collect();
            tap.push(&mono);
        },
        |err| tracing::error!(%err, "microphone stream error"),
        None,
    )
}

/// A running capture stream. Stopping it drops the cpal stream, which
/// releases the device.
pub struct CpalStream {
    stream: Option<cpal::Stream>,
    tap: SampleTap,
}

impl MediaStream for CpalStream {
    fn live_tracks(&self) -> usize {
        usize::from(self.stream.is_some())
    }

    fn stop_tracks(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(err) = stream.pause() {
                tracing::debug!(%err, "pausing microphone stream failed");
            }
            self.tap.clear();
        }
    }
}

impl TappedStream for CpalStream {
    fn tap(&self) -> SampleTap {
        self.tap.clone()
    }
}
