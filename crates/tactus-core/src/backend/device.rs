//! CPAL sound card backend.

use super::{output_ring, pop_period, Backend, BackendPresets, Pulse};
use crate::compat::Arc;
use crate::config::SampleFormat;
use crate::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::traits::Producer as _;
use ringbuf::{HeapCons, HeapProd};

/// Wrapper to hold `cpal::Stream` in a `Send` context.
///
/// # Safety
/// `cpal::Stream` is `!Send` due to platform internals. The stream is only
/// created, played and dropped through `&mut CpalBackend`, which the engine
/// keeps behind a mutex.
struct StreamHandle(#[allow(dead_code)] cpal::Stream);

unsafe impl Send for StreamHandle {}

/// Backend playing through the system's audio device.
pub struct CpalBackend {
    name: String,
    device_index: Option<usize>,
    presets: BackendPresets,
    prod: HeapProd<f32>,
    cons: Option<HeapCons<f32>>,
    stream: Option<StreamHandle>,
}

impl CpalBackend {
    /// Opens the default output device, or the one at `device_index`, with a
    /// fixed period of `buffer_size` frames.
    pub fn new(device_index: Option<usize>, buffer_size: usize) -> Result<Self> {
        let device = get_device(device_index)?;
        let config = device.default_output_config()?;

        let format = match config.sample_format() {
            cpal::SampleFormat::F32 => SampleFormat::F32,
            cpal::SampleFormat::I16 => SampleFormat::I16,
            cpal::SampleFormat::U16 => SampleFormat::U16,
            format => {
                return Err(Error::InvalidConfig(format!(
                    "Unsupported sample format: {format:?}"
                )));
            }
        };

        let presets = BackendPresets {
            channels: config.channels() as usize,
            sample_rate: config.sample_rate().0,
            buffer_size,
            format,
        };
        let (prod, cons) = output_ring(&presets);

        Ok(Self {
            name: device.name().unwrap_or_else(|_| "cpal".to_string()),
            device_index,
            presets,
            prod,
            cons: Some(cons),
            stream: None,
        })
    }

    pub fn list_devices() -> Result<Vec<String>> {
        cpal::default_host()
            .output_devices()?
            .enumerate()
            .map(|(i, d)| Ok(format!("{i}: {}", d.name().unwrap_or_default())))
            .collect()
    }
}

impl Backend for CpalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn presets(&self) -> BackendPresets {
        self.presets
    }

    fn start(&mut self, pulse: Arc<Pulse>) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let cons = self
            .cons
            .take()
            .ok_or_else(|| Error::Backend("output ring already consumed".into()))?;

        let device = get_device(self.device_index)?;
        let config = cpal::StreamConfig {
            channels: self.presets.channels as u16,
            sample_rate: cpal::SampleRate(self.presets.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(self.presets.buffer_size as u32),
        };

        let stream = match self.presets.format {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, cons, pulse)?,
            SampleFormat::I16 => build_stream::<i16>(&device, &config, cons, pulse)?,
            SampleFormat::U16 => build_stream::<u16>(&device, &config, cons, pulse)?,
        };

        stream.play()?;
        self.stream = Some(StreamHandle(stream));
        tracing::debug!(device = %self.name, "CPAL backend started");
        Ok(())
    }

    fn stop(&mut self) {
        self.stream.take();
    }

    fn is_running(&self) -> bool {
        self.stream.is_some()
    }

    fn write(&mut self, interleaved: &[f32]) -> usize {
        self.prod.push_slice(interleaved)
    }
}

fn get_device(index: Option<usize>) -> Result<cpal::Device> {
    let host = cpal::default_host();

    match index {
        Some(i) => {
            let devices: Vec<_> = host.output_devices()?.collect();
            let count = devices.len();
            devices.into_iter().nth(i).ok_or_else(|| {
                Error::Backend(format!("Device index {i} out of range ({count} available)"))
            })
        }
        None => host
            .default_output_device()
            .ok_or_else(|| Error::Backend("No output device available".into())),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut cons: HeapCons<f32>,
    pulse: Arc<Pulse>,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    // Grows on the first callback, then stays put
    let mut scratch = Vec::<f32>::new();

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                if scratch.len() < data.len() {
                    scratch.resize(data.len(), 0.0);
                }
                let out = &mut scratch[..data.len()];
                pop_period(&mut cons, out);
                for (dst, src) in data.iter_mut().zip(out.iter()) {
                    *dst = T::from_sample(*src);
                }
            }));

            if result.is_err() {
                output_silence(data);
            }
            pulse.fire();
        },
        |err| tracing::warn!("Audio stream error: {err}"),
        None,
    )?;

    Ok(stream)
}

#[inline]
fn output_silence<T: cpal::SizedSample + cpal::FromSample<f32>>(data: &mut [T]) {
    for sample in data.iter_mut() {
        *sample = T::from_sample(0.0f32);
    }
}
