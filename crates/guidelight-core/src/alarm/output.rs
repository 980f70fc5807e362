// ── Device output ──
//
// Plays a `SampleEngine` through the default output device. The cpal
// stream cannot move between threads, so it lives on a thread of its own
// until the `DeviceOutput` handle is dropped.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    Device, FromSample, OutputCallbackInfo, SampleFormat, SampleRate, SizedSample, Stream,
    StreamConfig, SupportedStreamConfig,
};
use tracing::{debug, error, info, warn};

use super::audio::SampleEngine;
use crate::error::CoreError;

/// Running output stream. Dropping it closes the device.
pub struct DeviceOutput {
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    sample_rate: u32,
}

impl DeviceOutput {
    /// Open the default output device and start pulling frames from
    /// `engine`. The device runs at `sample_rate` when it supports it.
    pub fn spawn(engine: Arc<SampleEngine>, sample_rate: u32) -> Result<Self, CoreError> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop, stopped) = mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("guidelight-audio".into())
            .spawn(move || match open_stream(engine, sample_rate) {
                Ok((stream, rate)) => {
                    let _ = ready_tx.send(Ok(rate));
                    // Returns once the handle drops its sender.
                    let _ = stopped.recv();
                    drop(stream);
                    debug!("audio output closed");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| not_ready(format!("could not start audio thread: {e}")))?;

        let rate = ready_rx
            .recv()
            .map_err(|_| not_ready("audio thread exited before opening the device"))??;
        info!(sample_rate = rate, "audio output open");
        Ok(Self {
            stop: Some(stop),
            thread: Some(thread),
            sample_rate: rate,
        })
    }

    /// Rate the device actually runs at.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for DeviceOutput {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("audio thread panicked");
            }
        }
    }
}

fn open_stream(engine: Arc<SampleEngine>, sample_rate: u32) -> Result<(Stream, u32), CoreError> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| not_ready("no default output device"))?;
    let supported = pick_config(&device, sample_rate)?;
    let config = supported.config();
    let channels = usize::from(config.channels);

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build::<f32>(&device, &config, engine, channels),
        SampleFormat::I16 => build::<i16>(&device, &config, engine, channels),
        SampleFormat::U16 => build::<u16>(&device, &config, engine, channels),
        other => Err(not_ready(format!("unsupported sample format {other:?}"))),
    }?;
    stream
        .play()
        .map_err(|e| not_ready(format!("could not start output stream: {e}")))?;
    Ok((stream, config.sample_rate.0))
}

/// The device default, moved to `sample_rate` when a matching range exists.
fn pick_config(device: &Device, sample_rate: u32) -> Result<SupportedStreamConfig, CoreError> {
    let default = device
        .default_output_config()
        .map_err(|e| not_ready(format!("no default output config: {e}")))?;
    if default.sample_rate().0 == sample_rate {
        return Ok(default);
    }

    let matching = device
        .supported_output_configs()
        .map_err(|e| not_ready(format!("could not list output configs: {e}")))?
        .find(|range| {
            range.channels() == default.channels()
                && range.sample_format() == default.sample_format()
                && (range.min_sample_rate().0..=range.max_sample_rate().0).contains(&sample_rate)
        });
    match matching {
        Some(range) => Ok(range.with_sample_rate(SampleRate(sample_rate))),
        None => {
            warn!(
                wanted = sample_rate,
                device = default.sample_rate().0,
                "device cannot run at the sample rate, alarm pitch will shift"
            );
            Ok(default)
        }
    }
}

fn build<T>(
    device: &Device,
    config: &StreamConfig,
    engine: Arc<SampleEngine>,
    channels: usize,
) -> Result<Stream, CoreError>
where
    T: SizedSample + FromSample<f32>,
{
    let mut scratch: Vec<f32> = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                engine.fill_interleaved(&mut scratch, channels);
                for (slot, value) in data.iter_mut().zip(&scratch) {
                    *slot = <T as FromSample<f32>>::from_sample_(*value);
                }
            },
            |err| error!(error = %err, "audio stream error"),
            None,
        )
        .map_err(|e| not_ready(format!("could not open output stream: {e}")))
}

fn not_ready(reason: impl Into<String>) -> CoreError {
    CoreError::AudioNotReady {
        reason: reason.into(),
    }
}
