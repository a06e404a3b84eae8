use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use skald_core::config::AudioConfig;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{AudioError, Result};

/// Raw-block channel capacity between the cpal callback and the reader.
const RAW_CHANNEL_CAPACITY: usize = 64;

/// Microphone capture producing fixed-size int16 mono chunks.
///
/// A dedicated thread owns the `cpal::Stream` (it is not `Send`); the device
/// callback pushes sample blocks through a bounded channel and drops blocks
/// when the pipeline falls behind. `read_chunk` reassembles exact chunk
/// sizes and enforces the stall timeout — a stalled device is fatal because
/// recovery requires re-enumeration.
pub struct InputCapture {
    raw_rx: mpsc::Receiver<Vec<i16>>,
    pending: VecDeque<i16>,
    stall_timeout: Duration,
    shutdown: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl InputCapture {
    /// Open the configured input device and start capturing.
    pub fn open(config: &AudioConfig) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::channel::<Vec<i16>>(RAW_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_config = config.clone();
        let thread_shutdown = Arc::clone(&shutdown);
        let thread = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                capture_thread(thread_config, raw_tx, ready_tx, thread_shutdown);
            })
            .map_err(|e| AudioError::DeviceError(format!("capture thread spawn failed: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(AudioError::DeviceError(
                    "capture thread exited before reporting readiness".to_string(),
                ));
            }
        }

        Ok(Self {
            raw_rx,
            pending: VecDeque::new(),
            stall_timeout: Duration::from_secs_f64(config.stall_timeout),
            shutdown,
            thread: Some(thread),
        })
    }

    /// Read exactly `chunk_size` samples, waiting up to the stall timeout
    /// for the device. Timeout surfaces the fatal `AudioError::Stall`.
    pub async fn read_chunk(&mut self, chunk_size: usize) -> Result<Vec<i16>> {
        while self.pending.len() < chunk_size {
            match tokio::time::timeout(self.stall_timeout, self.raw_rx.recv()).await {
                Ok(Some(block)) => self.pending.extend(block),
                Ok(None) => {
                    return Err(AudioError::ChannelClosed(
                        "capture thread stopped".to_string(),
                    ));
                }
                Err(_) => {
                    return Err(AudioError::Stall(format!(
                        "no audio for {:.1}s",
                        self.stall_timeout.as_secs_f64()
                    )));
                }
            }
        }
        Ok(self.pending.drain(..chunk_size).collect())
    }

    /// Stop capture and release the device.
    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for InputCapture {
    fn drop(&mut self) {
        self.close();
    }
}

fn capture_thread(
    config: AudioConfig,
    raw_tx: mpsc::Sender<Vec<i16>>,
    ready_tx: std::sync::mpsc::Sender<Result<()>>,
    shutdown: Arc<AtomicBool>,
) {
    let stream = match open_stream(&config, raw_tx) {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }
    drop(stream);
    debug!("Capture thread finished");
}

fn open_stream(config: &AudioConfig, raw_tx: mpsc::Sender<Vec<i16>>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = select_input_device(&host, &config.input_device_name)?;

    let device_name = device
        .description()
        .map(|d| d.name().to_string())
        .unwrap_or_else(|_| "Unknown".to_string());
    info!(
        "Using input device: {} ({} Hz -> {} Hz)",
        device_name, config.capture_rate, config.target_rate
    );

    let supported = device.default_input_config()?;
    let sample_format = supported.sample_format();

    let stream_config = cpal::StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.capture_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let channels = config.channels as usize;
    let err_fn = |err| error!("Audio stream error: {}", err);

    let stream = match sample_format {
        cpal::SampleFormat::I16 => {
            let callback = move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let samples = downmix_mono(data.iter().map(|&s| s as i32), channels);
                if raw_tx.try_send(samples).is_err() {
                    warn!("Capture buffer full, dropping block");
                }
            };
            device.build_input_stream(&stream_config, callback, err_fn, None)?
        }
        cpal::SampleFormat::U16 => {
            let callback = move |data: &[u16], _: &cpal::InputCallbackInfo| {
                let samples = downmix_mono(data.iter().map(|&s| s as i32 - 32768), channels);
                if raw_tx.try_send(samples).is_err() {
                    warn!("Capture buffer full, dropping block");
                }
            };
            device.build_input_stream(&stream_config, callback, err_fn, None)?
        }
        cpal::SampleFormat::F32 => {
            let callback = move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let samples = downmix_mono(
                    data.iter()
                        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i32),
                    channels,
                );
                if raw_tx.try_send(samples).is_err() {
                    warn!("Capture buffer full, dropping block");
                }
            };
            device.build_input_stream(&stream_config, callback, err_fn, None)?
        }
        format => {
            return Err(AudioError::UnsupportedFormat(format!("{:?}", format)));
        }
    };

    stream.play()?;
    Ok(stream)
}

/// Average interleaved frames down to mono.
fn downmix_mono(samples: impl Iterator<Item = i32>, channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return samples.map(|s| s as i16).collect();
    }
    let collected: Vec<i32> = samples.collect();
    collected
        .chunks_exact(channels)
        .map(|frame| (frame.iter().sum::<i32>() / channels as i32) as i16)
        .collect()
}

/// Resolve the configured device name.
///
/// "default" and "pulse" (case-insensitive) use the system default input —
/// the right choice when PipeWire/Pulse handles routing. Anything else is a
/// case-sensitive substring match over enumerated input devices; no match
/// logs the enumeration and errors out.
fn select_input_device(host: &cpal::Host, name: &str) -> Result<cpal::Device> {
    if name.eq_ignore_ascii_case("default") || name.eq_ignore_ascii_case("pulse") {
        return host.default_input_device().ok_or(AudioError::NoInputDevice);
    }

    let devices = host.input_devices()?;
    for device in devices {
        let dev_name = device
            .description()
            .map(|d| d.name().to_string())
            .unwrap_or_default();
        if dev_name.contains(name) {
            return Ok(device);
        }
    }

    warn!("Input device '{}' not found. Available input devices:", name);
    if let Ok(devices) = host.input_devices() {
        for device in devices {
            if let Ok(desc) = device.description() {
                warn!("  {}", desc.name());
            }
        }
    }
    Err(AudioError::DeviceNotFound(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_mono_passthrough() {
        let samples = vec![100i32, -200, 300];
        assert_eq!(downmix_mono(samples.into_iter(), 1), vec![100, -200, 300]);
    }

    #[test]
    fn test_downmix_stereo_averages() {
        let samples = vec![100i32, 200, 300, 400];
        assert_eq!(downmix_mono(samples.into_iter(), 2), vec![150, 350]);
    }

    #[test]
    fn test_downmix_drops_incomplete_frame() {
        let samples = vec![100i32, 200, 300];
        assert_eq!(downmix_mono(samples.into_iter(), 2), vec![150]);
    }
}
