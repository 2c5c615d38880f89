use std::sync::mpsc;
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, Stream, StreamConfig};

use chorus_core::audio::{playback_frame, StreamParams};
use chorus_core::buffer::{AtomicMillis, SampleBuffer};

use crate::OpenError;

/// How far the callback's read phase may deviate from the clock before
/// it jumps instead of slewing (50 ms at 48 kHz).
const RESYNC_THRESHOLD_MS: i64 = 50;

/// Frames of correction applied per callback while slewing.
const MAX_SLEW_FRAMES: i64 = 8;

/// Handle to a running output stream. Dropping it stops the stream.
pub struct OutputHandle {
    // the device thread terminates when this channel is dropped
    _guard: mpsc::SyncSender<()>,
}

/// Opens the default output device at the stream's rate and channel
/// count and starts the real-time callback. The callback only touches
/// the shared buffer and the delay scalar: no locks, no allocation.
pub fn open(
    params: StreamParams,
    buffer: Arc<SampleBuffer>,
    delay: Arc<AtomicMillis>,
) -> Result<OutputHandle, OpenError> {
    // cpal streams are not Send on every platform, so the stream is
    // built and dropped on a dedicated thread
    let (result_tx, result_rx) = mpsc::sync_channel(0);
    let (guard_tx, guard_rx) = mpsc::sync_channel::<()>(0);

    chorus_util::thread::start("chorus/device", move || {
        match start_stream(params, buffer, delay) {
            Err(error) => {
                let _ = result_tx.send(Err(error));
            }
            Ok(stream) => {
                let _ = result_tx.send(Ok(()));
                let _ = guard_rx.recv();
                drop(stream);
            }
        }
    });

    match result_rx.recv() {
        Ok(Ok(())) => Ok(OutputHandle { _guard: guard_tx }),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(OpenError::ThreadError),
    }
}

fn start_stream(
    params: StreamParams,
    buffer: Arc<SampleBuffer>,
    delay: Arc<AtomicMillis>,
) -> Result<Stream, OpenError> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or(OpenError::NoDeviceAvailable)?;

    let config = configure(&device, &params)?;
    let channels = params.channels;
    let sample_rate = params.sample_rate;

    let stream = device.build_output_stream(
        &config,
        {
            let mut phase = ReadPhase::new(sample_rate);
            let mut initialized_thread = false;

            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                if !initialized_thread {
                    chorus_util::thread::set_name("chorus/audio");
                    chorus_util::thread::set_realtime_priority();
                    initialized_thread = true;
                }

                let target = playback_frame(chorus_util::time::now(), delay.load(), sample_rate);
                let frames = data.len() / channels;
                let read_frame = phase.advance(target, frames);

                if read_frame < 0 {
                    // stream has not reached sample zero yet
                    data.fill(0.0);
                    return;
                }

                let offset = read_frame as u64 * channels as u64;
                buffer.take(offset, data);
            }
        },
        |err| {
            log::error!("output stream error: {err:?}");
        },
        None,
    )?;

    stream.play()?;

    Ok(stream)
}

fn configure(device: &cpal::Device, params: &StreamParams) -> Result<StreamConfig, OpenError> {
    let supported = device
        .supported_output_configs()?
        .find(|range| {
            usize::from(range.channels()) == params.channels
                && range.sample_format() == SampleFormat::F32
                && range.min_sample_rate().0 <= params.sample_rate
                && params.sample_rate <= range.max_sample_rate().0
        })
        .ok_or(OpenError::NoSupportedConfig)?;

    Ok(supported
        .with_sample_rate(SampleRate(params.sample_rate))
        .config())
}

/// Read position of the callback, in frames of the stream's timeline.
/// Keeps playback contiguous across callbacks while nudging toward the
/// clock-derived target, absorbing sub-millisecond drift between the
/// device clock and the system clock. Large errors cause a jump.
struct ReadPhase {
    next_frame: i64,
    resync_threshold: i64,
}

impl ReadPhase {
    fn new(sample_rate: u32) -> ReadPhase {
        ReadPhase {
            next_frame: i64::MIN,
            resync_threshold: RESYNC_THRESHOLD_MS * i64::from(sample_rate) / 1000,
        }
    }

    fn advance(&mut self, target_frame: i64, frames: usize) -> i64 {
        if self.next_frame == i64::MIN {
            self.next_frame = target_frame;
        }

        let err = target_frame - self.next_frame;
        if err.abs() > self.resync_threshold {
            self.next_frame = target_frame;
        } else {
            self.next_frame += err.clamp(-MAX_SLEW_FRAMES, MAX_SLEW_FRAMES);
        }

        let read_frame = self.next_frame;
        self.next_frame += frames as i64;
        read_frame
    }
}
