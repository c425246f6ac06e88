//! Audio capture using PipeWire
//!
//! The PipeWire main loop runs on its own thread and pushes interleaved
//! S16LE samples into a bounded buffer. Readers pull whole buffers from it
//! with a timeout; if the reader falls behind and the buffer fills, the
//! next read reports an overrun instead of silently skipping audio.

use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;
use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::devices::{self, AudioDevice};
use super::error::{CaptureError, StreamReadError};

/// Audio capture configuration
#[derive(Clone, Debug, PartialEq)]
pub struct StreamParams {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames per read
    pub buffer_frames: u32,
    /// Substring matched against device names
    pub device: String,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
            buffer_frames: 4096,
            device: String::new(),
        }
    }
}

impl StreamParams {
    /// Wall-clock length of one buffer
    pub fn buffer_duration(&self) -> Duration {
        Duration::from_secs_f64(f64::from(self.buffer_frames) / f64::from(self.sample_rate.max(1)))
    }
}

/// Source of capture devices and streams
pub trait CaptureBackend {
    fn list_devices(&self) -> Result<Vec<AudioDevice>, CaptureError>;

    fn open(
        &self,
        device: &AudioDevice,
        params: &StreamParams,
    ) -> Result<Box<dyn CaptureStream>, CaptureError>;
}

/// An open capture stream
pub trait CaptureStream {
    /// Read `frames` interleaved frames, blocking at most a bounded time
    fn read_buffer(&mut self, frames: u32) -> Result<Vec<i16>, StreamReadError>;

    /// Release the stream; safe to call more than once
    fn close(&mut self);
}

/// Bounded sample buffer shared with the PipeWire thread
#[derive(Clone)]
struct SharedCaptureBuffer {
    inner: Arc<(Mutex<CaptureBufferInner>, Condvar)>,
}

struct CaptureBufferInner {
    samples: VecDeque<i16>,
    capacity: usize,
    overrun: bool,
    error: Option<String>,
    running: bool,
}

impl SharedCaptureBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new((
                Mutex::new(CaptureBufferInner {
                    samples: VecDeque::with_capacity(capacity),
                    capacity,
                    overrun: false,
                    error: None,
                    running: true,
                }),
                Condvar::new(),
            )),
        }
    }

    fn push(&self, samples: &[i16]) {
        let (lock, cvar) = &*self.inner;
        let mut inner = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let overflow = (inner.samples.len() + samples.len()).saturating_sub(inner.capacity);
        if overflow > 0 {
            inner.overrun = true;
            let drop_count = overflow.min(inner.samples.len());
            inner.samples.drain(..drop_count);
        }
        inner.samples.extend(samples);
        cvar.notify_all();
    }

    fn fail(&self, error: String) {
        let (lock, cvar) = &*self.inner;
        let mut inner = lock.lock().unwrap_or_else(PoisonError::into_inner);
        inner.error.get_or_insert(error);
        cvar.notify_all();
    }

    fn finish(&self) {
        let (lock, cvar) = &*self.inner;
        lock.lock().unwrap_or_else(PoisonError::into_inner).running = false;
        cvar.notify_all();
    }

    fn take(&self, count: usize, timeout: Duration) -> Result<Vec<i16>, StreamReadError> {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut inner = lock.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            if inner.overrun {
                inner.overrun = false;
                inner.samples.clear();
                return Err(StreamReadError::Overrun);
            }
            if let Some(error) = &inner.error {
                return Err(StreamReadError::Disconnected(error.clone()));
            }
            if inner.samples.len() >= count {
                return Ok(inner.samples.drain(..count).collect());
            }
            if !inner.running {
                return Err(StreamReadError::Disconnected(
                    "capture thread exited".to_string(),
                ));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StreamReadError::Timeout(timeout));
            }
            let (guard, _) = cvar
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
        }
    }
}

enum PipeWireCommand {
    Stop,
}

/// How long to wait for the PipeWire thread to connect the stream
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffered audio kept between reads, in buffers
const BUFFERS_HELD: usize = 8;

/// PipeWire capture backend
#[derive(Debug, Default, Clone, Copy)]
pub struct PipeWireBackend;

impl PipeWireBackend {
    pub fn new() -> Self {
        Self
    }
}

impl CaptureBackend for PipeWireBackend {
    fn list_devices(&self) -> Result<Vec<AudioDevice>, CaptureError> {
        devices::list_capture_devices()
    }

    fn open(
        &self,
        device: &AudioDevice,
        params: &StreamParams,
    ) -> Result<Box<dyn CaptureStream>, CaptureError> {
        let stream = PipeWireStream::open(device, params)?;
        Ok(Box::new(stream))
    }
}

/// Capture stream running a PipeWire main loop on a background thread
pub struct PipeWireStream {
    buffer: SharedCaptureBuffer,
    channels: usize,
    read_timeout: Duration,
    thread_handle: Option<JoinHandle<()>>,
    sender: Option<pw::channel::Sender<PipeWireCommand>>,
}

impl PipeWireStream {
    pub fn open(device: &AudioDevice, params: &StreamParams) -> Result<Self, CaptureError> {
        let channels = usize::from(params.channels.max(1));
        let buffer_samples = params.buffer_frames as usize * channels;
        let buffer = SharedCaptureBuffer::new(buffer_samples * BUFFERS_HELD);

        let (sender, receiver) = pw::channel::channel::<PipeWireCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();

        let thread_buffer = buffer.clone();
        let thread_device = device.clone();
        let thread_params = params.clone();
        let handle = thread::Builder::new()
            .name("pw-capture".into())
            .spawn(move || {
                let ready = ready_tx.clone();
                if let Err(e) = run_capture_loop(
                    thread_buffer.clone(),
                    &thread_device,
                    &thread_params,
                    receiver,
                    ready_tx,
                ) {
                    log::error!("Capture loop failed: {}", e);
                    let _ = ready.send(Err(e.clone()));
                    thread_buffer.fail(e);
                }
                thread_buffer.finish();
            })
            .map_err(|e| CaptureError::DeviceOpen {
                device: device.name.clone(),
                reason: format!("Failed to spawn capture thread: {}", e),
            })?;

        let mut stream = Self {
            buffer,
            channels,
            read_timeout: params.buffer_duration() * 2 + Duration::from_millis(500),
            thread_handle: Some(handle),
            sender: Some(sender),
        };

        let reason = match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                log::info!(
                    "Capturing from '{}' at {} Hz, {} channel(s)",
                    device.description,
                    params.sample_rate,
                    params.channels
                );
                return Ok(stream);
            }
            Ok(Err(reason)) => reason,
            Err(_) => "Timed out waiting for PipeWire".to_string(),
        };

        stream.close();
        Err(CaptureError::DeviceOpen {
            device: device.name.clone(),
            reason,
        })
    }
}

impl CaptureStream for PipeWireStream {
    fn read_buffer(&mut self, frames: u32) -> Result<Vec<i16>, StreamReadError> {
        if self.thread_handle.is_none() {
            return Err(StreamReadError::NotOpen);
        }
        self.buffer
            .take(frames as usize * self.channels, self.read_timeout)
    }

    fn close(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(PipeWireCommand::Stop);
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PipeWireStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Run the PipeWire capture loop in a background thread
fn run_capture_loop(
    buffer: SharedCaptureBuffer,
    device: &AudioDevice,
    params: &StreamParams,
    receiver: pw::channel::Receiver<PipeWireCommand>,
    ready: mpsc::Sender<Result<(), String>>,
) -> Result<(), String> {
    pw::init();

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| format!("Failed to create PipeWire main loop: {}", e))?;

    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| format!("Failed to create PipeWire context: {}", e))?;

    let core = context
        .connect_rc(None)
        .map_err(|e| format!("Failed to connect to PipeWire: {}", e))?;

    let mainloop_weak = mainloop.downgrade();
    let _receiver = receiver.attach(mainloop.loop_(), move |cmd| match cmd {
        PipeWireCommand::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        buffer: SharedCaptureBuffer,
        mainloop_weak: pw::main_loop::MainLoopWeak,
    }

    let user_data = UserData {
        format: Default::default(),
        buffer: buffer.clone(),
        mainloop_weak: mainloop.downgrade(),
    };

    let latency = format!("{}/{}", params.buffer_frames, params.sample_rate);
    let mut props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Capture",
        *pw::keys::MEDIA_ROLE => "Music",
        *pw::keys::APP_NAME => "Stream Monitor",
        *pw::keys::TARGET_OBJECT => device.name.as_str(),
        *pw::keys::NODE_LATENCY => latency.as_str(),
    };
    if device.is_monitor {
        props.insert("stream.capture.sink", "true");
    }

    let stream = pw::stream::StreamBox::new(&core, "stream-monitor-capture", props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .state_changed(|_, user_data, _old, new| match new {
            pw::stream::StreamState::Error(message) => {
                user_data.buffer.fail(message);
                if let Some(mainloop) = user_data.mainloop_weak.upgrade() {
                    mainloop.quit();
                }
            }
            pw::stream::StreamState::Unconnected => {
                user_data.buffer.fail("stream unconnected".to_string());
            }
            _ => {}
        })
        .param_changed(|_, user_data, id, param| {
            let Some(param) = param else { return };
            if id != spa::param::ParamType::Format.as_raw() {
                return;
            }

            let (media_type, media_subtype) = match format_utils::parse_format(param) {
                Ok(v) => v,
                Err(_) => return,
            };

            if media_type != MediaType::Audio || media_subtype != MediaSubtype::Raw {
                return;
            }

            if let Err(e) = user_data.format.parse(param) {
                log::warn!("Failed to parse negotiated audio format: {:?}", e);
            }
        })
        .process(|stream, user_data| {
            let Some(mut pw_buffer) = stream.dequeue_buffer() else {
                return;
            };

            let datas = pw_buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let data = &mut datas[0];
            let n_bytes = data.chunk().size() as usize;

            if let Some(raw) = data.data() {
                let n_bytes = n_bytes.min(raw.len());
                let samples: Vec<i16> = raw[..n_bytes]
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]))
                    .collect();
                user_data.buffer.push(&samples);
            }
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    // Request S16LE at the configured rate and channel count
    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::S16LE);
    audio_info.set_rate(params.sample_rate);
    audio_info.set_channels(u32::from(params.channels));

    let obj = spa::pod::Object {
        type_: spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
        id: spa::param::ParamType::EnumFormat.as_raw(),
        properties: audio_info.into(),
    };

    let values: Vec<u8> = spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(obj),
    )
    .map_err(|e| format!("Failed to serialize audio format: {:?}", e))?
    .0
    .into_inner();

    let pod = Pod::from_bytes(&values).ok_or("Failed to build audio format pod")?;
    let mut params_pods = [pod];

    stream
        .connect(
            spa::utils::Direction::Input,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params_pods,
        )
        .map_err(|e| format!("Failed to connect stream: {}", e))?;

    let _ = ready.send(Ok(()));

    // Run until stopped or the stream errors out
    mainloop.run();

    Ok(())
}
