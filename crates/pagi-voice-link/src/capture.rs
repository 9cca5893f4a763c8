//! Microphone capture through a reference-counted pool.
//!
//! The controller never owns the capture device. It takes a [`MicrophoneLease`] from a
//! shared [`MicrophonePool`]; the device opens on the first lease and closes when the last
//! lease is dropped, so other parts of an application can share the same stream.

use crate::error::{VoiceLinkError, VoiceLinkResult};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// A block of mono PCM samples (f32, -1.0..=1.0).
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
    /// When the block was captured or decoded.
    pub timestamp: std::time::Instant,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            timestamp: std::time::Instant::now(),
        }
    }
}

/// An open capture device.
pub trait CaptureStream: Send {
    fn subscribe(&self) -> broadcast::Receiver<AudioChunk>;

    fn sample_rate(&self) -> u32;

    /// Release the device. Called once, when the last lease goes away.
    fn stop(&mut self);
}

/// Opens capture devices. Denial surfaces as [`VoiceLinkError::Permission`].
pub trait CaptureBackend: Send + Sync {
    fn open(&self) -> VoiceLinkResult<Box<dyn CaptureStream>>;
}

#[derive(Default)]
struct PoolInner {
    stream: Option<Box<dyn CaptureStream>>,
    leases: usize,
}

/// Shared, reference-counted access to one capture device.
#[derive(Clone)]
pub struct MicrophonePool {
    backend: Arc<dyn CaptureBackend>,
    inner: Arc<Mutex<PoolInner>>,
}

fn lock(inner: &Mutex<PoolInner>) -> MutexGuard<'_, PoolInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MicrophonePool {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            inner: Arc::new(Mutex::new(PoolInner::default())),
        }
    }

    /// Take a lease, opening the device if nobody holds one.
    pub fn acquire(&self) -> VoiceLinkResult<MicrophoneLease> {
        let mut inner = lock(&self.inner);
        if inner.stream.is_none() {
            let stream = self.backend.open()?;
            info!(
                target: "pagi::voice_link::capture",
                sample_rate = stream.sample_rate(),
                "🎤 Microphone opened"
            );
            inner.stream = Some(stream);
        }
        let (receiver, sample_rate) = match inner.stream.as_ref() {
            Some(stream) => (stream.subscribe(), stream.sample_rate()),
            None => return Err(VoiceLinkError::AudioDevice("capture stream vanished".to_string())),
        };
        inner.leases += 1;
        debug!(target: "pagi::voice_link::capture", leases = inner.leases, "Microphone lease acquired");
        Ok(MicrophoneLease {
            inner: Arc::clone(&self.inner),
            receiver,
            sample_rate,
        })
    }

    pub fn active_leases(&self) -> usize {
        lock(&self.inner).leases
    }

    pub fn is_open(&self) -> bool {
        lock(&self.inner).stream.is_some()
    }
}

impl std::fmt::Debug for MicrophonePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("MicrophonePool")
            .field("open", &inner.stream.is_some())
            .field("leases", &inner.leases)
            .finish()
    }
}

/// One holder's claim on the capture device. Dropping it releases the claim.
pub struct MicrophoneLease {
    inner: Arc<Mutex<PoolInner>>,
    receiver: broadcast::Receiver<AudioChunk>,
    sample_rate: u32,
}

impl MicrophoneLease {
    /// A fresh receiver of captured audio.
    pub fn subscribe(&self) -> broadcast::Receiver<AudioChunk> {
        self.receiver.resubscribe()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for MicrophoneLease {
    fn drop(&mut self) {
        let mut inner = lock(&self.inner);
        inner.leases = inner.leases.saturating_sub(1);
        if inner.leases == 0 {
            if let Some(mut stream) = inner.stream.take() {
                stream.stop();
                info!(target: "pagi::voice_link::capture", "Microphone released");
            }
        }
    }
}

impl std::fmt::Debug for MicrophoneLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicrophoneLease")
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

#[cfg(feature = "microphone")]
pub use native::CpalMicrophone;

#[cfg(feature = "microphone")]
mod native {
    use super::{AudioChunk, CaptureBackend, CaptureStream};
    use crate::error::{VoiceLinkError, VoiceLinkResult};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::sync::mpsc;
    use std::thread::JoinHandle;
    use tokio::sync::broadcast;
    use tracing::{info, warn};

    /// Default input device through cpal. The `cpal::Stream` is not `Send`, so it lives on
    /// a dedicated thread until the stream is stopped.
    #[derive(Debug, Clone)]
    pub struct CpalMicrophone {
        /// Samples per emitted chunk (mono).
        pub chunk_samples: usize,
    }

    impl Default for CpalMicrophone {
        fn default() -> Self {
            // 20ms at 48kHz, one Opus frame
            Self { chunk_samples: 960 }
        }
    }

    struct CpalStream {
        tx: broadcast::Sender<AudioChunk>,
        sample_rate: u32,
        stop: Option<mpsc::Sender<()>>,
        thread: Option<JoinHandle<()>>,
    }

    impl CaptureStream for CpalStream {
        fn subscribe(&self) -> broadcast::Receiver<AudioChunk> {
            self.tx.subscribe()
        }

        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn stop(&mut self) {
            self.stop.take();
            if let Some(thread) = self.thread.take() {
                if thread.join().is_err() {
                    warn!(target: "pagi::voice_link::capture", "Capture thread panicked");
                }
            }
        }
    }

    impl Drop for CpalStream {
        fn drop(&mut self) {
            self.stop();
        }
    }

    fn build_stream(
        tx: broadcast::Sender<AudioChunk>,
        chunk_samples: usize,
    ) -> VoiceLinkResult<(cpal::Stream, u32)> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceLinkError::Permission("No input device available".to_string()))?;
        info!(
            target: "pagi::voice_link::capture",
            device = %device.name().unwrap_or_else(|_| "Unknown".to_string()),
            "📱 Using input device"
        );

        let supported = device.default_input_config()?;
        let sample_rate = supported.sample_rate().0;
        let channels = usize::from(supported.channels()).max(1);
        let config: cpal::StreamConfig = supported.config();

        let mut pending: Vec<f32> = Vec::with_capacity(chunk_samples);
        let stream = device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for frame in data.chunks(channels) {
                    pending.push(frame.iter().sum::<f32>() / frame.len() as f32);
                    if pending.len() >= chunk_samples {
                        let chunk = AudioChunk::new(std::mem::take(&mut pending), sample_rate);
                        // no subscribers is fine
                        let _ = tx.send(chunk);
                    }
                }
            },
            move |err| {
                warn!(target: "pagi::voice_link::capture", error = %err, "Audio stream error");
            },
            None,
        )?;
        stream.play()?;
        Ok((stream, sample_rate))
    }

    impl CaptureBackend for CpalMicrophone {
        fn open(&self) -> VoiceLinkResult<Box<dyn CaptureStream>> {
            let (tx, _) = broadcast::channel(64);
            let (ready_tx, ready_rx) = mpsc::channel::<VoiceLinkResult<u32>>();
            let (stop_tx, stop_rx) = mpsc::channel::<()>();
            let chunk_tx = tx.clone();
            let chunk_samples = self.chunk_samples.max(1);

            let thread = std::thread::Builder::new()
                .name("pagi-voice-link-mic".to_string())
                .spawn(move || match build_stream(chunk_tx, chunk_samples) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        // parked until the sender is dropped
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                })
                .map_err(|e| VoiceLinkError::AudioDevice(e.to_string()))?;

            let sample_rate = ready_rx
                .recv()
                .map_err(|_| VoiceLinkError::AudioDevice("capture thread exited".to_string()))??;

            Ok(Box::new(CpalStream {
                tx,
                sample_rate,
                stop: Some(stop_tx),
                thread: Some(thread),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingBackend {
        opened: AtomicUsize,
        stopped: Arc<AtomicUsize>,
        deny: bool,
        last_tx: Mutex<Option<broadcast::Sender<AudioChunk>>>,
    }

    struct FakeStream {
        tx: broadcast::Sender<AudioChunk>,
        stopped: Arc<AtomicUsize>,
    }

    impl CaptureStream for FakeStream {
        fn subscribe(&self) -> broadcast::Receiver<AudioChunk> {
            self.tx.subscribe()
        }
        fn sample_rate(&self) -> u32 {
            16_000
        }
        fn stop(&mut self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl CaptureBackend for CountingBackend {
        fn open(&self) -> VoiceLinkResult<Box<dyn CaptureStream>> {
            if self.deny {
                return Err(VoiceLinkError::Permission("denied".into()));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            let (tx, _) = broadcast::channel(4);
            *self.last_tx.lock().expect("lock") = Some(tx.clone());
            Ok(Box::new(FakeStream {
                tx,
                stopped: Arc::clone(&self.stopped),
            }))
        }
    }

    #[test]
    fn device_opens_once_and_closes_at_zero() {
        let backend = Arc::new(CountingBackend::default());
        let pool = MicrophonePool::new(backend.clone());

        let first = pool.acquire().expect("lease");
        let second = pool.acquire().expect("lease");
        assert_eq!(backend.opened.load(Ordering::SeqCst), 1);
        assert_eq!(pool.active_leases(), 2);

        drop(first);
        assert!(pool.is_open());
        assert_eq!(backend.stopped.load(Ordering::SeqCst), 0);

        drop(second);
        assert!(!pool.is_open());
        assert_eq!(backend.stopped.load(Ordering::SeqCst), 1);

        let _again = pool.acquire().expect("lease");
        assert_eq!(backend.opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn denial_is_a_permission_error_and_leaves_no_lease() {
        let pool = MicrophonePool::new(Arc::new(CountingBackend {
            deny: true,
            ..Default::default()
        }));
        assert!(matches!(pool.acquire(), Err(VoiceLinkError::Permission(_))));
        assert_eq!(pool.active_leases(), 0);
        assert!(!pool.is_open());
    }

    #[test]
    fn lease_subscribers_receive_audio() {
        let backend = Arc::new(CountingBackend::default());
        let pool = MicrophonePool::new(backend.clone());
        let lease = pool.acquire().expect("lease");
        let mut rx = lease.subscribe();
        assert_eq!(lease.sample_rate(), 16_000);

        let tx = backend.last_tx.lock().expect("lock").clone().expect("opened");
        tx.send(AudioChunk::new(vec![0.25; 160], 16_000)).expect("send");
        let chunk = rx.try_recv().expect("chunk");
        assert_eq!(chunk.samples.len(), 160);
        assert_eq!(chunk.sample_rate, 16_000);
    }
}
