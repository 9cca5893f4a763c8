//! WebRTC peer link: one Opus track up, one Opus track down, and the `oai-events` data
//! channel for the JSON protocol.

use crate::capture::AudioChunk;
use crate::config::VoiceLinkConfig;
use crate::error::{VoiceLinkError, VoiceLinkResult};
use crate::levels::PcmAnalyzer;
use crate::transport::{PeerConnector, PeerEvent, PeerLink, PeerSetup};
use async_trait::async_trait;
use audiopus::coder::{Decoder, Encoder};
use audiopus::packet::Packet;
use audiopus::{Application, Channels, MutSignals, SampleRate};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const EVENT_CHANNEL: &str = "oai-events";
const OPUS_RATE: u32 = 48_000;
/// 20 ms at 48 kHz.
const FRAME_SAMPLES: usize = 960;
/// Longest Opus frame (120 ms) at 48 kHz.
const MAX_DECODED: usize = 5_760;

/// Builds [`WebRtcLink`]s against one shared media engine.
pub struct WebRtcConnector {
    api: API,
    ice_servers: Vec<String>,
    fft_size: usize,
}

impl WebRtcConnector {
    pub fn new(config: &VoiceLinkConfig) -> VoiceLinkResult<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers: config.endpoints.ice_servers.clone(),
            fft_size: config.levels.fft_size,
        })
    }
}

impl std::fmt::Debug for WebRtcConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcConnector")
            .field("ice_servers", &self.ice_servers)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn create(&self, setup: PeerSetup) -> VoiceLinkResult<Box<dyn PeerLink>> {
        let config = RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        let PeerSetup {
            local_audio,
            sample_rate,
            events,
        } = setup;

        // Local microphone track.
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: OPUS_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_owned(),
            "pagi-voice-link".to_owned(),
        ));
        let rtp_sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = rtp_sender.read(&mut rtcp_buf).await {}
        });
        let encoder = Encoder::new(SampleRate::Hz48000, Channels::Mono, Application::Voip)
            .map_err(|e| VoiceLinkError::AudioDevice(format!("opus encoder: {e}")))?;
        let uplink = tokio::spawn(pump_microphone(local_audio, sample_rate, encoder, track));

        // Remote voice track.
        let fft_size = self.fft_size;
        let track_events = events.clone();
        pc.on_track(Box::new(
            move |remote: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                Box::pin(async move {
                    info!(target: "pagi::voice_link::webrtc", ssrc = remote.ssrc(), "🔊 Remote track");
                    tokio::spawn(pump_remote(remote, events, fft_size));
                })
            },
        ));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(target: "pagi::voice_link::webrtc", %state, "Peer connection state");
            if state == RTCPeerConnectionState::Failed {
                let _ = state_events.send(PeerEvent::Failed("peer connection failed".to_string()));
            }
            Box::pin(async {})
        }));

        let channel = pc.create_data_channel(EVENT_CHANNEL, None).await?;
        wire_channel(&channel, events);
        let (outbox, inbox) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_channel(Arc::clone(&channel), inbox));

        Ok(Box::new(WebRtcLink {
            pc,
            outbox,
            tasks: vec![uplink, writer],
        }))
    }
}

fn wire_channel(channel: &Arc<RTCDataChannel>, events: mpsc::UnboundedSender<PeerEvent>) {
    let open = events.clone();
    channel.on_open(Box::new(move || {
        let _ = open.send(PeerEvent::ChannelOpen);
        Box::pin(async {})
    }));

    let message = events.clone();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        match String::from_utf8(msg.data.to_vec()) {
            Ok(text) => {
                let _ = message.send(PeerEvent::ChannelMessage(text));
            }
            Err(e) => warn!(target: "pagi::voice_link::webrtc", error = %e, "Dropping non-UTF-8 channel message"),
        }
        Box::pin(async {})
    }));

    channel.on_close(Box::new(move || {
        let _ = events.send(PeerEvent::ChannelClosed);
        Box::pin(async {})
    }));
}

async fn write_channel(channel: Arc<RTCDataChannel>, mut inbox: mpsc::UnboundedReceiver<String>) {
    while let Some(message) = inbox.recv().await {
        if let Err(e) = channel.send_text(message).await {
            warn!(target: "pagi::voice_link::webrtc", error = %e, "Event channel send failed");
        }
    }
}

/// Encode microphone PCM to 20 ms Opus frames on the local track.
async fn pump_microphone(
    mut rx: broadcast::Receiver<AudioChunk>,
    sample_rate: u32,
    mut encoder: Encoder,
    track: Arc<TrackLocalStaticSample>,
) {
    let mut pending: Vec<i16> = Vec::with_capacity(FRAME_SAMPLES * 2);
    let mut packet = vec![0u8; 1500];
    loop {
        let chunk = match rx.recv().await {
            Ok(chunk) => chunk,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(target: "pagi::voice_link::webrtc", skipped, "Uplink lagged behind microphone");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let rate = if chunk.sample_rate == 0 { sample_rate } else { chunk.sample_rate };
        pending.extend(resample(&chunk.samples, rate, OPUS_RATE).into_iter().map(to_i16));

        while pending.len() >= FRAME_SAMPLES {
            let frame: Vec<i16> = pending.drain(..FRAME_SAMPLES).collect();
            let len = match encoder.encode(&frame, &mut packet) {
                Ok(len) => len,
                Err(e) => {
                    warn!(target: "pagi::voice_link::webrtc", error = %e, "Opus encode failed");
                    continue;
                }
            };
            let sample = Sample {
                data: Bytes::copy_from_slice(&packet[..len]),
                duration: Duration::from_millis(20),
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                debug!(target: "pagi::voice_link::webrtc", error = %e, "Local track closed");
                return;
            }
        }
    }
}

/// Decode the remote voice and report it once as remote media.
async fn pump_remote(remote: Arc<TrackRemote>, events: mpsc::UnboundedSender<PeerEvent>, fft_size: usize) {
    let mut decoder = match Decoder::new(SampleRate::Hz48000, Channels::Mono) {
        Ok(decoder) => decoder,
        Err(e) => {
            let _ = events.send(PeerEvent::Failed(format!("opus decoder: {e}")));
            return;
        }
    };
    let (pcm_tx, _) = broadcast::channel::<AudioChunk>(64);
    let mut announced = false;
    let mut pcm = vec![0f32; MAX_DECODED];

    while let Ok((rtp, _)) = remote.read_rtp().await {
        if !announced {
            announced = true;
            let feed = PcmAnalyzer::new(pcm_tx.subscribe(), fft_size);
            let _ = events.send(PeerEvent::RemoteMedia { feed: Box::new(feed) });
        }
        if rtp.payload.is_empty() {
            continue;
        }
        let decoded = Packet::try_from(&rtp.payload[..]).and_then(|packet| {
            let signals = MutSignals::try_from(&mut pcm[..])?;
            decoder.decode_float(Some(packet), signals, false)
        });
        match decoded {
            Ok(n) => {
                let _ = pcm_tx.send(AudioChunk::new(pcm[..n].to_vec(), OPUS_RATE));
            }
            Err(e) => debug!(target: "pagi::voice_link::webrtc", error = %e, "Opus decode failed"),
        }
    }
    debug!(target: "pagi::voice_link::webrtc", "Remote track ended");
}

/// Linear resampling; pass-through at equal rates.
fn resample(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = from as f64 / to as f64;
    let out_len = ((samples.len() as f64) / ratio).floor() as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(samples.len() - 1)];
            let b = samples[(idx + 1).min(samples.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Live peer transport.
pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    outbox: mpsc::UnboundedSender<String>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self) -> VoiceLinkResult<String> {
        let offer = self.pc.create_offer(None).await?;
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(offer).await?;
        let _ = gathered.recv().await;
        self.pc
            .local_description()
            .await
            .map(|description| description.sdp)
            .ok_or_else(|| VoiceLinkError::Transport("no local description after ICE gathering".to_string()))
    }

    async fn apply_answer(&self, answer: String) -> VoiceLinkResult<()> {
        let description = RTCSessionDescription::answer(answer)?;
        self.pc.set_remote_description(description).await?;
        Ok(())
    }

    fn send(&self, message: String) -> VoiceLinkResult<()> {
        self.outbox.send(message).map_err(|_| VoiceLinkError::ChannelClosed)
    }

    async fn close(&self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Err(e) = self.pc.close().await {
            debug!(target: "pagi::voice_link::webrtc", error = %e, "Peer close reported an error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resample_doubles_length_from_24k() {
        let out = resample(&[0.0, 1.0, 0.0, -1.0], 24_000, 48_000);
        assert_eq!(out.len(), 8);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 0.5).abs() < 1e-6);
        assert_eq!(out[2], 1.0);
    }

    #[test]
    fn resample_passes_through_at_opus_rate() {
        assert_eq!(resample(&[0.25, -0.25], OPUS_RATE, OPUS_RATE), vec![0.25, -0.25]);
    }

    #[test]
    fn pcm_conversion_clamps() {
        assert_eq!(to_i16(2.0), i16::MAX);
        assert_eq!(to_i16(0.0), 0);
        assert_eq!(to_i16(-2.0), -i16::MAX);
    }
}
