//! Multi-stream Opus-over-RTP control (C11): 17 independent mono streams
//! sharing one SSRC generation, with encoder-reset/SSRC-rotation support so
//! a receiver that joined mid-stream can resynchronize cleanly.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use audiopus::coder::Encoder as OpusEncoder;
use audiopus::{Application, Bitrate, Channels, SampleRate};
use discortp::rtp::MutableRtpPacket;
use discortp::MutablePacket;
use rand::RngCore;

use super::{RTP_DEFAULT_BITRATE_BPS, RTP_STREAMING_CHANNELS};

const RTP_VERSION: u8 = 2;
const RTP_PAYLOAD_TYPE_OPUS_DYNAMIC: u8 = 111;
const RTP_HEADER_LEN: usize = 12;

struct ChannelStream {
    encoder: Mutex<OpusEncoder>,
    sequence: AtomicU16,
    timestamp: AtomicU32,
    target: SocketAddr,
}

pub struct RtpControl {
    socket: UdpSocket,
    channels: Vec<ChannelStream>,
    next_ssrc: AtomicU32,
    current_ssrc: AtomicU32,
    ready: AtomicBool,
}

impl RtpControl {
    /// `targets` must have exactly [`RTP_STREAMING_CHANNELS`] entries, one
    /// UDP destination per independent stream.
    pub fn new(bind_addr: SocketAddr, targets: Vec<SocketAddr>) -> Result<Self> {
        if targets.len() != RTP_STREAMING_CHANNELS {
            anyhow::bail!(
                "expected {} rtp targets, got {}",
                RTP_STREAMING_CHANNELS,
                targets.len()
            );
        }

        let socket = UdpSocket::bind(bind_addr).context("binding rtp control socket")?;

        let channels = targets
            .into_iter()
            .map(|target| -> Result<ChannelStream> {
                Ok(ChannelStream {
                    encoder: Mutex::new(new_cbr_encoder()?),
                    sequence: AtomicU16::new(random_start_sequence()),
                    timestamp: AtomicU32::new(0),
                    target,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            socket,
            channels,
            next_ssrc: AtomicU32::new(1000),
            current_ssrc: AtomicU32::new(0),
            ready: AtomicBool::new(true),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn current_ssrc(&self) -> u32 {
        self.current_ssrc.load(Ordering::Acquire)
    }

    /// Send one already-Opus-encoded payload on `chan` (0..17).
    pub fn send(&self, chan: u8, opus_frame: &[u8]) -> Result<()> {
        let channel = self
            .channels
            .get(chan as usize)
            .with_context(|| format!("rtp channel {chan} out of range"))?;

        self.send_raw(channel, opus_frame)
    }

    fn send_raw(&self, channel: &ChannelStream, payload: &[u8]) -> Result<()> {
        let mut buf = vec![0u8; RTP_HEADER_LEN + payload.len()];
        {
            let mut rtp = MutableRtpPacket::new(&mut buf[..]).context("buffer too small for rtp header")?;
            rtp.set_version(RTP_VERSION);
            rtp.set_payload_type(RTP_PAYLOAD_TYPE_OPUS_DYNAMIC);
            rtp.set_sequence(channel.sequence.fetch_add(1, Ordering::Relaxed).into());
            rtp.set_timestamp(channel.timestamp.fetch_add(super::RTP_SAMPLES_PER_FRAME as u32, Ordering::Relaxed).into());
            rtp.set_ssrc(self.current_ssrc());
            rtp.payload_mut().copy_from_slice(payload);
        }

        self.socket
            .send_to(&buf, channel.target)
            .context("sending rtp packet")?;
        Ok(())
    }

    /// Rotate to a fresh SSRC, monotonically increasing from 1000. Does not
    /// touch sequence/timestamp counters; those keep advancing per-channel.
    pub fn rotate_ssrc(&self) {
        let ssrc = self.next_ssrc.fetch_add(1, Ordering::AcqRel);
        self.current_ssrc.store(ssrc, Ordering::Release);
        tracing::info!(ssrc, "rtp ssrc rotated");
    }

    /// Reset every channel's Opus encoder to its initial state.
    pub fn reset_encoders(&self) {
        for channel in &self.channels {
            let mut encoder = channel.encoder.lock().unwrap_or_else(|e| e.into_inner());
            let _ = encoder.reset_state();
        }
        tracing::debug!("rtp encoders reset");
    }

    /// Encode and send one silent (all-zero PCM) Opus frame to every channel,
    /// under the current SSRC generation. Each channel's own just-reset
    /// encoder produces the payload, so the receiver sees a real Opus frame
    /// rather than a hand-built placeholder. Called once per pulse of an
    /// encoder-reset sequence rather than looped internally, so the event
    /// loop stays in control of pacing.
    pub fn send_silent_frame_to_all_channels(&self) -> Result<()> {
        let silence = [0i16; super::RTP_SAMPLES_PER_FRAME];
        let mut scratch = vec![0u8; 4000];

        for channel in &self.channels {
            let len = {
                let mut encoder = channel.encoder.lock().unwrap_or_else(|e| e.into_inner());
                encoder.encode(&silence, &mut scratch).context("opus encode of silent frame failed")?
            };
            self.send_raw(channel, &scratch[..len])?;
        }
        Ok(())
    }
}

fn new_cbr_encoder() -> Result<OpusEncoder> {
    let mut encoder = OpusEncoder::new(SampleRate::Hz48000, Channels::Mono, Application::Audio)
        .context("creating opus encoder")?;
    encoder
        .set_bitrate(Bitrate::BitsPerSecond(RTP_DEFAULT_BITRATE_BPS))
        .context("setting opus bitrate")?;
    encoder.set_vbr(false).context("disabling opus vbr")?;
    encoder.set_complexity(10).context("setting opus complexity")?;
    encoder.enable_inband_fec(true).ok();
    encoder.set_packet_loss_perc(10).ok();
    Ok(encoder)
}

/// Picks a pseudo-random starting sequence number, matching the convention
/// of not starting every stream generation at zero.
pub fn random_start_sequence() -> u16 {
    (rand::thread_rng().next_u32() & 0xFFFF) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_targets(base_port: u16) -> Vec<SocketAddr> {
        (0..RTP_STREAMING_CHANNELS)
            .map(|i| format!("127.0.0.1:{}", base_port + i as u16).parse().unwrap())
            .collect()
    }

    #[test]
    fn rejects_wrong_target_count() {
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let result = RtpControl::new(bind, vec!["127.0.0.1:6000".parse().unwrap()]);
        assert!(result.is_err());
    }

    #[test]
    fn ssrc_rotation_is_monotonic() {
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let rtp = RtpControl::new(bind, test_targets(16100)).unwrap();
        rtp.rotate_ssrc();
        let first = rtp.current_ssrc();
        rtp.rotate_ssrc();
        let second = rtp.current_ssrc();
        assert!(second > first);
        assert_eq!(first, 1000);
        assert_eq!(second, 1001);
    }

    #[test]
    fn silent_frame_priming_actually_encodes_through_opus() {
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let rtp = RtpControl::new(bind, test_targets(16300)).unwrap();
        rtp.reset_encoders();
        assert!(rtp.send_silent_frame_to_all_channels().is_ok());
    }

    #[test]
    fn send_rejects_out_of_range_channel() {
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let rtp = RtpControl::new(bind, test_targets(16200)).unwrap();
        assert!(rtp.send(200, &[1, 2, 3]).is_err());
    }
}
