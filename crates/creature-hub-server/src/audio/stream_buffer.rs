//! Loads a WAV file into Opus-encoded RTP slices, one independent mono
//! stream per channel (C6). Built once per animation with a sound file and
//! then read-only for the life of the session.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use audiopus::coder::Encoder as OpusEncoder;
use audiopus::{Application, Bitrate, Channels, SampleRate};
use sha2::{Digest, Sha256};

use super::{RTP_DEFAULT_BITRATE_BPS, RTP_SAMPLES_PER_FRAME, RTP_STREAMING_CHANNELS, SAMPLE_RATE_HZ};

pub struct AudioStreamBuffer {
    frames_per_channel: usize,
    /// encoded_frames[channel][frame] -> Opus payload bytes
    encoded_frames: Vec<Vec<Vec<u8>>>,
}

impl AudioStreamBuffer {
    pub fn frame_count(&self) -> usize {
        self.frames_per_channel
    }

    pub fn encoded_frame(&self, channel: usize, frame: usize) -> &[u8] {
        &self.encoded_frames[channel][frame]
    }

    /// Loads a 48kHz, 17-channel, signed 16-bit PCM WAV file and Opus-encodes
    /// every channel into 5ms slices. An optional disk cache, keyed by
    /// content size + mtime + a hash of the file bytes, is consulted first;
    /// callers never observe whether a given load hit the cache.
    pub fn load_from_wav(path: impl AsRef<Path>, cache: Option<&AudioCache>) -> anyhow::Result<Arc<Self>> {
        let path = path.as_ref();

        if let Some(cache) = cache {
            if let Some(cached) = cache.lookup(path)? {
                return Ok(cached);
            }
        }

        let buffer = Arc::new(Self::decode_wav(path)?);

        if let Some(cache) = cache {
            cache.store(path, buffer.clone())?;
        }

        Ok(buffer)
    }

    fn decode_wav(path: &Path) -> anyhow::Result<Self> {
        let mut reader =
            hound::WavReader::open(path).with_context(|| format!("opening wav file {}", path.display()))?;
        let spec = reader.spec();

        if spec.channels as usize != RTP_STREAMING_CHANNELS {
            bail!(
                "expected {} channels, wav file {} has {}",
                RTP_STREAMING_CHANNELS,
                path.display(),
                spec.channels
            );
        }
        if spec.sample_rate != SAMPLE_RATE_HZ {
            bail!(
                "expected {} Hz, wav file {} is {} Hz",
                SAMPLE_RATE_HZ,
                path.display(),
                spec.sample_rate
            );
        }
        if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
            bail!("expected signed 16-bit PCM, wav file {} is not", path.display());
        }

        let samples: Vec<i16> = reader
            .samples::<i16>()
            .collect::<Result<_, _>>()
            .with_context(|| format!("reading samples from {}", path.display()))?;

        let channels = RTP_STREAMING_CHANNELS;
        let frames_per_channel = samples.len() / channels / RTP_SAMPLES_PER_FRAME;

        if frames_per_channel == 0 {
            bail!(
                "wav file {} is shorter than one {} ms slice",
                path.display(),
                RTP_SAMPLES_PER_FRAME * 1000 / SAMPLE_RATE_HZ as usize
            );
        }

        let mut encoders = (0..channels)
            .map(|_| new_cbr_encoder())
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut encoded_frames: Vec<Vec<Vec<u8>>> = vec![Vec::with_capacity(frames_per_channel); channels];
        let mut scratch = vec![0u8; 4000];

        for frame_idx in 0..frames_per_channel {
            for (ch, encoder) in encoders.iter_mut().enumerate() {
                let mut pcm = vec![0i16; RTP_SAMPLES_PER_FRAME];
                for (sample_idx, sample) in pcm.iter_mut().enumerate() {
                    let interleaved_idx = (frame_idx * RTP_SAMPLES_PER_FRAME + sample_idx) * channels + ch;
                    *sample = samples[interleaved_idx];
                }
                let len = encoder
                    .encode(&pcm, &mut scratch)
                    .context("opus encode failed")?;
                encoded_frames[ch].push(scratch[..len].to_vec());
            }
        }

        tracing::debug!(
            path = %path.display(),
            frames_per_channel,
            channels,
            "decoded wav into opus frames",
        );

        Ok(Self {
            frames_per_channel,
            encoded_frames,
        })
    }
}

fn new_cbr_encoder() -> anyhow::Result<OpusEncoder> {
    let mut encoder = OpusEncoder::new(
        SampleRate::Hz48000,
        Channels::Mono,
        Application::Audio,
    )
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

/// Strictly-invisible disk cache for decoded/encoded audio, keyed by a hash
/// of the source file's content plus its size and mtime. A miss or a
/// corrupt cache entry always falls back to decoding from scratch.
pub struct AudioCache {
    dir: std::path::PathBuf,
}

impl AudioCache {
    pub fn new(dir: impl Into<std::path::PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn key_for(&self, path: &Path) -> anyhow::Result<String> {
        let meta = std::fs::metadata(path)?;
        let bytes = std::fs::read(path)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hasher.finalize();
        let mtime = meta.modified()?.duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs();
        Ok(format!("{:x}-{}-{}", digest, meta.len(), mtime))
    }

    fn cache_path(&self, key: &str) -> std::path::PathBuf {
        self.dir.join(format!("{key}.bin"))
    }

    fn lookup(&self, path: &Path) -> anyhow::Result<Option<Arc<AudioStreamBuffer>>> {
        let key = match self.key_for(path) {
            Ok(k) => k,
            Err(_) => return Ok(None),
        };
        let cache_path = self.cache_path(&key);
        match std::fs::read(&cache_path) {
            Ok(bytes) => Ok(decode_cache_blob(&bytes)),
            Err(_) => Ok(None),
        }
    }

    fn store(&self, path: &Path, buffer: Arc<AudioStreamBuffer>) -> anyhow::Result<()> {
        let key = self.key_for(path)?;
        std::fs::create_dir_all(&self.dir).ok();
        let blob = encode_cache_blob(&buffer);
        std::fs::write(self.cache_path(&key), blob).ok();
        Ok(())
    }
}

fn encode_cache_blob(buffer: &AudioStreamBuffer) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(buffer.frames_per_channel as u64).to_le_bytes());
    out.extend_from_slice(&(buffer.encoded_frames.len() as u64).to_le_bytes());
    for channel in &buffer.encoded_frames {
        for frame in channel {
            out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            out.extend_from_slice(frame);
        }
    }
    out
}

fn decode_cache_blob(bytes: &[u8]) -> Option<Arc<AudioStreamBuffer>> {
    let mut cursor = 0usize;
    let read_u64 = |cursor: &mut usize| -> Option<u64> {
        let slice = bytes.get(*cursor..*cursor + 8)?;
        *cursor += 8;
        Some(u64::from_le_bytes(slice.try_into().ok()?))
    };

    let frames_per_channel = read_u64(&mut cursor)? as usize;
    let channels = read_u64(&mut cursor)? as usize;

    let mut encoded_frames = vec![Vec::with_capacity(frames_per_channel); channels];
    for channel_frames in encoded_frames.iter_mut() {
        for _ in 0..frames_per_channel {
            let len = bytes.get(cursor..cursor + 4)?;
            cursor += 4;
            let len = u32::from_le_bytes(len.try_into().ok()?) as usize;
            let frame = bytes.get(cursor..cursor + len)?.to_vec();
            cursor += len;
            channel_frames.push(frame);
        }
    }

    Some(Arc::new(AudioStreamBuffer {
        frames_per_channel,
        encoded_frames,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_test_wav(path: &Path, frames: usize) {
        let spec = hound::WavSpec {
            channels: RTP_STREAMING_CHANNELS as u16,
            sample_rate: SAMPLE_RATE_HZ,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for _ in 0..(frames * RTP_SAMPLES_PER_FRAME) {
            for ch in 0..RTP_STREAMING_CHANNELS {
                writer.write_sample((ch as i16) * 100).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn decodes_wav_into_per_channel_opus_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wav");
        write_test_wav(&path, 4);

        let buffer = AudioStreamBuffer::load_from_wav(&path, None).unwrap();
        assert_eq!(buffer.frame_count(), 4);
        assert!(!buffer.encoded_frame(0, 0).is_empty());
        assert!(!buffer.encoded_frame(16, 3).is_empty());
    }

    #[test]
    fn rejects_wrong_channel_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: SAMPLE_RATE_HZ,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        writer.write_sample(0i16).unwrap();
        writer.write_sample(0i16).unwrap();
        writer.finalize().unwrap();

        assert!(AudioStreamBuffer::load_from_wav(&path, None).is_err());
    }

    #[test]
    fn rejects_file_shorter_than_one_slice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("too_short.wav");
        write_test_wav(&path, 0);

        assert!(AudioStreamBuffer::load_from_wav(&path, None).is_err());
    }

    #[test]
    fn disk_cache_round_trips() {
        let wav_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let path = wav_dir.path().join("cached.wav");
        write_test_wav(&path, 2);

        let cache = AudioCache::new(cache_dir.path());
        let first = AudioStreamBuffer::load_from_wav(&path, Some(&cache)).unwrap();
        let second = AudioStreamBuffer::load_from_wav(&path, Some(&cache)).unwrap();
        assert_eq!(first.frame_count(), second.frame_count());
    }
}
