use anyhow::Result;
use opus::{Decoder as OpusDecoder, Encoder as OpusEncoder};

/// Capture and playback sample rate (48kHz)
pub const SAMPLE_RATE: u32 = 48000;

/// Audio channels (mono)
pub const CHANNELS: usize = 1;

/// Frame size in samples (20ms at 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Largest Opus frame a decoder can return (120ms at 48kHz)
const MAX_DECODED_FRAME: usize = 5760;

/// Opus audio encoder for the outbound microphone track
pub struct AudioEncoder {
    encoder: OpusEncoder,
}

impl AudioEncoder {
    pub fn new() -> Result<Self> {
        let encoder = OpusEncoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)?;

        Ok(Self { encoder })
    }

    /// Encode one frame of float PCM samples to Opus
    pub fn encode_float(&mut self, pcm: &[f32]) -> Result<Vec<u8>> {
        let mut output = vec![0u8; 4000]; // Max opus packet size
        let len = self.encoder.encode_float(pcm, &mut output)?;
        output.truncate(len);
        Ok(output)
    }

    /// Set the bitrate (in bits per second)
    pub fn set_bitrate(&mut self, bitrate: u32) -> Result<()> {
        self.encoder.set_bitrate(opus::Bitrate::Bits(bitrate as i32))?;
        Ok(())
    }
}

/// Opus audio decoder for the inbound assistant track
pub struct AudioDecoder {
    decoder: OpusDecoder,
}

impl AudioDecoder {
    pub fn new() -> Result<Self> {
        let decoder = OpusDecoder::new(SAMPLE_RATE, opus::Channels::Mono)?;

        Ok(Self { decoder })
    }

    /// Decode one Opus packet to float PCM samples
    pub fn decode_float(&mut self, opus_data: &[u8]) -> Result<Vec<f32>> {
        let mut output = vec![0f32; MAX_DECODED_FRAME * CHANNELS];
        let len = self.decoder.decode_float(opus_data, &mut output, false)?;
        output.truncate(len * CHANNELS);
        Ok(output)
    }
}

/// Split a stream of mono samples into fixed encoder frames, keeping the remainder
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    pending: Vec<f32>,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append samples and return every complete [`FRAME_SIZE`] frame now available
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let complete = self.pending.len() / FRAME_SIZE;
        let frames = self
            .pending
            .chunks_exact(FRAME_SIZE)
            .take(complete)
            .map(<[f32]>::to_vec)
            .collect();
        self.pending.drain(..complete * FRAME_SIZE);
        frames
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
