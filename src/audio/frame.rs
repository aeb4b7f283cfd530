// PCM frame assembly: left-channel downmix, clipping, 16-bit quantization
// and RMS loudness, applied to raw interleaved device callbacks.

use std::time::{SystemTime, UNIX_EPOCH};

/// One mono PCM16 frame, exactly `frame_size` samples long.
#[derive(Debug, Clone)]
pub struct PcmFrame {
    /// Capture timestamp, milliseconds since the Unix epoch
    pub ts_ms: u64,
    /// RMS loudness of the normalized float signal, 0.0–1.0
    pub rms: f32,
    /// Little-endian signed 16-bit samples
    pub pcm: Vec<u8>,
}

/// Milliseconds since the Unix epoch.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Keep only the left channel of an interleaved buffer.
///
/// Summing stereo system audio can phase-cancel; one clean channel is
/// better than a mixed one.
pub fn downmix_left(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved.chunks(channels).map(|frame| frame[0]).collect()
}

/// RMS of a normalized float signal, with a small epsilon floor so a
/// digitally silent frame never reports exactly zero.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 1e-12;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt() + 1e-12
}

/// Clip to [-1, 1] and quantize to little-endian PCM16.
pub fn quantize(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let clipped = s.clamp(-1.0, 1.0);
        let v = (clipped * 32767.0) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Accumulates mono samples across device callbacks and cuts them into
/// fixed-size frames. Device buffer sizes rarely line up with the frame
/// size, so leftovers carry over to the next callback.
pub struct FrameAssembler {
    frame_size: usize,
    channels: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_size: usize, channels: usize) -> Self {
        Self {
            frame_size: frame_size.max(1),
            channels: channels.max(1),
            pending: Vec::new(),
        }
    }

    /// Feed one interleaved callback buffer, returning every complete
    /// frame it produced.
    pub fn push(&mut self, interleaved: &[f32]) -> Vec<PcmFrame> {
        self.pending.extend(downmix_left(interleaved, self.channels));

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_size {
            let chunk: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            let clipped: Vec<f32> = chunk.iter().map(|s| s.clamp(-1.0, 1.0)).collect();
            frames.push(PcmFrame {
                ts_ms: epoch_ms(),
                rms: rms(&clipped),
                pcm: quantize(&clipped),
            });
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_keeps_left_channel() {
        let interleaved = vec![0.1, 0.9, 0.2, 0.8, 0.3, 0.7];
        let mono = downmix_left(&interleaved, 2);
        assert_eq!(mono, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_downmix_mono_passthrough() {
        let samples = vec![0.5, -0.5];
        assert_eq!(downmix_left(&samples, 1), samples);
    }

    #[test]
    fn test_rms_silent_frame_has_epsilon_floor() {
        let silent = vec![0.0f32; 960];
        assert!(rms(&silent) > 0.0);
        assert!(rms(&silent) < 1e-6);
    }

    #[test]
    fn test_rms_full_scale() {
        let loud = vec![1.0f32; 960];
        assert!((rms(&loud) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_quantize_clips_out_of_range() {
        let bytes = quantize(&[2.0, -2.0]);
        let hi = i16::from_le_bytes([bytes[0], bytes[1]]);
        let lo = i16::from_le_bytes([bytes[2], bytes[3]]);
        assert_eq!(hi, 32767);
        assert_eq!(lo, -32767);
    }

    #[test]
    fn test_assembler_cuts_fixed_frames() {
        let mut asm = FrameAssembler::new(4, 1);

        // 6 samples: one full frame, 2 pending
        let frames = asm.push(&[0.1; 6]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].pcm.len(), 8); // 4 samples * 2 bytes

        // 2 more samples complete the second frame
        let frames = asm.push(&[0.1; 2]);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_assembler_downmixes_stereo() {
        let mut asm = FrameAssembler::new(2, 2);

        // 4 interleaved stereo samples -> 2 mono samples -> one frame
        let frames = asm.push(&[0.5, -0.5, 0.25, -0.25]);
        assert_eq!(frames.len(), 1);

        let s0 = i16::from_le_bytes([frames[0].pcm[0], frames[0].pcm[1]]);
        assert_eq!(s0, (0.5f32 * 32767.0) as i16);
    }
}
