//! Sample-rate and channel conversion to the 16 kHz mono PCM the
//! transcription service expects

/// Mix interleaved multi-channel samples down to mono by averaging
pub fn to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }

    samples
        .chunks_exact(channels as usize)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
            (sum / i32::from(channels)).clamp(i16::MIN as i32, i16::MAX as i32) as i16
        })
        .collect()
}

/// Resample mono audio to `target_rate`
///
/// Integer ratios decimate (take every Nth sample); anything else is
/// linearly interpolated.
pub fn resample(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if source_rate == target_rate || samples.is_empty() || source_rate == 0 || target_rate == 0 {
        return samples.to_vec();
    }

    if source_rate > target_rate && source_rate % target_rate == 0 {
        let ratio = (source_rate / target_rate) as usize;
        return samples.iter().step_by(ratio).copied().collect();
    }

    let ratio = f64::from(source_rate) / f64::from(target_rate);
    let out_len = (samples.len() as f64 / ratio).floor() as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = pos - idx as f64;
            let value = f64::from(samples[idx]) * (1.0 - frac) + f64::from(samples[next]) * frac;
            value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
        })
        .collect()
}

/// Interleaved samples at any rate and channel count to mono at `target_rate`
pub fn to_mono_at(samples: &[i16], sample_rate: u32, channels: u16, target_rate: u32) -> Vec<i16> {
    let mono = to_mono(samples, channels);
    resample(&mono, sample_rate, target_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stereo_is_averaged() {
        let mono = to_mono(&[100, 300, -200, -400], 2);
        assert_eq!(mono, vec![200, -300]);
    }

    #[test]
    fn integer_ratio_decimates() {
        let samples: Vec<i16> = (0..48).collect();
        let out = resample(&samples, 48000, 16000);
        assert_eq!(out.len(), 16);
        assert_eq!(out[1], 3);
    }

    #[test]
    fn fractional_ratio_interpolates() {
        let samples = vec![1000i16; 44100];
        let out = resample(&samples, 44100, 16000);
        assert!((15999..=16000).contains(&out.len()));
        assert!(out.iter().all(|&s| s == 1000));
    }
}
