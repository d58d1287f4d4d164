use super::chunk::ChunkError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Transcript of one successfully processed chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkTranscript {
    pub chunk_index: u32,
    pub text: String,
    pub confidence: f64,

    /// Chunk duration in seconds
    pub duration: f64,
}

/// Session transcript reassembled from its chunks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedTranscript {
    pub text: String,

    /// Arithmetic mean of the chunk confidences
    pub confidence: f64,

    /// Sum of the chunk durations, in seconds
    pub duration: f64,

    pub word_count: usize,

    /// Chunks merged, including silent ones
    pub chunks_merged: usize,
}

/// Reassemble chunk transcripts in index order.
///
/// Arrival order does not matter. Before each chunk's text is appended, up
/// to `lookback` words it repeats from the end of the accumulated text are
/// dropped (the longest match wins). Silent chunks add no text but still
/// count towards the confidence mean.
pub fn merge_transcripts(chunks: &[ChunkTranscript], lookback: usize) -> Result<MergedTranscript, ChunkError> {
    if chunks.is_empty() {
        return Err(ChunkError::NoSuccessfulChunks);
    }

    let mut sorted: Vec<&ChunkTranscript> = chunks.iter().collect();
    sorted.sort_by_key(|chunk| chunk.chunk_index);

    let mut words: Vec<&str> = Vec::new();
    let mut total_confidence = 0.0;
    let mut total_duration = 0.0;

    for chunk in &sorted {
        let incoming: Vec<&str> = chunk.text.split_whitespace().collect();
        let skip = overlap_len(&words, &incoming, lookback);
        if skip > 0 {
            debug!("Removed {} overlapping words before chunk {}", skip, chunk.chunk_index);
        }
        words.extend_from_slice(&incoming[skip..]);

        total_confidence += chunk.confidence;
        total_duration += chunk.duration;
    }

    let merged = MergedTranscript {
        text: words.join(" "),
        confidence: total_confidence / sorted.len() as f64,
        duration: total_duration,
        word_count: words.len(),
        chunks_merged: sorted.len(),
    };

    info!(
        "Merged {} chunks into final transcript: {} words, {:.3} confidence",
        merged.chunks_merged, merged.word_count, merged.confidence
    );
    Ok(merged)
}

/// Length of the longest run (at most `lookback`) that ends `previous` and starts `current`
fn overlap_len(previous: &[&str], current: &[&str], lookback: usize) -> usize {
    let max = lookback.min(previous.len()).min(current.len());

    (1..=max)
        .rev()
        .find(|&k| {
            previous[previous.len() - k..]
                .iter()
                .zip(&current[..k])
                .all(|(a, b)| same_word(a, b))
        })
        .unwrap_or(0)
}

/// Case- and punctuation-insensitive word comparison. Tokens with no
/// letters or digits never match.
fn same_word(a: &str, b: &str) -> bool {
    let trim = |w: &str| {
        w.trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase()
    };
    let (a, b) = (trim(a), trim(b));
    !a.is_empty() && a == b
}
