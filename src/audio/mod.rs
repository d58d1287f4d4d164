pub mod chunk;
pub mod file;
pub mod merge;
pub mod resample;

pub use chunk::{
    chunk_file_name, cleanup_chunk_files, plan_chunks, should_split, ChunkArtifact, ChunkError, ChunkMaterializer,
    ChunkSpec, ChunkingConfig,
};
pub use file::{write_wav, AudioFile, AudioInfo};
pub use merge::{merge_transcripts, ChunkTranscript, MergedTranscript};
