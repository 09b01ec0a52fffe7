// RAGO RAG - Retrieval pillar
//
// Documents are split into chunks, embedded in batches and written to two
// indexes (dense vectors and BM25 keywords). Queries run against either index
// or both, with the two rankings fused into one.

pub mod batch;
pub mod chunker;
pub mod config;
pub mod engine;
pub mod fusion;
pub mod hash;
pub mod store;

pub use batch::BatchEmbedder;
pub use chunker::{reconstruct, Chunker, ChunkingStrategy};
pub use config::{ChunkingConfig, EmbeddingBackend, EmbeddingConfig, RagConfig, SearchConfig};
pub use engine::{DocumentSummary, EngineStats, IngestResult, RetrievalEngine, SearchQuery};
pub use fusion::{FusionMethod, FusionParams};
pub use hash::HashEmbedder;
pub use store::{
    ChunkCandidate, KeywordStore, MemoryKeywordStore, MemoryVectorStore, StoreStats, VectorStore,
};
