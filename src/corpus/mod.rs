pub mod bm25;
pub mod model;
pub mod retriever;
pub mod rrf;
pub mod traits;

pub use bm25::Bm25Sidecar;
pub use model::{
    Direction, Document, MetaValue, Metadata, RankedDocument, RetrievalRequest,
    RetrievalRequestError, TimePeriod,
};
pub use retriever::{
    capabilities_for_module, DeviceFallbackEmbedder, HybridRetriever, Retriever,
    RetrieverCapabilities, RetrieverError,
};
pub use rrf::{reciprocal_rank_fusion, RrfConfig};
pub use traits::{Embedder, MetadataFilter, VectorIndex};
