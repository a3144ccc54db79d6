pub mod inmemory;
pub mod pool;

pub use inmemory::{FlatIndex, FlatIndexFactory, HashingEmbedder, HashingEmbedderFactory};
pub use pool::{EmbedderFactory, HandleKey, HandlePool, IndexFactory, IndexHandle};
