#![deny(unsafe_code)]

pub mod http_embedder;
pub mod http_search_index;
pub mod mock;
pub mod postgres_store;

pub use http_embedder::HttpEmbedder;
pub use http_search_index::HttpSearchIndex;
pub use mock::{AlwaysFailEmbedder, AlwaysFailSearchIndex, MockEmbedder, MockSearchIndex};
pub use postgres_store::PostgresStore;
