#![deny(unsafe_code)]

pub mod connectors;
pub mod error;
pub mod health;
pub mod service;
pub mod store;
pub mod types;
pub mod validation;

pub use connectors::{Embedder, IndexObject, SearchIndex};
pub use error::MemoryError;
pub use health::{HealthAggregator, HealthSnapshot};
pub use service::{MemoryService, MemoryServiceConfig};
pub use store::{CascadeChildren, ContextRef, EntryRef, InMemoryStore, Store};
pub use types::*;
