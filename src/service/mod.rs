//! Service layer

pub mod embed_service;
pub mod types;

pub use embed_service::{select_largest, EmbedError, EmbedService};
pub use types::EmbeddingResult;
