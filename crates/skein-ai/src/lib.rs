//! skein-ai: model provider abstraction for the skein task engine
//!
//! Defines the transcript content types exchanged with a model, the
//! [`ApiHandler`] trait every provider implements, and the chunk stream a
//! provider returns for one request.

pub mod error;
pub mod handler;
pub mod providers;
pub mod stream;
pub mod types;

pub use error::{Error, Result};
pub use handler::{ApiHandler, RequestMetadata};
pub use stream::{ApiStream, ApiStreamChunk, GroundingSource};
pub use types::*;
