//! AI completion client for nexo.
//!
//! Pure HTTP client over the Gemini `generateContent` API.

mod error;
mod gemini;
mod types;

pub use error::{LlmError, Result};
pub use gemini::GeminiClient;
pub use types::{Role, Turn};
