pub mod adapter;
pub mod config;
pub mod error;
pub mod installer;
pub mod model;
pub mod prompt;
pub mod response;

pub use adapter::{Outcome, TextBackend};
pub use config::{AppConfig, Args};
pub use error::{LlmError, SetupError};
pub use model::{GenerationRequest, GenerationResult};
#[cfg(feature = "tch-backend")]
pub use model::LoadedModel;
pub use prompt::format_prompt;
pub use response::clean_response;
