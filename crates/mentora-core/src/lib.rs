pub mod clock;
pub mod coaching;
pub mod config;
pub mod directory;
pub mod error;
pub mod fallback;
pub mod generator;
pub mod history;
pub mod llm;
pub mod model;
pub mod quota;
pub mod retry;
pub mod storage;

pub use coaching::{CoachingService, RecommendationOutcome, SendOutcome, SessionView};
pub use error::{MentoraError, Result};
