//! LLM Suggestion Engine.
//!
//! - `schema`: the response contract and strict validation into `Suggestion`s
//! - `prompt`: system prompt, per-chunk user prompt, stricter re-ask
//! - `engine`: `SuggestionEngine`, one packet in, validated suggestions out

pub mod engine;
pub mod prompt;
pub mod schema;

pub use engine::{EngineError, EngineOutput, SuggestionEngine, Usage};
pub use schema::{response_schema, validate, SchemaError, ValidatedResponse};
