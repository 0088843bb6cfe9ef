//! Default values for generation parameters.

pub const MAX_GENERATED_TOKENS: i32 = 1024;
pub const TEMPERATURE: f64 = 1.0;
pub const TOP_P: f64 = 1.0;
pub const TOP_K: i32 = -1;
pub const MIN_P: f64 = 0.0;
pub const TOP_LOGPROBS: i32 = 0;
pub const FREQUENCY_PENALTY: f64 = 0.0;
pub const PRESENCE_PENALTY: f64 = 0.0;
pub const REPETITION_PENALTY: f64 = 1.0;
pub const REPETITION_CONTEXT_SIZE: i32 = 60;
pub const NUM_CANDIDATES: i32 = 1;
