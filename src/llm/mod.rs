// Streaming chat-completion dependency: the `ChatCompletionClient` trait
// boundary, its message/tool-call/chunk types, and one concrete
// OpenAI-compatible implementation. Multi-vendor selection is out of scope.

pub mod loop_detector;
pub mod openai;
pub mod provider;

pub use loop_detector::{LoopAction, LoopDetection, LoopDetector, LoopDetectorConfig, LoopType};
pub use openai::OpenAiCompatibleClient;
pub use provider::*;
