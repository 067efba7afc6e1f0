#![doc = include_str!("../README.md")]

pub mod chat;
mod encoding;
mod registry;
pub mod stream;
pub mod tiktoken_ext;
pub mod tokenizer;

pub use encoding::{
    ConversationError, HistoryTurn, ParsedConversation, Query, QwenEncoding,
    RenderConversationConfig, RenderedPrompt,
};
pub use registry::{
    load_qwen_encoding, load_qwen_encoding_from_dir, load_qwen_encoding_with_tokenizer,
    QwenEncodingName,
};
pub use stream::{GenerationStep, StreamingAssembler};

#[cfg(test)]
pub mod tests;
