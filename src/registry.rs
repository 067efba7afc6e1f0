use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::Arc,
};

use crate::{
    encoding::{FormattingToken, QwenEncoding},
    tiktoken_ext,
    tokenizer::Tokenizer,
};

const DEFAULT_SYSTEM: &str = "You are a helpful assistant.";

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum QwenEncodingName {
    QwenChat,
}

impl std::fmt::Display for QwenEncodingName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                QwenEncodingName::QwenChat => "QwenChat",
            }
        )
    }
}

impl std::str::FromStr for QwenEncodingName {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QwenChat" => Ok(QwenEncodingName::QwenChat),
            _ => anyhow::bail!("Invalid QwenEncodingName: {}", s),
        }
    }
}

impl std::fmt::Debug for QwenEncodingName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

/// Loads the encoding, downloading the vocabulary on first use.
pub fn load_qwen_encoding(name: QwenEncodingName) -> anyhow::Result<QwenEncoding> {
    let tokenizer = match name {
        QwenEncodingName::QwenChat => tiktoken_ext::Encoding::Qwen.load()?,
    };
    load_qwen_encoding_with_tokenizer(name, Arc::new(tokenizer))
}

/// Loads the encoding from a directory holding the vocabulary file.
pub fn load_qwen_encoding_from_dir(
    name: QwenEncodingName,
    dir: impl AsRef<Path>,
) -> anyhow::Result<QwenEncoding> {
    let tokenizer = match name {
        QwenEncodingName::QwenChat => tiktoken_ext::Encoding::Qwen.load_from_dir(dir)?,
    };
    load_qwen_encoding_with_tokenizer(name, Arc::new(tokenizer))
}

/// Builds the encoding around an existing tokenizer. The tokenizer must know
/// the ChatML markers as special tokens.
pub fn load_qwen_encoding_with_tokenizer(
    name: QwenEncodingName,
    tokenizer: Arc<dyn Tokenizer>,
) -> anyhow::Result<QwenEncoding> {
    let encoding = match name {
        QwenEncodingName::QwenChat => QwenEncoding {
            name: name.to_string(),
            tokenizer,
            format_token_mapping: make_mapping([
                (FormattingToken::ImStart, "<|im_start|>"),
                (FormattingToken::ImEnd, "<|im_end|>"),
                (FormattingToken::EndOfText, "<|endoftext|>"),
            ]),
            stop_formatting_tokens: HashSet::from([
                FormattingToken::EndOfText,
                FormattingToken::ImEnd,
            ]),
            default_system: DEFAULT_SYSTEM.to_string(),
            stop_words: vec!["Observation:".to_string()],
        },
    };
    // fail at load time rather than on the first render
    encoding.stop_tokens()?;
    tracing::debug!(encoding = %encoding, "loaded encoding");
    Ok(encoding)
}

fn make_mapping<I>(iter: I) -> HashMap<FormattingToken, String>
where
    I: IntoIterator<Item = (FormattingToken, &'static str)>,
{
    iter.into_iter().map(|(k, v)| (k, v.to_string())).collect()
}
