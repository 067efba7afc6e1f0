//! Tokenizer capability consumed by the renderer and the streaming assembler.

use std::collections::HashMap;

use rustc_hash::FxHashMap;
use tiktoken_rs::CoreBPE;

use crate::tiktoken_ext::LoadError;

pub type Rank = u32;

/// The operations the prompt engine needs from a tokenizer.
///
/// `encode` treats special marker strings appearing in `text` as ordinary
/// text; markers are only ever produced through [`Tokenizer::special_token_id`].
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<Rank>;

    /// Decodes `tokens`, replacing incomplete or invalid UTF-8 sequences with
    /// U+FFFD instead of failing.
    fn decode(&self, tokens: &[Rank]) -> String;

    fn special_token_id(&self, token: &str) -> Option<Rank>;
}

/// Byte-level BPE tokenizer in the tiktoken vocabulary format.
pub struct QwenTokenizer {
    bpe: CoreBPE,
    decoder: FxHashMap<Rank, Vec<u8>>,
    special_tokens: FxHashMap<String, Rank>,
}

impl QwenTokenizer {
    pub fn new(
        encoder: HashMap<Vec<u8>, Rank>,
        special_tokens: HashMap<String, Rank>,
        pattern: &str,
    ) -> Result<Self, LoadError> {
        let mut decoder: FxHashMap<Rank, Vec<u8>> = encoder
            .iter()
            .map(|(bytes, rank)| (*rank, bytes.clone()))
            .collect();
        decoder.extend(
            special_tokens
                .iter()
                .map(|(token, rank)| (*rank, token.as_bytes().to_vec())),
        );
        let specials: FxHashMap<String, Rank> = special_tokens
            .iter()
            .map(|(token, rank)| (token.clone(), *rank))
            .collect();
        let bpe = CoreBPE::new(
            encoder.into_iter().collect(),
            special_tokens.into_iter().collect(),
            pattern,
        )
        .map_err(|e| LoadError::CoreBPECreationFailed(e.into()))?;
        Ok(Self {
            bpe,
            decoder,
            special_tokens: specials,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.decoder.len()
    }

    pub fn decode_bytes(&self, tokens: &[Rank]) -> Vec<u8> {
        let mut out = Vec::with_capacity(tokens.len() * 2);
        for token in tokens {
            if let Some(bytes) = self.decoder.get(token) {
                out.extend_from_slice(bytes);
            }
        }
        out
    }
}

impl std::fmt::Debug for QwenTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QwenTokenizer")
            .field("vocab_size", &self.vocab_size())
            .field("special_tokens", &self.special_tokens.len())
            .finish()
    }
}

impl Tokenizer for QwenTokenizer {
    fn encode(&self, text: &str) -> Vec<Rank> {
        self.bpe.encode_ordinary(text)
    }

    fn decode(&self, tokens: &[Rank]) -> String {
        String::from_utf8_lossy(&self.decode_bytes(tokens)).into_owned()
    }

    fn special_token_id(&self, token: &str) -> Option<Rank> {
        self.special_tokens.get(token).copied()
    }
}
