pub mod public_encodings;

pub use public_encodings::{
    load_tiktoken_vocab_file, load_tokenizer_from_file, set_vocab_base_url, Encoding, LoadError,
    RemoteVocabFileError,
};
