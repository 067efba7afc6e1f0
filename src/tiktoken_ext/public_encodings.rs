use std::{
    collections::HashMap,
    fs::File,
    io::{BufReader, BufWriter, Read as _, Write as _},
    path::{Path, PathBuf},
    sync::OnceLock,
};

use base64::{prelude::BASE64_STANDARD, Engine as _};

use crate::tokenizer::{QwenTokenizer, Rank};
use sha1::Sha1;
use sha2::{Digest as _, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("unknown encoding name: {0}")]
    UnknownEncodingName(String),

    #[error("invalid tiktoken vocab file: {0}")]
    InvalidTiktokenVocabFile(#[source] std::io::Error),

    #[error("failed to create CoreBPE: {0}")]
    CoreBPECreationFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("error downloading or loading vocab file: {0}")]
    DownloadOrLoadVocabFile(
        #[source]
        #[from]
        RemoteVocabFileError,
    ),
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteVocabFileError {
    #[error("failed to download or load vocab file")]
    FailedToDownloadOrLoadVocabFile(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("an underlying IO error occurred while {0}: {1}")]
    IOError(String, #[source] std::io::Error),

    #[error("hash mismatch for remote file {file_url}")]
    HashMismatch {
        file_url: String,
        expected_hash: String,
        computed_hash: String,
    },
}

const TIKTOKEN_ENCODINGS_BASE_VAR: &str = "TIKTOKEN_ENCODINGS_BASE";
const QWEN_TIKTOKEN_SHA256_VAR: &str = "QWEN_TIKTOKEN_SHA256";
const DEFAULT_QWEN_BASE_URL: &str = "https://huggingface.co/Qwen/Qwen-7B-Chat/resolve/main/";

/// Pre-tokenization split pattern of the Qwen vocabulary.
pub const QWEN_PATTERN: &str = r"(?i:'s|'t|'re|'ve|'m|'ll|'d)|[^\r\n\p{L}\p{N}]?\p{L}+|\p{N}| ?[^\s\p{L}\p{N}]+[\r\n]*|\s*[\r\n]+|\s+(?!\S)|\s+";

const QWEN_ENDOFTEXT: Rank = 151643;
const QWEN_EXTRA_TOKENS: Rank = 205;

static QWEN_BASE_URL_OVERRIDE: OnceLock<String> = OnceLock::new();

pub fn set_vocab_base_url(base_url: impl Into<String>) {
    let mut base = base_url.into();
    if !base.ends_with('/') {
        base.push('/');
    }
    // ignore error if already set
    let _ = QWEN_BASE_URL_OVERRIDE.set(base);
}

fn vocab_base_url() -> &'static str {
    QWEN_BASE_URL_OVERRIDE
        .get()
        .map(|s| s.as_str())
        .unwrap_or(DEFAULT_QWEN_BASE_URL)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Qwen,
}

impl Encoding {
    pub fn all() -> &'static [Self] {
        &[Self::Qwen]
    }

    pub fn from_name(name: impl AsRef<str>) -> Option<Self> {
        let name_str = name.as_ref();
        Self::all()
            .iter()
            .copied()
            .find(|encoding| encoding.name() == name_str)
    }

    pub fn load_from_name(name: impl AsRef<str>) -> Result<QwenTokenizer, LoadError> {
        let name = name.as_ref();
        Self::from_name(name)
            .ok_or_else(|| LoadError::UnknownEncodingName(name.to_string()))?
            .load()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Qwen => "qwen",
        }
    }

    /// Loads the vocabulary from `TIKTOKEN_ENCODINGS_BASE` if set, otherwise
    /// from the download cache.
    pub fn load(&self) -> Result<QwenTokenizer, LoadError> {
        let expected_hash = std::env::var(QWEN_TIKTOKEN_SHA256_VAR).ok();
        let vocab_file_path = if let Ok(base_dir) = std::env::var(TIKTOKEN_ENCODINGS_BASE_VAR) {
            PathBuf::from(base_dir).join(self.vocab_file_name())
        } else {
            let url = self.public_vocab_file_url();
            download_or_find_cached_file(&url, expected_hash.as_deref())?
        };
        self.load_from_dir_file(vocab_file_path, expected_hash.as_deref())
    }

    /// Loads the vocabulary file found in `dir`.
    pub fn load_from_dir(&self, dir: impl AsRef<Path>) -> Result<QwenTokenizer, LoadError> {
        let expected_hash = std::env::var(QWEN_TIKTOKEN_SHA256_VAR).ok();
        self.load_from_dir_file(
            dir.as_ref().join(self.vocab_file_name()),
            expected_hash.as_deref(),
        )
    }

    fn load_from_dir_file(
        &self,
        vocab_file_path: PathBuf,
        expected_hash: Option<&str>,
    ) -> Result<QwenTokenizer, LoadError> {
        load_tokenizer_from_file(
            vocab_file_path,
            expected_hash,
            self.special_tokens(),
            self.pattern(),
        )
    }

    fn public_vocab_file_url(&self) -> String {
        format!("{}{}", vocab_base_url(), self.vocab_file_name())
    }

    fn vocab_file_name(&self) -> &'static str {
        match self {
            Self::Qwen => "qwen.tiktoken",
        }
    }

    pub fn special_tokens(&self) -> Vec<(String, Rank)> {
        match self {
            Self::Qwen => {
                let mut specials = vec![
                    ("<|endoftext|>".to_string(), QWEN_ENDOFTEXT),
                    ("<|im_start|>".to_string(), QWEN_ENDOFTEXT + 1),
                    ("<|im_end|>".to_string(), QWEN_ENDOFTEXT + 2),
                ];
                specials.extend(
                    (0..QWEN_EXTRA_TOKENS)
                        .map(|i| (format!("<|extra_{i}|>"), QWEN_ENDOFTEXT + 3 + i)),
                );
                specials
            }
        }
    }

    pub fn pattern(&self) -> &'static str {
        match self {
            Self::Qwen => QWEN_PATTERN,
        }
    }
}

fn load_tiktoken_vocab<R>(
    mut reader: R,
    expected_hash: Option<&str>,
) -> std::result::Result<HashMap<Vec<u8>, Rank>, std::io::Error>
where
    R: std::io::BufRead,
{
    let mut hasher = expected_hash.map(|hash| (hash, Sha256::new()));
    let mut bpe_ranks = HashMap::new();
    // using readline here so that the line returned includes the newline bytes for the hasher
    let mut lin_no = 0;
    let mut line_buffer = String::new();
    while reader.read_line(&mut line_buffer)? > 0 {
        lin_no += 1;
        if let Some((_, hasher)) = hasher.as_mut() {
            hasher.update(line_buffer.as_bytes());
        }
        let line = line_buffer.trim_end();
        if line.is_empty() {
            line_buffer.clear();
            continue;
        }
        let (token, rank) = line.split_once(' ').ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("expected token and rank, could not split on ' ' at line {lin_no}"),
            )
        })?;
        let bytes = BASE64_STANDARD.decode(token).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("failed to decode base64 token at line {lin_no}: {e}"),
            )
        })?;
        let rank = rank.parse().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("failed to parse rank at line {lin_no}: {e}"),
            )
        })?;
        bpe_ranks.insert(bytes, rank);
        line_buffer.clear();
    }
    if let Some((expected_hash, hasher)) = hasher {
        let computed_hash = format!("{:x}", hasher.finalize());
        if computed_hash != expected_hash {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("hash mismatch: computed={computed_hash}, expected={expected_hash}"),
            ));
        }
    }
    Ok(bpe_ranks)
}

pub fn load_tiktoken_vocab_file<P>(
    path: P,
    expected_hash: Option<&str>,
) -> std::result::Result<HashMap<Vec<u8>, Rank>, std::io::Error>
where
    P: AsRef<Path>,
{
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    load_tiktoken_vocab(reader, expected_hash)
}

pub fn load_tokenizer_from_file<P, S, TS>(
    file_path: P,
    expected_hash: Option<&str>,
    special_tokens: S,
    pattern: &str,
) -> Result<QwenTokenizer, LoadError>
where
    P: AsRef<Path>,
    S: IntoIterator<Item = (TS, Rank)>,
    TS: Into<String>,
{
    let encoder = load_tiktoken_vocab_file(file_path, expected_hash)
        .map_err(LoadError::InvalidTiktokenVocabFile)?;
    QwenTokenizer::new(
        encoder,
        special_tokens
            .into_iter()
            .map(|(k, v)| (k.into(), v))
            .collect(),
        pattern,
    )
}

/// This returns the path to a file containing the data at `url`. If the file is
/// cached, it is used. Otherwise, the file is downloaded and cached.
fn download_or_find_cached_file(
    url: &str,
    expected_hash: Option<&str>,
) -> Result<PathBuf, RemoteVocabFileError> {
    let cache_dir = resolve_cache_dir()?;
    let cache_path = resolve_cache_path(&cache_dir, url);
    if cache_path.exists() {
        if verify_file_hash(&cache_path, expected_hash)? {
            return Ok(cache_path);
        }
        let _ = std::fs::remove_file(&cache_path);
    }
    tracing::info!(url, path = ?cache_path, "downloading vocab file");
    let hash = load_remote_file(url, &cache_path)?;
    if let Some(expected_hash) = expected_hash {
        if hash != expected_hash {
            let _ = std::fs::remove_file(&cache_path);
            return Err(RemoteVocabFileError::HashMismatch {
                file_url: url.to_string(),
                expected_hash: expected_hash.to_string(),
                computed_hash: hash,
            });
        }
    }
    Ok(cache_path)
}

fn resolve_cache_dir() -> Result<PathBuf, RemoteVocabFileError> {
    // shares the cache directory convention of tiktoken-rs
    let cache_dir = match std::env::var("TIKTOKEN_RS_CACHE_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => std::env::temp_dir().join("tiktoken-rs-cache"),
    };
    std::fs::create_dir_all(&cache_dir).map_err(|e| {
        RemoteVocabFileError::IOError(format!("creating cache dir {cache_dir:?}"), e)
    })?;
    Ok(cache_dir)
}

fn resolve_cache_path(cache_dir: &Path, url: &str) -> PathBuf {
    let mut hasher = Sha1::new();
    hasher.update(url.as_bytes());
    let cache_key = format!("{:x}", hasher.finalize());
    cache_dir.join(cache_key)
}

fn verify_file_hash(
    file_path: &Path,
    expected_hash: Option<&str>,
) -> Result<bool, RemoteVocabFileError> {
    let Some(expected_hash) = expected_hash else {
        return Ok(true);
    };
    let file = File::open(file_path)
        .map_err(|e| RemoteVocabFileError::IOError(format!("opening file {file_path:?}"), e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher).map_err(|e| {
        RemoteVocabFileError::IOError(format!("copying file {file_path:?} contents to hasher"), e)
    })?;
    let computed_hash = format!("{:x}", hasher.finalize());
    Ok(computed_hash == expected_hash)
}

/// Loads a remote file to `destination` and returns the computed hash of the
/// file contents.
fn load_remote_file(url: &str, destination: &Path) -> Result<String, RemoteVocabFileError> {
    let client = reqwest::blocking::Client::new();
    let mut response = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| RemoteVocabFileError::FailedToDownloadOrLoadVocabFile(Box::new(e)))?;

    let file = File::create(destination)
        .map_err(|e| RemoteVocabFileError::IOError(format!("creating file {destination:?}"), e))?;
    let mut dest = BufWriter::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = response.read(&mut buffer).map_err(|e| {
            RemoteVocabFileError::IOError(format!("reading from response {url}"), e)
        })?;
        if bytes_read == 0 {
            break;
        }
        dest.write_all(&buffer[..bytes_read]).map_err(|e| {
            RemoteVocabFileError::IOError(format!("writing to file {destination:?}"), e)
        })?;
        hasher.update(&buffer[..bytes_read]);
    }
    dest.flush()
        .map_err(|e| RemoteVocabFileError::IOError(format!("flushing file {destination:?}"), e))?;
    Ok(format!("{:x}", hasher.finalize()))
}
