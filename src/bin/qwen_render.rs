// qwen-render: render a chat request into a Qwen ChatML prompt.
//
// Usage:
//   echo '{"messages": [{"role": "user", "content": "hi"}]}' | qwen-render
//   qwen-render --tokens --max-window-size 2048 request.json
//   qwen-render --vocab-dir /models/qwen request.json
//   qwen-render --vocab-base-url https://mirror.example/qwen/ request.json

use std::{io::Read as _, path::PathBuf};

use anyhow::Context as _;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};

use qwen_react::{
    chat::Conversation, load_qwen_encoding, load_qwen_encoding_from_dir,
    tiktoken_ext::set_vocab_base_url, QwenEncodingName, RenderConversationConfig,
};

#[derive(Parser)]
#[command(
    name = "qwen-render",
    about = "Render an OpenAI-style chat request into a Qwen ChatML prompt."
)]
struct Cli {
    /// Directory containing qwen.tiktoken (default: $TIKTOKEN_ENCODINGS_BASE or a cached download).
    #[arg(long, value_name = "DIR")]
    vocab_dir: Option<PathBuf>,

    /// Base URL the vocabulary is downloaded from when it is not cached.
    #[arg(long, value_name = "URL", conflicts_with = "vocab_dir")]
    vocab_base_url: Option<String>,

    /// Token budget for the system turn plus retained history.
    #[arg(long, value_name = "N", default_value_t = RenderConversationConfig::default().max_window_size)]
    max_window_size: usize,

    /// Print token ids instead of prompt text.
    #[arg(long)]
    tokens: bool,

    /// JSON request with `messages` and optional `functions` (default: stdin).
    file: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let request = match &cli.file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("could not read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("could not read request from stdin")?;
            buf
        }
    };
    let conversation: Conversation =
        serde_json::from_str(&request).context("invalid chat request")?;

    if let Some(base_url) = &cli.vocab_base_url {
        set_vocab_base_url(base_url.as_str());
    }
    let encoding = match &cli.vocab_dir {
        Some(dir) => load_qwen_encoding_from_dir(QwenEncodingName::QwenChat, dir)?,
        None => load_qwen_encoding(QwenEncodingName::QwenChat)?,
    };
    let config = RenderConversationConfig {
        max_window_size: cli.max_window_size,
    };
    let prompt = encoding.render_chat(&conversation, Some(&config))?;
    tracing::info!(
        messages = conversation.messages.len(),
        functions = conversation.functions.len(),
        prompt_tokens = prompt.len(),
        "rendered prompt"
    );

    if cli.tokens {
        println!("{}", serde_json::to_string(&prompt.token_ids)?);
    } else {
        print!("{}", prompt.text);
    }
    Ok(())
}
