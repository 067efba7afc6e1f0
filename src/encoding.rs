use crate::{
    chat::{ChatMessage, Conversation, DeltaMessage, FunctionCall, FunctionDefinition, Role},
    tokenizer::{Rank, Tokenizer},
};
use serde::Serialize as _;
use std::{
    borrow::Cow,
    collections::{HashMap, HashSet},
    io,
    sync::Arc,
};

pub(crate) const ACTION_MARKER: &str = "\nAction:";
pub(crate) const ACTION_INPUT_MARKER: &str = "\nAction Input:";
pub(crate) const OBSERVATION_MARKER: &str = "\nObservation:";

const DEFAULT_MAX_WINDOW_SIZE: usize = 6144;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversationError {
    #[error("malformed conversation: {0}")]
    MalformedConversation(String),

    #[error("invalid role: {0}")]
    InvalidRole(String),
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum RenderFormattingTokenError {
    #[error("tried to render unmapped formatting token {0}")]
    UnmappedToken(FormattingToken),

    #[error("formatting token {token} is mapped to {marker:?}, which is not a special token of the tokenizer")]
    NotASpecialToken {
        token: FormattingToken,
        marker: String,
    },
}

/// These are formatting tokens that the renderer can use to generically
/// format the prompt, but at formatting time, they are replaced by actual
/// tokens from the tokenizers vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum FormattingToken {
    ImStart,
    ImEnd,
    EndOfText,
}

impl FormattingToken {
    fn as_str(&self) -> &str {
        match self {
            FormattingToken::ImStart => "<|im_start|>",
            FormattingToken::ImEnd => "<|im_end|>",
            FormattingToken::EndOfText => "<|endoftext|>",
        }
    }
}

impl std::fmt::Display for FormattingToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Language {
    En,
    Zh,
}

impl Language {
    const ALL: [Language; 2] = [Language::En, Language::Zh];

    /// Chinese if `text` contains any CJK unified ideograph.
    fn detect(text: &str) -> Self {
        if text.chars().any(|c| ('\u{4e00}'..='\u{9fff}').contains(&c)) {
            Language::Zh
        } else {
            Language::En
        }
    }

    fn dummy_thought(&self) -> &'static str {
        match self {
            Language::En => "\nThought: I now know the final answer.\nFinal answer: ",
            Language::Zh => "\nThought: 我会作答了。\nFinal answer: ",
        }
    }

    fn tool_thought(&self, function_name: &str) -> String {
        match self {
            Language::En => format!("Thought: I can use {function_name}."),
            Language::Zh => format!("Thought: 我可以使用 {function_name} API。"),
        }
    }
}

/// One completed user/assistant exchange.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HistoryTurn {
    pub user: String,
    pub assistant: String,
}

impl HistoryTurn {
    pub fn new(user: impl Into<String>, assistant: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            assistant: assistant.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Query {
    Text(String),
    /// The conversation ends with an assistant message that should be
    /// continued rather than answered.
    ContinueLastMessage,
}

/// A conversation reshaped into the query/history form the template needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedConversation {
    pub query: Query,
    pub history: Vec<HistoryTurn>,
    /// Text of the system turn. User supplied system text and function
    /// instructions are folded into the last question, so this is the
    /// encoding's default system text.
    pub system: String,
}

/// Prompt text and its token ids, built together segment by segment.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RenderedPrompt {
    pub text: String,
    pub token_ids: Vec<Rank>,
}

impl RenderedPrompt {
    /// Number of tokens.
    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    fn append(&mut self, other: RenderedPrompt) {
        self.text.push_str(&other.text);
        self.token_ids.extend(other.token_ids);
    }
}

#[derive(Clone)]
pub struct QwenEncoding {
    pub(crate) name: String,
    pub(crate) tokenizer: Arc<dyn Tokenizer>,
    pub(crate) format_token_mapping: HashMap<FormattingToken, String>,
    pub(crate) stop_formatting_tokens: HashSet<FormattingToken>,
    pub(crate) default_system: String,
    pub(crate) stop_words: Vec<String>,
}

impl std::fmt::Debug for QwenEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QwenEncoding")
            .field("name", &self.name)
            .field("default_system", &self.default_system)
            .field("stop_words", &self.stop_words)
            .finish()
    }
}

impl std::fmt::Display for QwenEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Renderer({})", self.name)
    }
}

// General methods
impl QwenEncoding {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    pub fn default_system(&self) -> &str {
        &self.default_system
    }

    pub fn stop_words(&self) -> &[String] {
        &self.stop_words
    }

    /// Token ids that end generation and never belong to the visible output.
    pub fn stop_tokens(&self) -> anyhow::Result<HashSet<Rank>> {
        self.stop_formatting_tokens
            .iter()
            .copied()
            .map(|t| match self.render_formatting_token(t) {
                Ok(t) => Ok(t),
                Err(RenderFormattingTokenError::UnmappedToken(_)) => Err(anyhow::anyhow!(
                    "token {t} was specified as a stop token, but is not mapped"
                )),
                Err(e) => Err(anyhow::anyhow!(e).context("could not render stop token")),
            })
            .collect()
    }

    /// Stop words as token id sequences.
    pub fn stop_word_ids(&self) -> Vec<Vec<Rank>> {
        self.stop_words
            .iter()
            .map(|word| self.tokenizer.encode(word))
            .filter(|ids| !ids.is_empty())
            .collect()
    }
}

// Methods for normalizing conversations
impl QwenEncoding {
    /// Validates `messages` and folds them, together with the function
    /// definitions, into a query and a list of history turns.
    pub fn parse_messages(
        &self,
        messages: &[ChatMessage],
        functions: &[FunctionDefinition],
    ) -> Result<ParsedConversation, ConversationError> {
        if messages.iter().all(|m| m.role != Role::User) {
            return Err(ConversationError::MalformedConversation(
                "At least one message must be from user.".to_string(),
            ));
        }

        let (mut system, messages) = match messages.split_first() {
            Some((first, rest)) if first.role == Role::System => {
                let system = if first.content == self.default_system {
                    String::new()
                } else {
                    first.content.clone()
                };
                (system, rest)
            }
            _ => (String::new(), messages),
        };

        if !functions.is_empty() {
            system.push_str("\n\n");
            system.push_str(&Self::template_react_instruction(functions)?);
            system = trim_turn(&system).to_string();
        }

        let mut normalized: Vec<NormalizedMessage> = Vec::with_capacity(messages.len());
        for (idx, message) in messages.iter().enumerate() {
            let content = message.content.as_str();
            match message.role {
                Role::Function => {
                    let last = match normalized.last_mut() {
                        Some(last) if last.role == Role::Assistant => last,
                        _ => {
                            return Err(ConversationError::InvalidRole(
                                "Expecting role assistant before role function.".to_string(),
                            ))
                        }
                    };
                    last.content.push_str("\nObservation: ");
                    last.content.push_str(content);
                    if idx == messages.len() - 1 {
                        last.content.push_str("\nThought:");
                    }
                }
                Role::Assistant => {
                    let Some(last) = normalized.last_mut() else {
                        return Err(ConversationError::InvalidRole(
                            "Expecting role user before role assistant.".to_string(),
                        ));
                    };
                    let language = Language::detect(&last.content);
                    let content = match &message.function_call {
                        None if !functions.is_empty() => {
                            format!("{}{content}", language.dummy_thought())
                        }
                        None => content.to_string(),
                        Some(call) => {
                            let thought = if content.is_empty() {
                                language.tool_thought(&call.name)
                            } else {
                                content.to_string()
                            };
                            format!(
                                "\n{thought}\nAction: {}\nAction Input: {}",
                                call.name, call.arguments
                            )
                        }
                    };
                    if last.role == Role::User {
                        normalized.push(NormalizedMessage {
                            role: Role::Assistant,
                            content: trim_turn(&content).to_string(),
                        });
                    } else {
                        last.content.push_str(&content);
                    }
                }
                Role::User => normalized.push(NormalizedMessage {
                    role: Role::User,
                    content: trim_turn(content).to_string(),
                }),
                Role::System => {
                    return Err(ConversationError::InvalidRole(
                        "Incorrect role system, only the first message may be a system message."
                            .to_string(),
                    ))
                }
            }
        }

        let mut query = match normalized.last() {
            Some(last) if last.role == Role::User => {
                let last = normalized.pop().map(|m| m.content).unwrap_or_default();
                Query::Text(last)
            }
            _ => Query::ContinueLastMessage,
        };

        if normalized.len() % 2 != 0 {
            return Err(unpaired_history_error());
        }
        let last_pair = normalized.len() / 2;
        let mut history = Vec::with_capacity(last_pair);
        for (pair_idx, pair) in normalized.chunks_exact(2).enumerate() {
            let [user, assistant] = pair else {
                return Err(unpaired_history_error());
            };
            if user.role != Role::User || assistant.role != Role::Assistant {
                return Err(unpaired_history_error());
            }
            let mut user_text = trim_turn(&user.content).to_string();
            let mut assistant_text = trim_turn(&assistant.content);
            if !system.is_empty() && pair_idx + 1 == last_pair {
                user_text = format!("{system}\n\nQuestion: {user_text}");
                system.clear();
            }
            for language in Language::ALL {
                let thought = language.dummy_thought().trim_start_matches('\n');
                if assistant_text.starts_with(thought) && assistant_text.contains("\nAction: ") {
                    assistant_text = &assistant_text[thought.len()..];
                }
            }
            history.push(HistoryTurn::new(user_text, assistant_text));
        }

        if !system.is_empty() {
            query = match query {
                Query::Text(text) => Query::Text(format!("{system}\n\nQuestion: {text}")),
                Query::ContinueLastMessage => {
                    return Err(ConversationError::InvalidRole(
                        "Expecting a user message to carry the system instructions.".to_string(),
                    ))
                }
            };
        }

        Ok(ParsedConversation {
            query,
            history,
            system: self.default_system.clone(),
        })
    }

    fn template_react_instruction(
        functions: &[FunctionDefinition],
    ) -> Result<String, ConversationError> {
        let mut tools_text = Vec::with_capacity(functions.len());
        let mut tools_name_text = Vec::with_capacity(functions.len());
        for function in functions {
            let name_for_model = function.model_name();
            let name_for_human = function.human_name();
            let description_for_model = function.model_description();
            let parameters = to_python_json(&function.parameters).map_err(|e| {
                ConversationError::MalformedConversation(format!(
                    "could not serialize parameters of function {}: {e}",
                    function.name
                ))
            })?;
            tools_text.push(format!(
                "{name_for_model}: Call this tool to interact with the {name_for_human} API. \
                 What is the {name_for_human} API useful for? {description_for_model} \
                 Parameters: {parameters}"
            ));
            tools_name_text.push(name_for_model);
        }
        let tools_text = tools_text.join("\n\n");
        let tools_name_text = tools_name_text.join(", ");
        Ok(format!(
            "Answer the following questions as best you can. You have access to the following APIs:

{tools_text}

Use the following format:

Question: the input question you must answer
Thought: you should always think about what to do
Action: the action to take, should be one of [{tools_name_text}]
Action Input: the input to the action
Observation: the result of the action
... (this Thought/Action/Action Input/Observation can be repeated zero or more times)
Thought: I now know the final answer
Final Answer: the final answer to the original input question

Begin!"
        ))
    }
}

#[derive(Debug)]
struct NormalizedMessage {
    role: Role,
    content: String,
}

fn unpaired_history_error() -> ConversationError {
    ConversationError::InvalidRole(
        "Expecting exactly one user (or function) role before every assistant role.".to_string(),
    )
}

/// Strips leading newlines and trailing whitespace.
fn trim_turn(text: &str) -> &str {
    text.trim_start_matches('\n').trim_end()
}

// Methods for rendering prompts
impl QwenEncoding {
    /// Normalizes a conversation and renders it into a prompt.
    pub fn render_chat(
        &self,
        conversation: &Conversation,
        config: Option<&RenderConversationConfig>,
    ) -> anyhow::Result<RenderedPrompt> {
        let default_config = RenderConversationConfig::default();
        let config = config.unwrap_or(&default_config);
        let parsed = self.parse_messages(&conversation.messages, &conversation.functions)?;
        match &parsed.query {
            Query::Text(query) => self.render(
                query,
                &parsed.history,
                &parsed.system,
                config.max_window_size,
            ),
            Query::ContinueLastMessage => self.render_continuation(&parsed.history),
        }
    }

    /// Renders the system turn, as many of the most recent history turns as
    /// fit strictly below `max_window_size` tokens, and the query turn.
    ///
    /// The query turn is always rendered, even when it alone exceeds the
    /// window.
    pub fn render(
        &self,
        query: &str,
        history: &[HistoryTurn],
        system: &str,
        max_window_size: usize,
    ) -> anyhow::Result<RenderedPrompt> {
        let mut prompt = RenderedPrompt::default();
        self.render_turn_into("system", system, &mut prompt)?;
        let system_tokens = prompt.len();

        let mut kept = Vec::new();
        let mut kept_tokens = 0;
        for turn in history.iter().rev() {
            let mut rendered = RenderedPrompt::default();
            self.render_text_into("\n", &mut rendered)?;
            self.render_turn_into("user", &turn.user, &mut rendered)?;
            self.render_text_into("\n", &mut rendered)?;
            self.render_turn_into("assistant", &turn.assistant, &mut rendered)?;
            if system_tokens + rendered.len() + kept_tokens < max_window_size {
                kept_tokens += rendered.len();
                kept.push(rendered);
            } else {
                break;
            }
        }
        if kept.len() < history.len() {
            tracing::debug!(
                kept = kept.len(),
                dropped = history.len() - kept.len(),
                max_window_size,
                "history truncated to fit the context window"
            );
        }
        for rendered in kept.into_iter().rev() {
            prompt.append(rendered);
        }

        self.render_text_into("\n", &mut prompt)?;
        self.render_turn_into("user", query, &mut prompt)?;
        self.render_text_into("\n", &mut prompt)?;
        self.render_formatting_token_into(FormattingToken::ImStart, &mut prompt)?;
        self.render_text_into("assistant", &mut prompt)?;
        self.render_text_into("\n", &mut prompt)?;
        Ok(prompt)
    }

    /// Renders the whole history without a budget and leaves the last
    /// assistant turn open so that generation continues it.
    pub fn render_continuation(&self, history: &[HistoryTurn]) -> anyhow::Result<RenderedPrompt> {
        let mut prompt = RenderedPrompt::default();
        self.render_turn_into("system", &self.default_system, &mut prompt)?;
        for turn in history {
            self.render_text_into("\n", &mut prompt)?;
            self.render_turn_into("user", trim_turn(&turn.user), &mut prompt)?;
            self.render_text_into("\n", &mut prompt)?;
            self.render_turn_into("assistant", trim_turn(&turn.assistant), &mut prompt)?;
        }
        let im_end = self.render_formatting_token(FormattingToken::ImEnd)?;
        anyhow::ensure!(
            prompt.token_ids.last() == Some(&im_end),
            "continuation prompt does not end with {}",
            FormattingToken::ImEnd
        );
        prompt.token_ids.pop();
        let marker_len = self
            .mapped_format_token(FormattingToken::ImEnd)
            .map_or(0, str::len);
        prompt.text.truncate(prompt.text.len() - marker_len);
        Ok(prompt)
    }

    /// Extracts a ReAct function call from generated text.
    ///
    /// Returns the text before the last `Action:` line as content together
    /// with the call, or `None` if the text holds no named action followed by
    /// an action input.
    pub fn parse_function_call(&self, response: &str) -> Option<DeltaMessage> {
        let i = response.rfind(ACTION_MARKER)?;
        let j = response.rfind(ACTION_INPUT_MARKER)?;
        if i >= j {
            return None;
        }
        // the generation loop may have swallowed the observation stop word
        let text = match response.rfind(OBSERVATION_MARKER) {
            Some(k) if k > j => Cow::Borrowed(response),
            _ => Cow::Owned(format!("{}{OBSERVATION_MARKER}", response.trim_end())),
        };
        let k = text.rfind(OBSERVATION_MARKER)?;
        let name = text.get(i + ACTION_MARKER.len()..j)?.trim();
        let arguments = text.get(j + ACTION_INPUT_MARKER.len()..k)?.trim();
        if name.is_empty() {
            return None;
        }
        Some(DeltaMessage {
            role: None,
            content: response[..i].to_string(),
            function_call: Some(FunctionCall::new(name, arguments)),
        })
    }
}

// Rendering helper methods
impl QwenEncoding {
    fn mapped_format_token(&self, t: FormattingToken) -> Option<&str> {
        self.format_token_mapping.get(&t).map(|s| s.as_str())
    }

    pub(crate) fn render_formatting_token(
        &self,
        t: FormattingToken,
    ) -> Result<Rank, RenderFormattingTokenError> {
        let mapped = self
            .mapped_format_token(t)
            .ok_or(RenderFormattingTokenError::UnmappedToken(t))?;
        self.tokenizer
            .special_token_id(mapped)
            .ok_or_else(|| RenderFormattingTokenError::NotASpecialToken {
                token: t,
                marker: mapped.to_string(),
            })
    }

    fn render_formatting_token_into(
        &self,
        t: FormattingToken,
        into: &mut RenderedPrompt,
    ) -> anyhow::Result<()> {
        let r = self.render_formatting_token(t)?;
        // mapping presence was checked by render_formatting_token
        into.text.push_str(self.mapped_format_token(t).unwrap_or_default());
        into.token_ids.push(r);
        Ok(())
    }

    fn render_text_into<T>(&self, text: T, into: &mut RenderedPrompt) -> anyhow::Result<()>
    where
        T: AsRef<str>,
    {
        let text = text.as_ref();
        into.text.push_str(text);
        into.token_ids.extend(self.tokenizer.encode(text));
        Ok(())
    }

    /// `<|im_start|>{role}\n{content}<|im_end|>`
    fn render_turn_into(
        &self,
        role: &str,
        content: &str,
        into: &mut RenderedPrompt,
    ) -> anyhow::Result<()> {
        self.render_formatting_token_into(FormattingToken::ImStart, into)?;
        self.render_text_into(role, into)?;
        self.render_text_into("\n", into)?;
        self.render_text_into(content, into)?;
        self.render_formatting_token_into(FormattingToken::ImEnd, into)
    }
}

#[derive(Clone, Debug)]
pub struct RenderConversationConfig {
    /// Token budget for the system turn plus the retained history turns.
    pub max_window_size: usize,
}

impl Default for RenderConversationConfig {
    fn default() -> Self {
        Self {
            max_window_size: DEFAULT_MAX_WINDOW_SIZE,
        }
    }
}

/// Formats JSON the way Python's `json.dumps` does by default: `", "` between
/// items and `": "` after keys.
struct PythonJsonFormatter;

impl serde_json::ser::Formatter for PythonJsonFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

fn to_python_json(value: &serde_json::Value) -> anyhow::Result<String> {
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, PythonJsonFormatter);
    value.serialize(&mut ser)?;
    Ok(String::from_utf8(out)?)
}
