use core::fmt;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt::Display;

use crate::encoding::ConversationError;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Result of a tool invocation. Also accepted as `tool` on the wire.
    Function,
}

impl TryFrom<&str> for Role {
    type Error = ConversationError;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "function" | "tool" => Ok(Role::Function),
            other => Err(ConversationError::InvalidRole(format!(
                "Incorrect role {other}"
            ))),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = ConversationError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Role::try_from(value.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = ConversationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::try_from(s)
    }
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Function => "function",
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FunctionCall {
    pub name: String,
    /// Arguments exactly as the model produced them, usually a JSON object.
    pub arguments: String,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatMessage {
    pub role: Role,

    /// Text of the message. `null` on the wire is read as an empty string.
    #[serde(default, deserialize_with = "de_nullable_string")]
    pub content: String,

    /// For function messages, the name of the function that produced the result.
    pub name: Option<String>,

    /// Set on assistant messages that invoked a function.
    pub function_call: Option<FunctionCall>,
}

impl ChatMessage {
    pub fn from_role_and_content(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            function_call: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::from_role_and_content(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::from_role_and_content(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::from_role_and_content(Role::Assistant, content)
    }

    pub fn function(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::from_role_and_content(Role::Function, content).with_name(name)
    }

    pub fn with_name<S>(mut self, name: S) -> Self
    where
        S: Into<String>,
    {
        self.name = Some(name.into());
        self
    }

    pub fn with_function_call(mut self, function_call: FunctionCall) -> Self {
        self.function_call = Some(function_call);
        self
    }
}

/// A function the model may call, described to it inside the system instructions.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    pub name_for_model: Option<String>,
    pub name_for_human: Option<String>,
    #[serde(default)]
    pub description: String,
    pub description_for_model: Option<String>,
    /// JSON schema of the arguments. Rendered verbatim.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl FunctionDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            name_for_model: None,
            name_for_human: None,
            description: description.into(),
            description_for_model: None,
            parameters,
        }
    }

    pub fn with_name_for_model(mut self, name: impl Into<String>) -> Self {
        self.name_for_model = Some(name.into());
        self
    }

    pub fn with_name_for_human(mut self, name: impl Into<String>) -> Self {
        self.name_for_human = Some(name.into());
        self
    }

    pub fn with_description_for_model(mut self, description: impl Into<String>) -> Self {
        self.description_for_model = Some(description.into());
        self
    }

    pub fn model_name(&self) -> &str {
        self.name_for_model.as_deref().unwrap_or(&self.name)
    }

    pub fn human_name(&self) -> &str {
        self.name_for_human.as_deref().unwrap_or(&self.name)
    }

    pub fn model_description(&self) -> &str {
        self.description_for_model
            .as_deref()
            .unwrap_or(&self.description)
    }
}

/// The render-path input of a single chat request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Conversation {
    pub messages: Vec<ChatMessage>,
    #[serde(default, deserialize_with = "de_nullable_vec")]
    pub functions: Vec<FunctionDefinition>,
}

impl Conversation {
    pub fn from_messages<I>(messages: I) -> Self
    where
        I: IntoIterator<Item = ChatMessage>,
    {
        Self {
            messages: messages.into_iter().collect(),
            functions: Vec::new(),
        }
    }

    pub fn with_functions<I>(mut self, functions: I) -> Self
    where
        I: IntoIterator<Item = FunctionDefinition>,
    {
        self.functions = functions.into_iter().collect();
        self
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }
}

impl<'a> IntoIterator for &'a Conversation {
    type Item = &'a ChatMessage;
    type IntoIter = std::slice::Iter<'a, ChatMessage>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    FunctionCall,
}

impl Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::FunctionCall => "function_call",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct UsageInfo {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl UsageInfo {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct DeltaMessage {
    pub role: Option<Role>,
    pub content: String,
    pub function_call: Option<FunctionCall>,
}

impl DeltaMessage {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// One incremental unit of a streaming chat response.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DeltaEvent {
    pub delta: DeltaMessage,
    pub finish_reason: Option<FinishReason>,
    pub usage: UsageInfo,
}

impl DeltaEvent {
    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some() && self.delta.function_call.is_none()
    }
}

fn de_nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn de_nullable_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
