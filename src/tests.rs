use std::{collections::HashMap, sync::Arc};

use crate::{
    chat::{
        ChatMessage, Conversation, DeltaEvent, DeltaMessage, FinishReason, FunctionCall,
        FunctionDefinition, Role, UsageInfo,
    },
    load_qwen_encoding_with_tokenizer,
    stream::StreamPhase,
    tiktoken_ext::public_encodings::QWEN_PATTERN,
    tokenizer::{tests::byte_level_tokenizer, QwenTokenizer, Rank},
    ConversationError, GenerationStep, HistoryTurn, Query, QwenEncoding, QwenEncodingName,
    RenderConversationConfig, StreamingAssembler,
};
use pretty_assertions::assert_eq;
use serde_json::json;

const IM_START: Rank = 257;
const IM_END: Rank = 258;

const REACT_PROMPT_ZH: &str = r#"<|im_start|>system
You are a helpful assistant.<|im_end|>
<|im_start|>user
Answer the following questions as best you can. You have access to the following APIs:

get_current_weather: Call this tool to interact with the get_current_weather API. What is the get_current_weather API useful for? Get the current weather in a given location. Parameters: {"type": "object", "properties": {"location": {"type": "string", "description": "The city and state, e.g. San Francisco, CA"}, "unit": {"type": "string", "enum": ["celsius", "fahrenheit"]}}, "required": ["location"]}

Use the following format:

Question: the input question you must answer
Thought: you should always think about what to do
Action: the action to take, should be one of [get_current_weather]
Action Input: the input to the action
Observation: the result of the action
... (this Thought/Action/Action Input/Observation can be repeated zero or more times)
Thought: I now know the final answer
Final Answer: the final answer to the original input question

Begin!

Question: 波士顿天气如何？<|im_end|>
<|im_start|>assistant
"#;

const REACT_OBSERVATION_ZH: &str = r#"Thought: 我可以使用 get_current_weather API。
Action: get_current_weather
Action Input: {"location": "Boston, MA"}
Observation: {"temperature": "22", "unit": "celsius", "description": "Sunny"}
Thought:"#;

fn encoding() -> QwenEncoding {
    load_qwen_encoding_with_tokenizer(QwenEncodingName::QwenChat, Arc::new(byte_level_tokenizer()))
        .unwrap()
}

fn weather_function() -> FunctionDefinition {
    FunctionDefinition::new(
        "get_current_weather",
        "Get the current weather in a given location.",
        json!({
            "type": "object",
            "properties": {
                "location": {
                    "type": "string",
                    "description": "The city and state, e.g. San Francisco, CA",
                },
                "unit": {"type": "string", "enum": ["celsius", "fahrenheit"]},
            },
            "required": ["location"],
        }),
    )
}

fn conversation_error(err: anyhow::Error) -> ConversationError {
    err.downcast_ref::<ConversationError>()
        .cloned()
        .unwrap_or_else(|| panic!("expected a conversation error, got {err:?}"))
}

/// Feeds each chunk as one generation step, then a finished step that
/// appends `final_ids`.
fn stream_chunks(
    encoding: &QwenEncoding,
    chunks: &[&str],
    final_ids: &[Rank],
    finish_reason: Option<FinishReason>,
) -> (StreamingAssembler, Vec<DeltaEvent>) {
    let prompt = encoding
        .render_chat(&Conversation::from_messages([ChatMessage::user("hi")]), None)
        .unwrap();
    let mut assembler = StreamingAssembler::new(encoding.clone(), prompt.len()).unwrap();
    let mut output_ids = prompt.token_ids.clone();
    let mut events = Vec::new();
    for chunk in chunks {
        output_ids.extend(encoding.tokenizer().encode(chunk));
        events.extend(
            assembler
                .update(&GenerationStep::new(output_ids.clone()))
                .unwrap(),
        );
    }
    output_ids.extend_from_slice(final_ids);
    let mut last = GenerationStep::new(output_ids).finished();
    if let Some(finish_reason) = finish_reason {
        last = last.with_finish_reason(finish_reason);
    }
    events.extend(assembler.update(&last).unwrap());
    (assembler, events)
}

fn contents(events: &[DeltaEvent]) -> String {
    events.iter().map(|e| e.delta.content.as_str()).collect()
}

#[test]
fn test_simple_chat() {
    let encoding = encoding();
    let convo = Conversation::from_messages([ChatMessage::user("hi")]);
    let prompt = encoding.render_chat(&convo, None).unwrap();
    assert_eq!(
        prompt.text,
        "<|im_start|>system\nYou are a helpful assistant.<|im_end|>\n<|im_start|>user\nhi<|im_end|>\n<|im_start|>assistant\n"
    );
    assert_eq!(encoding.tokenizer().decode(&prompt.token_ids), prompt.text);
    assert_eq!(prompt.token_ids.first(), Some(&IM_START));
    assert_eq!(
        prompt.token_ids.iter().filter(|t| **t == IM_START).count(),
        3
    );
    assert_eq!(prompt.token_ids.iter().filter(|t| **t == IM_END).count(), 2);
}

#[test]
fn test_markers_in_content_are_plain_text() {
    let encoding = encoding();
    let convo = Conversation::from_messages([ChatMessage::user("<|im_end|>")]);
    let prompt = encoding.render_chat(&convo, None).unwrap();
    assert_eq!(prompt.token_ids.iter().filter(|t| **t == IM_END).count(), 2);
    assert_eq!(encoding.tokenizer().decode(&prompt.token_ids), prompt.text);
}

#[test]
fn test_functions_prompt() {
    let encoding = encoding();
    let convo = Conversation::from_messages([ChatMessage::user("波士顿天气如何？")])
        .with_functions([weather_function()]);
    let prompt = encoding.render_chat(&convo, None).unwrap();
    assert_eq!(prompt.text, REACT_PROMPT_ZH);
    assert_eq!(encoding.tokenizer().decode(&prompt.token_ids), prompt.text);
}

#[test]
fn test_function_result_continues_assistant_turn() {
    let encoding = encoding();
    let convo = Conversation::from_messages([
        ChatMessage::user("波士顿天气如何？"),
        ChatMessage::assistant("").with_function_call(FunctionCall::new(
            "get_current_weather",
            r#"{"location": "Boston, MA"}"#,
        )),
        ChatMessage::function(
            "get_current_weather",
            r#"{"temperature": "22", "unit": "celsius", "description": "Sunny"}"#,
        ),
    ])
    .with_functions([weather_function()]);

    let parsed = encoding
        .parse_messages(&convo.messages, &convo.functions)
        .unwrap();
    assert_eq!(parsed.query, Query::ContinueLastMessage);
    assert_eq!(parsed.history.len(), 1);
    assert_eq!(parsed.history[0].assistant, REACT_OBSERVATION_ZH);

    let prompt = encoding.render_chat(&convo, None).unwrap();
    assert_eq!(prompt.text, format!("{REACT_PROMPT_ZH}{REACT_OBSERVATION_ZH}"));
    assert_ne!(prompt.token_ids.last(), Some(&IM_END));
    assert_eq!(encoding.tokenizer().decode(&prompt.token_ids), prompt.text);
}

#[test]
fn test_final_answer_after_observation_joins_assistant_turn() {
    let encoding = encoding();
    let convo = Conversation::from_messages([
        ChatMessage::user("What's the weather in Boston?"),
        ChatMessage::assistant("").with_function_call(FunctionCall::new(
            "get_current_weather",
            r#"{"location": "Boston"}"#,
        )),
        ChatMessage::function("get_current_weather", r#"{"temp": "22"}"#),
        ChatMessage::assistant("It is 22."),
        ChatMessage::user("Thanks!"),
    ])
    .with_functions([weather_function()]);

    let parsed = encoding
        .parse_messages(&convo.messages, &convo.functions)
        .unwrap();
    let assistant = "Thought: I can use get_current_weather.\nAction: get_current_weather\nAction Input: {\"location\": \"Boston\"}\nObservation: {\"temp\": \"22\"}\nThought: I now know the final answer.\nFinal answer: It is 22.";
    assert_eq!(parsed.history.len(), 1);
    assert_eq!(parsed.history[0].assistant, assistant);
    assert!(parsed.history[0]
        .user
        .ends_with("\n\nQuestion: What's the weather in Boston?"));
    assert_eq!(parsed.query, Query::Text("Thanks!".to_string()));

    let prompt = encoding.render_chat(&convo, None).unwrap();
    assert!(prompt.text.ends_with(&format!(
        "<|im_start|>assistant\n{assistant}<|im_end|>\n<|im_start|>user\nThanks!<|im_end|>\n<|im_start|>assistant\n"
    )));
}

#[test]
fn test_tool_alias_and_null_content_from_json() {
    let encoding = encoding();
    let convo: Conversation = serde_json::from_value(json!({
        "messages": [
            {"role": "user", "content": "What's the weather in Boston?"},
            {
                "role": "assistant",
                "content": null,
                "function_call": {"name": "get_current_weather", "arguments": "{\"location\": \"Boston\"}"}
            },
            {"role": "tool", "name": "get_current_weather", "content": "sunny"}
        ],
        "functions": [{"name": "get_current_weather", "description": "Weather lookup."}]
    }))
    .unwrap();
    let parsed = encoding
        .parse_messages(&convo.messages, &convo.functions)
        .unwrap();
    assert_eq!(
        parsed.history[0].assistant,
        "Thought: I can use get_current_weather.\nAction: get_current_weather\nAction Input: {\"location\": \"Boston\"}\nObservation: sunny\nThought:"
    );
}

#[test]
fn test_dummy_thought_prepended_to_plain_answers() {
    let encoding = encoding();
    let convo = Conversation::from_messages([
        ChatMessage::user("What is 2 + 2?"),
        ChatMessage::assistant("4"),
        ChatMessage::user("And 3 + 3?"),
    ])
    .with_functions([weather_function()]);
    let parsed = encoding
        .parse_messages(&convo.messages, &convo.functions)
        .unwrap();
    assert_eq!(
        parsed.history[0].assistant,
        "Thought: I now know the final answer.\nFinal answer: 4"
    );
    assert_eq!(parsed.query, Query::Text("And 3 + 3?".to_string()));
    assert!(parsed.history[0]
        .user
        .starts_with("Answer the following questions as best you can."));
    assert!(parsed.history[0].user.ends_with("\n\nQuestion: What is 2 + 2?"));

    // without functions the answer is kept as is
    let parsed = encoding
        .parse_messages(&convo.messages, &[])
        .unwrap();
    assert_eq!(parsed.history[0].assistant, "4");
    assert_eq!(parsed.history[0].user, "What is 2 + 2?");
}

#[test]
fn test_dummy_thought_stripped_before_actions() {
    let encoding = encoding();
    let convo = Conversation::from_messages([
        ChatMessage::user("Look something up."),
        ChatMessage::assistant("Checking."),
        ChatMessage::assistant("").with_function_call(FunctionCall::new("search", "{}")),
        ChatMessage::function("search", "nothing found"),
        ChatMessage::user("ok"),
    ])
    .with_functions([FunctionDefinition::new("search", "Search the web.", json!({}))]);
    let parsed = encoding
        .parse_messages(&convo.messages, &convo.functions)
        .unwrap();
    assert_eq!(
        parsed.history,
        vec![HistoryTurn::new(
            parsed.history[0].user.clone(),
            "Checking.\nThought: I can use search.\nAction: search\nAction Input: {}\nObservation: nothing found",
        )]
    );
    assert_eq!(parsed.query, Query::Text("ok".to_string()));
}

#[test]
fn test_system_message_prefixes_query() {
    let encoding = encoding();
    let convo = Conversation::from_messages([
        ChatMessage::system("Answer in one word."),
        ChatMessage::user("hi"),
    ]);
    let parsed = encoding
        .parse_messages(&convo.messages, &convo.functions)
        .unwrap();
    assert_eq!(
        parsed.query,
        Query::Text("Answer in one word.\n\nQuestion: hi".to_string())
    );
    assert_eq!(parsed.system, "You are a helpful assistant.");

    let prompt = encoding.render_chat(&convo, None).unwrap();
    assert_eq!(
        prompt.text,
        "<|im_start|>system\nYou are a helpful assistant.<|im_end|>\n<|im_start|>user\nAnswer in one word.\n\nQuestion: hi<|im_end|>\n<|im_start|>assistant\n"
    );
}

#[test]
fn test_default_system_message_is_not_repeated() {
    let encoding = encoding();
    let with_system = Conversation::from_messages([
        ChatMessage::system("You are a helpful assistant."),
        ChatMessage::user("hi"),
    ]);
    let without_system = Conversation::from_messages([ChatMessage::user("hi")]);
    assert_eq!(
        encoding.render_chat(&with_system, None).unwrap(),
        encoding.render_chat(&without_system, None).unwrap()
    );
}

#[test]
fn test_system_message_prefixes_last_history_turn() {
    let encoding = encoding();
    let convo = Conversation::from_messages([
        ChatMessage::system("Be terse."),
        ChatMessage::user("a"),
        ChatMessage::assistant("b"),
        ChatMessage::user("c"),
        ChatMessage::assistant("d"),
        ChatMessage::user("e"),
    ]);
    let parsed = encoding
        .parse_messages(&convo.messages, &convo.functions)
        .unwrap();
    assert_eq!(
        parsed.history,
        vec![
            HistoryTurn::new("a", "b"),
            HistoryTurn::new("Be terse.\n\nQuestion: c", "d"),
        ]
    );
    assert_eq!(parsed.query, Query::Text("e".to_string()));
}

#[test]
fn test_conversation_errors() {
    let encoding = encoding();
    let cases = [
        (
            vec![ChatMessage::system("s"), ChatMessage::assistant("a")],
            ConversationError::MalformedConversation(
                "At least one message must be from user.".to_string(),
            ),
        ),
        (
            vec![ChatMessage::assistant("partial answer")],
            ConversationError::MalformedConversation(
                "At least one message must be from user.".to_string(),
            ),
        ),
        (
            vec![ChatMessage::user("q"), ChatMessage::function("f", "r")],
            ConversationError::InvalidRole(
                "Expecting role assistant before role function.".to_string(),
            ),
        ),
        (
            vec![ChatMessage::assistant("a"), ChatMessage::user("q")],
            ConversationError::InvalidRole(
                "Expecting role user before role assistant.".to_string(),
            ),
        ),
        (
            vec![
                ChatMessage::user("q1"),
                ChatMessage::user("q2"),
                ChatMessage::assistant("a"),
            ],
            ConversationError::InvalidRole(
                "Expecting exactly one user (or function) role before every assistant role."
                    .to_string(),
            ),
        ),
    ];
    for (messages, expected) in cases {
        let err = encoding.parse_messages(&messages, &[]).unwrap_err();
        assert_eq!(err, expected);
        let err = encoding
            .render_chat(&Conversation::from_messages(messages), None)
            .unwrap_err();
        assert_eq!(conversation_error(err), expected);
    }

    let late_system = [ChatMessage::user("q"), ChatMessage::system("s")];
    assert!(matches!(
        encoding.parse_messages(&late_system, &[]),
        Err(ConversationError::InvalidRole(_))
    ));

    let unknown_role = serde_json::from_value::<ChatMessage>(json!({"role": "critic", "content": "x"}));
    assert!(unknown_role.is_err());
}

#[test]
fn test_history_truncation_is_strict() {
    let encoding = encoding();
    let history = [HistoryTurn::new("q1", "a1"), HistoryTurn::new("q2", "a2")];
    let system = encoding.default_system();

    // byte-level tokens: system turn 37, each history turn 25, query turn 22
    let full = encoding.render("q3", &history, system, 6144).unwrap();
    assert_eq!(full.len(), 37 + 25 + 25 + 22);
    assert!(full.text.contains("q1"));

    let exact = encoding.render("q3", &history, system, 37 + 25 + 25).unwrap();
    assert!(!exact.text.contains("q1"));
    assert!(exact.text.contains("q2"));
    assert_eq!(exact.len(), 37 + 25 + 22);

    let roomy = encoding
        .render("q3", &history, system, 37 + 25 + 25 + 1)
        .unwrap();
    assert_eq!(roomy, full);

    let tiny = encoding.render("q3", &history, system, 0).unwrap();
    assert_eq!(
        tiny.text,
        "<|im_start|>system\nYou are a helpful assistant.<|im_end|>\n<|im_start|>user\nq3<|im_end|>\n<|im_start|>assistant\n"
    );
}

#[test]
fn test_render_chat_uses_configured_window() {
    let encoding = encoding();
    let convo = Conversation::from_messages([
        ChatMessage::user("q1"),
        ChatMessage::assistant("a1"),
        ChatMessage::user("q2"),
    ]);
    let config = RenderConversationConfig { max_window_size: 10 };
    let prompt = encoding.render_chat(&convo, Some(&config)).unwrap();
    assert!(!prompt.text.contains("a1"));
    assert!(encoding
        .render_chat(&convo, None)
        .unwrap()
        .text
        .contains("a1"));
}

#[test]
fn test_empty_system_renders_empty_turn() {
    let encoding = encoding();
    let prompt = encoding.render("hi", &[], "", 6144).unwrap();
    assert_eq!(
        prompt.text,
        "<|im_start|>system\n<|im_end|>\n<|im_start|>user\nhi<|im_end|>\n<|im_start|>assistant\n"
    );
}

#[test]
fn test_continuation_leaves_assistant_turn_open() {
    let encoding = encoding();
    let convo = Conversation::from_messages([
        ChatMessage::user("Tell me a story"),
        ChatMessage::assistant("Once upon a"),
    ]);
    let prompt = encoding.render_chat(&convo, None).unwrap();
    assert_eq!(
        prompt.text,
        "<|im_start|>system\nYou are a helpful assistant.<|im_end|>\n<|im_start|>user\nTell me a story<|im_end|>\n<|im_start|>assistant\nOnce upon a"
    );
    assert_eq!(
        prompt.token_ids.last().copied(),
        encoding.tokenizer().encode("a").last().copied()
    );
    assert_eq!(encoding.tokenizer().decode(&prompt.token_ids), prompt.text);

    let direct = encoding
        .render_continuation(&[HistoryTurn::new("\nTell me a story ", "Once upon a\n")])
        .unwrap();
    assert_eq!(direct, prompt);
}

#[test]
fn test_parse_function_call() {
    let encoding = encoding();
    let cases = [
        (
            "Let me check.\nAction: get_weather\nAction Input: {\"city\": \"Boston\"}",
            Some(DeltaMessage {
                role: None,
                content: "Let me check.".to_string(),
                function_call: Some(FunctionCall::new("get_weather", "{\"city\": \"Boston\"}")),
            }),
        ),
        (
            "\nAction: search\nAction Input: rust\nObservation: results",
            Some(DeltaMessage {
                role: None,
                content: String::new(),
                function_call: Some(FunctionCall::new("search", "rust")),
            }),
        ),
        ("Let me check.\nAction: get_weather", None),
        ("\nAction Input: {}\nAction: get_weather", None),
        ("\nAction: \nAction Input: {}", None),
        ("no tools here", None),
    ];
    for (text, expected) in cases {
        assert_eq!(encoding.parse_function_call(text), expected, "{text:?}");
    }
}

#[test]
fn test_folded_function_call_parses_back() {
    let encoding = encoding();
    let call = FunctionCall::new("get_current_weather", r#"{"location": "Boston, MA"}"#);
    let convo = Conversation::from_messages([
        ChatMessage::user("What's the weather in Boston?"),
        ChatMessage::assistant("I should look it up.").with_function_call(call.clone()),
        ChatMessage::function("get_current_weather", "sunny"),
    ])
    .with_functions([weather_function()]);
    let parsed = encoding
        .parse_messages(&convo.messages, &convo.functions)
        .unwrap();
    let delta = encoding
        .parse_function_call(&parsed.history[0].assistant)
        .unwrap();
    assert_eq!(delta.function_call, Some(call));
    assert_eq!(delta.content, "I should look it up.");
}

#[test]
fn test_stream_plain_text() {
    let encoding = encoding();
    let (assembler, events) = stream_chunks(
        &encoding,
        &["Hello", ", world", "! How are you?"],
        &[IM_END],
        None,
    );
    assert_eq!(
        events.iter().map(|e| e.delta.content.as_str()).collect::<Vec<_>>(),
        vec!["", "Hell", "o, world! How ", "are you?", ""]
    );
    assert_eq!(events[0].delta.role, Some(Role::Assistant));
    assert!(events[1..].iter().all(|e| e.delta.role.is_none()));
    assert_eq!(events[0].usage.completion_tokens, 0);

    let last = events.last().unwrap();
    assert!(last.is_terminal());
    assert_eq!(last.finish_reason, Some(FinishReason::Stop));
    let prompt_tokens = last.usage.prompt_tokens;
    assert_eq!(last.usage, UsageInfo::new(prompt_tokens, 26));
    assert!(events[..events.len() - 1]
        .iter()
        .all(|e| e.finish_reason.is_none()));
    assert_eq!(assembler.phase(), StreamPhase::Done);
    assert_eq!(assembler.state().responded_length, "Hello, world! How are you?".len());
}

#[test]
fn test_stream_function_call() {
    let encoding = encoding();
    let (assembler, events) = stream_chunks(
        &encoding,
        &[
            "Thought: I can",
            " use get_weather.",
            "\nAction:",
            " get_weather",
            "\nAction Input: {\"city\": \"Boston\"}",
            "\nObservation:",
        ],
        &[],
        None,
    );
    assert!(events.iter().all(|e| !e.delta.content.contains("Action")));
    assert_eq!(contents(&events), "Thought: I can use get_weather.");

    let calls: Vec<_> = events
        .iter()
        .filter_map(|e| e.delta.function_call.clone())
        .collect();
    assert_eq!(
        calls,
        vec![FunctionCall::new("get_weather", "{\"city\": \"Boston\"}")]
    );
    let last = events.last().unwrap();
    assert_eq!(last.finish_reason, Some(FinishReason::FunctionCall));
    assert_eq!(last.delta.content, "");
    assert!(assembler.state().generating_function_call);
    assert!(!assembler.recovered_from_malformed_call());
}

#[test]
fn test_stream_malformed_function_call_is_delivered_as_text() {
    let encoding = encoding();
    let (assembler, events) = stream_chunks(
        &encoding,
        &["Let me think.", "\nAction:", " search", "\nNothing else"],
        &[IM_END],
        None,
    );
    assert_eq!(
        contents(&events),
        "Let me think.\nAction: search\nNothing else"
    );
    assert!(events.iter().all(|e| e.delta.function_call.is_none()));
    assert_eq!(events.last().unwrap().finish_reason, Some(FinishReason::Stop));
    assert!(assembler.recovered_from_malformed_call());
}

#[test]
fn test_stream_finish_reason_hint_and_default() {
    let encoding = encoding();
    let (_, events) = stream_chunks(
        &encoding,
        &["The answer is"],
        &[],
        Some(FinishReason::Length),
    );
    assert_eq!(contents(&events), "The answer is");
    assert_eq!(events.last().unwrap().finish_reason, Some(FinishReason::Length));

    let (_, events) = stream_chunks(&encoding, &["The answer is"], &[], None);
    assert_eq!(events.last().unwrap().finish_reason, Some(FinishReason::Stop));
}

#[test]
fn test_stream_strips_stop_words() {
    let encoding = encoding();
    let (_, events) = stream_chunks(
        &encoding,
        &["The result is 42.", "\nObservation:"],
        &[],
        None,
    );
    assert_eq!(contents(&events), "The result is 42.");
    assert_eq!(events.last().unwrap().finish_reason, Some(FinishReason::Stop));
}

#[test]
fn test_stream_split_stop_word_exceeds_hold_back() {
    let encoding = encoding();
    let (assembler, events) = stream_chunks(
        &encoding,
        &["Result is 42.", "\nObservati", "on:"],
        &[],
        None,
    );
    assert_eq!(assembler.state().output_string, "Result is 42.");
    // only 8 characters are held back, so "\nO" was already delivered
    assert_eq!(contents(&events), "Result is 42.\nO");
    assert_eq!(events.last().unwrap().finish_reason, Some(FinishReason::Stop));
}

#[test]
fn test_stream_partial_utf8() {
    let encoding = encoding();
    let text = "你好，世界！今天天气很好。";
    // feed the raw byte ids one by one so most steps end inside a character
    let prompt_tokens = 4;
    let mut assembler = StreamingAssembler::new(encoding.clone(), prompt_tokens).unwrap();
    let mut output_ids: Vec<Rank> = vec![IM_START, 1, 2, 3];
    let mut events = Vec::new();
    for b in text.as_bytes() {
        output_ids.push(Rank::from(*b));
        events.extend(
            assembler
                .update(&GenerationStep::new(output_ids.clone()))
                .unwrap(),
        );
    }
    events.extend(assembler.finish().unwrap());
    assert!(events.iter().all(|e| !e.delta.content.contains('\u{FFFD}')));
    assert_eq!(contents(&events), text);
    assert_eq!(events.last().unwrap().usage.completion_tokens, text.len());
}

#[test]
fn test_stream_rejects_updates_after_done() {
    let encoding = encoding();
    let (mut assembler, _) = stream_chunks(&encoding, &["done"], &[IM_END], None);
    assert!(assembler.is_done());
    assert!(assembler.update(&GenerationStep::new(vec![])).is_err());
    assert!(assembler.finish().is_err());
}

#[test]
fn test_event_stream_adapter() {
    use futures::StreamExt as _;

    let encoding = encoding();
    let prompt = vec![IM_START, 10];
    let mut steps = Vec::new();
    let mut output_ids = prompt.clone();
    for chunk in ["The weather ", "in Boston ", "is sunny."] {
        output_ids.extend(encoding.tokenizer().encode(chunk));
        steps.push(GenerationStep::new(output_ids.clone()));
    }
    let assembler = StreamingAssembler::new(encoding, prompt.len()).unwrap();
    let events: Vec<DeltaEvent> = futures::executor::block_on(
        assembler
            .into_event_stream(futures::stream::iter(steps))
            .collect::<Vec<_>>(),
    )
    .into_iter()
    .collect::<anyhow::Result<_>>()
    .unwrap();
    assert_eq!(events[0].delta.role, Some(Role::Assistant));
    assert_eq!(contents(&events), "The weather in Boston is sunny.");
    assert_eq!(events.last().unwrap().finish_reason, Some(FinishReason::Stop));
    assert_eq!(events.iter().filter(|e| e.finish_reason.is_some()).count(), 1);
}

#[test]
fn test_encoding_requires_chatml_markers() {
    let encoder: HashMap<Vec<u8>, Rank> = (0..=255u8).map(|b| (vec![b], b as Rank)).collect();
    let tokenizer = QwenTokenizer::new(encoder, HashMap::new(), QWEN_PATTERN).unwrap();
    assert!(
        load_qwen_encoding_with_tokenizer(QwenEncodingName::QwenChat, Arc::new(tokenizer))
            .is_err()
    );
}

#[test]
fn test_encoding_name_round_trip() {
    let name: QwenEncodingName = "QwenChat".parse().unwrap();
    assert_eq!(name, QwenEncodingName::QwenChat);
    assert_eq!(name.to_string(), "QwenChat");
    assert!("Qwen2Chat".parse::<QwenEncodingName>().is_err());
    assert_eq!(encoding().to_string(), "Renderer(QwenChat)");
}
