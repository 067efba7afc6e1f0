use std::collections::{HashSet, VecDeque};

use futures::{Stream, StreamExt as _};

use crate::{
    chat::{DeltaEvent, DeltaMessage, FinishReason, Role, UsageInfo},
    encoding::{QwenEncoding, ACTION_MARKER},
    tokenizer::Rank,
};

const FUNCTION_CALL_PARSE_FAILURES: &str = "qwen_react_function_call_parse_failures_total";

/// One scheduling step of the generation loop.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GenerationStep {
    /// Every token id produced so far, prompt included.
    pub output_ids: Vec<Rank>,
    pub finished: bool,
    /// Set by the generation loop when it knows why generation ended, e.g.
    /// [`FinishReason::Length`] when the token limit was reached.
    pub finish_reason: Option<FinishReason>,
}

impl GenerationStep {
    pub fn new(output_ids: Vec<Rank>) -> Self {
        Self {
            output_ids,
            finished: false,
            finish_reason: None,
        }
    }

    pub fn finished(mut self) -> Self {
        self.finished = true;
        self
    }

    pub fn with_finish_reason(mut self, finish_reason: FinishReason) -> Self {
        self.finish_reason = Some(finish_reason);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Streaming,
    BufferingFunctionCall,
    Done,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamState {
    /// Decoded completion without stop tokens and stop words.
    pub output_string: String,
    /// Byte length of the prefix of `output_string` already delivered.
    pub responded_length: usize,
    pub generating_function_call: bool,
    pub finish_reason: Option<FinishReason>,
}

struct ProcessedOutput {
    output_str: String,
    output_token_length: usize,
    finish_reason: Option<FinishReason>,
}

/// Turns the steps of one generation into chat completion delta events.
///
/// The last `len("\nAction:")` characters are always held back so that a
/// function call marker is never partially shown. Once the output ends with
/// the marker, everything after the delivered prefix is buffered until the
/// end of generation and then parsed as a function call.
///
/// The hold-back is shorter than the `"\nObservation:"` stop word, so the
/// start of a stop word split across steps (e.g. `"\nO"`) can be delivered
/// before the full word appears and is cut from the output.
pub struct StreamingAssembler {
    encoding: QwenEncoding,
    prompt_tokens: usize,
    stop_tokens: HashSet<Rank>,
    stop_word_ids: Vec<Vec<Rank>>,
    phase: StreamPhase,
    state: StreamState,
    completion_tokens: usize,
    recovered_from_malformed_call: bool,
}

impl StreamingAssembler {
    /// Create an assembler for a prompt of `prompt_tokens` tokens.
    pub fn new(encoding: QwenEncoding, prompt_tokens: usize) -> anyhow::Result<Self> {
        let stop_tokens = encoding.stop_tokens()?;
        let stop_word_ids = encoding.stop_word_ids();
        Ok(Self {
            encoding,
            prompt_tokens,
            stop_tokens,
            stop_word_ids,
            phase: StreamPhase::Idle,
            state: StreamState::default(),
            completion_tokens: 0,
            recovered_from_malformed_call: false,
        })
    }

    /// Consume a generation step and return the events it produces. A
    /// finished step also produces the terminal events.
    pub fn update(&mut self, step: &GenerationStep) -> anyhow::Result<Vec<DeltaEvent>> {
        anyhow::ensure!(
            self.phase != StreamPhase::Done,
            "received a generation step after the stream finished"
        );
        let mut events = Vec::new();
        if self.phase == StreamPhase::Idle {
            events.push(self.event(
                DeltaMessage {
                    role: Some(Role::Assistant),
                    ..Default::default()
                },
                None,
            ));
            self.phase = StreamPhase::Streaming;
        }

        let processed = self.process_output_ids(step);
        self.completion_tokens = processed.output_token_length;
        self.state.output_string = processed.output_str;
        self.state.responded_length =
            floor_char_boundary(&self.state.output_string, self.state.responded_length);
        if step.finished {
            self.state.finish_reason = processed.finish_reason;
        }

        if self.state.output_string.trim_end().ends_with(ACTION_MARKER) {
            self.state.generating_function_call = true;
            self.phase = StreamPhase::BufferingFunctionCall;
        } else if !self.state.generating_function_call {
            let lookahead = ACTION_MARKER.chars().count();
            let boundary = lookahead_boundary(&self.state.output_string, lookahead);
            if let Some(boundary) = boundary.filter(|b| *b > self.state.responded_length) {
                let delta = self.state.output_string[self.state.responded_length..boundary].to_string();
                self.state.responded_length = boundary;
                events.push(self.event(DeltaMessage::content(delta), None));
            }
        }

        if step.finished {
            events.extend(self.finish_stream());
        }
        Ok(events)
    }

    /// End the stream without a finished step, e.g. because the generation
    /// loop ran out of steps.
    pub fn finish(&mut self) -> anyhow::Result<Vec<DeltaEvent>> {
        anyhow::ensure!(
            self.phase != StreamPhase::Done,
            "the stream already finished"
        );
        Ok(self.finish_stream())
    }

    fn finish_stream(&mut self) -> Vec<DeltaEvent> {
        let mut events = Vec::new();
        if self.state.generating_function_call {
            let unflushed = self
                .state
                .output_string
                .get(self.state.responded_length..)
                .unwrap_or_default();
            match self.encoding.parse_function_call(unflushed) {
                Some(delta) => {
                    self.state.finish_reason = Some(FinishReason::FunctionCall);
                    self.state.responded_length = self.state.output_string.len();
                    events.push(self.event(delta, Some(FinishReason::FunctionCall)));
                }
                None => {
                    tracing::warn!(
                        output = %self.state.output_string,
                        "failed to parse function call, regarded as normal output"
                    );
                    metrics::counter!(FUNCTION_CALL_PARSE_FAILURES).increment(1);
                    self.recovered_from_malformed_call = true;
                }
            }
        }

        let finish_reason = match self.state.finish_reason {
            Some(reason) => reason,
            None => {
                tracing::debug!(
                    output = %self.state.output_string,
                    "found no finish reason, using stop"
                );
                FinishReason::Stop
            }
        };
        self.state.finish_reason = Some(finish_reason);

        if self.state.responded_length < self.state.output_string.len() {
            let rest = self.state.output_string[self.state.responded_length..].to_string();
            self.state.responded_length = self.state.output_string.len();
            events.push(self.event(DeltaMessage::content(rest), None));
        }

        events.push(self.event(DeltaMessage::content(""), Some(finish_reason)));
        self.phase = StreamPhase::Done;
        events
    }

    fn process_output_ids(&self, step: &GenerationStep) -> ProcessedOutput {
        let completion = step
            .output_ids
            .get(self.prompt_tokens..)
            .unwrap_or_default();
        let mut saw_stop = completion.iter().any(|id| self.stop_tokens.contains(id));
        let mut output_ids: Vec<Rank> = completion
            .iter()
            .copied()
            .filter(|id| !self.stop_tokens.contains(id))
            .collect();
        let output_token_length = output_ids.len();
        saw_stop |= self.remove_stop_word_ids(&mut output_ids);

        let decoded = self.encoding.tokenizer().decode(&output_ids);
        let mut output_str = decoded.trim_matches('\u{FFFD}').to_string();
        for stop_word in self.encoding.stop_words() {
            if output_str.contains(stop_word.as_str()) {
                saw_stop = true;
                output_str = output_str.replace(stop_word.as_str(), "");
            }
        }

        let finish_reason = if step.finished {
            step.finish_reason
                .or_else(|| saw_stop.then_some(FinishReason::Stop))
        } else {
            None
        };
        ProcessedOutput {
            output_str: output_str.trim().to_string(),
            output_token_length,
            finish_reason,
        }
    }

    /// Cut a stop word sequence off the end of `output_ids`.
    fn remove_stop_word_ids(&self, output_ids: &mut Vec<Rank>) -> bool {
        for stop_word in &self.stop_word_ids {
            if output_ids.ends_with(stop_word) {
                output_ids.truncate(output_ids.len() - stop_word.len());
                return true;
            }
        }
        false
    }

    fn event(&self, delta: DeltaMessage, finish_reason: Option<FinishReason>) -> DeltaEvent {
        DeltaEvent {
            delta,
            finish_reason,
            usage: self.usage(),
        }
    }

    pub fn usage(&self) -> UsageInfo {
        UsageInfo::new(self.prompt_tokens, self.completion_tokens)
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == StreamPhase::Done
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    /// True when buffered function call text could not be parsed and was
    /// delivered as ordinary content instead.
    pub fn recovered_from_malformed_call(&self) -> bool {
        self.recovered_from_malformed_call
    }

    /// Drive the assembler from a stream of generation steps. The terminal
    /// events are produced when a finished step arrives or the step stream
    /// ends, whichever comes first.
    pub fn into_event_stream<S>(self, steps: S) -> impl Stream<Item = anyhow::Result<DeltaEvent>>
    where
        S: Stream<Item = GenerationStep> + Unpin,
    {
        futures::stream::unfold(
            (self, steps, VecDeque::new()),
            |(mut assembler, mut steps, mut pending)| async move {
                loop {
                    if let Some(event) = pending.pop_front() {
                        return Some((Ok(event), (assembler, steps, pending)));
                    }
                    if assembler.is_done() {
                        return None;
                    }
                    let events = match steps.next().await {
                        Some(step) => assembler.update(&step),
                        None => assembler.finish(),
                    };
                    match events {
                        Ok(events) => pending.extend(events),
                        Err(e) => {
                            assembler.phase = StreamPhase::Done;
                            return Some((Err(e), (assembler, steps, pending)));
                        }
                    }
                }
            },
        )
    }
}

impl std::fmt::Debug for StreamingAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingAssembler")
            .field("encoding", &self.encoding.name())
            .field("prompt_tokens", &self.prompt_tokens)
            .field("phase", &self.phase)
            .field("state", &self.state)
            .finish()
    }
}

/// Byte index at which the last `n` characters of `s` start, or `None` if
/// `s` is shorter than `n` characters.
fn lookahead_boundary(s: &str, n: usize) -> Option<usize> {
    if n == 0 {
        return Some(s.len());
    }
    s.char_indices().rev().nth(n - 1).map(|(i, _)| i)
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut index = index.min(s.len());
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
