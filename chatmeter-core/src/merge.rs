//! Folding streamed chunks into one chat completion.
//!
//! `merge_chunk` is a pure reducer: the assembled response after N chunks is the
//! same whether they are folded one at a time or all at once. Choices are matched
//! by their `index` field, never by position in the chunk.

use serde_json::Value;

use crate::model::{
    ChatCompletion, ChatCompletionChunk, Choice, Delta, FunctionCall, FunctionCallDelta, Message,
    ToolCall, ToolCallDelta,
};

/// Apply one chunk on top of the response assembled so far.
pub fn merge_chunk(acc: Option<ChatCompletion>, chunk: &ChatCompletionChunk) -> ChatCompletion {
    let mut merged = acc.unwrap_or_else(|| ChatCompletion {
        id: chunk.id.clone(),
        object: "chat.completion".to_string(),
        created: chunk.created,
        model: chunk.model.clone(),
        ..Default::default()
    });

    if merged.id.is_empty() {
        merged.id = chunk.id.clone();
    }
    if merged.model.is_empty() {
        merged.model = chunk.model.clone();
    }
    if chunk.usage.is_some() {
        merged.usage = chunk.usage;
    }
    if chunk.system_fingerprint.is_some() {
        merged.system_fingerprint = chunk.system_fingerprint.clone();
    }

    for choice in &chunk.choices {
        let slot = ensure_choice(&mut merged.choices, choice.index);
        apply_delta(&mut slot.message, &choice.delta);
        if let Some(reason) = &choice.finish_reason {
            slot.finish_reason = Some(reason.clone());
        }
        if let Some(logprobs) = &choice.logprobs {
            merge_logprobs(&mut slot.logprobs, logprobs);
        }
    }

    merged
}

/// Fold a whole chunk sequence. `None` when the sequence is empty.
pub fn merge_chunks<'a, I>(chunks: I) -> Option<ChatCompletion>
where
    I: IntoIterator<Item = &'a ChatCompletionChunk>,
{
    chunks
        .into_iter()
        .fold(None, |acc, chunk| Some(merge_chunk(acc, chunk)))
}

fn message_is_empty(message: &Message) -> bool {
    message.content.is_none() && message.function_call.is_none() && message.tool_calls.is_none()
}

fn ensure_choice(choices: &mut Vec<Choice>, index: u32) -> &mut Choice {
    let pos = match choices.binary_search_by_key(&index, |c| c.index) {
        Ok(pos) => pos,
        Err(pos) => {
            choices.insert(
                pos,
                Choice {
                    index,
                    ..Default::default()
                },
            );
            pos
        }
    };
    &mut choices[pos]
}

fn apply_delta(message: &mut Message, delta: &Delta) {
    // The role opens a message; one repeated after content has started is ignored.
    if let Some(role) = delta.role
        && message_is_empty(message)
    {
        message.role = role;
    }
    if let Some(content) = &delta.content {
        message
            .content
            .get_or_insert_with(String::new)
            .push_str(content);
    }
    if let Some(function_call) = &delta.function_call {
        merge_function_call(
            message.function_call.get_or_insert_with(FunctionCall::default),
            function_call,
        );
    }
    if let Some(tool_calls) = &delta.tool_calls {
        let calls = message.tool_calls.get_or_insert_with(Vec::new);
        for tool_call in tool_calls {
            merge_tool_call(calls, tool_call);
        }
    }
}

fn merge_function_call(entry: &mut FunctionCall, delta: &FunctionCallDelta) {
    if let Some(name) = &delta.name {
        entry.name.push_str(name);
    }
    if let Some(arguments) = &delta.arguments {
        entry.arguments.push_str(arguments);
    }
}

fn merge_tool_call(calls: &mut Vec<ToolCall>, delta: &ToolCallDelta) {
    let index = delta.index as usize;
    while calls.len() <= index {
        calls.push(ToolCall {
            id: String::new(),
            kind: "function".to_string(),
            function: FunctionCall::default(),
        });
    }
    let entry = &mut calls[index];
    if let Some(id) = &delta.id {
        entry.id = id.clone();
    }
    if let Some(kind) = &delta.kind {
        entry.kind = kind.clone();
    }
    if let Some(function) = &delta.function {
        merge_function_call(&mut entry.function, function);
    }
}

fn merge_logprobs(target: &mut Option<Value>, incoming: &Value) {
    let existing = target
        .as_mut()
        .and_then(|t| t.get_mut("content"))
        .and_then(Value::as_array_mut);
    let more = incoming.get("content").and_then(Value::as_array);
    if let (Some(existing), Some(more)) = (existing, more) {
        existing.extend(more.iter().cloned());
        return;
    }
    *target = Some(incoming.clone());
}
