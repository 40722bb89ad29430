//! Chat transcript assembly.
//!
//! Messages are kept in arrival order and indexed by id, so streamed chunks
//! land on their message without a scan. A message accepts appends only
//! while `is_streaming` is set; the `done` chunk freezes it.

use std::collections::HashMap;

use taskpilot_protocol::server::{ChatRequest, ChatResponse, ChatResponseChunk};
use taskpilot_protocol::{new_id, ChatMessage, ChatRole};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct ChatTranscript {
    messages: Vec<ChatMessage>,
    index: HashMap<String, usize>,
    is_typing: bool,
}

impl ChatTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn get(&self, id: &str) -> Option<&ChatMessage> {
        self.index.get(id).map(|&pos| &self.messages[pos])
    }

    pub fn is_typing(&self) -> bool {
        self.is_typing
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.index.clear();
        self.is_typing = false;
    }

    fn push(&mut self, message: ChatMessage) -> &ChatMessage {
        let pos = self.messages.len();
        self.index.insert(message.id.clone(), pos);
        self.messages.push(message);
        &self.messages[pos]
    }

    /// Optimistic local echo of an outbound message. The assistant is
    /// considered to be typing until a reply lands.
    pub fn push_user(&mut self, id: String, content: String, timestamp: String) -> &ChatMessage {
        self.is_typing = true;
        self.push(ChatMessage {
            id,
            content,
            role: ChatRole::User,
            timestamp,
            parent_message_id: None,
            is_streaming: false,
        })
    }

    /// A `chat_response`. Streaming responses open a message that later
    /// chunks append to; a reused id is ignored.
    pub fn apply_response(
        &mut self,
        response: &ChatResponse,
        timestamp: String,
    ) -> Option<&ChatMessage> {
        let id = non_empty_or_generated(&response.message_id);
        if self.index.contains_key(&id) {
            debug!(
                component = "chat",
                event = "chat.response.duplicate",
                message_id = %id,
                "Ignoring chat_response for an existing message"
            );
            return None;
        }

        self.is_typing = response.streaming;
        Some(self.push(ChatMessage {
            id,
            content: response.content.clone(),
            role: ChatRole::Assistant,
            timestamp,
            parent_message_id: response.parent_message_id.clone(),
            is_streaming: response.streaming,
        }))
    }

    /// A `chat_response_chunk`. Appends to the open message with the same id,
    /// or opens one if the chunk arrived first. Chunks for a frozen message
    /// are dropped.
    pub fn apply_chunk(
        &mut self,
        chunk: &ChatResponseChunk,
        timestamp: String,
    ) -> Option<&ChatMessage> {
        self.is_typing = !chunk.done;

        match self.index.get(&chunk.message_id).copied() {
            Some(pos) => {
                let message = &mut self.messages[pos];
                if !message.is_streaming {
                    debug!(
                        component = "chat",
                        event = "chat.chunk.frozen",
                        message_id = %chunk.message_id,
                        "Dropping chunk for a completed message"
                    );
                    return None;
                }
                message.content.push_str(&chunk.chunk);
                if chunk.done {
                    message.is_streaming = false;
                }
                Some(&self.messages[pos])
            }
            None => {
                let id = non_empty_or_generated(&chunk.message_id);
                Some(self.push(ChatMessage {
                    id,
                    content: chunk.chunk.clone(),
                    role: ChatRole::Assistant,
                    timestamp,
                    parent_message_id: None,
                    is_streaming: !chunk.done,
                }))
            }
        }
    }

    /// A server-initiated `chat_request`, shown as a complete assistant message.
    pub fn apply_request(&mut self, request: &ChatRequest, timestamp: String) -> Option<&ChatMessage> {
        let id = non_empty_or_generated(request.message_id.as_deref().unwrap_or(""));
        if self.index.contains_key(&id) {
            return None;
        }
        Some(self.push(ChatMessage {
            id,
            content: request.message.clone(),
            role: ChatRole::Assistant,
            timestamp,
            parent_message_id: None,
            is_streaming: false,
        }))
    }

    /// A `chat_error` stops the typing indicator and leaves messages alone.
    pub fn apply_error(&mut self) {
        self.is_typing = false;
    }
}

fn non_empty_or_generated(id: &str) -> String {
    if id.is_empty() {
        format!("assistant-{}", new_id())
    } else {
        id.to_string()
    }
}
