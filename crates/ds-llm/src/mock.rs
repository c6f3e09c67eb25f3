use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::provider::{ChatError, ChatProvider, ChatRequest, ChatResponse};

/// A mock chat provider for testing.
///
/// Returns pre-configured responses. Each call to `complete` pops the next
/// response from the queue; an empty queue yields a default response.
/// Requests are captured for assertions.
pub struct MockChatProvider {
    responses: Arc<Mutex<VecDeque<Result<ChatResponse, ChatError>>>>,
    captured: Arc<Mutex<Vec<ChatRequest>>>,
}

impl MockChatProvider {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            captured: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a successful text response.
    pub fn with_text(self, content: impl Into<String>) -> Self {
        let content = content.into();
        self.responses
            .lock()
            .expect("mock lock poisoned")
            .push_back(Ok(Self::response(content)));
        self
    }

    /// Queue an error response.
    pub fn with_error(self, error: ChatError) -> Self {
        self.responses
            .lock()
            .expect("mock lock poisoned")
            .push_back(Err(error));
        self
    }

    /// Captured requests, in call order.
    pub fn captured_requests(&self) -> Vec<ChatRequest> {
        self.captured.lock().expect("mock lock poisoned").clone()
    }

    fn response(content: String) -> ChatResponse {
        ChatResponse {
            content,
            model: "mock-model".to_string(),
            input_tokens: 10,
            output_tokens: 5,
            finish_reason: "stop".to_string(),
        }
    }
}

impl Default for MockChatProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatProvider for MockChatProvider {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError> {
        self.captured
            .lock()
            .expect("mock lock poisoned")
            .push(request.clone());

        let mut queue = self.responses.lock().expect("mock lock poisoned");
        match queue.pop_front() {
            Some(result) => result,
            None => Ok(Self::response("Mock response".to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
