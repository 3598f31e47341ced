//! Mock model invoker for testing.

use crate::invoker::{InvocationError, InvocationRequest, InvocationResponse, ModelInvoker};
use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Mock invoker that replays scripted responses in order.
///
/// Once the script is exhausted the invoker echoes the prompt, so tests that
/// only care about call counts do not need to script every turn. Every
/// request received is recorded and can be inspected afterwards.
pub struct MockInvoker {
    /// Scripted responses, consumed front to back.
    responses: Mutex<Vec<Result<InvocationResponse, InvocationError>>>,
    /// Requests received, in order.
    requests: Mutex<Vec<InvocationRequest>>,
    /// Credits charged per echoed (unscripted) call.
    default_cost: u64,
    /// Number of invocations made.
    calls: AtomicUsize,
}

impl MockInvoker {
    /// Creates a mock invoker with no scripted responses.
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            default_cost: 1,
            calls: AtomicUsize::new(0),
        }
    }

    /// Sets the credit cost charged for unscripted echo responses.
    #[must_use]
    pub fn with_default_cost(mut self, cost: u64) -> Self {
        self.default_cost = cost;
        self
    }

    /// Queues a successful response with the given content and cost.
    #[must_use]
    pub fn with_response(self, content: impl Into<String>, credits_used: u64) -> Self {
        self.responses.lock().unwrap().push(Ok(InvocationResponse {
            content: content.into(),
            credits_used,
            tool_calls: 0,
        }));
        self
    }

    /// Queues a successful response that reports tool usage.
    #[must_use]
    pub fn with_tool_response(
        self,
        content: impl Into<String>,
        credits_used: u64,
        tool_calls: u32,
    ) -> Self {
        self.responses.lock().unwrap().push(Ok(InvocationResponse {
            content: content.into(),
            credits_used,
            tool_calls,
        }));
        self
    }

    /// Queues a failure.
    #[must_use]
    pub fn with_failure(self, error: InvocationError) -> Self {
        self.responses.lock().unwrap().push(Err(error));
        self
    }

    /// Number of invocations made so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<InvocationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Default for MockInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelInvoker for MockInvoker {
    async fn invoke(
        &self,
        request: InvocationRequest,
    ) -> Result<InvocationResponse, InvocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Ok(InvocationResponse {
                content: format!("Mock response to: {}", request.prompt),
                credits_used: self.default_cost,
                tool_calls: 0,
            });
        }
        responses.remove(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::InvocationBudget;

    fn request(prompt: &str) -> InvocationRequest {
        InvocationRequest::new(prompt, InvocationBudget::new(100, 512, 60_000))
    }

    #[tokio::test]
    async fn test_scripted_responses_in_order() {
        let invoker = MockInvoker::new().with_response("first", 3).with_response("second", 5);

        let first = invoker.invoke(request("a")).await.unwrap();
        assert_eq!(first.content, "first");
        assert_eq!(first.credits_used, 3);

        let second = invoker.invoke(request("b")).await.unwrap();
        assert_eq!(second.content, "second");
        assert_eq!(invoker.call_count(), 2);

        let requests = invoker.requests();
        assert_eq!(requests[0].prompt, "a");
        assert_eq!(requests[1].prompt, "b");
    }

    #[tokio::test]
    async fn test_echo_after_script_exhausted() {
        let invoker = MockInvoker::new().with_default_cost(2);
        let response = invoker.invoke(request("hello")).await.unwrap();
        assert_eq!(response.content, "Mock response to: hello");
        assert_eq!(response.credits_used, 2);
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let invoker =
            MockInvoker::new().with_failure(InvocationError::Transport("refused".to_string()));
        let result = invoker.invoke(request("x")).await;
        assert!(matches!(result, Err(InvocationError::Transport(_))));
    }
}
