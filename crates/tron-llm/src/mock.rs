use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tron_core::errors::ClassifiedError;
use tron_core::Turn;

use crate::credentials::Credential;
use crate::invoker::{ModelInvoker, ModelReply};

/// Pre-programmed responses for deterministic testing without API calls.
pub enum MockResponse {
    Reply(ModelReply),
    Error(ClassifiedError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self::Reply(ModelReply::text(text))
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// One observed call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockCall {
    pub model: String,
    pub credential_id: String,
    pub turns: usize,
}

/// Mock invoker that returns pre-programmed responses in sequence.
pub struct MockInvoker {
    responses: Mutex<VecDeque<MockResponse>>,
    calls: Mutex<Vec<MockCall>>,
    call_count: AtomicUsize,
}

impl MockInvoker {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn push(&self, response: MockResponse) {
        self.responses.lock().push_back(response);
    }
}

#[async_trait]
impl ModelInvoker for MockInvoker {
    async fn invoke(
        &self,
        model_id: &str,
        credential: &Credential,
        turns: &[Turn],
    ) -> Result<ModelReply, ClassifiedError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().push(MockCall {
            model: model_id.to_string(),
            credential_id: credential.id.clone(),
            turns: turns.len(),
        });

        let next = self.responses.lock().pop_front();
        let Some(mut response) = next else {
            return Err(ClassifiedError::unknown(format!(
                "MockInvoker: no response configured for call {idx}"
            )));
        };
        loop {
            match response {
                MockResponse::Reply(reply) => return Ok(reply),
                MockResponse::Error(e) => return Err(e),
                MockResponse::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    response = *inner;
                }
            }
        }
    }
}
