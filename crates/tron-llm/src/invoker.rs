use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tron_core::errors::ClassifiedError;
use tron_core::{ToolInvocation, Turn};

use crate::credentials::Credential;

/// What a model call produced.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelReply {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,
}

impl ModelReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    /// The assistant turn to append to the session.
    pub fn into_turn(self) -> Turn {
        if self.tool_calls.is_empty() {
            Turn::assistant(self.content)
        } else {
            Turn::assistant_with_calls(self.content, self.tool_calls)
        }
    }
}

/// The model-call collaborator.
///
/// Implementations talk to a provider and must classify every failure
/// (see [`crate::classify`]) before returning it; raw transport errors never
/// reach the fallback manager.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(
        &self,
        model_id: &str,
        credential: &Credential,
        turns: &[Turn],
    ) -> Result<ModelReply, ClassifiedError>;
}
