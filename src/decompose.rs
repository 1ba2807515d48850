use crate::llm::{ChatOptions, ContentPart, LlmError, LlmMessage, VisionModel};
use crate::models::{ImagePayload, ItemDescription};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str = "You are a professional fashion stylist. When analyzing an outfit, \
return detailed and specific clothing item descriptions (5–10 words) ideal for online search. \
Include style, color, pattern, and fit.";

const USER_PROMPT: &str = "List each clothing item in this outfit, 1 per line.";

const GENERIC_FAILURE: &str = "Image analysis failed.";

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("vision api key is not configured")]
    MissingCredentials,
    #[error("vision request failed: {0}")]
    Transport(String),
    #[error("{message}")]
    Upstream { status: u16, message: String },
    #[error("vision response unusable: {0}")]
    InvalidResponse(String),
}

impl From<LlmError> for AnalysisError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::MissingApiKey => AnalysisError::MissingCredentials,
            LlmError::Http(detail) => AnalysisError::Transport(detail),
            LlmError::Upstream { status, message } => AnalysisError::Upstream {
                status,
                message: message.unwrap_or_else(|| GENERIC_FAILURE.to_string()),
            },
            LlmError::InvalidResponse(detail) => AnalysisError::InvalidResponse(detail),
        }
    }
}

#[derive(Clone)]
pub struct Decomposer {
    model: Arc<dyn VisionModel>,
}

impl Decomposer {
    pub fn new(model: Arc<dyn VisionModel>) -> Self {
        Self { model }
    }

    pub async fn decompose(
        &self,
        image: &ImagePayload,
    ) -> Result<Vec<ItemDescription>, AnalysisError> {
        let messages = build_messages(image);
        let text = self
            .model
            .complete(&messages, &ChatOptions::default())
            .await
            .map_err(|err| {
                warn!(target = "outfit.decompose", error = %err, "vision_request_failed");
                AnalysisError::from(err)
            })?;
        let items = parse_items(&text);
        debug!(
            target = "outfit.decompose",
            items = items.len(),
            raw_chars = text.len(),
            "completion_parsed"
        );
        Ok(items)
    }
}

pub fn build_messages(image: &ImagePayload) -> Vec<LlmMessage> {
    vec![
        LlmMessage::system(SYSTEM_PROMPT),
        LlmMessage::user(vec![
            ContentPart::text(USER_PROMPT),
            ContentPart::image(image.data_url()),
        ]),
    ]
}

/// One item per non-blank line, in the order the model wrote them.
pub fn parse_items(text: &str) -> Vec<ItemDescription> {
    text.lines().filter_map(ItemDescription::from_line).collect()
}
