use crate::decompose::Decomposer;
use crate::llm::{ChatOptions, LlmError, LlmMessage, VisionModel};
use crate::models::ImagePayload;
use crate::pipeline::Pipeline;
use crate::preview::{LinkMetadata, PreviewConfig, PreviewError, PreviewResolver};
use async_trait::async_trait;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

pub fn sample_image() -> ImagePayload {
    ImagePayload::from_bytes(b"not really a jpeg", None)
        .expect("payload")
        .with_display_uri("file:///photos/outfit.jpg")
}

/// A recorded call: the messages and the options they were sent with.
pub type VisionCall = (Vec<LlmMessage>, ChatOptions);

/// Vision fake with a canned reply. Clones share the call log.
#[derive(Clone)]
pub struct ScriptedVision {
    reply: Result<String, u16>,
    delay: Duration,
    calls: Arc<Mutex<Vec<VisionCall>>>,
}

impl ScriptedVision {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Ok(text.to_string()),
            delay: Duration::ZERO,
            calls: Arc::default(),
        }
    }

    pub fn failing(status: u16) -> Self {
        Self {
            reply: Err(status),
            ..Self::replying("")
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<VisionCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl VisionModel for ScriptedVision {
    async fn complete(
        &self,
        messages: &[LlmMessage],
        options: &ChatOptions,
    ) -> Result<String, LlmError> {
        self.calls
            .lock()
            .unwrap()
            .push((messages.to_vec(), options.clone()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.reply {
            Ok(text) => Ok(text.clone()),
            Err(status) => Err(LlmError::Upstream {
                status: *status,
                message: Some("upstream exploded".into()),
            }),
        }
    }
}

/// Metadata fake that records how many lookups overlap.
#[derive(Clone)]
pub struct ScriptedMetadata {
    inner: Arc<MetadataState>,
}

struct MetadataState {
    delay_for: fn(&str) -> Duration,
    fail_when: fn(&str) -> bool,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedMetadata {
    pub fn live() -> Self {
        Self::build(|_| Duration::ZERO, |_| false)
    }

    pub fn failing_for(fail_when: fn(&str) -> bool) -> Self {
        Self::build(|_| Duration::ZERO, fail_when)
    }

    fn build(delay_for: fn(&str) -> Duration, fail_when: fn(&str) -> bool) -> Self {
        Self {
            inner: Arc::new(MetadataState {
                delay_for,
                fail_when,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    pub fn with_delay(self, delay_for: fn(&str) -> Duration) -> Self {
        Self::build(delay_for, self.inner.fail_when)
    }

    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LinkMetadata for ScriptedMetadata {
    async fn preview_image(&self, url: &str) -> Result<Option<String>, PreviewError> {
        let state = &self.inner;
        state.calls.fetch_add(1, Ordering::SeqCst);
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = (state.delay_for)(url);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        state.in_flight.fetch_sub(1, Ordering::SeqCst);

        if (state.fail_when)(url) {
            return Err(PreviewError::Status(503));
        }
        Ok(Some(format!("https://img.example/og/{}.jpg", state.calls.load(Ordering::SeqCst))))
    }
}

pub fn pipeline(
    vision: ScriptedVision,
    metadata: Option<ScriptedMetadata>,
    concurrency: usize,
) -> Pipeline {
    let metadata = metadata.map(|m| Arc::new(m) as Arc<dyn LinkMetadata>);
    let config = PreviewConfig {
        timeout: Duration::from_secs(2),
        concurrency,
        ..PreviewConfig::default()
    };
    Pipeline::new(
        Decomposer::new(Arc::new(vision)),
        PreviewResolver::new(metadata, &config),
        concurrency,
    )
}
