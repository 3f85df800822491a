use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError};
use crate::stream::StreamEvent;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// How long a model is skipped after a hard (non-retriable or retry-exhausted)
/// failure, so a transient outage doesn't retry-thrash on every request.
const COOLDOWN: Duration = Duration::from_secs(60);

/// One entry in the fallback chain: a provider, the model to request from it,
/// and how many retries to spend on it before moving on.
pub struct ProviderSlot {
    pub provider: Box<dyn LlmProvider>,
    pub model: String,
    pub max_retries: u32,
}

impl ProviderSlot {
    pub fn new(provider: Box<dyn LlmProvider>, model: impl Into<String>, max_retries: u32) -> Self {
        Self {
            provider,
            model: model.into(),
            max_retries,
        }
    }
}

/// Routes requests across an ordered fallback chain of providers, retrying
/// each slot with exponential backoff before advancing, and keeping a
/// per-model cooldown so a hard failure doesn't get retried immediately on
/// the next request.
pub struct ProviderRouter {
    slots: Vec<ProviderSlot>,
    cooldowns: Mutex<HashMap<String, Instant>>,
}

impl ProviderRouter {
    pub fn new(slots: Vec<ProviderSlot>) -> Self {
        assert!(!slots.is_empty(), "ProviderRouter requires at least one provider slot");
        Self {
            slots,
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    fn is_cooling_down(&self, model: &str) -> bool {
        let cooldowns = self.cooldowns.lock().unwrap();
        matches!(cooldowns.get(model), Some(until) if Instant::now() < *until)
    }

    fn set_cooldown(&self, model: &str) {
        self.cooldowns
            .lock()
            .unwrap()
            .insert(model.to_string(), Instant::now() + COOLDOWN);
    }

    /// Slot model fills in only when the caller left `model` empty, so a
    /// per-session model override survives routing.
    fn request_for(req: &ChatRequest, model: &str) -> ChatRequest {
        let mut cloned = req.clone();
        if cloned.model.is_empty() {
            cloned.model = model.to_string();
        }
        cloned
    }
}

#[async_trait]
impl LlmProvider for ProviderRouter {
    fn name(&self) -> &str {
        "router"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut last_err: Option<ProviderError> = None;

        for slot in &self.slots {
            let provider_name = slot.provider.name();
            if self.is_cooling_down(&slot.model) {
                info!(provider = %provider_name, model = %slot.model, "skipping cooled-down model");
                continue;
            }

            let slot_req = Self::request_for(req, &slot.model);
            let mut backoff = INITIAL_BACKOFF;

            for attempt in 0..=slot.max_retries {
                match slot.provider.send(&slot_req).await {
                    Ok(resp) => {
                        if attempt > 0 {
                            info!(provider = %provider_name, attempt, "request succeeded after retry");
                        }
                        return Ok(resp);
                    }
                    Err(e) => {
                        warn!(provider = %provider_name, attempt, err = %e, "provider send failed");

                        if !e.is_retriable() {
                            last_err = Some(e);
                            break;
                        }

                        last_err = Some(e);

                        if attempt < slot.max_retries {
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(MAX_BACKOFF);
                        }
                    }
                }
            }

            self.set_cooldown(&slot.model);
            info!(provider = %provider_name, "provider exhausted, trying next provider");
        }

        Err(last_err.unwrap_or_else(|| ProviderError::Unavailable("all providers failed".to_string())))
    }

    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let mut last_err: Option<ProviderError> = None;

        for slot in &self.slots {
            let provider_name = slot.provider.name();
            if self.is_cooling_down(&slot.model) {
                continue;
            }

            let slot_req = Self::request_for(req, &slot.model);
            let mut backoff = INITIAL_BACKOFF;

            for attempt in 0..=slot.max_retries {
                match slot.provider.send_stream(&slot_req, tx.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!(provider = %provider_name, attempt, err = %e, "provider send_stream failed");

                        if !e.is_retriable() {
                            last_err = Some(e);
                            break;
                        }
                        last_err = Some(e);

                        if attempt < slot.max_retries {
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(MAX_BACKOFF);
                        }
                    }
                }
            }

            self.set_cooldown(&slot.model);
        }

        Err(last_err.unwrap_or_else(|| ProviderError::Unavailable("all providers failed".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatRequest, Message, Role};

    struct AlwaysFail;

    #[async_trait]
    impl LlmProvider for AlwaysFail {
        fn name(&self) -> &str {
            "always-fail"
        }
        async fn send(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            Err(ProviderError::Api { status: 500, message: "boom".into() })
        }
    }

    struct AlwaysOk;

    #[async_trait]
    impl LlmProvider for AlwaysOk {
        fn name(&self) -> &str {
            "always-ok"
        }
        async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                content: "ok".to_string(),
                model: req.model.clone(),
                tokens_in: 1,
                tokens_out: 1,
                stop_reason: "stop".to_string(),
                tool_calls: Vec::new(),
            })
        }
    }

    fn dummy_request() -> ChatRequest {
        ChatRequest {
            model: "test-model".to_string(),
            system: "You are a test.".to_string(),
            system_prompt: None,
            messages: vec![Message { role: Role::User, content: "hello".to_string() }],
            max_tokens: 64,
            stream: false,
            tools: Vec::new(),
            raw_messages: None,
        }
    }

    #[tokio::test]
    async fn router_falls_back_to_second_provider() {
        let router = ProviderRouter::new(vec![
            ProviderSlot::new(Box::new(AlwaysFail), "model-a", 0),
            ProviderSlot::new(Box::new(AlwaysOk), "model-b", 0),
        ]);

        let result = router.send(&dummy_request()).await;
        assert!(result.is_ok());
        assert_eq!(result.unwrap().content, "ok");
    }

    #[tokio::test]
    async fn router_errors_when_all_fail() {
        let router = ProviderRouter::new(vec![
            ProviderSlot::new(Box::new(AlwaysFail), "model-a", 0),
            ProviderSlot::new(Box::new(AlwaysFail), "model-b", 0),
        ]);

        let result = router.send(&dummy_request()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn failed_model_enters_cooldown_and_is_skipped_next_call() {
        let router = ProviderRouter::new(vec![
            ProviderSlot::new(Box::new(AlwaysFail), "model-a", 0),
            ProviderSlot::new(Box::new(AlwaysOk), "model-b", 0),
        ]);

        let _ = router.send(&dummy_request()).await;
        assert!(router.is_cooling_down("model-a"));
    }
}
