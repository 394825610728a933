//! Translation using OpenAI-compatible chat completion APIs. This also works
//! with LiteLLM, Ollama and similar gateways.

use std::{sync::Arc, time::Duration};

use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs, FinishReason,
    },
};
use futures::{FutureExt as _, TryFutureExt as _};
use keen_retry::ExponentialJitter;
use tokio::time;

use crate::{
    async_utils::BoxedFuture,
    prelude::*,
    rate_limit::Throttle,
    retry::{
        EngineError, EngineRetryResult, resolved_into_result, retry_result_fatal,
        retry_result_ok, retry_result_transient, try_potentially_transient,
    },
};

use super::{LanguagePair, Translator};

/// Create an OpenAI-compatible client, configured from `OPENAI_API_KEY` and
/// `OPENAI_API_BASE` when present.
pub fn create_client() -> Client<OpenAIConfig> {
    let mut client_config = OpenAIConfig::new();
    if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
        client_config = client_config.with_api_key(api_key);
    }
    if let Ok(api_base) = std::env::var("OPENAI_API_BASE") {
        client_config = client_config.with_api_base(api_base);
    }
    Client::with_config(client_config)
}

/// Instructions sent with every request.
fn system_prompt(pair: &LanguagePair) -> String {
    format!(
        "You translate text from manga speech bubbles. The source language is \
         `{}` and the target language is `{}`. The text came from OCR, so it may \
         contain line breaks or stray characters; ignore them. Reply with the \
         translation only, with no quotes, notes or explanations.",
        pair.source, pair.target
    )
}

/// Translator backed by a chat completion model.
pub struct OpenAiTranslator {
    client: Client<OpenAIConfig>,
    model: String,
    pair: LanguagePair,
    timeout: Option<Duration>,
    throttle: Arc<Throttle>,
}

impl OpenAiTranslator {
    pub fn new(
        client: Client<OpenAIConfig>,
        model: &str,
        pair: LanguagePair,
        timeout_secs: Option<u64>,
        throttle: Arc<Throttle>,
    ) -> Self {
        Self {
            client,
            model: model.to_owned(),
            pair,
            timeout: timeout_secs.map(Duration::from_secs),
            throttle,
        }
    }

    fn build_request(&self, text: &str) -> Result<CreateChatCompletionRequest> {
        let system = ChatCompletionRequestSystemMessageArgs::default()
            .content(system_prompt(&self.pair))
            .build()?;
        let user = ChatCompletionRequestUserMessageArgs::default()
            .content(text)
            .build()?;
        CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(vec![system.into(), user.into()])
            .temperature(0.2)
            .build()
            .context("Error building request")
    }

    /// Apply our timeout, if any, merging the timeout error into
    /// [`EngineError`].
    fn apply_timeout<'fut, T>(
        &self,
        future: impl Future<Output = Result<T, OpenAIError>> + Send + 'fut,
    ) -> BoxedFuture<'fut, Result<T, EngineError<OpenAIError>>>
    where
        T: Send + 'static,
    {
        let future = future.map_err(EngineError::Native);
        if let Some(timeout) = self.timeout {
            time::timeout(timeout, future)
                .map(|result| match result {
                    Ok(inner) => inner,
                    Err(_) => Err(EngineError::Timeout),
                })
                .boxed()
        } else {
            future.boxed()
        }
    }

    /// Make one request.
    async fn attempt(&self, request: &CreateChatCompletionRequest) -> EngineRetryResult<String> {
        self.throttle.wait().await;
        let chat = self.client.chat();
        let response =
            try_potentially_transient!(self.apply_timeout(chat.create(request.clone())).await);

        let Some(choice) = response.choices.first() else {
            return retry_result_fatal(anyhow!("No choices in OpenAI response"));
        };
        if choice.finish_reason == Some(FinishReason::ContentFilter) {
            return retry_result_fatal(anyhow!("Content filter triggered"));
        }
        let content = choice.message.content.as_deref().unwrap_or_default().trim();
        if content.is_empty() {
            // Usually a flaky gateway rather than a real answer.
            return retry_result_transient(anyhow!("Empty translation in OpenAI response"));
        }
        retry_result_ok(content.to_owned())
    }
}

#[async_trait]
impl Translator for OpenAiTranslator {
    #[instrument(level = "debug", skip_all, fields(pair = %self.pair, model = %self.model))]
    async fn translate(&self, text: &str) -> Result<String> {
        let request = self.build_request(text)?;
        trace!(?request, "Request");

        let jitter = ExponentialJitter::FromBackoffRange {
            backoff_range_millis: 1..=30_000,
            re_attempts: 5,
            jitter_ratio: 0.2,
        };
        let result = self
            .attempt(&request)
            .await
            .retry_with_async(|_| self.attempt(&request))
            .with_exponential_jitter(|| jitter)
            .await
            .inspect_recovered(|_, _, retry_errors_list| {
                warn!(
                    "translation succeeded after retrying {} times (failed attempts: [{}])",
                    retry_errors_list.len(),
                    keen_retry::loggable_retry_errors(retry_errors_list)
                )
            })
            .inspect_given_up(|_, retry_errors_list, fatal_error| {
                warn!(
                    "translation failed after {} attempts with error {fatal_error:?}. Previous transient failures: [{}]",
                    retry_errors_list.len(),
                    keen_retry::loggable_retry_errors(retry_errors_list)
                )
            });
        resolved_into_result(result)
    }
}
