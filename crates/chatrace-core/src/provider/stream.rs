use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{Config, SamplingConfig};
use crate::error::ProviderError;
use crate::sse::ByteStream;
use crate::types::ConversationPayload;
use crate::util::{http, truncate_string};

use super::ProviderDescriptor;

/// Longest upstream error body kept in a [`ProviderError::UpstreamRejected`].
const ERROR_BODY_LIMIT: usize = 512;

/// Opens one streamed chat completion against one provider.
///
/// The returned stream must stop reading once `cancel` fires; dropping it
/// must release the connection.
#[async_trait]
pub trait StreamOpener: Send + Sync {
    async fn open(
        &self,
        provider: &ProviderDescriptor,
        payload: &ConversationPayload,
        cancel: CancellationToken,
    ) -> Result<ByteStream, ProviderError>;
}

/// OpenAI-compatible `/chat/completions` streaming over HTTP.
pub struct HttpStreamOpener {
    client: reqwest::Client,
    sampling: SamplingConfig,
}

impl HttpStreamOpener {
    /// Dedicated client honouring the configured connect timeout.
    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        let client = http::build_client(Duration::from_secs(config.race.connect_timeout_secs))?;
        Ok(Self::with_client(client, config.sampling.clone()))
    }

    pub fn with_client(client: reqwest::Client, sampling: SamplingConfig) -> Self {
        Self { client, sampling }
    }

    /// JSON body for one provider.
    pub fn request_body(&self, provider: &ProviderDescriptor, payload: &ConversationPayload) -> serde_json::Value {
        let mut body = json!({
            "model": provider.model,
            "messages": payload.to_messages(),
            "stream": true,
            "response_format": { "type": "json_object" },
            "temperature": self.sampling.temperature,
        });
        if let Some(top_p) = self.sampling.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(max_tokens) = self.sampling.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(penalty) = self.sampling.presence_penalty {
            body["presence_penalty"] = json!(penalty);
        }
        if let Some(penalty) = self.sampling.frequency_penalty {
            body["frequency_penalty"] = json!(penalty);
        }
        body
    }
}

#[async_trait]
impl StreamOpener for HttpStreamOpener {
    async fn open(
        &self,
        provider: &ProviderDescriptor,
        payload: &ConversationPayload,
        cancel: CancellationToken,
    ) -> Result<ByteStream, ProviderError> {
        let url = provider.completions_url();
        let body = self.request_body(provider, payload);

        debug!("Opening stream to {} at {} with model {}", provider.display_name, url, provider.model);

        let request = self
            .client
            .post(&url)
            .header(AUTHORIZATION, provider.bearer())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "text/event-stream")
            .json(&body);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            response = request.send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            let text = tokio::select! {
                _ = cancel.cancelled() => String::new(),
                text = response.text() => text.unwrap_or_default(),
            };
            return Err(ProviderError::UpstreamRejected {
                status: status.as_u16(),
                message: truncate_string(text.trim(), ERROR_BODY_LIMIT, "..."),
            });
        }
        if response.content_length() == Some(0) {
            return Err(ProviderError::UpstreamRejected {
                status: status.as_u16(),
                message: "empty response body".to_string(),
            });
        }

        Ok(cancellable_body(response, cancel))
    }
}

/// Body stream that ends as soon as `cancel` fires. Ending drops the
/// response, which closes the connection.
fn cancellable_body(response: reqwest::Response, cancel: CancellationToken) -> ByteStream {
    let mut body = response.bytes_stream();
    Box::pin(async_stream::stream! {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => yield Ok(bytes),
                    Some(Err(e)) => {
                        yield Err(ProviderError::UpstreamStream(e.to_string()));
                        break;
                    }
                    None => break,
                },
            }
        }
    })
}
