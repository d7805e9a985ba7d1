//! HTTP adapters for the three supported wire dialects.
//!
//! All dialects speak OpenAI-compatible chat-completions JSON with SSE
//! streaming; they differ in auth header, default endpoint, and whether
//! penalty fields are accepted.
//!
//! | Dialect | Auth header          | Penalty fields |
//! |---------|----------------------|----------------|
//! | OpenAI  | Authorization Bearer | sent           |
//! | Azure   | api-key              | sent           |
//! | xAI     | Authorization Bearer | omitted        |

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde_json::json;

use super::sse::{classify_line, decode_payload, LineBuffer, SseLine};
use super::{
    ChunkEvent, ChunkStream, CompletionBackend, CompletionRequest, EndpointConfig, ProviderError,
};
use crate::state::Provider;

/// Default endpoint for xAI-style configurations that leave it blank.
pub const DEFAULT_XAI_ENDPOINT: &str = "https://api.x.ai/v1/chat/completions";

/// Total allowance for one streaming response. Streams idle-wait on the
/// provider, so these are deliberately long.
const STREAM_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// xAI reasoning models can stream for much longer.
const XAI_STREAM_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Reqwest-backed implementation of the streaming contract.
pub struct HttpBackend {
    client: reqwest::Client,
}

impl HttpBackend {
    /// Build a backend with the given connect timeout.
    pub fn new(connect_timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

/// Endpoint to call for a dialect, applying the xAI default.
pub fn resolve_endpoint(provider: Provider, configured: &str) -> String {
    if provider == Provider::XAi && configured.trim().is_empty() {
        DEFAULT_XAI_ENDPOINT.to_string()
    } else {
        configured.to_string()
    }
}

/// Request body for a dialect. xAI rejects penalty fields, so they are
/// omitted there.
pub fn build_body(provider: Provider, request: &CompletionRequest) -> serde_json::Value {
    let mut body = json!({
        "model": request.model,
        "messages": request.messages,
        "stream": true,
        "temperature": request.temperature,
        "max_tokens": request.max_tokens,
        "top_p": request.top_p,
    });
    if provider != Provider::XAi {
        body["presence_penalty"] = json!(request.presence_penalty);
        body["frequency_penalty"] = json!(request.frequency_penalty);
    }
    body
}

fn stream_timeout(provider: Provider) -> Duration {
    match provider {
        Provider::XAi => XAI_STREAM_TIMEOUT,
        _ => STREAM_TIMEOUT,
    }
}

#[async_trait]
impl CompletionBackend for HttpBackend {
    async fn stream_completion(
        &self,
        endpoint: &EndpointConfig,
        request: &CompletionRequest,
    ) -> Result<ChunkStream, ProviderError> {
        let url = resolve_endpoint(endpoint.provider, &endpoint.endpoint);
        let body = build_body(endpoint.provider, request);

        let mut builder = self
            .client
            .post(&url)
            .timeout(stream_timeout(endpoint.provider))
            .json(&body);
        builder = match endpoint.provider {
            Provider::Azure => builder.header("api-key", &endpoint.api_key),
            _ => builder.bearer_auth(&endpoint.api_key),
        };

        tracing::debug!(model = %request.model, provider = %endpoint.provider, "Opening completion stream");

        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes_stream()
            .map(|item| item.map(|b| b.to_vec()).map_err(|e| ProviderError::Transport(e.to_string())));
        Ok(chunk_stream(bytes))
    }
}

struct StreamState {
    body: Pin<Box<dyn Stream<Item = Result<Vec<u8>, ProviderError>> + Send>>,
    buf: LineBuffer,
    pending: VecDeque<Result<ChunkEvent, ProviderError>>,
    done: bool,
}

/// Turn a raw byte stream of SSE lines into a stream of chunk events.
/// Stops at the `[DONE]` terminator or on transport error.
pub fn chunk_stream<S>(body: S) -> ChunkStream
where
    S: Stream<Item = Result<Vec<u8>, ProviderError>> + Send + 'static,
{
    let state = StreamState {
        body: Box::pin(body),
        buf: LineBuffer::new(),
        pending: VecDeque::new(),
        done: false,
    };

    Box::pin(futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.done {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => {
                    for line in st.buf.push(&bytes) {
                        match classify_line(&line) {
                            SseLine::Done => {
                                st.done = true;
                                break;
                            }
                            SseLine::Payload(payload) => match decode_payload(payload) {
                                Ok(events) => st.pending.extend(events.into_iter().map(Ok)),
                                Err(e) => st.pending.push_back(Err(e)),
                            },
                            SseLine::Skip => {}
                        }
                    }
                }
                Some(Err(e)) => {
                    st.done = true;
                    st.pending.push_back(Err(e));
                }
                None => {
                    st.done = true;
                }
            }
        }
    }))
}
