//! SSE transport over HTTP.

use crate::error::{StreamError, StreamResult};
use crate::parser::{ByteSource, SourceRead};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;

const API_KEY_HEADER: &str = "X-API-Key";

/// JSON body of a streaming generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechStreamBody {
    pub text: String,
    /// Saved voice prompt to speak with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_audio_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_text: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    /// Max characters per generated chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    /// Random seed for a consistent voice across chunks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

fn default_language() -> String {
    "Auto".to_string()
}

fn default_chunk_size() -> u32 {
    500
}

impl SpeechStreamBody {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            prompt_id: None,
            ref_audio_url: None,
            ref_text: None,
            language: default_language(),
            chunk_size: default_chunk_size(),
            seed: None,
        }
    }

    pub fn with_prompt_id(mut self, prompt_id: impl Into<String>) -> Self {
        self.prompt_id = Some(prompt_id.into());
        self
    }

    pub fn with_reference(mut self, audio_url: impl Into<String>, text: Option<String>) -> Self {
        self.ref_audio_url = Some(audio_url.into());
        self.ref_text = text;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// A POST to a streaming endpoint
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub url: String,
    pub body: serde_json::Value,
    pub api_key: Option<String>,
}

impl StreamRequest {
    pub fn new(url: impl Into<String>, body: &SpeechStreamBody) -> StreamResult<Self> {
        let body = serde_json::to_value(body)
            .map_err(|e| StreamError::Config(format!("invalid request body: {e}")))?;
        Ok(Self {
            url: url.into(),
            body,
            api_key: None,
        })
    }

    /// Request with an arbitrary JSON body
    pub fn raw(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            url: url.into(),
            body,
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn build(&self, client: &reqwest::Client) -> reqwest::RequestBuilder {
        let mut req_builder = client
            .post(&self.url)
            .header("Accept", "text/event-stream")
            .json(&self.body);
        if let Some(api_key) = &self.api_key {
            req_builder = req_builder.header(API_KEY_HEADER, api_key);
        }
        req_builder
    }
}

type BodyStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Response body of a streaming request, read as a [`ByteSource`]
pub struct HttpEventSource {
    body: BodyStream,
}

impl HttpEventSource {
    /// Send the request and wait for response headers
    pub async fn connect(client: &reqwest::Client, request: &StreamRequest) -> StreamResult<Self> {
        let response = request
            .build(client)
            .send()
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(StreamError::Transport(format!(
                "Server returned error {}: {}",
                status, body
            )));
        }

        Ok(Self {
            body: Box::pin(response.bytes_stream()),
        })
    }
}

#[async_trait]
impl ByteSource for HttpEventSource {
    async fn read(&mut self) -> StreamResult<SourceRead> {
        match self.body.next().await {
            Some(Ok(bytes)) => Ok(SourceRead::data(bytes)),
            Some(Err(e)) => Err(StreamError::Transport(e.to_string())),
            None => Ok(SourceRead::end()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn body_omits_unset_fields() {
        let body = SpeechStreamBody::new("Hello world.").with_prompt_id("abc");
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value,
            json!({
                "text": "Hello world.",
                "prompt_id": "abc",
                "language": "Auto",
                "chunk_size": 500
            })
        );
    }

    #[test]
    fn body_defaults_when_deserializing() {
        let body: SpeechStreamBody = serde_json::from_str(r#"{"text":"hi"}"#).unwrap();
        assert_eq!(body, SpeechStreamBody::new("hi"));
    }

    #[test]
    fn request_carries_api_key_header() {
        let request = StreamRequest::new(
            "http://localhost:8000/api/v1/base/generate-with-prompt/stream",
            &SpeechStreamBody::new("hi").with_seed(7),
        )
        .unwrap()
        .with_api_key("secret");

        let built = request.build(&reqwest::Client::new()).build().unwrap();
        assert_eq!(built.method(), reqwest::Method::POST);
        assert_eq!(
            built.headers().get(API_KEY_HEADER).unwrap().to_str().unwrap(),
            "secret"
        );
        assert_eq!(request.body["seed"], json!(7));
    }

    #[tokio::test]
    async fn connection_failure_is_transport_error() {
        let request = StreamRequest::raw("http://127.0.0.1:9/stream", json!({"text": "hi"}));
        let result = HttpEventSource::connect(&reqwest::Client::new(), &request).await;
        assert!(matches!(result, Err(StreamError::Transport(_))));
    }
}
