//! OpenAI-compatible streaming chat client.
//!
//! Talks to any endpoint exposing `POST {base_url}/chat/completions` with
//! server-sent events. Requests always set `stream_options.include_usage` so
//! the final event carries token usage for billing.
//!
//! The API key is wrapped in [`SecretString`] and only exposed when building
//! the request's Authorization header.

use std::time::Duration;

use async_stream::try_stream;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use chatrelay_core::pipeline::collaborators::{GenerationRequest, ModelClient, ModelStream};
use chatrelay_types::config::UpstreamConfig;
use chatrelay_types::llm::{
    ChatMessage, Chunk, GenerationParams, ModelError, ModelEvent, TokenUsage,
};

/// Marker the upstream sends as the last SSE payload.
const DONE_MARKER: &str = "[DONE]";

pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
}

// No Debug derive: keeps the key out of logs.

impl OpenAiCompatClient {
    pub fn new(config: &UpstreamConfig, api_key: Option<SecretString>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Build a client reading the key from the environment variable named
    /// by `config.api_key_env`. A missing variable means no Authorization
    /// header, which local endpoints usually accept.
    pub fn from_env(config: &UpstreamConfig) -> Result<Self, reqwest::Error> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.is_empty())
            .map(SecretString::from);
        if api_key.is_none() {
            tracing::info!(var = %config.api_key_env, "upstream API key not set, sending unauthenticated requests");
        }
        Self::new(config, api_key)
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    stream_options: StreamOptions,
    #[serde(flatten)]
    params: &'a GenerationParams,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChoiceDelta>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Debug, Deserialize)]
struct ChoiceDelta {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsagePayload {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// What one SSE payload contributes to the stream.
#[derive(Debug, Default, PartialEq)]
struct ParsedData {
    chunk: Option<Chunk>,
    usage: Option<TokenUsage>,
}

fn parse_data(data: &str) -> Result<ParsedData, ModelError> {
    let payload: CompletionChunk = serde_json::from_str(data)
        .map_err(|e| ModelError::Other(format!("malformed stream chunk: {e}")))?;

    let mut content = String::new();
    let mut reasoning: Option<String> = None;
    for choice in payload.choices {
        if let Some(text) = choice.delta.content {
            content.push_str(&text);
        }
        if let Some(text) = choice.delta.reasoning_content.filter(|t| !t.is_empty()) {
            reasoning.get_or_insert_with(String::new).push_str(&text);
        }
    }

    let chunk = (!content.is_empty() || reasoning.is_some()).then_some(Chunk { content, reasoning });
    let usage = payload.usage.map(|u| TokenUsage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
    });

    Ok(ParsedData { chunk, usage })
}

/// Pass a successful response through; turn anything else into the
/// matching `ModelError`, with the body as detail.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ModelError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let error_body = response.text().await.unwrap_or_default();
    tracing::warn!(status = %status, body = %error_body, "upstream error response");
    Err(status_error(status, &error_body))
}

fn status_error(status: StatusCode, body: &str) -> ModelError {
    let message = format!("HTTP {status}: {body}");
    match status.as_u16() {
        400 | 404 | 413 | 422 => ModelError::Rejected(message),
        _ => ModelError::Unavailable(message),
    }
}

impl ModelClient for OpenAiCompatClient {
    fn stream_chat(&self, request: GenerationRequest) -> ModelStream {
        let url = self.url();
        let body = ChatCompletionRequest {
            model: &request.model,
            messages: &request.messages,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
            params: &request.params,
        };

        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }
        let model = request.model;

        Box::pin(try_stream! {
            tracing::debug!(url = %url, model = %model, "upstream chat request");

            let response = builder
                .send()
                .await
                .map_err(|e| ModelError::Unavailable(e.to_string()))?;
            let response = check_status(response).await?;

            let mut events = response.bytes_stream().eventsource();
            let mut usage = TokenUsage::default();

            while let Some(event) = events.next().await {
                let event = event.map_err(|e| ModelError::Other(e.to_string()))?;
                if event.data.trim() == DONE_MARKER {
                    break;
                }
                let parsed = parse_data(&event.data)?;
                if let Some(reported) = parsed.usage {
                    usage = reported;
                }
                if let Some(chunk) = parsed.chunk {
                    yield ModelEvent::Chunk(chunk);
                }
            }

            yield ModelEvent::Finished { cache_hit: false, usage };
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Serve one canned HTTP response on a local port and return the base URL.
    async fn serve_once(response: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    /// Drain the request headers and body so closing the socket does not
    /// reset the connection under the client.
    async fn read_request(socket: &mut tokio::net::TcpStream) {
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            received.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&received);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if received.len() >= end + 4 + length {
                    return;
                }
            }
        }
    }

    fn client_for(base_url: String) -> OpenAiCompatClient {
        let config = UpstreamConfig {
            base_url,
            ..UpstreamConfig::default()
        };
        OpenAiCompatClient::new(&config, None).unwrap()
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            model: "gpt-4o".to_string(),
            messages: vec![ChatMessage::user("hi")],
            params: GenerationParams::default(),
        }
    }

    #[test]
    fn test_parse_content_delta() {
        let parsed =
            parse_data(r#"{"choices":[{"index":0,"delta":{"content":"Hel"}}]}"#).unwrap();
        assert_eq!(parsed.chunk, Some(Chunk::text("Hel")));
        assert!(parsed.usage.is_none());
    }

    #[test]
    fn test_parse_reasoning_delta() {
        let parsed = parse_data(
            r#"{"choices":[{"delta":{"content":"","reasoning_content":"hmm"}}]}"#,
        )
        .unwrap();
        assert_eq!(
            parsed.chunk,
            Some(Chunk {
                content: String::new(),
                reasoning: Some("hmm".to_string()),
            })
        );
    }

    #[test]
    fn test_parse_usage_only_chunk() {
        let parsed = parse_data(
            r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":30,"total_tokens":42}}"#,
        )
        .unwrap();
        assert!(parsed.chunk.is_none());
        assert_eq!(
            parsed.usage,
            Some(TokenUsage {
                input_tokens: 12,
                output_tokens: 30,
            })
        );
    }

    #[test]
    fn test_parse_empty_delta_yields_nothing() {
        let parsed = parse_data(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap();
        assert_eq!(parsed, ParsedData::default());
    }

    #[test]
    fn test_parse_malformed_payload() {
        assert!(matches!(parse_data("not json"), Err(ModelError::Other(_))));
    }

    #[test]
    fn test_status_error_mapping() {
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, ""),
            ModelError::Rejected(_)
        ));
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "").is_availability());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "").is_availability());
        assert!(status_error(StatusCode::UNAUTHORIZED, "").is_availability());
    }

    #[test]
    fn test_url_trims_trailing_slash() {
        let config = UpstreamConfig {
            base_url: "http://localhost:8080/v1/".to_string(),
            ..UpstreamConfig::default()
        };
        let client = OpenAiCompatClient::new(&config, None).unwrap();
        assert_eq!(client.url(), "http://localhost:8080/v1/chat/completions");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_unavailable() {
        let config = UpstreamConfig {
            base_url: "http://127.0.0.1:1/v1".to_string(),
            connect_timeout_secs: 2,
            ..UpstreamConfig::default()
        };
        let client = OpenAiCompatClient::new(&config, Some(SecretString::from("sk-test"))).unwrap();
        let mut stream = client.stream_chat(request());

        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(ModelError::Unavailable(_))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_error_status_carries_response_body() {
        let body = "model overloaded";
        let base_url = serve_once(format!(
            "HTTP/1.1 503 Service Unavailable\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        ))
        .await;
        let mut stream = client_for(base_url).stream_chat(request());

        match stream.next().await.unwrap() {
            Err(ModelError::Unavailable(message)) => {
                assert!(message.contains("503"));
                assert!(message.contains(body));
            }
            other => panic!("expected unavailable, got {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_success_streams_chunks_then_usage() {
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2}}\n\n",
            "data: [DONE]\n\n",
        );
        let base_url = serve_once(format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{sse}",
            sse.len()
        ))
        .await;
        let events: Vec<_> = client_for(base_url)
            .stream_chat(request())
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(|event| event.unwrap())
            .collect();

        assert_eq!(
            events,
            vec![
                ModelEvent::Chunk(Chunk::text("Hel")),
                ModelEvent::Chunk(Chunk::text("lo")),
                ModelEvent::Finished {
                    cache_hit: false,
                    usage: TokenUsage {
                        input_tokens: 3,
                        output_tokens: 2,
                    },
                },
            ]
        );
    }

    #[test]
    fn test_request_body_includes_only_set_params() {
        let params = GenerationParams {
            max_tokens: Some(512),
            temperature: Some(0.25),
            repetition_penalty: Some(1.5),
            think: Some(false),
            ..Default::default()
        };
        let messages = vec![ChatMessage::user("hi")];
        let body = serde_json::to_value(ChatCompletionRequest {
            model: "gpt-4o",
            messages: &messages,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
            params: &params,
        })
        .unwrap();

        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["temperature"], 0.25);
        assert_eq!(body["repetition_penalty"], 1.5);
        assert_eq!(body["think"], false);
        for unset in ["top_p", "top_k", "presence_penalty", "frequency_penalty"] {
            assert!(body.get(unset).is_none(), "{unset} should be omitted");
        }
    }
}
