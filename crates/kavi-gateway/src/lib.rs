//! Blocking client for the LLM gateway.
//!
//! The gateway is an OpenAI-compatible HTTP endpoint the forge treats
//! as opaque: JSON in, JSON out, and it may be down. Two operations are
//! used: chat completion (retry advisory) and batched text embeddings
//! (skills at runtime). Every failure mode — connection refused,
//! timeout, non-200, empty choice array, malformed body — surfaces as
//! the single typed `GatewayError::Unavailable` so callers degrade to
//! their deterministic path without inspecting the wreckage.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway unavailable: {reason}")]
    Unavailable { reason: String },
}

impl GatewayError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        let reason = if err.is_timeout() {
            format!("timed out: {err}")
        } else if err.is_connect() {
            format!("connection failed: {err}")
        } else {
            err.to_string()
        };
        GatewayError::Unavailable { reason }
    }
}

/// Connection settings, supplied by the forge configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL, e.g. `http://127.0.0.1:8080/v1`.
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    #[serde(default)]
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

pub struct GatewayClient {
    http: reqwest::blocking::Client,
    config: GatewayConfig,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(GatewayError::from_reqwest)?;
        Ok(Self { http, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn post<B: Serialize, R: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, GatewayError> {
        let mut req = self.http.post(self.endpoint(path)).json(body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().map_err(GatewayError::from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(GatewayError::Unavailable {
                reason: format!("{path} returned {status}"),
            });
        }
        resp.json::<R>().map_err(|e| GatewayError::Unavailable {
            reason: format!("{path} returned malformed JSON: {e}"),
        })
    }

    /// One-shot chat completion. Returns the first choice's content.
    pub fn chat(&self, system: &str, user: &str) -> Result<String, GatewayError> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
        };
        let parsed: ChatResponse = self.post("chat/completions", &body)?;
        let first = parsed.choices.into_iter().next().ok_or_else(|| {
            GatewayError::Unavailable {
                reason: "chat/completions returned an empty choice array".to_string(),
            }
        })?;
        Ok(first.message.content)
    }

    /// Batched text embeddings, returned in input order.
    pub fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let body = EmbeddingsRequest {
            model: &self.config.model,
            input: inputs,
        };
        let parsed: EmbeddingsResponse = self.post("embeddings", &body)?;
        if parsed.data.len() != inputs.len() {
            return Err(GatewayError::Unavailable {
                reason: format!(
                    "embeddings returned {} rows for {} inputs",
                    parsed.data.len(),
                    inputs.len()
                ),
            });
        }
        let mut rows = parsed.data;
        rows.sort_by_key(|r| r.index);
        Ok(rows.into_iter().map(|r| r.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn client_for(port: u16) -> GatewayClient {
        GatewayClient::new(GatewayConfig {
            base_url: format!("http://127.0.0.1:{port}/v1"),
            model: "advisor".to_string(),
            api_key: None,
            timeout: Duration::from_secs(2),
        })
        .expect("client builds")
    }

    fn one_shot_server(body: &'static str, status: u16) -> (u16, thread::JoinHandle<()>) {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind");
        let port = server.server_addr().to_ip().expect("ip addr").port();
        let handle = thread::spawn(move || {
            let request = server.recv().expect("recv");
            let header: tiny_http::Header = "Content-Type: application/json".parse().expect("header");
            let response = tiny_http::Response::from_string(body)
                .with_status_code(status)
                .with_header(header);
            request.respond(response).expect("respond");
        });
        (port, handle)
    }

    #[test]
    fn chat_returns_first_choice_content() {
        let (port, handle) = one_shot_server(
            r#"{"choices":[{"message":{"role":"assistant","content":"revised packet"}}]}"#,
            200,
        );
        let out = client_for(port).chat("system", "user").expect("chat");
        assert_eq!(out, "revised packet");
        handle.join().expect("server thread");
    }

    #[test]
    fn empty_choice_array_is_unavailable() {
        let (port, handle) = one_shot_server(r#"{"choices":[]}"#, 200);
        let err = client_for(port).chat("s", "u").expect_err("must fail");
        assert!(err.to_string().contains("empty choice array"));
        handle.join().expect("server thread");
    }

    #[test]
    fn non_200_is_unavailable() {
        let (port, handle) = one_shot_server(r#"{"error":"overloaded"}"#, 503);
        let err = client_for(port).chat("s", "u").expect_err("must fail");
        assert!(matches!(err, GatewayError::Unavailable { .. }));
        assert!(err.to_string().contains("503"));
        handle.join().expect("server thread");
    }

    #[test]
    fn malformed_body_is_unavailable() {
        let (port, handle) = one_shot_server("{not json", 200);
        let err = client_for(port).chat("s", "u").expect_err("must fail");
        assert!(err.to_string().contains("malformed JSON"));
        handle.join().expect("server thread");
    }

    #[test]
    fn connection_refused_is_unavailable() {
        // Bind then immediately drop to get a port nothing listens on.
        let port = {
            let server = tiny_http::Server::http("127.0.0.1:0").expect("bind");
            server.server_addr().to_ip().expect("ip addr").port()
        };
        let err = client_for(port).chat("s", "u").expect_err("must fail");
        assert!(matches!(err, GatewayError::Unavailable { .. }));
    }

    #[test]
    fn embeddings_return_in_input_order() {
        let (port, handle) = one_shot_server(
            r#"{"data":[{"index":1,"embedding":[2.0]},{"index":0,"embedding":[1.0]}]}"#,
            200,
        );
        let out = client_for(port)
            .embed(&["a".to_string(), "b".to_string()])
            .expect("embed");
        assert_eq!(out, vec![vec![1.0], vec![2.0]]);
        handle.join().expect("server thread");
    }

    #[test]
    fn embeddings_row_count_mismatch_is_unavailable() {
        let (port, handle) = one_shot_server(r#"{"data":[{"index":0,"embedding":[1.0]}]}"#, 200);
        let err = client_for(port)
            .embed(&["a".to_string(), "b".to_string()])
            .expect_err("must fail");
        assert!(err.to_string().contains("2 inputs"));
        handle.join().expect("server thread");
    }

    #[test]
    fn empty_embedding_batch_skips_the_network() {
        // Port with no listener: proof no request is attempted.
        let client = client_for(1);
        assert!(client.embed(&[]).expect("empty").is_empty());
    }
}
