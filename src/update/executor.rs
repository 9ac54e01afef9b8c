//! Remote rewrite execution against an OpenAI-compatible chat endpoint.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::models::RewriteJob;
use crate::config::RewriteConfig;
use crate::errors::RewriteJobError;

const SYSTEM_PROMPT: &str = "You are a helpful assistant that analyzes code and returns a JSON \
object with the refactored code and the comments that come with it. Your goal is to identify \
outdated syntax in code and suggest changes to update it to the latest syntax.";

/// Structured answer of one rewrite job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteReport {
    pub refactored_code: String,
    pub refactored_code_comments: String,
}

/// Runs one rewrite job remotely. Implementations must not panic on bad
/// remote output; return `RewriteJobError::Malformed` instead.
#[async_trait]
pub trait RewriteExecutor: Send + Sync {
    async fn rewrite(&self, job: &RewriteJob) -> Result<RewriteReport, RewriteJobError>;
}

pub fn user_prompt(content: &str) -> String {
    format!(
        "Analyze the following code and determine if the syntax is out of date. \
         If it is out of date, specify what changes need to be made in the following JSON format:\n\n\
         {{\n  \"refactored_code\": \"A rewrite of the file that is more up to date, using the native \
         language (i.e. if the file is a NextJS file, rewrite the NextJS file using \
         Javascript/Typescript with the updated API changes). The file should be a complete file, \
         not just a partial updated code segment\",\n  \"refactored_code_comments\": \"Comments and \
         explanations for your code changes. Be as descriptive, informative, technical as \
         possible.\"\n}}\n\n{}",
        content
    )
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    response_format: ResponseFormat,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Strip a surrounding Markdown code fence, if any.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Parse the assistant message content into a report.
pub fn parse_report(content: &str) -> Result<RewriteReport, RewriteJobError> {
    let report: RewriteReport = serde_json::from_str(strip_code_fence(content))
        .map_err(|e| RewriteJobError::Malformed(format!("invalid report JSON: {}", e)))?;
    if report.refactored_code.trim().is_empty() {
        return Err(RewriteJobError::Malformed(
            "refactored_code is empty".to_string(),
        ));
    }
    Ok(report)
}

/// Parse a full chat completion response body.
fn parse_completion(body: &str) -> Result<RewriteReport, RewriteJobError> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| RewriteJobError::Malformed(format!("invalid completion body: {}", e)))?;
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| RewriteJobError::Malformed("completion has no content".to_string()))?;
    parse_report(&content)
}

pub struct ChatCompletionExecutor {
    client: reqwest::Client,
    api_url: String,
    model: String,
    api_key: Option<String>,
}

impl ChatCompletionExecutor {
    pub fn new(config: &RewriteConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client for rewrite executor")?;
        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl RewriteExecutor for ChatCompletionExecutor {
    async fn rewrite(&self, job: &RewriteJob) -> Result<RewriteReport, RewriteJobError> {
        let prompt = user_prompt(&job.content);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let mut builder = self.client.post(&self.api_url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder.send().await.map_err(RewriteJobError::Request)?;

        let status = resp.status();
        let body = resp.text().await.map_err(RewriteJobError::Request)?;
        if !status.is_success() {
            return Err(RewriteJobError::Status {
                code: status.as_u16(),
                body,
            });
        }
        parse_completion(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::StatusCode, routing::post};

    #[test]
    fn test_user_prompt_embeds_file_content() {
        let prompt = user_prompt("class A extends React.Component {}");
        assert!(prompt.starts_with("Analyze the following code"));
        assert!(prompt.contains("\"refactored_code_comments\""));
        assert!(prompt.ends_with("class A extends React.Component {}"));
    }

    #[test]
    fn test_parse_report_plain_and_fenced() {
        let json = r#"{"refactored_code":"const a = 1;","refactored_code_comments":"var -> const"}"#;
        let report = parse_report(json).unwrap();
        assert_eq!(report.refactored_code, "const a = 1;");

        let fenced = format!("```json\n{}\n```", json);
        assert_eq!(parse_report(&fenced).unwrap(), report);
    }

    #[test]
    fn test_parse_report_rejects_missing_or_empty_code() {
        assert!(matches!(
            parse_report(r#"{"refactored_code_comments":"x"}"#),
            Err(RewriteJobError::Malformed(_))
        ));
        assert!(matches!(
            parse_report(r#"{"refactored_code":"  ","refactored_code_comments":"x"}"#),
            Err(RewriteJobError::Malformed(_))
        ));
        assert!(matches!(parse_report("sorry, I can't"), Err(RewriteJobError::Malformed(_))));
    }

    #[test]
    fn test_parse_completion_without_choices() {
        assert!(matches!(
            parse_completion(r#"{"choices":[]}"#),
            Err(RewriteJobError::Malformed(_))
        ));
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/v1/chat/completions", addr)
    }

    fn config(api_url: String) -> RewriteConfig {
        RewriteConfig {
            api_url,
            api_key: Some("test-key".to_string()),
            timeout_secs: 5,
            ..RewriteConfig::default()
        }
    }

    fn job() -> RewriteJob {
        RewriteJob {
            path: "src/app.js".to_string(),
            content: "var a = 1;".to_string(),
        }
    }

    #[tokio::test]
    async fn test_executor_round_trip_against_local_endpoint() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["response_format"]["type"], "json_object");
                assert_eq!(body["messages"][0]["role"], "system");
                let user = body["messages"][1]["content"].as_str().unwrap_or_default();
                assert!(user.ends_with("var a = 1;"));
                let content = serde_json::json!({
                    "refactored_code": "const a = 1;",
                    "refactored_code_comments": "Use const."
                })
                .to_string();
                Json(serde_json::json!({
                    "choices": [{"message": {"role": "assistant", "content": content}}]
                }))
            }),
        );
        let url = serve(router).await;
        let executor = ChatCompletionExecutor::new(&config(url)).unwrap();

        let report = executor.rewrite(&job()).await.unwrap();
        assert_eq!(report.refactored_code, "const a = 1;");
        assert_eq!(report.refactored_code_comments, "Use const.");
    }

    #[tokio::test]
    async fn test_executor_maps_error_status() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::TOO_MANY_REQUESTS, "rate limited") }),
        );
        let url = serve(router).await;
        let executor = ChatCompletionExecutor::new(&config(url)).unwrap();

        match executor.rewrite(&job()).await {
            Err(RewriteJobError::Status { code, body }) => {
                assert_eq!(code, 429);
                assert_eq!(body, "rate limited");
            }
            other => panic!("Expected Status error, got {:?}", other),
        }
    }
}
