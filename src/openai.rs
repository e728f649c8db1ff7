use crate::config::Config;
use crate::error::{AnalysisError, TransportError};
use crate::models::RepositoryStats;
use crate::utils::{
    RateGate, RetryPolicy, MAX_RETRIES, MAX_RETRY_DELAY_MS, MIN_REQUEST_INTERVAL_MS,
    RETRY_DELAY_MS,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const CODE_ANALYSIS: &str = "code analysis";
const DOCUMENTATION: &str = "documentation generation";
const INSIGHTS: &str = "insight extraction";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_min_interval")]
    pub min_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,
}

fn default_min_interval() -> u64 {
    MIN_REQUEST_INTERVAL_MS
}
fn default_max_retries() -> u32 {
    MAX_RETRIES
}
fn default_base_delay() -> u64 {
    RETRY_DELAY_MS
}
fn default_max_delay() -> u64 {
    MAX_RETRY_DELAY_MS
}
fn default_queue_capacity() -> usize {
    64
}
fn default_timeout() -> u64 {
    60
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            queue_capacity: default_queue_capacity(),
            request_timeout_secs: default_timeout(),
        }
    }
}

impl ClientSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}
#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}
#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}
#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}
#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
}
#[derive(Debug, Deserialize)]
struct ModelResponse {
    data: Vec<Model>,
}
#[derive(Debug, Deserialize)]
struct Model {
    id: String,
}

/// 單次送出聊天請求的介面；佇列與重試由 [`AnalysisClient`] 負責
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<String, TransportError>;
}

/// OpenAI 相容的 `/chat/completions` 端點
pub struct OpenAiTransport {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl OpenAiTransport {
    pub fn new(api_url: &str, api_key: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                error!("無法建立自訂逾時的 HTTP client，改用預設值：{}", e);
                Client::new()
            });
        Self {
            client,
            endpoint: format!("{}/chat/completions", api_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
        }
    }
}

/// 將錯誤回應分類；429 或錯誤碼含 rate_limit 視為限流
fn classify_error(status: StatusCode, retry_after: Option<Duration>, text: &str) -> TransportError {
    let body = serde_json::from_str::<ErrorEnvelope>(text).ok().map(|e| e.error);
    let message = body
        .as_ref()
        .map(|b| b.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| text.to_string());
    let code_says_rate_limit = body.as_ref().map_or(false, |b| {
        let code = b.code.as_ref().map(|c| c.to_string()).unwrap_or_default();
        let kind = b.kind.clone().unwrap_or_default();
        code.contains("rate_limit") || kind.contains("rate_limit")
    });
    if status == StatusCode::TOO_MANY_REQUESTS || code_says_rate_limit {
        TransportError::RateLimited {
            retry_after,
            message,
        }
    } else {
        TransportError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

fn first_choice(response_text: &str) -> Result<String, TransportError> {
    let chat_resp: ChatResponse = serde_json::from_str(response_text)?;
    chat_resp
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| TransportError::InvalidResponse("AI 未返回任何選項".to_string()))
}

#[async_trait]
impl ChatTransport for OpenAiTransport {
    async fn complete(&self, request: &ChatRequest) -> Result<String, TransportError> {
        debug!("發送 API 請求至：{}", self.endpoint);
        let resp = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_error(status, retry_after, &text));
        }
        let response_text = resp.text().await?;
        debug!("API 回應長度：{}", response_text.len());
        first_choice(&response_text)
    }
}

/// 從 API 獲取可用的模型列表
pub async fn get_available_models(api_url: &str, api_key: &str) -> Result<Vec<String>> {
    let client = Client::new();
    let response = client
        .get(format!("{}/models", api_url.trim_end_matches('/')))
        .header("Authorization", format!("Bearer {}", api_key))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(anyhow!("Failed to get models: {}", response.status()));
    }
    let model_response: ModelResponse = response.json().await?;
    Ok(model_response.data.into_iter().map(|m| m.id).collect())
}

/// 程式碼分析的焦點
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisFocus {
    Security,
    Quality,
}

struct QueuedRequest {
    operation: &'static str,
    request: ChatRequest,
    reply: oneshot::Sender<Result<String, AnalysisError>>,
}

struct Worker {
    transport: Arc<dyn ChatTransport>,
    policy: RetryPolicy,
    gate: RateGate,
}

impl Worker {
    async fn run(mut self, mut receiver: mpsc::Receiver<QueuedRequest>) {
        while let Some(queued) = receiver.recv().await {
            let result = self.dispatch(queued.operation, &queued.request).await;
            if queued.reply.send(result).is_err() {
                debug!(operation = queued.operation, "呼叫端已放棄等待結果");
            }
        }
        debug!("分析佇列已關閉，worker 結束");
    }

    async fn dispatch(
        &mut self,
        operation: &'static str,
        request: &ChatRequest,
    ) -> Result<String, AnalysisError> {
        let mut retries = 0u32;
        loop {
            self.gate.wait().await;
            match self.transport.complete(request).await {
                Ok(text) => return Ok(text),
                Err(TransportError::RateLimited {
                    retry_after,
                    message,
                }) => {
                    if retries >= self.policy.max_retries {
                        error!(operation, attempts = retries + 1, "重試次數用盡，仍被限流");
                        return Err(AnalysisError::RateLimitExceeded {
                            operation,
                            attempts: retries + 1,
                        });
                    }
                    retries += 1;
                    let delay = self.policy.delay_for(retries, retry_after);
                    warn!(
                        operation,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        "被限流：{}，稍後重試",
                        message
                    );
                    sleep(delay).await;
                }
                Err(source) => {
                    error!(operation, "API 請求失敗：{}", source);
                    return Err(AnalysisError::Operation { operation, source });
                }
            }
        }
    }
}

/// 外部 LLM 的唯一入口。所有請求進入同一個 FIFO 佇列，
/// 由單一 worker 依最小間隔逐一送出
#[derive(Clone)]
pub struct AnalysisClient {
    sender: mpsc::Sender<QueuedRequest>,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl AnalysisClient {
    /// 建立 client 並在目前的 tokio runtime 上啟動 worker
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        settings: &ClientSettings,
        model: impl Into<String>,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(settings.queue_capacity.max(1));
        let worker = Worker {
            transport,
            policy: settings.retry_policy(),
            gate: RateGate::new(Duration::from_millis(settings.min_interval_ms)),
        };
        tokio::spawn(worker.run(receiver));
        Self {
            sender,
            model: model.into(),
            max_tokens,
            temperature,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let transport = OpenAiTransport::new(
            &config.api_url,
            &config.api_key,
            Duration::from_secs(config.client.request_timeout_secs),
        );
        info!(model = %config.model, "建立分析 client");
        Self::new(
            Arc::new(transport),
            &config.client,
            config.model.clone(),
            config.max_tokens,
            config.temperature,
        )
    }

    async fn submit(
        &self,
        operation: &'static str,
        messages: Vec<ChatMessage>,
    ) -> Result<String, AnalysisError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        let (reply, response) = oneshot::channel();
        self.sender
            .send(QueuedRequest {
                operation,
                request,
                reply,
            })
            .await
            .map_err(|_| AnalysisError::QueueClosed)?;
        response.await.map_err(|_| AnalysisError::QueueClosed)?
    }

    pub async fn analyze_code(
        &self,
        path: &str,
        content: &str,
        focus: AnalysisFocus,
    ) -> Result<String, AnalysisError> {
        let (system, prompt) = match focus {
            AnalysisFocus::Security => (
                "You are a senior application security reviewer.",
                format!(
"Review the file `{}` for security vulnerabilities.
Report each one on its own paragraph in this form:
Vulnerability: <short title, mention Critical, High or Low severity when it applies>
<description, mention the line as \"line N\" when known>

Separate findings with a blank line. If there are none, say so in one sentence.

{}",
                    path, content
                ),
            ),
            AnalysisFocus::Quality => (
                "You are a senior engineer reviewing code quality.",
                format!(
"Review the file `{}` for code quality problems.
Report each one on its own paragraph in this form:
Issue: <short title, mention Error or Warning when it applies>
<description, mention the line as \"line N\" when known>
Use \"Improvement:\" instead of \"Issue:\" for suggestions.

Separate findings with a blank line.

{}",
                    path, content
                ),
            ),
        };
        self.submit(
            CODE_ANALYSIS,
            vec![ChatMessage::system(system), ChatMessage::user(prompt)],
        )
        .await
    }

    pub async fn generate_documentation(
        &self,
        stats: &RepositoryStats,
        snippets: &[(String, String)],
    ) -> Result<String, AnalysisError> {
        let mut files = String::new();
        for (path, snippet) in snippets {
            files.push_str(&format!("--- {} ---\n{}\n\n", path, snippet));
        }
        let prompt = format!(
"Write documentation for this repository with exactly these headings:
## Overview
## Architecture
## Setup
## Deployment

Repository facts: {} files, {} lines, languages: {}.

Representative files:
{}",
            stats.total_files,
            stats.total_lines,
            language_summary(stats),
            files
        );
        self.submit(
            DOCUMENTATION,
            vec![
                ChatMessage::system("You are a technical writer documenting software projects."),
                ChatMessage::user(prompt),
            ],
        )
        .await
    }

    pub async fn extract_insights(
        &self,
        stats: &RepositoryStats,
        context: &str,
    ) -> Result<String, AnalysisError> {
        let prompt = format!(
"List up to 7 short, concrete insights about this repository, one per line, as a bulleted list.

Files: {}
Lines: {}
Languages: {}
Complexity: {}

{}",
            stats.total_files,
            stats.total_lines,
            language_summary(stats),
            stats.complexity,
            context
        );
        self.submit(
            INSIGHTS,
            vec![
                ChatMessage::system("You are a software architect summarising a code base."),
                ChatMessage::user(prompt),
            ],
        )
        .await
    }
}

fn language_summary(stats: &RepositoryStats) -> String {
    if stats.languages.is_empty() {
        return "unknown".to_string();
    }
    stats
        .languages
        .iter()
        .map(|(lang, share)| format!("{} {}%", lang, share))
        .collect::<Vec<_>>()
        .join(", ")
}
