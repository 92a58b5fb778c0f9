//! HTTP strategy agent over a messages-style LLM API

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::{AgentRequest, AgentResponse, AgentUsage, StrategyAgent};
use crate::config::AgentSettings;
use crate::error::AgentError;

const API_VERSION: &str = "2023-06-01";

const SYSTEM_PROMPT: &str = "You are the strategy agent for an automated portfolio monitor. \
    Review the portfolio and the escalation reason, prioritise capital preservation, \
    and answer with ANALYSIS, KEY FINDINGS and RECOMMENDATIONS sections.";

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

/// Token pricing, USD per million tokens
#[derive(Debug, Clone, Copy)]
struct Pricing {
    input: f64,
    output: f64,
}

#[derive(Clone)]
pub struct HttpStrategyAgent {
    http_client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    timeout: Duration,
    pricing: Pricing,
}

impl HttpStrategyAgent {
    pub fn new(settings: &AgentSettings) -> Result<Self> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| anyhow!("No agent API key; set MONITOR_AGENT_API_KEY or ANTHROPIC_API_KEY"))?;

        // The invoker enforces the per-attempt deadline; this is a backstop
        let http_client = Client::builder()
            .timeout(settings.timeout() + Duration::from_secs(5))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(HttpStrategyAgent {
            http_client,
            endpoint: settings.endpoint.clone(),
            api_key,
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            timeout: settings.timeout(),
            pricing: Pricing {
                input: settings.input_cost_per_mtok,
                output: settings.output_cost_per_mtok,
            },
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

fn parse_response(body: &str, pricing: Pricing) -> Result<AgentResponse, AgentError> {
    let parsed: MessagesResponse =
        serde_json::from_str(body).map_err(|e| AgentError::Parse(e.to_string()))?;

    let text = parsed
        .content
        .iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text.as_deref())
        .collect::<Vec<_>>()
        .join("\n");
    if text.trim().is_empty() {
        return Err(AgentError::Parse("response contained no text".to_string()));
    }

    let mut response = AgentResponse::new(text);
    if let Some(usage) = parsed.usage {
        response = response.with_usage(AgentUsage::priced(
            usage.input_tokens,
            usage.output_tokens,
            pricing.input,
            pricing.output,
        ));
    }
    Ok(response)
}

#[async_trait]
impl StrategyAgent for HttpStrategyAgent {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": SYSTEM_PROMPT,
            "messages": [{ "role": "user", "content": request.prompt() }],
        });

        let response = self
            .http_client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AgentError::Timeout(self.timeout)
                } else {
                    AgentError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(AgentError::from_status(status.as_u16(), text));
        }

        parse_response(&text, self.pricing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const PRICING: Pricing = Pricing {
        input: 3.0,
        output: 15.0,
    };

    #[test]
    fn test_parse_text_and_usage() {
        let body = r#"{
            "id": "msg_1",
            "content": [
                {"type": "text", "text": "ANALYSIS\nok"},
                {"type": "tool_use", "id": "t1", "name": "x", "input": {}},
                {"type": "text", "text": "RECOMMENDATIONS\n1. SELL 3 NVDA"}
            ],
            "usage": {"input_tokens": 1000000, "output_tokens": 100000}
        }"#;
        let response = parse_response(body, PRICING).unwrap();
        assert!(response.text.contains("ANALYSIS"));
        assert_eq!(response.order_intents().len(), 1);
        let usage = response.usage.unwrap();
        assert_relative_eq!(usage.cost_usd, 3.0 + 1.5);
    }

    #[test]
    fn test_parse_errors_are_not_retriable() {
        let err = parse_response("not json", PRICING).unwrap_err();
        assert!(!err.is_retriable());

        let err = parse_response(r#"{"content": []}"#, PRICING).unwrap_err();
        assert!(matches!(err, AgentError::Parse(_)));
    }

    #[test]
    fn test_requires_api_key() {
        let settings = AgentSettings::default();
        assert!(HttpStrategyAgent::new(&settings).is_err());

        let settings = AgentSettings {
            api_key: Some("sk-test".to_string()),
            ..AgentSettings::default()
        };
        let agent = HttpStrategyAgent::new(&settings).unwrap();
        assert_eq!(agent.model(), settings.model);
    }
}
