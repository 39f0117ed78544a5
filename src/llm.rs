use crate::capabilities::{
    ExtractedFields, FieldExtractor, NarrativeRenderer, NarrativeRequest, UrlIdentifier,
};
use crate::config::LLMConfig;
use crate::prompt::{self, EXTRACTION_SYSTEM, REPORT_SYSTEM, URL_DISCOVERY_SYSTEM};
use crate::types::{Retailer, ScrapedContent, SearchPage, UrlSet};
use crate::{PriceError, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// The `LLMProcessor` talks to an OpenAI-compatible chat-completions endpoint.
/// It serves URL discovery, field extraction and narrative rendering.
pub struct LLMProcessor {
    client: Client,
    config: LLMConfig,
    api_key: String,
    /// Page text sent for extraction is cut to this many characters.
    max_page_chars: usize,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Structured answer for URL discovery: one optional URL per retailer.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct ProductUrls {
    /// Amazon product page URL
    pub amazon: Option<String>,
    /// Walmart product page URL
    pub walmart: Option<String>,
    /// Best Buy product page URL
    pub bestbuy: Option<String>,
}

impl ProductUrls {
    fn get(&self, retailer: Retailer) -> Option<&str> {
        match retailer {
            Retailer::Amazon => self.amazon.as_deref(),
            Retailer::Walmart => self.walmart.as_deref(),
            Retailer::BestBuy => self.bestbuy.as_deref(),
        }
    }

    /// Validates every answer into a [`UrlSet`]; rejected answers become absent.
    pub fn into_url_set(self) -> UrlSet {
        let mut urls = UrlSet::new();
        for retailer in Retailer::ALL {
            if let Some(raw) = self.get(retailer) {
                if !urls.insert(retailer, raw) && !raw.trim().is_empty() {
                    warn!(retailer = retailer.key(), url = raw, "Discarding invalid product URL");
                }
            }
        }
        urls
    }
}

/// JSON schema for `T` in the strict form structured-output endpoints expect:
/// every object closed and every property listed as required.
pub fn response_schema<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    let mut value = serde_json::to_value(schema).unwrap_or_default();
    close_objects(&mut value);
    if let Value::Object(map) = &mut value {
        map.remove("$schema");
        map.remove("title");
        map.remove("definitions");
    }
    value
}

fn close_objects(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if map.get("type") == Some(&Value::String("object".to_string())) {
                map.insert("additionalProperties".to_string(), Value::Bool(false));
                if let Some(Value::Object(props)) = map.get("properties") {
                    let required = props.keys().cloned().map(Value::String).collect();
                    map.insert("required".to_string(), Value::Array(required));
                }
            }
            for (_, v) in map.iter_mut() {
                close_objects(v);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(close_objects),
        _ => {}
    }
}

/// Drops a surrounding Markdown code fence, which some models add despite
/// being asked for JSON.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

impl LLMProcessor {
    /// Creates a client for `config.endpoint` authenticated with `api_key`.
    pub fn new(config: LLMConfig, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            config,
            api_key: api_key.into(),
            max_page_chars: 20_000,
        })
    }

    pub fn with_max_page_chars(mut self, max_page_chars: usize) -> Self {
        self.max_page_chars = max_page_chars;
        self
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| PriceError::ConfigError("LLM API key is not a valid header".into()))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Sends a plain chat request and returns the reply text.
    pub async fn process(&self, system: &str, prompt: &str) -> Result<String> {
        self.send(system, prompt, None).await
    }

    /// Sends a request constrained to `T`'s schema and parses the reply.
    pub async fn structured<T>(&self, system: &str, prompt: &str) -> Result<T>
    where
        T: JsonSchema + DeserializeOwned,
    {
        let format = serde_json::json!({
            "type": "json_schema",
            "json_schema": {
                "name": T::schema_name(),
                "strict": true,
                "schema": response_schema::<T>(),
            }
        });

        let content = self.send(system, prompt, Some(format)).await?;
        serde_json::from_str(strip_code_fence(&content)).map_err(|e| {
            PriceError::LLMError(format!(
                "reply does not match the {} schema: {}",
                T::schema_name(),
                e
            ))
        })
    }

    #[instrument(skip_all, fields(model = %self.config.model, structured = response_format.is_some()))]
    async fn send(
        &self,
        system: &str,
        prompt: &str,
        response_format: Option<Value>,
    ) -> Result<String> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            response_format,
        };

        debug!(prompt_chars = prompt.len(), "LLM request");

        let response = self
            .client
            .post(&self.config.endpoint)
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => PriceError::RateLimitError,
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PriceError::Unauthorized(
                    format!("LLM endpoint rejected the API key ({})", status),
                ),
                _ => PriceError::LLMError(format!("{}: {}", status, body.trim())),
            });
        }

        let reply: ChatResponse = response.json().await?;
        reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| PriceError::LLMError("empty reply".to_string()))
    }
}

#[async_trait]
impl UrlIdentifier for LLMProcessor {
    async fn identify_urls(&self, query: &str, pages: &[SearchPage]) -> Result<UrlSet> {
        let prompt = prompt::url_discovery_prompt(query, pages);
        let answer: ProductUrls = self.structured(URL_DISCOVERY_SYSTEM, &prompt).await?;
        Ok(answer.into_url_set())
    }
}

#[async_trait]
impl FieldExtractor for LLMProcessor {
    async fn extract_fields(
        &self,
        retailer: Retailer,
        page: &ScrapedContent,
    ) -> Result<ExtractedFields> {
        let prompt = prompt::extraction_prompt(retailer, page, self.max_page_chars);
        self.structured(EXTRACTION_SYSTEM, &prompt).await
    }
}

#[async_trait]
impl NarrativeRenderer for LLMProcessor {
    async fn render_narrative(&self, request: &NarrativeRequest) -> Result<String> {
        self.process(REPORT_SYSTEM, &prompt::report_prompt(request))
            .await
    }
}
