use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::Client;
use serde_json::{json, Value};

use crate::error::AnalyzerError;
use crate::sensing::ImageRef;

use super::{AnalysisRequest, Analyzer, AnalyzerOutput};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

const MAX_OUTPUT_TOKENS: u32 = 300;

/// Vision model behind an OpenAI-compatible chat completions endpoint.
///
/// The primary frame and any secondary frames are inlined as base64 data
/// URLs: the primary at full detail, secondary frames at low detail, which is
/// how `CostModel::estimate_batch` prices them. Never retries.
#[derive(Debug, Clone)]
pub struct HttpVisionAnalyzer {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    timeout: Option<Duration>,
}

impl HttpVisionAnalyzer {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: None,
            timeout: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Per-request deadline enforced by the HTTP client itself.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn data_url(image: &ImageRef) -> Result<String, AnalyzerError> {
        let bytes = image.load()?;
        let mime = image::guess_format(&bytes)
            .map(|format| format.to_mime_type())
            .unwrap_or("image/png");
        Ok(format!(
            "data:{mime};base64,{}",
            general_purpose::STANDARD.encode(bytes.as_slice())
        ))
    }

    fn body(&self, request: &AnalysisRequest) -> Result<Value, AnalyzerError> {
        let mut content = vec![
            json!({ "type": "text", "text": request.prompt }),
            json!({
                "type": "image_url",
                "image_url": { "url": Self::data_url(&request.primary)?, "detail": "high" }
            }),
        ];
        for secondary in &request.batch_context {
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": Self::data_url(&secondary.image)?, "detail": "low" }
            }));
        }

        Ok(json!({
            "model": self.model,
            "max_tokens": MAX_OUTPUT_TOKENS,
            "messages": [{ "role": "user", "content": content }]
        }))
    }
}

fn transport_error(err: reqwest::Error, timeout: Option<Duration>) -> AnalyzerError {
    match timeout {
        Some(after) if err.is_timeout() => AnalyzerError::Timeout(after),
        _ => AnalyzerError::Http(err),
    }
}

/// Pull `choices[0].message.content` and an optional top-level `confidence`.
pub fn parse_completion(value: &Value) -> Result<AnalyzerOutput, AnalyzerError> {
    if let Some(message) = value.pointer("/error/message").and_then(Value::as_str) {
        return Err(AnalyzerError::Provider(message.to_string()));
    }

    let text = value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .ok_or_else(|| AnalyzerError::InvalidResponse("missing choices[0].message.content".into()))?;

    let confidence = value
        .get("confidence")
        .and_then(Value::as_f64)
        .filter(|c| (0.0..=1.0).contains(c));

    Ok(AnalyzerOutput {
        text: text.to_string(),
        confidence,
    })
}

#[async_trait]
impl Analyzer for HttpVisionAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalyzerOutput, AnalyzerError> {
        let body = self.body(request)?;

        let mut http = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }
        if let Some(timeout) = self.timeout {
            http = http.timeout(timeout);
        }

        log_debug!(
            "posting batch {} ({} image(s)) to {}",
            request.batch_id,
            1 + request.batch_context.len(),
            self.endpoint
        );
        let response = http
            .send()
            .await
            .map_err(|err| transport_error(err, self.timeout))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            log_warn!("analyzer returned {} for batch {}", status, request.batch_id);
            return Err(AnalyzerError::Provider(format!("{status}: {detail}")));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|err| transport_error(err, self.timeout))?;
        parse_completion(&value)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_message_content_and_confidence() {
        let value = json!({
            "choices": [{ "message": { "role": "assistant", "content": "  A code editor  " } }],
            "confidence": 0.93
        });
        let output = parse_completion(&value).unwrap();
        assert_eq!(output.text, "A code editor");
        assert_eq!(output.confidence, Some(0.93));
    }

    #[test]
    fn out_of_range_confidence_is_ignored() {
        let value = json!({
            "choices": [{ "message": { "content": "A browser" } }],
            "confidence": 7.0
        });
        assert_eq!(parse_completion(&value).unwrap().confidence, None);
    }

    #[test]
    fn empty_content_is_invalid() {
        let value = json!({ "choices": [{ "message": { "content": "   " } }] });
        assert!(matches!(
            parse_completion(&value),
            Err(AnalyzerError::InvalidResponse(_))
        ));
    }

    #[test]
    fn provider_error_is_surfaced() {
        let value = json!({ "error": { "message": "rate limited" } });
        assert!(matches!(
            parse_completion(&value),
            Err(AnalyzerError::Provider(msg)) if msg == "rate limited"
        ));
    }

    #[test]
    fn secondary_frames_are_sent_at_low_detail() {
        use crate::analysis::ContextImage;
        use crate::sensing::Fingerprint;
        use chrono::Utc;
        use uuid::Uuid;

        let png_magic = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
        let request = AnalysisRequest {
            batch_id: Uuid::new_v4(),
            frame_id: Uuid::new_v4(),
            primary: ImageRef::encoded(png_magic.clone()),
            context: "Editor".into(),
            fingerprint: Fingerprint::of(&png_magic),
            dimensions: Some((2880, 1800)),
            prompt: "describe".into(),
            batch_context: vec![ContextImage {
                frame_id: Uuid::new_v4(),
                image: ImageRef::encoded(png_magic),
                context: "Editor".into(),
                change_confidence: 0.3,
                captured_at: Utc::now(),
            }],
        };
        let body = HttpVisionAnalyzer::new("http://localhost/v1", "vision")
            .body(&request)
            .unwrap();
        assert_eq!(
            body.pointer("/messages/0/content/1/image_url/detail"),
            Some(&json!("high"))
        );
        assert_eq!(
            body.pointer("/messages/0/content/2/image_url/detail"),
            Some(&json!("low"))
        );
    }

    #[test]
    fn data_url_uses_detected_mime_type() {
        let png_magic = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
        let url = HttpVisionAnalyzer::data_url(&ImageRef::encoded(png_magic)).unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
    }
}
