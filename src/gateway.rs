//! HTTP client for the generation and physical-button backend.
//!
//! The gateway is stateless apart from its base address and connection
//! pool. It never retries; callers decide what a failure means.

use std::time::Duration;

use percent_encoding::percent_decode_str;
use reqwest::blocking::{Client, Response};
use reqwest::Url;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Port the backend listens on when inferred from the origin
pub const BACKEND_PORT: u16 = 65500;
pub const LOOPBACK_BASE: &str = "http://127.0.0.1:65500";

/// Resolve the backend base address: explicit override, then inference
/// from the client's origin, then loopback.
pub fn resolve_base_url(api_override: Option<&str>, origin: Option<&str>) -> String {
    if let Some(raw) = api_override.map(str::trim).filter(|s| !s.is_empty()) {
        let decoded = percent_decode_str(raw)
            .decode_utf8()
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| raw.to_string());
        return decoded.trim_end_matches('/').to_string();
    }

    match origin.and_then(split_origin) {
        Some((scheme, host)) if scheme.starts_with("http") => {
            if host == "localhost" || host == "127.0.0.1" {
                LOOPBACK_BASE.to_string()
            } else {
                format!("{scheme}://{host}:{BACKEND_PORT}")
            }
        }
        _ => LOOPBACK_BASE.to_string(),
    }
}

/// `scheme://host[:port]/...` -> (scheme, host)
fn split_origin(origin: &str) -> Option<(String, String)> {
    let url = Url::parse(origin.trim()).ok()?;
    let host = url.host_str().filter(|h| !h.is_empty())?;
    Some((url.scheme().to_string(), host.to_ascii_lowercase()))
}

/// Extra data the image endpoint may return alongside the image
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DebugInfo {
    #[serde(default)]
    pub final_prompt: Option<String>,
    #[serde(default)]
    pub random_instruction: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub image_url: String,
    pub debug: Option<DebugInfo>,
}

impl GeneratedImage {
    /// Instruction the backend mixed into this image, empty if none
    pub fn instruction(&self) -> &str {
        self.debug
            .as_ref()
            .and_then(|d| d.random_instruction.as_deref())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonPress {
    pub pressed: bool,
    /// Button number as reported; not validated here
    pub button: Option<i64>,
}

/// Everything the client asks of the backend
pub trait Backend: Send + Sync {
    fn text_variants(&self, prompt: &str, history: &[String], image_url: &str)
        -> Result<[String; 2]>;
    fn image(&self, image_url: &str, prompt: &str) -> Result<GeneratedImage>;
    fn summary(&self, variant_text: &str, instruction: &str) -> Result<String>;
    fn reflection(&self, prompt: &str, history: &[String]) -> Result<String>;
    fn remove_instruction(&self, instruction: &str) -> Result<Value>;
    fn instruction_count(&self) -> Result<u64>;
    fn button_status(&self) -> Result<bool>;
    fn poll_button(&self) -> Result<ButtonPress>;
}

#[derive(Serialize)]
struct TextVariantsRequest<'a> {
    prompt: &'a str,
    history: &'a [String],
    #[serde(rename = "imageUrl")]
    image_url: &'a str,
}

#[derive(Deserialize)]
struct TextVariantsResponse {
    variants: Vec<String>,
}

#[derive(Serialize)]
struct ImageRequest<'a> {
    #[serde(rename = "imageUrl")]
    image_url: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct ImageResponse {
    #[serde(rename = "modifiedImageUrl")]
    modified_image_url: String,
    #[serde(default)]
    debug_info: Option<DebugInfo>,
}

#[derive(Serialize)]
struct SummaryRequest<'a> {
    variant_text: &'a str,
    instruction: &'a str,
}

#[derive(Deserialize)]
struct SummaryResponse {
    summary: String,
}

#[derive(Serialize)]
struct ReflectionRequest<'a> {
    prompt: &'a str,
    history: &'a [String],
}

#[derive(Deserialize)]
struct ReflectionResponse {
    #[serde(default)]
    reflection: Option<String>,
}

#[derive(Serialize)]
struct RemoveInstructionRequest<'a> {
    instruction: &'a str,
}

#[derive(Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Deserialize)]
struct ButtonStatusResponse {
    #[serde(default)]
    physical_buttons_enabled: bool,
}

#[derive(Deserialize)]
struct ButtonPressResponse {
    #[serde(default)]
    button_pressed: bool,
    #[serde(default)]
    button: Value,
}

/// Accepts `1`, `"1"`, `1.0`; anything else is `None`
fn button_number(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Production [`Backend`] over blocking HTTP
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    base: String,
}

impl HttpGateway {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base: base.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        tracing::debug!(path, "POST");
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .map_err(|e| Error::Network(format!("POST {path} failed: {e}")))?;
        Self::decode(path, response)
    }

    fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        tracing::debug!(path, "GET");
        let response = self
            .client
            .get(self.url(path))
            .send()
            .map_err(|e| Error::Network(format!("GET {path} failed: {e}")))?;
        Self::decode(path, response)
    }

    fn decode<T: DeserializeOwned>(path: &str, response: Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .unwrap_or_else(|_| "failed to read error body".to_string());
            tracing::warn!(path, status = status.as_u16(), "backend returned an error");
            return Err(Error::backend(Some(status.as_u16()), body));
        }
        let text = response
            .text()
            .map_err(|e| Error::Network(format!("reading {path} response failed: {e}")))?;
        serde_json::from_str(&text).map_err(|e| {
            Error::backend(
                Some(status.as_u16()),
                format!("malformed {path} response: {e}"),
            )
        })
    }
}

impl Backend for HttpGateway {
    fn text_variants(
        &self,
        prompt: &str,
        history: &[String],
        image_url: &str,
    ) -> Result<[String; 2]> {
        let response: TextVariantsResponse = self.post(
            "/generate-text-variants",
            &TextVariantsRequest {
                prompt,
                history,
                image_url,
            },
        )?;
        let mut variants = response.variants.into_iter();
        match (variants.next(), variants.next()) {
            (Some(a), Some(b)) => Ok([a, b]),
            _ => Err(Error::backend(None, "expected two text variants")),
        }
    }

    fn image(&self, image_url: &str, prompt: &str) -> Result<GeneratedImage> {
        let response: ImageResponse =
            self.post("/generate-image", &ImageRequest { image_url, prompt })?;
        Ok(GeneratedImage {
            image_url: response.modified_image_url,
            debug: response.debug_info,
        })
    }

    fn summary(&self, variant_text: &str, instruction: &str) -> Result<String> {
        let response: SummaryResponse = self.post(
            "/generate_summary",
            &SummaryRequest {
                variant_text,
                instruction,
            },
        )?;
        Ok(response.summary)
    }

    fn reflection(&self, prompt: &str, history: &[String]) -> Result<String> {
        let response: ReflectionResponse =
            self.post("/generate-reflection", &ReflectionRequest { prompt, history })?;
        Ok(response.reflection.unwrap_or_default())
    }

    fn remove_instruction(&self, instruction: &str) -> Result<Value> {
        self.post(
            "/remove-instruction",
            &RemoveInstructionRequest { instruction },
        )
    }

    fn instruction_count(&self) -> Result<u64> {
        let response: CountResponse = self.get("/get-instructions-count")?;
        Ok(response.count)
    }

    fn button_status(&self) -> Result<bool> {
        let response: ButtonStatusResponse = self.get("/button-status")?;
        Ok(response.physical_buttons_enabled)
    }

    fn poll_button(&self) -> Result<ButtonPress> {
        let response: ButtonPressResponse = self.get("/check-button-press")?;
        Ok(ButtonPress {
            pressed: response.button_pressed,
            button: button_number(&response.button),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn override_wins_and_is_decoded() {
        assert_eq!(
            resolve_base_url(Some("http%3A%2F%2F10.1.2.3%3A9000%2F"), Some("http://example.org")),
            "http://10.1.2.3:9000"
        );
        assert_eq!(
            resolve_base_url(Some("http://host:1"), None),
            "http://host:1"
        );
    }

    #[test]
    fn broken_escape_is_used_verbatim() {
        assert_eq!(resolve_base_url(Some("http://h/%zz"), None), "http://h/%zz");
    }

    #[test]
    fn non_utf8_escape_is_used_verbatim() {
        assert_eq!(resolve_base_url(Some("http://h/%FF"), None), "http://h/%FF");
    }

    #[test]
    fn blank_override_is_ignored() {
        assert_eq!(resolve_base_url(Some("  "), None), LOOPBACK_BASE);
    }

    #[test]
    fn local_origins_use_loopback() {
        assert_eq!(
            resolve_base_url(None, Some("http://localhost:8080/index.html")),
            LOOPBACK_BASE
        );
        assert_eq!(
            resolve_base_url(None, Some("http://127.0.0.1:5500")),
            LOOPBACK_BASE
        );
    }

    #[test]
    fn remote_origin_keeps_scheme_and_host() {
        assert_eq!(
            resolve_base_url(None, Some("https://Gallery.local:8443/show?x=1")),
            "https://gallery.local:65500"
        );
    }

    #[test]
    fn file_origin_and_absent_origin_fall_back() {
        assert_eq!(
            resolve_base_url(None, Some("file:///home/me/index.html")),
            LOOPBACK_BASE
        );
        assert_eq!(resolve_base_url(None, None), LOOPBACK_BASE);
        assert_eq!(resolve_base_url(None, Some("garbage")), LOOPBACK_BASE);
    }

    #[test]
    fn button_numbers_are_coerced() {
        assert_eq!(button_number(&json!(1)), Some(1));
        assert_eq!(button_number(&json!("2")), Some(2));
        assert_eq!(button_number(&json!(2.0)), Some(2));
        assert_eq!(button_number(&json!(1.9)), None);
        assert_eq!(button_number(&json!(-0.5)), None);
        assert_eq!(button_number(&json!(null)), None);
        assert_eq!(button_number(&json!("left")), None);
    }

    #[test]
    fn unreachable_backend_is_a_network_error() {
        // port 9 (discard) is essentially never listening on loopback
        let gw = HttpGateway::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        assert_matches!(gw.instruction_count(), Err(Error::Network(_)));
        assert_matches!(gw.button_status(), Err(Error::Network(_)));
    }
}
