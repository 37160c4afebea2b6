//! Typed provider responses.
//!
//! Which shape to parse is decided from the model before the call is made;
//! the payload is never probed to guess it.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;

use super::payload::ModelShape;
use super::ImagePayload;

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedImage {
    pub payload: ImagePayload,
    pub mime_type: String,
}

#[derive(Debug, Clone)]
pub enum ProviderResponse {
    Predictions(PredictResponse),
    Content(ContentResponse),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PredictResponse {
    #[serde(default)]
    pub predictions: Vec<Prediction>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub bytes_base64_encoded: Option<String>,
    pub gcs_uri: Option<String>,
    pub mime_type: Option<String>,
    pub rai_filtered_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    pub prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub content: Option<Content>,
    pub finish_reason: Option<String>,
    pub finish_message: Option<String>,
    #[serde(default)]
    pub safety_ratings: Vec<SafetyRating>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub inline_data: Option<InlineData>,
    pub file_data: Option<FileData>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub mime_type: Option<String>,
    pub file_uri: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    pub block_reason: Option<String>,
    pub block_reason_message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SafetyRating {
    pub category: Option<String>,
    pub probability: Option<String>,
    #[serde(default)]
    pub blocked: bool,
}

const DEFAULT_MIME: &str = "image/png";

impl ProviderResponse {
    pub fn parse(shape: ModelShape, raw: &Value) -> Result<Self, serde_json::Error> {
        Ok(match shape {
            ModelShape::Instances => Self::Predictions(PredictResponse::deserialize(raw)?),
            ModelShape::Parts => Self::Content(ContentResponse::deserialize(raw)?),
        })
    }

    /// First image in the response, or a description of why there was none.
    pub fn first_image(&self) -> Result<ExtractedImage, String> {
        match self {
            Self::Predictions(resp) => resp.first_image(),
            Self::Content(resp) => resp.first_image(),
        }
    }
}

fn decode(data: &str) -> Result<Vec<u8>, String> {
    BASE64
        .decode(data.as_bytes())
        .map_err(|err| format!("image payload is not valid base64: {err}"))
}

/// Only http(s) result URLs can be downloaded; bucket URIs such as `gs://`
/// are an error.
fn fetchable(uri: &str) -> Result<ImagePayload, String> {
    let scheme = uri.split_once("://").map(|(scheme, _)| scheme.to_ascii_lowercase());
    match scheme.as_deref() {
        Some("http" | "https") => Ok(ImagePayload::Url(uri.to_string())),
        _ => Err(format!(
            "provider returned a result URI that cannot be fetched over HTTP: {uri}"
        )),
    }
}

impl PredictResponse {
    fn first_image(&self) -> Result<ExtractedImage, String> {
        for prediction in &self.predictions {
            let mime_type = prediction
                .mime_type
                .clone()
                .unwrap_or_else(|| DEFAULT_MIME.to_string());
            if let Some(data) = prediction.bytes_base64_encoded.as_deref().filter(|d| !d.is_empty()) {
                return Ok(ExtractedImage {
                    payload: ImagePayload::Bytes(decode(data)?),
                    mime_type,
                });
            }
            if let Some(uri) = &prediction.gcs_uri {
                return Ok(ExtractedImage {
                    payload: fetchable(uri)?,
                    mime_type,
                });
            }
        }

        let reasons: Vec<&str> = self
            .predictions
            .iter()
            .filter_map(|p| p.rai_filtered_reason.as_deref())
            .collect();
        if reasons.is_empty() {
            Err(format!(
                "generation finished without an image ({} predictions returned)",
                self.predictions.len()
            ))
        } else {
            Err(format!(
                "generation was blocked by the provider: {}",
                reasons.join("; ")
            ))
        }
    }
}

impl ContentResponse {
    fn first_image(&self) -> Result<ExtractedImage, String> {
        let parts = self
            .candidates
            .iter()
            .filter_map(|c| c.content.as_ref())
            .flat_map(|content| content.parts.iter());
        for part in parts {
            if let Some(inline) = part.inline_data.as_ref().filter(|i| !i.data.is_empty()) {
                return Ok(ExtractedImage {
                    payload: ImagePayload::Bytes(decode(&inline.data)?),
                    mime_type: inline.mime_type.clone(),
                });
            }
            if let Some(file) = &part.file_data {
                return Ok(ExtractedImage {
                    payload: fetchable(&file.file_uri)?,
                    mime_type: file
                        .mime_type
                        .clone()
                        .unwrap_or_else(|| DEFAULT_MIME.to_string()),
                });
            }
        }
        Err(self.no_image_reason())
    }

    fn no_image_reason(&self) -> String {
        let mut details = Vec::new();
        if let Some(feedback) = &self.prompt_feedback {
            if let Some(reason) = &feedback.block_reason {
                let mut text = format!("prompt blocked ({reason})");
                if let Some(message) = &feedback.block_reason_message {
                    text.push_str(&format!(": {message}"));
                }
                details.push(text);
            }
        }
        for candidate in &self.candidates {
            if let Some(reason) = &candidate.finish_reason {
                let mut text = format!("finish reason {reason}");
                if let Some(message) = &candidate.finish_message {
                    text.push_str(&format!(": {message}"));
                }
                details.push(text);
            }
            let blocked: Vec<String> = candidate
                .safety_ratings
                .iter()
                .filter(|r| r.blocked)
                .map(|r| {
                    format!(
                        "{}={}",
                        r.category.as_deref().unwrap_or("UNKNOWN"),
                        r.probability.as_deref().unwrap_or("?")
                    )
                })
                .collect();
            if !blocked.is_empty() {
                details.push(format!("safety filters: {}", blocked.join(", ")));
            }
            let text: Vec<&str> = candidate
                .content
                .iter()
                .flat_map(|c| c.parts.iter())
                .filter_map(|p| p.text.as_deref())
                .collect();
            if !text.is_empty() {
                details.push(format!("model said: {}", text.join(" ")));
            }
        }

        if details.is_empty() {
            format!(
                "generation finished without an image ({} candidates returned)",
                self.candidates.len()
            )
        } else {
            format!("generation finished without an image: {}", details.join("; "))
        }
    }
}
