//! Model selection and request bodies for the two provider request shapes.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Map, Value};

use super::aspect::AspectRatio;
use super::imaging::PreparedImage;
use super::Resolution;

pub const FALLBACK_MODEL: &str = "gemini-2.5-flash-image";
pub const DEFAULT_UPSCALE_MODEL: &str = "imagen-4.0-upscale-preview";
pub const MAX_REFERENCE_IMAGES: usize = 3;

/// Upper end of the legacy guidance scale that `strength = 1.0` maps to.
const GUIDANCE_SCALE_MAX: f32 = 30.0;

const INSTANCES_RATIOS: [AspectRatio; 5] = [
    AspectRatio::new(1, 1),
    AspectRatio::new(3, 4),
    AspectRatio::new(4, 3),
    AspectRatio::new(9, 16),
    AspectRatio::new(16, 9),
];

const PARTS_RATIOS: [AspectRatio; 10] = [
    AspectRatio::new(21, 9),
    AspectRatio::new(16, 9),
    AspectRatio::new(3, 2),
    AspectRatio::new(4, 3),
    AspectRatio::new(5, 4),
    AspectRatio::new(1, 1),
    AspectRatio::new(4, 5),
    AspectRatio::new(3, 4),
    AspectRatio::new(2, 3),
    AspectRatio::new(9, 16),
];

/// Explicit override, then the configured default, then [`FALLBACK_MODEL`].
pub fn select_model(override_model: Option<&str>, configured: Option<&str>) -> String {
    override_model
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .or_else(|| configured.map(str::trim).filter(|m| !m.is_empty()))
        .unwrap_or(FALLBACK_MODEL)
        .to_string()
}

/// The request/response family a model speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelShape {
    /// `instances` in, `predictions` out.
    Instances,
    /// Conversational `contents[].parts` in, `candidates[].content.parts` out.
    Parts,
}

impl ModelShape {
    pub fn for_model(model: &str) -> Self {
        if model.trim().to_ascii_lowercase().starts_with("imagen") {
            ModelShape::Instances
        } else {
            ModelShape::Parts
        }
    }

    pub fn method(self) -> &'static str {
        match self {
            ModelShape::Instances => "predict",
            ModelShape::Parts => "generateContent",
        }
    }

    pub fn supported_ratios(self) -> &'static [AspectRatio] {
        match self {
            ModelShape::Instances => &INSTANCES_RATIOS,
            ModelShape::Parts => &PARTS_RATIOS,
        }
    }

    /// Largest output tier the model produces without a separate upscale.
    pub fn native_resolution(self) -> Resolution {
        match self {
            ModelShape::Instances => Resolution::OneK,
            ModelShape::Parts => Resolution::TwoK,
        }
    }
}

pub fn endpoint(api_base: &str, model: &str, method: &str) -> String {
    format!("{}/models/{model}:{method}", api_base.trim_end_matches('/'))
}

#[derive(Debug, Clone, Copy)]
pub struct PayloadInput<'a> {
    pub prompt: &'a str,
    pub source: Option<&'a PreparedImage>,
    pub references: &'a [PreparedImage],
    pub aspect_ratio: AspectRatio,
    pub resolution: Resolution,
    pub seed: u32,
    pub strength: Option<f32>,
}

pub fn build(shape: ModelShape, input: &PayloadInput<'_>) -> Value {
    match shape {
        ModelShape::Instances => build_instances(input),
        ModelShape::Parts => build_parts(input),
    }
}

fn build_instances(input: &PayloadInput<'_>) -> Value {
    let mut references = Vec::new();
    if let Some(source) = input.source {
        references.push(json!({
            "referenceType": "REFERENCE_TYPE_RAW",
            "referenceId": 1,
            "referenceImage": { "bytesBase64Encoded": BASE64.encode(&source.bytes) },
        }));
    }
    for image in input.references.iter().take(MAX_REFERENCE_IMAGES) {
        let id = references.len() + 1;
        references.push(json!({
            "referenceType": "REFERENCE_TYPE_STYLE",
            "referenceId": id,
            "referenceImage": { "bytesBase64Encoded": BASE64.encode(&image.bytes) },
        }));
    }

    let mut instance = Map::new();
    instance.insert("prompt".into(), Value::String(input.prompt.to_string()));
    if !references.is_empty() {
        instance.insert("referenceImages".into(), Value::Array(references));
    }

    let mut parameters = Map::new();
    parameters.insert("sampleCount".into(), json!(1));
    parameters.insert("seed".into(), json!(input.seed));
    parameters.insert("aspectRatio".into(), json!(input.aspect_ratio.to_string()));
    parameters.insert("outputOptions".into(), json!({ "mimeType": "image/png" }));
    if let Some(strength) = input.strength {
        parameters.insert(
            "guidanceScale".into(),
            json!(strength.clamp(0.0, 1.0) * GUIDANCE_SCALE_MAX),
        );
    }

    json!({
        "instances": [Value::Object(instance)],
        "parameters": Value::Object(parameters),
    })
}

fn build_parts(input: &PayloadInput<'_>) -> Value {
    let mut parts = Vec::new();
    let images = input
        .source
        .into_iter()
        .chain(input.references.iter().take(MAX_REFERENCE_IMAGES));
    for image in images {
        parts.push(json!({
            "inlineData": {
                "mimeType": image.mime_type,
                "data": BASE64.encode(&image.bytes),
            }
        }));
    }
    if !input.prompt.trim().is_empty() {
        parts.push(json!({ "text": input.prompt }));
    }

    let image_size = input.resolution.min(ModelShape::Parts.native_resolution());
    let mut generation_config = Map::new();
    generation_config.insert("responseModalities".into(), json!(["IMAGE"]));
    generation_config.insert("candidateCount".into(), json!(1));
    generation_config.insert("seed".into(), json!(input.seed));
    if let Some(strength) = input.strength {
        generation_config.insert("temperature".into(), json!(strength.clamp(0.0, 1.0)));
    }
    generation_config.insert(
        "imageConfig".into(),
        json!({
            "aspectRatio": input.aspect_ratio.to_string(),
            "imageSize": image_size.as_str(),
        }),
    );

    json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": Value::Object(generation_config),
    })
}

/// Body for the upscaling capability. `factor` is 2 or 4.
pub fn build_upscale(image: &[u8], factor: u32) -> Value {
    json!({
        "instances": [{
            "prompt": "",
            "image": { "bytesBase64Encoded": BASE64.encode(image) },
        }],
        "parameters": {
            "mode": "upscale",
            "upscaleConfig": { "upscaleFactor": format!("x{factor}") },
            "outputOptions": { "mimeType": "image/png" },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepared(tag: u8) -> PreparedImage {
        PreparedImage {
            bytes: vec![tag; 4],
            mime_type: "image/jpeg",
            source_width: 800,
            source_height: 600,
        }
    }

    #[test]
    fn model_selection_order() {
        assert_eq!(select_model(Some("imagen-3"), Some("conf")), "imagen-3");
        assert_eq!(select_model(Some("  "), Some("conf")), "conf");
        assert_eq!(select_model(None, None), FALLBACK_MODEL);
    }

    #[test]
    fn shape_follows_model_family() {
        assert_eq!(ModelShape::for_model("imagen-3.0-capability-001"), ModelShape::Instances);
        assert_eq!(ModelShape::for_model("gemini-2.5-flash-image"), ModelShape::Parts);
        assert_eq!(
            endpoint("https://api.example/v1/", "imagen-3", ModelShape::Instances.method()),
            "https://api.example/v1/models/imagen-3:predict"
        );
    }

    #[test]
    fn instances_payload_caps_references() {
        let source = prepared(1);
        let refs: Vec<_> = (2..8).map(prepared).collect();
        let body = build(
            ModelShape::Instances,
            &PayloadInput {
                prompt: "enhance",
                source: Some(&source),
                references: &refs,
                aspect_ratio: AspectRatio::new(4, 3),
                resolution: Resolution::OneK,
                seed: 42,
                strength: Some(0.5),
            },
        );

        let instance = &body["instances"][0];
        assert_eq!(instance["prompt"], "enhance");
        let references = instance["referenceImages"].as_array().unwrap();
        assert_eq!(references.len(), 1 + MAX_REFERENCE_IMAGES);
        assert_eq!(references[0]["referenceType"], "REFERENCE_TYPE_RAW");
        assert_eq!(body["parameters"]["aspectRatio"], "4:3");
        assert_eq!(body["parameters"]["seed"], 42);
        assert_eq!(body["parameters"]["guidanceScale"], 15.0);
    }

    #[test]
    fn parts_payload_has_inline_images_then_text() {
        let source = prepared(1);
        let body = build(
            ModelShape::Parts,
            &PayloadInput {
                prompt: "enhance",
                source: Some(&source),
                references: &[],
                aspect_ratio: AspectRatio::new(16, 9),
                resolution: Resolution::FourK,
                seed: 7,
                strength: None,
            },
        );

        let parts = body["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(parts[1]["text"], "enhance");
        let config = &body["generationConfig"];
        assert_eq!(config["imageConfig"]["aspectRatio"], "16:9");
        // 4K is produced by a separate upscale
        assert_eq!(config["imageConfig"]["imageSize"], "2K");
        assert!(config.get("temperature").is_none());
    }
}
