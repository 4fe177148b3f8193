//! Wire messages exchanged with the generation service.
//!
//! The client sends one [`GenerationRequest`] per session; the server answers
//! with zero or more `progress` frames followed by at most one terminal
//! `result` or `error` frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Model used when a request does not name one.
pub const DEFAULT_MODEL_ID: &str = "stabilityai/stable-diffusion-xl-base-1.0";
/// LoRA weight scale used when a request does not set one.
pub const DEFAULT_LORA_SCALE: f64 = 0.8;
/// Strength used by image-to-image requests when unset.
pub const DEFAULT_IMG2IMG_STRENGTH: f64 = 0.8;

const STEPS_RANGE: (u32, u32) = (1, 100);
const GUIDANCE_RANGE: (f64, f64) = (1.0, 20.0);
const DIMENSION_RANGE: (u32, u32) = (512, 1024);
const LORA_SCALE_RANGE: (f64, f64) = (0.0, 2.0);
const STRENGTH_RANGE: (f64, f64) = (0.0, 1.0);

fn default_lora_scale() -> f64 {
    DEFAULT_LORA_SCALE
}

/// Text-to-image generation parameters.
///
/// Serialized as the single outbound payload of a stream session and as the
/// body of the REST `txt2img` call. `lora_path` is always present on the wire
/// and is `null` when unset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    pub model_id: String,
    pub num_inference_steps: u32,
    pub guidance_scale: f64,
    /// `-1` asks the server to pick a random seed.
    pub seed: i64,
    pub height: u32,
    pub width: u32,
    pub lora_path: Option<String>,
    #[serde(default = "default_lora_scale")]
    pub lora_scale: f64,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            model_id: DEFAULT_MODEL_ID.to_string(),
            num_inference_steps: 25,
            guidance_scale: 7.5,
            seed: -1,
            height: 1024,
            width: 1024,
            lora_path: None,
            lora_scale: DEFAULT_LORA_SCALE,
        }
    }
}

impl GenerationRequest {
    /// Creates a request for `prompt` with service defaults for everything
    /// else.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_negative_prompt(mut self, negative_prompt: impl Into<String>) -> Self {
        self.negative_prompt = negative_prompt.into();
        self
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_steps(mut self, num_inference_steps: u32) -> Self {
        self.num_inference_steps = num_inference_steps;
        self
    }

    pub fn with_guidance_scale(mut self, guidance_scale: f64) -> Self {
        self.guidance_scale = guidance_scale;
        self
    }

    /// Attaches a LoRA adapter. A blank path clears it.
    pub fn with_lora(mut self, lora_path: impl Into<String>, lora_scale: f64) -> Self {
        self.lora_path = Some(lora_path.into());
        self.lora_scale = lora_scale;
        self.normalized()
    }

    /// Returns the request with a blank `lora_path` replaced by `None`.
    pub fn normalized(mut self) -> Self {
        if self
            .lora_path
            .as_deref()
            .is_some_and(|path| path.trim().is_empty())
        {
            self.lora_path = None;
        }
        self
    }

    /// Checks parameter ranges accepted by the service.
    pub fn validate(&self) -> Result<(), String> {
        validate_range_u32(
            self.num_inference_steps,
            STEPS_RANGE,
            "num_inference_steps",
        )?;
        validate_range_f64(self.guidance_scale, GUIDANCE_RANGE, "guidance_scale")?;
        validate_range_u32(self.height, DIMENSION_RANGE, "height")?;
        validate_range_u32(self.width, DIMENSION_RANGE, "width")?;
        validate_range_f64(self.lora_scale, LORA_SCALE_RANGE, "lora_scale")
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Image-to-image parameters for the REST surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Img2ImgRequest {
    #[serde(flatten)]
    pub generation: GenerationRequest,
    /// Base64-encoded initial image.
    pub image_b64: String,
    pub strength: f64,
}

impl Img2ImgRequest {
    pub fn new(generation: GenerationRequest, image_b64: impl Into<String>) -> Self {
        Self {
            generation,
            image_b64: image_b64.into(),
            strength: DEFAULT_IMG2IMG_STRENGTH,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        self.generation.validate()?;
        if self.image_b64.trim().is_empty() {
            return Err("image_b64 must not be empty".to_string());
        }
        validate_range_f64(self.strength, STRENGTH_RANGE, "strength")
    }
}

fn validate_range_u32(value: u32, (min, max): (u32, u32), field: &str) -> Result<(), String> {
    if value < min || value > max {
        return Err(format!("{field} must be between {min} and {max}, got {value}"));
    }
    Ok(())
}

fn validate_range_f64(value: f64, (min, max): (f64, f64), field: &str) -> Result<(), String> {
    if !value.is_finite() {
        return Err(format!("{field} must be a finite number"));
    }
    if value < min || value > max {
        return Err(format!("{field} must be between {min} and {max}, got {value}"));
    }
    Ok(())
}

/// Frames sent by the server during a stream session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Progress {
        /// Completed fraction in `[0, 1]`.
        progress: f64,
        step: u64,
    },
    Result {
        /// Opaque result payload; see [`GenerationResponse`] for the shape the
        /// service currently produces.
        data: Value,
    },
    Error {
        message: String,
    },
}

const KNOWN_MESSAGE_TYPES: [&str; 3] = ["progress", "result", "error"];

/// Outcome of classifying one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Message(ServerMessage),
    /// Well-formed JSON with a missing or unrecognized `type`.
    Ignored { kind: Option<String> },
}

impl ServerMessage {
    /// Parses and classifies a raw text frame.
    ///
    /// Fails when the text is not JSON or when a known `type` carries fields
    /// that do not decode. Unknown discriminators are reported as
    /// [`InboundFrame::Ignored`].
    pub fn classify(text: &str) -> Result<InboundFrame, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned);

        match kind {
            Some(kind) if KNOWN_MESSAGE_TYPES.contains(&kind.as_str()) => {
                serde_json::from_value(value).map(InboundFrame::Message)
            }
            kind => Ok(InboundFrame::Ignored { kind }),
        }
    }

    /// Whether this message ends the session.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Result payload produced by the service for a finished generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationResponse {
    pub image_b64: String,
    pub seed: i64,
    pub model_id: String,
    /// Wall-clock generation time in seconds.
    pub generation_time: f64,
    pub nsfw_content_detected: bool,
}

impl GenerationResponse {
    /// Interprets the `data` of a `result` frame.
    pub fn from_result_data(data: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(data)
    }
}
