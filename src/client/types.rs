//! Request and response types shared by the dispatcher and the image client

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{AppError, Result};

/// Prefix asking the model not to rewrite the prompt
pub const AS_IS_PREFIX: &str = "I NEED to test how the tool works with extremely simple prompts. DO NOT add any detail, just use it AS-IS:";

macro_rules! choice_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $what:literal, default = $default:ident,
        { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            /// Every accepted value, in display order
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }

            /// Accepted literal values, for form rendering
            pub fn options() -> Vec<&'static str> {
                Self::ALL.iter().map(|v| v.as_str()).collect()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name::$default
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = AppError;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim() {
                    $($text => Ok($name::$variant),)+
                    other => Err(AppError::Validation(format!(
                        "{} must be one of {:?}, got '{}'",
                        $what,
                        Self::options(),
                        other
                    ))),
                }
            }
        }
    };
}

choice_enum!(
    /// Azure OpenAI REST API version
    ApiVersion, "api_version", default = V2024_02_01,
    {
        V2024_02_01 => "2024-02-01",
        V2024_02_15Preview => "2024-02-15-preview",
    }
);

choice_enum!(
    /// DALL-E 3 rendering style
    Style, "style", default = Vivid,
    {
        Natural => "natural",
        Vivid => "vivid",
    }
);

choice_enum!(
    /// DALL-E 3 rendering quality
    Quality, "quality", default = Standard,
    {
        Standard => "standard",
        Hd => "hd",
    }
);

choice_enum!(
    /// Output dimensions accepted by DALL-E 3
    ImageSize, "size", default = Square,
    {
        Square => "1024x1024",
        Landscape => "1792x1024",
        Portrait => "1024x1792",
    }
);

/// Request to generate images
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// The prompt as typed by the user
    pub prompt: String,

    /// Number of images to ask for in one provider call
    pub num: u32,

    pub style: Style,

    pub quality: Quality,

    pub size: ImageSize,

    /// Prefix the prompt with [`AS_IS_PREFIX`] before sending
    pub as_is: bool,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            num: 1,
            style: Style::default(),
            quality: Quality::default(),
            size: ImageSize::default(),
            as_is: false,
        }
    }

    /// Check the parameters that cannot be expressed by the types alone
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(AppError::Validation("Prompt is empty".to_string()));
        }
        if self.num == 0 {
            return Err(AppError::Validation(
                "Num must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }

    /// Prompt text as it is sent to the provider
    pub fn effective_prompt(&self) -> String {
        if self.as_is {
            format!("{} {}", AS_IS_PREFIX, self.prompt)
        } else {
            self.prompt.clone()
        }
    }

    /// Split into `num` single-image requests.
    ///
    /// DALL-E 3 only accepts `n = 1`, so asking for several images means
    /// several provider calls.
    pub fn fan_out(self) -> Vec<GenerationRequest> {
        let count = self.num.max(1) as usize;
        let single = GenerationRequest { num: 1, ..self };
        vec![single; count]
    }
}

/// Generated image data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    /// Raw image bytes
    pub data: Vec<u8>,

    /// MIME type reported by the image host, if any
    pub content_type: Option<String>,

    /// Revised prompt if the model modified it
    pub revised_prompt: Option<String>,
}

/// Outcome of one provider call
pub type GenerationResult = Result<Vec<GeneratedImage>>;
