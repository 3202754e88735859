//! Validated domain types for remote calls.
//!
//! Caller-supplied values are wrapped in newtypes that validate once at the
//! edge, so the request engine and endpoint clients can rely on them.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use thiserror::Error;

/// Validation error for domain types
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Temperature value out of range
    #[error("Invalid temperature {value}: must be between {min} and {max}")]
    InvalidTemperature {
        /// The invalid value provided
        value: f32,
        /// Minimum allowed value
        min: f32,
        /// Maximum allowed value
        max: f32,
    },

    /// Max tokens value out of range
    #[error("Invalid max_tokens {value}: must be between {min} and {max}")]
    InvalidMaxTokens {
        /// The invalid value provided
        value: u32,
        /// Minimum allowed value
        min: u32,
        /// Maximum allowed value
        max: u32,
    },

    /// Model name validation failed
    #[error("Invalid model: {reason}")]
    InvalidModel {
        /// Reason for validation failure
        reason: String,
    },

    /// Language hint validation failed
    #[error("Invalid language hint: {reason}")]
    InvalidLanguage {
        /// Reason for validation failure
        reason: String,
    },

    /// API key validation failed
    #[error("Invalid api_key: {reason}")]
    InvalidApiKey {
        /// Reason for validation failure
        reason: String,
    },
}

/// Temperature for sampling (0.0 to 2.0)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct Temperature(f32);

impl Temperature {
    /// Minimum allowed temperature
    pub const MIN: f32 = 0.0;
    /// Maximum allowed temperature
    pub const MAX: f32 = 2.0;
    /// Default temperature
    pub const DEFAULT: f32 = 0.7;

    /// Create a new temperature value with validation
    ///
    /// # Errors
    /// Returns `ValidationError::InvalidTemperature` if value is outside [0.0, 2.0]
    pub fn new(value: f32) -> Result<Self, ValidationError> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(ValidationError::InvalidTemperature {
                value,
                min: Self::MIN,
                max: Self::MAX,
            })
        }
    }

    /// Get the inner value
    #[must_use]
    pub fn value(&self) -> f32 {
        self.0
    }
}

impl Default for Temperature {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

impl TryFrom<f32> for Temperature {
    type Error = ValidationError;

    fn try_from(value: f32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Temperature> for f32 {
    fn from(temp: Temperature) -> Self {
        temp.0
    }
}

/// Maximum tokens to generate (1 to 128,000)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct MaxTokens(NonZeroU32);

impl MaxTokens {
    /// Minimum allowed max_tokens
    pub const MIN: u32 = 1;
    /// Maximum allowed max_tokens
    pub const MAX: u32 = 128_000;
    /// Default max_tokens
    pub const DEFAULT: u32 = 2_000;

    /// Create a new max_tokens value with validation
    ///
    /// # Errors
    /// Returns `ValidationError::InvalidMaxTokens` if value is outside [1, 128000]
    pub fn new(value: u32) -> Result<Self, ValidationError> {
        let invalid = ValidationError::InvalidMaxTokens {
            value,
            min: Self::MIN,
            max: Self::MAX,
        };
        if value > Self::MAX {
            return Err(invalid);
        }
        NonZeroU32::new(value).map(Self).ok_or(invalid)
    }

    /// Get the inner value
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0.get()
    }
}

impl Default for MaxTokens {
    fn default() -> Self {
        Self(NonZeroU32::MIN.saturating_add(Self::DEFAULT - 1))
    }
}

impl TryFrom<u32> for MaxTokens {
    type Error = ValidationError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MaxTokens> for u32 {
    fn from(tokens: MaxTokens) -> Self {
        tokens.value()
    }
}

/// Remote model name (e.g. `gpt-4o-mini`, `whisper-1`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelName(String);

impl ModelName {
    /// Maximum model name length
    pub const MAX_LEN: usize = 256;

    /// Create a new model name with validation
    ///
    /// # Errors
    /// Returns `ValidationError::InvalidModel` if empty, too long, or contains whitespace
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        if value.is_empty() {
            return Err(ValidationError::InvalidModel {
                reason: "model cannot be empty".to_string(),
            });
        }
        if value.len() > Self::MAX_LEN {
            return Err(ValidationError::InvalidModel {
                reason: format!("model exceeds {} characters", Self::MAX_LEN),
            });
        }
        if value.chars().any(char::is_whitespace) {
            return Err(ValidationError::InvalidModel {
                reason: "model cannot contain whitespace".to_string(),
            });
        }
        Ok(Self(value))
    }

    /// Get the model name
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ModelName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ModelName> for String {
    fn from(model: ModelName) -> Self {
        model.0
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// ISO-639-1 language hint for transcription (e.g. `en`, `de`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageHint(String);

impl LanguageHint {
    /// Create a language hint, normalising to lowercase
    ///
    /// # Errors
    /// Returns `ValidationError::InvalidLanguage` unless the value is 2 or 3 ASCII letters
    pub fn new(value: impl AsRef<str>) -> Result<Self, ValidationError> {
        let value = value.as_ref().trim().to_ascii_lowercase();
        if !(2..=3).contains(&value.len()) || !value.chars().all(|c| c.is_ascii_lowercase()) {
            return Err(ValidationError::InvalidLanguage {
                reason: format!("'{value}' is not an ISO-639-1 code"),
            });
        }
        Ok(Self(value))
    }

    /// Get the language code
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// API key (sensitive, never logged)
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Create a new API key
    ///
    /// # Errors
    /// Returns `ValidationError::InvalidApiKey` if the key is empty
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(ValidationError::InvalidApiKey {
                reason: "api_key cannot be empty".to_string(),
            });
        }
        Ok(Self(SecretString::new(value)))
    }

    /// Expose the secret value (use sparingly)
    #[must_use]
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey([REDACTED])")
    }
}

/// Caller-supplied credentials carried on every request
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Bearer token
    pub api_key: ApiKey,
    /// Optional organization header
    pub organization: Option<String>,
}

impl Credentials {
    /// Create credentials from an API key
    ///
    /// # Errors
    /// Returns `ValidationError::InvalidApiKey` if the key is empty
    pub fn new(api_key: impl Into<String>) -> Result<Self, ValidationError> {
        Ok(Self {
            api_key: ApiKey::new(api_key)?,
            organization: None,
        })
    }

    /// Set the organization
    #[must_use]
    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    /// `Authorization` header value
    #[must_use]
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.api_key.expose_secret())
    }
}

/// Sampling parameters for a chat completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Model to call
    pub model: ModelName,
    /// Maximum tokens to generate
    #[serde(default)]
    pub max_tokens: MaxTokens,
    /// Sampling temperature
    #[serde(default)]
    pub temperature: Temperature,
}

impl ModelParams {
    /// Create parameters for a model with default sampling
    #[must_use]
    pub fn new(model: ModelName) -> Self {
        Self {
            model,
            max_tokens: MaxTokens::default(),
            temperature: Temperature::default(),
        }
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: MaxTokens) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: Temperature) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Terminal result of a chat completion call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InferenceResponse {
    /// Whether the call produced content
    pub success: bool,
    /// Assistant message content
    pub content: Option<String>,
    /// Human-readable failure message
    pub error_message: Option<String>,
    /// Whether the call ended through cancellation
    pub cancelled: bool,
    /// Number of attempts made
    pub attempts: u32,
}

/// Terminal result of a transcription call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptionResponse {
    /// Whether the call produced text
    pub success: bool,
    /// Transcribed text
    pub text: Option<String>,
    /// Human-readable failure message
    pub error_message: Option<String>,
    /// Whether the call ended through cancellation
    pub cancelled: bool,
    /// Number of attempts made
    pub attempts: u32,
}
