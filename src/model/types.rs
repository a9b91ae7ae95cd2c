use serde::Serialize;

use crate::error::LlmError;

/// Seed applied before every sampling call.
pub const GENERATION_SEED: i64 = 42;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub model_name: String,
    pub max_length: usize,
    pub temperature: f64,
    pub top_p: f64,
}

impl GenerationRequest {
    pub fn new(
        prompt: String,
        model_name: String,
        max_length: usize,
        temperature: f64,
        top_p: f64,
    ) -> Result<Self, LlmError> {
        if prompt.is_empty() {
            return Err(LlmError::BadRequest("prompt must not be empty".into()));
        }
        if model_name.trim().is_empty() {
            return Err(LlmError::BadRequest("model name must not be empty".into()));
        }
        if max_length == 0 {
            return Err(LlmError::BadRequest("max length must be at least 1".into()));
        }
        if !(temperature > 0.0 && temperature <= 1.0) {
            return Err(LlmError::BadRequest(format!(
                "temperature {temperature} is outside (0, 1]"
            )));
        }
        if !(top_p > 0.0 && top_p <= 1.0) {
            return Err(LlmError::BadRequest(format!("top_p {top_p} is outside (0, 1]")));
        }
        Ok(Self {
            prompt,
            model_name,
            max_length,
            temperature,
            top_p,
        })
    }

    pub fn sampling(&self, top_k: usize) -> SamplingParams {
        SamplingParams {
            max_length: self.max_length,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k,
            seed: GENERATION_SEED,
        }
    }
}

/// Parameters handed to a backend for one sampling call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub max_length: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: usize,
    pub seed: i64,
}

/// The single JSON line written to stdout.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum GenerationResult {
    Completion {
        text: String,
        model: String,
        prompt: String,
    },
    Failure {
        error: String,
    },
}

impl GenerationResult {
    pub fn failure(error: impl Into<String>) -> Self {
        GenerationResult::Failure {
            error: error.into(),
        }
    }

    pub fn to_json_line(&self) -> String {
        // Serializing string-only variants cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"error":"serialization failed"}"#.into())
    }
}

#[derive(Debug, Clone)]
pub struct ModelMetadata {
    pub name: String,
    pub architecture: String,
    pub dtype: String,
    pub device: String,
    pub context_length: usize,
    pub size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str, temperature: f64, top_p: f64) -> Result<GenerationRequest, LlmError> {
        GenerationRequest::new(prompt.into(), "gpt2".into(), 150, temperature, top_p)
    }

    #[test]
    fn rejects_empty_prompt_only() {
        assert!(matches!(request("", 0.7, 0.9), Err(LlmError::BadRequest(_))));
        let blank = request(" ", 0.7, 0.9).unwrap();
        assert_eq!(blank.prompt, " ");
    }

    #[test]
    fn rejects_temperature_outside_unit_interval() {
        assert!(request("hi", 0.0, 0.9).is_err());
        assert!(request("hi", 1.01, 0.9).is_err());
        assert!(request("hi", f64::NAN, 0.9).is_err());
        assert!(request("hi", 1.0, 0.9).is_ok());
    }

    #[test]
    fn rejects_top_p_outside_unit_interval() {
        assert!(request("hi", 0.7, 0.0).is_err());
        assert!(request("hi", 0.7, 1.0).is_ok());
    }

    #[test]
    fn sampling_uses_fixed_seed() {
        let params = request("hi", 0.7, 0.9).unwrap().sampling(50);
        assert_eq!(params.seed, 42);
        assert_eq!(params.top_k, 50);
        assert_eq!(params.max_length, 150);
    }

    #[test]
    fn completion_serializes_with_three_keys_in_order() {
        let result = GenerationResult::Completion {
            text: "I am fine".into(),
            model: "gpt2".into(),
            prompt: "Hi".into(),
        };
        assert_eq!(
            result.to_json_line(),
            r#"{"text":"I am fine","model":"gpt2","prompt":"Hi"}"#
        );
    }

    #[test]
    fn failure_serializes_with_error_only() {
        let line = GenerationResult::failure("Process interrupted").to_json_line();
        assert_eq!(line, r#"{"error":"Process interrupted"}"#);
        assert!(!line.contains('\n'));
    }
}
