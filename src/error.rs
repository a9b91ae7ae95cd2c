use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("model hub error: {0}")]
    Hub(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("invalid model config: {0}")]
    Config(String),
    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),
    #[error("weights error: {0}")]
    Weights(String),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<hf_hub::api::sync::ApiError> for LlmError {
    fn from(err: hf_hub::api::sync::ApiError) -> Self {
        LlmError::Hub(err.to_string())
    }
}

impl From<tokenizers::Error> for LlmError {
    fn from(err: tokenizers::Error) -> Self {
        LlmError::Tokenizer(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("{runtime} {found} found, {required}+ is required")]
    RuntimeTooOld {
        runtime: String,
        found: String,
        required: String,
    },
    #[error("could not determine runtime version: {0}")]
    RuntimeUnavailable(String),
    #[error("failed to install {package}: {reason}")]
    Install { package: String, reason: String },
    #[error("failed to install: {}", .0.join(", "))]
    PackagesFailed(Vec<String>),
    #[error("installation test failed: {0}")]
    Probe(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_stringified() {
        let caught = std::panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "boom 7");
        let caught = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "static");
    }

    #[test]
    fn setup_errors_read_naturally() {
        let err = SetupError::RuntimeTooOld {
            runtime: "Python".into(),
            found: "3.7.9".into(),
            required: "3.8".into(),
        };
        assert_eq!(err.to_string(), "Python 3.7.9 found, 3.8+ is required");
    }
}
