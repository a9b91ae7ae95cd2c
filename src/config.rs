use std::{env, path::PathBuf};

use clap::Parser;

#[cfg(feature = "tch-backend")]
use tch::Device;

use crate::{error::LlmError, model::GenerationRequest};

pub const DEFAULT_MODEL: &str = "microsoft/DialoGPT-medium";
pub const DEFAULT_MAX_LENGTH: usize = 150;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TOP_P: f64 = 0.9;
pub const DEFAULT_TOP_K: usize = 50;

/// Local LLM using Hugging Face pretrained models.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Input prompt for the LLM
    pub prompt: String,

    /// Model name from the Hugging Face hub, or a local model directory
    #[arg(long, default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Maximum length of generated text, prompt tokens included
    #[arg(long, default_value_t = DEFAULT_MAX_LENGTH, value_parser = parse_max_length)]
    pub max_length: usize,

    /// Temperature for sampling (0.0, 1.0]
    #[arg(long, default_value_t = DEFAULT_TEMPERATURE, value_parser = parse_unit_interval)]
    pub temperature: f64,

    /// Nucleus sampling mass (0.0, 1.0]
    #[arg(long, default_value_t = DEFAULT_TOP_P, value_parser = parse_unit_interval)]
    pub top_p: f64,
}

impl Args {
    pub fn into_request(self) -> Result<GenerationRequest, LlmError> {
        GenerationRequest::new(
            self.prompt,
            self.model,
            self.max_length,
            self.temperature,
            self.top_p,
        )
    }
}

fn parse_max_length(raw: &str) -> Result<usize, String> {
    let value: usize = raw
        .parse()
        .map_err(|_| format!("`{raw}` is not a positive integer"))?;
    if value == 0 {
        return Err("max length must be at least 1".into());
    }
    Ok(value)
}

fn parse_unit_interval(raw: &str) -> Result<f64, String> {
    let value: f64 = raw
        .parse()
        .map_err(|_| format!("`{raw}` is not a number"))?;
    if value > 0.0 && value <= 1.0 {
        Ok(value)
    } else {
        Err(format!("{value} is outside (0, 1]"))
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub revision: String,
    pub hf_token: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub top_k: usize,
    pub python: PathBuf,
    #[cfg(feature = "tch-backend")]
    pub device: Device,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::from_lookup(|key| env::var(key).ok()))
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let revision = lookup("MODEL_REVISION").unwrap_or_else(|| "main".to_string());
        let hf_token = lookup("HF_TOKEN").filter(|t| !t.trim().is_empty());
        let cache_dir = lookup("LOCAL_LLM_CACHE_DIR").map(PathBuf::from);

        let top_k = lookup("TOP_K")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TOP_K);

        let python = PathBuf::from(lookup("PYTHON").unwrap_or_else(|| "python3".to_string()));

        #[cfg(feature = "tch-backend")]
        let device = {
            let raw = lookup("DEVICE").unwrap_or_else(|| "auto".into());
            parse_device(&raw)
        };

        Self {
            revision,
            hf_token,
            cache_dir,
            top_k,
            python,
            #[cfg(feature = "tch-backend")]
            device,
        }
    }
}

#[cfg(feature = "tch-backend")]
pub fn parse_device(raw: &str) -> Device {
    let lower = raw.trim().to_lowercase();
    if lower == "cpu" {
        Device::Cpu
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            Device::Cpu
        }
    } else {
        Device::cuda_if_available()
    }
}
