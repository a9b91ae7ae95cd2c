//! Straight-line request handling: load, format, generate, clean, emit.

use std::future::Future;

use tokio::task;
use tracing::{error, info};

use crate::{
    error::{LlmError, panic_message},
    model::{GenerationRequest, GenerationResult, SamplingParams},
    prompt::format_prompt,
    response::clean_response,
};

pub const INTERRUPTED: &str = "Process interrupted";

/// Anything that can turn a formatted prompt into generated text.
///
/// The returned text follows the pipeline convention of starting with the
/// prompt it was given.
pub trait TextBackend: Send + Sync {
    fn generate_text(&self, prompt: &str, params: &SamplingParams) -> Result<String, LlmError>;
}

/// What the process prints and how it exits.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub result: GenerationResult,
    pub exit_code: i32,
}

impl Outcome {
    fn success(result: GenerationResult) -> Self {
        Self {
            result,
            exit_code: 0,
        }
    }

    fn fatal(message: impl Into<String>) -> Self {
        Self {
            result: GenerationResult::failure(message),
            exit_code: 1,
        }
    }
}

/// Generates the reply text for one prompt.
///
/// A failing backend does not abort the request: the error is logged and
/// turned into a human readable reply.
pub fn generate_response<B>(backend: &B, request: &GenerationRequest, top_k: usize) -> String
where
    B: TextBackend + ?Sized,
{
    let formatted = format_prompt(&request.model_name, &request.prompt);
    match backend.generate_text(&formatted, &request.sampling(top_k)) {
        Ok(generated) => clean_response(&generated, &formatted),
        Err(err) => {
            error!(%err, "error generating response");
            format!("Error: Could not generate response - {err}")
        }
    }
}

pub fn respond<B>(backend: &B, request: &GenerationRequest, top_k: usize) -> GenerationResult
where
    B: TextBackend + ?Sized,
{
    GenerationResult::Completion {
        text: generate_response(backend, request, top_k),
        model: request.model_name.clone(),
        prompt: request.prompt.clone(),
    }
}

/// Loads the backend and serves the single request on a blocking worker.
///
/// Load failures and worker panics are fatal (exit code 1); generation errors
/// are reported inside a successful result.
pub async fn run<B, L>(request: GenerationRequest, top_k: usize, load: L) -> Outcome
where
    B: TextBackend + 'static,
    L: FnOnce(&str) -> Result<B, LlmError> + Send + 'static,
{
    let worker = task::spawn_blocking(move || {
        let backend = match load(&request.model_name) {
            Ok(backend) => backend,
            Err(err) => {
                error!(model = %request.model_name, %err, "error loading model");
                return Outcome::fatal(format!("Error loading model: {err}"));
            }
        };
        info!(model = %request.model_name, "model loaded successfully");
        Outcome::success(respond(&backend, &request, top_k))
    });

    match worker.await {
        Ok(outcome) => outcome,
        Err(err) if err.is_panic() => Outcome::fatal(panic_message(err.into_panic().as_ref())),
        Err(err) => Outcome::fatal(err.to_string()),
    }
}

/// Runs `work` unless `interrupt` resolves first.
pub async fn until_interrupted<W, I>(work: W, interrupt: I) -> Outcome
where
    W: Future<Output = Outcome>,
    I: Future<Output = ()>,
{
    tokio::select! {
        outcome = work => outcome,
        _ = interrupt => {
            error!("interrupted before a response was produced");
            Outcome::fatal(INTERRUPTED)
        }
    }
}
