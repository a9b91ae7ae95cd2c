//! Cleanup of raw generated text before it is returned to the caller.

/// Substrings that mark where the model starts inventing the next turn.
pub const STOP_MARKERS: [&str; 5] = ["\nUser:", "\nQuestion:", "\n\n", "<|user|>", "<|endoftext|>"];

/// Strips the echoed prompt, cuts at the earliest stop marker and trims.
pub fn clean_response(generated: &str, formatted_prompt: &str) -> String {
    let body = match generated.strip_prefix(formatted_prompt) {
        Some(rest) => rest.trim(),
        None => generated.trim(),
    };

    let cut = STOP_MARKERS
        .iter()
        .filter_map(|marker| body.find(marker))
        .min()
        .unwrap_or(body.len());

    body[..cut].trim().to_string()
}
