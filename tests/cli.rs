#![cfg(feature = "tch-backend")]

use std::{
    fs,
    path::Path,
    process::{Command, Output},
};

use serde_json::Value;
use tch::{Device, Kind, Tensor};

fn local_llm(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_local_llm"))
        .args(args)
        .env("DEVICE", "cpu")
        .env("RUST_LOG", "info")
        .output()
        .unwrap()
}

/// Parses stdout, which must hold exactly one JSON object on one line.
fn single_json_line(output: &Output) -> Value {
    let stdout = String::from_utf8(output.stdout.clone()).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 1, "stdout was {stdout:?}");
    serde_json::from_str(lines[0]).unwrap()
}

fn error_only(line: &Value) -> &str {
    let object = line.as_object().unwrap();
    assert_eq!(object.keys().collect::<Vec<_>>(), ["error"]);
    object["error"].as_str().unwrap()
}

fn write_t5_stub(dir: &Path) {
    fs::write(dir.join("config.json"), r#"{"model_type":"t5"}"#).unwrap();
    let shared = Tensor::zeros([4, 2], (Kind::Float, Device::Cpu));
    Tensor::write_safetensors(&[("shared.weight", &shared)], dir.join("model.safetensors"))
        .unwrap();
}

#[test]
fn unsupported_model_exits_one_with_error_line() {
    let dir = tempfile::tempdir().unwrap();
    write_t5_stub(dir.path());

    let output = local_llm(&["Hi", "--model", dir.path().to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));

    let line = single_json_line(&output);
    let error = error_only(&line);
    assert!(error.starts_with("Error loading model"), "{error}");
    assert!(error.contains("t5"), "{error}");

    // Logs stay on stderr.
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("starting generation"), "{stderr}");
}

#[test]
fn invalid_temperature_exits_one_with_error_line() {
    let output = local_llm(&["Hi", "--temperature", "0"]);
    assert_eq!(output.status.code(), Some(1));

    let line = single_json_line(&output);
    assert!(error_only(&line).contains("temperature"));
}

#[test]
fn missing_prompt_exits_one_with_error_line() {
    let output = local_llm(&[]);
    assert_eq!(output.status.code(), Some(1));
    error_only(&single_json_line(&output));
}
