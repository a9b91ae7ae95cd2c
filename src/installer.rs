//! Provisioning of the host-side Python toolchain used next to the adapter:
//! the libtorch runtime for `LIBTORCH_USE_PYTORCH` builds, checkpoint
//! conversion to safetensors, and hub login/cache tooling.

use std::{
    fmt,
    io::Write,
    path::PathBuf,
    process::{Command, Stdio},
    str::FromStr,
};

use tracing::{debug, warn};

use crate::error::SetupError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageSpec {
    pub name: &'static str,
    pub min_version: &'static str,
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}>={}", self.name, self.min_version)
    }
}

/// Installed in this order.
pub const REQUIRED_PACKAGES: [PackageSpec; 4] = [
    PackageSpec {
        name: "torch",
        min_version: "2.0.0",
    },
    PackageSpec {
        name: "safetensors",
        min_version: "0.3.0",
    },
    PackageSpec {
        name: "tokenizers",
        min_version: "0.14.0",
    },
    PackageSpec {
        name: "huggingface_hub",
        min_version: "0.17.0",
    },
];

pub const MIN_RUNTIME: RuntimeVersion = RuntimeVersion {
    major: 3,
    minor: 8,
    patch: 0,
};

pub const RECOMMENDED_MODELS: [(&str, &str); 4] = [
    ("distilgpt2", "~300MB, fastest, basic responses"),
    ("gpt2-medium", "~1.4GB, good balance"),
    ("microsoft/DialoGPT-medium", "~1.5GB, best for conversations"),
    ("TinyLlama/TinyLlama-1.1B-Chat-v1.0", "~2.2GB, chat tuned"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RuntimeVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for RuntimeVersion {
    type Err = SetupError;

    /// Accepts `Python 3.11.4`, `3.11.4`, `3.12.0rc1` and `3.9`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let bad = || SetupError::RuntimeUnavailable(format!("unrecognised version `{}`", raw.trim()));
        let version = raw.trim().trim_start_matches("Python").trim();
        let mut parts = version.split('.').map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<u32>().ok()
        });
        let major = parts.next().flatten().ok_or_else(bad)?;
        let minor = parts.next().flatten().ok_or_else(bad)?;
        let patch = parts.next().flatten().unwrap_or(0);
        Ok(Self {
            major,
            minor,
            patch,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub torch_version: String,
    pub safetensors_version: String,
    /// Name of the first CUDA device, if any.
    pub accelerator: Option<String>,
}

/// The host package manager, seen as a black box.
pub trait PackageManager {
    fn runtime_version(&self) -> Result<RuntimeVersion, SetupError>;

    fn install(&self, package: &PackageSpec) -> Result<(), SetupError>;

    /// Imports the core packages and reports what they see.
    fn probe(&self) -> Result<ProbeReport, SetupError>;
}

/// `pip` driven through a Python interpreter.
pub struct Pip {
    python: PathBuf,
}

const PROBE_SCRIPT: &str = "import torch, safetensors\n\
print(torch.__version__)\n\
print(safetensors.__version__)\n\
print(torch.cuda.get_device_name(0) if torch.cuda.is_available() else '')";

impl Pip {
    pub fn new(python: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
        }
    }

    fn python(&self) -> Command {
        let mut cmd = Command::new(&self.python);
        cmd.stdin(Stdio::null());
        cmd
    }
}

impl PackageManager for Pip {
    fn runtime_version(&self) -> Result<RuntimeVersion, SetupError> {
        let output = self
            .python()
            .arg("--version")
            .output()
            .map_err(|e| SetupError::RuntimeUnavailable(format!("{}: {e}", self.python.display())))?;
        // Python 2 printed its version on stderr.
        let text = if output.stdout.is_empty() {
            String::from_utf8_lossy(&output.stderr).into_owned()
        } else {
            String::from_utf8_lossy(&output.stdout).into_owned()
        };
        text.parse()
    }

    fn install(&self, package: &PackageSpec) -> Result<(), SetupError> {
        let spec = package.to_string();
        debug!(%spec, python = %self.python.display(), "running pip install");
        let status = self
            .python()
            .args(["-m", "pip", "install", &spec])
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(SetupError::Install {
                package: spec,
                reason: format!("pip exited with {status}"),
            })
        }
    }

    fn probe(&self) -> Result<ProbeReport, SetupError> {
        let output = self.python().args(["-c", PROBE_SCRIPT]).output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last = stderr.lines().last().unwrap_or("import failed");
            return Err(SetupError::Probe(last.to_string()));
        }
        parse_probe(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_probe(stdout: &str) -> Result<ProbeReport, SetupError> {
    let mut lines = stdout.lines().map(str::trim);
    let mut next = |what: &str| {
        lines
            .next()
            .map(str::to_string)
            .ok_or_else(|| SetupError::Probe(format!("probe printed no {what}")))
    };
    let torch_version = next("torch version")?;
    let safetensors_version = next("safetensors version")?;
    let accelerator = next("device line").ok().filter(|name| !name.is_empty());
    Ok(ProbeReport {
        torch_version,
        safetensors_version,
        accelerator,
    })
}

/// Installs every required package, then verifies the core imports.
///
/// Individual install failures do not stop the run; they are collected and
/// reported together afterwards.
pub fn run_setup<P, W>(manager: &P, out: &mut W) -> Result<ProbeReport, SetupError>
where
    P: PackageManager + ?Sized,
    W: Write,
{
    writeln!(out, "Local LLM setup")?;
    writeln!(out, "Provisioning the Python toolchain used alongside the local_llm adapter")?;
    writeln!(out, "{}", "-".repeat(60))?;

    let runtime = manager.runtime_version()?;
    if runtime < MIN_RUNTIME {
        writeln!(out, "Error: Python {}.{}+ is required", MIN_RUNTIME.major, MIN_RUNTIME.minor)?;
        return Err(SetupError::RuntimeTooOld {
            runtime: "Python".into(),
            found: runtime.to_string(),
            required: format!("{}.{}", MIN_RUNTIME.major, MIN_RUNTIME.minor),
        });
    }
    writeln!(out, "Python {runtime} detected")?;

    let mut failed = Vec::new();
    for package in REQUIRED_PACKAGES.iter() {
        writeln!(out, "Installing {package}...")?;
        match manager.install(package) {
            Ok(()) => writeln!(out, "   {} installed successfully", package.name)?,
            Err(err) => {
                warn!(package = package.name, %err, "install failed");
                writeln!(out, "   Failed to install {}", package.name)?;
                failed.push(package.to_string());
            }
        }
    }

    if !failed.is_empty() {
        writeln!(out)?;
        writeln!(out, "Failed to install: {}", failed.join(", "))?;
        writeln!(out, "Please check your internet connection and try again.")?;
        return Err(SetupError::PackagesFailed(failed));
    }

    writeln!(out)?;
    writeln!(out, "Testing installation...")?;
    let report = match manager.probe() {
        Ok(report) => report,
        Err(err) => {
            writeln!(out, "   {err}")?;
            return Err(err);
        }
    };
    writeln!(out, "   PyTorch {}", report.torch_version)?;
    writeln!(out, "   safetensors {}", report.safetensors_version)?;
    match report.accelerator.as_deref() {
        Some(name) => writeln!(out, "   CUDA detected: {name}")?,
        None => writeln!(out, "   Using CPU (CUDA not available)")?,
    }

    writeln!(out)?;
    writeln!(out, "Local LLM setup complete!")?;
    writeln!(out)?;
    writeln!(out, "Recommended models (downloaded automatically on first use):")?;
    for (name, note) in RECOMMENDED_MODELS {
        writeln!(out, "  - {name} ({note})")?;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_specs_render_with_floor() {
        assert_eq!(REQUIRED_PACKAGES[0].to_string(), "torch>=2.0.0");
        assert_eq!(REQUIRED_PACKAGES.len(), 4);
    }

    #[test]
    fn parses_interpreter_version_output() {
        let v: RuntimeVersion = "Python 3.11.4\n".parse().unwrap();
        assert_eq!((v.major, v.minor, v.patch), (3, 11, 4));
        let v: RuntimeVersion = "3.12.0rc1".parse().unwrap();
        assert_eq!((v.major, v.minor, v.patch), (3, 12, 0));
        let v: RuntimeVersion = "3.9".parse().unwrap();
        assert_eq!(v.to_string(), "3.9.0");
        assert!("Python".parse::<RuntimeVersion>().is_err());
        assert!("".parse::<RuntimeVersion>().is_err());
    }

    #[test]
    fn version_ordering_is_numeric() {
        let older: RuntimeVersion = "3.7.17".parse().unwrap();
        let newer: RuntimeVersion = "3.10.0".parse().unwrap();
        assert!(older < MIN_RUNTIME);
        assert!(newer > MIN_RUNTIME);
    }

    #[test]
    fn probe_output_with_and_without_gpu() {
        let report = parse_probe("2.3.1+cu121\n0.4.3\nNVIDIA A100-SXM4-40GB\n").unwrap();
        assert_eq!(report.torch_version, "2.3.1+cu121");
        assert_eq!(report.accelerator.as_deref(), Some("NVIDIA A100-SXM4-40GB"));

        let report = parse_probe("2.3.1\n0.4.3\n\n").unwrap();
        assert!(report.accelerator.is_none());

        assert!(parse_probe("2.3.1\n").is_err());
    }
}
