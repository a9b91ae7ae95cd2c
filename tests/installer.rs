use std::cell::RefCell;

use local_llm::{
    SetupError,
    installer::{PackageManager, PackageSpec, ProbeReport, REQUIRED_PACKAGES, RuntimeVersion, run_setup},
};

struct FakeManager {
    version: &'static str,
    broken: Vec<&'static str>,
    probe: Result<ProbeReport, String>,
    attempted: RefCell<Vec<String>>,
}

impl FakeManager {
    fn healthy() -> Self {
        Self {
            version: "Python 3.11.4",
            broken: Vec::new(),
            probe: Ok(ProbeReport {
                torch_version: "2.3.1".into(),
                safetensors_version: "0.4.3".into(),
                accelerator: None,
            }),
            attempted: RefCell::new(Vec::new()),
        }
    }
}

impl PackageManager for FakeManager {
    fn runtime_version(&self) -> Result<RuntimeVersion, SetupError> {
        self.version.parse()
    }

    fn install(&self, package: &PackageSpec) -> Result<(), SetupError> {
        self.attempted.borrow_mut().push(package.to_string());
        if self.broken.contains(&package.name) {
            Err(SetupError::Install {
                package: package.to_string(),
                reason: "network unreachable".into(),
            })
        } else {
            Ok(())
        }
    }

    fn probe(&self) -> Result<ProbeReport, SetupError> {
        self.probe.clone().map_err(SetupError::Probe)
    }
}

fn run(manager: &FakeManager) -> (Result<ProbeReport, SetupError>, String) {
    let mut out = Vec::new();
    let result = run_setup(manager, &mut out);
    (result, String::from_utf8(out).unwrap())
}

#[test]
fn installs_everything_in_order_and_summarizes() {
    let manager = FakeManager::healthy();
    let (result, out) = run(&manager);

    assert!(result.is_ok());
    let expected: Vec<String> = REQUIRED_PACKAGES.iter().map(|p| p.to_string()).collect();
    assert_eq!(*manager.attempted.borrow(), expected);
    assert!(out.contains("Python 3.11.4 detected"));
    assert!(out.contains("PyTorch 2.3.1"));
    assert!(out.contains("Using CPU"));
    assert!(out.contains("microsoft/DialoGPT-medium"));
}

#[test]
fn keeps_going_after_a_failed_install() {
    let mut manager = FakeManager::healthy();
    manager.broken = vec!["torch", "tokenizers"];
    let (result, out) = run(&manager);

    assert_eq!(manager.attempted.borrow().len(), REQUIRED_PACKAGES.len());
    match result {
        Err(SetupError::PackagesFailed(failed)) => {
            assert_eq!(failed, ["torch>=2.0.0", "tokenizers>=0.14.0"]);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(out.contains("Failed to install: torch>=2.0.0, tokenizers>=0.14.0"));
    assert!(!out.contains("Testing installation"));
}

#[test]
fn old_runtime_stops_before_installing() {
    let mut manager = FakeManager::healthy();
    manager.version = "Python 3.7.17";
    let (result, _) = run(&manager);

    assert!(matches!(result, Err(SetupError::RuntimeTooOld { .. })));
    assert!(manager.attempted.borrow().is_empty());
}

#[test]
fn failed_import_is_fatal() {
    let mut manager = FakeManager::healthy();
    manager.probe = Err("No module named 'torch'".into());
    let (result, out) = run(&manager);

    assert!(matches!(result, Err(SetupError::Probe(_))));
    assert!(out.contains("No module named 'torch'"));
    assert!(!out.contains("setup complete"));
}

#[test]
fn reports_accelerator_name() {
    let mut manager = FakeManager::healthy();
    manager.probe = Ok(ProbeReport {
        torch_version: "2.3.1+cu121".into(),
        safetensors_version: "0.4.3".into(),
        accelerator: Some("NVIDIA GeForce RTX 4090".into()),
    });
    let (result, out) = run(&manager);

    assert_eq!(
        result.unwrap().accelerator.as_deref(),
        Some("NVIDIA GeForce RTX 4090")
    );
    assert!(out.contains("CUDA detected: NVIDIA GeForce RTX 4090"));
}
