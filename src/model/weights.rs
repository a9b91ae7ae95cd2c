use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use tch::{Device, Kind, Tensor};
use tracing::debug;

use crate::{error::LlmError, model::hub::WeightFiles};

/// Named tensors read from weight files, already on the target device.
pub struct WeightMap {
    tensors: HashMap<String, Tensor>,
    alias_prefix: Option<&'static str>,
    size_bytes: u64,
}

impl WeightMap {
    pub fn from_files(files: &WeightFiles, device: Device, kind: Kind) -> Result<Self, LlmError> {
        match files {
            WeightFiles::Safetensors(paths) => Self::from_safetensors(paths, device, kind),
            WeightFiles::Libtorch(path) => Self::from_libtorch(path, device, kind),
        }
    }

    pub fn from_safetensors(
        files: &[PathBuf],
        device: Device,
        kind: Kind,
    ) -> Result<Self, LlmError> {
        let mut tensors = HashMap::new();
        let mut size_bytes = 0;
        for path in files {
            size_bytes += fs::metadata(path)?.len();
            let loaded = Tensor::read_safetensors(path).map_err(|e| {
                LlmError::Weights(format!("failed to read {}: {e}", path.display()))
            })?;
            debug!(file = %path.display(), tensors = loaded.len(), "read weight file");
            for (name, tensor) in loaded {
                tensors.insert(name, place(tensor, device, kind));
            }
        }
        Ok(Self::from_tensors(tensors, size_bytes))
    }

    pub fn from_libtorch(path: &Path, device: Device, kind: Kind) -> Result<Self, LlmError> {
        let size_bytes = fs::metadata(path)?.len();
        let loaded = Tensor::load_multi_with_device(path, Device::Cpu).map_err(|e| {
            LlmError::Weights(format!("failed to read {}: {e}", path.display()))
        })?;
        debug!(file = %path.display(), tensors = loaded.len(), "read libtorch archive");
        let tensors = loaded
            .into_iter()
            .map(|(name, tensor)| (name, place(tensor, device, kind)))
            .collect();
        Ok(Self::from_tensors(tensors, size_bytes))
    }

    pub fn from_tensors(tensors: HashMap<String, Tensor>, size_bytes: u64) -> Self {
        Self {
            tensors,
            alias_prefix: None,
            size_bytes,
        }
    }

    /// Also accept every name with `prefix` in front of it.
    pub fn with_alias_prefix(mut self, prefix: &'static str) -> Self {
        self.alias_prefix = Some(prefix);
        self
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn take(&mut self, name: &str, shape: &[i64]) -> Result<Tensor, LlmError> {
        self.take_optional(name, shape)?
            .ok_or_else(|| LlmError::Weights(format!("missing tensor `{name}`")))
    }

    pub fn take_optional(&mut self, name: &str, shape: &[i64]) -> Result<Option<Tensor>, LlmError> {
        let tensor = match self.tensors.remove(name) {
            Some(t) => Some(t),
            None => self
                .alias_prefix
                .and_then(|prefix| self.tensors.remove(&format!("{prefix}{name}"))),
        };
        match tensor {
            Some(t) if t.size() != shape => Err(LlmError::Weights(format!(
                "tensor `{name}` has shape {:?}, expected {shape:?}",
                t.size()
            ))),
            other => Ok(other),
        }
    }
}

/// Casts floating tensors to `kind` while still on the host, then moves them.
fn place(tensor: Tensor, device: Device, kind: Kind) -> Tensor {
    let tensor = match tensor.kind() {
        Kind::Float | Kind::Half | Kind::BFloat16 | Kind::Double => tensor.to_kind(kind),
        _ => tensor,
    };
    tensor.to_device(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> WeightMap {
        let opts = (Kind::Float, Device::Cpu);
        let mut tensors = HashMap::new();
        tensors.insert("transformer.wte.weight".to_string(), Tensor::zeros([4, 2], opts));
        tensors.insert("lm_head.weight".to_string(), Tensor::zeros([4, 2], opts));
        WeightMap::from_tensors(tensors, 0).with_alias_prefix("transformer.")
    }

    #[test]
    fn alias_prefix_is_tried_after_exact_name() {
        let mut weights = map();
        assert!(weights.take("wte.weight", &[4, 2]).is_ok());
        assert!(weights.take("lm_head.weight", &[4, 2]).is_ok());
        assert!(weights.take_optional("wpe.weight", &[4, 2]).unwrap().is_none());
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let mut weights = map();
        let err = weights.take("wte.weight", &[2, 4]).unwrap_err();
        assert!(err.to_string().contains("wte.weight"));
    }

    #[test]
    fn safetensors_round_trip_converts_float_kind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let ids = Tensor::from_slice(&[1i64, 2, 3]);
        let w = Tensor::ones([2, 3], (Kind::Double, Device::Cpu));
        Tensor::write_safetensors(&[("ids", &ids), ("w", &w)], &path).unwrap();

        let mut weights =
            WeightMap::from_safetensors(&[path], Device::Cpu, Kind::Float).unwrap();
        assert!(weights.size_bytes() > 0);
        assert_eq!(weights.take("w", &[2, 3]).unwrap().kind(), Kind::Float);
        assert_eq!(weights.take("ids", &[3]).unwrap().kind(), Kind::Int64);
    }

    #[test]
    fn libtorch_archive_loads_through_the_same_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rust_model.ot");
        let wte = Tensor::ones([4, 2], (Kind::Double, Device::Cpu));
        Tensor::save_multi(&[("transformer.wte.weight", &wte)], &path).unwrap();

        let files = WeightFiles::Libtorch(path);
        let mut weights = WeightMap::from_files(&files, Device::Cpu, Kind::Float)
            .unwrap()
            .with_alias_prefix("transformer.");
        assert!(weights.size_bytes() > 0);
        let wte = weights.take("wte.weight", &[4, 2]).unwrap();
        assert_eq!(wte.kind(), Kind::Float);
        assert_eq!(wte.device(), Device::Cpu);
    }

    #[test]
    fn placement_casts_floats_and_keeps_integers() {
        let half = place(Tensor::ones([2], (Kind::Float, Device::Cpu)), Device::Cpu, Kind::Half);
        assert_eq!(half.kind(), Kind::Half);
        let ids = place(Tensor::from_slice(&[3i64, 4]), Device::Cpu, Kind::Half);
        assert_eq!(ids.kind(), Kind::Int64);
    }
}
