use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use hf_hub::{
    Repo, RepoType,
    api::sync::{ApiBuilder, ApiRepo},
};
use serde::Deserialize;
use tracing::debug;

use crate::{config::AppConfig, error::LlmError};

const SINGLE_WEIGHTS: &str = "model.safetensors";
const SHARDED_INDEX: &str = "model.safetensors.index.json";
const LIBTORCH_ARCHIVE: &str = "rust_model.ot";

/// Files holding the weights of one model, in the format they were found in.
#[derive(Debug, Clone, PartialEq)]
pub enum WeightFiles {
    Safetensors(Vec<PathBuf>),
    /// A libtorch `save_multi` archive, as shipped for rust-bert.
    Libtorch(PathBuf),
}

/// Where the artifacts of one model name come from.
pub enum ModelSource {
    Local(PathBuf),
    Hub { model_id: String, repo: ApiRepo },
}

#[derive(Debug, Deserialize)]
struct ShardIndex {
    weight_map: std::collections::HashMap<String, String>,
}

impl ModelSource {
    /// A name that points at an existing directory is read from disk, anything
    /// else is looked up on the hub (and its local cache).
    pub fn resolve(model_name: &str, config: &AppConfig) -> Result<Self, LlmError> {
        let local = Path::new(model_name);
        if local.is_dir() {
            return Ok(ModelSource::Local(local.to_path_buf()));
        }

        let mut builder = ApiBuilder::new()
            .with_progress(false)
            .with_token(config.hf_token.clone());
        if let Some(dir) = config.cache_dir.as_ref() {
            builder = builder.with_cache_dir(dir.clone());
        }
        let api = builder.build()?;
        let repo = api.repo(Repo::with_revision(
            model_name.to_string(),
            RepoType::Model,
            config.revision.clone(),
        ));
        Ok(ModelSource::Hub {
            model_id: model_name.to_string(),
            repo,
        })
    }

    pub fn get(&self, filename: &str) -> Result<PathBuf, LlmError> {
        match self {
            ModelSource::Local(dir) => {
                let path = dir.join(filename);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(LlmError::Hub(format!(
                        "{} not found in {}",
                        filename,
                        dir.display()
                    )))
                }
            }
            ModelSource::Hub { model_id, repo } => repo
                .get(filename)
                .map_err(|e| LlmError::Hub(format!("{model_id}/{filename}: {e}"))),
        }
    }

    /// Like [`ModelSource::get`] for files a repository may legitimately lack.
    pub fn get_optional(&self, filename: &str) -> Option<PathBuf> {
        match self.get(filename) {
            Ok(path) => Some(path),
            Err(err) => {
                debug!(%filename, %err, "optional model file unavailable");
                None
            }
        }
    }

    /// Weight files in order of preference: single safetensors file, sharded
    /// safetensors, then the libtorch archive.
    pub fn weight_files(&self) -> Result<WeightFiles, LlmError> {
        if let Some(path) = self.get_optional(SINGLE_WEIGHTS) {
            return Ok(WeightFiles::Safetensors(vec![path]));
        }
        if let Some(index_path) = self.get_optional(SHARDED_INDEX) {
            let shards = shard_names(&index_path)?
                .iter()
                .map(|name| self.get(name))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(WeightFiles::Safetensors(shards));
        }
        self.get_optional(LIBTORCH_ARCHIVE)
            .map(WeightFiles::Libtorch)
            .ok_or_else(|| {
                LlmError::Weights(format!(
                    "no {SINGLE_WEIGHTS}, {SHARDED_INDEX} or {LIBTORCH_ARCHIVE} for this model"
                ))
            })
    }
}

fn shard_names(index_path: &Path) -> Result<Vec<String>, LlmError> {
    let raw = fs::read_to_string(index_path)?;
    let index: ShardIndex = serde_json::from_str(&raw)?;
    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    if shards.is_empty() {
        return Err(LlmError::Weights(format!(
            "{} lists no weight shards",
            index_path.display()
        )));
    }
    Ok(shards.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_config() -> AppConfig {
        AppConfig::from_lookup(|_| None)
    }

    #[test]
    fn local_directory_is_used_directly() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.json"), "{}").unwrap();

        let name = dir.path().to_str().unwrap();
        let source = ModelSource::resolve(name, &offline_config()).unwrap();
        assert!(matches!(source, ModelSource::Local(_)));
        assert_eq!(
            source.get("config.json").unwrap(),
            dir.path().join("config.json")
        );
        assert!(source.get("tokenizer.json").is_err());
        assert!(source.get_optional("tokenizer.json").is_none());
    }

    #[test]
    fn single_weights_file_is_preferred() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SINGLE_WEIGHTS), b"").unwrap();
        fs::write(dir.path().join(SHARDED_INDEX), "{\"weight_map\":{}}").unwrap();
        fs::write(dir.path().join(LIBTORCH_ARCHIVE), b"").unwrap();

        let source = ModelSource::Local(dir.path().to_path_buf());
        assert_eq!(
            source.weight_files().unwrap(),
            WeightFiles::Safetensors(vec![dir.path().join(SINGLE_WEIGHTS)])
        );
    }

    #[test]
    fn shards_are_deduplicated_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let index = r#"{
            "metadata": {"total_size": 10},
            "weight_map": {
                "lm_head.weight": "model-00002-of-00002.safetensors",
                "model.embed_tokens.weight": "model-00001-of-00002.safetensors",
                "model.norm.weight": "model-00002-of-00002.safetensors"
            }
        }"#;
        fs::write(dir.path().join(SHARDED_INDEX), index).unwrap();
        fs::write(dir.path().join("model-00001-of-00002.safetensors"), b"").unwrap();
        fs::write(dir.path().join("model-00002-of-00002.safetensors"), b"").unwrap();
        fs::write(dir.path().join(LIBTORCH_ARCHIVE), b"").unwrap();

        let source = ModelSource::Local(dir.path().to_path_buf());
        let files = source.weight_files().unwrap();
        assert_eq!(
            files,
            WeightFiles::Safetensors(vec![
                dir.path().join("model-00001-of-00002.safetensors"),
                dir.path().join("model-00002-of-00002.safetensors"),
            ])
        );
    }

    #[test]
    fn libtorch_archive_is_the_last_resort() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LIBTORCH_ARCHIVE), b"").unwrap();
        fs::write(dir.path().join("pytorch_model.bin"), b"").unwrap();

        let source = ModelSource::Local(dir.path().to_path_buf());
        assert_eq!(
            source.weight_files().unwrap(),
            WeightFiles::Libtorch(dir.path().join(LIBTORCH_ARCHIVE))
        );
    }

    #[test]
    fn missing_weights_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("pytorch_model.bin"), b"").unwrap();
        let source = ModelSource::Local(dir.path().to_path_buf());
        assert!(matches!(source.weight_files(), Err(LlmError::Weights(_))));
    }
}
