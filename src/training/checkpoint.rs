//! Saving and restoring model checkpoints.
//!
//! A checkpoint `{dir}/{epoch}` is a pair of files: `{epoch}.mpk` with the
//! module record and `{epoch}.json` with the epoch and the mixture means.

use std::fs;
use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::backend::Backend,
};
use serde::{Deserialize, Serialize};

use crate::errors::FlowError;
use crate::model::SemiSupervisedFlow;

/// Metadata stored next to the module record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub means: Vec<Vec<f64>>,
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

fn checkpoint_error(err: impl std::fmt::Debug) -> FlowError {
    FlowError::Checkpoint {
        message: format!("{err:?}"),
    }
}

/// Checkpoint path without extension; accepts `dir/7` and `dir/7.mpk`.
fn stem(path: &Path) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == "mpk" || ext == "json") {
        path.with_extension("")
    } else {
        path.to_path_buf()
    }
}

/// Writes the checkpoint for `epoch` into `dir` and returns its stem.
pub fn save_checkpoint<B: Backend>(
    dir: &Path,
    epoch: usize,
    model: &SemiSupervisedFlow<B>,
) -> Result<PathBuf, FlowError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(epoch.to_string());

    let meta = CheckpointMeta {
        epoch,
        means: model.prior.means_host()?,
    };
    fs::write(path.with_extension("json"), serde_json::to_string(&meta)?)?;

    model
        .clone()
        .save_file(path.clone(), &recorder())
        .map_err(checkpoint_error)?;
    log::info!("Saved checkpoint {}", path.display());
    Ok(path)
}

/// Reads the metadata of a checkpoint.
pub fn load_meta(path: &Path) -> Result<CheckpointMeta, FlowError> {
    let meta_path = stem(path).with_extension("json");
    let text = fs::read_to_string(&meta_path).map_err(|err| FlowError::Checkpoint {
        message: format!("{}: {err}", meta_path.display()),
    })?;
    Ok(serde_json::from_str(&text)?)
}

/// Loads a checkpoint into `model`, which must have been built with the
/// same architecture. Returns the restored model and the saved epoch.
pub fn load_checkpoint<B: Backend>(
    path: &Path,
    model: SemiSupervisedFlow<B>,
    device: &B::Device,
) -> Result<(SemiSupervisedFlow<B>, usize), FlowError> {
    let stem = stem(path);
    let meta = load_meta(&stem)?;
    let mut model = model
        .load_file(stem.clone(), &recorder(), device)
        .map_err(checkpoint_error)?;
    model.prior.set_means(&meta.means)?;
    log::info!("Loaded checkpoint {} (epoch {})", stem.display(), meta.epoch);
    Ok((model, meta.epoch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowArchitecture;
    use crate::layers::host;
    use crate::model::SemiSupervisedFlowConfig;
    use crate::prior::MeansInit;
    use burn::backend::NdArray;
    use burn::tensor::Tensor;

    type TestBackend = NdArray;

    fn model(seed: u64) -> SemiSupervisedFlow<TestBackend> {
        let device = <TestBackend as Backend>::Device::default();
        SemiSupervisedFlowConfig::new(FlowArchitecture::ToyFlow, [1, 4, 4], 2)
            .with_means(MeansInit::Random, 1.0)
            .with_seed(seed)
            .init(&[], &device)
            .unwrap()
    }

    #[test]
    fn test_stem_strips_known_extensions() {
        assert_eq!(stem(Path::new("ckpts/3.mpk")), PathBuf::from("ckpts/3"));
        assert_eq!(stem(Path::new("ckpts/3.json")), PathBuf::from("ckpts/3"));
        assert_eq!(stem(Path::new("ckpts/3")), PathBuf::from("ckpts/3"));
    }

    #[test]
    fn test_checkpoint_roundtrip_restores_means_and_weights() {
        let device = <TestBackend as Backend>::Device::default();
        let dir = tempfile::tempdir().unwrap();
        let saved = model(1);
        let path = save_checkpoint(dir.path(), 5, &saved).unwrap();
        assert!(dir.path().join("5.mpk").exists());
        assert!(dir.path().join("5.json").exists());

        let (restored, epoch) =
            load_checkpoint(&path.with_extension("mpk"), model(2), &device).unwrap();
        assert_eq!(epoch, 5);
        assert_eq!(restored.prior.means_host().unwrap(), saved.prior.means_host().unwrap());

        let x = Tensor::<TestBackend, 4>::ones([1, 1, 4, 4], &device);
        let a = host::to_host(saved.encode(x.clone()).unwrap().z).unwrap();
        let b = host::to_host(restored.encode(x).unwrap().z).unwrap();
        for (a, b) in a.iter().zip(&b) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_missing_checkpoint_is_reported() {
        let device = <TestBackend as Backend>::Device::default();
        let dir = tempfile::tempdir().unwrap();
        let result = load_checkpoint(&dir.path().join("9"), model(0), &device);
        assert!(matches!(result, Err(FlowError::Checkpoint { .. })));
    }
}
