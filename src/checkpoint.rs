//! Checkpoint save/load for decoder weights.
//!
//! Only the weight partition is written; node states are per batch and are
//! never saved. Tensors are stored by slot path with their shape and a flat
//! row-major buffer. Loading matches slots by path and fails if the two
//! models do not have the same weight structure.

use std::collections::BTreeSet;
use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::{Fingerprint, Module, PcError, PcResult, ParamMap, Tensor};
use crate::partition::{merge_subset, partition};
use crate::training::w_filter;

/// One saved tensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedTensor {
    pub path: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Serializable checkpoint data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointData {
    /// Structure of the model the weights were taken from.
    pub fingerprint: Fingerprint,
    /// Epoch at which this checkpoint was saved.
    pub epoch: usize,
    /// Test MSE at checkpoint time.
    pub mse: f32,
    /// Weight tensors in registration order.
    pub weights: Vec<SavedTensor>,
}

fn tensor_to_saved(path: &str, tensor: &Tensor) -> SavedTensor {
    SavedTensor {
        path: path.to_string(),
        shape: tensor.shape().to_vec(),
        data: tensor.iter().copied().collect(),
    }
}

fn saved_to_tensor(saved: &SavedTensor) -> PcResult<Tensor> {
    ArrayD::from_shape_vec(IxDyn(&saved.shape), saved.data.clone()).map_err(|e| {
        PcError::ShapeMismatch(format!(
            "failed to reconstruct `{}` with shape {:?}: {e}",
            saved.path, saved.shape
        ))
    })
}

/// Snapshot the weight partition of `model`.
pub fn checkpoint_data<M: Module + ?Sized>(model: &M, epoch: usize, mse: f32) -> PcResult<CheckpointData> {
    let weights = partition(model, &w_filter())?;
    Ok(CheckpointData {
        fingerprint: model.store().fingerprint(),
        epoch,
        mse,
        weights: weights
            .target
            .iter()
            .map(|(key, value)| tensor_to_saved(key.path(), value))
            .collect(),
    })
}

/// Save the weights of `model` to a JSON file, creating parent directories.
///
/// # Errors
///
/// Returns an error if the file cannot be written or the data cannot be serialized.
pub fn save_checkpoint<M: Module + ?Sized>(
    model: &M,
    path: &Path,
    epoch: usize,
    mse: f32,
) -> PcResult<()> {
    let data = checkpoint_data(model, epoch, mse)?;
    let json = serde_json::to_string_pretty(&data)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, json)?;
    info!(path = %path.display(), epoch, tensors = data.weights.len(), "saved checkpoint");
    Ok(())
}

/// Write the weights in `data` into `model`.
///
/// # Errors
/// - `StructuralMismatch` if the saved and live weight paths differ
/// - `ShapeMismatch` if a saved tensor has a different shape than its slot
pub fn apply_checkpoint<M: Module + ?Sized>(model: &mut M, data: &CheckpointData) -> PcResult<()> {
    let live = partition(&*model, &w_filter())?.target;
    let saved: BTreeSet<&str> = data.weights.iter().map(|w| w.path.as_str()).collect();
    let current: BTreeSet<&str> = live.keys().map(|k| k.path()).collect();

    let missing: Vec<String> = current.difference(&saved).map(|p| p.to_string()).collect();
    let extra: Vec<String> = saved.difference(&current).map(|p| p.to_string()).collect();
    if !missing.is_empty() || !extra.is_empty() || saved.len() != data.weights.len() {
        return Err(PcError::StructuralMismatch { missing, extra });
    }

    let mut values = ParamMap::new();
    for saved in &data.weights {
        let key = live
            .find(&saved.path)
            .ok_or_else(|| PcError::UnknownKey(saved.path.clone()))?
            .clone();
        let tensor = saved_to_tensor(saved)?;
        let slot = live.get(&key).ok_or_else(|| PcError::UnknownKey(saved.path.clone()))?;
        if slot.shape() != tensor.shape() {
            return Err(PcError::ShapeMismatch(format!(
                "checkpoint `{}` has shape {:?}, model expects {:?}",
                saved.path,
                tensor.shape(),
                slot.shape()
            )));
        }
        values.insert(key, tensor);
    }
    merge_subset(model.store_mut(), values)
}

/// Load a checkpoint file into `model`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if its weights
/// do not fit `model` (see [`apply_checkpoint`]).
pub fn load_checkpoint<M: Module + ?Sized>(model: &mut M, path: &Path) -> PcResult<CheckpointData> {
    let json = std::fs::read_to_string(path)?;
    let data: CheckpointData = serde_json::from_str(&json)?;
    apply_checkpoint(model, &data)?;
    info!(path = %path.display(), epoch = data.epoch, "loaded checkpoint");
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EnergyModel, PcDecoder};
    use crate::utils::{Activation, RandomKeyGenerator};
    use std::fs;

    fn make_decoder(seed: u64, dims: &[usize]) -> PcDecoder {
        let mut rkg = RandomKeyGenerator::new(seed);
        PcDecoder::with_dims(dims, Activation::Tanh, None, &mut rkg).expect("valid dims")
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let source = make_decoder(1, &[2, 3, 4]);
        let mut target = make_decoder(2, &[2, 3, 4]);
        let dir = std::env::temp_dir().join("pcx_test_checkpoint");
        let path = dir.join("weights.json");

        save_checkpoint(&source, &path, 5, 0.42).expect("save");
        let data = load_checkpoint(&mut target, &path).expect("load");

        assert_eq!(data.epoch, 5);
        assert_eq!(data.weights.len(), 4);
        for layer in source.layers() {
            assert_eq!(
                source.store().get(layer.weight_key()).unwrap(),
                target.store().get(layer.weight_key()).unwrap()
            );
        }

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_node_states_are_not_saved() {
        let model = make_decoder(0, &[2, 3]);
        let data = checkpoint_data(&model, 0, 0.0).unwrap();
        assert!(data.weights.iter().all(|w| w.path.starts_with("layers.")));
        assert!(model.nodes().iter().all(|n| !data
            .weights
            .iter()
            .any(|w| w.path == n.x_key().path())));
    }

    #[test]
    fn test_structural_mismatch_on_load() {
        let source = make_decoder(0, &[2, 3, 4]);
        let mut target = make_decoder(0, &[2, 4]);
        let data = checkpoint_data(&source, 0, 0.0).unwrap();
        match apply_checkpoint(&mut target, &data) {
            Err(PcError::StructuralMismatch { extra, .. }) => {
                assert!(extra.contains(&"layers.1.weight".to_string()));
            }
            other => panic!("expected StructuralMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_shape_mismatch_on_load() {
        let source = make_decoder(0, &[2, 3]);
        let mut target = make_decoder(0, &[2, 5]);
        let data = checkpoint_data(&source, 0, 0.0).unwrap();
        assert!(matches!(
            apply_checkpoint(&mut target, &data),
            Err(PcError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_load_nonexistent_checkpoint() {
        let mut model = make_decoder(0, &[2, 3]);
        let result = load_checkpoint(&mut model, Path::new("/nonexistent/path.json"));
        assert!(matches!(result, Err(PcError::Io(_))));
    }
}
