//! Durable checkpoints: one safetensors file per save.
//!
//! `<dir>/<name>-<epoch>.safetensors` holds the payload tensors as regular
//! entries. `epoch` and every scalar payload value live in the safetensors
//! header metadata, JSON-encoded, so the file stays loadable by any
//! safetensors reader.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use safetensors::SafeTensors;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

const EPOCH_KEY: &str = "epoch";

/// Everything saved next to the epoch number.
#[derive(Default)]
pub struct CheckpointPayload {
    tensors: HashMap<String, Tensor>,
    values: HashMap<String, Value>,
}

impl CheckpointPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named group of tensors, stored as `{group}.{name}`.
    pub fn tensors(mut self, group: &str, tensors: &HashMap<String, Tensor>) -> Self {
        for (name, t) in tensors {
            self.tensors.insert(format!("{group}.{name}"), t.clone());
        }
        self
    }

    /// Add a serialisable value under `key`.
    pub fn value<T: Serialize>(mut self, key: &str, value: &T) -> Result<Self> {
        if key == EPOCH_KEY {
            anyhow::bail!("checkpoint key {EPOCH_KEY:?} is reserved");
        }
        self.values
            .insert(key.to_string(), serde_json::to_value(value)?);
        Ok(self)
    }
}

/// `<dir>/<name>-<epoch>.safetensors`
pub fn checkpoint_path(dir: &Path, name: &str, epoch: usize) -> PathBuf {
    dir.join(format!("{name}-{epoch}.safetensors"))
}

/// Write `{epoch, ...payload}` to `<dir>/<name>-<epoch>.safetensors`,
/// creating `dir` if needed.
pub fn save_checkpoint(
    dir: &Path,
    epoch: usize,
    name: &str,
    payload: &CheckpointPayload,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create checkpoint dir {}", dir.display()))?;
    let path = checkpoint_path(dir, name, epoch);

    let mut metadata = HashMap::with_capacity(payload.values.len() + 1);
    metadata.insert(EPOCH_KEY.to_string(), epoch.to_string());
    for (key, value) in &payload.values {
        metadata.insert(key.clone(), serde_json::to_string(value)?);
    }

    let mut tensors = Vec::with_capacity(payload.tensors.len());
    for (key, t) in &payload.tensors {
        tensors.push((key.as_str(), t.contiguous()?));
    }
    safetensors::tensor::serialize_to_file(tensors, &Some(metadata), &path)
        .with_context(|| format!("write checkpoint {}", path.display()))?;

    tracing::info!(path = %path.display(), epoch, "saved checkpoint");
    Ok(path)
}

/// A checkpoint read back from disk.
pub struct Checkpoint {
    pub epoch: usize,
    pub tensors: HashMap<String, Tensor>,
    values: HashMap<String, Value>,
}

impl Checkpoint {
    /// Tensors saved under `group`, with the `{group}.` prefix removed.
    pub fn group(&self, group: &str) -> HashMap<String, Tensor> {
        let prefix = format!("{group}.");
        self.tensors
            .iter()
            .filter_map(|(k, t)| k.strip_prefix(&prefix).map(|name| (name.to_string(), t.clone())))
            .collect()
    }

    pub fn value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.values.get(key) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }
}

pub fn load_checkpoint(path: &Path, device: &Device) -> Result<Checkpoint> {
    let buffer =
        std::fs::read(path).with_context(|| format!("read checkpoint {}", path.display()))?;
    let (_, header) = SafeTensors::read_metadata(&buffer)
        .with_context(|| format!("parse checkpoint header {}", path.display()))?;
    let mut metadata = header.metadata().clone().unwrap_or_default();

    let epoch = metadata
        .remove(EPOCH_KEY)
        .context("checkpoint has no epoch")?
        .parse::<usize>()
        .context("checkpoint epoch is not an integer")?;
    let values = metadata
        .into_iter()
        .map(|(k, v)| -> Result<(String, Value)> { Ok((k, serde_json::from_str(&v)?)) })
        .collect::<Result<HashMap<String, Value>>>()?;
    let tensors = candle_core::safetensors::load_buffer(&buffer, device)?;

    Ok(Checkpoint {
        epoch,
        tensors,
        values,
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_keeps_epoch_values_and_tensors() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let dev = Device::Cpu;
        let mut state = HashMap::new();
        state.insert("fc0.weight".to_string(), Tensor::new(&[[1f32, 2.], [3., 4.]], &dev)?);

        let payload = CheckpointPayload::new()
            .tensors("model", &state)
            .value("lr", &0.05f64)?
            .value("tag", &"curve")?;
        let path = save_checkpoint(dir.path(), 7, "checkpoint", &payload)?;
        assert_eq!(path, dir.path().join("checkpoint-7.safetensors"));

        let ckpt = load_checkpoint(&path, &dev)?;
        assert_eq!(ckpt.epoch, 7);
        assert_eq!(ckpt.value::<f64>("lr")?, Some(0.05));
        assert_eq!(ckpt.value::<String>("tag")?, Some("curve".to_string()));
        assert_eq!(ckpt.value::<f64>("missing")?, None);
        let model = ckpt.group("model");
        assert_eq!(
            model["fc0.weight"].to_vec2::<f32>()?,
            vec![vec![1.0, 2.0], vec![3.0, 4.0]]
        );
        Ok(())
    }

    #[test]
    fn creates_missing_directory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let nested = dir.path().join("a").join("b");
        let path = save_checkpoint(&nested, 0, "curve", &CheckpointPayload::new())?;
        assert!(path.exists());
        assert_eq!(load_checkpoint(&path, &Device::Cpu)?.epoch, 0);
        Ok(())
    }

    #[test]
    fn epoch_key_is_reserved() {
        assert!(CheckpointPayload::new().value("epoch", &3).is_err());
    }

    #[test]
    fn transposed_tensors_are_saved_in_logical_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let dev = Device::Cpu;
        let t = Tensor::new(&[[1f32, 2.], [3., 4.]], &dev)?.t()?;
        let mut state = HashMap::new();
        state.insert("w".to_string(), t);
        let path = save_checkpoint(
            dir.path(),
            1,
            "ckpt",
            &CheckpointPayload::new().tensors("m", &state),
        )?;
        let loaded = load_checkpoint(&path, &dev)?.group("m");
        assert_eq!(loaded["w"].to_vec2::<f32>()?, vec![vec![1.0, 3.0], vec![2.0, 4.0]]);
        Ok(())
    }
}
