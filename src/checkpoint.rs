// src/checkpoint.rs
//
// Layout of a checkpoint directory:
//   ckpt-{step}.dev{i}.ot   one file per parameter store (device)
//   checkpoint.json         retained checkpoints, oldest first
//   hparams.json            hyper-parameters needed to rebuild the network

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::device::ParamStores;
use crate::hparams::HParams;
use crate::model::TrainingState;

const INDEX_FILE: &str = "checkpoint.json";
const HPARAMS_FILE: &str = "hparams.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub state: TrainingState,
    pub files: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointIndex {
    checkpoints: Vec<CheckpointRecord>,
}

/// Saves parameter stores with their training state and keeps the newest
/// `max_to_keep` checkpoints.
pub struct CheckpointManager {
    dir: PathBuf,
    max_to_keep: usize,
}

impl CheckpointManager {
    pub const DEFAULT_MAX_TO_KEEP: usize = 3;

    pub fn new(dir: impl Into<PathBuf>, max_to_keep: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("Cannot create checkpoint dir '{}'", dir.display()))?;
        Ok(Self { dir, max_to_keep: max_to_keep.max(1) })
    }

    fn read_index(&self) -> Result<CheckpointIndex> {
        let path = self.dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(CheckpointIndex::default());
        }
        let json = fs::read_to_string(&path).with_context(|| format!("Cannot read '{}'", path.display()))?;
        Ok(serde_json::from_str(&json)?)
    }

    fn write_index(&self, index: &CheckpointIndex) -> Result<()> {
        let path = self.dir.join(INDEX_FILE);
        fs::write(&path, serde_json::to_string_pretty(index)?)
            .with_context(|| format!("Cannot write '{}'", path.display()))
    }

    /// Writes every store and records `state`; older checkpoints beyond
    /// `max_to_keep` are deleted.
    pub fn save(&self, stores: &ParamStores, state: TrainingState) -> Result<CheckpointRecord> {
        let mut files = Vec::with_capacity(stores.stores().len());
        for (i, vs) in stores.stores().iter().enumerate() {
            let name = format!("ckpt-{}.dev{}.ot", state.global_step, i);
            let path = self.dir.join(&name);
            vs.save(&path).with_context(|| format!("Failed to save checkpoint to '{}'", path.display()))?;
            files.push(name);
        }
        let record = CheckpointRecord { state, files };

        let mut index = self.read_index()?;
        index.checkpoints.retain(|c| c.state.global_step != state.global_step);
        index.checkpoints.push(record.clone());
        while index.checkpoints.len() > self.max_to_keep {
            let stale = index.checkpoints.remove(0);
            for file in &stale.files {
                if let Err(e) = fs::remove_file(self.dir.join(file)) {
                    tracing::warn!("could not delete old checkpoint file {}: {}", file, e);
                }
            }
        }
        self.write_index(&index)?;

        tracing::info!("  saved checkpoint at global step {}", state.global_step);
        Ok(record)
    }

    pub fn latest(&self) -> Result<Option<CheckpointRecord>> {
        Ok(self.read_index()?.checkpoints.pop())
    }

    pub fn all(&self) -> Result<Vec<CheckpointRecord>> {
        Ok(self.read_index()?.checkpoints)
    }

    /// Loads the newest checkpoint into `stores`. `None` when nothing was saved yet.
    pub fn restore_latest(&self, stores: &mut ParamStores) -> Result<Option<TrainingState>> {
        let record = match self.latest()? {
            Some(record) => record,
            None => return Ok(None),
        };
        if record.files.len() != stores.stores().len() {
            bail!(
                "checkpoint at step {} has {} parameter files but the model uses {} devices",
                record.state.global_step,
                record.files.len(),
                stores.stores().len()
            );
        }
        for (vs, file) in stores.stores_mut().iter_mut().zip(&record.files) {
            let path = self.dir.join(file);
            vs.load(&path).with_context(|| format!("Cannot load checkpoint '{}'", path.display()))?;
        }
        tracing::info!("  loaded checkpoint at global step {}", record.state.global_step);
        Ok(Some(record.state))
    }

    pub fn save_hparams(&self, hparams: &HParams) -> Result<()> {
        hparams.save(self.dir.join(HPARAMS_FILE))
    }

    pub fn load_hparams(&self) -> Result<HParams> {
        HParams::load(self.dir.join(HPARAMS_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind, Tensor};

    fn stores_with_weight(value: f64) -> (ParamStores, Tensor) {
        let stores = ParamStores::cpu();
        let w = stores.scoped(Device::Cpu, "layer").zeros("w", &[2, 2]);
        let mut handle = w.shallow_clone();
        tch::no_grad(|| {
            let _ = handle.fill_(value);
        });
        (stores, w)
    }

    #[test]
    fn test_restore_brings_back_weights_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 3).unwrap();
        let (stores, _) = stores_with_weight(1.5);
        manager.save(&stores, TrainingState { global_step: 10, learning_rate: 0.25 }).unwrap();

        let (mut fresh, w) = stores_with_weight(0.0);
        let state = manager.restore_latest(&mut fresh).unwrap().unwrap();
        assert_eq!(state, TrainingState { global_step: 10, learning_rate: 0.25 });
        assert_eq!(w.sum(Kind::Float).double_value(&[]), 6.0);
    }

    #[test]
    fn test_only_newest_checkpoints_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 2).unwrap();
        let (stores, _) = stores_with_weight(1.0);
        for step in [1, 2, 3] {
            manager.save(&stores, TrainingState { global_step: step, learning_rate: 0.1 }).unwrap();
        }
        let steps: Vec<i64> = manager.all().unwrap().iter().map(|c| c.state.global_step).collect();
        assert_eq!(steps, vec![2, 3]);
        assert!(!dir.path().join("ckpt-1.dev0.ot").exists());
        assert!(dir.path().join("ckpt-3.dev0.ot").exists());
    }

    #[test]
    fn test_empty_directory_restores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), CheckpointManager::DEFAULT_MAX_TO_KEEP).unwrap();
        let mut stores = ParamStores::cpu();
        assert!(manager.restore_latest(&mut stores).unwrap().is_none());
    }

    #[test]
    fn test_hparams_are_saved_alongside() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("nested"), 3).unwrap();
        let hp = HParams { vocab_size: 77, cell_type: "gru".into(), ..HParams::default() };
        manager.save_hparams(&hp).unwrap();
        let loaded = manager.load_hparams().unwrap();
        assert_eq!(loaded.vocab_size, 77);
        assert_eq!(loaded.cell_type, "gru");
    }
}
