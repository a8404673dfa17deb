// src/hparams.rs
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Hyper-parameters for one model family.
///
/// Loaded from JSON; every field except the vocabulary size has a default so
/// configs only need to list what they change. String-typed choices are parsed
/// into their enums when the network is built, which is where unknown values
/// turn into `ModelError::Configuration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HParams {
    pub vocab_file: Option<PathBuf>,
    /// Pretrained embedding matrix (`.npy` or a tch tensor file).
    pub vocab_h5: Option<PathBuf>,
    pub vocab_size: usize,
    pub embedding_size: Option<usize>,
    pub num_gpus: usize,

    pub hidden_units: usize,
    pub num_layers: usize,
    pub cell_type: String,
    pub encoder_type: String,
    pub context_type: String,
    pub residual: bool,

    pub encoder_dropout_rate: f64,
    pub decoder_dropout_rate: f64,
    pub context_dropout_rate: f64,

    pub scheduled_sampling_prob: f64,
    pub sampling_schedule: String,
    pub sampling_decay_steps: u64,

    pub optimizer: String,
    pub learning_rate: f64,
    pub warmup_steps: u64,
    pub warmup_scheme: String,
    pub decay_scheme: String,
    pub num_train_steps: u64,
    pub max_gradient_norm: f64,

    pub beam_width: i64,
    pub length_penalty_weight: f64,
    pub decoding_length_factor: f64,

    pub batch_size: usize,
    pub num_turns: usize,
    pub random_seed: Option<i64>,
}

impl Default for HParams {
    fn default() -> Self {
        Self {
            vocab_file: None,
            vocab_h5: None,
            vocab_size: 0,
            embedding_size: None,
            num_gpus: 0,
            hidden_units: 512,
            num_layers: 2,
            cell_type: "lstm".to_string(),
            encoder_type: "uni".to_string(),
            context_type: "uni".to_string(),
            residual: false,
            encoder_dropout_rate: 0.2,
            decoder_dropout_rate: 0.2,
            context_dropout_rate: 0.2,
            scheduled_sampling_prob: 0.0,
            sampling_schedule: "constant".to_string(),
            sampling_decay_steps: 10_000,
            optimizer: "adam".to_string(),
            learning_rate: 0.001,
            warmup_steps: 0,
            warmup_scheme: "t2t".to_string(),
            decay_scheme: "none".to_string(),
            num_train_steps: 100_000,
            max_gradient_norm: 5.0,
            beam_width: 0,
            length_penalty_weight: 0.0,
            decoding_length_factor: 2.0,
            batch_size: 64,
            num_turns: 3,
            random_seed: None,
        }
    }
}

impl HParams {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read hparams from '{}'", path.display()))?;
        let hparams: HParams = serde_json::from_str(&json)
            .with_context(|| format!("Malformed hparams in '{}'", path.display()))?;
        Ok(hparams)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Cannot write hparams to '{}'", path.display()))?;
        Ok(())
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_size.unwrap_or(self.hidden_units)
    }

    pub fn cell(&self) -> Result<CellType, ModelError> {
        self.cell_type.parse()
    }

    pub fn encoder(&self) -> Result<NetworkType, ModelError> {
        NetworkType::parse("encoder", &self.encoder_type)
    }

    pub fn context(&self) -> Result<NetworkType, ModelError> {
        NetworkType::parse("context", &self.context_type)
    }

    pub fn optimizer_kind(&self) -> Result<OptimizerKind, ModelError> {
        self.optimizer.parse()
    }

    pub fn warmup(&self) -> Result<WarmupScheme, ModelError> {
        self.warmup_scheme.parse()
    }

    pub fn decay(&self) -> Result<DecayScheme, ModelError> {
        self.decay_scheme.parse()
    }

    pub fn sampling(&self) -> Result<SamplingSchedule, ModelError> {
        self.sampling_schedule.parse()
    }

    /// Checks every choice and the layer arithmetic once, up front.
    pub fn validate(&self) -> Result<(), ModelError> {
        self.cell()?;
        let encoder = self.encoder()?;
        let context = self.context()?;
        self.optimizer_kind()?;
        self.warmup()?;
        self.decay()?;
        self.sampling()?;

        if self.vocab_size == 0 {
            return Err(ModelError::config("vocab_size must be positive"));
        }
        if self.num_turns < 2 {
            return Err(ModelError::config(format!(
                "num_turns must count at least one prior turn and the response, got {}",
                self.num_turns
            )));
        }
        if self.hidden_units == 0 || self.num_layers == 0 {
            return Err(ModelError::config("hidden_units and num_layers must be positive"));
        }
        let any_bi = encoder == NetworkType::Bi || context == NetworkType::Bi;
        if any_bi && (self.num_layers < 2 || self.num_layers % 2 != 0) {
            return Err(ModelError::config(format!(
                "bidirectional networks need an even num_layers >= 2, got {}",
                self.num_layers
            )));
        }
        if !(0.0..=1.0).contains(&self.scheduled_sampling_prob) {
            return Err(ModelError::config("scheduled_sampling_prob must lie in [0, 1]"));
        }
        for (name, rate) in [
            ("encoder_dropout_rate", self.encoder_dropout_rate),
            ("decoder_dropout_rate", self.decoder_dropout_rate),
            ("context_dropout_rate", self.context_dropout_rate),
        ] {
            if !(0.0..1.0).contains(&rate) {
                return Err(ModelError::config(format!("{} must lie in [0, 1)", name)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellType {
    Rnn,
    Gru,
    Lstm,
    LayerNormLstm,
}

impl FromStr for CellType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rnn" | "basic" => Ok(CellType::Rnn),
            "gru" => Ok(CellType::Gru),
            "lstm" => Ok(CellType::Lstm),
            "layer_norm_lstm" => Ok(CellType::LayerNormLstm),
            other => Err(ModelError::config(format!("Unknown cell type: '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    Uni,
    Bi,
}

impl NetworkType {
    fn parse(role: &str, s: &str) -> Result<Self, ModelError> {
        match s {
            "uni" => Ok(NetworkType::Uni),
            "bi" => Ok(NetworkType::Bi),
            other => Err(ModelError::config(format!("Unknown {} type: '{}'", role, other))),
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkType::Uni => write!(f, "uni"),
            NetworkType::Bi => write!(f, "bi"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

impl FromStr for OptimizerKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sgd" => Ok(OptimizerKind::Sgd),
            "adam" => Ok(OptimizerKind::Adam),
            _ => Err(ModelError::config(format!("Unknown optimizer: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmupScheme {
    T2t,
}

impl FromStr for WarmupScheme {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "t2t" => Ok(WarmupScheme::T2t),
            other => Err(ModelError::config(format!("Unknown warmup scheme: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecayScheme {
    None,
    /// Halve 5 times over the last half of training.
    Luong5,
    /// Halve 10 times over the last half of training.
    Luong10,
    /// Halve 4 times over the last third of training.
    Luong234,
}

impl FromStr for DecayScheme {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "none" => Ok(DecayScheme::None),
            "luong5" => Ok(DecayScheme::Luong5),
            "luong10" => Ok(DecayScheme::Luong10),
            "luong234" => Ok(DecayScheme::Luong234),
            other => Err(ModelError::config(format!("Unknown decay scheme: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingSchedule {
    Constant,
    Linear,
    InverseSigmoid,
}

impl FromStr for SamplingSchedule {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "constant" => Ok(SamplingSchedule::Constant),
            "linear" => Ok(SamplingSchedule::Linear),
            "inverse_sigmoid" => Ok(SamplingSchedule::InverseSigmoid),
            other => Err(ModelError::config(format!("Unknown sampling schedule: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> HParams {
        HParams { vocab_size: 50, hidden_units: 16, ..HParams::default() }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(small().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let hp: HParams = serde_json::from_str(r#"{"vocab_size": 50, "cell_type": "gru"}"#).unwrap();
        assert_eq!(hp.vocab_size, 50);
        assert_eq!(hp.cell().unwrap(), CellType::Gru);
        assert_eq!(hp.num_layers, 2);
        assert_eq!(hp.embedding_dim(), hp.hidden_units);
    }

    #[test]
    fn test_unknown_choices_are_configuration_errors() {
        let hp = HParams { cell_type: "nas".into(), ..small() };
        assert!(matches!(hp.validate(), Err(ModelError::Configuration(_))));

        let hp = HParams { encoder_type: "tri".into(), ..small() };
        assert!(matches!(hp.validate(), Err(ModelError::Configuration(_))));

        let hp = HParams { context_type: "both".into(), ..small() };
        assert!(matches!(hp.validate(), Err(ModelError::Configuration(_))));

        let hp = HParams { optimizer: "rmsprop".into(), ..small() };
        assert!(matches!(hp.validate(), Err(ModelError::Configuration(_))));
    }

    #[test]
    fn test_optimizer_name_is_case_insensitive() {
        assert_eq!("SGD".parse::<OptimizerKind>().unwrap(), OptimizerKind::Sgd);
        assert_eq!("Adam".parse::<OptimizerKind>().unwrap(), OptimizerKind::Adam);
    }

    #[test]
    fn test_single_turn_dialogues_are_rejected() {
        for num_turns in [0, 1] {
            let hp = HParams { num_turns, ..small() };
            assert!(matches!(hp.validate(), Err(ModelError::Configuration(_))));
        }
        assert!(HParams { num_turns: 2, ..small() }.validate().is_ok());
    }

    #[test]
    fn test_bidirectional_needs_even_layers() {
        let hp = HParams { encoder_type: "bi".into(), num_layers: 3, ..small() };
        assert!(hp.validate().is_err());
        let hp = HParams { context_type: "bi".into(), num_layers: 1, ..small() };
        assert!(hp.validate().is_err());
        let hp = HParams { encoder_type: "bi".into(), context_type: "bi".into(), num_layers: 4, ..small() };
        assert!(hp.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hparams.json");
        let hp = HParams { beam_width: 5, ..small() };
        hp.save(&path).unwrap();
        let loaded = HParams::load(&path).unwrap();
        assert_eq!(loaded.beam_width, 5);
        assert_eq!(loaded.vocab_size, 50);
    }
}
