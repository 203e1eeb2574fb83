use serde::{Deserialize, Serialize};
use tch::{nn, nn::Module, Device, Tensor};

/// The model collaborator: a train/eval aware forward pass producing
/// `[batch, time, vocab]` logits, plus the store that owns its parameters.
///
/// Distributed gradient synchronization, if any, is the model's own concern
/// and happens inside backward.
pub trait SequenceModel: nn::ModuleT {
    fn var_store(&self) -> &nn::VarStore;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    pub hidden_size: i64,
    pub dropout: f64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            hidden_size: 256,
            dropout: 0.1,
        }
    }
}

/// Next-token predictor from the current token alone. Used by the
/// command-line runner to drive the loop end to end.
pub struct BaselineLm {
    vs: nn::VarStore,
    embedding: nn::Embedding,
    head: nn::Linear,
    dropout: f64,
}

impl BaselineLm {
    pub fn new(device: Device, vocab_size: i64, config: &BaselineConfig) -> Self {
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let embedding = nn::embedding(
            &root / "wte",
            vocab_size,
            config.hidden_size,
            Default::default(),
        );
        let head = nn::linear(
            &root / "lm_head",
            config.hidden_size,
            vocab_size,
            Default::default(),
        );

        Self {
            vs,
            embedding,
            head,
            dropout: config.dropout,
        }
    }
}

impl std::fmt::Debug for BaselineLm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaselineLm")
            .field("device", &self.vs.device())
            .field("dropout", &self.dropout)
            .finish()
    }
}

impl nn::ModuleT for BaselineLm {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let hidden = self.embedding.forward(xs).dropout(self.dropout, train);
        self.head.forward(&hidden)
    }
}

impl SequenceModel for BaselineLm {
    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }
}
