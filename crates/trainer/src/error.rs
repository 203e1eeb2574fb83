use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML config error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Torch error: {0}")]
    Torch(#[from] tch::TchError),

    #[error("Safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Collective operation failed: {0}")]
    Collective(String),

    #[error("Dataset error: {0}")]
    Data(String),
}

impl TrainError {
    /// True when libtorch reported an allocation failure.
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            TrainError::Torch(err) => is_out_of_memory(&err.to_string()),
            _ => false,
        }
    }
}

pub(crate) fn is_out_of_memory(message: &str) -> bool {
    message.contains("out of memory")
}

pub type Result<T> = std::result::Result<T, TrainError>;
