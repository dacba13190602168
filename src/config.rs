//! The experiment configuration record.
//!
//! A [`Config`] starts from its defaults, is overlaid by the settings file and the
//! environment (see [`crate::common::settings`]) and finally by the command line options of
//! the driver binaries, before being handed to one of the runners.

use std::{fmt, str::FromStr};

use derive_more::Display;
use thiserror::Error;
use validator::{Validate, ValidationError};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} {value:?}, expected one of: {expected}")]
/// Error returned when a name does not match any known variant.
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
    expected: &'static str,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str, expected: &'static str) -> Self {
        Self {
            kind,
            value: value.to_string(),
            expected,
        }
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// The device the models are trained on.
pub enum Device {
    #[display(fmt = "cpu")]
    Cpu,
    #[display(fmt = "cuda")]
    Cuda,
}

impl FromStr for Device {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda),
            _ => Err(UnknownVariant::new("device", s, "cpu, cuda")),
        }
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// The aggregation algorithm run by the server.
pub enum ServerAlgorithm {
    ServerFedAvg,
    ServerFedAvgMomentum,
    ServerFedAdagrad,
    ServerFedAdam,
    ServerFedYogi,
}

impl FromStr for ServerAlgorithm {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use ServerAlgorithm::*;
        match s {
            "ServerFedAvg" => Ok(ServerFedAvg),
            "ServerFedAvgMomentum" => Ok(ServerFedAvgMomentum),
            "ServerFedAdagrad" => Ok(ServerFedAdagrad),
            "ServerFedAdam" => Ok(ServerFedAdam),
            "ServerFedYogi" => Ok(ServerFedYogi),
            _ => Err(UnknownVariant::new(
                "server",
                s,
                "ServerFedAvg, ServerFedAvgMomentum, ServerFedAdagrad, ServerFedAdam, ServerFedYogi",
            )),
        }
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// How clients count their local work.
pub enum ClientAlgorithm {
    /// `num_local_epochs` full passes over the local data.
    ClientOptim,
    /// `num_local_steps` mini-batches.
    ClientStepOptim,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// The local optimizer of the clients.
pub enum Optimizer {
    #[serde(rename = "SGD")]
    #[display(fmt = "SGD")]
    Sgd,
    Adam,
}

impl FromStr for Optimizer {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SGD" | "sgd" => Ok(Self::Sgd),
            "Adam" | "adam" => Ok(Self::Adam),
            _ => Err(UnknownVariant::new("optimizer", s, "SGD, Adam")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
/// The experiment configuration.
pub struct Config {
    pub device: Device,
    pub dataset: String,
    #[validate(range(min = 1))]
    pub num_clients: usize,
    /// Number of federated rounds.
    #[validate(range(min = 1))]
    pub num_epochs: u32,

    #[validate(range(min = 1))]
    pub train_data_batch_size: usize,
    pub train_data_shuffle: bool,
    /// Accepted for compatibility with existing configuration files. Evaluation visits
    /// the test images one at a time, so the value does not change any result.
    #[validate(range(min = 1))]
    pub test_data_batch_size: usize,

    /// Whether clients validate the model they trained against the test data.
    pub validation: bool,
    /// Whether the datasets are checked against the expected shape before training.
    pub data_sanity: bool,
    /// Whether every random source is seeded with `seed`.
    pub reproduce: bool,
    pub seed: u64,

    pub record_metrics: bool,
    pub output_dirname: String,
    pub output_filename: String,

    pub save_model: bool,
    pub save_model_dirname: String,
    pub save_model_filename: String,
    #[validate(range(min = 1))]
    pub checkpoints_interval: u32,

    pub load_model: bool,
    pub load_model_dirname: String,
    pub load_model_filename: String,

    #[validate]
    pub fed: FedConfig,
    #[validate]
    pub partition: PartitionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            dataset: String::new(),
            num_clients: 1,
            num_epochs: 2,
            train_data_batch_size: 64,
            train_data_shuffle: false,
            test_data_batch_size: 64,
            validation: true,
            data_sanity: false,
            reproduce: true,
            seed: 1,
            record_metrics: false,
            output_dirname: "output".to_string(),
            output_filename: "result".to_string(),
            save_model: false,
            save_model_dirname: "save_models".to_string(),
            save_model_filename: "model".to_string(),
            checkpoints_interval: 2,
            load_model: false,
            load_model_dirname: String::new(),
            load_model_filename: String::new(),
            fed: FedConfig::default(),
            partition: PartitionConfig::default(),
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct FedConfig {
    pub servername: ServerAlgorithm,
    pub clientname: ClientAlgorithm,
    #[validate]
    pub args: FedArgs,
}

impl Default for FedConfig {
    fn default() -> Self {
        Self {
            servername: ServerAlgorithm::ServerFedAvg,
            clientname: ClientAlgorithm::ClientOptim,
            args: FedArgs::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_fed_args"))]
/// Hyperparameters of the clients and the server.
pub struct FedArgs {
    pub optim: Optimizer,
    pub optim_args: OptimArgs,
    #[validate(range(min = 1))]
    pub num_local_epochs: u32,
    #[validate(range(min = 1))]
    pub num_local_steps: u32,

    pub server_learning_rate: f32,
    pub server_adapt_param: f32,
    pub server_momentum_param_1: f32,
    pub server_momentum_param_2: f32,

    pub use_dp: bool,
    /// Privacy budget, smaller is more private.
    pub epsilon: f32,
    pub clip_grad: bool,
    pub clip_value: f32,
    /// The `p` of the p-norm used for clipping.
    pub clip_norm: f32,
}

impl Default for FedArgs {
    fn default() -> Self {
        Self {
            optim: Optimizer::Sgd,
            optim_args: OptimArgs::default(),
            num_local_epochs: 1,
            num_local_steps: 10,
            server_learning_rate: 0.01,
            server_adapt_param: 0.001,
            server_momentum_param_1: 0.9,
            server_momentum_param_2: 0.99,
            use_dp: false,
            epsilon: 1.0,
            clip_grad: false,
            clip_value: 1.0,
            clip_norm: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimArgs {
    pub lr: f32,
    /// Only used by SGD.
    pub momentum: f32,
}

impl Default for OptimArgs {
    fn default() -> Self {
        Self {
            lr: 0.01,
            momentum: 0.0,
        }
    }
}

fn validate_fed_args(args: &FedArgs) -> Result<(), ValidationError> {
    let positive = [
        ("optim_args.lr", args.optim_args.lr),
        ("epsilon", args.epsilon),
        ("clip_value", args.clip_value),
        ("clip_norm", args.clip_norm),
        ("server_learning_rate", args.server_learning_rate),
    ];
    for (name, value) in positive.iter() {
        if !(*value > 0.0) {
            let mut error = ValidationError::new("not_positive");
            error.add_param("field".into(), name);
            return Err(error);
        }
    }
    if !(0.0..1.0).contains(&args.optim_args.momentum)
        || !(0.0..1.0).contains(&args.server_momentum_param_1)
        || !(0.0..1.0).contains(&args.server_momentum_param_2)
    {
        return Err(ValidationError::new("momentum_out_of_range"));
    }
    if args.server_adapt_param < 0.0 {
        return Err(ValidationError::new("negative_adapt_param"));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_partition"))]
/// Concentration parameters of the `dirichlet_noiid` partition.
pub struct PartitionConfig {
    /// Concentration of the client dataset sizes.
    pub alpha1: f64,
    /// Concentration of the per-client class mixtures.
    pub alpha2: f64,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            alpha1: 8.0,
            alpha2: 0.5,
        }
    }
}

fn validate_partition(partition: &PartitionConfig) -> Result<(), ValidationError> {
    if partition.alpha1 > 0.0 && partition.alpha2 > 0.0 {
        Ok(())
    } else {
        Err(ValidationError::new("dirichlet_alpha_not_positive"))
    }
}
