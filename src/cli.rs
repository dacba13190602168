//! Command line options of the driver binaries.
//!
//! Flag names keep their historical snake case spelling (`--num_clients`, `--client_lr`),
//! so every option spells out its `long` name.

use std::path::PathBuf;

use structopt::StructOpt;

use crate::{
    config::{ClientAlgorithm, Config, Device, Optimizer, ServerAlgorithm},
    data::partition::Partition,
};

#[derive(Debug, StructOpt)]
/// Options shared by both drivers.
pub struct CommonOpt {
    #[structopt(long = "config", parse(from_os_str), help = "Path to a TOML settings file")]
    pub config: Option<PathBuf>,
    #[structopt(
        long = "data_dir",
        default_value = "datasets/RawData",
        parse(from_os_str),
        help = "Directory holding one sub-directory per dataset"
    )]
    pub data_dir: PathBuf,
    #[structopt(long = "rank", help = "Rank of this process, overrides the launcher")]
    pub rank: Option<u32>,
    #[structopt(
        long = "world_size",
        help = "Number of processes, overrides the launcher"
    )]
    pub world_size: Option<u32>,
}

#[derive(Debug, StructOpt)]
#[structopt(name = "celeba", about = "Federated learning on CelebA")]
pub struct CelebaOpt {
    #[structopt(flatten)]
    pub common: CommonOpt,
    #[structopt(long = "device", default_value = "cpu")]
    pub device: Device,
    #[structopt(long = "dataset", default_value = "CELEBA")]
    pub dataset: String,
    #[structopt(long = "num_channel", default_value = "3")]
    pub num_channel: usize,
    #[structopt(long = "num_classes", default_value = "2")]
    pub num_classes: usize,
    #[structopt(long = "num_pixel", default_value = "218")]
    pub num_pixel: u32,
    #[structopt(long = "model", default_value = "CNN")]
    pub model: String,
    #[structopt(
        long = "num_clients",
        default_value = "1",
        help = "Ignored: the number of train users in the manifest wins"
    )]
    pub num_clients: usize,
    #[structopt(long = "client_optimizer", default_value = "Adam")]
    pub client_optimizer: Optimizer,
    #[structopt(long = "client_lr", default_value = "1e-3")]
    pub client_lr: f32,
    #[structopt(long = "num_local_epochs", default_value = "1")]
    pub num_local_epochs: u32,
    #[structopt(long = "server", default_value = "ServerFedAvg")]
    pub server: ServerAlgorithm,
    #[structopt(long = "num_epochs", default_value = "2")]
    pub num_epochs: u32,
    #[structopt(long = "server_lr")]
    pub server_lr: Option<f32>,
    #[structopt(long = "mparam_1")]
    pub mparam_1: Option<f32>,
    #[structopt(long = "mparam_2")]
    pub mparam_2: Option<f32>,
    #[structopt(long = "adapt_param")]
    pub adapt_param: Option<f32>,
    #[structopt(
        long = "pretrained",
        default_value = "0",
        help = "Start from the checkpoint named by the load_model settings when non-zero"
    )]
    pub pretrained: u8,
    #[structopt(long = "metric")]
    pub metric: Option<String>,
}

impl CelebaOpt {
    pub fn apply(&self, config: &mut Config) {
        config.device = self.device;
        config.dataset = self.dataset.clone();
        config.num_epochs = self.num_epochs;
        config.record_metrics = true;
        config.load_model = self.pretrained != 0;

        let args = &mut config.fed.args;
        args.optim = self.client_optimizer;
        args.optim_args.lr = self.client_lr;
        args.num_local_epochs = self.num_local_epochs;
        config.fed.servername = self.server;
        if let Some(lr) = self.server_lr {
            args.server_learning_rate = lr;
        }
        if let Some(beta) = self.mparam_1 {
            args.server_momentum_param_1 = beta;
        }
        if let Some(beta) = self.mparam_2 {
            args.server_momentum_param_2 = beta;
        }
        if let Some(adapt) = self.adapt_param {
            args.server_adapt_param = adapt;
        }
    }
}

#[derive(Debug, StructOpt)]
#[structopt(name = "cifar10-grpc", about = "Federated learning on CIFAR-10, one client per rank")]
pub struct Cifar10Opt {
    #[structopt(flatten)]
    pub common: CommonOpt,
    #[structopt(long = "device", default_value = "cpu")]
    pub device: Device,
    #[structopt(long = "dataset", default_value = "CIFAR10")]
    pub dataset: String,
    #[structopt(long = "num_channel", default_value = "3")]
    pub num_channel: usize,
    #[structopt(long = "num_classes", default_value = "10")]
    pub num_classes: usize,
    #[structopt(long = "num_pixel", default_value = "32")]
    pub num_pixel: u32,
    #[structopt(long = "model", default_value = "CNN")]
    pub model: String,
    #[structopt(long = "train_data_batch_size", default_value = "128")]
    pub train_data_batch_size: usize,
    #[structopt(long = "test_data_batch_size", default_value = "128")]
    pub test_data_batch_size: usize,
    #[structopt(
        long = "partition",
        default_value = "iid",
        possible_values = &["iid", "class_noiid", "dirichlet_noiid"]
    )]
    pub partition: Partition,
    #[structopt(long = "seed", default_value = "42", help = "Seed of the partition")]
    pub seed: u64,
    #[structopt(long = "client_optimizer", default_value = "Adam")]
    pub client_optimizer: Optimizer,
    #[structopt(long = "client_lr", default_value = "1e-3")]
    pub client_lr: f32,
    #[structopt(
        long = "local_train_pattern",
        default_value = "steps",
        possible_values = &["steps", "epochs"]
    )]
    pub local_train_pattern: String,
    #[structopt(long = "num_local_steps", default_value = "10")]
    pub num_local_steps: u32,
    #[structopt(long = "num_local_epochs", default_value = "1")]
    pub num_local_epochs: u32,
    #[structopt(long = "do_validation")]
    pub do_validation: bool,
    #[structopt(long = "server", default_value = "ServerFedAvg")]
    pub server: ServerAlgorithm,
    #[structopt(long = "num_epochs", default_value = "1")]
    pub num_epochs: u32,
    #[structopt(long = "server_lr", default_value = "0.01")]
    pub server_lr: f32,
    #[structopt(long = "mparam_1", default_value = "0.9")]
    pub mparam_1: f32,
    #[structopt(long = "mparam_2", default_value = "0.99")]
    pub mparam_2: f32,
    #[structopt(long = "adapt_param", default_value = "0.001")]
    pub adapt_param: f32,
    #[structopt(long = "use_dp")]
    pub use_dp: bool,
    #[structopt(long = "epsilon", default_value = "1")]
    pub epsilon: f32,
    #[structopt(long = "clip_grad")]
    pub clip_grad: bool,
    #[structopt(long = "clip_value", default_value = "1.0")]
    pub clip_value: f32,
    #[structopt(long = "clip_norm", default_value = "1")]
    pub clip_norm: f32,
    #[structopt(long = "loss_fn", parse(from_os_str))]
    pub loss_fn: Option<PathBuf>,
    #[structopt(long = "loss_fn_name")]
    pub loss_fn_name: Option<String>,
    #[structopt(long = "metric")]
    pub metric: Option<String>,
}

impl Cifar10Opt {
    /// Copy the options into `config`.
    ///
    /// `config.num_clients` must already hold the number of client ranks: it names the
    /// output directory and is the concentration of the client sizes.
    pub fn apply(&self, config: &mut Config) {
        config.device = self.device;
        config.dataset = self.dataset.clone();
        config.train_data_batch_size = self.train_data_batch_size;
        config.train_data_shuffle = true;
        config.test_data_batch_size = self.test_data_batch_size;
        config.validation = self.do_validation;
        config.reproduce = true;
        config.num_epochs = self.num_epochs;
        config.partition.alpha1 = config.num_clients as f64;
        config.output_dirname = format!(
            "./outputs_{}_{}_{}clients_{}_{}epochs_grpc",
            self.dataset, self.partition, config.num_clients, self.server, self.num_epochs
        );

        config.fed.clientname = if self.local_train_pattern == "epochs" {
            ClientAlgorithm::ClientOptim
        } else {
            ClientAlgorithm::ClientStepOptim
        };
        config.fed.servername = self.server;
        let args = &mut config.fed.args;
        args.optim = self.client_optimizer;
        args.optim_args.lr = self.client_lr;
        args.num_local_steps = self.num_local_steps;
        args.num_local_epochs = self.num_local_epochs;
        args.server_learning_rate = self.server_lr;
        args.server_momentum_param_1 = self.mparam_1;
        args.server_momentum_param_2 = self.mparam_2;
        args.server_adapt_param = self.adapt_param;
        args.use_dp = self.use_dp;
        args.epsilon = self.epsilon;
        args.clip_grad = self.clip_grad;
        args.clip_value = self.clip_value;
        args.clip_norm = self.clip_norm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_celeba_defaults() {
        let opt = CelebaOpt::from_iter(&["celeba"]);
        assert_eq!(opt.common.data_dir, PathBuf::from("datasets/RawData"));
        assert_eq!(opt.common.config, None);
        assert_eq!(opt.device, Device::Cpu);
        assert_eq!(opt.dataset, "CELEBA");
        assert_eq!((opt.num_channel, opt.num_classes, opt.num_pixel), (3, 2, 218));
        assert_eq!(opt.model, "CNN");
        assert_eq!(opt.num_clients, 1);
        assert_eq!(opt.client_optimizer, Optimizer::Adam);
        assert!((opt.client_lr - 1e-3).abs() < f32::EPSILON);
        assert_eq!(opt.num_local_epochs, 1);
        assert_eq!(opt.server, ServerAlgorithm::ServerFedAvg);
        assert_eq!(opt.num_epochs, 2);
        assert_eq!(opt.server_lr, None);
        assert_eq!(opt.pretrained, 0);
    }

    #[test]
    fn test_celeba_apply() {
        let opt = CelebaOpt::from_iter(&[
            "celeba",
            "--server",
            "ServerFedAdam",
            "--server_lr",
            "0.1",
            "--num_epochs",
            "5",
            "--pretrained",
            "1",
        ]);
        let mut config = Config::default();
        opt.apply(&mut config);
        assert_eq!(config.dataset, "CELEBA");
        assert_eq!(config.num_epochs, 5);
        assert!(config.record_metrics);
        assert!(config.load_model);
        assert_eq!(config.fed.servername, ServerAlgorithm::ServerFedAdam);
        assert_eq!(config.fed.args.optim, Optimizer::Adam);
        assert!((config.fed.args.server_learning_rate - 0.1).abs() < f32::EPSILON);
        // not given, so left at the defaults
        assert!((config.fed.args.server_momentum_param_1 - 0.9).abs() < f32::EPSILON);
        assert!((config.fed.args.server_adapt_param - 0.001).abs() < f32::EPSILON);
    }

    #[test]
    fn test_cifar10_defaults() {
        let opt = Cifar10Opt::from_iter(&["cifar10-grpc"]);
        assert_eq!(opt.dataset, "CIFAR10");
        assert_eq!((opt.num_channel, opt.num_classes, opt.num_pixel), (3, 10, 32));
        assert_eq!(opt.model, "CNN");
        assert_eq!(opt.train_data_batch_size, 128);
        assert_eq!(opt.test_data_batch_size, 128);
        assert_eq!(opt.partition, Partition::Iid);
        assert_eq!(opt.seed, 42);
        assert_eq!(opt.local_train_pattern, "steps");
        assert_eq!(opt.num_local_steps, 10);
        assert!(!opt.do_validation);
        assert_eq!(opt.num_epochs, 1);
        assert!(!opt.use_dp && !opt.clip_grad);
        assert!((opt.epsilon - 1.0).abs() < f32::EPSILON);
        assert!((opt.clip_norm - 1.0).abs() < f32::EPSILON);
        assert_eq!(opt.loss_fn, None);
        assert_eq!(opt.loss_fn_name, None);
        assert_eq!(opt.metric, None);
    }

    #[test]
    fn test_cifar10_apply() {
        let opt = Cifar10Opt::from_iter(&[
            "cifar10-grpc",
            "--partition",
            "dirichlet_noiid",
            "--local_train_pattern",
            "epochs",
            "--do_validation",
            "--use_dp",
            "--epsilon",
            "2",
            "--num_epochs",
            "3",
        ]);
        let mut config = Config::default();
        config.num_clients = 4;
        opt.apply(&mut config);
        assert_eq!(
            config.output_dirname,
            "./outputs_CIFAR10_dirichlet_noiid_4clients_ServerFedAvg_3epochs_grpc"
        );
        assert_eq!(config.fed.clientname, ClientAlgorithm::ClientOptim);
        assert!(config.validation);
        assert!(config.train_data_shuffle);
        assert!(config.fed.args.use_dp);
        assert!((config.fed.args.epsilon - 2.0).abs() < f32::EPSILON);
        assert!((config.partition.alpha1 - 4.0).abs() < f64::EPSILON);
        assert_eq!(config.train_data_batch_size, 128);
    }

    #[test]
    fn test_cifar10_rejects_unknown_partition() {
        assert!(Cifar10Opt::from_iter_safe(&["cifar10-grpc", "--partition", "shards"]).is_err());
    }
}
