//! ppi3d CLI: train a protein interface predictor, then test it, or test a
//! previously trained run.

mod run;

use clap::Parser;
use figment::Figment;
use figment::providers::Serialized;
use ppi3d_ml::RunConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Train and evaluate a 3D-CNN protein interface predictor
#[derive(Parser, Debug)]
#[command(name = "ppi3d", version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sharded training store (`prefix@N`)
    #[arg(long)]
    train_sharded: Option<PathBuf>,
    #[arg(long)]
    val_sharded: Option<PathBuf>,
    #[arg(long)]
    test_sharded: Option<PathBuf>,
    /// Root under which a run directory is allocated
    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long)]
    max_num_ensembles_train: Option<u64>,
    #[arg(long)]
    max_num_ensembles_val: Option<u64>,
    #[arg(long)]
    max_num_ensembles_test: Option<u64>,

    #[arg(long)]
    learning_rate: Option<f64>,
    #[arg(long)]
    conv_drop_rate: Option<f32>,
    #[arg(long)]
    fc_drop_rate: Option<f32>,
    #[arg(long)]
    top_nn_drop_rate: Option<f32>,
    #[arg(long)]
    no_dropout: bool,

    #[arg(long)]
    num_epochs: Option<usize>,
    #[arg(long)]
    repeat_gen: Option<u64>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    shuffle: bool,
    #[arg(long)]
    random_seed: Option<u64>,

    #[arg(long, allow_negative_numbers = true)]
    max_pos_regions_per_ensemble: Option<i64>,
    #[arg(long, allow_negative_numbers = true)]
    max_pos_regions_per_ensemble_testing: Option<i64>,
    #[arg(long, allow_negative_numbers = true)]
    neg_to_pos_ratio: Option<i64>,
    #[arg(long, allow_negative_numbers = true)]
    neg_to_pos_ratio_testing: Option<i64>,

    /// Test with the lowest-validation-loss checkpoint
    #[arg(long)]
    use_best: bool,
    /// Stop once validation loss fails to improve on the previous epoch
    #[arg(long)]
    early_stopping: bool,
    /// Keep a checkpoint of every epoch
    #[arg(long)]
    save_all_ckpts: bool,

    /// Skip training and test the checkpoint recorded in --model-dir
    #[arg(long)]
    test_only: bool,
    /// Evaluate every region of the test split
    #[arg(long)]
    full_test: bool,
    #[arg(long)]
    model_dir: Option<PathBuf>,
    /// Restrict testing to these shard numbers
    #[arg(long, num_args = 0..)]
    use_shard_nums: Option<Vec<usize>>,

    /// Debug-level logging
    #[arg(long)]
    debug: bool,
    /// Write into <output-dir>/None instead of a fresh numbered directory
    #[arg(long)]
    unobserved: bool,
    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    /// Layer every flag given on the command line over `figment`.
    fn merge_overrides(&self, mut figment: Figment) -> Figment {
        fn set<T: serde::Serialize>(figment: Figment, key: &str, value: T) -> Figment {
            figment.merge(Serialized::default(key, value))
        }

        let paths = [
            ("train_sharded", &self.train_sharded),
            ("val_sharded", &self.val_sharded),
            ("test_sharded", &self.test_sharded),
            ("output_dir", &self.output_dir),
            ("model_dir", &self.model_dir),
        ];
        for (key, value) in paths {
            if let Some(path) = value {
                figment = set(figment, key, path);
            }
        }

        let ensembles = [
            ("sample.max_num_ensembles.train", self.max_num_ensembles_train),
            ("sample.max_num_ensembles.val", self.max_num_ensembles_val),
            ("sample.max_num_ensembles.test", self.max_num_ensembles_test),
            ("sample.repeat_gen", self.repeat_gen),
            ("random_seed", self.random_seed),
        ];
        for (key, value) in ensembles {
            if let Some(v) = value {
                figment = set(figment, key, v);
            }
        }

        let policy = [
            (
                "sample.training.max_pos_regions_per_ensemble",
                self.max_pos_regions_per_ensemble,
            ),
            (
                "sample.testing.max_pos_regions_per_ensemble",
                self.max_pos_regions_per_ensemble_testing,
            ),
            ("sample.training.neg_to_pos_ratio", self.neg_to_pos_ratio),
            ("sample.testing.neg_to_pos_ratio", self.neg_to_pos_ratio_testing),
        ];
        for (key, value) in policy {
            if let Some(v) = value {
                figment = set(figment, key, v);
            }
        }

        let rates = [
            ("model.conv_drop_rate", self.conv_drop_rate),
            ("model.fc_drop_rate", self.fc_drop_rate),
            ("model.top_nn_drop_rate", self.top_nn_drop_rate),
        ];
        for (key, value) in rates {
            if let Some(v) = value {
                figment = set(figment, key, v);
            }
        }
        if let Some(lr) = self.learning_rate {
            figment = set(figment, "model.learning_rate", lr);
        }
        if let Some(n) = self.num_epochs {
            figment = set(figment, "num_epochs", n);
        }
        if let Some(n) = self.batch_size {
            figment = set(figment, "batch_size", n);
        }
        if let Some(nums) = &self.use_shard_nums {
            figment = set(figment, "use_shard_nums", nums);
        }

        let switches = [
            ("model.no_dropout", self.no_dropout),
            ("shuffle", self.shuffle),
            ("use_best", self.use_best),
            ("early_stopping", self.early_stopping),
            ("save_all_ckpts", self.save_all_ckpts),
            ("test_only", self.test_only),
            ("sample.full_test", self.full_test),
            ("debug", self.debug),
            ("unobserved", self.unobserved),
        ];
        for (key, on) in switches {
            if on {
                figment = set(figment, key, true);
            }
        }
        figment
    }

    fn load_config(&self) -> anyhow::Result<RunConfig> {
        let figment = self.merge_overrides(RunConfig::figment(self.config.as_deref()));
        Ok(RunConfig::from_figment(&figment)?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = cli.load_config()?;
    let output_dir = run::allocate_output_dir(&config)?;

    // Human-readable stderr + JSON file in the run directory
    let filter = if cli.quiet {
        "error"
    } else if config.debug {
        "debug"
    } else {
        "info"
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));
    let file_appender = tracing_appender::rolling::never(&output_dir, "ppi3d.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));
    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    tracing::info!("Running 3D CNN PPI training...");
    tracing::info!(dir = %output_dir.display(), "Using output directory {}", output_dir.display());
    tracing::info!("\n{}\n", serde_json::to_string_pretty(&config)?);
    config.persist(&output_dir)?;

    let stop = Arc::new(AtomicBool::new(false));
    let signal_flag = Arc::clone(&stop);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current epoch");
            signal_flag.store(true, Ordering::SeqCst);
        }
    });

    tokio::task::spawn_blocking(move || run::execute(&config, &output_dir, stop)).await?
}
