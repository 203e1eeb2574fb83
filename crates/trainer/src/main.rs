use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use log::{info, LevelFilter};

use dialogue_trainer::{
    logging, BaselineLm, ExecutionContext, JsonlSink, SequenceModel, SingleProcess, TchAdamW,
    TokenCorpus, TrainConfig, Trainer,
};

#[derive(Parser)]
#[command(about = "Train a sequence model with resumable checkpoints and early stopping")]
struct Cli {
    #[arg(short, long, default_value = "configs/training_config.yaml")]
    config: PathBuf,
    /// Pre-tokenized corpus, one sequence of ids per line.
    #[arg(short, long)]
    data: Option<String>,
    #[arg(long)]
    model_dir: Option<PathBuf>,
    #[arg(long)]
    model_name: Option<String>,
    #[arg(long)]
    max_epochs: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f64>,
    #[arg(long)]
    patience: Option<usize>,
    #[arg(long)]
    grad_accum_steps: Option<usize>,
    #[arg(long)]
    eval_every_step: Option<usize>,
    #[arg(long)]
    cuda: Option<bool>,
    #[arg(long)]
    mixed: Option<bool>,
    #[arg(long, default_value_t = LevelFilter::Info)]
    log_level: LevelFilter,
}

impl Cli {
    fn apply(&self, config: &mut TrainConfig) {
        if let Some(path) = &self.data {
            config.data.path = path.clone();
        }
        if let Some(dir) = &self.model_dir {
            config.model_dir = dir.clone();
        }
        if let Some(name) = &self.model_name {
            config.model_name = name.clone();
        }
        if let Some(v) = self.max_epochs {
            config.max_epochs = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.learning_rate {
            config.learning_rate = v;
        }
        if let Some(v) = self.patience {
            config.patience = v;
        }
        if let Some(v) = self.grad_accum_steps {
            config.grad_accum_steps = v;
        }
        if let Some(v) = self.eval_every_step {
            config.eval_every_step = v;
        }
        if let Some(v) = self.cuda {
            config.cuda = v;
        }
        if let Some(v) = self.mixed {
            config.mixed = v;
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = TrainConfig::load_or_default(&cli.config)?;
    cli.apply(&mut config);
    config.validate()?;

    if config.distributed_context().is_distributed() {
        bail!(
            "num_devices = {} needs a collective transport; \
             embed the library and pass one to Trainer::new",
            config.num_devices
        );
    }

    let run_dir = config.run_dir();
    let log_path = logging::init(&run_dir, cli.log_level)?;
    info!("Logging to {}", log_path.display());

    let ctx = ExecutionContext::from_config(&config);
    info!("Using device: {:?} ({:?} precision)", ctx.device, ctx.precision);

    let corpus = TokenCorpus::from_file(
        &config.data.path,
        config.data.context_length,
        config.ignore_idx,
    )?;
    let vocab_size = corpus.vocab_size();
    info!("Loaded {} windows from {} (vocab {vocab_size})", corpus.len(), config.data.path);
    let splits = corpus.into_splits(&config.data, config.batch_size, ctx.distributed, ctx.device)?;

    let model = BaselineLm::new(ctx.device, vocab_size, &config.model);
    let optimizer = TchAdamW::new(model.var_store(), config.learning_rate, config.weight_decay)?;
    let sink = JsonlSink::create(run_dir.join("scalars.jsonl"), config.scalar_flush_every)?;

    let mut trainer = Trainer::new(
        config,
        model,
        optimizer,
        ctx,
        Arc::new(SingleProcess),
        Box::new(sink),
    )?;
    let summary = trainer.run(&splits)?;

    info!(
        "Training complete: {} epoch(s), step {}, best val loss {:.4}, test loss {:.4}, {} skipped",
        summary.epochs_run,
        summary.state.step,
        summary.state.best_val_loss,
        summary.test_loss,
        summary.state.skip_counter
    );

    Ok(())
}
