use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use candle_nn::Optimizer;
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};

use curve_common::{
    gaussian_blobs, AnyDataset, CurveKind, DataLoader, DeviceSpec, LabeledDataset, ModelConfig,
};
use curve_core::{CurveMlp, Mlp, Model};
use curve_train::{
    adjust_learning_rate, cyclic_learning_rate, evaluate_curve, is_snapshot_epoch, l2_regularizer,
    load_checkpoint, predictions, save_checkpoint, train, update_bn, CheckpointPayload,
    CrossEntropy, CurvePoint, EpochReport, FgeEnsemble, LrPolicy, LrSchedule, ParamsSgd, Regularizer, Sgd,
    Trainer, TrainerConfig,
};

#[derive(Parser, Debug)]
#[command(name = "curvefit", about = "Train and evaluate mode-connecting curves")]
struct Cli {
    /// Compute device: cpu, auto, cuda[:N], metal[:N].
    #[arg(long, global = true, default_value = "cpu")]
    device: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a synthetic Gaussian-blob dataset in the binary CVD1 format.
    MakeData(MakeDataArgs),
    /// Train an endpoint network, or a curve between two endpoints.
    Train(TrainArgs),
    /// Recalibrate and evaluate a trained curve along `t ∈ [0, 1]`.
    EvalCurve(EvalCurveArgs),
    /// Fast geometric ensembling from a trained endpoint.
    Fge(FgeArgs),
}

// ── Make-data ──────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct MakeDataArgs {
    #[arg(long)]
    output: PathBuf,
    #[arg(long, default_value_t = 1000)]
    samples: usize,
    #[arg(long, default_value_t = 2)]
    dim: usize,
    #[arg(long, default_value_t = 2)]
    classes: usize,
    /// Distance of the cluster centres from the origin.
    #[arg(long, default_value_t = 2.0)]
    spread: f64,
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

// ── Train ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TrainArgs {
    /// Model config (JSON). Created with defaults if missing.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Training data (.cvd binary or .csv).
    #[arg(long)]
    data: PathBuf,
    #[arg(long)]
    test_data: Option<PathBuf>,
    #[arg(long, default_value = "runs")]
    output_dir: PathBuf,
    #[arg(long, default_value_t = 128)]
    batch_size: usize,
    #[arg(long, default_value_t = 200)]
    epochs: usize,
    #[arg(long, default_value_t = 0.05)]
    lr: f64,
    #[arg(long, default_value_t = 0.9)]
    momentum: f64,
    #[arg(long, default_value_t = 1e-4)]
    weight_decay: f64,
    #[arg(long, default_value_t = 0.0)]
    label_smoothing: f64,
    #[arg(long, value_enum, default_value_t = PolicyArg::Step)]
    lr_policy: PolicyArg,
    #[arg(long, default_value_t = 4)]
    cycle: usize,
    #[arg(long, default_value_t = 0.05)]
    lr_1: f64,
    #[arg(long, default_value_t = 0.0001)]
    lr_2: f64,
    #[arg(long, default_value_t = 50)]
    save_every: usize,
    #[arg(long, default_value_t = 1)]
    eval_every: usize,
    /// Train a curve of this kind instead of a single network.
    #[arg(long)]
    curve: Option<CurveKind>,
    #[arg(long)]
    num_bends: Option<usize>,
    /// Endpoint checkpoint for the first bend.
    #[arg(long)]
    init_start: Option<PathBuf>,
    /// Endpoint checkpoint for the last bend.
    #[arg(long)]
    init_end: Option<PathBuf>,
    /// Place interior bends on the segment between the endpoints.
    #[arg(long)]
    init_linear: bool,
    /// Let the first bend train.
    #[arg(long)]
    free_start: bool,
    /// Let the last bend train.
    #[arg(long)]
    free_end: bool,
    #[arg(long)]
    resume: Option<PathBuf>,
    #[arg(long, default_value_t = 1)]
    seed: u64,
}

/// Learning-rate policy names accepted on the command line.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum PolicyArg {
    /// Per-epoch step decay from `--lr`.
    Step,
    /// Per-batch triangular wave between `--lr-1` and `--lr-2`.
    Cyclic,
}

// ── Eval-curve ─────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct EvalCurveArgs {
    #[arg(long)]
    checkpoint: PathBuf,
    /// Defaults to `config.json` next to the checkpoint.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    data: PathBuf,
    #[arg(long)]
    test_data: PathBuf,
    #[arg(long, default_value_t = 61)]
    num_points: usize,
    #[arg(long, default_value_t = 128)]
    batch_size: usize,
    #[arg(long, default_value_t = 1e-4)]
    weight_decay: f64,
    /// Writes `<output>.json` and `<output>.csv`.
    #[arg(long, default_value = "curve")]
    output: PathBuf,
}

// ── FGE ────────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct FgeArgs {
    /// Endpoint checkpoint to start from.
    #[arg(long)]
    checkpoint: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    data: PathBuf,
    #[arg(long)]
    test_data: PathBuf,
    #[arg(long, default_value = "fge")]
    output_dir: PathBuf,
    #[arg(long, default_value_t = 128)]
    batch_size: usize,
    #[arg(long, default_value_t = 20)]
    epochs: usize,
    #[arg(long, default_value_t = 4)]
    cycle: usize,
    #[arg(long, default_value_t = 0.05)]
    lr_1: f64,
    #[arg(long, default_value_t = 0.0001)]
    lr_2: f64,
    #[arg(long, default_value_t = 0.9)]
    momentum: f64,
    #[arg(long, default_value_t = 5e-4)]
    weight_decay: f64,
    #[arg(long, default_value_t = 1)]
    seed: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let device = DeviceSpec::parse(&cli.device)?.resolve()?;
    match cli.command {
        Command::MakeData(args) => cmd_make_data(args),
        Command::Train(args) => cmd_train(args, &device),
        Command::EvalCurve(args) => cmd_eval_curve(args, &device),
        Command::Fge(args) => cmd_fge(args, &device),
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────────

fn open_dataset(path: &Path) -> Result<AnyDataset> {
    let ds = AnyDataset::open(path).with_context(|| format!("open dataset {}", path.display()))?;
    eprintln!(
        "Loaded {}: {} samples × {} features",
        path.display(),
        ds.num_samples(),
        ds.feature_dim()
    );
    Ok(ds)
}

fn progress(len: usize, unit: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!("[{{elapsed_precise}}] {{bar:40}} {{pos}}/{{len}} {unit} {{msg}}"))?
            .progress_chars("=>-"),
    );
    Ok(pb)
}

fn config_for(checkpoint: &Path, explicit: Option<&PathBuf>) -> Result<ModelConfig> {
    let path = match explicit {
        Some(p) => p.clone(),
        None => checkpoint
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("config.json"),
    };
    ModelConfig::load(&path).with_context(|| format!("load model config {}", path.display()))
}

/// An endpoint network with the weights of a saved checkpoint.
fn load_endpoint(config: &ModelConfig, path: &Path, device: &Device) -> Result<Mlp> {
    let mut model = Mlp::new(&config.endpoint(), device)?;
    let ckpt = load_checkpoint(path, device)?;
    model.load_state_dict(&ckpt.group("model"))?;
    Ok(model)
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_make_data(args: MakeDataArgs) -> Result<()> {
    let ds = gaussian_blobs(args.samples, args.dim, args.classes, args.spread, args.seed)?;
    ds.write(&args.output)?;
    eprintln!(
        "Wrote {} samples ({} classes, dim {}) to {}",
        args.samples,
        args.classes,
        args.dim,
        args.output.display()
    );
    Ok(())
}

fn cmd_train(args: TrainArgs, device: &Device) -> Result<()> {
    let train_ds = open_dataset(&args.data)?;
    let test_ds = args.test_data.as_deref().map(open_dataset).transpose()?;

    let mut model_config = if args.config.exists() {
        ModelConfig::load(&args.config)?
    } else {
        let default = ModelConfig {
            input_dim: train_ds.feature_dim(),
            num_classes: train_ds.num_classes().max(2),
            ..Default::default()
        };
        default.save(&args.config)?;
        eprintln!("Created default config at {}", args.config.display());
        default
    };
    if let Some(kind) = args.curve {
        model_config.curve = Some(kind);
    }
    if let Some(n) = args.num_bends {
        model_config.num_bends = n;
    }
    model_config.fix_start = !args.free_start;
    model_config.fix_end = !args.free_end;
    model_config.validate()?;

    let policy = match args.lr_policy {
        PolicyArg::Step => LrPolicy::StepDecay,
        PolicyArg::Cyclic => LrPolicy::Cyclic {
            cycle: args.cycle,
            lr_1: args.lr_1,
            lr_2: args.lr_2,
        },
    };
    let is_curve = model_config.curve.is_some();
    let trainer_config = TrainerConfig {
        epochs: args.epochs,
        lr: args.lr,
        momentum: args.momentum,
        weight_decay: args.weight_decay,
        l2_penalty: is_curve,
        label_smoothing: args.label_smoothing,
        policy,
        eval_every: args.eval_every,
        save_every: args.save_every,
        eval_t: is_curve.then_some(0.5),
        output_dir: args.output_dir.clone(),
        checkpoint_name: "checkpoint".to_string(),
    };

    let train_loader = DataLoader::new(&train_ds, args.batch_size, device).shuffle(args.seed);
    let test_loader = test_ds
        .as_ref()
        .map(|ds| DataLoader::new(ds, args.batch_size, device));

    if is_curve {
        let mut curve = CurveMlp::new(&model_config, device)?;
        let last = model_config.num_bends - 1;
        for (path, bend) in [(&args.init_start, 0), (&args.init_end, last)] {
            if let Some(path) = path {
                let base = load_endpoint(&model_config, path, device)?;
                curve.import_endpoint(&base, bend)?;
                eprintln!("Bend {bend} initialised from {}", path.display());
            }
        }
        if args.init_linear {
            curve.init_linear()?;
        }
        let trainer = Trainer::new(curve, model_config, trainer_config, device)?;
        run_training(trainer, &train_loader, test_loader.as_ref(), args.resume.as_deref())
    } else {
        let model = Mlp::new(&model_config, device)?;
        let trainer = Trainer::new(model, model_config, trainer_config, device)?;
        run_training(trainer, &train_loader, test_loader.as_ref(), args.resume.as_deref())
    }
}

fn run_training<M: Model>(
    mut trainer: Trainer<M>,
    train_loader: &DataLoader<'_, AnyDataset>,
    test_loader: Option<&DataLoader<'_, AnyDataset>>,
    resume: Option<&Path>,
) -> Result<()> {
    if let Some(path) = resume {
        trainer.resume(path)?;
    }
    let pb = progress(trainer.config.epochs, "epochs")?;
    pb.set_position(trainer.epoch as u64);
    let reports = trainer.fit(train_loader, test_loader, &mut |r: &EpochReport| {
        let msg = match r.test {
            Some(t) => format!("loss {:.4} test acc {:.2}", r.train.loss, t.accuracy),
            None => format!("loss {:.4} acc {:.2}", r.train.loss, r.train.accuracy),
        };
        pb.set_message(msg);
        pb.inc(1);
    })?;
    pb.finish_with_message("done");

    std::fs::create_dir_all(&trainer.config.output_dir)?;
    let history = trainer.config.output_dir.join("history.json");
    std::fs::write(&history, serde_json::to_string_pretty(&reports)?)?;
    eprintln!("Training done. History in {}", history.display());
    Ok(())
}

fn cmd_eval_curve(args: EvalCurveArgs, device: &Device) -> Result<()> {
    let model_config = config_for(&args.checkpoint, args.config.as_ref())?;
    if model_config.curve.is_none() {
        anyhow::bail!("{} is not a curve checkpoint", args.checkpoint.display());
    }
    let mut curve = CurveMlp::new(&model_config, device)?;
    let ckpt = load_checkpoint(&args.checkpoint, device)?;
    curve.load_state_dict(&ckpt.group("model"))?;

    let train_ds = open_dataset(&args.data)?;
    let test_ds = open_dataset(&args.test_data)?;
    let train_loader = DataLoader::new(&train_ds, args.batch_size, device);
    let test_loader = DataLoader::new(&test_ds, args.batch_size, device);

    let regularizer = l2_regularizer(args.weight_decay);
    let pb = progress(args.num_points, "points")?;
    let evaluation = evaluate_curve(
        &mut curve,
        &train_loader,
        &test_loader,
        &CrossEntropy::new(),
        Some(&regularizer as &dyn Regularizer),
        args.num_points,
        device,
        &mut |p: &CurvePoint| {
            pb.set_message(format!("t={:.2} test err {:.2}", p.t, p.test_error));
            pb.inc(1);
        },
    )?;
    pb.finish_with_message("done");

    let json = args.output.with_extension("json");
    let csv = args.output.with_extension("csv");
    std::fs::write(&json, serde_json::to_string_pretty(&evaluation)?)?;
    std::fs::write(&csv, evaluation.to_csv())?;
    for (name, s) in &evaluation.summary {
        println!(
            "{name:>12}  min {:>9.4}  max {:>9.4}  mean {:>9.4}  int {:>9.4}",
            s.min, s.max, s.mean, s.integral
        );
    }
    eprintln!("Wrote {} and {}", json.display(), csv.display());
    Ok(())
}

fn cmd_fge(args: FgeArgs, device: &Device) -> Result<()> {
    let model_config = config_for(&args.checkpoint, args.config.as_ref())?;
    let mut model = load_endpoint(&model_config, &args.checkpoint, device)?;

    let train_ds = open_dataset(&args.data)?;
    let test_ds = open_dataset(&args.test_data)?;
    let train_loader = DataLoader::new(&train_ds, args.batch_size, device).shuffle(args.seed);
    let test_loader = DataLoader::new(&test_ds, args.batch_size, device);

    let mut optimizer = Sgd::new(
        model.parameters()?,
        ParamsSgd {
            lr: args.lr_1,
            momentum: args.momentum,
            weight_decay: args.weight_decay,
        },
    )?;
    let criterion = CrossEntropy::new();
    let mut ensemble = FgeEnsemble::new();

    let pb = progress(args.epochs, "epochs")?;
    for epoch in 0..args.epochs {
        let schedule = cyclic_learning_rate(epoch, args.cycle, args.lr_1, args.lr_2)?;
        adjust_learning_rate(&mut optimizer, schedule.lr_at(0.0));
        let metrics = train(
            &train_loader,
            &mut model,
            &mut optimizer,
            &criterion,
            None,
            Some(&schedule as &dyn LrSchedule),
            device,
        )?;
        if is_snapshot_epoch(epoch, args.cycle) {
            update_bn(&train_loader, &mut model, None, device)?;
            let (probs, targets) = predictions(&test_loader, &mut model, None, device)?;
            ensemble.add(&probs, &targets)?;
            let payload = CheckpointPayload::new()
                .tensors("model", &model.state_dict()?)
                .value("train_loss", &metrics.loss)?;
            save_checkpoint(&args.output_dir, epoch + 1, "fge", &payload)?;
            if let Some(report) = ensemble.report() {
                tracing::info!(
                    epoch,
                    members = report.members,
                    ens_acc = format!("{:.2}", report.accuracy),
                    ens_nll = format!("{:.4}", report.nll),
                    "ensemble"
                );
            }
        }
        pb.set_message(format!("loss {:.4} lr {:.5}", metrics.loss, optimizer.learning_rate()));
        pb.inc(1);
    }
    pb.finish_with_message("done");

    match ensemble.report() {
        Some(report) => {
            println!(
                "FGE: {} members, accuracy {:.2}%, nll {:.4}",
                report.members, report.accuracy, report.nll
            );
            std::fs::create_dir_all(&args.output_dir)?;
            std::fs::write(
                args.output_dir.join("ensemble.json"),
                serde_json::to_string_pretty(&report)?,
            )?;
        }
        None => eprintln!("No snapshot epochs in {} epochs with cycle {}", args.epochs, args.cycle),
    }
    Ok(())
}
