// src/main.rs
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use rand::SeedableRng;

use thred::data_loader::DialogueLoader;
use thred::hparams::HParams;
use thred::training::DialogueTrainer;
use thred::vocab::Vocab;

/// Train a hierarchical encoder-decoder on multi-turn dialogues.
#[derive(Parser, Debug)]
#[command(name = "thred", version)]
struct Args {
    /// CSV of dialogues, one utterance per column
    #[arg(long)]
    data: PathBuf,

    /// Hyper-parameter JSON; defaults are used for missing fields
    #[arg(long)]
    hparams: Option<PathBuf>,

    /// Checkpoint and vocabulary directory
    #[arg(long, default_value = "thred_model")]
    out_dir: PathBuf,

    /// Vocabulary file (one token per line); fitted on the data when absent
    #[arg(long)]
    vocab: Option<PathBuf>,

    #[arg(long, default_value_t = 20_000)]
    max_vocab_size: usize,

    #[arg(long, default_value_t = 10)]
    epochs: usize,

    #[arg(long, default_value_t = 0.9)]
    train_ratio: f64,

    /// Utterances longer than this many words are skipped
    #[arg(long, default_value_t = 50)]
    max_len: usize,

    /// Dev dialogues decoded after every epoch
    #[arg(long, default_value_t = 5)]
    num_samples: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// The CSV has no header row
    #[arg(long)]
    no_headers: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("thred=info")),
        )
        .init();

    let args = Args::parse();
    tracing::info!("# cpu cores: {}", num_cpus::get());

    let mut hparams = match &args.hparams {
        Some(path) => HParams::load(path)?,
        None => HParams::default(),
    };

    let mut loader = DialogueLoader::new(&args.data, hparams.num_turns, args.max_len, !args.no_headers)?;
    let mut rng = rand::rngs::StdRng::seed_from_u64(args.seed);
    loader.shuffle(&mut rng);

    std::fs::create_dir_all(&args.out_dir)?;
    let vocab = match args.vocab.as_ref().or(hparams.vocab_file.as_ref()) {
        Some(path) => Vocab::load(path)?,
        None => {
            let vocab = Vocab::fit_from_texts(loader.texts(), args.max_vocab_size);
            let path = args.out_dir.join("vocab.txt");
            vocab.save(&path)?;
            hparams.vocab_file = Some(path);
            vocab
        }
    };
    hparams.vocab_size = vocab.size();
    tracing::info!("# vocabulary size {}", vocab.size());

    let (mut train, dev) = loader.train_dev_split(args.train_ratio);
    tracing::info!("# {} train / {} dev dialogues", train.len(), dev.len());

    let mut trainer = DialogueTrainer::new(&hparams, vocab, &args.out_dir, args.max_len)?;
    trainer.run(&mut train, &dev, args.epochs, args.num_samples, &mut rng)?;
    Ok(())
}
