//! rolerev-rs CLI: role-reversal surprisal analysis

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rolerev_rs::config::{AttentionConfig, EffectsConfig, ProbeConfig, ScoringConfig};
use rolerev_rs::experiment::{
    run_attention, run_effects, run_probe, run_reversal, score_cloze_surprisal,
    score_target_surprisal_with, write_json_atomic, ProbeInput, ScoringReport,
};
use rolerev_rs::{
    ClozeSpan, LookupScorer, ModelFamily, RecordingScorer, RoleModel, StimulusTable, TargetMatch,
    TokenScorer,
};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "rolerev-rs")]
#[command(about = "Role-reversal surprisal, probing and attention analysis for language models")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Add a `{model}_surprisal` column with target-word surprisal
    Score {
        /// Stimulus CSV (needs `sentence` and `target`)
        #[arg(short, long)]
        data: PathBuf,
        /// Where to write the enriched table (default: overwrite --data)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Score only the first contiguous occurrence of the target phrase
        #[arg(long)]
        contiguous_target: bool,
        #[command(flatten)]
        scorer: ScorerArgs,
    },
    /// Add a `{model}_surprisal` column with cloze completion surprisal
    Cloze {
        /// Stimulus CSV (needs `context` and the cloze column)
        #[arg(short, long)]
        data: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Column holding the completion substituted for [MASK]
        #[arg(long, default_value = "tgt_cloze")]
        cloze_column: String,
        /// Words scored (default: derived from the model family)
        #[arg(long, value_enum)]
        span: Option<SpanArg>,
        #[command(flatten)]
        scorer: ScorerArgs,
    },
    /// Reversal and comparison contrasts over a directory of scored files
    Effects {
        #[arg(long, default_value = "data/surprisal_results")]
        results_dir: PathBuf,
        /// Stimulus configuration JSON
        #[arg(short, long, default_value = "data/stimulus_config.json")]
        config: PathBuf,
        /// Only process files ending with this suffix
        #[arg(long, default_value = "_clean.csv")]
        suffix: String,
        #[arg(short, long, default_value = "data/surprisal_results/surprisal_effects.csv")]
        output: PathBuf,
    },
    /// Canonical vs reversed effects for `N-a` / `N-b` items
    Reversal {
        #[arg(short, long)]
        data: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Cross-validated linear probe on sentence or word embeddings
    Probe {
        #[arg(short, long)]
        data: PathBuf,
        #[arg(short, long, default_value = "gpt2")]
        model: String,
        /// Two-valued column to predict
        #[arg(short, long)]
        label: String,
        /// Embed the word named in this column instead of the sentence
        #[arg(long)]
        word: Option<String>,
        /// Layers to probe (0 = embeddings); repeatable
        #[arg(long = "layer")]
        layers: Vec<usize>,
        /// Probe every layer
        #[arg(long, conflicts_with = "layers")]
        all_layers: bool,
        #[arg(long, default_value_t = 10)]
        folds: usize,
        #[arg(long, default_value_t = 500)]
        max_iterations: u64,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Results JSON
        #[arg(short, long, default_value = "outputs/probe_results.json")]
        output: PathBuf,
        #[arg(long)]
        cpu: bool,
    },
    /// Heads attending most from the target verb to agent and patient
    Attention {
        #[arg(short, long)]
        data: PathBuf,
        #[arg(short, long, default_value = "gpt2")]
        model: String,
        /// Columns defining stimulus groups; repeatable
        #[arg(long = "group-by")]
        group_by: Vec<String>,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        cpu: bool,
    },
}

#[derive(Args)]
struct ScorerArgs {
    /// Model ID from `HuggingFace` (e.g., "gpt2", "bert-base-uncased")
    #[arg(short, long, default_value = "gpt2")]
    model: String,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,

    /// Condition the first token on BOS (autoregressive models)
    #[arg(long)]
    prepend_bos: bool,

    /// Replay token scores from a JSON dump instead of loading the model
    #[arg(long)]
    scores: Option<PathBuf>,

    /// Record every token score to a JSON dump
    #[arg(long)]
    dump_scores: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum SpanArg {
    /// The completed word alone
    Word,
    /// The completed word plus the sentence-final token
    WordAndTerminal,
}

impl From<SpanArg> for ClozeSpan {
    fn from(span: SpanArg) -> Self {
        match span {
            SpanArg::Word => ClozeSpan::WordOnly,
            SpanArg::WordAndTerminal => ClozeSpan::WordAndTerminal,
        }
    }
}

/// Column name for a model: the last path segment of its ID
fn column_name(model_id: &str) -> &str {
    model_id.rsplit('/').next().unwrap_or(model_id)
}

/// Load the scorer: a recorded dump when given, otherwise the model
fn load_scorer(args: &ScorerArgs) -> Result<(Box<dyn TokenScorer>, Option<ModelFamily>)> {
    if let Some(path) = &args.scores {
        info!("Replaying token scores from {}", path.display());
        return Ok((Box::new(LookupScorer::load(path)?), None));
    }
    let config = ScoringConfig {
        model_id: args.model.clone(),
        force_cpu: args.cpu,
        prepend_bos: args.prepend_bos,
    };
    let model = RoleModel::from_config(&config)?;
    info!(
        "Model: {} layers, {} heads, {} hidden, {:?}",
        model.n_layers(),
        model.n_heads(),
        model.d_model(),
        model.family()
    );
    let family = model.family();
    Ok((Box::new(model), Some(family)))
}

fn print_report(report: &ScoringReport) {
    println!("\n=== {} ===", report.column);
    println!("Scored: {}", report.scored);
    println!("Failed: {}", report.failures.len());
    for (row, err) in &report.failures {
        println!("  row {row}: {err}");
    }
}

/// What a scoring run writes into the `{model}_surprisal` column
enum ScoreTask<'a> {
    Target(TargetMatch),
    Cloze(&'a str, Option<SpanArg>),
}

fn score_command(
    data: &Path,
    output: Option<&Path>,
    args: &ScorerArgs,
    task: ScoreTask<'_>,
) -> Result<()> {
    let mut table = StimulusTable::load(data)?;
    let (scorer, family) = load_scorer(args)?;
    let recorder = RecordingScorer::new(scorer);
    let name = column_name(&args.model);

    let report = match task {
        ScoreTask::Target(matching) => {
            score_target_surprisal_with(&mut table, &recorder, name, matching)?
        }
        ScoreTask::Cloze(cloze_column, span) => {
            let span = match (span, family) {
                (Some(span), _) => span.into(),
                (None, Some(family)) => family.cloze_span(),
                (None, None) => anyhow::bail!("--span is required when replaying --scores"),
            };
            score_cloze_surprisal(&mut table, &recorder, name, cloze_column, span)?
        }
    };

    let output = output.unwrap_or(data);
    table.save(output)?;
    info!("Saved {} to {}", report.column, output.display());
    print_report(&report);

    if let Some(dump) = &args.dump_scores {
        recorder.into_recorded().save(dump, Some(&args.model))?;
        info!("Token scores saved to {}", dump.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    println!("=== rolerev-rs: role-reversal surprisal analysis ===");

    match cli.command {
        Command::Score {
            data,
            output,
            contiguous_target,
            scorer,
        } => {
            let matching = if contiguous_target {
                TargetMatch::Contiguous
            } else {
                TargetMatch::WordSet
            };
            score_command(&data, output.as_deref(), &scorer, ScoreTask::Target(matching))?;
        }

        Command::Cloze {
            data,
            output,
            cloze_column,
            span,
            scorer,
        } => score_command(
            &data,
            output.as_deref(),
            &scorer,
            ScoreTask::Cloze(&cloze_column, span),
        )?,

        Command::Effects {
            results_dir,
            config,
            suffix,
            output,
        } => {
            let config = EffectsConfig {
                results_dir,
                config_path: config,
                file_suffix: suffix,
                output,
            };
            let report = run_effects(&config)?;

            println!("\n=== Effects ===");
            println!("Files:    {}", report.files.join(", "));
            println!("Rows:     {}", report.rows.len());
            println!("Omitted:  {}", report.omissions.len());
            for summary in &report.summary {
                println!(
                    "{:>6} {:<14} {:<28} n={:<4} mean={:+.3} t={:+.2} p={:.4}",
                    summary.expt,
                    summary.condition,
                    summary.model,
                    summary.n,
                    summary.mean,
                    summary.t,
                    summary.p_value
                );
            }
            println!("Summary:  {}", report.summary_path.display());
        }

        Command::Reversal { data, output } => {
            let (rows, omissions) = run_reversal(&data, &output)?;
            println!("\nPairs: {}, omitted: {}", rows.len(), omissions.len());
            for err in &omissions {
                println!("  {err}");
            }
        }

        Command::Probe {
            data,
            model,
            label,
            word,
            layers,
            all_layers,
            folds,
            max_iterations,
            seed,
            output,
            cpu,
        } => {
            let config = ProbeConfig {
                layers: if all_layers {
                    Vec::new()
                } else if layers.is_empty() {
                    ProbeConfig::default().layers
                } else {
                    layers
                },
                folds,
                max_iterations,
                seed,
            };
            let table = StimulusTable::load(&data)?;
            let model = RoleModel::from_pretrained_with_device(&model, Some(cpu))?;
            let input = word.map_or(ProbeInput::Sentence, ProbeInput::Word);

            let report = run_probe(&model, &table, &input, &label, &config)?;

            println!("\n=== Probe: {} ({}) ===", report.label_column, report.input);
            for layer in &report.layers {
                println!(
                    "Layer {:2}: {:.1}%",
                    layer.layer,
                    layer.results.mean_accuracy * 100.0
                );
            }
            println!(
                "\nBest: layer {} with {:.1}% accuracy",
                report.best_layer,
                report.best_accuracy * 100.0
            );

            if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            write_json_atomic(&output, &report)?;
            info!("Results saved to {}", output.display());
        }

        Command::Attention {
            data,
            model,
            group_by,
            output,
            cpu,
        } => {
            let config = if group_by.is_empty() {
                AttentionConfig::default()
            } else {
                AttentionConfig { group_by }
            };
            let mut table = StimulusTable::load(&data)?;
            let model = RoleModel::from_pretrained_with_device(&model, Some(cpu))?;

            let groups = run_attention(&model, &mut table, &config)?;
            table.save(&output)?;

            println!("\n=== Attention heads ===");
            for group in &groups {
                println!(
                    "{:<30} rows={:<4} agent={} patient={}",
                    group.group.join("/"),
                    group.rows,
                    group.agent_head,
                    group.patient_head
                );
            }
            info!("Attention table saved to {}", output.display());
        }
    }

    Ok(())
}
