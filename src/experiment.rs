//! Experiment runners for role-reversal analyses
//!
//! Each runner reads stimulus tables, drives the scorer or model, and
//! returns a report. Output files are only written once every row has been
//! processed, through a temporary file renamed into place.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::attention::{select_heads, HeadChoice, RowAttention};
use crate::config::{
    AttentionConfig, EffectsConfig, ProbeConfig, StimulusConfig, REVERSAL_LABEL,
};
use crate::effects::{
    reversal_surprisal_effect, summarize_effects, surprisal_effects, write_contrast_table,
    write_reversal_table, ContrastRow, EffectSummary, ReversalRow,
};
use crate::embeddings::{sentence_embeddings, word_embeddings};
use crate::error::{ContrastError, SurprisalError};
use crate::model::RoleModel;
use crate::probe::{CrossValidationResults, ProbeTrainer};
use crate::scorer::{prepare_text, TokenScorer};
use crate::stimuli::{model_from_column, surprisal_column, StimulusTable};
use crate::surprisal::{
    cloze_surprisal, score_value, surprisal_at_word, ClozeSpan, ItemScore, TargetMatch,
    MASK_PLACEHOLDER,
};

/// Outcome of adding one model's surprisal column to a table
#[derive(Debug)]
pub struct ScoringReport {
    pub column: String,
    pub scored: usize,
    /// `(row, error)` for every row written as the failure sentinel
    pub failures: Vec<(usize, SurprisalError)>,
}

impl ScoringReport {
    fn from_scores(column: String, scores: &[ItemScore]) -> Self {
        let failures: Vec<(usize, SurprisalError)> = scores
            .iter()
            .enumerate()
            .filter_map(|(row, s)| s.as_ref().err().map(|e| (row, e.clone())))
            .collect();
        Self {
            column,
            scored: scores.len() - failures.len(),
            failures,
        }
    }
}

fn write_scores(
    table: &mut StimulusTable,
    model_name: &str,
    scores: &[ItemScore],
) -> Result<ScoringReport> {
    let column = surprisal_column(model_name);
    let values: Vec<f64> = scores.iter().map(score_value).collect();
    table.set_numeric_column(&column, &values)?;

    let report = ScoringReport::from_scores(column, scores);
    info!(
        "{}: scored {} rows, {} failed",
        report.column,
        report.scored,
        report.failures.len()
    );
    Ok(report)
}

/// Add `{model}_surprisal` holding the target-word surprisal of every row
pub fn score_target_surprisal<S: TokenScorer + ?Sized>(
    table: &mut StimulusTable,
    scorer: &S,
    model_name: &str,
) -> Result<ScoringReport> {
    score_target_surprisal_with(table, scorer, model_name, TargetMatch::WordSet)
}

/// [`score_target_surprisal`] with an explicit target matching mode
pub fn score_target_surprisal_with<S: TokenScorer + ?Sized>(
    table: &mut StimulusTable,
    scorer: &S,
    model_name: &str,
    matching: TargetMatch,
) -> Result<ScoringReport> {
    table.require_columns(&["sentence", "target"])?;
    let sentences: Vec<String> = table
        .column("sentence")?
        .iter()
        .map(|s| prepare_text(scorer, s))
        .collect();
    let targets: Vec<String> = table
        .column("target")?
        .iter()
        .map(|t| prepare_text(scorer, t))
        .collect();

    let scores = surprisal_at_word(scorer, &sentences, &targets, matching);
    write_scores(table, model_name, &scores)
}

/// Case-fold a cloze context without touching its `[MASK]` placeholder
fn prepare_cloze_context<S: TokenScorer + ?Sized>(scorer: &S, context: &str) -> String {
    context
        .split(MASK_PLACEHOLDER)
        .map(|part| prepare_text(scorer, part))
        .collect::<Vec<_>>()
        .join(MASK_PLACEHOLDER)
}

/// Add `{model}_surprisal` holding the cloze completion surprisal of every row
pub fn score_cloze_surprisal<S: TokenScorer + ?Sized>(
    table: &mut StimulusTable,
    scorer: &S,
    model_name: &str,
    cloze_column: &str,
    span: ClozeSpan,
) -> Result<ScoringReport> {
    table.require_columns(&["context", cloze_column])?;
    let contexts = table.column("context")?;
    let completions = table.column(cloze_column)?;

    let scores: Vec<ItemScore> = contexts
        .iter()
        .zip(&completions)
        .enumerate()
        .map(|(row, (context, completion))| {
            let score = cloze_surprisal(
                scorer,
                &prepare_cloze_context(scorer, context),
                &prepare_text(scorer, completion),
                span,
            );
            if let Err(err) = &score {
                warn!("Cloze surprisal failed for row {} ('{}'): {}", row, completion, err);
            }
            score
        })
        .collect();
    write_scores(table, model_name, &scores)
}

/// Model identifiers of every surprisal column in a table
fn table_models(table: &StimulusTable) -> Vec<String> {
    table
        .surprisal_columns()
        .iter()
        .filter_map(|c| model_from_column(c).map(str::to_string))
        .collect()
}

/// Result of computing contrasts over a results directory
#[derive(Debug)]
pub struct EffectsReport {
    pub files: Vec<String>,
    pub rows: Vec<ContrastRow>,
    pub omissions: Vec<ContrastError>,
    pub summary: Vec<EffectSummary>,
    pub summary_path: PathBuf,
}

/// Summary JSON path next to the contrast table
pub fn summary_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "surprisal_effects".to_string());
    output.with_file_name(format!("{stem}_summary.json"))
}

/// Serialize to a sibling temp file, then rename it over `path`
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "results.json".to_string());
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));
    std::fs::write(&tmp_path, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to move results into {}", path.display()))?;
    Ok(())
}

/// Scored stimulus files in a directory, sorted by name
fn scored_files(dir: &Path, suffix: &str) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
    {
        let path = entry?.path();
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if path.is_file() && name.ends_with(suffix) {
            files.push((name, path));
        }
    }
    files.sort();
    Ok(files)
}

/// Reversal and comparison contrasts for every scored file in a directory.
///
/// Every file must have an entry in the stimulus config. The contrast table
/// and its summary are written only after all files have been processed.
pub fn run_effects(config: &EffectsConfig) -> Result<EffectsReport> {
    let stimulus_config = StimulusConfig::load(&config.config_path)?;
    let files = scored_files(&config.results_dir, &config.file_suffix)?;
    anyhow::ensure!(
        !files.is_empty(),
        "No files ending in '{}' under {}",
        config.file_suffix,
        config.results_dir.display()
    );

    let mut rows = Vec::new();
    let mut omissions = Vec::new();
    let mut names = Vec::with_capacity(files.len());

    for (name, path) in &files {
        let design = stimulus_config.design(name)?;
        let table = StimulusTable::load(path)?;
        let items = table.items(true)?;
        let models = table_models(&table);
        let expt = design.expt.clone().unwrap_or_else(|| {
            name.strip_suffix(config.file_suffix.as_str())
                .unwrap_or(name)
                .to_string()
        });
        info!("{}: {} rows, {} models, expt {}", name, items.len(), models.len(), expt);

        let mut contrasts = Vec::with_capacity(2);
        if let Some(reversal) = &design.reversal {
            contrasts.push(surprisal_effects(&items, &models, reversal, REVERSAL_LABEL));
        }
        contrasts.push(surprisal_effects(
            &items,
            &models,
            &design.comparison,
            &design.comparison_condition,
        ));

        for outcome in contrasts {
            rows.extend(outcome.rows.into_iter().map(|mut row| {
                row.expt = Some(expt.clone());
                row
            }));
            omissions.extend(outcome.omissions);
        }
        names.push(name.clone());
    }

    let summary = summarize_effects(&rows);
    let summary_path = summary_path(&config.output);
    write_contrast_table(&config.output, &rows)?;
    write_json_atomic(&summary_path, &summary)?;
    info!(
        "Wrote {} contrast rows ({} omitted) to {}",
        rows.len(),
        omissions.len(),
        config.output.display()
    );

    Ok(EffectsReport {
        files: names,
        rows,
        omissions,
        summary,
        summary_path,
    })
}

/// Canonical/reversed pairs of an `N-a` / `N-b` stimulus file
pub fn run_reversal(input: &Path, output: &Path) -> Result<(Vec<ReversalRow>, Vec<ContrastError>)> {
    let table = StimulusTable::load(input)?;
    table.require_columns(&["item", "target", "context", "tgt_cloze"])?;
    let items = table.items(false)?;
    let models = table_models(&table);

    let outcome = reversal_surprisal_effect(&items, &models);
    write_reversal_table(output, &outcome.rows)?;
    info!(
        "Wrote {} reversal pairs ({} omitted) to {}",
        outcome.rows.len(),
        outcome.omissions.len(),
        output.display()
    );
    Ok((outcome.rows, outcome.omissions))
}

/// What a probe embeds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeInput {
    /// Pooled sentence representation
    Sentence,
    /// Contextual embedding of the word named in this column
    Word(String),
}

/// Probe results for one layer
#[derive(Debug, Clone, Serialize)]
pub struct LayerProbe {
    pub layer: usize,
    #[serde(flatten)]
    pub results: CrossValidationResults,
}

/// Results of probing a stimulus table
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub model: String,
    pub input: String,
    pub label_column: String,
    /// `[negative, positive]` class values
    pub classes: [String; 2],
    pub layers: Vec<LayerProbe>,
    pub best_layer: usize,
    pub best_accuracy: f64,
}

/// Map a two-valued label column to booleans (`true` = the later value in sort order)
pub fn binary_labels(values: &[String]) -> Result<([String; 2], Vec<bool>)> {
    let mut classes: Vec<&String> = values.iter().collect();
    classes.sort();
    classes.dedup();
    let [negative, positive] = classes.as_slice() else {
        anyhow::bail!(
            "Probe labels must take exactly two values, found {:?}",
            classes
        );
    };
    let labels = values.iter().map(|v| v == *positive).collect();
    Ok(([(*negative).clone(), (*positive).clone()], labels))
}

/// Cross-validated probes over embeddings already grouped by layer
pub fn probe_layers(
    per_layer: &BTreeMap<usize, Vec<Vec<f32>>>,
    labels: &[bool],
    config: &ProbeConfig,
) -> Result<Vec<LayerProbe>> {
    let trainer = ProbeTrainer::new().with_max_iterations(config.max_iterations);
    per_layer
        .iter()
        .map(|(&layer, embeddings)| {
            let data: Vec<(Vec<f32>, bool)> = embeddings
                .iter()
                .cloned()
                .zip(labels.iter().copied())
                .collect();
            let results = trainer
                .cross_validate(&data, config.folds, config.seed)
                .with_context(|| format!("Probe failed at layer {layer}"))?;
            info!("Layer {:2}: {:.1}%", layer, results.mean_accuracy * 100.0);
            Ok(LayerProbe { layer, results })
        })
        .collect()
}

/// Embed every row, then probe each configured layer
pub fn run_probe(
    model: &RoleModel,
    table: &StimulusTable,
    input: &ProbeInput,
    label_column: &str,
    config: &ProbeConfig,
) -> Result<ProbeReport> {
    let mut required = vec!["sentence", label_column];
    if let ProbeInput::Word(column) = input {
        required.push(column.as_str());
    }
    table.require_columns(&required)?;

    let layers: Vec<usize> = if config.layers.is_empty() {
        (0..=model.n_layers()).collect()
    } else {
        config.layers.clone()
    };
    let (classes, labels) = binary_labels(&table.column(label_column)?)?;
    let sentences = table.column("sentence")?;
    let words = match input {
        ProbeInput::Word(column) => Some(table.column(column)?),
        ProbeInput::Sentence => None,
    };

    info!(
        "Embedding {} rows at {} layer(s) for probe on '{}'",
        sentences.len(),
        layers.len(),
        label_column
    );
    let mut per_layer: BTreeMap<usize, Vec<Vec<f32>>> = BTreeMap::new();
    for (row, sentence) in sentences.iter().enumerate() {
        let embeddings = match &words {
            Some(words) => word_embeddings(model, sentence, &words[row], &layers),
            None => sentence_embeddings(model, sentence, &layers),
        }
        .with_context(|| format!("Failed to embed row {row}"))?;
        for (&layer, embedding) in layers.iter().zip(embeddings) {
            per_layer.entry(layer).or_default().push(embedding);
        }
    }

    let results = probe_layers(&per_layer, &labels, config)?;
    let (best_layer, best_accuracy) = results
        .iter()
        .map(|r| (r.layer, r.results.mean_accuracy))
        .fold((0, 0.0), |best, cur| if cur.1 > best.1 { cur } else { best });

    Ok(ProbeReport {
        model: model.model_id().to_string(),
        input: match input {
            ProbeInput::Sentence => "sentence".to_string(),
            ProbeInput::Word(column) => column.clone(),
        },
        label_column: label_column.to_string(),
        classes,
        layers: results,
        best_layer,
        best_accuracy,
    })
}

/// Attention output columns, in the order they are appended
pub const ATTENTION_COLUMNS: [&str; 6] = [
    "max_attn_to_agent",
    "max_attn_to_patient",
    "agent_layer_head",
    "patient_layer_head",
    "agent_layer_patient_attn",
    "patient_layer_agent_attn",
];

/// Heads chosen for one stimulus group
#[derive(Debug, Clone, PartialEq)]
pub struct GroupHeads {
    pub group: Vec<String>,
    pub rows: usize,
    pub agent_head: HeadChoice,
    pub patient_head: HeadChoice,
}

/// Group rows, select heads per group, and append the attention columns
pub fn apply_head_selection(
    table: &mut StimulusTable,
    group_by: &[String],
    row_attention: &[RowAttention],
) -> Result<Vec<GroupHeads>> {
    anyhow::ensure!(
        row_attention.len() == table.len(),
        "Got attention for {} rows, table has {}",
        row_attention.len(),
        table.len()
    );
    let group_columns: Vec<&str> = group_by.iter().map(String::as_str).collect();
    table.require_columns(&group_columns)?;

    let mut order: Vec<Vec<String>> = Vec::new();
    let mut members: BTreeMap<Vec<String>, Vec<usize>> = BTreeMap::new();
    for row in 0..table.len() {
        let key: Vec<String> = group_by
            .iter()
            .map(|c| table.value(row, c).unwrap_or_default().to_string())
            .collect();
        members
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(row);
    }

    let mut columns: Vec<Vec<String>> =
        vec![vec![String::new(); table.len()]; ATTENTION_COLUMNS.len()];
    let mut groups = Vec::with_capacity(order.len());
    for key in order {
        let rows = &members[&key];
        let attention: Vec<RowAttention> = rows.iter().map(|&r| row_attention[r].clone()).collect();
        let selection = select_heads(&attention)
            .with_context(|| format!("Head selection failed for group {key:?}"))?;
        info!(
            "Group {:?}: agent head {}, patient head {}",
            key, selection.agent_head, selection.patient_head
        );

        for (&row, values) in rows.iter().zip(&selection.rows) {
            columns[0][row] = values.max_attn_to_agent.to_string();
            columns[1][row] = values.max_attn_to_patient.to_string();
            columns[2][row] = selection.agent_head.to_string();
            columns[3][row] = selection.patient_head.to_string();
            columns[4][row] = values.agent_layer_patient_attn.to_string();
            columns[5][row] = values.patient_layer_agent_attn.to_string();
        }
        groups.push(GroupHeads {
            group: key,
            rows: rows.len(),
            agent_head: selection.agent_head,
            patient_head: selection.patient_head,
        });
    }

    for (name, values) in ATTENTION_COLUMNS.iter().zip(columns) {
        table.set_column(name, values)?;
    }
    Ok(groups)
}

/// Target-to-argument attention for every row, then per-group head selection
pub fn run_attention(
    model: &RoleModel,
    table: &mut StimulusTable,
    config: &AttentionConfig,
) -> Result<Vec<GroupHeads>> {
    table.require_columns(&["sentence", "target", "agent", "patient"])?;
    let sentences = table.column("sentence")?;
    let targets = table.column("target")?;
    let agents = table.column("agent")?;
    let patients = table.column("patient")?;

    let mut row_attention = Vec::with_capacity(table.len());
    for row in 0..table.len() {
        let sentence = prepare_text(model, &sentences[row]);
        let (encoding, cache) = model
            .attention(&sentence)
            .with_context(|| format!("Attention pass failed for row {row}"))?;

        let positions =
            |word: &str| encoding.word_token_indices(&sentence, &prepare_text(model, word));
        let target = positions(&targets[row]);
        let agent = positions(&agents[row]);
        let patient = positions(&patients[row]);
        if target.is_empty() {
            warn!("Row {}: target '{}' not found in '{}'", row, targets[row], sentence);
        }

        row_attention.push(RowAttention {
            to_agent: cache.summed_attention(&target, &agent)?,
            to_patient: cache.summed_attention(&target, &patient)?,
        });
    }

    apply_head_selection(table, &config.group_by, &row_attention)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scorer::LookupScorer;

    fn table() -> StimulusTable {
        StimulusTable::new(
            "WY_clean.csv",
            vec![
                "item".into(),
                "condition".into(),
                "sentence".into(),
                "target".into(),
            ],
            vec![
                vec!["1".into(), "canonical".into(), "the dog bit the man".into(), "bit".into()],
                vec!["1".into(), "reversal".into(), "the man bit the dog".into(), "bit".into()],
                vec!["2".into(), "canonical".into(), "the cat sat".into(), "sat".into()],
            ],
        )
    }

    #[test]
    fn test_score_target_surprisal_writes_sentinel() {
        let scorer = LookupScorer::new()
            .with(
                "the dog bit the man",
                &[("the", 1.0), ("dog", 2.0), ("bit", 3.1), ("the", 0.3), ("man", 1.2)],
            )
            .with(
                "the man bit the dog",
                &[("the", 1.0), ("man", 2.0), ("bit", 5.2), ("the", 0.3), ("dog", 1.2)],
            );
        let mut table = table();
        let report = score_target_surprisal(&mut table, &scorer, "gpt2").unwrap();

        assert_eq!(report.column, "gpt2_surprisal");
        assert_eq!(report.scored, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, 2);
        assert_eq!(
            table.numeric_column("gpt2_surprisal").unwrap(),
            vec![Some(3.1), Some(5.2), Some(-1.0)]
        );
    }

    #[test]
    fn test_score_target_surprisal_requires_columns() {
        let mut table = StimulusTable::new("bad.csv", vec!["item".into()], vec![vec!["1".into()]]);
        assert!(score_target_surprisal(&mut table, &LookupScorer::new(), "gpt2").is_err());
        assert_eq!(table.headers(), ["item"]);
    }

    #[test]
    fn test_score_cloze_surprisal() {
        let scorer = LookupScorer::new().with(
            "the dog bit the man .",
            &[("the", 1.0), ("dog", 2.0), ("bit", 3.0), ("the", 0.5), ("man", 4.0), (".", 0.25)],
        );
        let mut table = StimulusTable::new(
            "cloze.csv",
            vec!["item".into(), "context".into(), "tgt_cloze".into()],
            vec![
                vec!["1-a".into(), "the dog bit the [MASK] .".into(), "man".into()],
                vec!["1-b".into(), "no placeholder here .".into(), "man".into()],
            ],
        );
        let report = score_cloze_surprisal(
            &mut table,
            &scorer,
            "gpt2",
            "tgt_cloze",
            ClozeSpan::WordAndTerminal,
        )
        .unwrap();
        assert_eq!(report.scored, 1);
        assert!(matches!(
            report.failures[0].1,
            SurprisalError::MissingPlaceholder { .. }
        ));
        assert_eq!(
            table.numeric_column("gpt2_surprisal").unwrap(),
            vec![Some(4.25), Some(-1.0)]
        );
    }

    #[test]
    fn test_contiguous_target_skips_repeated_words() {
        let scorer = LookupScorer::new().with(
            "the dog bit the man",
            &[("the", 1.0), ("dog", 2.0), ("bit", 0.5), ("the", 0.25), ("man", 1.25)],
        );
        let mut table = StimulusTable::new(
            "span.csv",
            vec!["sentence".into(), "target".into()],
            vec![vec!["the dog bit the man".into(), "the man".into()]],
        );
        score_target_surprisal_with(&mut table, &scorer, "gpt2", TargetMatch::Contiguous)
            .unwrap();
        assert_eq!(table.numeric_column("gpt2_surprisal").unwrap(), vec![Some(1.5)]);

        score_target_surprisal(&mut table, &scorer, "gpt2").unwrap();
        assert_eq!(table.numeric_column("gpt2_surprisal").unwrap(), vec![Some(2.5)]);
    }

    #[test]
    fn test_uncased_scorer_target_surprisal() {
        let scorer = LookupScorer::new().with_lowercase(true).with(
            "the dog bit the man",
            &[("the", 1.0), ("dog", 2.0), ("bit", 3.1), ("the", 0.3), ("man", 1.2)],
        );
        let mut table = StimulusTable::new(
            "uncased.csv",
            vec!["sentence".into(), "target".into()],
            vec![vec!["The Dog BIT the man".into(), "Bit".into()]],
        );
        let report = score_target_surprisal(&mut table, &scorer, "bert").unwrap();

        assert_eq!(report.scored, 1);
        assert_eq!(table.numeric_column("bert_surprisal").unwrap(), vec![Some(3.1)]);
        assert_eq!(table.value(0, "sentence"), Some("The Dog BIT the man"));
    }

    #[test]
    fn test_uncased_scorer_keeps_cloze_placeholder() {
        let scorer = LookupScorer::new().with_lowercase(true).with(
            "the dog bit the man .",
            &[("the", 1.0), ("dog", 2.0), ("bit", 3.0), ("the", 0.5), ("man", 4.0), (".", 0.25)],
        );
        let mut table = StimulusTable::new(
            "uncased_cloze.csv",
            vec!["context".into(), "tgt_cloze".into()],
            vec![vec!["The dog bit the [MASK] .".into(), "Man".into()]],
        );
        let report =
            score_cloze_surprisal(&mut table, &scorer, "bert", "tgt_cloze", ClozeSpan::WordOnly)
                .unwrap();

        assert_eq!(report.scored, 1);
        assert!(report.failures.is_empty());
        assert_eq!(table.numeric_column("bert_surprisal").unwrap(), vec![Some(4.0)]);
        assert_eq!(table.value(0, "context"), Some("The dog bit the [MASK] ."));
    }

    #[test]
    fn test_prepare_cloze_context() {
        let uncased = LookupScorer::new().with_lowercase(true);
        assert_eq!(
            prepare_cloze_context(&uncased, "The [MASK] bit The [MASK] ."),
            "the [MASK] bit the [MASK] ."
        );
        assert_eq!(
            prepare_cloze_context(&LookupScorer::new(), "The [MASK] ."),
            "The [MASK] ."
        );
    }

    #[test]
    fn test_binary_labels() {
        let values: Vec<String> = ["plausible", "implausible", "plausible"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (classes, labels) = binary_labels(&values).unwrap();
        assert_eq!(classes, ["implausible".to_string(), "plausible".to_string()]);
        assert_eq!(labels, vec![true, false, true]);

        let one: Vec<String> = vec!["a".into(), "a".into()];
        assert!(binary_labels(&one).is_err());
    }

    #[test]
    fn test_probe_layers_separable() {
        let labels: Vec<bool> = (0..20).map(|i| i % 2 == 0).collect();
        let embeddings: Vec<Vec<f32>> = labels
            .iter()
            .enumerate()
            .map(|(i, &l)| vec![if l { 2.0 } else { -2.0 }, i as f32 * 0.01])
            .collect();
        let per_layer = BTreeMap::from([(3, embeddings)]);
        let config = ProbeConfig {
            folds: 5,
            ..ProbeConfig::default()
        };
        let results = probe_layers(&per_layer, &labels, &config).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].layer, 3);
        assert_eq!(results[0].results.folds.len(), 5);
    }

    #[test]
    fn test_apply_head_selection_per_group() {
        let mut table = StimulusTable::new(
            "attn.csv",
            vec!["item".into(), "condition".into()],
            vec![
                vec!["1".into(), "reversal".into()],
                vec!["1".into(), "canonical".into()],
                vec!["2".into(), "reversal".into()],
            ],
        );
        let attn = |agent: [f64; 2], patient: [f64; 2]| RowAttention {
            to_agent: vec![agent.to_vec()],
            to_patient: vec![patient.to_vec()],
        };
        let rows = vec![
            attn([0.1, 0.6], [0.3, 0.2]),
            attn([0.9, 0.0], [0.0, 0.4]),
            attn([0.2, 0.4], [0.5, 0.1]),
        ];

        let groups =
            apply_head_selection(&mut table, &["condition".to_string()], &rows).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].group, vec!["reversal"]);
        assert_eq!(groups[0].rows, 2);
        assert_eq!(groups[0].agent_head, HeadChoice { layer: 0, head: 1 });
        assert_eq!(groups[1].agent_head, HeadChoice { layer: 0, head: 0 });

        assert_eq!(table.value(0, "agent_layer_head"), Some("(0, 1)"));
        assert_eq!(table.value(1, "agent_layer_head"), Some("(0, 0)"));
        assert_eq!(table.value(2, "max_attn_to_agent"), Some("0.4"));
        assert_eq!(table.value(0, "agent_layer_patient_attn"), Some("0.2"));
        assert_eq!(table.headers().len(), 2 + ATTENTION_COLUMNS.len());
    }

    #[test]
    fn test_summary_path() {
        assert_eq!(
            summary_path(Path::new("out/surprisal_effects.csv")),
            PathBuf::from("out/surprisal_effects_summary.json")
        );
    }
}
