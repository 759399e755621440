//! Integration tests for rolerev-rs
//!
//! Note: Tests marked with #[ignore] require model download.
//! Run them explicitly with: cargo test --ignored

use rolerev_rs::config::EffectsConfig;
use rolerev_rs::effects::effect_column;
use rolerev_rs::experiment::{
    run_effects, run_reversal, score_cloze_surprisal, score_target_surprisal,
};
use rolerev_rs::{ClozeSpan, LookupScorer, RecordingScorer, RoleModel, StimulusTable};
use std::path::Path;
use tempfile::TempDir;

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_string()).collect()
}

/// Two items, each in canonical, reversed and substituted form
fn stimulus_table() -> StimulusTable {
    StimulusTable::new(
        "EXP_clean.csv",
        strings(&["item", "condition", "sentence", "target"]),
        vec![
            strings(&["1", "canonical", "the dog bit the man", "bit"]),
            strings(&["1", "reversal", "the man bit the dog", "bit"]),
            strings(&["1", "substitution", "the dog ate the man", "ate"]),
            strings(&["2", "canonical", "the cook fed the cat", "fed"]),
            strings(&["2", "reversal", "the cat fed the cook", "fed"]),
            strings(&["2", "substitution", "the cook ate the cat", "ate"]),
        ],
    )
}

fn sentence_scores(sentence: &str, target: &str, target_bits: f64) -> Vec<(String, f64)> {
    sentence
        .split_whitespace()
        .map(|w| (w.to_string(), if w == target { target_bits } else { 0.5 }))
        .collect()
}

fn stimulus_scorer() -> LookupScorer {
    let mut scorer = LookupScorer::new();
    for (sentence, target, bits) in [
        ("the dog bit the man", "bit", 3.0),
        ("the man bit the dog", "bit", 5.0),
        ("the dog ate the man", "ate", 4.0),
        ("the cook fed the cat", "fed", 2.0),
        ("the cat fed the cook", "fed", 6.0),
        ("the cook ate the cat", "ate", 2.5),
    ] {
        scorer.insert(sentence, sentence_scores(sentence, target, bits));
    }
    scorer
}

fn write_config(path: &Path, filename: &str) {
    let config = format!(
        r#"{{
        "{filename}": {{
            "reversal": ["reversal", "canonical"],
            "comparison": ["substitution", "canonical"],
            "comparison_condition": "Substitution"
        }}
    }}"#
    );
    std::fs::write(path, config).unwrap();
}

/// Score a stimulus file, then compute its contrasts from disk
#[test]
fn test_score_then_effects() {
    let dir = TempDir::new().unwrap();
    let results = dir.path().join("results");
    std::fs::create_dir(&results).unwrap();

    let mut table = stimulus_table();
    let report = score_target_surprisal(&mut table, &stimulus_scorer(), "gpt2").unwrap();
    assert_eq!(report.scored, 6);
    assert!(report.failures.is_empty());
    table.save(&results.join("EXP_clean.csv")).unwrap();
    std::fs::write(results.join("notes.txt"), "not a stimulus file").unwrap();

    let config_path = dir.path().join("stimulus_config.json");
    write_config(&config_path, "EXP_clean.csv");

    let output = dir.path().join("surprisal_effects.csv");
    let report = run_effects(&EffectsConfig {
        results_dir: results,
        config_path,
        file_suffix: "_clean.csv".to_string(),
        output: output.clone(),
    })
    .unwrap();

    assert_eq!(report.files, vec!["EXP_clean.csv"]);
    assert_eq!(report.rows.len(), 4);
    assert!(report.omissions.is_empty());

    let reversal = report
        .summary
        .iter()
        .find(|s| s.condition == "Reversal")
        .unwrap();
    assert_eq!(reversal.expt, "EXP");
    assert_eq!(reversal.n, 2);
    assert!((reversal.mean - 3.0).abs() < 1e-9);

    let substitution = report
        .summary
        .iter()
        .find(|s| s.condition == "Substitution")
        .unwrap();
    assert!((substitution.mean - 0.75).abs() < 1e-9);

    let contrasts = StimulusTable::load(&output).unwrap();
    assert_eq!(
        contrasts.headers(),
        ["item", "condition", "expt", effect_column("gpt2").as_str()]
    );
    assert_eq!(
        contrasts.numeric_column(&effect_column("gpt2")).unwrap(),
        vec![Some(2.0), Some(4.0), Some(1.0), Some(0.5)]
    );

    let summary: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report.summary_path).unwrap()).unwrap();
    assert_eq!(summary.as_array().unwrap().len(), 2);
}

/// A scored file without a config entry aborts the run before writing
#[test]
fn test_effects_requires_config_entry() {
    let dir = TempDir::new().unwrap();
    let mut table = stimulus_table();
    score_target_surprisal(&mut table, &stimulus_scorer(), "gpt2").unwrap();
    table.save(&dir.path().join("EXP_clean.csv")).unwrap();

    let config_path = dir.path().join("stimulus_config.json");
    write_config(&config_path, "OTHER_clean.csv");

    let output = dir.path().join("surprisal_effects.csv");
    let result = run_effects(&EffectsConfig {
        results_dir: dir.path().to_path_buf(),
        config_path,
        file_suffix: "_clean.csv".to_string(),
        output: output.clone(),
    });
    assert!(result.is_err());
    assert!(!output.exists());
}

/// Cloze scoring followed by the canonical/reversed pairing
#[test]
fn test_cloze_then_reversal() {
    let dir = TempDir::new().unwrap();
    let scorer = LookupScorer::new()
        .with(
            "the dog bit the man .",
            &[("the", 1.0), ("dog", 2.0), ("bit", 3.0), ("the", 0.5), ("man", 4.0), (".", 0.25)],
        )
        .with(
            "the man bit the dog .",
            &[("the", 1.0), ("man", 2.0), ("bit", 3.5), ("the", 0.5), ("dog", 6.5), (".", 0.25)],
        );
    let mut table = StimulusTable::new(
        "cloze.csv",
        strings(&["item", "target", "context", "tgt_cloze"]),
        vec![
            strings(&["1-a", "bit", "the dog bit the [MASK] .", "man"]),
            strings(&["1-b", "bit", "the man bit the [MASK] .", "dog"]),
            strings(&["2-a", "fed", "the cook fed the [MASK] .", "cat"]),
        ],
    );

    let report =
        score_cloze_surprisal(&mut table, &scorer, "bert", "tgt_cloze", ClozeSpan::WordOnly)
            .unwrap();
    assert_eq!(report.scored, 2);
    assert_eq!(report.failures.len(), 1);

    let input = dir.path().join("cloze.csv");
    let output = dir.path().join("reversal.csv");
    table.save(&input).unwrap();

    let (rows, omissions) = run_reversal(&input, &output).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(omissions.len(), 1);
    assert_eq!(rows[0].item, "1");
    assert_eq!(rows[0].verb, "bit");
    assert_eq!(rows[0].reversed_cloze, "dog");

    let written = StimulusTable::load(&output).unwrap();
    assert_eq!(
        written.numeric_column("canonical_bert_surprisal").unwrap(),
        vec![Some(4.0)]
    );
    assert_eq!(
        written.numeric_column("bert_surprisal_effect").unwrap(),
        vec![Some(2.5)]
    );
}

/// Scores recorded during one run replay identically in the next
#[test]
fn test_recorded_scores_replay() {
    let dir = TempDir::new().unwrap();
    let dump = dir.path().join("scores.json");

    let recorder = RecordingScorer::new(stimulus_scorer());
    let mut first = stimulus_table();
    score_target_surprisal(&mut first, &recorder, "gpt2").unwrap();
    let recorded = recorder.into_recorded();
    assert_eq!(recorded.len(), 6);
    recorded.save(&dump, Some("gpt2")).unwrap();

    let replay = LookupScorer::load(&dump).unwrap();
    let mut second = stimulus_table();
    score_target_surprisal(&mut second, &replay, "gpt2").unwrap();

    assert_eq!(
        first.numeric_column("gpt2_surprisal").unwrap(),
        second.numeric_column("gpt2_surprisal").unwrap()
    );
}

/// Test GPT-2 target scoring end to end (requires model download)
#[test]
#[ignore = "requires model download"]
fn test_gpt2_target_surprisal() {
    let model = RoleModel::from_pretrained("gpt2").unwrap();
    let mut table = stimulus_table();
    let report = score_target_surprisal(&mut table, &model, "gpt2").unwrap();

    assert_eq!(report.scored, 6);
    let values = table.numeric_column("gpt2_surprisal").unwrap();
    assert!(values.iter().all(|v| v.is_some_and(|v| v > 0.0)));
}

/// Test BERT cloze scoring end to end (requires model download)
#[test]
#[ignore = "requires model download"]
fn test_bert_cloze_surprisal() {
    let model = RoleModel::from_pretrained("bert-base-uncased").unwrap();
    let mut table = StimulusTable::new(
        "cloze.csv",
        strings(&["item", "context", "tgt_cloze"]),
        vec![strings(&["1-a", "The dog bit the [MASK] .", "man"])],
    );
    let span = model.family().cloze_span();
    let report = score_cloze_surprisal(&mut table, &model, "bert-base-uncased", "tgt_cloze", span)
        .unwrap();

    assert_eq!(report.scored, 1);
    let values = table.numeric_column("bert-base-uncased_surprisal").unwrap();
    assert!(values[0].is_some_and(|v| v > 0.0));
}
