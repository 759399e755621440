//! Paired surprisal contrasts across stimulus items
//!
//! For every item that appears in both arms of a contrast, the effect is the
//! first arm's surprisal minus the second arm's, per model. The sign follows
//! the experiment design and is never normalized. Items that lack an arm are
//! not dropped silently: they come back as [`ContrastError`] omissions and are
//! logged with their item ID.

use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;
use statrs::distribution::{ContinuousCDF, StudentsT};
use tracing::warn;

use crate::error::{ContrastError, TableError};
use crate::stimuli::{surprisal_column, write_csv_atomic, StimulusItem};
use crate::surprisal::is_failed_value;

/// One item's contrast between two conditions
#[derive(Debug, Clone, PartialEq)]
pub struct ContrastRow {
    pub item: String,
    /// Contrast-axis label (e.g. "Reversal")
    pub condition: String,
    /// Experiment tag, stamped by the caller
    pub expt: Option<String>,
    /// `(model, effect)` in model order; `None` when either score is missing or failed
    pub effects: Vec<(String, Option<f64>)>,
}

impl ContrastRow {
    pub fn effect(&self, model: &str) -> Option<f64> {
        self.effects
            .iter()
            .find(|(m, _)| m == model)
            .and_then(|(_, e)| *e)
    }
}

/// Contrast rows plus the items that could not be paired
#[derive(Debug, Clone)]
pub struct ContrastOutcome<R> {
    pub rows: Vec<R>,
    pub omissions: Vec<ContrastError>,
}

impl<R> Default for ContrastOutcome<R> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            omissions: Vec::new(),
        }
    }
}

impl<R> ContrastOutcome<R> {
    fn omit(&mut self, err: ContrastError) {
        warn!("Omitting contrast: {}", err);
        self.omissions.push(err);
    }
}

/// Exactly one row of `rows` must satisfy `pred`
fn single_row<'a>(
    rows: &[&'a StimulusItem],
    item: &str,
    condition: &str,
    pred: impl Fn(&StimulusItem) -> bool,
) -> Result<&'a StimulusItem, ContrastError> {
    let matching: Vec<&'a StimulusItem> = rows.iter().copied().filter(|r| pred(*r)).collect();
    match matching.as_slice() {
        [single] => Ok(*single),
        [] => Err(ContrastError::MissingCondition {
            item: item.to_string(),
            condition: condition.to_string(),
        }),
        many => Err(ContrastError::DuplicateCondition {
            item: item.to_string(),
            condition: condition.to_string(),
            count: many.len(),
        }),
    }
}

/// `minuend - subtrahend` for one model, if both scores are usable
fn difference(minuend: &StimulusItem, subtrahend: &StimulusItem, model: &str) -> Option<f64> {
    let a = minuend.surprisal(model)?;
    let b = subtrahend.surprisal(model)?;
    if is_failed_value(a) || is_failed_value(b) {
        return None;
    }
    Some(a - b)
}

/// Group items by key, keeping first-seen key order
fn group_by_key<'a>(
    items: impl IntoIterator<Item = &'a StimulusItem>,
    key: impl Fn(&StimulusItem) -> String,
) -> Vec<(String, Vec<&'a StimulusItem>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<&StimulusItem>> = HashMap::new();
    for item in items {
        let k = key(item);
        groups
            .entry(k.clone())
            .or_insert_with(|| {
                order.push(k);
                Vec::new()
            })
            .push(item);
    }
    order
        .into_iter()
        .map(|k| {
            let rows = groups.remove(&k).unwrap_or_default();
            (k, rows)
        })
        .collect()
}

/// Contrast `pair[0] - pair[1]` for every item present in either condition.
///
/// `models` are model identifiers (surprisal column names without the
/// `_surprisal` suffix).
pub fn surprisal_effects(
    items: &[StimulusItem],
    models: &[String],
    pair: &[String; 2],
    label: &str,
) -> ContrastOutcome<ContrastRow> {
    let [first, second] = pair;
    let in_pair = items
        .iter()
        .filter(|i| i.is_condition(first) || i.is_condition(second));

    let mut outcome = ContrastOutcome::default();
    for (item_id, rows) in group_by_key(in_pair, |i| i.item.clone()) {
        let arms = single_row(&rows, &item_id, first, |r| r.is_condition(first)).and_then(|a| {
            single_row(&rows, &item_id, second, |r| r.is_condition(second)).map(|b| (a, b))
        });
        let (a, b) = match arms {
            Ok(arms) => arms,
            Err(err) => {
                outcome.omit(err);
                continue;
            }
        };

        let effects = models
            .iter()
            .map(|model| {
                let effect = difference(a, b, model);
                if effect.is_none() {
                    warn!(
                        "Item {}: no usable '{}' score for {} ({} vs {})",
                        item_id, model, label, first, second
                    );
                }
                (model.clone(), effect)
            })
            .collect();

        outcome.rows.push(ContrastRow {
            item: item_id,
            condition: label.to_string(),
            expt: None,
            effects,
        });
    }
    outcome
}

/// Canonical/reversed pair built from `N-a` / `N-b` item IDs
#[derive(Debug, Clone, PartialEq)]
pub struct ReversalRow {
    pub item: String,
    pub verb: String,
    pub canonical_context: String,
    pub reversed_context: String,
    pub canonical_cloze: String,
    pub reversed_cloze: String,
    /// `(model, canonical, reversed, effect)`; effect = reversed - canonical
    pub scores: Vec<(String, Option<f64>, Option<f64>, Option<f64>)>,
}

const CANONICAL_SUFFIX: &str = "a";
const REVERSED_SUFFIX: &str = "b";

fn split_item_id(item: &str) -> Option<(&str, &str)> {
    item.rsplit_once('-')
        .filter(|(prefix, suffix)| !prefix.is_empty() && !suffix.is_empty())
}

/// Reversal effects for items named `N-a` (canonical) and `N-b` (reversed)
pub fn reversal_surprisal_effect(
    items: &[StimulusItem],
    models: &[String],
) -> ContrastOutcome<ReversalRow> {
    let mut outcome = ContrastOutcome::default();

    let mut well_formed = Vec::with_capacity(items.len());
    for item in items {
        if split_item_id(&item.item).is_some() {
            well_formed.push(item);
        } else {
            outcome.omit(ContrastError::MalformedItem {
                item: item.item.clone(),
            });
        }
    }

    let groups = group_by_key(well_formed, |i| {
        split_item_id(&i.item)
            .map(|(prefix, _)| prefix.to_string())
            .unwrap_or_default()
    });

    for (prefix, rows) in groups {
        let canonical_id = format!("{prefix}-{CANONICAL_SUFFIX}");
        let reversed_id = format!("{prefix}-{REVERSED_SUFFIX}");
        let pair = single_row(&rows, &prefix, &canonical_id, |r| r.item == canonical_id)
            .and_then(|c| {
                single_row(&rows, &prefix, &reversed_id, |r| r.item == reversed_id)
                    .map(|r| (c, r))
            });
        let (canonical, reversed) = match pair {
            Ok(pair) => pair,
            Err(err) => {
                outcome.omit(err);
                continue;
            }
        };

        let text = |v: &Option<String>| v.clone().unwrap_or_default();
        let scores = models
            .iter()
            .map(|model| {
                (
                    model.clone(),
                    canonical.surprisal(model),
                    reversed.surprisal(model),
                    difference(reversed, canonical, model),
                )
            })
            .collect();

        outcome.rows.push(ReversalRow {
            item: prefix,
            verb: text(&canonical.target),
            canonical_context: text(&canonical.context),
            reversed_context: text(&reversed.context),
            canonical_cloze: text(&canonical.tgt_cloze),
            reversed_cloze: text(&reversed.tgt_cloze),
            scores,
        });
    }
    outcome
}

fn cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Column holding a model's effect in the contrast table
pub fn effect_column(model: &str) -> String {
    format!("{}_effect", surprisal_column(model))
}

/// Write contrast rows as `item,condition,expt,{model}_surprisal_effect...`
pub fn write_contrast_table(path: &Path, rows: &[ContrastRow]) -> Result<(), TableError> {
    let mut models: Vec<String> = Vec::new();
    for row in rows {
        for (model, _) in &row.effects {
            if !models.contains(model) {
                models.push(model.clone());
            }
        }
    }

    let mut headers = vec![
        "item".to_string(),
        "condition".to_string(),
        "expt".to_string(),
    ];
    headers.extend(models.iter().map(|m| effect_column(m)));

    let records: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            let mut record = vec![
                row.item.clone(),
                row.condition.clone(),
                row.expt.clone().unwrap_or_default(),
            ];
            record.extend(models.iter().map(|m| cell(row.effect(m))));
            record
        })
        .collect();

    write_csv_atomic(path, &headers, &records)
}

/// Write reversal rows with canonical, reversed and effect columns per model
pub fn write_reversal_table(path: &Path, rows: &[ReversalRow]) -> Result<(), TableError> {
    let models: Vec<String> = rows
        .first()
        .map(|r| r.scores.iter().map(|(m, ..)| m.clone()).collect())
        .unwrap_or_default();

    let mut headers: Vec<String> = [
        "item",
        "verb",
        "canonical_context",
        "reversed_context",
        "canonical_cloze",
        "reversed_cloze",
    ]
    .iter()
    .map(|h| (*h).to_string())
    .collect();
    for model in &models {
        let column = surprisal_column(model);
        headers.push(format!("canonical_{column}"));
        headers.push(format!("reversed_{column}"));
        headers.push(format!("{column}_effect"));
    }

    let records: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            let mut record = vec![
                row.item.clone(),
                row.verb.clone(),
                row.canonical_context.clone(),
                row.reversed_context.clone(),
                row.canonical_cloze.clone(),
                row.reversed_cloze.clone(),
            ];
            for (_, canonical, reversed, effect) in &row.scores {
                record.push(cell(*canonical));
                record.push(cell(*reversed));
                record.push(cell(*effect));
            }
            record
        })
        .collect();

    write_csv_atomic(path, &headers, &records)
}

/// Distribution of one model's effect within one experiment and contrast
#[derive(Debug, Clone, Serialize)]
pub struct EffectSummary {
    pub expt: String,
    pub condition: String,
    pub model: String,
    pub n: usize,
    pub mean: f64,
    pub std_dev: f64,
    /// One-sample t statistic against zero
    pub t: f64,
    /// Two-sided p-value
    pub p_value: f64,
}

/// Per (experiment, contrast, model) mean effect with a one-sample t-test
pub fn summarize_effects(rows: &[ContrastRow]) -> Vec<EffectSummary> {
    let mut order: Vec<(String, String, String)> = Vec::new();
    let mut values: HashMap<(String, String, String), Vec<f64>> = HashMap::new();

    for row in rows {
        let expt = row.expt.clone().unwrap_or_default();
        for (model, effect) in &row.effects {
            let Some(effect) = effect else { continue };
            let key = (expt.clone(), row.condition.clone(), model.clone());
            values
                .entry(key.clone())
                .or_insert_with(|| {
                    order.push(key);
                    Vec::new()
                })
                .push(*effect);
        }
    }

    order
        .into_iter()
        .map(|key| {
            let data = values.remove(&key).unwrap_or_default();
            let (t, p_value) = one_sample_t_test(&data);
            let (expt, condition, model) = key;
            EffectSummary {
                expt,
                condition,
                model,
                n: data.len(),
                mean: mean(&data),
                std_dev: std_dev(&data),
                t,
                p_value,
            }
        })
        .collect()
}

fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        0.0
    } else {
        data.iter().sum::<f64>() / data.len() as f64
    }
}

/// Sample standard deviation (n - 1)
fn std_dev(data: &[f64]) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let m = mean(data);
    let var = data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    var.sqrt()
}

/// Returns `(t, p)`; degenerate inputs give `(0, 1)`
fn one_sample_t_test(data: &[f64]) -> (f64, f64) {
    let n = data.len();
    let sd = std_dev(data);
    if n < 2 || sd == 0.0 {
        return (0.0, 1.0);
    }
    let t = mean(data) / (sd / (n as f64).sqrt());
    let df = (n - 1) as f64;
    let p_value = match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => 2.0 * (1.0 - dist.cdf(t.abs())),
        Err(_) => 1.0,
    };
    (t, p_value)
}
