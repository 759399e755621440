//! Linear probing with linfa
//!
//! Trains logistic regression probes on sentence or word embeddings to test
//! whether a binary stimulus property (e.g. canonical vs reversed roles) is
//! linearly decodable, evaluated with shuffled k-fold cross-validation.

use anyhow::{Context, Result};
use linfa::prelude::*;
use linfa_logistic::LogisticRegression;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use tracing::debug;

/// Results from evaluating a probe on one held-out set
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResults {
    /// Classification accuracy on test set
    pub accuracy: f64,
    /// Number of correct predictions
    pub correct: usize,
    /// Total number of test samples
    pub total: usize,
    pub true_positives: usize,
    pub true_negatives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
}

impl ProbeResults {
    /// Precision for the positive class
    pub fn precision(&self) -> f64 {
        let denom = self.true_positives + self.false_positives;
        if denom == 0 {
            0.0
        } else {
            self.true_positives as f64 / denom as f64
        }
    }

    /// Recall for the positive class
    pub fn recall(&self) -> f64 {
        let denom = self.true_positives + self.false_negatives;
        if denom == 0 {
            0.0
        } else {
            self.true_positives as f64 / denom as f64
        }
    }

    pub fn f1(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }
}

/// Per-fold results of a cross-validated probe
#[derive(Debug, Clone, Serialize)]
pub struct CrossValidationResults {
    pub folds: Vec<ProbeResults>,
    pub mean_accuracy: f64,
}

impl CrossValidationResults {
    pub fn fold_accuracies(&self) -> Vec<f64> {
        self.folds.iter().map(|f| f.accuracy).collect()
    }
}

/// Shuffled k-fold test sets over `n` samples.
///
/// The first `n % k` folds get one extra sample.
pub fn kfold_indices(n: usize, k: usize, seed: u64) -> Result<Vec<Vec<usize>>> {
    anyhow::ensure!(k >= 2, "Need at least 2 folds, got {k}");
    anyhow::ensure!(n >= k, "Cannot split {n} samples into {k} folds");

    let mut order: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);

    let base = n / k;
    let extra = n % k;
    let mut folds = Vec::with_capacity(k);
    let mut start = 0;
    for fold in 0..k {
        let size = base + usize::from(fold < extra);
        folds.push(order[start..start + size].to_vec());
        start += size;
    }
    Ok(folds)
}

/// Trainer for linear probes
pub struct ProbeTrainer {
    max_iterations: u64,
}

impl ProbeTrainer {
    pub fn new() -> Self {
        Self {
            max_iterations: 500,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Train a probe and evaluate on test data
    pub fn train_and_evaluate(
        &self,
        train_data: &[(Vec<f32>, bool)],
        test_data: &[(Vec<f32>, bool)],
    ) -> Result<ProbeResults> {
        let (train_x, train_y) = self.prepare_data(train_data)?;
        let (test_x, test_y) = self.prepare_data(test_data)?;

        debug!(
            "Training probe: {} samples, {} features",
            train_x.nrows(),
            train_x.ncols()
        );

        let train_dataset = Dataset::new(train_x, train_y);

        let model = LogisticRegression::default()
            .max_iterations(self.max_iterations)
            .fit(&train_dataset)
            .context("Failed to train logistic regression")?;

        let predictions = model.predict(&test_x);
        Ok(self.compute_metrics(&predictions, &test_y))
    }

    /// Shuffled k-fold cross-validation over labelled embeddings
    pub fn cross_validate(
        &self,
        data: &[(Vec<f32>, bool)],
        folds: usize,
        seed: u64,
    ) -> Result<CrossValidationResults> {
        let test_sets = kfold_indices(data.len(), folds, seed)?;

        let mut results = Vec::with_capacity(folds);
        for (fold, test_idx) in test_sets.iter().enumerate() {
            let mut in_test = vec![false; data.len()];
            for &i in test_idx {
                in_test[i] = true;
            }
            let (test, train): (Vec<_>, Vec<_>) = data
                .iter()
                .cloned()
                .enumerate()
                .partition(|(i, _)| in_test[*i]);
            let train: Vec<_> = train.into_iter().map(|(_, d)| d).collect();
            let test: Vec<_> = test.into_iter().map(|(_, d)| d).collect();

            let fold_result = self
                .train_and_evaluate(&train, &test)
                .with_context(|| format!("Probe failed on fold {fold}"))?;
            debug!("Fold {}: accuracy {:.3}", fold, fold_result.accuracy);
            results.push(fold_result);
        }

        let mean_accuracy =
            results.iter().map(|r| r.accuracy).sum::<f64>() / results.len() as f64;
        Ok(CrossValidationResults {
            folds: results,
            mean_accuracy,
        })
    }

    /// Convert embedding data to ndarray format
    fn prepare_data(&self, data: &[(Vec<f32>, bool)]) -> Result<(Array2<f64>, Array1<usize>)> {
        if data.is_empty() {
            anyhow::bail!("Empty dataset");
        }

        let n_samples = data.len();
        let n_features = data[0].0.len();

        let flat: Vec<f64> = data
            .iter()
            .flat_map(|(features, _)| features.iter().map(|&f| f64::from(f)))
            .collect();

        let x = Array2::from_shape_vec((n_samples, n_features), flat)
            .context("Failed to create feature matrix")?;

        let y: Array1<usize> = data.iter().map(|(_, label)| usize::from(*label)).collect();

        Ok((x, y))
    }

    fn compute_metrics(&self, predictions: &Array1<usize>, labels: &Array1<usize>) -> ProbeResults {
        let mut tp = 0;
        let mut tn = 0;
        let mut fp = 0;
        let mut r#fn = 0;

        for (pred, label) in predictions.iter().zip(labels.iter()) {
            match (*pred, *label) {
                (1, 1) => tp += 1,
                (0, 0) => tn += 1,
                (1, 0) => fp += 1,
                (0, 1) => r#fn += 1,
                _ => {}
            }
        }

        let correct = tp + tn;
        let total = predictions.len();
        let accuracy = correct as f64 / total as f64;

        ProbeResults {
            accuracy,
            correct,
            total,
            true_positives: tp,
            true_negatives: tn,
            false_positives: fp,
            false_negatives: r#fn,
        }
    }
}

impl Default for ProbeTrainer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_results_metrics() {
        let results = ProbeResults {
            accuracy: 0.8,
            correct: 8,
            total: 10,
            true_positives: 4,
            true_negatives: 4,
            false_positives: 1,
            false_negatives: 1,
        };

        assert!((results.precision() - 0.8).abs() < 0.01);
        assert!((results.recall() - 0.8).abs() < 0.01);
        assert!((results.f1() - 0.8).abs() < 0.01);
    }

    #[test]
    fn test_kfold_partitions_every_sample_once() {
        let folds = kfold_indices(23, 10, 42).unwrap();
        assert_eq!(folds.len(), 10);
        assert_eq!(folds[0].len(), 3);
        assert_eq!(folds[9].len(), 2);

        let mut all: Vec<usize> = folds.into_iter().flatten().collect();
        all.sort_unstable();
        assert_eq!(all, (0..23).collect::<Vec<_>>());

        assert_eq!(kfold_indices(23, 10, 42).unwrap(), kfold_indices(23, 10, 42).unwrap());
        assert!(kfold_indices(5, 10, 0).is_err());
        assert!(kfold_indices(5, 1, 0).is_err());
    }

    #[test]
    fn test_cross_validate_separable_data() {
        // Two well-separated clusters along the first feature
        let data: Vec<(Vec<f32>, bool)> = (0..40)
            .map(|i| {
                let label = i % 2 == 0;
                let x = if label { 3.0 } else { -3.0 };
                (vec![x + (i as f32) * 0.01, 0.5], label)
            })
            .collect();

        let results = ProbeTrainer::new().cross_validate(&data, 4, 7).unwrap();
        assert_eq!(results.folds.len(), 4);
        assert_eq!(results.fold_accuracies().len(), 4);
        assert!(results.mean_accuracy > 0.9);
    }
}
