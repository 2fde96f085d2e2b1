use std::{collections::BTreeMap, sync::Arc};

use tracing::{debug, info};

use crate::{agent::Judge, error::InfraError, types::SemanticHealthMetric};

pub const DEFAULT_SAMPLE_SIZE: usize = 5;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
/// Default tunneling threshold as a fraction of `log2(N)`.
pub const DEFAULT_THRESHOLD_RATIO: f64 = 0.8;

/// How the tunneling threshold is derived.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Threshold {
    /// Fixed entropy value in bits.
    Absolute(f64),
    /// Fraction of the maximum entropy for the number of samples drawn.
    FractionOfMax(f64),
}

impl Threshold {
    pub fn resolve(self, sample_size: usize) -> f64 {
        match self {
            Self::Absolute(t) => t,
            Self::FractionOfMax(ratio) => ratio * max_entropy(sample_size),
        }
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self::FractionOfMax(DEFAULT_THRESHOLD_RATIO)
    }
}

/// `log2(n)`, the entropy of `n` singleton clusters.
pub fn max_entropy(n: usize) -> f64 {
    if n <= 1 {
        0.0
    } else {
        (n as f64).log2()
    }
}

/// Shannon entropy in bits over cluster sizes.
pub fn shannon_entropy(cluster_sizes: &[usize]) -> f64 {
    let total: usize = cluster_sizes.iter().sum();
    if total == 0 {
        return 0.0;
    }
    let mut h = 0.0;
    for &size in cluster_sizes {
        if size == 0 {
            continue;
        }
        let p = size as f64 / total as f64;
        h -= p * p.log2();
    }
    h.max(0.0)
}

/// Semantic-entropy check: sample the judge several times, cluster the
/// answers by bidirectional entailment and flag high-entropy output.
pub struct UncertaintyDetector {
    judge: Arc<dyn Judge>,
    pub sample_size: usize,
    pub temperature: f64,
    pub threshold: Threshold,
}

impl UncertaintyDetector {
    pub fn new(judge: Arc<dyn Judge>) -> Self {
        Self {
            judge,
            sample_size: DEFAULT_SAMPLE_SIZE,
            temperature: DEFAULT_TEMPERATURE,
            threshold: Threshold::default(),
        }
    }

    pub fn with_sample_size(mut self, n: usize) -> Self {
        self.sample_size = n;
        self
    }

    pub fn with_temperature(mut self, t: f64) -> Self {
        self.temperature = t;
        self
    }

    pub fn with_threshold(mut self, threshold: Threshold) -> Self {
        self.threshold = threshold;
        self
    }

    pub async fn measure(&self, prompt: &str, intent: &str) -> Result<SemanticHealthMetric, InfraError> {
        let samples = self
            .judge
            .sample(prompt, self.sample_size, self.temperature)
            .await
            .map_err(|e| InfraError::Judge(format!("sampling failed: {e:#}")))?;
        self.evaluate(&samples, intent).await
    }

    /// Cluster already-drawn samples and compute the metric.
    ///
    /// Each sample is compared only against the first member of each existing
    /// cluster, so the judge is called at most N·k times.
    pub async fn evaluate(&self, samples: &[String], intent: &str) -> Result<SemanticHealthMetric, InfraError> {
        if samples.is_empty() {
            let ceiling = max_entropy(self.sample_size.max(2));
            info!("uncertainty check drew no samples, treating as tunneling");
            return Ok(SemanticHealthMetric {
                entropy_score: ceiling,
                threshold: self.threshold.resolve(self.sample_size),
                sample_size: 0,
                is_tunneling: true,
                cluster_distribution: BTreeMap::new(),
            });
        }

        let mut clusters: Vec<Vec<usize>> = Vec::new();
        for (i, sample) in samples.iter().enumerate() {
            let mut placed = false;
            for cluster in clusters.iter_mut() {
                let representative = &samples[cluster[0]];
                let same = representative == sample
                    || self
                        .judge
                        .entails_both_ways(representative, sample, intent)
                        .await
                        .map_err(|e| InfraError::Judge(format!("entailment check failed: {e:#}")))?;
                if same {
                    cluster.push(i);
                    placed = true;
                    break;
                }
            }
            if !placed {
                clusters.push(vec![i]);
            }
        }

        let sizes: Vec<usize> = clusters.iter().map(Vec::len).collect();
        let entropy_score = shannon_entropy(&sizes);
        let threshold = self.threshold.resolve(samples.len());
        let n = samples.len() as f64;

        let cluster_distribution = clusters
            .iter()
            .enumerate()
            .map(|(i, members)| {
                let preview: String = samples[members[0]].chars().take(50).collect();
                (format!("cluster_{i}: {preview}"), members.len() as f64 / n)
            })
            .collect();

        debug!(
            samples = samples.len(),
            clusters = clusters.len(),
            entropy = entropy_score,
            threshold,
            "semantic entropy computed"
        );

        Ok(SemanticHealthMetric {
            entropy_score,
            threshold,
            sample_size: samples.len(),
            is_tunneling: entropy_score > threshold,
            cluster_distribution,
        })
    }
}
