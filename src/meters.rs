use burn::prelude::*;
use std::collections::HashMap;

/// Number of top-k accuracy levels tracked per sweep (top-1 .. top-K).
pub const TOP_K: usize = 4;

/// Named running aggregator of a scalar metric.
///
/// Values accumulate over a sweep; `flush` returns their mean and clears the
/// accumulator, so it is called exactly once per epoch.
#[derive(Debug, Default, Clone)]
pub struct ScalarMeter {
    values: Vec<f64>,
}

impl ScalarMeter {
    pub fn cache(&mut self, value: f64) {
        self.values.push(value);
    }

    pub fn cache_list(&mut self, values: &[f64]) {
        self.values.extend_from_slice(values);
    }

    /// Mean of everything cached since the last flush, or `None` when the
    /// accumulator is empty. Destructive: the accumulator is reset.
    pub fn flush(&mut self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        let mean = self.values.iter().sum::<f64>() / self.values.len() as f64;
        self.values.clear();
        Some(mean)
    }
}

/// The meter family for one sweep (training or validation).
#[derive(Debug, Default)]
pub struct MeterSet {
    meters: HashMap<String, ScalarMeter>,
}

impl MeterSet {
    /// Meters for an adversarial classification sweep: natural/robust losses
    /// and top-k accuracy on clean and adversarial predictions.
    pub fn classification() -> Self {
        let mut set = Self::default();
        set.meters.insert("natural_loss".into(), ScalarMeter::default());
        set.meters.insert("robust_loss".into(), ScalarMeter::default());
        for k in 1..=TOP_K {
            set.meters
                .insert(format!("top{k}_accuracy"), ScalarMeter::default());
            set.meters
                .insert(format!("top{k}_adv_accuracy"), ScalarMeter::default());
        }
        set
    }

    pub fn cache(&mut self, name: &str, value: f64) {
        self.meters.entry(name.into()).or_default().cache(value);
    }

    pub fn cache_list(&mut self, name: &str, values: &[f64]) {
        self.meters.entry(name.into()).or_default().cache_list(values);
    }

    /// Cache per-sample top-k hits for both prediction sets, for every
    /// k in 1..=TOP_K.
    pub fn cache_accuracy<B: Backend>(
        &mut self,
        targets: &Tensor<B, 1, Int>,
        adv_logits: &Tensor<B, 2>,
        logits: &Tensor<B, 2>,
    ) {
        for k in 1..=TOP_K {
            let hits = topk_hits(logits, targets, k);
            let adv_hits = topk_hits(adv_logits, targets, k);
            self.cache_list(&format!("top{k}_accuracy"), &hits);
            self.cache_list(&format!("top{k}_adv_accuracy"), &adv_hits);
        }
    }

    /// Flush every meter into a name -> mean snapshot, skipping meters with
    /// nothing cached. Destructive, once per epoch.
    pub fn flush(&mut self) -> HashMap<String, f64> {
        self.meters
            .iter_mut()
            .filter_map(|(name, meter)| meter.flush().map(|value| (name.clone(), value)))
            .collect()
    }
}

/// Per-sample 0/1 indicators of the true label appearing among the k
/// highest-scoring classes.
pub fn topk_hits<B: Backend>(
    logits: &Tensor<B, 2>,
    targets: &Tensor<B, 1, Int>,
    k: usize,
) -> Vec<f64> {
    let (_, indices) = logits.clone().topk_with_indices(k, 1);
    let expanded = targets.clone().unsqueeze_dim::<2>(1).repeat_dim(1, k);

    // Top-k indices are distinct, so the per-row match count is 0 or 1.
    indices
        .equal(expanded)
        .int()
        .sum_dim(1)
        .to_data()
        .convert::<f64>()
        .to_vec::<f64>()
        .expect("top-k hit counts should convert to floats")
}

/// Best validation top-1 accuracy seen so far, owned by the orchestrator and
/// carried across the whole run.
#[derive(Debug, Default, Clone, Copy)]
pub struct BestTracker {
    best: f64,
}

impl BestTracker {
    /// Record a new epoch's validation accuracy. Returns true only on strict
    /// improvement, which is also the checkpoint trigger.
    pub fn observe(&mut self, top1_accuracy: f64) -> bool {
        if top1_accuracy > self.best {
            self.best = top1_accuracy;
            true
        } else {
            false
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = burn::backend::ndarray::NdArray<f32>;

    fn fixture() -> (Tensor<TestBackend, 2>, Tensor<TestBackend, 1, Int>) {
        let device = Default::default();
        // Sample 0: argmax class 2 (correct). Sample 1: true class 0 ranks
        // third. Sample 2: true class 4 ranks last.
        let logits = Tensor::from_floats(
            [
                [0.1, 0.2, 3.0, 0.0, -1.0],
                [0.5, 2.0, 1.0, 0.2, -0.5],
                [4.0, 3.0, 2.0, 1.0, 0.0],
            ],
            &device,
        );
        let targets = Tensor::from_ints([2, 0, 4], &device);
        (logits, targets)
    }

    #[test]
    fn top1_matches_direct_argmax() {
        let (logits, targets) = fixture();
        let hits = topk_hits(&logits, &targets, 1);

        let argmax = logits.argmax(1).flatten::<1>(0, 1);
        let direct: Vec<f64> = argmax
            .equal(targets)
            .int()
            .to_data()
            .convert::<f64>()
            .to_vec::<f64>()
            .unwrap();

        assert_eq!(hits, direct);
        assert_eq!(hits, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn topk_accuracy_is_monotone_in_k() {
        let (logits, targets) = fixture();
        let mut previous = 0.0;
        for k in 1..=4 {
            let hits = topk_hits(&logits, &targets, k);
            let accuracy = hits.iter().sum::<f64>() / hits.len() as f64;
            assert!(
                accuracy >= previous,
                "top-{k} accuracy {accuracy} dropped below {previous}"
            );
            previous = accuracy;
        }
    }

    #[test]
    fn flush_is_destructive() {
        let mut meters = MeterSet::classification();
        meters.cache("natural_loss", 2.0);
        meters.cache("natural_loss", 4.0);

        let first = meters.flush();
        assert_eq!(first.get("natural_loss"), Some(&3.0));

        let second = meters.flush();
        assert!(second.is_empty());
    }

    #[test]
    fn best_tracker_updates_only_on_strict_improvement() {
        let mut tracker = BestTracker::default();
        let accuracies = [0.5, 0.4, 0.6, 0.6, 0.7];
        let mut bests = Vec::new();
        let mut improved_epochs = Vec::new();

        for (epoch, &accuracy) in accuracies.iter().enumerate() {
            if tracker.observe(accuracy) {
                improved_epochs.push(epoch);
            }
            bests.push(tracker.best());
        }

        assert_eq!(bests, vec![0.5, 0.5, 0.6, 0.6, 0.7]);
        assert_eq!(improved_epochs, vec![0, 2, 4]);
    }
}
