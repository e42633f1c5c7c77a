use burn::nn::loss::HuberLossConfig;
use burn::prelude::*;
use burn::tensor::{TensorData, activation};
use tracing::debug;

use crate::config::MultiboxLossConfig;
use crate::encoder::EncodedBatch;
use crate::error::{ConfigurationError, Result, ValidationError};

/// Computes the cross-entropy loss for multi-class classification without requiring one-hot
/// encoding similar to how torch cross entropy works.
///
/// # Arguments
/// * `logits` - A 2D tensor of shape `[num_boxes, num_classes]` representing the predicted raw
///   scores (logits) for each class.
/// * `targets` - A 1D tensor of shape `[num_boxes]` containing the integer class labels for each
///   prediction. Each label should be in the range `[0, num_classes - 1]`.
/// * `label_smoothing` - Probability mass spread uniformly over all classes, 0 disables it.
///
/// # Returns
/// A 1D tensor of shape `[num_boxes]` containing the cross-entropy loss for each prediction.
///
/// # Details
/// This function applies the log-softmax to the predictions and then selects the predicted
/// probabilities corresponding to the true class labels using indexing (similar to PyTorch's
/// approach). The negative log-likelihood is computed for each prediction, producing the per-box
/// loss without requiring one-hot encoded labels.
///
/// Further reading:
///
/// Lau, R. (2025, March 5). Cross-Entropy, negative Log-Likelihood, and all that jazz.
///  Towards Data Science.
/// https://towardsdatascience.com/cross-entropy-negative-log-likelihood-and-all-that-jazz-47a95bd2e81/
///
pub fn cross_entropy_loss<B: Backend>(
    logits: Tensor<B, 2>,       // (predictions) [# of boxes, # Classes]
    targets: Tensor<B, 1, Int>, // (labels, background, dog, cat, ect..) [# of boxes]
    label_smoothing: f32,
) -> Tensor<B, 1> {
    let [box_count] = targets.dims();

    // Apply log_softmax along the class dimension and convert logits into log-probabilities,
    // which is required by negative log-likelihood.
    //
    //                        ⎛  exp ⎛x ⎞  ⎞
    //                        ⎜      ⎝ i⎠  ⎟
    //  log(softmax(x)) = log ⎜────────────⎟
    //               i        ⎜___         ⎟
    //                        ⎜╲   exp ⎛x ⎞⎟
    //                        ⎜╱       ⎝ i⎠⎟
    //                        ⎝‾‾‾         ⎠

    let log_probabilities = activation::log_softmax(logits, 1);
    let targets = targets.reshape([box_count, 1]);

    // Calculate loss or negative log likelyhood (nll) from the probabilities
    //
    // loss  = -log ⎛P ⎛y , x ⎞⎞
    //     i        ⎝  ⎝ i   i⎠⎠
    //
    let nll = log_probabilities.clone().gather(1, targets) * -1;

    if label_smoothing <= 0.0 {
        return nll.reshape([box_count]);
    }

    // Smoothed target: (1 - ε) on the true class plus ε / K on every class
    let uniform = log_probabilities.mean_dim(1) * -1;
    let loss = nll * (1.0 - label_smoothing) + uniform * label_smoothing;

    loss.reshape([box_count])
}

/// Hard negative mining - Pg. 6 Liu et al.
///
/// After the matching step, most of the default boxes are negatives, especially when the
/// number of possible default boxes is large. This introduces a significant imbalance between
/// the positive and negative training examples. Instead of using all the negative examples, we
/// sort them using the highest confidence loss for each default box and pick the top ones so
/// that the ratio between the negatives and positives is at most 3:1.
///
/// Ranking by ascending background probability orders negatives the same way as ranking by
/// descending background cross entropy.
///
/// # Arguments
/// * `bg_probs` - background probability of every anchor.
/// * `positive` - `true` for anchors matched to an object.
/// * `negative_ratio` - maximum negatives kept per positive.
///
/// # Returns
/// Indices of the selected negatives, hardest first. Ties are broken by the lower index.
pub fn select_hard_negatives(
    bg_probs: &[f32],
    positive: &[bool],
    negative_ratio: f32,
) -> Vec<usize> {
    let n_positive = positive.iter().filter(|p| **p).count();

    let mut candidates: Vec<usize> = positive
        .iter()
        .enumerate()
        .filter_map(|(i, p)| (!p).then_some(i))
        .collect();

    let n_negative = ((negative_ratio * n_positive as f32) as usize).min(candidates.len());

    candidates.sort_by(|a, b| bg_probs[*a].total_cmp(&bg_probs[*b]).then(a.cmp(b)));
    candidates.truncate(n_negative);

    candidates
}

/// The three loss terms, each a `[1]` tensor already divided by the batch size.
#[derive(Debug, Clone)]
pub struct SsdLosses<B: Backend> {
    pub positive: Tensor<B, 1>,
    pub negative: Tensor<B, 1>,
    /// Already weighted by `alpha`.
    pub localization: Tensor<B, 1>,
}

impl<B: Backend> SsdLosses<B> {
    /// “SSD: Single Shot MultiBox Detector” - Training objective - Pg. 5 Liu et al.
    ///
    /// The overall objective loss function is a weighted sum of the localization loss (loc)
    /// and the confidence loss (conf):
    ///
    /// ```text
    ///  L(x, c, l, g) = Lconf(x, c) + α ⋅ Lloc(x, l, g)
    /// ```
    pub fn total(&self) -> Tensor<B, 1> {
        self.positive.clone() + self.negative.clone() + self.localization.clone()
    }
}

/// Turns raw predictions and encoded targets into classification and localization losses.
#[derive(Debug, Clone)]
pub struct MultiboxLoss {
    config: MultiboxLossConfig,
}

impl MultiboxLoss {
    pub fn new(config: MultiboxLossConfig) -> std::result::Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &MultiboxLossConfig {
        &self.config
    }

    /// Computes the positive and negative classification losses and the localization loss.
    ///
    /// # Arguments
    /// - `class_logits`: `[batch, N, K]` raw class scores.
    /// - `offsets`: `[batch, N, 4]` predicted box offsets.
    /// - `targets`: encoded ground truth of the same batch.
    /// - `match_threshold`: an anchor is positive when its matched score is strictly greater.
    ///
    /// A batch without positives selects no negatives and returns three zero losses.
    pub fn compute_losses<B: Backend>(
        &self,
        class_logits: Tensor<B, 3>,
        offsets: Tensor<B, 3>,
        targets: &EncodedBatch<B>,
        match_threshold: f32,
    ) -> Result<SsdLosses<B>> {
        let device = &class_logits.device();
        let [batch_size, num_anchors, num_classes] = class_logits.dims();
        check_shapes(offsets.dims(), [batch_size, num_anchors], targets)?;
        check_labels(targets, num_classes)?;

        let total = batch_size * num_anchors;

        // Flatten all per-anchor tensors across the batch
        let logits = class_logits.reshape([total, num_classes]);
        let offsets = offsets.reshape([total, 4]);
        let labels = targets.labels.clone().reshape([total]);
        let scores = targets.scores.clone().reshape([total]);
        let target_offsets = targets.offsets.clone().reshape([total, 4]);

        let positive = scores.greater_elem(match_threshold);
        let negative = positive.clone().bool_not();

        // Everything that is not positive is scored against the background class
        let class_targets = labels.mask_fill(negative.clone(), 0);
        let conf_loss = cross_entropy_loss(
            logits.clone(),
            class_targets,
            self.config.label_smoothing,
        );

        let bg_probs = activation::softmax(logits.detach(), 1)
            .slice([0..total, 0..1])
            .reshape([total])
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()?;
        let positive_mask = positive.clone().into_data().to_vec::<bool>()?;

        let hard_negatives =
            select_hard_negatives(&bg_probs, &positive_mask, self.config.negative_ratio);

        debug!(
            positives = positive_mask.iter().filter(|p| **p).count(),
            negatives = hard_negatives.len(),
            "hard negative mining"
        );

        let batch = batch_size as f32;

        let loss_positive = conf_loss.clone().mask_fill(negative.clone(), 0.0).sum() / batch;

        let loss_negative = if hard_negatives.is_empty() {
            Tensor::zeros([1], device)
        } else {
            let indices: Vec<i64> = hard_negatives.iter().map(|i| *i as i64).collect();
            let indices = Tensor::<B, 1, Int>::from_data(
                TensorData::new(indices, [hard_negatives.len()]),
                device,
            );
            conf_loss.select(0, indices).sum() / batch
        };

        // smooth_L1(d) = 0.5·d² if |d| < 1, |d| − 0.5 otherwise
        let loc_loss = HuberLossConfig::new(1.0)
            .init()
            .forward_no_reduction(offsets, target_offsets)
            .sum_dim(1)
            .reshape([total]);
        let loss_localization =
            loc_loss.mask_fill(negative, 0.0).sum() * self.config.alpha / batch;

        Ok(SsdLosses {
            positive: loss_positive,
            negative: loss_negative,
            localization: loss_localization,
        })
    }
}

fn check_shapes<B: Backend>(
    offsets: [usize; 3],
    [batch_size, num_anchors]: [usize; 2],
    targets: &EncodedBatch<B>,
) -> std::result::Result<(), ValidationError> {
    if offsets[2] != 4 {
        return Err(ValidationError::BoxWidthMismatch(offsets[2]));
    }

    let shapes = [
        ("offsets", [offsets[0], offsets[1]]),
        ("targets", [targets.batch_size(), targets.num_anchors()]),
    ];

    for (name, [batch, anchors]) in shapes {
        if batch != batch_size {
            return Err(ValidationError::BatchMismatch(format!(
                "{name} carry {batch} images, logits {batch_size}"
            )));
        }
        if anchors != num_anchors {
            return Err(ValidationError::AnchorCountMismatch {
                expected: num_anchors,
                found: anchors,
            });
        }
    }
    Ok(())
}

/// Every encoded label must index a column of the class logits.
fn check_labels<B: Backend>(targets: &EncodedBatch<B>, num_classes: usize) -> Result<()> {
    let labels = targets
        .labels
        .clone()
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()?;

    let out_of_range = labels
        .iter()
        .find(|label| !usize::try_from(**label).is_ok_and(|l| l < num_classes));

    if let Some(label) = out_of_range {
        return Err(ValidationError::LabelOutOfRange {
            label: usize::try_from(*label).unwrap_or(usize::MAX),
            num_classes,
        }
        .into());
    }
    Ok(())
}
