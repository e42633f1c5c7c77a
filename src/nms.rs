use std::cmp::Ordering;

use burn::{
    prelude::Backend,
    tensor::{Tensor, activation},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::boxes::{clip_box, iou_yxyx};
use crate::config::DetectionConfig;
use crate::decoder::BoxDecoder;
use crate::error::{ConfigurationError, Result, ValidationError};

/// Final output of the detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: usize,
    pub score: f32,
    /// `(ymin, xmin, ymax, xmax)` clipped to `[0, 1]`.
    pub bbox: [f32; 4],
}

/// A box that passed the score threshold, remembering the anchor it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub anchor: usize,
    pub class_id: usize,
    pub score: f32,
    pub bbox: [f32; 4],
}

impl From<Candidate> for Detection {
    fn from(c: Candidate) -> Self {
        Detection {
            class_id: c.class_id,
            score: c.score,
            bbox: c.bbox,
        }
    }
}

/// Highest score first, lower anchor index first on ties.
fn by_score(a: &Candidate, b: &Candidate) -> Ordering {
    b.score.total_cmp(&a.score).then(a.anchor.cmp(&b.anchor))
}

/// Greedy non-maximum suppression.
///
/// Walks the candidates from the highest score down, keeping a box unless it overlaps an
/// already kept box by more than `iou_threshold`. With `class_aware` only boxes of the same
/// class suppress each other. At most `top_k` boxes are kept.
pub fn nms(
    mut candidates: Vec<Candidate>,
    iou_threshold: f32,
    class_aware: bool,
    top_k: usize,
) -> Vec<Candidate> {
    candidates.sort_by(by_score);

    let mut kept: Vec<Candidate> = Vec::new();

    for candidate in candidates {
        if kept.len() >= top_k {
            break;
        }

        let suppressed = kept.iter().any(|k| {
            (!class_aware || k.class_id == candidate.class_id)
                && iou_yxyx(&k.bbox, &candidate.bbox) > iou_threshold
        });

        if !suppressed {
            kept.push(candidate);
        }
    }

    kept
}

/// Turns per-anchor class probabilities and decoded boxes into detections.
#[derive(Debug, Clone)]
pub struct DetectionSelector {
    config: DetectionConfig,
}

impl DetectionSelector {
    pub fn new(config: DetectionConfig) -> std::result::Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Selects the detections of one image.
    ///
    /// # Arguments
    ///
    /// * `class_probs` - `[N, C]` class probabilities, column 0 is background.
    /// * `boxes` - `[N, 4]` decoded corner-form boxes.
    ///
    /// Each anchor proposes its best non-background class if that probability is strictly
    /// greater than the score threshold. Proposed boxes are clipped to the image and then
    /// filtered by [`nms`]. An empty result is valid.
    pub fn select<B: Backend>(
        &self,
        class_probs: Tensor<B, 2>,
        boxes: Tensor<B, 2>,
    ) -> Result<Vec<Detection>> {
        let [n, num_classes] = class_probs.dims();
        let [found, width] = boxes.dims();

        if width != 4 {
            return Err(ValidationError::BoxWidthMismatch(width).into());
        }
        if found != n {
            return Err(ValidationError::AnchorCountMismatch { expected: n, found }.into());
        }
        if num_classes < 2 {
            return Err(ValidationError::ClassCountMismatch {
                expected: 2,
                found: num_classes,
            }
            .into());
        }

        let probs = class_probs.into_data().convert::<f32>().to_vec::<f32>()?;
        let boxes = boxes.into_data().convert::<f32>().to_vec::<f32>()?;

        let candidates: Vec<Candidate> = probs
            .chunks_exact(num_classes)
            .zip(boxes.chunks_exact(4))
            .enumerate()
            .filter_map(|(anchor, (row, bbox))| {
                let (class_id, score) = row
                    .iter()
                    .copied()
                    .enumerate()
                    .skip(1)
                    .fold((0, f32::NEG_INFINITY), |best, (i, p)| {
                        if p > best.1 { (i, p) } else { best }
                    });

                (score > self.config.score_threshold).then(|| Candidate {
                    anchor,
                    class_id,
                    score,
                    bbox: clip_box([bbox[0], bbox[1], bbox[2], bbox[3]]),
                })
            })
            .collect();

        let proposed = candidates.len();
        let kept = nms(
            candidates,
            self.config.nms_threshold,
            self.config.class_aware,
            self.config.top_k,
        );

        debug!(proposed, kept = kept.len(), "selected detections");

        Ok(kept.into_iter().map(Detection::from).collect())
    }

    /// [`Self::select`] for every image of `[batch, N, C]` probabilities and `[batch, N, 4]`
    /// boxes.
    pub fn select_batch<B: Backend>(
        &self,
        class_probs: Tensor<B, 3>,
        boxes: Tensor<B, 3>,
    ) -> Result<Vec<Vec<Detection>>> {
        let [batch, n, c] = class_probs.dims();
        let [box_batch, found, width] = boxes.dims();

        if width != 4 {
            return Err(ValidationError::BoxWidthMismatch(width).into());
        }
        if box_batch != batch {
            return Err(ValidationError::BatchMismatch(format!(
                "{batch} probability rows, {box_batch} box rows"
            ))
            .into());
        }

        (0..batch)
            .map(|i| {
                let probs = class_probs
                    .clone()
                    .slice([i..i + 1, 0..n, 0..c])
                    .reshape([n, c]);
                let image_boxes = boxes
                    .clone()
                    .slice([i..i + 1, 0..found, 0..4])
                    .reshape([found, 4]);
                self.select(probs, image_boxes)
            })
            .collect()
    }

    /// Softmax, decode and select for one image's raw `[N, K]` logits and `[N, 4]` offsets.
    pub fn detect<B: Backend>(
        &self,
        decoder: &BoxDecoder<B>,
        class_logits: Tensor<B, 2>,
        offsets: Tensor<B, 2>,
    ) -> Result<Vec<Detection>> {
        let boxes = decoder.decode(offsets)?;
        self.select(activation::softmax(class_logits, 1), boxes)
    }

    /// [`Self::detect`] over a batch of `[batch, N, K]` logits and `[batch, N, 4]` offsets.
    pub fn detect_batch<B: Backend>(
        &self,
        decoder: &BoxDecoder<B>,
        class_logits: Tensor<B, 3>,
        offsets: Tensor<B, 3>,
    ) -> Result<Vec<Vec<Detection>>> {
        let boxes = decoder.decode_batch(offsets)?;
        self.select_batch(activation::softmax(class_logits, 2), boxes)
    }
}
