use std::ops::Range;

use burn::{
    prelude::Backend,
    tensor::{Int, Tensor},
};
use tracing::trace;

use crate::anchors::{AnchorGenerator, Anchors};
use crate::boxes::{
    GroundTruthSet, boxes_to_components, corner_to_center, corners_to_centers, get_iou,
};
use crate::config::SsdConfig;
use crate::error::{ConfigurationError, ValidationError};

/// Training targets of one image, one row per anchor in enumeration order.
#[derive(Debug, Clone)]
pub struct EncodedTargets<B: Backend> {
    /// `[N]` matched class, 0 (background) unless the best IoU exceeds the match threshold.
    pub labels: Tensor<B, 1, Int>,
    /// `[N]` best IoU with any ground truth box, kept even below the threshold.
    pub scores: Tensor<B, 1>,
    /// `[N, 4]` `(ty, tx, th, tw)` of the best-IoU box relative to the anchor.
    pub offsets: Tensor<B, 2>,
}

impl<B: Backend> EncodedTargets<B> {
    pub fn len(&self) -> usize {
        self.scores.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Targets of the anchors in `range`, e.g. one entry of
    /// [`AnchorGenerator::layer_ranges`].
    pub fn layer(&self, range: Range<usize>) -> Self {
        Self {
            labels: self.labels.clone().slice([range.clone()]),
            scores: self.scores.clone().slice([range.clone()]),
            offsets: self.offsets.clone().slice([range, 0..4]),
        }
    }
}

/// Targets of a batch stacked along a leading batch dimension.
#[derive(Debug, Clone)]
pub struct EncodedBatch<B: Backend> {
    /// `[batch, N]`
    pub labels: Tensor<B, 2, Int>,
    /// `[batch, N]`
    pub scores: Tensor<B, 2>,
    /// `[batch, N, 4]`
    pub offsets: Tensor<B, 3>,
}

impl<B: Backend> EncodedBatch<B> {
    pub fn stack(targets: Vec<EncodedTargets<B>>) -> Result<Self, ValidationError> {
        if targets.is_empty() {
            return Err(ValidationError::BatchMismatch("empty batch".to_string()));
        }

        let (labels, (scores, offsets)): (Vec<_>, (Vec<_>, Vec<_>)) = targets
            .into_iter()
            .map(|t| (t.labels, (t.scores, t.offsets)))
            .unzip();

        Ok(Self {
            labels: Tensor::stack(labels, 0),
            scores: Tensor::stack(scores, 0),
            offsets: Tensor::stack(offsets, 0),
        })
    }

    pub fn batch_size(&self) -> usize {
        self.scores.dims()[0]
    }

    pub fn num_anchors(&self) -> usize {
        self.scores.dims()[1]
    }
}

/// Encodes matched boxes relative to their anchors.
///
/// ```text
///  ty = (gt_cy − a_cy) / a_h / v0        th = log(gt_h / a_h) / v2
///  tx = (gt_cx − a_cx) / a_w / v1        tw = log(gt_w / a_w) / v3
/// ```
///
/// # Arguments
///
/// * `matched` - `[N, 4]` center-form `(cy, cx, h, w)` boxes, one per anchor.
/// * `anchors` - `[N, 4]` center-form anchors.
/// * `variance` - prior variance `(v0, v1, v2, v3)`.
pub fn encode_offsets<B: Backend>(
    matched: Tensor<B, 2>,
    anchors: Tensor<B, 2>,
    [v0, v1, v2, v3]: [f32; 4],
) -> Tensor<B, 2> {
    let (gcy, gcx, gh, gw) = boxes_to_components(matched);
    let (acy, acx, ah, aw) = boxes_to_components(anchors);

    let ty = (gcy - acy) / ah.clone() / v0;
    let tx = (gcx - acx) / aw.clone() / v1;
    let th = (gh / ah).log() / v2;
    let tw = (gw / aw).log() / v3;

    Tensor::cat(vec![ty, tx, th, tw], 1)
}

/// Host version of [`encode_offsets`] for a single center-form anchor and corner-form box.
pub fn encode_box(anchor: [f32; 4], gt: [f32; 4], [v0, v1, v2, v3]: [f32; 4]) -> [f32; 4] {
    let [acy, acx, ah, aw] = anchor;
    let [gcy, gcx, gh, gw] = corner_to_center(gt);

    [
        (gcy - acy) / ah / v0,
        (gcx - acx) / aw / v1,
        (gh / ah).ln() / v2,
        (gw / aw).ln() / v3,
    ]
}

/// Matches ground truth to anchors and produces regression / classification targets.
#[derive(Debug, Clone)]
pub struct BoxEncoder<B: Backend> {
    anchors: Anchors<B>,
    variance: [f32; 4],
    match_threshold: f32,
    num_classes: usize,
}

impl<B: Backend> BoxEncoder<B> {
    pub fn new(
        anchors: Anchors<B>,
        variance: [f32; 4],
        match_threshold: f32,
        num_classes: usize,
    ) -> Self {
        Self {
            anchors,
            variance,
            match_threshold,
            num_classes,
        }
    }

    pub fn from_config(config: &SsdConfig, device: &B::Device) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let anchors = AnchorGenerator::new(&config.anchors)?.anchors(device);

        Ok(Self::new(
            anchors,
            config.prior_variance,
            config.match_threshold,
            config.num_classes,
        ))
    }

    pub fn anchors(&self) -> &Anchors<B> {
        &self.anchors
    }

    /// Encodes the ground truth of one image against every anchor.
    ///
    /// Every anchor is assigned the ground truth box it overlaps most. When that IoU is
    /// strictly greater than the match threshold the anchor takes the box's label, otherwise
    /// it is background. Offsets are always encoded against the best box.
    ///
    /// An image without objects yields all-background targets with zero scores and offsets.
    pub fn encode(
        &self,
        ground_truth: &GroundTruthSet,
    ) -> Result<EncodedTargets<B>, ValidationError> {
        ground_truth.validate(self.num_classes)?;

        let device = self.anchors.centers.device();
        let n = self.anchors.len();

        if ground_truth.is_empty() {
            return Ok(EncodedTargets {
                labels: Tensor::zeros([n], &device),
                scores: Tensor::zeros([n], &device),
                offsets: Tensor::zeros([n, 4], &device),
            });
        }

        let gt_boxes = ground_truth.boxes_tensor::<B>(&device);

        // [G, N] -> best ground truth per anchor
        let iou = get_iou(gt_boxes.clone(), self.anchors.corners.clone());
        let (scores, best) = iou.max_dim_with_indices(0);
        let scores = scores.reshape([n]);
        let best = best.reshape([n]);

        let background = scores.clone().lower_equal_elem(self.match_threshold);
        let labels = ground_truth
            .labels_tensor::<B>(&device)
            .select(0, best.clone())
            .mask_fill(background, 0);

        let matched = corners_to_centers(gt_boxes.select(0, best));
        let offsets = encode_offsets(matched, self.anchors.centers.clone(), self.variance);

        trace!(objects = ground_truth.len(), anchors = n, "encoded ground truth");

        Ok(EncodedTargets {
            labels,
            scores,
            offsets,
        })
    }

    /// Encodes every image of a batch and stacks the results.
    pub fn encode_batch(
        &self,
        batch: &[GroundTruthSet],
    ) -> Result<EncodedBatch<B>, ValidationError> {
        let targets = batch
            .iter()
            .map(|ground_truth| self.encode(ground_truth))
            .collect::<Result<Vec<_>, _>>()?;

        EncodedBatch::stack(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::GroundTruth;
    use crate::debug::assert_all_approx_eq;
    use crate::layers::FeatureLayer;
    use burn::backend::{NdArray, ndarray::NdArrayDevice};

    type B = NdArray<f32>;

    const VARIANCE: [f32; 4] = [0.1, 0.1, 0.2, 0.2];

    fn encoder(anchors: &[[f32; 4]], threshold: f32) -> BoxEncoder<B> {
        let device = NdArrayDevice::default();
        BoxEncoder::new(
            Anchors::from_centers(anchors, &device),
            VARIANCE,
            threshold,
            21,
        )
    }

    fn floats<const D: usize>(t: Tensor<B, D>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    fn ints(t: Tensor<B, 1, Int>) -> Vec<i64> {
        t.into_data().convert::<i64>().to_vec::<i64>().unwrap()
    }

    #[test]
    fn test_match_threshold_is_strict() {
        // anchor (0, 0, 0.5, 0.5) against (0, 0, 0.5, 0.25) has an IoU of exactly 0.5
        let anchors = [[0.25, 0.25, 0.5, 0.5]];
        let gt = GroundTruthSet::new(vec![GroundTruth::new(7, [0.0, 0.0, 0.5, 0.25])]);

        let at = encoder(&anchors, 0.5).encode(&gt).unwrap();
        assert_eq!(ints(at.labels), vec![0]);
        assert_all_approx_eq(&floats(at.scores), &[0.5], 1e-6);

        let below = encoder(&anchors, 0.49).encode(&gt).unwrap();
        assert_eq!(ints(below.labels), vec![7]);
        assert_all_approx_eq(&floats(below.scores), &[0.5], 1e-6);
    }

    #[test]
    fn test_best_match_and_offsets() {
        let anchors = [
            [0.5, 0.5, 0.2, 0.2],
            [0.15, 0.15, 0.3, 0.3],
            [0.9, 0.1, 0.1, 0.1],
        ];
        let gt = GroundTruthSet::new(vec![
            GroundTruth::new(3, [0.0, 0.0, 0.3, 0.3]),
            GroundTruth::new(5, [0.42, 0.41, 0.62, 0.61]),
        ]);

        let targets = encoder(&anchors, 0.5).encode(&gt).unwrap();
        assert_eq!(targets.len(), 3);
        assert_eq!(ints(targets.labels), vec![5, 3, 0]);

        let scores = floats(targets.scores);
        assert!(scores[0] > 0.5 && scores[0] < 1.0);
        assert_all_approx_eq(&scores[1..], &[1.0, 0.0], 1e-6);

        let offsets = floats(targets.offsets);
        assert_all_approx_eq(&offsets[0..4], &[1.0, 0.5, 0.0, 0.0], 1e-4);
        let expected = encode_box(anchors[0], gt.objects[1].bbox, VARIANCE);
        assert_all_approx_eq(&offsets[0..4], &expected, 1e-5);
        // perfect match encodes to zero
        assert_all_approx_eq(&offsets[4..8], &[0.0; 4], 1e-5);
    }

    #[test]
    fn test_empty_ground_truth_is_all_background() {
        let targets = encoder(&[[0.5, 0.5, 0.2, 0.2], [0.2, 0.2, 0.1, 0.1]], 0.5)
            .encode(&GroundTruthSet::default())
            .unwrap();

        assert_eq!(ints(targets.labels), vec![0, 0]);
        assert_eq!(floats(targets.scores), vec![0.0; 2]);
        assert_eq!(floats(targets.offsets), vec![0.0; 8]);
    }

    #[test]
    fn test_malformed_ground_truth_rejected() {
        let encoder = encoder(&[[0.5, 0.5, 0.2, 0.2]], 0.5);

        let flipped = GroundTruthSet::new(vec![GroundTruth::new(1, [0.6, 0.1, 0.2, 0.3])]);
        assert!(matches!(
            encoder.encode(&flipped),
            Err(ValidationError::DegenerateBox(_))
        ));

        let label = GroundTruthSet::new(vec![GroundTruth::new(30, [0.1, 0.1, 0.2, 0.3])]);
        assert!(matches!(
            encoder.encode(&label),
            Err(ValidationError::LabelOutOfRange { label: 30, .. })
        ));
    }

    #[test]
    fn test_encode_batch_and_layer_split() {
        let device = NdArrayDevice::default();
        let encoder = BoxEncoder::<B>::from_config(&SsdConfig::new(), &device).unwrap();
        let generator = AnchorGenerator::new(&SsdConfig::new().anchors).unwrap();

        let batch = vec![
            GroundTruthSet::from_pairs(&[12], &[[0.1, 0.2, 0.7, 0.6]]).unwrap(),
            GroundTruthSet::default(),
        ];

        let encoded = encoder.encode_batch(&batch).unwrap();
        assert_eq!(encoded.batch_size(), 2);
        assert_eq!(encoded.num_anchors(), 8732);
        assert_eq!(encoded.offsets.dims(), [2, 8732, 4]);

        let targets = encoder.encode(&batch[0]).unwrap();
        let range = generator.layer_ranges()[FeatureLayer::Conv8_2].clone();
        let layer = targets.layer(range);
        assert_eq!(layer.len(), 600);
        assert_eq!(layer.offsets.dims(), [600, 4]);

        // a large box is matched by at least one anchor
        let labels = ints(targets.labels);
        assert!(labels.iter().any(|l| *l == 12));
        assert!(labels.iter().all(|l| *l == 0 || *l == 12));

        assert!(matches!(
            encoder.encode_batch(&[]),
            Err(ValidationError::BatchMismatch(_))
        ));
    }
}
