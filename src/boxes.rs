//! Box geometry shared by the encoder, decoder and detection selector.
//!
//! Every box in this crate is normalized to the input image and stored either in corner
//! form `(ymin, xmin, ymax, xmax)` or in center form `(cy, cx, h, w)`.

use burn::{
    prelude::Backend,
    tensor::{Int, Tensor, TensorData},
};

use crate::broadcast;
use crate::error::ValidationError;

/// Splits a tensor of boxes in any 4 component format into its individual components.
///
/// # Arguments
///
/// * `boxes` - Tensor of shape `[num_boxes, 4]`.
///
/// # Returns
///
/// * Tuple of four tensors `(c0, c1, c2, c3)`, each of shape `[num_boxes, 1]`.
pub fn boxes_to_components<B: Backend>(
    boxes: Tensor<B, 2>,
) -> (Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>) {
    let [n, _] = boxes.dims();
    (
        boxes.clone().slice([0..n, 0..1]),
        boxes.clone().slice([0..n, 1..2]),
        boxes.clone().slice([0..n, 2..3]),
        boxes.slice([0..n, 3..4]),
    )
}

/// Converts `[N, 4]` corner boxes `(ymin, xmin, ymax, xmax)` to center form `(cy, cx, h, w)`.
pub fn corners_to_centers<B: Backend>(boxes: Tensor<B, 2>) -> Tensor<B, 2> {
    let (ymin, xmin, ymax, xmax) = boxes_to_components(boxes);

    let h = ymax - ymin.clone();
    let w = xmax - xmin.clone();
    let cy = ymin + h.clone() * 0.5;
    let cx = xmin + w.clone() * 0.5;

    Tensor::cat(vec![cy, cx, h, w], 1)
}

/// Converts `[N, 4]` center boxes `(cy, cx, h, w)` to corner form `(ymin, xmin, ymax, xmax)`.
pub fn centers_to_corners<B: Backend>(boxes: Tensor<B, 2>) -> Tensor<B, 2> {
    let (cy, cx, h, w) = boxes_to_components(boxes);

    Tensor::cat(
        vec![
            cy.clone() - h.clone() * 0.5,
            cx.clone() - w.clone() * 0.5,
            cy + h * 0.5,
            cx + w * 0.5,
        ],
        1,
    )
}

/// Computes the Intersection over Union (IoU) between two sets of corner-form boxes.
///
/// `IoU = intersection_area / union_area`
///
/// # Arguments
/// * `a` - Tensor of shape `[G, 4]`, typically ground truth boxes.
/// * `b` - Tensor of shape `[N, 4]`, typically anchors.
///
/// # Returns
/// * `Tensor<B, 2>` - IoU matrix of shape `[G, N]` where entry `(i, j)` is the IoU between
///   box `i` of `a` and box `j` of `b`. Two zero-area boxes have an IoU of 0.
pub fn get_iou<B: Backend>(a: Tensor<B, 2>, b: Tensor<B, 2>) -> Tensor<B, 2> {
    let [g, _] = a.dims();
    let [n, _] = b.dims();

    let (aymin, axmin, aymax, axmax) = boxes_to_components(a);
    let (bymin, bxmin, bymax, bxmax) = boxes_to_components(b);

    let area_a = ((aymax.clone() - aymin.clone()) * (axmax.clone() - axmin.clone())).reshape([g]);
    let area_b = ((bymax.clone() - bymin.clone()) * (bxmax.clone() - bxmin.clone())).reshape([n]);

    // --- Intersection top-left corner ---
    let (ay, by) = broadcast::pairwise(aymin.reshape([g]), bymin.reshape([n]));
    let top = ay.max_pair(by);
    let (ax, bx) = broadcast::pairwise(axmin.reshape([g]), bxmin.reshape([n]));
    let left = ax.max_pair(bx);

    // --- Intersection bottom-right corner ---
    let (ay, by) = broadcast::pairwise(aymax.reshape([g]), bymax.reshape([n]));
    let bottom = ay.min_pair(by);
    let (ax, bx) = broadcast::pairwise(axmax.reshape([g]), bxmax.reshape([n]));
    let right = ax.min_pair(bx);

    // Clamp at 0 so disjoint boxes do not produce a negative overlap
    let intersection = (bottom - top).clamp_min(0.0) * (right - left).clamp_min(0.0);

    let (area_a, area_b) = broadcast::pairwise(area_a, area_b);
    let union = (area_a + area_b - intersection.clone()).clamp_min(f32::MIN_POSITIVE);

    intersection / union
}

/// `(cy, cx, h, w)` → `(ymin, xmin, ymax, xmax)`.
pub fn center_to_corner([cy, cx, h, w]: [f32; 4]) -> [f32; 4] {
    [cy - h * 0.5, cx - w * 0.5, cy + h * 0.5, cx + w * 0.5]
}

/// `(ymin, xmin, ymax, xmax)` → `(cy, cx, h, w)`.
pub fn corner_to_center([ymin, xmin, ymax, xmax]: [f32; 4]) -> [f32; 4] {
    let h = ymax - ymin;
    let w = xmax - xmin;
    [ymin + h * 0.5, xmin + w * 0.5, h, w]
}

pub fn area([ymin, xmin, ymax, xmax]: &[f32; 4]) -> f32 {
    (ymax - ymin).max(0.0) * (xmax - xmin).max(0.0)
}

/// IoU of two corner-form boxes.
pub fn iou_yxyx(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let top = a[0].max(b[0]);
    let left = a[1].max(b[1]);
    let bottom = a[2].min(b[2]);
    let right = a[3].min(b[3]);

    let intersection = (bottom - top).max(0.0) * (right - left).max(0.0);
    let union = area(a) + area(b) - intersection;

    if union <= 0.0 {
        return 0.0;
    }
    intersection / union
}

/// Clamps a corner-form box to the unit square.
pub fn clip_box(bbox: [f32; 4]) -> [f32; 4] {
    bbox.map(|v| v.clamp(0.0, 1.0))
}

/// One labelled object of a training image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroundTruth {
    pub label: usize,
    /// `(ymin, xmin, ymax, xmax)` normalized to `[0, 1]`.
    pub bbox: [f32; 4],
}

impl GroundTruth {
    pub fn new(label: usize, bbox: [f32; 4]) -> Self {
        Self { label, bbox }
    }

    pub fn validate(&self, num_classes: usize) -> Result<(), ValidationError> {
        let b = self.bbox;
        if b.iter().any(|v| !v.is_finite()) {
            return Err(ValidationError::NonFiniteBox(b));
        }
        if b.iter().any(|v| !(0.0..=1.0).contains(v)) {
            return Err(ValidationError::BoxOutOfRange(b));
        }
        if b[0] >= b[2] || b[1] >= b[3] {
            return Err(ValidationError::DegenerateBox(b));
        }
        if self.label >= num_classes {
            return Err(ValidationError::LabelOutOfRange {
                label: self.label,
                num_classes,
            });
        }
        Ok(())
    }
}

/// All labelled objects of one training image, in annotation order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroundTruthSet {
    pub objects: Vec<GroundTruth>,
}

impl GroundTruthSet {
    pub fn new(objects: Vec<GroundTruth>) -> Self {
        Self { objects }
    }

    /// Builds a set from parallel label / box lists of equal length.
    pub fn from_pairs(labels: &[usize], boxes: &[[f32; 4]]) -> Result<Self, ValidationError> {
        if labels.len() != boxes.len() {
            return Err(ValidationError::BatchMismatch(format!(
                "{} labels, {} boxes",
                labels.len(),
                boxes.len()
            )));
        }

        Ok(Self {
            objects: labels
                .iter()
                .zip(boxes)
                .map(|(label, bbox)| GroundTruth::new(*label, *bbox))
                .collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Validates every record, failing on the first malformed one.
    pub fn validate(&self, num_classes: usize) -> Result<(), ValidationError> {
        self.objects
            .iter()
            .try_for_each(|object| object.validate(num_classes))
    }

    /// `[G, 4]` tensor of the corner-form boxes.
    pub fn boxes_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        let flat: Vec<f32> = self.objects.iter().flat_map(|o| o.bbox).collect();
        Tensor::from_data(TensorData::new(flat, [self.len(), 4]), device)
    }

    /// `[G]` tensor of the labels.
    pub fn labels_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 1, Int> {
        let labels: Vec<i64> = self.objects.iter().map(|o| o.label as i64).collect();
        Tensor::from_data(TensorData::new(labels, [self.len()]), device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::assert_approx_eq;
    use burn::{
        backend::{NdArray, ndarray::NdArrayDevice},
        tensor::{Tolerance, ops::FloatElem},
    };

    type B = NdArray<f32>;
    type FT = FloatElem<B>;

    #[test]
    fn test_iou_known_overlap() {
        let device = &NdArrayDevice::default();

        let a = Tensor::<B, 2>::from_floats([[0.0, 0.0, 0.5, 0.5]], device);
        let b = Tensor::<B, 2>::from_floats([[0.0, 0.0, 0.25, 0.25]], device);

        Tensor::<B, 2>::from_floats([[0.25]], device)
            .into_data()
            .assert_approx_eq::<FT>(&get_iou(a, b).into_data(), Tolerance::default());

        assert_approx_eq(
            &iou_yxyx(&[0.0, 0.0, 0.5, 0.5], &[0.0, 0.0, 0.25, 0.25]),
            &0.25,
            1e-6,
        );
    }

    #[test]
    fn test_iou() {
        let device = &NdArrayDevice::default();

        let boxes1 = Tensor::<B, 2>::from_floats(
            [
                [0.12, 0.15, 0.30, 0.40],
                [0.05, 0.05, 0.25, 0.20],
                [0.33, 0.20, 0.50, 0.45],
                [0.60, 0.10, 0.85, 0.35],
            ],
            device,
        );

        let boxes2 = Tensor::<B, 2>::from_floats(
            [
                [0.10, 0.10, 0.30, 0.30],
                [0.20, 0.25, 0.40, 0.45],
                [0.60, 0.50, 0.80, 0.70],
                [0.35, 0.15, 0.55, 0.35],
                [0.50, 0.60, 0.70, 0.80],
                [0.25, 0.40, 0.45, 0.60],
            ],
            device,
        );

        let iou = get_iou(boxes1, boxes2);

        Tensor::<B, 2>::from_floats(
            [
                [0.46551722, 0.21428573, 0.0, 0.0, 0.0, 0.0],
                [0.27272725, 0.0, 0.0, 0.0, 0.0, 0.0],
                [0.0, 0.20437954, 0.0, 0.375, 0.0, 0.07843133],
                [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            ],
            device,
        )
        .into_data()
        .assert_approx_eq::<FT>(&iou.into_data(), Tolerance::default());
    }

    #[test]
    fn test_iou_host_matches_tensor() {
        let a = [0.33, 0.20, 0.50, 0.45];
        let b = [0.35, 0.15, 0.55, 0.35];
        assert_approx_eq(&iou_yxyx(&a, &b), &0.375, 1e-5);
        assert_eq!(iou_yxyx(&a, &[0.9, 0.9, 1.0, 1.0]), 0.0);
        // degenerate boxes never divide by zero
        assert_eq!(iou_yxyx(&[0.5, 0.5, 0.5, 0.5], &[0.5, 0.5, 0.5, 0.5]), 0.0);
    }

    #[test]
    fn test_center_corner_conversions() {
        let device = &NdArrayDevice::default();
        let corners = Tensor::<B, 2>::from_floats([[0.1, 0.2, 0.5, 0.8]], device);

        let centers = corners_to_centers(corners.clone());
        Tensor::<B, 2>::from_floats([[0.3, 0.5, 0.4, 0.6]], device)
            .into_data()
            .assert_approx_eq::<FT>(&centers.clone().into_data(), Tolerance::default());

        centers_to_corners(centers)
            .into_data()
            .assert_approx_eq::<FT>(&corners.into_data(), Tolerance::default());

        let host = corner_to_center([0.1, 0.2, 0.5, 0.8]);
        for (a, b) in host.iter().zip([0.3, 0.5, 0.4, 0.6]) {
            assert_approx_eq(a, &b, 1e-6);
        }
        for (a, b) in center_to_corner(host).iter().zip([0.1, 0.2, 0.5, 0.8]) {
            assert_approx_eq(a, &b, 1e-6);
        }
    }

    #[test]
    fn test_ground_truth_validation() {
        assert!(GroundTruth::new(3, [0.1, 0.1, 0.4, 0.5]).validate(21).is_ok());

        assert_eq!(
            GroundTruth::new(3, [0.4, 0.1, 0.1, 0.5]).validate(21),
            Err(ValidationError::DegenerateBox([0.4, 0.1, 0.1, 0.5]))
        );
        assert_eq!(
            GroundTruth::new(3, [0.1, 0.1, 0.1, 0.5]).validate(21),
            Err(ValidationError::DegenerateBox([0.1, 0.1, 0.1, 0.5]))
        );
        assert_eq!(
            GroundTruth::new(3, [0.1, 0.1, 1.2, 0.5]).validate(21),
            Err(ValidationError::BoxOutOfRange([0.1, 0.1, 1.2, 0.5]))
        );
        assert!(matches!(
            GroundTruth::new(3, [f32::NAN, 0.1, 0.4, 0.5]).validate(21),
            Err(ValidationError::NonFiniteBox(_))
        ));
        assert_eq!(
            GroundTruth::new(21, [0.1, 0.1, 0.4, 0.5]).validate(21),
            Err(ValidationError::LabelOutOfRange {
                label: 21,
                num_classes: 21
            })
        );
    }

    #[test]
    fn test_ground_truth_set_tensors() {
        let device = &NdArrayDevice::default();
        let boxes = [[0.1, 0.1, 0.4, 0.5], [0.5, 0.5, 0.9, 0.9]];
        let set = GroundTruthSet::from_pairs(&[4, 7], &boxes).unwrap();

        assert_eq!(set.len(), 2);
        assert!(set.validate(21).is_ok());
        assert_eq!(set.boxes_tensor::<B>(device).dims(), [2, 4]);
        assert_eq!(
            set.labels_tensor::<B>(device)
                .into_data()
                .convert::<i64>()
                .to_vec::<i64>()
                .unwrap(),
            vec![4, 7]
        );
    }

    #[test]
    fn test_from_pairs_length_mismatch() {
        let boxes = [[0.1, 0.1, 0.4, 0.5], [0.5, 0.5, 0.9, 0.9]];

        assert!(matches!(
            GroundTruthSet::from_pairs(&[1, 2, 3], &boxes),
            Err(ValidationError::BatchMismatch(_))
        ));
        assert!(GroundTruthSet::from_pairs(&[1], &boxes).is_err());
    }
}
