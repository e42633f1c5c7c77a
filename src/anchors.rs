//! Default box (anchor) geometry for every feature layer.
//!
//! “SSD: Single Shot MultiBox Detector”
//! Authors: Wei Liu, Dragomir Anguelov, Dumitru Erhan, Christian Szegedy,
//!          Scott Reed, Cheng-Yang Fu, Alexander C. Berg
//! Link (official): https://arxiv.org/abs/1512.02325
//!
//! Liu et al. Pg 6, Choosing scales and aspect ratios for default boxes
//!
//! Suppose we want to use m feature maps for prediction. The scale of the default boxes for each
//! feature map is computed as:
//!
//! ```text
//!                    s_max - s_min
//!   s_k = s_min  +  ─────────────── (k - 1),   k ∈ [1, m]
//!                        m - 1
//! ```
//!
//! We impose different aspect ratios for the default boxes and compute the height and width of
//! each box as `h = s_k·√a_r`, `w = s_k/√a_r`. For the aspect ratio of 1 we also add a default
//! box whose scale is `√(s_k·s_k+1)`.

use std::ops::Range;

use burn::{
    prelude::Backend,
    tensor::{Tensor, TensorData},
};
use rayon::prelude::*;
use tracing::{debug, trace};

use crate::boxes::center_to_corner;
use crate::config::{AnchorConfig, AnchorMode};
use crate::error::ConfigurationError;
use crate::layers::{FeatureLayer, LayerOutputs};

/// Base scale of the default boxes of every layer, computed once from `s_min`/`s_max`.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxScales(Vec<f32>);

impl BoxScales {
    pub fn new(s_min: f32, s_max: f32, layers: usize, mode: AnchorMode) -> Self {
        let scales = (0..layers)
            .map(|k| {
                if k == 0 {
                    s_min
                } else if k == layers - 1 {
                    s_max
                } else {
                    // Standard numbers layers from 1, the compat table from 0
                    let step = match mode {
                        AnchorMode::Standard => k,
                        AnchorMode::ReferenceCompat => k - 1,
                    };
                    s_min + (s_max - s_min) / (layers - 1) as f32 * step as f32
                }
            })
            .collect();

        BoxScales(scales)
    }

    pub fn get(&self, k: usize) -> f32 {
        self.0[k]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

/// Immutable geometry of one feature layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerSpec {
    pub layer: FeatureLayer,
    /// `[height, width]` in grid cells.
    pub feature_map: [usize; 2],
    pub num_anchors: usize,
    pub step: f32,
    pub scale: f32,
    /// Scale of the following layer, `None` for the last one.
    pub next_scale: Option<f32>,
    pub ratios: Vec<f32>,
}

impl LayerSpec {
    /// Heights and widths of the anchor templates, in template order.
    ///
    /// Template 0 is the square box at `scale`, the last template is the square box at
    /// `√(scale·next_scale)` (or `√(scale·(scale + 1)/2)` on the last layer) and every
    /// template in between is a rectangle built from one aspect ratio.
    pub fn template_sizes(&self, mode: AnchorMode) -> (Vec<f32>, Vec<f32>) {
        let s = self.scale;
        let last = self.num_anchors - 1;

        (0..self.num_anchors)
            .map(|i| {
                if i == 0 {
                    (s, s)
                } else if i == last {
                    let extra = match self.next_scale {
                        Some(next) => (s * next).sqrt(),
                        None => (s * (s + 1.0) / 2.0).sqrt(),
                    };
                    (extra, extra)
                } else {
                    let ratio = match mode {
                        AnchorMode::Standard => self.ratios[i - 1],
                        AnchorMode::ReferenceCompat => self.ratios[self.ratios.len() - 1],
                    };
                    (s * ratio.sqrt(), s / ratio.sqrt())
                }
            })
            .unzip()
    }
}

/// Anchors of one layer, stored as separable grids.
///
/// Anchor `(r, c, a)` has center `(center_y[r·W + c], center_x[r·W + c])` and size
/// `(heights[a], widths[a])`. Its position in the layer's enumeration is `(r·W + c)·A + a`.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorSet {
    pub layer: FeatureLayer,
    pub feature_map: [usize; 2],
    pub center_y: Vec<f32>,
    pub center_x: Vec<f32>,
    pub heights: Vec<f32>,
    pub widths: Vec<f32>,
}

impl AnchorSet {
    pub fn num_templates(&self) -> usize {
        self.heights.len()
    }

    pub fn len(&self) -> usize {
        self.center_y.len() * self.num_templates()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every anchor as `(cy, cx, h, w)`: row-major grid, then template.
    pub fn to_center_form(&self) -> Vec<[f32; 4]> {
        self.center_y
            .iter()
            .zip(&self.center_x)
            .flat_map(|(&cy, &cx)| {
                self.heights
                    .iter()
                    .zip(&self.widths)
                    .map(move |(&h, &w)| [cy, cx, h, w])
            })
            .collect()
    }

    /// Every anchor as `(ymin, xmin, ymax, xmax)`, same order as [`Self::to_center_form`].
    pub fn to_corner_form(&self) -> Vec<[f32; 4]> {
        self.to_center_form()
            .into_iter()
            .map(center_to_corner)
            .collect()
    }
}

/// Concatenated anchors of all layers.
#[derive(Debug, Clone)]
pub struct Anchors<B: Backend> {
    /// `[N, 4]` as `(cy, cx, h, w)`.
    pub centers: Tensor<B, 2>,
    /// `[N, 4]` as `(ymin, xmin, ymax, xmax)`.
    pub corners: Tensor<B, 2>,
}

impl<B: Backend> Anchors<B> {
    /// Builds both tensor forms from host center-form anchors in enumeration order.
    pub fn from_centers(centers: &[[f32; 4]], device: &B::Device) -> Self {
        let n = centers.len();
        let corners: Vec<f32> = centers
            .iter()
            .flat_map(|c| center_to_corner(*c))
            .collect();
        let centers: Vec<f32> = centers.iter().flatten().copied().collect();

        Anchors {
            centers: Tensor::from_data(TensorData::new(centers, [n, 4]), device),
            corners: Tensor::from_data(TensorData::new(corners, [n, 4]), device),
        }
    }

    pub fn len(&self) -> usize {
        self.centers.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds the default boxes of every layer from a validated [`AnchorConfig`].
#[derive(Debug, Clone)]
pub struct AnchorGenerator {
    specs: LayerOutputs<LayerSpec>,
    scales: BoxScales,
    image_size: [usize; 2],
    offset: f32,
    mode: AnchorMode,
}

impl AnchorGenerator {
    pub fn new(config: &AnchorConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;

        let scales = BoxScales::new(config.s_min, config.s_max, FeatureLayer::COUNT, config.mode);

        let specs = LayerOutputs::from_fn(|layer| {
            let k = layer.index();
            LayerSpec {
                layer,
                feature_map: config.feature_map_sizes[k],
                num_anchors: config.num_anchors[k],
                step: config.anchor_steps[k],
                scale: scales.get(k),
                next_scale: (!layer.is_last()).then(|| scales.get(k + 1)),
                ratios: config.anchor_ratios[k].clone(),
            }
        });

        debug!(scales = ?scales.as_slice(), mode = ?config.mode, "box scales");

        Ok(Self {
            specs,
            scales,
            image_size: config.image_size,
            offset: config.anchor_offset,
            mode: config.mode,
        })
    }

    pub fn spec(&self, layer: FeatureLayer) -> &LayerSpec {
        &self.specs[layer]
    }

    pub fn scales(&self) -> &BoxScales {
        &self.scales
    }

    /// Anchors of one layer. Pure: repeated calls return identical values.
    pub fn generate(&self, layer: FeatureLayer) -> AnchorSet {
        let spec = &self.specs[layer];
        let [rows, cols] = spec.feature_map;
        let [img_h, img_w] = self.image_size;

        // We set the center of each default box to ((j + offset)·step / image_size), which
        // lands on the middle of a grid cell for offset = 0.5
        let (center_y, center_x): (Vec<f32>, Vec<f32>) = (0..rows)
            .flat_map(|r| (0..cols).map(move |c| (r, c)))
            .map(|(r, c)| {
                (
                    (r as f32 + self.offset) * spec.step / img_h as f32,
                    (c as f32 + self.offset) * spec.step / img_w as f32,
                )
            })
            .unzip();

        let (heights, widths) = spec.template_sizes(self.mode);

        trace!(
            layer = layer.name(),
            ?heights,
            ?widths,
            "anchor templates"
        );

        AnchorSet {
            layer,
            feature_map: spec.feature_map,
            center_y,
            center_x,
            heights,
            widths,
        }
    }

    /// Anchors of every layer in [`FeatureLayer::as_list`] order. Layers are built in
    /// parallel.
    pub fn generate_all(&self) -> Vec<AnchorSet> {
        let sets: Vec<AnchorSet> = FeatureLayer::as_list()
            .par_iter()
            .map(|layer| self.generate(*layer))
            .collect();

        for set in &sets {
            debug!(
                layer = set.layer.name(),
                grid = ?set.feature_map,
                templates = set.num_templates(),
                anchors = set.len(),
                "default boxes"
            );
        }

        sets
    }

    pub fn layer_len(&self, layer: FeatureLayer) -> usize {
        let [rows, cols] = self.specs[layer].feature_map;
        rows * cols * self.specs[layer].num_anchors
    }

    /// Total number of anchors, e.g. 8732 for SSD300.
    pub fn total_anchors(&self) -> usize {
        FeatureLayer::as_list()
            .iter()
            .map(|layer| self.layer_len(*layer))
            .sum()
    }

    /// Position of every layer's anchors in the concatenated enumeration.
    pub fn layer_ranges(&self) -> LayerOutputs<Range<usize>> {
        let mut start = 0;
        LayerOutputs::from_fn(|layer| {
            let end = start + self.layer_len(layer);
            let range = start..end;
            start = end;
            range
        })
    }

    /// Host copy of every anchor in center form, concatenated in enumeration order.
    pub fn center_form(&self) -> Vec<[f32; 4]> {
        self.generate_all()
            .iter()
            .flat_map(AnchorSet::to_center_form)
            .collect()
    }

    /// Concatenated `[N, 4]` anchor tensors for the encoder and decoder.
    pub fn anchors<B: Backend>(&self, device: &B::Device) -> Anchors<B> {
        Anchors::from_centers(&self.center_form(), device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::{assert_all_approx_eq, assert_approx_eq};
    use burn::backend::{NdArray, ndarray::NdArrayDevice};

    fn generator(mode: AnchorMode) -> AnchorGenerator {
        AnchorGenerator::new(&AnchorConfig::new().with_mode(mode)).unwrap()
    }

    #[test]
    fn test_generate_is_deterministic() {
        let generator = generator(AnchorMode::Standard);
        for layer in FeatureLayer::as_list() {
            let a = generator.generate(layer);
            let b = generator.generate(layer);

            let bits = |set: &AnchorSet| -> Vec<u32> {
                set.to_center_form()
                    .iter()
                    .flatten()
                    .map(|v| v.to_bits())
                    .collect()
            };
            assert_eq!(bits(&a), bits(&b));
        }
        assert_eq!(generator.generate_all(), generator.generate_all());
    }

    #[test]
    fn test_anchor_counts() {
        let generator = generator(AnchorMode::Standard);
        let expected = [5776, 2166, 600, 150, 36, 4];

        for (set, expected) in generator.generate_all().iter().zip(expected) {
            let [rows, cols] = set.feature_map;
            assert_eq!(set.len(), rows * cols * set.num_templates());
            assert_eq!(set.len(), expected);
            assert_eq!(set.to_corner_form().len(), expected);
        }

        // pg 4, fig. 2, Boxes: 8732 per image
        assert_eq!(generator.total_anchors(), 8732);
        assert_eq!(generator.center_form().len(), 8732);
    }

    #[test]
    fn test_first_template_is_square_at_layer_scale() {
        for mode in [AnchorMode::Standard, AnchorMode::ReferenceCompat] {
            let generator = generator(mode);
            for set in generator.generate_all() {
                let scale = generator.scales().get(set.layer.index());
                assert_eq!(set.heights[0], scale);
                assert_eq!(set.widths[0], scale);
            }
        }
    }

    #[test]
    fn test_box_scales() {
        let standard = BoxScales::new(0.15, 0.9, 6, AnchorMode::Standard);
        assert_all_approx_eq(standard.as_slice(), &[0.15, 0.3, 0.45, 0.6, 0.75, 0.9], 1e-6);

        let compat = BoxScales::new(0.15, 0.9, 6, AnchorMode::ReferenceCompat);
        assert_all_approx_eq(compat.as_slice(), &[0.15, 0.15, 0.3, 0.45, 0.6, 0.9], 1e-6);

        assert_eq!(BoxScales::new(0.2, 0.9, 1, AnchorMode::Standard).as_slice(), &[0.2]);
    }

    #[test]
    fn test_centers() {
        let generator = generator(AnchorMode::Standard);

        let set = generator.generate(FeatureLayer::Conv9_2);
        assert_eq!(set.center_y.len(), 25);
        assert_approx_eq(&set.center_y[0], &(0.5 * 64.0 / 300.0), 1e-6);
        assert_approx_eq(&set.center_x[1], &(1.5 * 64.0 / 300.0), 1e-6);
        // second row, first column
        assert_approx_eq(&set.center_y[5], &(1.5 * 64.0 / 300.0), 1e-6);
        assert_approx_eq(&set.center_x[5], &(0.5 * 64.0 / 300.0), 1e-6);

        let last = generator.generate(FeatureLayer::Conv11_2);
        assert_eq!(last.center_y, vec![0.5]);
        assert_eq!(last.center_x, vec![0.5]);
    }

    #[test]
    fn test_boundary_templates() {
        let generator = generator(AnchorMode::Standard);

        let first = generator.generate(FeatureLayer::Conv4_3);
        let s = (0.15f32 * 0.3).sqrt();
        assert_approx_eq(&first.heights[3], &s, 1e-6);
        assert_approx_eq(&first.widths[3], &s, 1e-6);

        // last layer falls back to sqrt(s_k·(s_k + 1) / 2)
        let last = generator.generate(FeatureLayer::Conv11_2);
        assert_approx_eq(&last.heights[3], &0.92466, 1e-5);
        assert_approx_eq(&last.widths[3], &0.92466, 1e-5);
    }

    #[test]
    fn test_interior_templates_standard() {
        let generator = generator(AnchorMode::Standard);
        let set = generator.generate(FeatureLayer::Conv7);

        // ratio 2 at scale 0.3
        assert_approx_eq(&set.heights[1], &0.42426, 1e-5);
        assert_approx_eq(&set.widths[1], &0.21213, 1e-5);
        // ratio 1/3
        assert_approx_eq(&set.heights[4], &(0.3 * (1.0f32 / 3.0).sqrt()), 1e-6);
        assert_approx_eq(&set.widths[4], &(0.3 / (1.0f32 / 3.0).sqrt()), 1e-6);
    }

    #[test]
    fn test_interior_templates_reference_compat() {
        let generator = generator(AnchorMode::ReferenceCompat);
        let set = generator.generate(FeatureLayer::Conv7);

        // every interior template repeats the last ratio (1/3) at scale 0.15
        let h = 0.15 * (1.0f32 / 3.0).sqrt();
        let w = 0.15 / (1.0f32 / 3.0).sqrt();
        for i in 1..5 {
            assert_approx_eq(&set.heights[i], &h, 1e-6);
            assert_approx_eq(&set.widths[i], &w, 1e-6);
        }
    }

    #[test]
    fn test_enumeration_order() {
        let generator = generator(AnchorMode::Standard);
        let set = generator.generate(FeatureLayer::Conv10_2);
        let centers = set.to_center_form();
        let a = set.num_templates();
        let [_, cols] = set.feature_map;

        // anchor (r = 1, c = 2, a = 3)
        let [cy, cx, h, w] = centers[(cols + 2) * a + 3];
        assert_eq!(cy, set.center_y[cols + 2]);
        assert_eq!(cx, set.center_x[cols + 2]);
        assert_eq!(h, set.heights[3]);
        assert_eq!(w, set.widths[3]);

        let ranges = generator.layer_ranges();
        assert_eq!(ranges[FeatureLayer::Conv4_3], 0..5776);
        assert_eq!(ranges[FeatureLayer::Conv7], 5776..7942);
        assert_eq!(ranges[FeatureLayer::Conv11_2], 8728..8732);
    }

    #[test]
    fn test_anchor_tensors() {
        let device = &NdArrayDevice::default();
        let generator = generator(AnchorMode::Standard);
        let anchors = generator.anchors::<NdArray<f32>>(device);

        assert_eq!(anchors.len(), 8732);
        assert_eq!(anchors.corners.dims(), [8732, 4]);

        let host = generator.center_form();
        let centers = anchors.centers.into_data().to_vec::<f32>().unwrap();
        assert_eq!(&centers[..4], &host[0]);

        let corners = anchors.corners.into_data().to_vec::<f32>().unwrap();
        assert_eq!(&corners[8731 * 4..], &center_to_corner(host[8731]));
    }

    #[test]
    fn test_template_mismatch_rejected() {
        let config = AnchorConfig::new().with_num_anchors(vec![4, 6, 6, 6, 4, 5]);
        assert!(matches!(
            AnchorGenerator::new(&config),
            Err(ConfigurationError::TemplateCountMismatch {
                layer: "Conv11_2",
                ..
            })
        ));
    }
}
