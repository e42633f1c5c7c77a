use argh::FromArgs;
use burn::config::Config;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::layers::FeatureLayer;

/// How the interior (non-square) anchor templates of a layer are sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnchorMode {
    /// Template `i` (1 ≤ i ≤ A−2) uses aspect ratio `i − 1` of the layer, and the box
    /// scale table is evenly spaced from `s_min` to `s_max`.
    Standard,
    /// Reproduces the table an existing set of trained weights was produced with: every
    /// interior template takes the *last* configured aspect ratio of the layer, and the
    /// interior box scales use the 0-based layer index (so layer 1 repeats `s_min`).
    ReferenceCompat,
}

/// Default box geometry for every feature layer.
///
/// “SSD: Single Shot MultiBox Detector”
/// Authors: Wei Liu, Dragomir Anguelov, Dumitru Erhan, Christian Szegedy,
///          Scott Reed, Cheng-Yang Fu, Alexander C. Berg
/// Link (official): https://arxiv.org/abs/1512.02325
///
/// Default boxes and aspect ratios - Section 2.2
///
/// The per-layer lists are ordered like [`FeatureLayer::as_list`]. The defaults describe
/// SSD300: six layers of 38², 19², 10², 5², 3² and 1² cells.
#[derive(Config, Debug)]
pub struct AnchorConfig {
    /// Input image size as `[height, width]` in pixels.
    #[config(default = "[300, 300]")]
    pub image_size: [usize; 2],
    /// Feature map size per layer as `[height, width]` in grid cells.
    #[config(default = "vec![[38, 38], [19, 19], [10, 10], [5, 5], [3, 3], [1, 1]]")]
    pub feature_map_sizes: Vec<[usize; 2]>,
    /// Anchor templates per grid cell, per layer.
    #[config(default = "vec![4, 6, 6, 6, 4, 4]")]
    pub num_anchors: Vec<usize>,
    /// Distance between two neighbouring cell centers in input pixels, per layer.
    #[config(default = "vec![8.0, 16.0, 32.0, 64.0, 100.0, 300.0]")]
    pub anchor_steps: Vec<f32>,
    /// Position of the anchor center inside its cell, in cell units.
    #[config(default = 0.5)]
    pub anchor_offset: f32,
    #[config(default = 0.15)]
    pub s_min: f32,
    #[config(default = 0.9)]
    pub s_max: f32,
    /// Aspect ratios of the interior templates, per layer.
    #[config(
        default = "vec![vec![2.0, 0.5], vec![2.0, 3.0, 0.5, 1.0 / 3.0], vec![2.0, 3.0, 0.5, 1.0 / 3.0], vec![2.0, 3.0, 0.5, 1.0 / 3.0], vec![2.0, 0.5], vec![2.0, 0.5]]"
    )]
    pub anchor_ratios: Vec<Vec<f32>>,
    #[config(default = "AnchorMode::Standard")]
    pub mode: AnchorMode,
}

impl AnchorConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let expected = FeatureLayer::COUNT;
        let lengths = [
            ("feature_map_sizes", self.feature_map_sizes.len()),
            ("num_anchors", self.num_anchors.len()),
            ("anchor_steps", self.anchor_steps.len()),
            ("anchor_ratios", self.anchor_ratios.len()),
        ];
        for (field, found) in lengths {
            if found != expected {
                return Err(ConfigurationError::LayerCountMismatch {
                    field,
                    expected,
                    found,
                });
            }
        }

        if self.image_size.contains(&0) {
            return Err(ConfigurationError::NonPositiveImageSize(self.image_size));
        }

        let bounds_ok = self.s_min.is_finite()
            && self.s_max.is_finite()
            && self.s_min > 0.0
            && self.s_max > 0.0
            && self.s_min <= self.s_max;
        if !bounds_ok {
            return Err(ConfigurationError::InvalidScaleBounds {
                s_min: self.s_min,
                s_max: self.s_max,
            });
        }

        if !self.anchor_offset.is_finite() || !(0.0..=1.0).contains(&self.anchor_offset) {
            return Err(ConfigurationError::ThresholdOutOfRange {
                name: "anchor_offset",
                value: self.anchor_offset,
            });
        }

        for layer in FeatureLayer::as_list() {
            let i = layer.index();

            if self.feature_map_sizes[i].contains(&0) {
                return Err(ConfigurationError::EmptyFeatureMap(layer.name()));
            }

            let step = self.anchor_steps[i];
            if !step.is_finite() || step <= 0.0 {
                return Err(ConfigurationError::NonPositiveStep {
                    layer: layer.name(),
                    step,
                });
            }

            if let Some(&ratio) = self.anchor_ratios[i]
                .iter()
                .find(|r| !r.is_finite() || **r <= 0.0)
            {
                return Err(ConfigurationError::NonPositiveRatio {
                    layer: layer.name(),
                    ratio,
                });
            }

            // One square box at s_k, one per ratio, one square box at sqrt(s_k * s_k+1)
            let produced = self.anchor_ratios[i].len() + 2;
            if produced != self.num_anchors[i] {
                return Err(ConfigurationError::TemplateCountMismatch {
                    layer: layer.name(),
                    declared: self.num_anchors[i],
                    produced,
                });
            }
        }

        Ok(())
    }
}

/// Weights of the multibox objective.
#[derive(Config, Debug)]
pub struct MultiboxLossConfig {
    /// Maximum number of hard negatives kept per positive anchor.
    #[config(default = 3.0)]
    pub negative_ratio: f32,
    /// Weight of the localization term.
    #[config(default = 1.0)]
    pub alpha: f32,
    /// Probability mass spread uniformly over all classes in the cross entropy target.
    #[config(default = 0.0)]
    pub label_smoothing: f32,
}

impl MultiboxLossConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (name, value) in [("negative_ratio", self.negative_ratio), ("alpha", self.alpha)] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigurationError::NegativeWeight { name, value });
            }
        }
        check_unit_interval("label_smoothing", self.label_smoothing)
    }
}

/// Post-inference candidate selection.
#[derive(Config, Debug)]
pub struct DetectionConfig {
    /// Candidates whose best class probability does not exceed this are dropped.
    #[config(default = 0.01)]
    pub score_threshold: f32,
    /// Boxes overlapping a kept box by more than this IoU are suppressed.
    #[config(default = 0.5)]
    pub nms_threshold: f32,
    /// Maximum detections returned per image.
    #[config(default = 200)]
    pub top_k: usize,
    /// Only suppress boxes that share the class of the kept box.
    #[config(default = true)]
    pub class_aware: bool,
}

impl DetectionConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        check_unit_interval("score_threshold", self.score_threshold)?;
        check_unit_interval("nms_threshold", self.nms_threshold)
    }
}

/// Complete detector configuration: anchor geometry, box coding, loss and selection.
#[derive(Config, Debug)]
pub struct SsdConfig {
    #[config(default = "AnchorConfig::new()")]
    pub anchors: AnchorConfig,
    #[config(default = "MultiboxLossConfig::new()")]
    pub loss: MultiboxLossConfig,
    #[config(default = "DetectionConfig::new()")]
    pub detection: DetectionConfig,
    /// Number of classes including background (index 0).
    #[config(default = 21)]
    pub num_classes: usize,
    /// Scaling applied to `(cy, cx, h, w)` offsets when encoding and decoding.
    #[config(default = "[0.1, 0.1, 0.2, 0.2]")]
    pub prior_variance: [f32; 4],
    /// An anchor is positive when its best IoU is strictly greater than this.
    #[config(default = 0.5)]
    pub match_threshold: f32,
}

impl SsdConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.anchors.validate()?;
        self.loss.validate()?;
        self.detection.validate()?;

        if self.num_classes < 2 {
            return Err(ConfigurationError::TooFewClasses(self.num_classes));
        }
        if self.prior_variance.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(ConfigurationError::InvalidVariance(self.prior_variance));
        }
        check_unit_interval("match_threshold", self.match_threshold)
    }
}

fn check_unit_interval(name: &'static str, value: f32) -> Result<(), ConfigurationError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigurationError::ThresholdOutOfRange { name, value })
    }
}

#[derive(FromArgs, PartialEq, Debug)]
/// Inspect SSD default boxes and post-process raw detector outputs.
pub struct SsdCmd {
    #[argh(subcommand)]
    pub commands: Commands,
    #[argh(option)]
    /// path to an SsdConfig JSON file (defaults to SSD300 / 21 classes)
    pub config: Option<String>,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
pub enum Commands {
    Anchors(SubCommandAnchors),
    Detect(SubCommandDetect),
}

#[derive(FromArgs, PartialEq, Debug)]
/// Print the default box table for every feature layer
#[argh(subcommand, name = "anchors")]
pub struct SubCommandAnchors {}

#[derive(FromArgs, PartialEq, Debug)]
/// Decode and select detections from one image's raw predictions
#[argh(subcommand, name = "detect")]
pub struct SubCommandDetect {
    #[argh(option)]
    /// JSON file holding `class_logits` [N][K] and `offsets` [N][4]
    pub p: String,
    #[argh(option)]
    /// iou overlap - how much do predicted boxes needs to overlap to be considered a single box
    pub i: Option<f32>,
    #[argh(option)]
    /// classification confidence level score
    pub c: Option<f32>,
}
