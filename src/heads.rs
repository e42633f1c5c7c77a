//! Layout of the network's per-layer prediction maps.
//!
//! A prediction head is a 3x3 convolution over one feature map. Its class head returns
//! `A * K` channels and its box head `A * 4` channels per grid cell, where `A` is the number of
//! anchor templates of the layer and `K` the number of classes. The helpers below flatten those
//! maps so row `(r * W + c) * A + a` holds the prediction for anchor template `a` at grid cell
//! `(r, c)`. That is the same order [`crate::anchors::AnchorSet::to_center_form`] enumerates
//! anchors in.

use burn::{prelude::Backend, tensor::Tensor};

use crate::anchors::AnchorGenerator;
use crate::error::ValidationError;
use crate::layers::{FeatureLayer, LayerOutputs};

/// Raw head outputs of one feature layer.
#[derive(Debug, Clone)]
pub struct LayerPrediction<B: Backend> {
    /// `[B, A * K, H, W]`
    pub class_map: Tensor<B, 4>,
    /// `[B, A * 4, H, W]`
    pub box_map: Tensor<B, 4>,
}

/// Reshapes a `[B, A * width, H, W]` head output to `[B, H * W * A, width]`.
fn flatten_head<B: Backend>(
    map: Tensor<B, 4>,
    width: usize,
) -> Result<Tensor<B, 3>, ValidationError> {
    let [batch_size, channels, height, map_width] = map.dims();

    if width == 0 || channels % width != 0 {
        return Err(ValidationError::ClassCountMismatch {
            expected: width,
            found: channels,
        });
    }
    let anchors = channels / width;

    // B = Batch Size
    // A = Anchor Boxes
    // H = Feature Height
    // W = Feature Width
    // K = Values per anchor (classes or 4 box offsets)
    //
    // (B, A * K, H, W) -> (B, A, K, H, W) -> (B, H, W, A, K)

    let map = map.reshape([batch_size, anchors, width, height, map_width]);
    let map = map.permute([0, 3, 4, 1, 2]);

    Ok(map.reshape([batch_size, height * map_width * anchors, width]))
}

/// `[B, A * K, H, W]` class logits → `[B, H * W * A, K]`.
pub fn flatten_class_map<B: Backend>(
    map: Tensor<B, 4>,
    num_classes: usize,
) -> Result<Tensor<B, 3>, ValidationError> {
    flatten_head(map, num_classes)
}

/// `[B, A * 4, H, W]` box offsets → `[B, H * W * A, 4]`.
pub fn flatten_box_map<B: Backend>(map: Tensor<B, 4>) -> Result<Tensor<B, 3>, ValidationError> {
    flatten_head(map, 4)
}

/// Flattens every layer's head outputs and concatenates them in [`FeatureLayer`] order.
///
/// Each layer must produce exactly as many rows as the generator has anchors for that layer,
/// otherwise predictions would silently pair with the wrong anchors.
///
/// # Returns
///
/// * `(class_logits, offsets)` - `[B, N, K]` and `[B, N, 4]`.
pub fn concat_layer_predictions<B: Backend>(
    outputs: LayerOutputs<LayerPrediction<B>>,
    num_classes: usize,
    generator: &AnchorGenerator,
) -> Result<(Tensor<B, 3>, Tensor<B, 3>), ValidationError> {
    let mut class_predictions = Vec::with_capacity(FeatureLayer::COUNT);
    let mut box_predictions = Vec::with_capacity(FeatureLayer::COUNT);
    let mut batch = None;

    for (layer, prediction) in FeatureLayer::as_list().into_iter().zip(outputs.into_vec()) {
        let classes = flatten_class_map(prediction.class_map, num_classes)?;
        let boxes = flatten_box_map(prediction.box_map)?;

        let [b, n, _] = classes.dims();
        let expected = generator.layer_len(layer);
        for found in [n, boxes.dims()[1]] {
            if found != expected {
                return Err(ValidationError::AnchorCountMismatch { expected, found });
            }
        }

        match batch {
            None => batch = Some(b),
            Some(first) if first != b || boxes.dims()[0] != b => {
                return Err(ValidationError::BatchMismatch(format!(
                    "layer {} has batch size {b}, expected {first}",
                    layer.name()
                )));
            }
            Some(_) => {}
        }

        class_predictions.push(classes);
        box_predictions.push(boxes);
    }

    Ok((
        Tensor::cat(class_predictions, 1),
        Tensor::cat(box_predictions, 1),
    ))
}
