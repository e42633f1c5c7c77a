use burn::{prelude::Backend, tensor::Tensor};

use crate::anchors::{AnchorGenerator, Anchors};
use crate::boxes::{boxes_to_components, center_to_corner, centers_to_corners};
use crate::config::SsdConfig;
use crate::error::{ConfigurationError, ValidationError};

/// Applies predicted offsets to their anchors.
///
/// This is the exact inverse of [`crate::encoder::encode_offsets`]:
///
/// ```text
///  cy = ty·v0·a_h + a_cy        h = a_h·exp(th·v2)
///  cx = tx·v1·a_w + a_cx        w = a_w·exp(tw·v3)
/// ```
///
/// # Returns
///
/// * `Tensor<B, 2>` - `[N, 4]` boxes in `(ymin, xmin, ymax, xmax)` form. Boxes are not clipped.
pub fn decode_offsets<B: Backend>(
    offsets: Tensor<B, 2>,
    anchors: Tensor<B, 2>,
    [v0, v1, v2, v3]: [f32; 4],
) -> Tensor<B, 2> {
    let (ty, tx, th, tw) = boxes_to_components(offsets);
    let (acy, acx, ah, aw) = boxes_to_components(anchors);

    let cy = ty * v0 * ah.clone() + acy;
    let cx = tx * v1 * aw.clone() + acx;
    let h = (th * v2).exp() * ah;
    let w = (tw * v3).exp() * aw;

    centers_to_corners(Tensor::cat(vec![cy, cx, h, w], 1))
}

/// Host version of [`decode_offsets`] for a single center-form anchor.
pub fn decode_box(anchor: [f32; 4], offset: [f32; 4], [v0, v1, v2, v3]: [f32; 4]) -> [f32; 4] {
    let [acy, acx, ah, aw] = anchor;
    let [ty, tx, th, tw] = offset;

    center_to_corner([
        ty * v0 * ah + acy,
        tx * v1 * aw + acx,
        ah * (th * v2).exp(),
        aw * (tw * v3).exp(),
    ])
}

#[derive(Debug, Clone)]
pub struct BoxDecoder<B: Backend> {
    anchors: Anchors<B>,
    variance: [f32; 4],
}

impl<B: Backend> BoxDecoder<B> {
    pub fn new(anchors: Anchors<B>, variance: [f32; 4]) -> Self {
        Self { anchors, variance }
    }

    pub fn from_config(config: &SsdConfig, device: &B::Device) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let anchors = AnchorGenerator::new(&config.anchors)?.anchors(device);
        Ok(Self::new(anchors, config.prior_variance))
    }

    pub fn anchors(&self) -> &Anchors<B> {
        &self.anchors
    }

    /// Decodes the `[N, 4]` offsets of one image into corner-form boxes.
    pub fn decode(&self, offsets: Tensor<B, 2>) -> Result<Tensor<B, 2>, ValidationError> {
        let [found, width] = offsets.dims();
        self.check_shape(found, width)?;

        Ok(decode_offsets(
            offsets,
            self.anchors.centers.clone(),
            self.variance,
        ))
    }

    /// Decodes `[batch, N, 4]` offsets, sharing the anchors across the batch.
    pub fn decode_batch(&self, offsets: Tensor<B, 3>) -> Result<Tensor<B, 3>, ValidationError> {
        let [batch, found, width] = offsets.dims();
        self.check_shape(found, width)?;

        let anchors = self
            .anchors
            .centers
            .clone()
            .unsqueeze_dim::<3>(0)
            .expand([batch, found, 4])
            .reshape([batch * found, 4]);

        let boxes = decode_offsets(offsets.reshape([batch * found, 4]), anchors, self.variance);
        Ok(boxes.reshape([batch, found, 4]))
    }

    fn check_shape(&self, found: usize, width: usize) -> Result<(), ValidationError> {
        if width != 4 {
            return Err(ValidationError::BoxWidthMismatch(width));
        }
        let expected = self.anchors.len();
        if found != expected {
            return Err(ValidationError::AnchorCountMismatch { expected, found });
        }
        Ok(())
    }
}
