use std::ops::{Index, IndexMut};

/// Feature map layers the detector draws default boxes and predictions from.
///
/// The variants are listed in the order they appear in the detection pipeline, from the
/// early high-resolution layer to the deepest 1×1 layer. That order is the enumeration
/// order of every per-anchor array in this crate: anchors, encoded targets, decoded boxes
/// and the flattened network predictions.
///
/// Relevant excerpt from
///
/// “SSD: Single Shot MultiBox Detector”
/// Authors: Wei Liu, Dragomir Anguelov, Dumitru Erhan, Christian Szegedy,
///          Scott Reed, Cheng-Yang Fu, Alexander C. Berg
/// Link (official): https://arxiv.org/abs/1512.02325
///
/// - Liu et al. - Pg 3
///
/// Multi-scale feature maps for detection
///
/// We add convolutional feature layers to the end of the truncated base network. These
/// layers decrease in size progressively and allow predictions of detections at multiple
/// scales.
///
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureLayer {
    /// `Conv4_3`: fourth VGG16 convolution block, 3×3 kernel.
    Conv4_3,
    /// `Conv7`: converted fully connected layer (originally FC7 in VGG16).
    Conv7,
    /// `Conv8_2`: additional SSD feature extraction layer.
    Conv8_2,
    /// `Conv9_2`: additional SSD feature extraction layer.
    Conv9_2,
    /// `Conv10_2`: additional SSD feature extraction layer.
    Conv10_2,
    /// `Conv11_2`: final SSD feature extraction layer.
    Conv11_2,
}

impl FeatureLayer {
    pub const COUNT: usize = 6;

    const ALL: [FeatureLayer; Self::COUNT] = [
        FeatureLayer::Conv4_3,
        FeatureLayer::Conv7,
        FeatureLayer::Conv8_2,
        FeatureLayer::Conv9_2,
        FeatureLayer::Conv10_2,
        FeatureLayer::Conv11_2,
    ];

    /// Returns all feature layers in the order used for multi-scale detection.
    pub fn as_list() -> [FeatureLayer; Self::COUNT] {
        Self::ALL
    }

    /// Position of the layer in the fixed enumeration order (0-based).
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// 1-based identifier, handy for logs and serialized layer numbering.
    pub fn get_id(&self) -> usize {
        self.index() + 1
    }

    pub fn is_last(&self) -> bool {
        self.index() == Self::COUNT - 1
    }

    pub fn name(&self) -> &'static str {
        match self {
            FeatureLayer::Conv4_3 => "Conv4_3",
            FeatureLayer::Conv7 => "Conv7",
            FeatureLayer::Conv8_2 => "Conv8_2",
            FeatureLayer::Conv9_2 => "Conv9_2",
            FeatureLayer::Conv10_2 => "Conv10_2",
            FeatureLayer::Conv11_2 => "Conv11_2",
        }
    }
}

/// One value per feature layer, indexed by [`FeatureLayer`].
///
/// Replaces name-keyed lookups of layer outputs: the array length and iteration order are
/// fixed at compile time, so anything iterating a `LayerOutputs` walks the layers in the
/// same order as the anchors.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerOutputs<T>(pub [T; FeatureLayer::COUNT]);

impl<T> LayerOutputs<T> {
    pub fn from_fn(mut f: impl FnMut(FeatureLayer) -> T) -> Self {
        LayerOutputs(std::array::from_fn(|i| f(FeatureLayer::ALL[i])))
    }

    /// Iterates `(layer, value)` pairs in the fixed layer order.
    pub fn iter(&self) -> impl Iterator<Item = (FeatureLayer, &T)> {
        FeatureLayer::ALL.into_iter().zip(self.0.iter())
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> LayerOutputs<U> {
        LayerOutputs(self.0.map(f))
    }

    pub fn into_vec(self) -> Vec<T> {
        self.0.into()
    }
}

impl<T> Index<FeatureLayer> for LayerOutputs<T> {
    type Output = T;

    fn index(&self, layer: FeatureLayer) -> &T {
        &self.0[layer.index()]
    }
}

impl<T> IndexMut<FeatureLayer> for LayerOutputs<T> {
    fn index_mut(&mut self, layer: FeatureLayer) -> &mut T {
        &mut self.0[layer.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_list_order_and_contents() {
        let layers = FeatureLayer::as_list();
        assert_eq!(layers.len(), FeatureLayer::COUNT);
        assert!(matches!(layers[0], FeatureLayer::Conv4_3));
        assert!(matches!(layers[1], FeatureLayer::Conv7));
        assert!(matches!(layers[2], FeatureLayer::Conv8_2));
        assert!(matches!(layers[3], FeatureLayer::Conv9_2));
        assert!(matches!(layers[4], FeatureLayer::Conv10_2));
        assert!(matches!(layers[5], FeatureLayer::Conv11_2));
    }

    #[test]
    fn test_get_id_is_one_based() {
        for (index, layer) in FeatureLayer::as_list().iter().enumerate() {
            assert_eq!(layer.index(), index);
            assert_eq!(layer.get_id(), index + 1);
        }
        assert!(FeatureLayer::Conv11_2.is_last());
        assert!(!FeatureLayer::Conv10_2.is_last());
    }

    #[test]
    fn test_layer_outputs_indexing() {
        let mut outputs = LayerOutputs::from_fn(|layer| layer.name().len());
        assert_eq!(outputs[FeatureLayer::Conv4_3], "Conv4_3".len());

        outputs[FeatureLayer::Conv7] = 42;
        let collected: Vec<_> = outputs.iter().map(|(layer, v)| (layer, *v)).collect();
        assert_eq!(collected[1], (FeatureLayer::Conv7, 42));
        assert_eq!(collected.len(), FeatureLayer::COUNT);
    }
}
