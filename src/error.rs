use thiserror::Error;

/// Setup-time failures. These are raised before any per-batch work happens and are fatal.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigurationError {
    #[error("{field} lists {found} entries but there are {expected} feature layers")]
    LayerCountMismatch {
        field: &'static str,
        expected: usize,
        found: usize,
    },
    #[error(
        "layer {layer} declares {declared} anchor templates but its ratios produce {produced}"
    )]
    TemplateCountMismatch {
        layer: &'static str,
        declared: usize,
        produced: usize,
    },
    #[error("image size must be positive, got {0:?}")]
    NonPositiveImageSize([usize; 2]),
    #[error("layer {0} has an empty feature map")]
    EmptyFeatureMap(&'static str),
    #[error("layer {layer} has a non-positive anchor step {step}")]
    NonPositiveStep { layer: &'static str, step: f32 },
    #[error("layer {layer} has a non-positive aspect ratio {ratio}")]
    NonPositiveRatio { layer: &'static str, ratio: f32 },
    #[error("invalid scale bounds: s_min = {s_min}, s_max = {s_max}")]
    InvalidScaleBounds { s_min: f32, s_max: f32 },
    #[error("prior variance must be positive and finite, got {0:?}")]
    InvalidVariance([f32; 4]),
    #[error("{name} must lie in [0, 1], got {value}")]
    ThresholdOutOfRange { name: &'static str, value: f32 },
    #[error("{name} must be non-negative and finite, got {value}")]
    NegativeWeight { name: &'static str, value: f32 },
    #[error("at least 2 classes (background + one object class) are required, got {0}")]
    TooFewClasses(usize),
}

/// Per-record input failures. The caller decides whether to skip the record or abort.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("ground truth box has non-finite coordinates: {0:?}")]
    NonFiniteBox([f32; 4]),
    #[error("ground truth box is not normalized to [0, 1]: {0:?}")]
    BoxOutOfRange([f32; 4]),
    #[error("ground truth box has min >= max: {0:?}")]
    DegenerateBox([f32; 4]),
    #[error("label {label} is outside [0, {num_classes})")]
    LabelOutOfRange { label: usize, num_classes: usize },
    #[error("expected {expected} anchors, predictions carry {found}")]
    AnchorCountMismatch { expected: usize, found: usize },
    #[error("boxes and offsets must have 4 coordinates per row, got {0}")]
    BoxWidthMismatch(usize),
    #[error("expected {expected} classes, predictions carry {found}")]
    ClassCountMismatch { expected: usize, found: usize },
    #[error("batch dimensions disagree: {0}")]
    BatchMismatch(String),
}

#[derive(Debug, Error)]
pub enum SsdError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("tensor data error: {0}")]
    TensorData(String),
}

pub type Result<T> = std::result::Result<T, SsdError>;

impl From<burn::tensor::DataError> for SsdError {
    fn from(err: burn::tensor::DataError) -> Self {
        SsdError::TensorData(format!("{err:?}"))
    }
}
