/// PASCAL VOC classes in model id order. Index `0` is the background class.
pub const VOC_LABELS: [&str; 21] = [
    "background",
    "aeroplane",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "diningtable",
    "dog",
    "horse",
    "motorbike",
    "person",
    "pottedplant",
    "sheep",
    "sofa",
    "train",
    "tvmonitor",
];

/// Maps contiguous model class ids to human readable names.
///
/// Background is always assigned to index `0`, object classes start at `1`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassNames {
    classes: Vec<String>,
}

impl ClassNames {
    /// Creates a mapping from the object class names, in model id order starting at 1.
    pub fn new(classes: Vec<&str>) -> Self {
        ClassNames {
            classes: classes.into_iter().map(String::from).collect(),
        }
    }

    /// The 20 PASCAL VOC classes.
    pub fn voc() -> Self {
        Self::new(VOC_LABELS[1..].to_vec())
    }

    /// Generic names (`class_1`, `class_2`, ...) for a model with `num_classes` classes
    /// including background.
    pub fn numbered(num_classes: usize) -> Self {
        ClassNames {
            classes: (1..num_classes).map(|i| format!("class_{i}")).collect(),
        }
    }

    /// Returns the total number of model classes including the background class.
    pub fn count(&self) -> usize {
        self.classes.len() + 1
    }

    /// Name of a model class id, `"background"` for `0` and `None` past the last class.
    pub fn name(&self, model_id: usize) -> Option<&str> {
        match model_id {
            0 => Some("background"),
            id => self.classes.get(id - 1).map(String::as_str),
        }
    }

    /// Model id of an object class name. Ids are 1-based (0 is background).
    pub fn model_id(&self, name: &str) -> Option<usize> {
        self.classes.iter().position(|c| c == name).map(|i| i + 1)
    }

    /// Object class names ordered by model id, background excluded.
    pub fn names(&self) -> &[String] {
        &self.classes
    }
}
