use serde::{Deserialize, Serialize};

/// One predicted object instance, in pixel coordinates of the input image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: usize,
    pub class_name: String,
    pub confidence: f32,
    /// [x_min, y_min, x_max, y_max]
    pub bbox: [f32; 4],
}

/// Model output before class ids are resolved to names.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub class_id: usize,
    pub confidence: f32,
    pub bbox: [f32; 4],
}

impl RawDetection {
    /// Resolves the class name from the loaded label set. Ids outside the
    /// label set get a synthetic name instead of failing the request.
    pub fn with_label(self, class_names: &[String]) -> Detection {
        let class_name = class_names
            .get(self.class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", self.class_id));

        Detection {
            class_id: self.class_id,
            class_name,
            confidence: self.confidence,
            bbox: self.bbox,
        }
    }
}

/// Immutable model metadata, set once at load time and shared by all requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_name: String,
    pub class_names: Vec<String>,
    /// [width, height] expected by the model input.
    pub input_size: [u32; 2],
}
