use crate::{
    config::ModelConfig,
    detection::{ModelInfo, RawDetection},
    labels,
    model_service::{InferenceError, ModelService},
};
use image::{imageops::FilterType, RgbImage};
use ndarray::{Array, Axis, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use regex::Regex;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

/// ONNX Runtime backed detection engine. Holds a pool of sessions picked
/// round-robin; each session runs its forward pass behind a mutex since a
/// single session is not safe for concurrent invocation.
pub struct OrtModelService {
    sessions: Vec<Arc<Mutex<Session>>>,
    counter: AtomicUsize,
    output_name: String,
    info: ModelInfo,
}

impl OrtModelService {
    pub fn new(model_config: &ModelConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(
            model_config.num_instances > 0,
            "model.num_instances must be at least 1"
        );

        let model_path = model_config.get_model_path();
        let mut raw_sessions = Vec::with_capacity(model_config.num_instances);
        for _ in 0..model_config.num_instances {
            let session = Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .commit_from_file(&model_path)?;
            raw_sessions.push(session);
        }

        tracing::info!("Created {} ONNX sessions", raw_sessions.len());

        let output_name = raw_sessions[0]
            .outputs()
            .first()
            .map(|output| output.name.clone())
            .unwrap_or_else(|| "output0".to_string());
        let info = read_model_info(&raw_sessions[0], model_config);

        Ok(Self {
            sessions: raw_sessions
                .into_iter()
                .map(|session| Arc::new(Mutex::new(session)))
                .collect(),
            counter: AtomicUsize::new(0),
            output_name,
            info,
        })
    }

    fn run_forward_pass(
        &self,
        input: &Array<f32, Ix4>,
    ) -> Result<ndarray::ArrayD<f32>, InferenceError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|_| InferenceError::PoisonedSession)?;

        tracing::debug!("Handling request with session {}", index);

        let tensor_ref = TensorRef::from_array_view(input.view())?;
        let outputs = session.run(ort::inputs![tensor_ref])?;

        let (shape, data) = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;
        let array = ndarray::ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
            .map_err(|e| InferenceError::OutputShape(e.to_string()))?;

        Ok(array)
    }
}

impl ModelService for OrtModelService {
    fn infer(
        &self,
        image: &RgbImage,
        conf_threshold: f32,
        iou_threshold: f32,
    ) -> Result<Vec<RawDetection>, InferenceError> {
        let (input, ratio, padding) = preprocess(image, self.info.input_size);
        let output = self.run_forward_pass(&input)?;

        decode_output(
            &output,
            image.dimensions(),
            ratio,
            padding,
            conf_threshold,
            iou_threshold,
        )
    }

    fn info(&self) -> &ModelInfo {
        &self.info
    }
}

fn read_model_info(session: &Session, model_config: &ModelConfig) -> ModelInfo {
    let metadata = session.metadata().ok();

    let class_names = metadata
        .as_ref()
        .and_then(|m| m.custom("names"))
        .and_then(|raw| parse_names_metadata(&raw))
        .unwrap_or_else(labels::default_class_names);

    let input_size = metadata
        .as_ref()
        .and_then(|m| m.custom("imgsz"))
        .and_then(|raw| parse_imgsz_metadata(&raw))
        .unwrap_or(model_config.input_size);

    ModelInfo {
        model_name: model_config.model_name(),
        class_names,
        input_size,
    }
}

/// Parses the ultralytics `names` metadata value, a dict-like string of the
/// form `{0: 'person', 1: 'bicycle', ...}`.
fn parse_names_metadata(raw: &str) -> Option<Vec<String>> {
    let quoted = Regex::new(r#"['"]([^'"]+)['"]"#).ok()?;
    let names: Vec<String> = quoted
        .captures_iter(raw)
        .map(|capture| capture[1].to_string())
        .collect();

    if names.is_empty() {
        None
    } else {
        Some(names)
    }
}

/// Parses the ultralytics `imgsz` metadata value, e.g. `[640, 640]`.
/// The metadata order is [height, width].
fn parse_imgsz_metadata(raw: &str) -> Option<[u32; 2]> {
    let mut dims = raw
        .split(|c: char| !c.is_ascii_digit())
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<u32>().ok());

    let height = dims.next()??;
    let width = dims.next()??;

    Some([width, height])
}

/// Letterbox preprocessing: aspect-preserving resize onto a gray canvas of
/// the model input size, normalized CHW f32. Returns the tensor along with
/// the scale ratio and the (dw, dh) padding needed to map boxes back.
fn preprocess(image: &RgbImage, input_size: [u32; 2]) -> (Array<f32, Ix4>, f32, (f32, f32)) {
    let [input_width, input_height] = input_size;
    let (img_width, img_height) = image.dimensions();

    let ratio = (input_width as f32 / img_width as f32).min(input_height as f32 / img_height as f32);
    let new_width = (img_width as f32 * ratio).round() as u32;
    let new_height = (img_height as f32 * ratio).round() as u32;

    let dw = (input_width as f32 - new_width as f32) / 2.0;
    let dh = (input_height as f32 - new_height as f32) / 2.0;
    let pad_left = (dw - 0.1).round().max(0.0) as usize;
    let pad_top = (dh - 0.1).round().max(0.0) as usize;

    let resized = image::imageops::resize(image, new_width, new_height, FilterType::Triangle);

    let mut input = Array::from_elem(
        (1, 3, input_height as usize, input_width as usize),
        114.0 / 255.0,
    );
    for (x, y, pixel) in resized.enumerate_pixels() {
        let x = x as usize + pad_left;
        let y = y as usize + pad_top;
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    (input, ratio, (dw, dh))
}

/// Decodes a YOLO detection head output of shape (1, 4 + classes, anchors):
/// per anchor, the best class score is kept if it clears `conf_threshold`,
/// the box is mapped back into original pixel space and clamped, and the
/// surviving candidates go through non-max suppression.
fn decode_output(
    output: &ndarray::ArrayD<f32>,
    original_size: (u32, u32),
    ratio: f32,
    padding: (f32, f32),
    conf_threshold: f32,
    iou_threshold: f32,
) -> Result<Vec<RawDetection>, InferenceError> {
    if output.ndim() != 3 || output.shape()[0] == 0 {
        return Err(InferenceError::OutputShape(format!(
            "expected (1, features, anchors), got {:?}",
            output.shape()
        )));
    }

    let output = output.index_axis(Axis(0), 0);
    let (img_width, img_height) = original_size;
    let (pad_w, pad_h) = padding;

    let mut candidates = Vec::new();
    for anchor in output.t().axis_iter(Axis(0)) {
        let anchor: Vec<f32> = anchor.iter().copied().collect();
        let (class_id, confidence) = anchor
            .iter()
            .skip(4)
            .copied()
            .enumerate()
            .reduce(|best, next| if next.1 > best.1 { next } else { best })
            .ok_or_else(|| {
                InferenceError::OutputShape("output row carries no class scores".to_string())
            })?;

        if confidence < conf_threshold {
            continue;
        }

        let cx = anchor[0];
        let cy = anchor[1];
        let w = anchor[2];
        let h = anchor[3];

        let x_min = ((cx - w / 2.0 - pad_w) / ratio).clamp(0.0, img_width as f32);
        let y_min = ((cy - h / 2.0 - pad_h) / ratio).clamp(0.0, img_height as f32);
        let x_max = ((cx + w / 2.0 - pad_w) / ratio).clamp(0.0, img_width as f32);
        let y_max = ((cy + h / 2.0 - pad_h) / ratio).clamp(0.0, img_height as f32);

        candidates.push(RawDetection {
            class_id,
            confidence,
            bbox: [x_min, y_min, x_max, y_max],
        });
    }

    Ok(non_max_suppression(candidates, iou_threshold))
}

fn intersection(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let width = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let height = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    width * height
}

fn union(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    ((a[2] - a[0]) * (a[3] - a[1])) + ((b[2] - b[0]) * (b[3] - b[1])) - intersection(a, b)
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let union = union(a, b);
    if union > 0.0 {
        intersection(a, b) / union
    } else {
        0.0
    }
}

/// Greedy class-aware NMS: boxes of the same class overlapping a kept box
/// above `iou_threshold` are suppressed, highest confidence first.
fn non_max_suppression(
    mut candidates: Vec<RawDetection>,
    iou_threshold: f32,
) -> Vec<RawDetection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept = Vec::new();
    while !candidates.is_empty() {
        let current = candidates.remove(0);
        candidates.retain(|other| {
            other.class_id != current.class_id || iou(&current.bbox, &other.bbox) < iou_threshold
        });
        kept.push(current);
    }

    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn detection(class_id: usize, confidence: f32, bbox: [f32; 4]) -> RawDetection {
        RawDetection {
            class_id,
            confidence,
            bbox,
        }
    }

    /// Builds a (1, 4 + classes, anchors) output from per-anchor rows of
    /// [cx, cy, w, h, score_0, ..., score_n].
    fn output_from_rows(rows: &[Vec<f32>]) -> ndarray::ArrayD<f32> {
        let features = rows[0].len();
        let mut output = Array3::<f32>::zeros((1, features, rows.len()));
        for (anchor, row) in rows.iter().enumerate() {
            for (feature, value) in row.iter().enumerate() {
                output[[0, feature, anchor]] = *value;
            }
        }
        output.into_dyn()
    }

    #[test]
    fn test_preprocess_shape_and_letterbox() {
        let image = RgbImage::from_pixel(100, 50, image::Rgb([255, 0, 0]));

        let (input, ratio, (dw, dh)) = preprocess(&image, [640, 640]);

        assert_eq!(input.shape(), &[1, 3, 640, 640]);
        assert!((ratio - 6.4).abs() < 1e-6);
        assert!((dw - 0.0).abs() < 1e-6);
        assert!((dh - 160.0).abs() < 1e-6);

        // Center lands on the image, corners on the gray padding.
        assert!((input[[0, 0, 320, 320]] - 1.0).abs() < 1e-6);
        assert!((input[[0, 0, 0, 0]] - 114.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_decode_output_filters_by_confidence() {
        let output = output_from_rows(&[
            vec![320.0, 320.0, 64.0, 64.0, 0.9, 0.1],
            vec![100.0, 100.0, 32.0, 32.0, 0.2, 0.05],
        ]);

        let detections =
            decode_output(&output, (640, 640), 1.0, (0.0, 0.0), 0.25, 0.45).unwrap();

        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_id, 0);
        assert!((detections[0].confidence - 0.9).abs() < 1e-6);
        assert_eq!(detections[0].bbox, [288.0, 288.0, 352.0, 352.0]);
    }

    #[test]
    fn test_decode_output_picks_best_class() {
        let output = output_from_rows(&[vec![320.0, 320.0, 64.0, 64.0, 0.3, 0.8, 0.1]]);

        let detections =
            decode_output(&output, (640, 640), 1.0, (0.0, 0.0), 0.25, 0.45).unwrap();

        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_id, 1);
    }

    #[test]
    fn test_decode_output_clamps_boxes_to_image() {
        let output = output_from_rows(&[vec![5.0, 5.0, 30.0, 30.0, 0.9]]);

        let detections =
            decode_output(&output, (640, 640), 1.0, (0.0, 0.0), 0.25, 0.45).unwrap();

        let [x_min, y_min, x_max, y_max] = detections[0].bbox;
        assert_eq!(x_min, 0.0);
        assert_eq!(y_min, 0.0);
        assert!(x_max <= 640.0 && y_max <= 640.0);
    }

    #[test]
    fn test_decode_output_undoes_letterbox() {
        // 100x50 source letterboxed into 640x640: ratio 6.4, dh 160.
        let output = output_from_rows(&[vec![320.0, 320.0, 64.0, 64.0, 0.9]]);

        let detections =
            decode_output(&output, (100, 50), 6.4, (0.0, 160.0), 0.25, 0.45).unwrap();

        let [x_min, y_min, x_max, y_max] = detections[0].bbox;
        assert!((x_min - 45.0).abs() < 1e-4);
        assert!((y_min - 20.0).abs() < 1e-4);
        assert!((x_max - 55.0).abs() < 1e-4);
        assert!((y_max - 30.0).abs() < 1e-4);
    }

    #[test]
    fn test_raising_conf_threshold_only_removes_detections() {
        let output = output_from_rows(&[
            vec![100.0, 100.0, 40.0, 40.0, 0.9],
            vec![300.0, 300.0, 40.0, 40.0, 0.4],
            vec![500.0, 500.0, 40.0, 40.0, 0.3],
        ]);

        let low = decode_output(&output, (640, 640), 1.0, (0.0, 0.0), 0.1, 0.45).unwrap();
        let high = decode_output(&output, (640, 640), 1.0, (0.0, 0.0), 0.5, 0.45).unwrap();

        assert!(high.len() <= low.len());
        for detection in &high {
            assert!(low.contains(detection));
        }
    }

    #[test]
    fn test_decode_output_rejects_bad_shape() {
        let output = ndarray::Array2::<f32>::zeros((4, 8)).into_dyn();

        let result = decode_output(&output, (640, 640), 1.0, (0.0, 0.0), 0.25, 0.45);

        assert!(matches!(result, Err(InferenceError::OutputShape(_))));
    }

    #[test]
    fn test_nms_suppresses_same_class_overlap() {
        let candidates = vec![
            detection(0, 0.9, [0.0, 0.0, 100.0, 100.0]),
            detection(0, 0.8, [10.0, 10.0, 110.0, 110.0]),
            detection(0, 0.7, [400.0, 400.0, 500.0, 500.0]),
        ];

        let kept = non_max_suppression(candidates, 0.45);

        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
        assert!((kept[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_overlapping_boxes_of_different_classes() {
        let candidates = vec![
            detection(0, 0.9, [0.0, 0.0, 100.0, 100.0]),
            detection(1, 0.8, [10.0, 10.0, 110.0, 110.0]),
        ];

        let kept = non_max_suppression(candidates, 0.45);

        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_iou_of_disjoint_boxes_is_zero() {
        let a = [0.0, 0.0, 10.0, 10.0];
        let b = [100.0, 100.0, 110.0, 110.0];

        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn test_parse_names_metadata() {
        let raw = "{0: 'person', 1: 'bicycle', 2: 'car'}";

        let names = parse_names_metadata(raw).unwrap();

        assert_eq!(names, vec!["person", "bicycle", "car"]);
        assert!(parse_names_metadata("{}").is_none());
    }

    #[test]
    fn test_parse_imgsz_metadata() {
        assert_eq!(parse_imgsz_metadata("[640, 640]"), Some([640, 640]));
        assert_eq!(parse_imgsz_metadata("[480, 800]"), Some([800, 480]));
        assert_eq!(parse_imgsz_metadata("not a size"), None);
    }
}
