//! ONNX-Runtime-backed classifier stages (BlazeFace).
//!
//! One BlazeFace session serves all three cascade stages: the face stage
//! emits raw anchor boxes (pre-grouping, so min-neighbors agreement does
//! the deduplication), and the eye/mouth stages emit small regions around
//! the corresponding BlazeFace keypoints inside the search window.

use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::classifier::FeatureClassifier;
use crate::error::DetectError;
use crate::preprocess::LumaPlane;
use crate::region::Region;

/// BlazeFace model input resolution.
const INPUT_SIZE: u32 = 128;

/// Default confidence threshold for raw anchor hits.
pub const DEFAULT_CONFIDENCE: f32 = 0.5;

/// Number of BlazeFace anchors (short-range model).
const NUM_ANCHORS: usize = 896;

/// Values per anchor in the regressor output: 4 box deltas + 6 keypoints.
const REGRESSOR_STRIDE: usize = 16;

/// Keypoint slots in the regressor output.
const KEYPOINT_RIGHT_EYE: usize = 0;
const KEYPOINT_LEFT_EYE: usize = 1;
const KEYPOINT_MOUTH: usize = 3;

/// A shared BlazeFace session plus its anchor table.
pub struct BlazeFaceModel {
    session: Mutex<ort::session::Session>,
    anchors: Vec<[f32; 2]>,
    confidence: f32,
}

/// One raw BlazeFace hit, in plane coordinates.
struct RawHit {
    bbox: Region,
    eyes: [Region; 2],
    mouth: Region,
}

impl BlazeFaceModel {
    /// Load a BlazeFace (short-range) ONNX model from disk.
    pub fn load(model_path: &Path) -> Result<Arc<Self>, DetectError> {
        Self::load_with_confidence(model_path, DEFAULT_CONFIDENCE)
    }

    /// Load with a custom confidence threshold for raw anchor hits.
    pub fn load_with_confidence(
        model_path: &Path,
        confidence: f32,
    ) -> Result<Arc<Self>, DetectError> {
        let session = ort::session::Session::builder()
            .and_then(|b| b.commit_from_file(model_path))
            .map_err(|e| DetectError::Model(e.to_string()))?;
        Ok(Arc::new(Self {
            session: Mutex::new(session),
            anchors: generate_anchors(),
            confidence,
        }))
    }

    /// Run inference over `window` and decode every hit above the
    /// confidence threshold. No NMS: the cascade's grouping stage is the
    /// deduplicator.
    fn run(&self, plane: &LumaPlane, window: Region) -> Result<Vec<RawHit>, DetectError> {
        let tensor = preprocess(plane, window, INPUT_SIZE);
        let input = ort::value::Tensor::from_array(tensor)
            .map_err(|e| DetectError::Model(e.to_string()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectError::Model("session lock poisoned".into()))?;
        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| DetectError::Model(e.to_string()))?;
        if outputs.len() < 2 {
            return Err(DetectError::Model(format!(
                "BlazeFace model expected 2 outputs, got {}",
                outputs.len()
            )));
        }

        let regressors = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e| DetectError::Model(e.to_string()))?;
        let scores = outputs[1]
            .try_extract_array::<f32>()
            .map_err(|e| DetectError::Model(e.to_string()))?;
        let reg_data = regressors
            .as_slice()
            .ok_or_else(|| DetectError::Model("cannot view regressor slice".into()))?;
        let score_data = scores
            .as_slice()
            .ok_or_else(|| DetectError::Model("cannot view score slice".into()))?;

        let mut hits = Vec::new();
        let num_anchors = self.anchors.len().min(NUM_ANCHORS);
        for (i, &raw_score) in score_data.iter().enumerate().take(num_anchors) {
            if sigmoid(raw_score) < self.confidence {
                continue;
            }
            let reg_offset = i * REGRESSOR_STRIDE;
            if reg_offset + REGRESSOR_STRIDE > reg_data.len() {
                break;
            }
            hits.push(decode_hit(
                &self.anchors[i],
                &reg_data[reg_offset..reg_offset + REGRESSOR_STRIDE],
                window,
            ));
        }
        Ok(hits)
    }
}

/// Which feature a stage extracts from the shared BlazeFace output.
#[derive(Clone, Copy, Debug)]
pub enum BlazeFaceStageKind {
    Face,
    Eyes,
    Mouth,
}

/// A [`FeatureClassifier`] view over a shared [`BlazeFaceModel`].
pub struct BlazeFaceStage {
    model: Arc<BlazeFaceModel>,
    kind: BlazeFaceStageKind,
}

impl BlazeFaceStage {
    pub fn new(model: Arc<BlazeFaceModel>, kind: BlazeFaceStageKind) -> Self {
        Self { model, kind }
    }
}

impl FeatureClassifier for BlazeFaceStage {
    fn locate(&self, plane: &LumaPlane, window: Region) -> Result<Vec<Region>, DetectError> {
        let hits = self.model.run(plane, window)?;
        let regions = match self.kind {
            BlazeFaceStageKind::Face => hits.into_iter().map(|h| h.bbox).collect(),
            BlazeFaceStageKind::Eyes => hits
                .into_iter()
                .flat_map(|h| h.eyes.into_iter())
                .collect(),
            BlazeFaceStageKind::Mouth => hits.into_iter().map(|h| h.mouth).collect(),
        };
        Ok(regions)
    }
}

/// Build the three cascade stages over one loaded model.
pub fn cascade_stages(
    model: Arc<BlazeFaceModel>,
) -> (
    Box<dyn FeatureClassifier>,
    Box<dyn FeatureClassifier>,
    Box<dyn FeatureClassifier>,
) {
    (
        Box::new(BlazeFaceStage::new(model.clone(), BlazeFaceStageKind::Face)),
        Box::new(BlazeFaceStage::new(model.clone(), BlazeFaceStageKind::Eyes)),
        Box::new(BlazeFaceStage::new(model, BlazeFaceStageKind::Mouth)),
    )
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode one anchor's regressor values into plane-coordinate regions.
fn decode_hit(anchor: &[f32; 2], reg: &[f32], window: Region) -> RawHit {
    let ww = window.width as f32;
    let wh = window.height as f32;

    let cx = anchor[0] + reg[0] / INPUT_SIZE as f32;
    let cy = anchor[1] + reg[1] / INPUT_SIZE as f32;
    let w = reg[2] / INPUT_SIZE as f32;
    let h = reg[3] / INPUT_SIZE as f32;

    let x1 = ((cx - w / 2.0) * ww).max(0.0);
    let y1 = ((cy - h / 2.0) * wh).max(0.0);
    let x2 = ((cx + w / 2.0) * ww).min(ww);
    let y2 = ((cy + h / 2.0) * wh).min(wh);

    let bbox = Region::new(
        window.x + x1 as i32,
        window.y + y1 as i32,
        (x2 - x1) as i32,
        (y2 - y1) as i32,
    );

    let keypoint = |slot: usize| {
        let kx = anchor[0] + reg[4 + slot * 2] / INPUT_SIZE as f32;
        let ky = anchor[1] + reg[4 + slot * 2 + 1] / INPUT_SIZE as f32;
        (window.x + (kx * ww) as i32, window.y + (ky * wh) as i32)
    };

    RawHit {
        bbox,
        eyes: [
            keypoint_region(keypoint(KEYPOINT_RIGHT_EYE), bbox.width / 5, bbox.height / 7),
            keypoint_region(keypoint(KEYPOINT_LEFT_EYE), bbox.width / 5, bbox.height / 7),
        ],
        mouth: keypoint_region(keypoint(KEYPOINT_MOUTH), bbox.width / 3, bbox.height / 5),
    }
}

/// Small box centered on a keypoint.
fn keypoint_region(center: (i32, i32), width: i32, height: i32) -> Region {
    Region::new(center.0 - width / 2, center.1 - height / 2, width, height)
}

// ---------------------------------------------------------------------------
// Preprocessing
// ---------------------------------------------------------------------------

/// Crop `window` from the luma plane, resize to `size x size`, replicate
/// to 3 channels and normalize to [0,1] NCHW float32.
fn preprocess(plane: &LumaPlane, window: Region, size: u32) -> ndarray::Array4<f32> {
    let s = size as usize;
    let wx = window.x.max(0) as usize;
    let wy = window.y.max(0) as usize;
    let ww = (window.width.max(1) as usize).min(plane.width() as usize - wx);
    let wh = (window.height.max(1) as usize).min(plane.height() as usize - wy);

    let mut tensor = ndarray::Array4::<f32>::zeros((1, 3, s, s));
    for y in 0..s {
        let src_y = wy + (((y as f64 + 0.5) * wh as f64 / s as f64) as usize).min(wh - 1);
        for x in 0..s {
            let src_x = wx + (((x as f64 + 0.5) * ww as f64 / s as f64) as usize).min(ww - 1);
            let v = plane.value(src_x as u32, src_y as u32) as f32 / 255.0;
            for c in 0..3 {
                tensor[[0, c, y, x]] = v;
            }
        }
    }
    tensor
}

// ---------------------------------------------------------------------------
// Anchor generation (BlazeFace short-range)
// ---------------------------------------------------------------------------

/// Generate BlazeFace anchors for the short-range model.
///
/// Two feature map sizes: 16x16 and 8x8, with 2 and 6 anchors per cell.
fn generate_anchors() -> Vec<[f32; 2]> {
    let strides = [(8, 2), (16, 6)]; // (stride, anchors_per_cell)
    let mut anchors = Vec::with_capacity(NUM_ANCHORS);

    for &(stride, num) in &strides {
        let grid_size = INPUT_SIZE as usize / stride;
        for y in 0..grid_size {
            for x in 0..grid_size {
                let cx = (x as f32 + 0.5) / grid_size as f32;
                let cy = (y as f32 + 0.5) / grid_size as f32;
                for _ in 0..num {
                    anchors.push([cx, cy]);
                }
            }
        }
    }

    anchors
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    #[test]
    fn test_generate_anchors_count() {
        // 16x16 grid x 2 anchors + 8x8 grid x 6 anchors = 512 + 384 = 896
        assert_eq!(generate_anchors().len(), NUM_ANCHORS);
    }

    #[test]
    fn test_anchors_in_unit_range() {
        for a in generate_anchors() {
            assert!(a[0] > 0.0 && a[0] < 1.0);
            assert!(a[1] > 0.0 && a[1] < 1.0);
        }
    }

    #[test]
    fn test_sigmoid_midpoint() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(10.0) > 0.999);
        assert!(sigmoid(-10.0) < 0.001);
    }

    #[test]
    fn test_preprocess_shape_and_range() {
        let frame = Frame::new(vec![255u8; 200 * 100 * 3], 200, 100, 0, (1, 90000)).unwrap();
        let plane = LumaPlane::from_frame(&frame);
        let tensor = preprocess(&plane, plane.bounds(), INPUT_SIZE);
        assert_eq!(tensor.shape(), &[1, 3, 128, 128]);
        assert!((tensor[[0, 0, 0, 0]] - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_keypoint_region_is_centered() {
        let r = keypoint_region((100, 60), 20, 10);
        assert_eq!((r.x, r.y, r.width, r.height), (90, 55, 20, 10));
    }

    #[test]
    fn test_decode_hit_maps_into_window() {
        let anchor = [0.5f32, 0.5];
        // Zero deltas put the box center mid-window with zero size;
        // widen via reg[2]/reg[3].
        let mut reg = [0f32; REGRESSOR_STRIDE];
        reg[2] = 64.0; // w = 0.5 of window
        reg[3] = 64.0;
        let window = Region::new(10, 20, 200, 100);
        let hit = decode_hit(&anchor, &reg, window);
        assert_eq!(hit.bbox.x, 10 + 50);
        assert_eq!(hit.bbox.y, 20 + 25);
        assert_eq!(hit.bbox.width, 100);
        assert_eq!(hit.bbox.height, 50);
        assert!(window.contains(&hit.bbox));
    }
}
