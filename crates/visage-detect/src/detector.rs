//! The detection pipeline: one face, visible eyes, visible mouth.

use tracing::debug;

use crate::classifier::{group_candidates, ClassifierParams, FeatureClassifier};
use crate::error::DetectError;
use crate::frame::Frame;
use crate::preprocess::LumaPlane;
use crate::region::Region;

/// Face-stage thresholds matching the tuned production values.
pub const DEFAULT_FACE_PARAMS: ClassifierParams = ClassifierParams {
    min_neighbors: 5,
    min_size: (30, 30),
};

/// Eye/mouth-stage thresholds matching the tuned production values.
pub const DEFAULT_FEATURE_PARAMS: ClassifierParams = ClassifierParams {
    min_neighbors: 10,
    min_size: (15, 15),
};

/// Why a frame was not accepted. Used for logging and telemetry only;
/// callers drive state off [`DetectionResult::accepted`] alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionFailure {
    NoFace,
    MultipleFaces(usize),
    NoEyes,
    NoMouth,
}

/// Outcome of inspecting one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DetectionResult {
    pub face_found: bool,
    pub face_count: usize,
    pub eyes_found: bool,
    pub mouth_found: bool,
}

impl DetectionResult {
    /// True when exactly one face with at least one eye and one mouth
    /// region was found.
    pub fn accepted(&self) -> bool {
        self.face_found && self.eyes_found && self.mouth_found
    }

    /// The first failed stage, if any.
    pub fn failure(&self) -> Option<DetectionFailure> {
        if self.face_count == 0 {
            Some(DetectionFailure::NoFace)
        } else if self.face_count > 1 {
            Some(DetectionFailure::MultipleFaces(self.face_count))
        } else if !self.eyes_found {
            Some(DetectionFailure::NoEyes)
        } else if !self.mouth_found {
            Some(DetectionFailure::NoMouth)
        } else {
            None
        }
    }
}

/// Interface the capture gate drives.
///
/// Implementations may cache per-stream state, hence `&mut self`.
pub trait FaceDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult, DetectError>;
}

/// Cascade of increasingly specific stages: face, then eyes and mouth
/// inside the accepted face's bounding box. Short-circuits on the first
/// failed stage.
pub struct CascadeDetector {
    face: Box<dyn FeatureClassifier>,
    eyes: Box<dyn FeatureClassifier>,
    mouth: Box<dyn FeatureClassifier>,
    face_params: ClassifierParams,
    feature_params: ClassifierParams,
}

impl CascadeDetector {
    pub fn new(
        face: Box<dyn FeatureClassifier>,
        eyes: Box<dyn FeatureClassifier>,
        mouth: Box<dyn FeatureClassifier>,
    ) -> Self {
        Self {
            face,
            eyes,
            mouth,
            face_params: DEFAULT_FACE_PARAMS,
            feature_params: DEFAULT_FEATURE_PARAMS,
        }
    }

    pub fn with_params(
        mut self,
        face_params: ClassifierParams,
        feature_params: ClassifierParams,
    ) -> Self {
        self.face_params = face_params;
        self.feature_params = feature_params;
        self
    }

    fn stage(
        &self,
        classifier: &dyn FeatureClassifier,
        plane: &LumaPlane,
        window: Region,
        params: &ClassifierParams,
    ) -> Result<Vec<Region>, DetectError> {
        let raw = classifier.locate(plane, window)?;
        Ok(group_candidates(&raw, params))
    }
}

impl FaceDetector for CascadeDetector {
    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult, DetectError> {
        let plane = LumaPlane::equalized(frame);

        let faces = self.stage(self.face.as_ref(), &plane, plane.bounds(), &self.face_params)?;
        let mut result = DetectionResult {
            face_found: faces.len() == 1,
            face_count: faces.len(),
            eyes_found: false,
            mouth_found: false,
        };

        if faces.is_empty() {
            debug!("no faces found");
            return Ok(result);
        }
        if faces.len() > 1 {
            debug!(count = faces.len(), "more than one face found");
            return Ok(result);
        }
        debug!("face: ok");

        let face = faces[0];
        let eyes = self.stage(self.eyes.as_ref(), &plane, face, &self.feature_params)?;
        // Multiple detected eyes are allowed; only containment matters.
        result.eyes_found = eyes.iter().any(|e| face.contains(e));
        if !result.eyes_found {
            debug!("no eyes found");
            return Ok(result);
        }
        debug!("eyes: ok");

        let mouths = self.stage(self.mouth.as_ref(), &plane, face, &self.feature_params)?;
        result.mouth_found = mouths.iter().any(|m| face.contains(m));
        if !result.mouth_found {
            debug!("no mouth found");
            return Ok(result);
        }
        debug!("mouth: ok");

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted stage that returns a fixed set of raw candidates,
    /// repeated enough times to pass any min-neighbors threshold.
    struct Scripted(Vec<Region>);

    impl Scripted {
        fn boxes(regions: &[Region]) -> Box<dyn FeatureClassifier> {
            let raw: Vec<Region> = regions
                .iter()
                .flat_map(|r| std::iter::repeat(*r).take(12))
                .collect();
            Box::new(Scripted(raw))
        }

        fn none() -> Box<dyn FeatureClassifier> {
            Box::new(Scripted(Vec::new()))
        }
    }

    impl FeatureClassifier for Scripted {
        fn locate(&self, _plane: &LumaPlane, _window: Region) -> Result<Vec<Region>, DetectError> {
            Ok(self.0.clone())
        }
    }

    fn frame() -> Frame {
        Frame::new(vec![128u8; 320 * 240 * 3], 320, 240, 0, (1, 90000)).unwrap()
    }

    const FACE: Region = Region {
        x: 100,
        y: 60,
        width: 120,
        height: 120,
    };
    const EYE: Region = Region {
        x: 120,
        y: 90,
        width: 24,
        height: 18,
    };
    const MOUTH: Region = Region {
        x: 140,
        y: 150,
        width: 40,
        height: 20,
    };

    #[test]
    fn test_full_face_accepted() {
        let mut det = CascadeDetector::new(
            Scripted::boxes(&[FACE]),
            Scripted::boxes(&[EYE]),
            Scripted::boxes(&[MOUTH]),
        );
        let result = det.detect(&frame()).unwrap();
        assert!(result.accepted());
        assert_eq!(result.face_count, 1);
        assert!(result.failure().is_none());
    }

    #[test]
    fn test_zero_faces_rejected() {
        let mut det = CascadeDetector::new(
            Scripted::none(),
            Scripted::boxes(&[EYE]),
            Scripted::boxes(&[MOUTH]),
        );
        let result = det.detect(&frame()).unwrap();
        assert!(!result.accepted());
        assert_eq!(result.failure(), Some(DetectionFailure::NoFace));
    }

    #[test]
    fn test_two_faces_rejected_with_count() {
        let second = Region::new(10, 10, 80, 80);
        let mut det = CascadeDetector::new(
            Scripted::boxes(&[FACE, second]),
            Scripted::boxes(&[EYE]),
            Scripted::boxes(&[MOUTH]),
        );
        let result = det.detect(&frame()).unwrap();
        assert!(!result.accepted());
        assert_eq!(result.face_count, 2);
        assert_eq!(result.failure(), Some(DetectionFailure::MultipleFaces(2)));
    }

    #[test]
    fn test_missing_eyes_rejected() {
        let mut det = CascadeDetector::new(
            Scripted::boxes(&[FACE]),
            Scripted::none(),
            Scripted::boxes(&[MOUTH]),
        );
        let result = det.detect(&frame()).unwrap();
        assert!(!result.accepted());
        assert_eq!(result.failure(), Some(DetectionFailure::NoEyes));
    }

    #[test]
    fn test_missing_mouth_rejected() {
        let mut det = CascadeDetector::new(
            Scripted::boxes(&[FACE]),
            Scripted::boxes(&[EYE]),
            Scripted::none(),
        );
        let result = det.detect(&frame()).unwrap();
        assert!(!result.accepted());
        assert_eq!(result.failure(), Some(DetectionFailure::NoMouth));
    }

    #[test]
    fn test_eye_outside_face_box_does_not_count() {
        let stray_eye = Region::new(10, 10, 24, 18);
        let mut det = CascadeDetector::new(
            Scripted::boxes(&[FACE]),
            Scripted::boxes(&[stray_eye]),
            Scripted::boxes(&[MOUTH]),
        );
        let result = det.detect(&frame()).unwrap();
        assert_eq!(result.failure(), Some(DetectionFailure::NoEyes));
    }

    #[test]
    fn test_multiple_eyes_allowed() {
        let other_eye = Region::new(170, 90, 24, 18);
        let mut det = CascadeDetector::new(
            Scripted::boxes(&[FACE]),
            Scripted::boxes(&[EYE, other_eye]),
            Scripted::boxes(&[MOUTH]),
        );
        assert!(det.detect(&frame()).unwrap().accepted());
    }
}
