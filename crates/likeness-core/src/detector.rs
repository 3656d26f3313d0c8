//! Face detection seam.
//!
//! Detection itself lives outside this crate. Callers plug their detector in
//! through [`FaceDetector`]; [`WholeFrameDetector`] covers input that is
//! already a face crop.

use crate::types::{BoundingBox, FaceImage};

pub trait FaceDetector {
    /// All faces in `frame`, in source-frame pixel coordinates.
    fn detect_faces(&self, frame: &FaceImage) -> Vec<BoundingBox>;

    /// The single most prominent face, for single-subject use.
    fn detect_largest_face(&self, frame: &FaceImage) -> Option<BoundingBox> {
        largest_face(&self.detect_faces(frame))
    }
}

/// Largest box by area; ties go to the higher confidence, then the earlier box.
pub fn largest_face(faces: &[BoundingBox]) -> Option<BoundingBox> {
    faces
        .iter()
        .filter(|b| b.area() > 0.0)
        .fold(None, |best: Option<&BoundingBox>, b| match best {
            Some(cur) if cur.area() > b.area() => Some(cur),
            Some(cur) if cur.area() == b.area() && cur.confidence >= b.confidence => Some(cur),
            _ => Some(b),
        })
        .copied()
}

/// Treats the whole frame as one face. Empty frames have no face.
#[derive(Debug, Default, Clone, Copy)]
pub struct WholeFrameDetector;

impl FaceDetector for WholeFrameDetector {
    fn detect_faces(&self, frame: &FaceImage) -> Vec<BoundingBox> {
        if frame.is_empty() {
            return Vec::new();
        }
        vec![BoundingBox::new(0.0, 0.0, frame.width() as f32, frame.height() as f32)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence: conf,
        }
    }

    struct Fixed(Vec<BoundingBox>);

    impl FaceDetector for Fixed {
        fn detect_faces(&self, _frame: &FaceImage) -> Vec<BoundingBox> {
            self.0.clone()
        }
    }

    #[test]
    fn test_largest_face_by_area() {
        let faces = [
            make_bbox(0.0, 0.0, 10.0, 10.0, 0.99),
            make_bbox(50.0, 50.0, 40.0, 30.0, 0.6),
            make_bbox(5.0, 5.0, 20.0, 20.0, 0.9),
        ];
        assert_eq!(largest_face(&faces).unwrap().width, 40.0);
    }

    #[test]
    fn test_largest_face_tie_prefers_confidence() {
        let faces = [make_bbox(0.0, 0.0, 10.0, 10.0, 0.5), make_bbox(20.0, 0.0, 10.0, 10.0, 0.8)];
        assert_eq!(largest_face(&faces).unwrap().x, 20.0);
    }

    #[test]
    fn test_largest_face_ignores_degenerate() {
        assert!(largest_face(&[make_bbox(0.0, 0.0, 0.0, 10.0, 1.0)]).is_none());
        assert!(largest_face(&[]).is_none());
    }

    #[test]
    fn test_default_detect_largest() {
        let frame = FaceImage::from_gray(100, 100, vec![0; 10_000]).unwrap();
        let detector = Fixed(vec![
            make_bbox(0.0, 0.0, 5.0, 5.0, 1.0),
            make_bbox(10.0, 10.0, 50.0, 50.0, 1.0),
        ]);
        assert_eq!(detector.detect_largest_face(&frame).unwrap().x, 10.0);
    }

    #[test]
    fn test_whole_frame() {
        let frame = FaceImage::from_gray(64, 48, vec![0; 64 * 48]).unwrap();
        let faces = WholeFrameDetector.detect_faces(&frame);
        assert_eq!(faces.len(), 1);
        assert_eq!((faces[0].width, faces[0].height), (64.0, 48.0));

        let empty = FaceImage::from_gray(0, 0, Vec::new()).unwrap();
        assert!(WholeFrameDetector.detect_largest_face(&empty).is_none());
    }
}
