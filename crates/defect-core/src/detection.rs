use line_ingest::CameraId;
use serde::{Deserialize, Serialize};

/// Axis-aligned box in image pixels, corner form.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingRegion {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingRegion {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build from the centre/size layout most YOLO-style heads emit.
    pub fn from_center_xywh(bbox: [f32; 4]) -> Self {
        let [cx, cy, w, h] = bbox;
        Self {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        (self.x1..=self.x2).contains(&x) && (self.y1..=self.y2).contains(&y)
    }

    /// Whether `other`'s top-left or bottom-right corner lies inside this box.
    pub fn holds_corner_of(&self, other: &BoundingRegion) -> bool {
        self.contains_point(other.x1, other.y1) || self.contains_point(other.x2, other.y2)
    }
}

/// Detection as returned by a detector, before it is attributed to a camera.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub defect_class: String,
    pub confidence: f32,
    pub region: BoundingRegion,
}

impl RawDetection {
    pub fn new(defect_class: impl Into<String>, confidence: f32, region: BoundingRegion) -> Self {
        Self {
            defect_class: defect_class.into(),
            confidence,
            region,
        }
    }

    pub fn observed_by(self, camera_id: CameraId) -> Detection {
        Detection {
            camera_id,
            defect_class: self.defect_class,
            confidence: self.confidence,
            region: self.region,
        }
    }
}

/// Detection attributed to the camera view that produced it. Immutable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub camera_id: CameraId,
    pub defect_class: String,
    pub confidence: f32,
    pub region: BoundingRegion,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn centre_boxes_convert_to_corners() {
        let region = BoundingRegion::from_center_xywh([50.0, 40.0, 20.0, 10.0]);
        assert_eq!(region, BoundingRegion::new(40.0, 35.0, 60.0, 45.0));
        assert_eq!(region.area(), 200.0);
    }

    #[test]
    fn inverted_boxes_have_no_area() {
        assert_eq!(BoundingRegion::new(10.0, 10.0, 5.0, 20.0).area(), 0.0);
    }

    #[test]
    fn corner_containment() {
        let roller = BoundingRegion::new(0.0, 0.0, 100.0, 50.0);
        assert!(roller.holds_corner_of(&BoundingRegion::new(90.0, 40.0, 120.0, 70.0)));
        assert!(roller.holds_corner_of(&BoundingRegion::new(-10.0, -10.0, 5.0, 5.0)));
        assert!(!roller.holds_corner_of(&BoundingRegion::new(110.0, 0.0, 130.0, 20.0)));
    }
}
