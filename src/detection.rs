use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Pixel-space box, carried on the wire as `[x_min, y_min, x_max, y_max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct BoundingBox {
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,
}

impl From<[i32; 4]> for BoundingBox {
    fn from(coords: [i32; 4]) -> Self {
        Self {
            x_min: coords[0],
            y_min: coords[1],
            x_max: coords[2],
            y_max: coords[3],
        }
    }
}

impl From<BoundingBox> for [i32; 4] {
    fn from(bbox: BoundingBox) -> Self {
        [bbox.x_min, bbox.y_min, bbox.x_max, bbox.y_max]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "box")]
    pub bounding_box: BoundingBox,
    pub class_name: String,
    pub confidence: f32,
}

/// One response from the detection service, possibly empty.
pub type DetectionSet = Vec<Detection>;

pub fn decode_detections(payload: &[u8]) -> Result<DetectionSet, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// Human readable summary of a response, as written to the console.
pub fn summarize(detections: &[Detection]) -> String {
    if detections.is_empty() {
        return "no objects found".to_string();
    }

    let mut summary = format!("found {} objects:", detections.len());
    for (i, det) in detections.iter().enumerate() {
        let _ = write!(
            summary,
            "\n  {}. label: {}, confidence: {:.2}%",
            i + 1,
            det.class_name,
            det.confidence * 100.0
        );
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_single_detection() {
        let payload = br#"[{"box":[10,10,50,50],"class_name":"stop_sign","confidence":0.92}]"#;
        let detections = decode_detections(payload).unwrap();

        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_name, "stop_sign");
        assert!((detections[0].confidence - 0.92).abs() < f32::EPSILON);
        assert_eq!(
            detections[0].bounding_box,
            BoundingBox {
                x_min: 10,
                y_min: 10,
                x_max: 50,
                y_max: 50
            }
        );
    }

    #[test]
    fn test_decode_empty_array() {
        let detections = decode_detections(b"[]").unwrap();
        assert!(detections.is_empty());
    }

    #[test]
    fn test_decode_rejects_malformed_payloads() {
        assert!(decode_detections(b"not json").is_err());
        assert!(decode_detections(br#"{"box":[1,2,3,4]}"#).is_err());
        assert!(decode_detections(br#"[{"box":[1,2,3],"class_name":"a","confidence":0.1}]"#).is_err());
    }

    #[test]
    fn test_box_serializes_as_array() {
        let det = Detection {
            bounding_box: [1, 2, 3, 4].into(),
            class_name: "car".to_string(),
            confidence: 0.5,
        };
        let json = serde_json::to_value(&det).unwrap();
        assert_eq!(json["box"], serde_json::json!([1, 2, 3, 4]));
    }

    #[test]
    fn test_summarize() {
        assert_eq!(summarize(&[]), "no objects found");

        let detections = vec![Detection {
            bounding_box: [0, 0, 5, 5].into(),
            class_name: "person".to_string(),
            confidence: 0.5,
        }];
        let summary = summarize(&detections);
        assert!(summary.starts_with("found 1 objects:"));
        assert!(summary.contains("label: person, confidence: 50.00%"));
    }
}
