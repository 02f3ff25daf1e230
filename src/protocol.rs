//! Message contract with the detection service.
//!
//! Outbound messages are plain data-URI strings (see [`crate::encoder`]).
//! Inbound messages are JSON objects with optional `boxes` and `alerts` arrays.

use serde::Deserialize;

use crate::detection::{BoundingBox, DetectionSet};

pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.85;

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("malformed detection payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected binary message ({0} bytes)")]
    Binary(usize),
}

#[derive(Debug, Deserialize)]
struct WirePayload {
    #[serde(default)]
    boxes: Option<Vec<WireBox>>,
    #[serde(default)]
    alerts: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct WireBox {
    class: String,
    conf: f32,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
}

/// A fully parsed inbound message, ready to be applied in one step.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub detections: DetectionSet,
    /// First entry of `alerts`; any further entries are ignored.
    pub alert: Option<String>,
}

pub fn parse_update(text: &str, min_confidence: f32) -> Result<Update, PayloadError> {
    let payload: WirePayload = serde_json::from_str(text)?;

    let boxes = payload
        .boxes
        .unwrap_or_default()
        .into_iter()
        .filter(|b| b.conf >= min_confidence)
        .map(|b| BoundingBox {
            class: b.class,
            confidence: b.conf,
            x1: b.x1,
            y1: b.y1,
            x2: b.x2,
            y2: b.y2,
        })
        .collect();

    let alert = payload.alerts.and_then(|alerts| alerts.into_iter().next());

    Ok(Update {
        detections: DetectionSet::new(boxes),
        alert,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_low_confidence_boxes() -> anyhow::Result<()> {
        let update = parse_update(
            r#"{"boxes":[
                {"class":"person","conf":0.91,"x1":1,"y1":2,"x2":3,"y2":4},
                {"class":"car","conf":0.84,"x1":1,"y1":2,"x2":3,"y2":4},
                {"class":"bus","conf":0.85,"x1":5,"y1":6,"x2":7,"y2":8}
            ]}"#,
            DEFAULT_MIN_CONFIDENCE,
        )?;

        let classes: Vec<_> = update
            .detections
            .boxes()
            .iter()
            .map(|b| b.class.as_str())
            .collect();
        assert_eq!(classes, ["person", "bus"]);
        assert!(update.alert.is_none());
        Ok(())
    }

    #[test]
    fn missing_or_empty_boxes_yield_empty_set() -> anyhow::Result<()> {
        assert!(parse_update("{}", 0.85)?.detections.is_empty());
        assert!(parse_update(r#"{"boxes":[]}"#, 0.85)?.detections.is_empty());
        assert!(parse_update(r#"{"boxes":null,"alerts":[]}"#, 0.85)?
            .detections
            .is_empty());
        Ok(())
    }

    #[test]
    fn only_first_alert_is_kept() -> anyhow::Result<()> {
        let update = parse_update(
            r#"{"alerts":["Hazard: car detected!","Hazard: bus detected!"]}"#,
            0.85,
        )?;
        assert_eq!(update.alert.as_deref(), Some("Hazard: car detected!"));
        Ok(())
    }

    #[test]
    fn inverted_boxes_are_tolerated() -> anyhow::Result<()> {
        let update = parse_update(
            r#"{"boxes":[{"class":"dog","conf":0.9,"x1":50,"y1":80,"x2":10,"y2":20}]}"#,
            0.85,
        )?;
        assert_eq!(update.detections.boxes()[0].x1, 50.0);
        Ok(())
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            parse_update("not json", 0.85),
            Err(PayloadError::Json(_))
        ));
        assert!(parse_update(r#"{"boxes":[{"class":"x"}]}"#, 0.85).is_err());
        assert!(parse_update(r#"{"alerts":[1]}"#, 0.85).is_err());
    }
}
