use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outbound payload: one or more plate hits.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlateHits {
    #[serde(rename = "plateHits", default, skip_serializing_if = "Vec::is_empty")]
    pub plates: Vec<PlateHit>,
}

/// A plate read that matched a hotlist entry, in the receiving agency's field naming.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlateHit {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "eventID")]
    pub event_id: String,
    pub event_date_time: Option<DateTime<Utc>>,
    pub plate_number: String,
    pub plate_st: String,
    pub plate_number2: String,
    pub confidence: String,
    pub vehicle_make: String,
    pub vehicle_model: String,
    pub vehicle_color: String,
    pub vehicle_size: String,
    pub vehicle_type: String,
    #[serde(rename = "cameraID")]
    pub camera_id: String,
    pub camera_name: String,
    pub camera_type: String,
    pub agency: String,
    pub ori: String,
    pub latitude: f64,
    pub longitude: f64,
    pub direction: String,
    /// Presigned link to the full vehicle image; empty when unavailable.
    pub image_vehicle: String,
    /// Presigned link to the plate crop; empty when unavailable.
    pub image_plate: String,
    pub additional_image1: String,
    pub additional_image2: String,
}
