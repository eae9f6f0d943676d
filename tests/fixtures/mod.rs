//! Plate-read fixtures shared by the dispatcher tests.
#![allow(dead_code)]

use alpr_alerts::models::job::JobDetail;
use chrono::{TimeZone, Utc};

/// A complete read with a vehicle image but no plate crop.
pub fn abc123(job_id: i64) -> JobDetail {
    JobDetail {
        job_id,
        read_uid: format!("read-{}", job_id),
        event_id: Some(format!("evt-{}", job_id)),
        event_time: Some(Utc.with_ymd_and_hms(2025, 3, 1, 14, 5, 9).unwrap()),
        plate_number: Some("ABC123".to_string()),
        plate_state: Some("NJ".to_string()),
        confidence: Some("0.97".to_string()),
        vehicle_make: Some("Honda".to_string()),
        vehicle_color: Some("Blue".to_string()),
        camera_id: Some("cam-7".to_string()),
        camera_name: Some("Route 1 NB".to_string()),
        agency: Some("Edison PD".to_string()),
        ori: Some("NJ0120600".to_string()),
        latitude: Some(40.5187),
        longitude: Some(-74.4121),
        direction: Some("N".to_string()),
        source_id: Some("S1".to_string()),
        image_id: Some("I1".to_string()),
        read_id: None,
        ..JobDetail::default()
    }
}

/// A read with a distinct plate number, for ordering checks.
pub fn plate(job_id: i64, plate_number: &str) -> JobDetail {
    JobDetail {
        plate_number: Some(plate_number.to_string()),
        ..abc123(job_id)
    }
}
