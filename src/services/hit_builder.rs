//! Assembles the outbound plate-hit document for a claimed job.
//!
//! Building never fails: missing metadata yields empty fields and a presign failure
//! yields an empty image link. Retrying the whole job happens through the queue.

use crate::models::hit::{PlateHit, PlateHits};
use crate::models::job::JobDetail;
use crate::services::storage::{Presigner, PRESIGN_EXPIRY};

/// Object key prefix for full vehicle images.
pub const VEHICLE_IMAGE_PREFIX: &str = "alpr";
/// Object key prefix for plate crops.
pub const PLATE_IMAGE_PREFIX: &str = "alpr-plate";

/// Build the document for one job detail row.
pub async fn build_hit_document(detail: &JobDetail, presigner: &dyn Presigner) -> PlateHits {
    let missing = missing_required_fields(detail);
    if !missing.is_empty() {
        tracing::warn!(
            job_id = detail.job_id,
            missing = ?missing,
            "Plate hit is missing identifying fields, sending degraded document"
        );
    }

    let (image_vehicle, image_plate) = match detail.source_id.as_deref() {
        Some(source_id) => {
            let vehicle = resolve_link(
                presigner,
                detail.job_id,
                VEHICLE_IMAGE_PREFIX,
                source_id,
                detail.image_id.as_deref(),
            )
            .await;
            let plate = resolve_link(
                presigner,
                detail.job_id,
                PLATE_IMAGE_PREFIX,
                source_id,
                detail.read_id.as_deref(),
            )
            .await;
            (vehicle, plate)
        }
        None => (String::new(), String::new()),
    };

    PlateHits {
        plates: vec![PlateHit {
            id: detail.read_uid.clone(),
            event_id: text(&detail.event_id),
            event_date_time: detail.event_time,
            plate_number: text(&detail.plate_number),
            plate_st: text(&detail.plate_state),
            plate_number2: text(&detail.plate_number2),
            confidence: text(&detail.confidence),
            vehicle_make: text(&detail.vehicle_make),
            vehicle_model: text(&detail.vehicle_model),
            vehicle_color: text(&detail.vehicle_color),
            vehicle_size: text(&detail.vehicle_size),
            vehicle_type: text(&detail.vehicle_type),
            camera_id: text(&detail.camera_id),
            camera_name: text(&detail.camera_name),
            camera_type: text(&detail.camera_type),
            agency: text(&detail.agency),
            ori: text(&detail.ori),
            latitude: detail.latitude.unwrap_or_default(),
            longitude: detail.longitude.unwrap_or_default(),
            direction: text(&detail.direction),
            image_vehicle,
            image_plate,
            additional_image1: text(&detail.additional_image1),
            additional_image2: text(&detail.additional_image2),
        }],
    }
}

/// Object key layout shared by the ingestion side: `{category}/{sourceID}/{imageID}`.
pub fn image_key(category: &str, source_id: &str, image_id: &str) -> String {
    format!("{}/{}/{}", category, source_id, image_id)
}

fn missing_required_fields(detail: &JobDetail) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if is_blank(&detail.plate_number) {
        missing.push("plate_number");
    }
    if detail.event_time.is_none() {
        missing.push("event_time");
    }
    if is_blank(&detail.source_id) {
        missing.push("source_id");
    }
    missing
}

async fn resolve_link(
    presigner: &dyn Presigner,
    job_id: i64,
    category: &str,
    source_id: &str,
    image_id: Option<&str>,
) -> String {
    let Some(image_id) = image_id.filter(|id| !id.is_empty()) else {
        return String::new();
    };

    let key = image_key(category, source_id, image_id);
    match presigner.presign_get(&key, PRESIGN_EXPIRY).await {
        Ok(url) => url,
        Err(e) => {
            metrics::counter!("alert_presign_failures_total").increment(1);
            tracing::warn!(job_id, key = %key, error = %e, "Failed to presign image link");
            String::new()
        }
    }
}

fn text(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}
