//! Validation webhook handlers
//!
//! `POST /validate` takes an `AdmissionReview`, turns it into a
//! [`ReviewRequest`] for the validation gate and answers with the verdict.

use axum::{extract::State, routing::post, Json, Router};
use kube::core::admission::{self, AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::controlplane::metrics::Metrics;
use crate::crd::PoolCluster;
use crate::error::Result;
use crate::validation::{Operation, ReviewRequest, ReviewTarget, ValidationGate};

/// Kind of the volume configuration objects the webhook is registered for
pub const VOLUME_CONFIG_KIND: &str = "VolumeConfig";

/// Shared state of the webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    pub gate: Arc<ValidationGate>,
    pub metrics: Metrics,
}

/// Builds the webhook router
pub struct WebhookRouter {
    state: WebhookState,
}

impl WebhookRouter {
    pub fn new(gate: Arc<ValidationGate>, metrics: Metrics) -> Self {
        Self {
            state: WebhookState { gate, metrics },
        }
    }

    pub fn build(self) -> Router {
        Router::new()
            .route("/validate", post(validate))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state)
    }
}

async fn validate(
    State(state): State<WebhookState>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "invalid admission review");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = AdmissionResponse::from(&req);
    let kind = req.kind.kind.clone();
    let response = match review_request(&req) {
        Ok(request) => {
            let verdict = state.gate.review(&request).await;
            state.metrics.record_admission(&kind, verdict.allowed);
            if verdict.allowed {
                debug!(kind = %kind, name = %req.name, operation = ?req.operation, "admitted");
                response
            } else {
                let reason = verdict.reason.unwrap_or_default();
                info!(kind = %kind, name = %req.name, operation = ?req.operation, %reason, "denied");
                response.deny(reason)
            }
        }
        Err(e) => {
            state.metrics.record_admission(&kind, false);
            response.deny(format!("cannot decode {}: {}", kind, e))
        }
    };
    Json(response.into_review())
}

/// Translate an admission request into the gate's terms
pub fn review_request(req: &AdmissionRequest<DynamicObject>) -> Result<ReviewRequest> {
    let operation = match req.operation {
        admission::Operation::Create => Operation::Create,
        admission::Operation::Update => Operation::Update,
        admission::Operation::Delete => Operation::Delete,
        admission::Operation::Connect => Operation::Connect,
    };

    let target = match req.kind.kind.as_str() {
        "PoolCluster" => ReviewTarget::PoolCluster {
            old: req.old_object.as_ref().map(parse_cluster).transpose()?,
            new: req.object.as_ref().map(parse_cluster).transpose()?,
        },
        "Namespace" => ReviewTarget::Namespace(req.name.clone()),
        VOLUME_CONFIG_KIND => ReviewTarget::VolumeConfig,
        "PersistentVolumeClaim" => ReviewTarget::VolumeClaim,
        other => ReviewTarget::Other(other.to_string()),
    };
    Ok(ReviewRequest { operation, target })
}

fn parse_cluster(obj: &DynamicObject) -> Result<Box<PoolCluster>> {
    let value = serde_json::to_value(obj)?;
    Ok(Box::new(serde_json::from_value(value)?))
}
