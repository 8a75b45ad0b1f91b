use std::collections::HashMap;
use std::sync::Arc;

use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::geo;
use crate::model::{Model, PingRecord};

pub async fn run_server(model: Arc<RwLock<Model>>, port: u16) {
    let app = Router::new()
        .route(
            "/eta",
            get({
                let model = model.clone();
                move || get_eta_table(model.clone())
            }),
        )
        .route(
            "/positions",
            get({
                let model = model.clone();
                move || get_positions(model.clone())
            }),
        )
        .route("/health", get(health_check));

    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

/// One entry per seeded stop. Queries take the write lock: estimation fills
/// memo caches as it reads.
async fn get_eta_table(model: Arc<RwLock<Model>>) -> impl IntoResponse {
    let table = model.write().await.eta_table();
    Json(table)
}

/// The last reported ping per active vehicle, alongside where dead reckoning
/// puts the vehicle right now.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VehiclePosition {
    #[serde(flatten)]
    reported: PingRecord,
    estimated_lat: f64,
    estimated_lon: f64,
}

async fn get_positions(model: Arc<RwLock<Model>>) -> impl IntoResponse {
    let mut model = model.write().await;
    let now = model.now();

    let positions: HashMap<String, VehiclePosition> = model
        .recent_positions()
        .into_iter()
        .map(|(vehicle_id, reported)| {
            let estimated = geo::estimated_position(
                reported.point(),
                reported.speed,
                reported.heading,
                now - reported.timestamp,
            );
            (
                vehicle_id,
                VehiclePosition {
                    reported,
                    estimated_lat: estimated.y(),
                    estimated_lon: estimated.x(),
                },
            )
        })
        .collect();

    Json(positions)
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
