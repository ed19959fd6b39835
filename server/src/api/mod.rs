use axum::Json;
use serde::{Deserialize, Serialize};

pub mod v1;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Welcome {
    pub message: String,
    pub version: String,
}

pub async fn welcome() -> Json<Welcome> {
    Json(Welcome {
        message: "Welcome to the WstApp API".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn health() -> &'static str {
    "OK"
}
