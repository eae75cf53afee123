// src/runtime/mod.rs
// HTTP plumbing shared by the router and the admin surface.

pub mod request_router;

use serde::Serialize;
use spin_sdk::http::Response;

pub(crate) fn json_response<T: Serialize>(status: u16, body: &T) -> Response {
    let payload = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(payload)
        .build()
}

pub(crate) fn error_response(status: u16, message: &str) -> Response {
    json_response(status, &serde_json::json!({ "error": message }))
}

pub(crate) fn text_response(status: u16, content_type: &str, body: String) -> Response {
    Response::builder()
        .status(status)
        .header("content-type", content_type)
        .body(body)
        .build()
}
