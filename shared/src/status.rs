//! API `Status` error bodies, negotiated against the caller's `Accept` header.

use crate::http::{ResponseBody, full_body, make_error_response};
use http::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub kind: &'static str,
    pub api_version: &'static str,
    pub metadata: BTreeMap<String, String>,
    pub status: &'static str,
    pub message: String,
    pub reason: &'static str,
    pub code: u16,
}

impl Status {
    fn failure(code: StatusCode, reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind: "Status",
            api_version: "v1",
            metadata: BTreeMap::new(),
            status: "Failure",
            message: message.into(),
            reason,
            code: code.as_u16(),
        }
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::failure(StatusCode::SERVICE_UNAVAILABLE, "ServiceUnavailable", message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "InternalError",
            format!("Internal error occurred: {}", message.into()),
        )
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::failure(StatusCode::NOT_FOUND, "NotFound", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::failure(StatusCode::FORBIDDEN, "Forbidden", message)
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Serializes as YAML when the caller accepts `application/yaml`, JSON
    /// otherwise.
    pub fn to_response(&self, request_headers: &HeaderMap) -> Response<ResponseBody> {
        let wants_yaml = request_headers
            .get_all(ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.contains("application/yaml"));

        let encoded = if wants_yaml {
            serde_yaml::to_string(self)
                .map(|body| (body.into_bytes(), "application/yaml"))
                .map_err(|e| e.to_string())
        } else {
            serde_json::to_vec(self)
                .map(|body| (body, "application/json"))
                .map_err(|e| e.to_string())
        };

        let (body, content_type) = match encoded {
            Ok(encoded) => encoded,
            Err(error) => {
                tracing::error!(%error, "failed to encode status");
                return make_error_response(self.status_code());
            }
        };

        let mut response = Response::new(full_body(body));
        *response.status_mut() = self.status_code();
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        response
    }
}
