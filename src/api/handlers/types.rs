//! Request/response types for auth endpoints.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SecondaryRequest {
    pub token: String,
    pub factor: String,
    pub passcode: String,
}

#[derive(Deserialize, Debug)]
pub struct SignTokenQuery {
    pub token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct DeviceSignRequest {
    pub token: String,
    pub response: serde_json::Value,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct DeviceRegisterRequest {
    pub token: String,
    pub response: serde_json::Value,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RegisterStartResponse {
    pub token: String,
    pub request: serde_json::Value,
}
