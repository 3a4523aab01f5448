use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use crate::modem::InterfaceRegistry;

#[derive(Clone)]
pub struct HttpState {
    pub registry: InterfaceRegistry
}

#[derive(Serialize, Deserialize, Debug)]
pub struct HttpResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>
}
impl<T> HttpResponse<T> {
    pub fn failure(status: StatusCode, error: impl Into<String>) -> (StatusCode, Json<Self>) {
        (status, Json(Self {
            success: false,
            data: None,
            error: Some(error.into())
        }))
    }
}

pub type JsonResult<T> = Result<Json<HttpResponse<T>>, (StatusCode, Json<HttpResponse<T>>)>;

#[derive(Deserialize)]
pub struct DialRequest {
    pub number: String
}

#[derive(Deserialize)]
pub struct DtmfRequest {
    pub digit: char
}

#[derive(Deserialize)]
pub struct SendSmsRequest {
    pub to: String,
    pub content: String
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SendSmsResponse {
    pub references: Vec<u8>
}

#[derive(Deserialize)]
pub struct SendUssdRequest {
    pub code: String
}
