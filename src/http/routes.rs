use axum::extract::State;
use axum::Json;
use crate::http_interface_handler;
use crate::http::types::{
    DialRequest,
    DtmfRequest,
    HttpResponse,
    HttpState,
    JsonResult,
    SendSmsRequest,
    SendSmsResponse,
    SendUssdRequest
};
use crate::modem::types::InterfaceStatus;
use crate::ussd::UssdMessage;

pub async fn list_interfaces(State(state): State<HttpState>) -> JsonResult<Vec<String>> {
    Ok(Json(HttpResponse {
        success: true,
        data: Some(state.registry.names().await),
        error: None
    }))
}

http_interface_handler!(interface_status, InterfaceStatus, |sender| {
    sender.status().await
});

http_interface_handler!(interface_dial, DialRequest, (), |sender, payload| {
    sender.dial(payload.number).await
});

http_interface_handler!(interface_answer, (), |sender| {
    sender.answer().await
});

http_interface_handler!(interface_hangup, (), |sender| {
    sender.hangup().await
});

http_interface_handler!(interface_dtmf, DtmfRequest, (), |sender, payload| {
    sender.send_dtmf(payload.digit).await
});

http_interface_handler!(interface_send_sms, SendSmsRequest, SendSmsResponse, |sender, payload| {
    let references = sender.send_sms(payload.to, payload.content).await?;
    Ok(SendSmsResponse { references })
});

http_interface_handler!(interface_send_ussd, SendUssdRequest, Option<UssdMessage>, |sender, payload| {
    sender.send_ussd(payload.code).await
});
