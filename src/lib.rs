pub mod app;
pub mod config;
pub mod events;
pub mod modem;
pub mod sms;
pub mod ussd;
pub mod webhooks;

#[cfg(feature = "http-server")]
pub mod http;
