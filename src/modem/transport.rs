use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Byte stream to a modem's control port. Anything readable and writable qualifies,
/// which lets tests stand a scripted modem on the other end of a duplex pipe.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}

pub fn open(device: &str, baud: u32) -> Result<SerialStream> {
    tokio_serial::new(device, baud)
        .open_native_async()
        .with_context(|| format!("Failed to open serial device {} at {} baud", device, baud))
}
