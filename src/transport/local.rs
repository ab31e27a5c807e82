//! Stream connectors for bus addresses.
//!
//! The connection engine only needs an async byte stream; these helpers open one
//! for a parsed [`BusAddress`]. Unix domain sockets are used on Unix systems and
//! TCP everywhere.

use crate::error::{constants, BusError, Result};
use crate::transport::address::{AddressKind, BusAddress};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::{debug, instrument, warn};

/// Any bidirectional async byte stream a connection can run over
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedTransport = Box<dyn Transport>;

/// Open a stream to one address
#[instrument(skip(address), fields(address = %address))]
pub async fn connect(address: &BusAddress) -> Result<BoxedTransport> {
    match &address.kind {
        AddressKind::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            debug!("Connected over TCP");
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        AddressKind::UnixPath(path) => {
            let stream = UnixStream::connect(path).await?;
            debug!("Connected to unix socket");
            Ok(Box::new(stream))
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        AddressKind::UnixAbstract(name) => {
            let stream = connect_abstract(name).await?;
            debug!("Connected to abstract unix socket");
            Ok(Box::new(stream))
        }
        #[allow(unreachable_patterns)]
        _ => Err(BusError::InvalidAddress(format!(
            "transport of '{address}' is not supported on this platform"
        ))),
    }
}

/// Try each alternative in order and return the first stream that opens
pub async fn connect_any(addresses: &[BusAddress]) -> Result<(BoxedTransport, BusAddress)> {
    let mut last_error = None;
    for address in addresses {
        match connect(address).await {
            Ok(stream) => return Ok((stream, address.clone())),
            Err(e) => {
                warn!(address = %address, error = %e, "Bus address unreachable");
                last_error = Some(e);
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| BusError::InvalidAddress(constants::ERR_NO_ADDRESS.to_string())))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
async fn connect_abstract(name: &str) -> Result<UnixStream> {
    #[cfg(target_os = "android")]
    use std::os::android::net::SocketAddrExt;
    #[cfg(target_os = "linux")]
    use std::os::linux::net::SocketAddrExt;

    let name = name.to_string();
    let std_stream = tokio::task::spawn_blocking(move || -> std::io::Result<_> {
        let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
        let stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
        stream.set_nonblocking(true)?;
        Ok(stream)
    })
    .await
    .map_err(|e| BusError::Custom(format!("Connect task failed: {e}")))??;

    Ok(UnixStream::from_std(std_stream)?)
}
