//! Builds a client-authenticated TLS socket to the server proxy.

// std
use std::net::SocketAddr;
// crates.io
use rustls_pki_types::ServerName;
use socket2::{Domain, Protocol, SockAddr, Socket, TcpKeepalive, Type};
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, client::TlsStream};
// self
use crate::{_prelude::*, data::SslContext};

/// Fixed TCP port on which an instance's TLS endpoint listens.
pub const SERVER_PROXY_PORT: u16 = 3307;

const KEEPALIVE_TIME: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Builds a keepalive-tuned, Nagle-disabled TCP connection and completes a
/// mutually-authenticated TLS handshake against it.
#[derive(Clone, Copy, Debug, Default)]
pub struct SocketBuilder;
impl SocketBuilder {
	/// Dial `ip` on the server proxy port and complete the TLS handshake using `ssl_context`.
	///
	/// Server-identity verification is overridden (see [`crate::verifier`]), so the
	/// `ServerName` conveyed in the handshake is informational only.
	pub async fn connect(&self, ip: &str, ssl_context: &SslContext) -> Result<TlsStream<TcpStream>> {
		let addr: SocketAddr = format!("{ip}:{SERVER_PROXY_PORT}")
			.parse()
			.map_err(|err| Error::HandshakeFailed(format!("invalid instance IP '{ip}': {err}")))?;
		let tcp = Self::connect_tcp(addr).await?;
		let config = ssl_context.client_config()?;
		let connector = TlsConnector::from(Arc::new(config));
		let server_name = ServerName::try_from(ip.to_string())
			.map_err(|err| Error::HandshakeFailed(format!("invalid server name '{ip}': {err}")))?;

		connector
			.connect(server_name, tcp)
			.await
			.map_err(|err| Error::HandshakeFailed(err.to_string()))
	}

	async fn connect_tcp(addr: SocketAddr) -> Result<TcpStream> {
		let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
		let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

		socket.set_nonblocking(true)?;
		socket.set_nodelay(true)?;

		let keepalive =
			TcpKeepalive::new().with_time(KEEPALIVE_TIME).with_interval(KEEPALIVE_INTERVAL);

		if let Err(err) = socket.set_tcp_keepalive(&keepalive) {
			tracing::warn!(error = %err, "failed to enable TCP keepalive");
		}

		match socket.connect(&SockAddr::from(addr)) {
			Ok(()) => {},
			Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {},
			Err(err) => return Err(Error::Io(err)),
		}

		let stream = TcpStream::from_std(socket.into())?;

		stream.writable().await?;

		if let Some(err) = stream.take_error()? {
			return Err(Error::Io(err));
		}

		Ok(stream)
	}
}
