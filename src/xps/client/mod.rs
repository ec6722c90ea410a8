use super::protocol::{Protocol, Response, MAX_RESPONSE_SIZE};
use crate::error::FlyError;
use crate::types::XpsValue;
use log::{debug, warn};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

pub mod event;
pub mod gathering;
pub mod group;
pub mod positioner;
pub mod pvt;

pub use pvt::PvtVerificationResult;

/// Connection configuration for the controller command socket.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use pvt_flyer::ConnectionConfig;
///
/// let config = ConnectionConfig {
///     connect_timeout: Duration::from_secs(2),
///     ..ConnectionConfig::default()
/// };
/// assert_eq!(config.read_timeout, Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing the initial TCP connection
    pub connect_timeout: Duration,
    /// Timeout for reading one reply
    pub read_timeout: Duration,
    /// Timeout for writing one request
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// One request/reply exchange over the command channel.
///
/// The controller handles a single in-flight request per socket, so
/// implementations never pipeline.
pub trait Transport: Send {
    /// Send a complete request and return the raw reply text.
    fn exchange(&mut self, request: &str) -> Result<String, FlyError>;

    /// Change the reply timeout; `None` waits forever.
    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> Result<(), FlyError> {
        Ok(())
    }
}

/// Command socket over TCP.
///
/// A reply that misses the read timeout is still owed by the controller.
/// It is read and discarded before the next request goes out, so the
/// channel never answers a request with the previous request's reply.
pub struct TcpTransport {
    stream: TcpStream,
    buffer: Vec<u8>,
    reply_pending: bool,
}

impl TcpTransport {
    pub fn connect(addr: SocketAddr, config: &ConnectionConfig) -> Result<Self, FlyError> {
        let stream = TcpStream::connect_timeout(&addr, config.connect_timeout).map_err(|e| {
            warn!("Failed to connect to {addr}: {e}");
            FlyError::io(e, format!("Failed to connect to {addr}"))
        })?;

        stream.set_read_timeout(Some(config.read_timeout))?;
        stream.set_write_timeout(Some(config.write_timeout))?;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            buffer: Vec::with_capacity(1024),
            reply_pending: false,
        })
    }

    /// Read until the buffer holds one complete reply.
    ///
    /// Bytes already buffered from an earlier, interrupted read count
    /// towards the reply.
    fn read_reply(&mut self) -> Result<String, FlyError> {
        let mut chunk = [0u8; 1024];
        loop {
            let text = String::from_utf8_lossy(&self.buffer);
            if Protocol::is_complete(&text) {
                let reply = text.into_owned();
                self.buffer.clear();
                self.reply_pending = false;
                return Ok(reply);
            }

            let n = self
                .stream
                .read(&mut chunk)
                .map_err(|e| FlyError::io(e, "Reading reply"))?;
            if n == 0 {
                return Err(FlyError::io(
                    std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
                    "Controller closed the connection",
                ));
            }
            self.buffer.extend_from_slice(&chunk[..n]);

            if self.buffer.len() > MAX_RESPONSE_SIZE {
                self.buffer.clear();
                return Err(FlyError::Protocol(format!(
                    "Reply exceeds maximum {} bytes",
                    MAX_RESPONSE_SIZE
                )));
            }
        }
    }
}

impl Transport for TcpTransport {
    fn exchange(&mut self, request: &str) -> Result<String, FlyError> {
        if self.reply_pending {
            let stale = self.read_reply()?;
            warn!("Discarded late reply {:?}", stale.trim_end());
        }

        self.buffer.clear();
        self.stream
            .write_all(request.as_bytes())
            .map_err(|e| FlyError::io(e, "Writing command"))?;
        self.reply_pending = true;
        self.read_reply()
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), FlyError> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }
}

/// Builder for constructing [`XpsClient`] instances.
///
/// ```no_run
/// use std::time::Duration;
/// use pvt_flyer::XpsClient;
///
/// let client = XpsClient::builder()
///     .address("192.168.0.254")
///     .port(5001)
///     .connect_timeout(Duration::from_secs(2))
///     .build()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Default)]
pub struct XpsClientBuilder {
    address: Option<String>,
    port: Option<u16>,
    config: ConnectionConfig,
}

impl XpsClientBuilder {
    pub fn address(mut self, addr: &str) -> Self {
        self.address = Some(addr.to_string());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the full connection configuration
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<XpsClient, FlyError> {
        let address = self
            .address
            .ok_or_else(|| FlyError::Config("Address must be specified".to_string()))?;
        let port = self
            .port
            .ok_or_else(|| FlyError::Config("Port must be specified".to_string()))?;

        let candidates: Vec<SocketAddr> = (address.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| FlyError::Config(format!("Invalid address {address}: {e}")))?
            .collect();

        let mut last_error = None;
        for socket_addr in candidates {
            debug!("Connecting to controller at {socket_addr}");
            match TcpTransport::connect(socket_addr, &self.config) {
                Ok(transport) => {
                    debug!("Connected to controller");
                    return Ok(XpsClient {
                        transport: Box::new(transport),
                        config: self.config,
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| FlyError::Config(format!("No addresses found for {address}"))))
    }
}

/// Typed client for the controller's ASCII command API.
///
/// Subsystem calls live in the child modules as further `impl XpsClient`
/// blocks. The client is not shareable across threads by itself; wrap it in
/// a [`crate::ControllerLink`] for that.
pub struct XpsClient {
    transport: Box<dyn Transport>,
    config: ConnectionConfig,
}

impl XpsClient {
    pub fn new(addr: &str, port: u16) -> Result<Self, FlyError> {
        Self::builder().address(addr).port(port).build()
    }

    pub fn builder() -> XpsClientBuilder {
        XpsClientBuilder::default()
    }

    /// Use an already-connected transport.
    pub fn with_transport(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            config: ConnectionConfig::default(),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Issue a raw request and return status and payload without judging
    /// the status.
    pub fn send_raw(&mut self, request: &str) -> Result<Response, FlyError> {
        debug!(">> {}", request);
        let reply = self.transport.exchange(request)?;
        debug!("<< {}", reply.trim_end());
        Protocol::parse_reply(&reply)
    }

    /// Send an API call and parse its outputs.
    ///
    /// A non-zero status is surfaced as [`FlyError::Device`].
    pub fn quick_send(
        &mut self,
        command: &str,
        args: Vec<XpsValue>,
        return_types: Vec<&str>,
    ) -> Result<Vec<XpsValue>, FlyError> {
        let request = Protocol::format_command(command, &args, &return_types)?;
        let response = self.send_raw(&request)?;
        let payload = Protocol::check_status(response, command)?;
        Protocol::parse_payload(&payload, &return_types)
    }

    /// Run `f` with the reply timeout raised to cover a long blocking call.
    pub(crate) fn with_read_timeout<T>(
        &mut self,
        timeout: Duration,
        f: impl FnOnce(&mut Self) -> Result<T, FlyError>,
    ) -> Result<T, FlyError> {
        self.transport.set_read_timeout(Some(timeout))?;
        let result = f(self);
        let restore = self.config.read_timeout;
        if let Err(e) = self.transport.set_read_timeout(Some(restore)) {
            warn!("Failed to restore read timeout: {e}");
        }
        result
    }
}
