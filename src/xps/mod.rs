pub mod client;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod protocol;

pub use client::{
    ConnectionConfig, PvtVerificationResult, TcpTransport, Transport, XpsClient, XpsClientBuilder,
};
#[cfg(any(test, feature = "mock"))]
pub use mock::MockController;
pub use protocol::{GroupState, Protocol, Response, StatusCode};
