use std::net::SocketAddr;

use thiserror::Error;

/// Failures while wiring up or running the server process.
#[derive(Debug, Error)]
pub enum InfraError {
    #[error("failed to bind listener on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("http server stopped unexpectedly")]
    Serve(#[source] std::io::Error),
    #[error("generator API key is not set (generator.api_key or QRVERSE__GENERATOR__API_KEY)")]
    MissingApiKey,
    #[error("failed to build generator HTTP client")]
    GeneratorClient(#[source] reqwest::Error),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
}

impl InfraError {
    pub fn bind(addr: SocketAddr, source: std::io::Error) -> Self {
        Self::Bind { addr, source }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
