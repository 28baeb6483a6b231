use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use crate::error::CommunicationError;
use crate::properties::{self, Properties};

pub const DEFAULT_CONSOLE_HOST: &str = "localhost";
pub const DEFAULT_CONSOLE_PORT: u16 = 6372;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Agent,
    Worker,
}

/// Immutable console endpoint descriptor.
///
/// The control loop compares connectors by value to decide whether an
/// existing session can be kept across runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connector {
    host: String,
    port: u16,
    connection_type: ConnectionType,
}

impl Connector {
    #[must_use]
    pub fn new(host: &str, port: u16, connection_type: ConnectionType) -> Self {
        Self {
            host: host.to_owned(),
            port,
            connection_type,
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    pub(crate) async fn connect(&self) -> Result<TcpStream, CommunicationError> {
        let addr = self.endpoint();
        TcpStream::connect(&addr)
            .await
            .map_err(|err| CommunicationError::Connect { addr, source: err })
    }
}

/// Builds connectors of one connection type from merged properties.
#[derive(Debug)]
pub struct ConnectorFactory {
    connection_type: ConnectionType,
}

impl ConnectorFactory {
    #[must_use]
    pub fn new(connection_type: ConnectionType) -> Self {
        Self { connection_type }
    }

    #[must_use]
    pub fn create(&self, properties: &Properties) -> Connector {
        let host = properties.get_or(properties::CONSOLE_HOST, DEFAULT_CONSOLE_HOST);
        let port = properties.get_int(properties::CONSOLE_PORT, i32::from(DEFAULT_CONSOLE_PORT));
        let port = u16::try_from(port).unwrap_or_else(|_| {
            tracing::warn!(
                "Console port {} out of range; using {}",
                port,
                DEFAULT_CONSOLE_PORT
            );
            DEFAULT_CONSOLE_PORT
        });
        Connector::new(&host, port, self.connection_type)
    }
}
