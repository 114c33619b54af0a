use std::path::Path;

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::error::Result;

/// Connect to a listening peer with default configuration.
pub async fn connect(path: impl AsRef<Path>) -> Result<Connection> {
    connect_with_config(path, ConnectionConfig::default()).await
}

/// Connect with explicit configuration.
///
/// The returned connection reconnects on its own if the transport fails
/// later; a failure here is returned directly.
pub async fn connect_with_config(
    path: impl AsRef<Path>,
    config: ConnectionConfig,
) -> Result<Connection> {
    let connection = Connection::new(config);
    connection.connect(path).await?;
    Ok(connection)
}
