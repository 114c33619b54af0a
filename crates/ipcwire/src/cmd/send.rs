use std::fs;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use ipcwire_peer::{Connection, ConnectionConfig, PeerError};
use tracing::{debug, warn};

use crate::cmd::{parse_duration, SendArgs};
use crate::exit::{io_error, peer_error, CliError, CliResult, DATA_INVALID, SUCCESS, TIMEOUT};
use crate::output::{print_message, MessageOutput, OutputFormat};

pub async fn run(args: SendArgs, config: ConnectionConfig, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let payload = resolve_payload(&args)?;

    let connection = Connection::new(config);
    connection
        .connect_timeout(&args.path, timeout)
        .await
        .map_err(|err| peer_error("connect failed", err))?;
    debug!(connection = %connection.id(), request = args.request, size = payload.len(), "sending");

    let outcome = if args.request {
        within(timeout, connection.request(payload)).await.map(Some)
    } else {
        within(timeout, connection.send_message(payload))
            .await
            .map(|()| None)
    };

    if let Err(err) = connection.close().await {
        warn!(error = %err, "connection did not close cleanly");
    }

    if let Some(reply) = outcome? {
        print_message(&MessageOutput::new("reply", None, &reply), &reply, format);
    }
    Ok(SUCCESS)
}

async fn within<T>(
    timeout: Duration,
    operation: impl Future<Output = Result<T, PeerError>>,
) -> CliResult<T> {
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result.map_err(|err| peer_error("send failed", err)),
        Err(_) => Err(CliError::new(
            TIMEOUT,
            format!("send failed: no response within {timeout:?}"),
        )),
    }
}

fn resolve_payload(args: &SendArgs) -> CliResult<Bytes> {
    let payload = if let Some(data) = &args.data {
        Bytes::from(data.clone().into_bytes())
    } else if let Some(path) = &args.file {
        fs::read(path)
            .map(Bytes::from)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?
    } else {
        Bytes::new()
    };

    if payload.is_empty() {
        return Err(CliError::new(DATA_INVALID, "payload must not be empty"));
    }
    Ok(payload)
}
