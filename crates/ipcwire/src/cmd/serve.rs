use bytes::{BufMut, Bytes, BytesMut};
use ipcwire_peer::{ConnectionConfig, Listener};
use tracing::{info, warn};

use crate::cmd::{ServeArgs, ServeMode};
use crate::exit::{io_error, peer_error, CliResult, SUCCESS};

const REPLY_SUFFIX: &[u8] = b" REPLY";

pub async fn run(args: ServeArgs, config: ConnectionConfig) -> CliResult<i32> {
    let drain_timeout = config.drain_timeout();
    let mode = args.mode;

    let mut listener = Listener::bind(&args.path)
        .map_err(|err| peer_error("bind failed", err))?
        .with_connection_config(config)
        .with_connect_handler(|connection| {
            info!(connection = %connection.id(), "peer connected");
        })
        .with_message_handler(move |payload, responder| {
            info!(id = %responder.id(), size = payload.len(), ?mode, "answering message");
            match mode {
                ServeMode::Echo => responder.reply(payload),
                ServeMode::Ack => responder.ack(),
                ServeMode::Suffix => responder.reply(suffixed(&payload)),
            };
            Ok(())
        })
        .with_error_handler(|source, err| {
            warn!(%source, error = %err, "connection error");
        });
    listener.start();
    info!(path = %args.path.display(), ?mode, "serving");

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| io_error("signal handler setup failed", err))?;
    info!("shutting down");

    listener
        .close(drain_timeout)
        .await
        .map_err(|err| peer_error("shutdown failed", err))?;
    Ok(SUCCESS)
}

fn suffixed(payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + REPLY_SUFFIX.len());
    out.put_slice(payload);
    out.put_slice(REPLY_SUFFIX);
    out.freeze()
}
