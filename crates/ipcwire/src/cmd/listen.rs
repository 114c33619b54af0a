use bytes::Bytes;
use ipcwire_frame::Identifier;
use ipcwire_peer::{ConnectionConfig, HandlerError, Listener};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cmd::ListenArgs;
use crate::exit::{io_error, peer_error, CliResult, SUCCESS};
use crate::output::{print_message, MessageOutput, OutputFormat};

pub async fn run(args: ListenArgs, config: ConnectionConfig, format: OutputFormat) -> CliResult<i32> {
    let drain_timeout = config.drain_timeout();
    let (received_tx, mut received) = mpsc::unbounded_channel::<(Identifier, Bytes)>();

    let mut listener = Listener::bind(&args.path)
        .map_err(|err| peer_error("bind failed", err))?
        .with_connection_config(config)
        .with_message_handler(move |payload, responder| {
            received_tx
                .send((responder.id(), payload))
                .map_err(|_| HandlerError::from("listener is shutting down"))?;
            responder.ack();
            Ok(())
        })
        .with_error_handler(|source, err| {
            warn!(%source, error = %err, "connection error");
        });
    listener.start();
    info!(path = %args.path.display(), "listening");

    let mut printed = 0usize;
    loop {
        tokio::select! {
            next = received.recv() => {
                let Some((id, payload)) = next else { break };
                let message = MessageOutput::new("message", Some(id.to_string()), &payload);
                print_message(&message, &payload, format);
                printed = printed.saturating_add(1);
                if args.count.is_some_and(|count| printed >= count) {
                    break;
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(|err| io_error("signal handler setup failed", err))?;
                break;
            }
        }
    }

    listener
        .close(drain_timeout)
        .await
        .map_err(|err| peer_error("shutdown failed", err))?;
    Ok(SUCCESS)
}
