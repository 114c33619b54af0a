//! Minimal echo server: replies to every request with its own payload.
//!
//! Run with:
//!   cargo run --example echo-server
//!
//! In another terminal:
//!   cargo run --features cli -- send <printed socket path> --data hello --request

use std::fs;

use ipcwire::peer::Listener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let sock_dir = std::env::temp_dir().join(format!("ipcwire-echo-{}", std::process::id()));
    fs::create_dir_all(&sock_dir)?;
    let sock_path = sock_dir.join("echo.sock");

    let mut listener = Listener::bind(&sock_path)?
        .with_connect_handler(|connection| eprintln!("Peer connected: {}", connection.id()))
        .with_message_handler(|payload, responder| {
            eprintln!("Received {} bytes", payload.len());
            responder.reply(payload);
            Ok(())
        })
        .with_error_handler(|source, err| eprintln!("{source}: {err}"));
    listener.start();
    eprintln!("Listening on {}", sock_path.display());

    tokio::signal::ctrl_c().await?;
    listener.close(std::time::Duration::from_secs(5)).await?;

    let _ = fs::remove_dir_all(&sock_dir);
    Ok(())
}
