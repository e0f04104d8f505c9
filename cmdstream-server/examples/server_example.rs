//! Simple line echo server
//!
//! Serves on 127.0.0.1:9000 with four workers and shuts down gracefully on
//! Ctrl-C. A second Ctrl-C closes the server, dropping queued connections.

use cmdstream_server::prelude::*;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    cmdstream_server::logging::init_logging().map_err(|e| e.to_string())?;

    let server = Arc::new(
        Server::builder()
            .workers(4)
            .lost_conn_callback(|addr, err| eprintln!("lost connection {}: {}", addr, err))
            .build(from_fn(|conn: BoxedConnection| async move {
                let (reader, mut writer) = tokio::io::split(conn);
                let mut lines = BufReader::new(reader).lines();
                while let Some(line) = lines.next_line().await? {
                    writer.write_all(line.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                }
                Ok(())
            }))?,
    );

    let signals = {
        let server = server.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = server.shutdown().await;
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = server.close().await;
            }
        })
    };

    println!("echo server listening on 127.0.0.1:9000");
    let err = match server.listen_and_serve("127.0.0.1:9000").await {
        Ok(never) => match never {},
        Err(err) => err,
    };
    signals.abort();

    if err.is_requested() {
        println!("{}", err);
        Ok(())
    } else {
        Err(err.into())
    }
}
