//! Echo Server Example
//!
//! Serves length-prefixed commands on 127.0.0.1:9100: every frame is a
//! big-endian `u32` length followed by the payload, and the reply is the
//! same frame. When `CMDSTREAM_CERT` and `CMDSTREAM_KEY` point at PEM files
//! and the `transport-tls` feature is on, the server speaks TLS.
//!
//! Ctrl-C shuts down gracefully, a second Ctrl-C closes the server.

use cmdstream::prelude::*;
use std::sync::Arc;

const MAX_FRAME: u32 = 64 * 1024;

async fn echo_frames(mut conn: BoxedConnection) -> Result<()> {
    loop {
        let len = match conn.read_u32().await {
            Ok(len) => len,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if len > MAX_FRAME {
            return Err(Error::Other(format!("frame of {} bytes exceeds limit", len)));
        }

        let mut payload = vec![0u8; len as usize];
        conn.read_exact(&mut payload).await?;
        conn.write_u32(len).await?;
        conn.write_all(&payload).await?;
        conn.flush().await?;
    }
}

fn tls_from_env() -> Option<TlsConfig> {
    let cert = std::env::var_os("CMDSTREAM_CERT")?;
    let key = std::env::var_os("CMDSTREAM_KEY")?;
    Some(TlsConfig::pem(cert, key))
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    cmdstream::server::logging::init_logging().map_err(|e| e.to_string())?;

    let mut builder = Server::builder()
        .workers(16)
        .lost_conn_callback(|addr, err| eprintln!("lost connection {}: {}", addr, err));
    if let Some(tls) = tls_from_env() {
        builder = builder.tls(tls);
    }
    let server = Arc::new(builder.build(from_fn(echo_frames))?);

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

    println!("echo server listening on 127.0.0.1:9100");
    let err = match server.listen_and_serve("127.0.0.1:9100").await {
        Ok(never) => match never {},
        Err(err) => err,
    };
    signals.abort();

    match err {
        ServerError::Shutdown | ServerError::Closed => {
            println!("{}", err);
            Ok(())
        }
        err => Err(err.into()),
    }
}
