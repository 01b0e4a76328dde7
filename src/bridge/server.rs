//! Client connection setup and the session event loop

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::dap::codec::{self, FrameReader};
use crate::dap::ProtocolMessage;

use super::backend::{self, BackendKind};
use super::session::{Peer, Session, SessionInput};

/// Serve one session over the process's stdin/stdout
pub async fn serve_stdio(config: &Config) -> Result<()> {
    tracing::info!("Serving DAP on stdio");
    run_session(config, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Accept exactly one TCP client and serve its session
pub async fn serve_tcp(config: &Config, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(|e| Error::Bind {
        addr: addr.to_string(),
        error: e.to_string(),
    })?;
    let local = listener.local_addr()?;
    tracing::info!("Listening for a DAP client on {}", local);

    let (stream, peer) = listener.accept().await?;
    tracing::info!("Client connected from {}", peer);
    drop(listener);

    let (reader, writer) = stream.into_split();
    run_session(config, reader, writer).await
}

/// Spawn both backends and drive a session until it closes
pub async fn run_session<R, W>(config: &Config, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel();

    let managed =
        backend::spawn(BackendKind::Managed, &config.backends.managed, inbox_tx.clone()).await?;

    // A missing native backend only degrades the session
    let native = match &config.backends.native {
        Some(command) => {
            match backend::spawn(BackendKind::Native, command, inbox_tx.clone()).await {
                Ok(link) => Some(link),
                Err(e) => {
                    tracing::warn!("Native backend unavailable: {}", e);
                    None
                }
            }
        }
        None => {
            tracing::info!("No native backend configured");
            None
        }
    };

    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_client(writer, client_rx));
    let reader_task = tokio::spawn(read_client(reader, inbox_tx.clone()));
    let signal_task = tokio::spawn(forward_signals(inbox_tx.clone()));

    let mut session = Session::new(config, client_tx, managed, native, inbox_tx);
    while !session.is_closed() {
        match inbox_rx.recv().await {
            Some(input) => session.handle(input),
            None => break,
        }
    }
    drop(session);

    reader_task.abort();
    signal_task.abort();
    writer_task
        .await
        .map_err(|e| Error::Internal(format!("client writer task failed: {}", e)))?;

    tracing::info!("Session finished");
    Ok(())
}

/// Client frames -> session inbox
async fn read_client<R>(reader: R, inbox: mpsc::UnboundedSender<SessionInput>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = FrameReader::new(reader);
    loop {
        match reader.read_message().await {
            Ok(Some(message)) => {
                tracing::trace!(seq = message.seq(), name = message.name(), "client >>> bridge");
                if inbox.send(SessionInput::Client(message)).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(Error::DapProtocol(msg)) => {
                let _ = inbox.send(SessionInput::FrameError(Peer::Client, msg));
            }
            Err(e) => {
                if !e.is_disconnect() {
                    tracing::warn!("Client read failed: {}", e);
                }
                break;
            }
        }
    }
    let _ = inbox.send(SessionInput::ClientClosed);
}

/// Session output -> client; closing the channel closes the connection
async fn write_client<W>(mut writer: W, mut outgoing: mpsc::UnboundedReceiver<ProtocolMessage>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outgoing.recv().await {
        if let Err(e) = codec::write_message(&mut writer, &message).await {
            if !e.is_disconnect() {
                tracing::warn!("Client write failed: {}", e);
            }
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        tracing::debug!("Failed to shut down client stream: {}", e);
    }
}

/// Treat SIGINT/SIGTERM as the client going away, so shutdown stays graceful
#[cfg(unix)]
async fn forward_signals(inbox: mpsc::UnboundedSender<SessionInput>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!("Failed to install signal handlers: {}", e);
                return;
            }
        };

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
        _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down"),
    }
    let _ = inbox.send(SessionInput::ClientClosed);
}

#[cfg(not(unix))]
async fn forward_signals(inbox: mpsc::UnboundedSender<SessionInput>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Received Ctrl+C, shutting down");
        let _ = inbox.send(SessionInput::ClientClosed);
    }
}
