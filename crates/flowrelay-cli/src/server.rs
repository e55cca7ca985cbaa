use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use flowrelay_contracts::events::TranscriptWriter;
use flowrelay_contracts::protocol::{parse_inbound, ClientEvent, InboundMessage};
use flowrelay_engine::RelayEngine;
use tracing::{debug, info, warn};
use tungstenite::{Message as WsMessage, WebSocket};

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);
const CONNECTION_SESSION: &str = "-";

type Outbound = (String, ClientEvent);

/// Accepts websocket clients forever, one thread per connection.
pub fn serve_listener(
    listener: TcpListener,
    engine: Arc<RelayEngine>,
    transcript: Option<TranscriptWriter>,
) -> Result<()> {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "failed to accept connection");
                continue;
            }
        };
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let engine = Arc::clone(&engine);
        let transcript = transcript.clone();
        let thread_peer = peer.clone();
        let spawned = thread::Builder::new()
            .name(format!("flowrelay-conn-{peer}"))
            .spawn(move || {
                if let Err(err) = handle_connection(stream, &engine, transcript.as_ref()) {
                    warn!(peer = %thread_peer, error = %format!("{err:#}"), "connection ended with error");
                }
            });
        if let Err(err) = spawned {
            warn!(peer = %peer, error = %err, "failed to spawn connection thread");
        }
    }
    Ok(())
}

fn handle_connection(
    stream: TcpStream,
    engine: &Arc<RelayEngine>,
    transcript: Option<&TranscriptWriter>,
) -> Result<()> {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let mut ws = tungstenite::accept(stream)
        .map_err(|err| anyhow!("websocket handshake failed: {err}"))?;
    ws.get_mut()
        .set_read_timeout(Some(SOCKET_POLL_INTERVAL))
        .context("failed to set socket read timeout")?;
    info!(peer = %peer, "client connected");

    let (tx, rx) = mpsc::channel::<Outbound>();
    loop {
        flush_outbound(&mut ws, &rx, transcript)?;

        let raw = match ws.read() {
            Ok(WsMessage::Text(text)) => text.to_string(),
            Ok(WsMessage::Binary(bytes)) => String::from_utf8_lossy(&bytes).to_string(),
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(tungstenite::Error::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                continue;
            }
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => break,
            Err(err) => return Err(anyhow!("websocket read failed: {err}")),
        };
        dispatch_frame(&raw, engine, &tx);
    }
    info!(peer = %peer, "client disconnected");
    Ok(())
}

fn dispatch_frame(raw: &str, engine: &Arc<RelayEngine>, tx: &Sender<Outbound>) {
    let reply = |event: ClientEvent| {
        let _ = tx.send((CONNECTION_SESSION.to_string(), event));
    };
    match parse_inbound(raw) {
        Ok(InboundMessage::StreamDiagramEdit(request)) => {
            let session_id = RelayEngine::new_session_id();
            info!(
                session_id = %session_id,
                attachment = request.attachment.as_ref().map(|item| item.kind.as_str()),
                "edit request received"
            );
            let sender = tx.clone();
            let worker_session = session_id.clone();
            let spawned = engine.spawn_edit(session_id, request, move |event| {
                let _ = sender.send((worker_session.clone(), event));
            });
            if let Err(err) = spawned {
                reply(ClientEvent::error(format!("failed to start request worker: {err}")));
            }
        }
        Ok(InboundMessage::ClearHistory) => reply(engine.clear_history()),
        Ok(InboundMessage::Health) => reply(engine.health()),
        Err(message) => {
            debug!(reason = %message, "rejected client frame");
            reply(ClientEvent::error(message));
        }
    }
}

fn flush_outbound(
    ws: &mut WebSocket<TcpStream>,
    rx: &Receiver<Outbound>,
    transcript: Option<&TranscriptWriter>,
) -> Result<()> {
    while let Ok((session_id, event)) = rx.try_recv() {
        if let Some(writer) = transcript {
            if let Err(err) = writer.record(&session_id, &event) {
                warn!(path = %writer.path().display(), error = %err, "transcript write failed");
            }
        }
        let raw = serde_json::to_string(&event.to_frame())
            .context("failed to serialize client event")?;
        ws.send(WsMessage::Text(raw.into()))
            .map_err(|err| anyhow!("websocket send failed: {err}"))?;
    }
    Ok(())
}
