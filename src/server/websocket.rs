use crate::agent::Assistant;
use crate::cli::Args;
use crate::conversation::{ ChatSession, OutboundTurn };
use crate::models::websocket::{ ClientMessage, ServerMessage };

use std::collections::HashMap;
use std::error::Error;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{ AsyncRead, AsyncWrite };
use tokio::net::TcpListener;
use tokio::sync::{ mpsc, Mutex };

use tokio_tungstenite::{ accept_hdr_async, WebSocketStream };
use tokio_tungstenite::tungstenite::handshake::server::{ ErrorResponse, Request, Response };
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_rustls::TlsAcceptor;

use rustls::ServerConfig;
use rustls::pki_types::{ CertificateDer, PrivateKeyDer };
use rustls_pemfile::{ certs, pkcs8_private_keys };

use hmac::{ Hmac, Mac };
use sha2::Sha256;
use chrono::Utc;
use url::form_urlencoded;

use log::{ info, warn, error };
use futures::{ SinkExt, StreamExt };
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const MAX_MESSAGE_SIZE: usize = 1 * 1024 * 1024;

/// Maximum clock skew accepted between a client's signed timestamp and now.
const AUTH_WINDOW_SECS: i64 = 300;

fn load_tls_config(
    cert_path: &str,
    key_path: &str
) -> Result<Arc<ServerConfig>, Box<dyn Error + Send + Sync>> {
    let cert_file = File::open(cert_path).map_err(|e|
        format!("Failed to open TLS certificate file '{}': {}", cert_path, e)
    )?;
    let key_file = File::open(key_path).map_err(|e|
        format!("Failed to open TLS key file '{}': {}", key_path, e)
    )?;

    let mut cert_reader = BufReader::new(cert_file);
    let mut key_reader = BufReader::new(key_file);
    let cert_chain: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| format!("Failed to read certificate(s): {}", e))?;

    let mut keys = pkcs8_private_keys(&mut key_reader);
    let key = match keys.next() {
        Some(Ok(k)) => PrivateKeyDer::Pkcs8(k),
        Some(Err(e)) => {
            return Err(format!("Error reading private key: {}", e).into());
        }
        None => {
            return Err("No PKCS8 private key found in key file".into());
        }
    };

    let config = ServerConfig::builder().with_no_client_auth().with_single_cert(cert_chain, key)?;
    Ok(Arc::new(config))
}

pub async fn start_ws_server(
    addr: &str,
    assistant: Arc<Assistant>,
    api_key: Option<String>,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;

    let protocol = if
        args.enable_tls &&
        args.tls_cert_path.is_some() &&
        args.tls_key_path.is_some()
    {
        "wss"
    } else {
        "ws"
    };
    info!("{} server listening on: {}", protocol.to_uppercase(), addr);

    let tls_acceptor = if args.enable_tls {
        match (&args.tls_cert_path, &args.tls_key_path) {
            (Some(cert_path), Some(key_path)) => {
                info!(
                    "TLS enabled. Loading certificate from '{}' and key from '{}'",
                    cert_path,
                    key_path
                );
                let config = load_tls_config(cert_path, key_path)?;
                Some(TlsAcceptor::from(config))
            }
            (Some(_), None) | (None, Some(_)) => {
                error!("Both --tls-cert-path and --tls-key-path must be provided to enable TLS.");
                return Err("Missing TLS certificate or key path".into());
            }
            (None, None) => {
                error!("--enable-tls was set but no certificate/key paths provided.");
                return Err("TLS enabled without cert/key".into());
            }
        }
    } else {
        info!("TLS not enabled. Running plain WebSocket (WS) server.");
        None
    };

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("Incoming connection from: {}", peer);

        let assistant_clone = Arc::clone(&assistant);
        let required_api_key = api_key.clone();
        let tls_acceptor_clone = tls_acceptor.clone();

        tokio::spawn(async move {
            let process_result = if let Some(acceptor) = tls_acceptor_clone {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        info!("TLS handshake successful for {}", peer);
                        process_connection(
                            peer,
                            tls_stream,
                            assistant_clone,
                            required_api_key
                        ).await
                    }
                    Err(e) => {
                        error!("TLS handshake error for {}: {}", peer, e);
                        Err(Box::new(e) as Box<dyn Error + Send + Sync>)
                    }
                }
            } else {
                process_connection(peer, stream, assistant_clone, required_api_key).await
            };

            if let Err(e) = process_result {
                error!("Failed to process connection for {}: {}", peer, e);
            }
        });
    }
}

fn signature_matches(secret: &str, ts: &str, sig: &str) -> bool {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(ts.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());
    expected == sig
}

async fn process_connection<S>(
    peer: SocketAddr,
    stream: S,
    assistant: Arc<Assistant>,
    required_api_key: Option<String>
) -> Result<(), Box<dyn Error + Send + Sync>>
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let auth_callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let secret = match &required_api_key {
            Some(k) if !k.is_empty() => k,
            _ => {
                return Ok(response);
            }
        };

        let qs = req.uri().query().unwrap_or("");
        let params: HashMap<String, String> = form_urlencoded
            ::parse(qs.as_bytes())
            .into_owned()
            .collect();

        let ts = params
            .get("ts")
            .or_else(|| params.get("X-Api-Ts"))
            .map(|s| s.as_str());
        let sig = params
            .get("sig")
            .or_else(|| params.get("X-Api-Sign"))
            .map(|s| s.as_str());

        if let (Some(ts), Some(sig)) = (ts, sig) {
            let now = Utc::now().timestamp();
            let ts_i: i64 = ts.parse().unwrap_or(0);
            if (now - ts_i).abs() > AUTH_WINDOW_SECS {
                let res: ErrorResponse = Response::builder()
                    .status(401)
                    .body(Some("timestamp out of range".to_string()))
                    .unwrap();
                return Err(res);
            }

            if signature_matches(secret, ts, sig) {
                Ok(response)
            } else {
                warn!("Rejected WebSocket upgrade from {}: bad signature", peer);
                let res: ErrorResponse = Response::builder()
                    .status(401)
                    .body(Some("bad signature".to_string()))
                    .unwrap();
                Err(res)
            }
        } else {
            let res: ErrorResponse = Response::builder()
                .status(401)
                .body(Some("missing ts/sig".to_string()))
                .unwrap();
            Err(res)
        }
    };

    match accept_hdr_async(stream, auth_callback).await {
        Ok(ws) => {
            handle_connection(peer, ws, assistant).await;
            Ok(())
        }
        Err(e) => {
            error!("Handshake failed for {}: {}", peer, e);
            Err(Box::new(e) as _)
        }
    }
}

fn text_frame(message: &ServerMessage) -> Message {
    Message::Text(serde_json::to_string(message).unwrap())
}

fn reset_frame(session: &ChatSession) -> Message {
    let greeting = session.greeting();
    text_frame(
        &(ServerMessage::Reset {
            persona: session.persona(),
            greeting: greeting.text.clone(),
            timestamp: greeting.timestamp,
        })
    )
}

/// Runs one gateway turn off the read loop, so further frames stay
/// responsive while the model call is in flight. The session decides
/// whether the outcome still belongs to the current transcript.
fn spawn_turn(
    turn: OutboundTurn,
    assistant: Arc<Assistant>,
    session: Arc<Mutex<ChatSession>>,
    out_tx: mpsc::Sender<Message>,
    peer: SocketAddr
) {
    tokio::spawn(async move {
        let result = assistant.chat(&turn.prompt, &turn.history, turn.persona).await;

        let mut guard = session.lock().await;
        let frame = match guard.resolve(turn.epoch, result) {
            Some(message) => {
                if !message.grounding_sources.is_empty() {
                    info!(
                        "Reply for {} grounded in {} source(s): {}",
                        peer,
                        message.grounding_sources.len(),
                        message.grounding_sources
                            .iter()
                            .map(|source| source.short_label())
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                }
                text_frame(
                    &(ServerMessage::Response {
                        content: message.text.clone(),
                        sources: message.grounding_sources.clone(),
                        timestamp: message.timestamp,
                    })
                )
            }
            None => {
                info!("Discarding stale reply for {} (conversation was reset)", peer);
                return;
            }
        };
        drop(guard);

        if out_tx.send(frame).await.is_err() {
            warn!("Could not deliver reply to {} (connection gone)", peer);
        }
    });
}

pub async fn handle_connection<S>(
    peer: SocketAddr,
    websocket: WebSocketStream<S>,
    assistant: Arc<Assistant>
)
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    info!("New WebSocket connection: {}", peer);

    let (ws_tx, mut ws_rx) = websocket.split();
    let conversation_id = Uuid::new_v4().to_string();
    info!("Assigned conversation ID {} to {}", conversation_id, peer);

    if let Err(e) = assistant.reload_prompts_if_changed().await {
        error!("Prompt reload failed for {}: {}", peer, e);
    }
    let prompts = assistant.prompts().await;
    let session = Arc::new(
        Mutex::new(ChatSession::new(assistant.default_persona(), prompts))
    );

    // All frames leave through one writer task; gateway turns run
    // concurrently and push their frames into the same channel.
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(32);
    let writer = tokio::spawn(async move {
        let mut ws_tx = ws_tx;
        while let Some(frame) = out_rx.recv().await {
            if ws_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    {
        let guard = session.lock().await;
        if out_tx.send(reset_frame(&guard)).await.is_err() {
            error!("Failed to send greeting to {}", peer);
        }
    }

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(message) => {
                if message.len() > MAX_MESSAGE_SIZE {
                    warn!(
                        "Message from {} exceeds size limit ({} > {})",
                        peer,
                        message.len(),
                        MAX_MESSAGE_SIZE
                    );
                    let error_msg = ServerMessage::Error {
                        message: "Message too large".to_string(),
                    };
                    if out_tx.send(text_frame(&error_msg)).await.is_err() {
                        error!("Failed to send size limit error to {}", peer);
                    }
                    break;
                }

                match message {
                    Message::Text(text) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Chat { content }) => {
                                let turn = session.lock().await.begin_send(&content);
                                match turn {
                                    Some(turn) => {
                                        if
                                            out_tx
                                                .send(text_frame(&ServerMessage::Processing)).await
                                                .is_err()
                                        {
                                            break;
                                        }
                                        spawn_turn(
                                            turn,
                                            Arc::clone(&assistant),
                                            Arc::clone(&session),
                                            out_tx.clone(),
                                            peer
                                        );
                                    }
                                    None => {
                                        info!(
                                            "Ignoring chat from {}: blank input or a turn already in flight",
                                            peer
                                        );
                                    }
                                }
                            }
                            Ok(ClientMessage::SetPersona { persona }) => {
                                let frame = {
                                    let mut guard = session.lock().await;
                                    guard.set_persona(persona);
                                    reset_frame(&guard)
                                };
                                info!("Persona for {} switched to {}", peer, persona.as_str());
                                if out_tx.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                error!("Failed to parse message from {}: {}", peer, e);
                                let error_msg = ServerMessage::Error {
                                    message: format!("Failed to parse message: {}", e),
                                };
                                if out_tx.send(text_frame(&error_msg)).await.is_err() {
                                    error!("Error sending parse error to {}", peer);
                                    break;
                                }
                            }
                        }
                    }
                    Message::Close(_) => {
                        info!("Received close frame from {}", peer);
                        break;
                    }
                    Message::Ping(ping_data) => {
                        if out_tx.send(Message::Pong(ping_data)).await.is_err() {
                            error!("Failed to send pong to {}", peer);
                            break;
                        }
                    }
                    Message::Pong(_) => {/* Usually ignore pongs */}
                    Message::Binary(_) => {
                        warn!("Ignoring binary message from {}", peer);
                    }
                    Message::Frame(_) => {/* Usually ignore raw frames */}
                }
            }
            Err(e) => {
                match e {
                    | tokio_tungstenite::tungstenite::Error::ConnectionClosed
                    | tokio_tungstenite::tungstenite::Error::Protocol(_)
                    | tokio_tungstenite::tungstenite::Error::Utf8 => {
                        info!("WebSocket connection closed or protocol error for {}: {}", peer, e);
                    }
                    tokio_tungstenite::tungstenite::Error::Io(ref io_err) if
                        io_err.kind() == std::io::ErrorKind::ConnectionReset
                    => {
                        info!("WebSocket connection reset by peer {}", peer);
                    }
                    tokio_tungstenite::tungstenite::Error::Capacity(ref cap_err) => {
                        error!("WebSocket capacity error for {}: {}", peer, cap_err);
                        let error_msg = ServerMessage::Error {
                            message: "Server capacity error".to_string(),
                        };
                        let _ = out_tx.send(text_frame(&error_msg)).await;
                    }
                    _ => {
                        error!("Error receiving message from {}: {}", peer, e);
                    }
                }
                break;
            }
        }
    }

    // Let a turn still in flight drain through the writer before closing.
    drop(out_tx);
    let _ = writer.await;
    info!("WebSocket connection closed for {} (Conv ID: {})", peer, conversation_id);
}
