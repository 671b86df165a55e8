//! Server proxy: accept tunnel connections, discover the client's language
//! pair, and relay each stream to the origin.
use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;

use crate::config::{Config, Mode};
use crate::defs::{Definitions, REQUEST_SUFFIX, RESPONSE_SUFFIX};
use crate::encoder::EncoderRegistry;
use crate::encrypter::Encrypter;
use crate::errors::Error;
use crate::negotiate;
use crate::net;
use crate::record::{RecordDecoder, RecordEncoder};
use crate::relay::{self, RelayKnobs, RelayOutcome};

/// Shared server runtime state (Arc-based cheap cloning for threads).
pub struct ServerState {
    pub running: Arc<AtomicBool>,
    pub listen_addr: SocketAddr,
    /// Active tunnel connections, for visibility at shutdown.
    pub tunnels: Arc<DashMap<SocketAddr, Instant>>,
}

impl ServerState {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

/// Launch the server listener and its accept thread. Non-blocking.
///
/// Every known language is compiled up front so negotiation never builds a
/// DFA on the connection path.
pub fn start_server(cfg: &Config, listen: &str, forward: &str) -> Result<ServerState> {
    let definitions = Arc::new(cfg.definitions()?);
    for name in definitions.names() {
        println!("[SERVER] building {name}...");
    }
    let registry =
        Arc::new(EncoderRegistry::build_all(&definitions).context("build server languages")?);
    let encrypter = Encrypter::from_session_key(&cfg.session_key()?);
    let knobs = RelayKnobs::from_config(cfg, Mode::Server);
    let negotiate_timeout = Duration::from_secs(cfg.negotiate_timeout_secs);
    let max_cell = cfg.relay.encoder_block_size;

    let listener = net::listen(listen, cfg.relay.backlog)?;
    listener.set_nonblocking(true).ok();
    let listen_addr = listener.local_addr()?;
    println!("[SERVER] listening on {listen_addr}, origin {forward}");

    let state = ServerState {
        running: Arc::new(AtomicBool::new(true)),
        listen_addr,
        tunnels: Arc::new(DashMap::new()),
    };

    let running = state.running.clone();
    let tunnels = state.tunnels.clone();
    let forward = forward.to_string();
    thread::spawn(move || loop {
        if !running.load(Ordering::Relaxed) {
            break;
        }
        match listener.accept() {
            Ok((tunnel, addr)) => {
                tunnel.set_read_timeout(Some(knobs.server_timeout)).ok();
                tunnels.insert(addr, Instant::now());
                let knobs = knobs.clone();
                let encrypter = encrypter.clone();
                let definitions = definitions.clone();
                let registry = registry.clone();
                let forward = forward.clone();
                let tunnels = tunnels.clone();
                thread::spawn(move || {
                    if let Err(e) = handle_tunnel(
                        &knobs,
                        &encrypter,
                        &definitions,
                        &registry,
                        negotiate_timeout,
                        max_cell,
                        &tunnel,
                        addr,
                        &forward,
                    ) {
                        eprintln!("[SERVER] tunnel from {addr}: {e}");
                    }
                    net::close_stream(&tunnel, knobs.forceful_shutdown);
                    tunnels.remove(&addr);
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                eprintln!("[SERVER] accept err: {e}");
                thread::sleep(Duration::from_millis(200));
            }
        }
    });
    Ok(state)
}

/// Signal server shutdown (threads exit naturally when the flag flips).
pub fn stop_server(state: &ServerState) {
    state.running.store(false, Ordering::SeqCst);
    let open = state.tunnels.len();
    if open > 0 {
        println!("[SERVER] stopping with {open} tunnel(s) still open");
    }
}

/// One tunnel connection: negotiate, then run relays until the tunnel dies,
/// re-routing between per-stream-id pipelines when demultiplexing.
#[allow(clippy::too_many_arguments)]
fn handle_tunnel(
    knobs: &RelayKnobs,
    encrypter: &Encrypter,
    definitions: &Definitions,
    registry: &EncoderRegistry,
    negotiate_timeout: Duration,
    max_cell: usize,
    tunnel: &TcpStream,
    addr: SocketAddr,
    forward: &str,
) -> std::result::Result<(), Error> {
    // Negotiation: accumulate bytes until one language authenticates.
    let deadline = Instant::now() + negotiate_timeout;
    let mut buffer = Vec::new();
    let installed = loop {
        let (alive, data) = net::recv_available(tunnel, knobs.select_speed, knobs.decoder_block);
        buffer.extend_from_slice(&data);
        if !buffer.is_empty() {
            match negotiate::accept_negotiation(
                u32::from(addr.port()),
                encrypter,
                definitions,
                registry,
                &buffer,
                max_cell,
            ) {
                Ok(installed) => break installed,
                Err(Error::ChannelNotReady) => {}
                Err(e) => return Err(e),
            }
        }
        if !alive {
            return Err(Error::NegotiationFailed);
        }
        if Instant::now() > deadline {
            return Err(Error::NegotiateTimeout);
        }
    };
    if installed.release != definitions.release() {
        println!(
            "[SERVER] stream {} negotiated with definitions {} (ours: {})",
            installed.stream_id,
            installed.release,
            definitions.release()
        );
    }
    println!(
        "[SERVER] stream {} established ({}-request)",
        installed.stream_id, installed.language_base
    );

    let mut tunnel_send = tunnel.try_clone().map_err(|_| Error::ChannelNotReady)?;
    if !net::send_all(&mut tunnel_send, &installed.ack) {
        return Err(Error::ChannelNotReady);
    }

    let request_language = format!("{}{}", installed.language_base, REQUEST_SUFFIX);
    let response_language = format!("{}{}", installed.language_base, RESPONSE_SUFFIX);
    let mut origins: HashMap<u32, TcpStream> = HashMap::new();
    let mut stream_id = installed.stream_id;
    let mut encoder = installed.encoder;
    let mut decoder = installed.decoder;

    loop {
        if !origins.contains_key(&stream_id) {
            let origin = net::connect(forward, knobs.client_timeout).map_err(|e| {
                eprintln!("[SERVER] origin connect to {forward} failed: {e}");
                Error::ChannelNotReady
            })?;
            origins.insert(stream_id, origin);
        }
        let origin = origins.get(&stream_id).expect("origin just inserted");

        let outcome = relay::run(knobs, origin, tunnel, encoder, decoder)
            .map_err(|_| Error::ChannelNotReady)?;
        match outcome {
            RelayOutcome::NotMyStream {
                stream_id: next_id,
                datagram,
            } => {
                println!("[SERVER] re-routing tunnel {addr} to stream {next_id}");
                let pipeline = build_pipeline(
                    encrypter,
                    registry,
                    &request_language,
                    &response_language,
                    max_cell,
                    next_id,
                    &datagram,
                )?;
                stream_id = next_id;
                encoder = pipeline.0;
                decoder = pipeline.1;
            }
            RelayOutcome::EndOfStream { remaining } => {
                println!("[SERVER] stream {stream_id} finished");
                if let Some(origin) = origins.remove(&stream_id) {
                    net::close_stream(&origin, knobs.forceful_shutdown);
                }
                let next = if knobs.http_proxy {
                    route_remaining(
                        encrypter,
                        registry,
                        &request_language,
                        &remaining,
                    )
                } else {
                    None
                };
                match next {
                    Some(next_id) => {
                        let pipeline = build_pipeline(
                            encrypter,
                            registry,
                            &request_language,
                            &response_language,
                            max_cell,
                            next_id,
                            &remaining,
                        )?;
                        stream_id = next_id;
                        encoder = pipeline.0;
                        decoder = pipeline.1;
                    }
                    None => break,
                }
            }
            RelayOutcome::DecryptFailure => {
                eprintln!("[SERVER] stream {stream_id}: unrecoverable decryption failure");
                break;
            }
            RelayOutcome::Reset => {
                eprintln!("[SERVER] stream {stream_id}: reset");
                break;
            }
            RelayOutcome::Clean => break,
        }
    }

    for (_, origin) in origins {
        net::close_stream(&origin, knobs.forceful_shutdown);
    }
    Ok(())
}

/// Codecs for a freshly demultiplexed stream id, seeded with its datagram.
fn build_pipeline(
    encrypter: &Encrypter,
    registry: &EncoderRegistry,
    request_language: &str,
    response_language: &str,
    max_cell: usize,
    stream_id: u32,
    datagram: &[u8],
) -> std::result::Result<(RecordEncoder, RecordDecoder), Error> {
    let encoder = RecordEncoder::new(
        stream_id,
        encrypter.clone(),
        registry.get(response_language)?,
        max_cell,
    )?;
    let mut decoder = RecordDecoder::new(
        stream_id,
        encrypter.clone(),
        registry.get(request_language)?,
    )?;
    decoder.push(datagram);
    Ok((encoder, decoder))
}

/// Which stream id the leftover buffer belongs to, if it holds a full cell.
fn route_remaining(
    encrypter: &Encrypter,
    registry: &EncoderRegistry,
    request_language: &str,
    remaining: &[u8],
) -> Option<u32> {
    let scratch =
        RecordDecoder::new(0, encrypter.clone(), registry.get(request_language).ok()?).ok()?;
    if remaining.len() < scratch.template_len() {
        return None;
    }
    scratch
        .peek_stream_id(&remaining[..scratch.template_len()])
        .ok()
}
