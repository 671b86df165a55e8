//! Client proxy: accept local application connections, open a tunnel to the
//! server, negotiate the language pair, then relay.
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;

use crate::config::{Config, Mode};
use crate::encoder::EncoderRegistry;
use crate::encrypter::Encrypter;
use crate::errors::Error;
use crate::negotiate;
use crate::net;
use crate::relay::{self, RelayKnobs, RelayOutcome};

/// Consecutive handshake timeouts before the client gives up entirely.
const NEGOTIATE_TIMEOUT_LIMIT: u32 = 3;

/// Shared client runtime state (Arc-based cheap cloning for threads).
pub struct ClientState {
    pub running: Arc<AtomicBool>,
    pub listen_addr: SocketAddr,
    fatal: Arc<Mutex<Option<Error>>>,
    consecutive_timeouts: Arc<AtomicU32>,
}

impl ClientState {
    pub fn take_fatal(&self) -> Option<Error> {
        self.fatal.lock().take()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

/// Launch the client listener and its accept thread. Non-blocking.
pub fn start_client(cfg: &Config, listen: &str, forward: &str) -> Result<ClientState> {
    cfg.validate()?;
    let definitions = cfg.definitions()?;
    let registry = Arc::new(
        EncoderRegistry::build(
            &definitions,
            &[cfg.upstream_language.as_str(), cfg.downstream_language.as_str()],
        )
        .context("build client languages")?,
    );
    let encrypter = Encrypter::from_session_key(&cfg.session_key()?);
    let release = definitions.release().to_string();
    let knobs = RelayKnobs::from_config(cfg, Mode::Client);
    let negotiate_timeout = Duration::from_secs(cfg.negotiate_timeout_secs);
    let max_cell = cfg.relay.encoder_block_size;
    let upstream = cfg.upstream_language.clone();
    let downstream = cfg.downstream_language.clone();

    let listener = net::listen(listen, cfg.relay.backlog)?;
    listener.set_nonblocking(true).ok();
    let listen_addr = listener.local_addr()?;
    println!("[CLIENT] listening on {listen_addr}, forwarding via {forward} ({upstream})");

    let state = ClientState {
        running: Arc::new(AtomicBool::new(true)),
        listen_addr,
        fatal: Arc::new(Mutex::new(None)),
        consecutive_timeouts: Arc::new(AtomicU32::new(0)),
    };

    let running = state.running.clone();
    let fatal = state.fatal.clone();
    let timeouts = state.consecutive_timeouts.clone();
    let forward = forward.to_string();
    thread::spawn(move || loop {
        if !running.load(Ordering::Relaxed) {
            break;
        }
        match listener.accept() {
            Ok((app, addr)) => {
                let knobs = knobs.clone();
                let encrypter = encrypter.clone();
                let registry = registry.clone();
                let release = release.clone();
                let upstream = upstream.clone();
                let downstream = downstream.clone();
                let forward = forward.clone();
                let running = running.clone();
                let fatal = fatal.clone();
                let timeouts = timeouts.clone();
                thread::spawn(move || {
                    let result = handle_app_connection(
                        &knobs,
                        &encrypter,
                        &registry,
                        &release,
                        &upstream,
                        &downstream,
                        negotiate_timeout,
                        max_cell,
                        app,
                        addr,
                        &forward,
                    );
                    match result {
                        Ok(()) => {
                            timeouts.store(0, Ordering::Relaxed);
                        }
                        Err(Error::NegotiateTimeout) => {
                            let n = timeouts.fetch_add(1, Ordering::Relaxed) + 1;
                            eprintln!("[CLIENT] negotiation timeout ({n} in a row)");
                            if n >= NEGOTIATE_TIMEOUT_LIMIT {
                                *fatal.lock() = Some(Error::NegotiateTimeout);
                                running.store(false, Ordering::SeqCst);
                            }
                        }
                        Err(e) => {
                            timeouts.store(0, Ordering::Relaxed);
                            eprintln!("[CLIENT] stream from {addr} failed: {e}");
                        }
                    }
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                eprintln!("[CLIENT] accept err: {e}");
                thread::sleep(Duration::from_millis(200));
            }
        }
    });
    Ok(state)
}

/// Signal client shutdown (threads exit naturally when the flag flips).
pub fn stop_client(state: &ClientState) {
    state.running.store(false, Ordering::SeqCst);
}

/// One application connection: tunnel connect, handshake, relay, teardown.
#[allow(clippy::too_many_arguments)]
fn handle_app_connection(
    knobs: &RelayKnobs,
    encrypter: &Encrypter,
    registry: &EncoderRegistry,
    release: &str,
    upstream: &str,
    downstream: &str,
    negotiate_timeout: Duration,
    max_cell: usize,
    app: TcpStream,
    app_addr: SocketAddr,
    forward: &str,
) -> std::result::Result<(), Error> {
    let stream_id = u32::from(app_addr.port());
    let mut tunnel = match net::connect(forward, knobs.client_timeout) {
        Ok(sock) => sock,
        Err(e) => {
            eprintln!("[CLIENT] tunnel connect to {forward} failed: {e}");
            net::close_stream(&app, knobs.forceful_shutdown);
            return Ok(());
        }
    };

    let mut codecs = negotiate::build_client_codecs(
        stream_id, encrypter, registry, upstream, downstream, max_cell,
    )?;
    let hello = negotiate::client_hello(&codecs.encoder, release)?;
    if !net::send_all(&mut tunnel, &hello) {
        net::close_stream(&app, knobs.forceful_shutdown);
        return Err(Error::ChannelNotReady);
    }

    // Wait for the acknowledgement on the already-installed decoder; any
    // data the server sent right behind it stays buffered for the relay.
    let deadline = Instant::now() + negotiate_timeout;
    loop {
        let (alive, data) = net::recv_available(&tunnel, knobs.select_speed, max_cell);
        codecs.decoder.push(&data);
        match negotiate::check_acknowledge(&mut codecs.decoder) {
            Ok(true) => break,
            Ok(false) => {
                if !alive || Instant::now() > deadline {
                    net::close_stream(&tunnel, knobs.forceful_shutdown);
                    net::close_stream(&app, knobs.forceful_shutdown);
                    return Err(Error::NegotiateTimeout);
                }
            }
            Err(e) => {
                net::close_stream(&tunnel, knobs.forceful_shutdown);
                net::close_stream(&app, knobs.forceful_shutdown);
                return Err(e);
            }
        }
    }
    println!("[CLIENT] stream {stream_id} established ({upstream})");

    let outcome = relay::run(knobs, &app, &tunnel, codecs.encoder, codecs.decoder)
        .map_err(|_| Error::ChannelNotReady)?;
    match &outcome {
        RelayOutcome::DecryptFailure => {
            eprintln!("[CLIENT] stream {stream_id}: unrecoverable decryption failure")
        }
        RelayOutcome::Reset => eprintln!("[CLIENT] stream {stream_id}: reset"),
        _ => println!("[CLIENT] stream {stream_id} closed"),
    }
    net::close_stream(&tunnel, knobs.forceful_shutdown);
    net::close_stream(&app, knobs.forceful_shutdown);
    Ok(())
}
