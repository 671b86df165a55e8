//! Per-connection relay: two cooperating workers over one socket pair.
//!
//! The encoder worker reads plaintext from the application-side socket and
//! writes covert strings to the tunnel; the decoder worker reads covert
//! bytes from the tunnel and writes recovered plaintext back. The pair
//! shares a mutex-guarded `StreamStatus`, polls it between short sleeps, and
//! winds down cooperatively: a worker exits when its input is closed and
//! drained, when its output is closed, or when its peer has exited and its
//! own buffers are empty.
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{Config, Mode};
use crate::encrypter::MsgType;
use crate::errors::Error;
use crate::net;
use crate::record::{RecordDecoder, RecordEncoder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Sending,
    Receiving,
}

/// Everything the relay tickles per cycle; copied out of `Config` once so
/// the workers never consult configuration.
#[derive(Clone)]
pub struct RelayKnobs {
    pub mode: Mode,
    pub clock_speed: Duration,
    pub select_speed: Duration,
    pub encoder_block: usize,
    pub decoder_block: usize,
    pub tcp_timeout: Duration,
    /// Read patience granted to a freshly accepted tunnel socket.
    pub server_timeout: Duration,
    /// Bound on outbound connects (tunnel from the client, origin from the
    /// server).
    pub client_timeout: Duration,
    pub http_proxy: bool,
    pub forceful_shutdown: bool,
    pub nolinger: bool,
}

impl RelayKnobs {
    pub fn from_config(cfg: &Config, mode: Mode) -> Self {
        Self {
            mode,
            clock_speed: Duration::from_millis(cfg.relay.clock_speed_ms),
            select_speed: Duration::from_millis(cfg.relay.select_speed_ms),
            encoder_block: cfg.relay.encoder_block_size,
            decoder_block: cfg.relay.decoder_block_size,
            tcp_timeout: Duration::from_secs(cfg.tcp_timeout_secs),
            server_timeout: Duration::from_secs(cfg.relay.server_timeout_secs),
            client_timeout: Duration::from_secs(cfg.relay.client_timeout_secs),
            http_proxy: cfg.http_proxy_enable,
            forceful_shutdown: cfg.relay.forceful_shutdown,
            nolinger: cfg.relay.nolinger,
        }
    }
}

/// Shared liveness picture. `None` means "not observed yet"; the workers
/// only ever narrow it to `Some`.
pub struct StreamStatus {
    /// Application-side socket (origin on the server, local app on the client).
    pub source_alive: Option<bool>,
    /// Tunnel socket.
    pub sink_alive: Option<bool>,
    pub phase: Phase,
    pub encoder_exited: bool,
    pub decoder_exited: bool,
    pub encoder_pushed_at: Instant,
    pub decoder_pushed_at: Instant,
    pub cells_sent: u64,
    pub cells_received: u64,
    pub cycles: u64,
}

impl StreamStatus {
    fn new(mode: Mode) -> Self {
        let now = Instant::now();
        Self {
            source_alive: None,
            sink_alive: None,
            phase: match mode {
                Mode::Client => Phase::Sending,
                Mode::Server => Phase::Receiving,
            },
            encoder_exited: false,
            decoder_exited: false,
            encoder_pushed_at: now,
            decoder_pushed_at: now,
            cells_sent: 0,
            cells_received: 0,
            cycles: 0,
        }
    }

    /// Both directions quiet for longer than the connection timeout.
    fn idle_longer_than(&self, timeout: Duration) -> bool {
        let now = Instant::now();
        now.duration_since(self.encoder_pushed_at) > timeout
            && now.duration_since(self.decoder_pushed_at) > timeout
    }
}

/// How a worker pair ended; drives the caller's teardown.
#[derive(Debug)]
pub enum RelayOutcome {
    Clean,
    /// The peer marked this stream finished; `remaining` is whatever was
    /// buffered past the end-of-stream cell.
    EndOfStream { remaining: Vec<u8> },
    /// A cell authenticated for a different stream arrived; the demultiplexer
    /// owns the datagram now.
    NotMyStream { stream_id: u32, datagram: Vec<u8> },
    DecryptFailure,
    Reset,
}

/// A worker's terminal error plus the bytes the caller inherits with it
/// (post-end-of-stream remainder, or a foreign stream's datagram).
struct WorkerFault {
    error: Error,
    carry: Vec<u8>,
}

/// Run one relay to completion. `app` is the plaintext side, `tunnel` the
/// covert side; the decoder may come pre-seeded with post-negotiation bytes.
pub fn run(
    knobs: &RelayKnobs,
    app: &TcpStream,
    tunnel: &TcpStream,
    encoder: RecordEncoder,
    decoder: RecordDecoder,
) -> anyhow::Result<RelayOutcome> {
    if knobs.nolinger {
        net::set_nolinger(app);
        net::set_nolinger(tunnel);
    }
    let status = Arc::new(Mutex::new(StreamStatus::new(knobs.mode)));

    let enc_handle = {
        let knobs = knobs.clone();
        let status = status.clone();
        let source = app.try_clone()?;
        let sink = tunnel.try_clone()?;
        thread::spawn(move || encoder_worker(&knobs, &status, source, sink, encoder))
    };
    let dec_handle = {
        let knobs = knobs.clone();
        let status = status.clone();
        let source = app.try_clone()?;
        let sink = tunnel.try_clone()?;
        thread::spawn(move || decoder_worker(&knobs, &status, source, sink, decoder))
    };

    let enc_result = enc_handle.join();
    let dec_result = dec_handle.join();

    let outcome = match dec_result {
        Ok(Ok(())) => match enc_result {
            Ok(Ok(())) => RelayOutcome::Clean,
            Ok(Err(_)) | Err(_) => RelayOutcome::Reset,
        },
        Ok(Err(fault)) => match fault.error {
            Error::EndOfStream => RelayOutcome::EndOfStream {
                remaining: fault.carry,
            },
            Error::NotMyStream(stream_id) => RelayOutcome::NotMyStream {
                stream_id,
                datagram: fault.carry,
            },
            Error::UnrecoverableDecryptionFailure => RelayOutcome::DecryptFailure,
            _ => RelayOutcome::Reset,
        },
        Err(_) => RelayOutcome::Reset,
    };
    Ok(outcome)
}

fn encoder_should_exit(knobs: &RelayKnobs, status: &StreamStatus) -> bool {
    if status.decoder_exited {
        return true;
    }
    match knobs.mode {
        Mode::Server => {
            status.sink_alive == Some(false) || status.source_alive == Some(false)
        }
        Mode::Client => {
            status.source_alive == Some(false)
                || status.sink_alive == Some(false)
                || status.idle_longer_than(knobs.tcp_timeout)
        }
    }
}

fn decoder_should_exit(knobs: &RelayKnobs, status: &StreamStatus, drained: bool) -> bool {
    if status.encoder_exited && drained {
        return true;
    }
    match knobs.mode {
        Mode::Client => {
            status.source_alive == Some(false)
                || (status.sink_alive == Some(false) && drained)
        }
        Mode::Server => {
            status.sink_alive == Some(false)
                || (status.source_alive == Some(false) && drained)
        }
    }
}

/// Application bytes -> covert strings. Exits only from the drained state,
/// after queueing exactly one end-of-stream cell if its input closed.
fn encoder_worker(
    knobs: &RelayKnobs,
    status: &Mutex<StreamStatus>,
    source: TcpStream,
    mut sink: TcpStream,
    mut encoder: RecordEncoder,
) -> Result<(), Error> {
    let mut eos_sent = false;
    let result = loop {
        if status.lock().source_alive != Some(false) {
            let (alive, data) = net::recv_available(&source, knobs.select_speed, knobs.encoder_block);
            let mut st = status.lock();
            st.source_alive = Some(alive);
            if !data.is_empty() {
                st.encoder_pushed_at = Instant::now();
                drop(st);
                encoder.push(&data);
            }
        }

        if !encoder.has_pending() {
            if status.lock().source_alive == Some(false) && !eos_sent {
                eos_sent = true;
                match encoder.encode_cell(MsgType::EndOfStream, b"") {
                    Ok(covertext) => {
                        // Payload I/O runs outside the status lock; the
                        // socket itself is half-duplex safe.
                        if status.lock().sink_alive != Some(false) {
                            let delivered = net::send_all(&mut sink, &covertext);
                            status.lock().sink_alive = Some(delivered);
                        }
                    }
                    Err(_) => break Err(Error::TcpReset),
                }
            }
            if encoder_should_exit(knobs, &status.lock()) {
                break Ok(());
            }
            thread::sleep(knobs.clock_speed);
            continue;
        }

        let mut msg = Vec::new();
        loop {
            match encoder.pop() {
                Ok(Some(covertext)) => msg.extend_from_slice(&covertext),
                Ok(None) => break,
                // The outgoing language cannot express anything further.
                Err(_) => return finish_encoder(status, Err(Error::TcpReset)),
            }
        }
        if !msg.is_empty() && status.lock().sink_alive != Some(false) {
            let delivered = net::send_all(&mut sink, &msg);
            let mut st = status.lock();
            st.sink_alive = Some(delivered);
            if delivered {
                st.phase = Phase::Receiving;
                st.cells_sent += 1;
                st.cycles += 1;
            }
        }
    };
    finish_encoder(status, result)
}

fn finish_encoder(
    status: &Mutex<StreamStatus>,
    result: Result<(), Error>,
) -> Result<(), Error> {
    status.lock().encoder_exited = true;
    result
}

/// Covert bytes -> application bytes. Watches for foreign stream ids when
/// the server demultiplexes, and surfaces end-of-stream to the caller.
fn decoder_worker(
    knobs: &RelayKnobs,
    status: &Mutex<StreamStatus>,
    mut source: TcpStream,
    sink: TcpStream,
    mut decoder: RecordDecoder,
) -> Result<(), WorkerFault> {
    let result = loop {
        if status.lock().sink_alive != Some(false) {
            let (alive, data) = net::recv_available(&sink, knobs.select_speed, knobs.decoder_block);
            status.lock().sink_alive = Some(alive);
            decoder.push(&data);
        }

        if !decoder.has_pending() {
            if decoder_should_exit(knobs, &status.lock(), true) {
                break Ok(());
            }
            thread::sleep(knobs.clock_speed);
            continue;
        }

        if knobs.mode == Mode::Server
            && knobs.http_proxy
            && decoder.buffered().len() >= decoder.template_len()
        {
            let head = decoder.buffered()[..decoder.template_len()].to_vec();
            if let Ok(stream_id) = decoder.peek_stream_id(&head) {
                if stream_id != decoder.stream_id() {
                    break Err(WorkerFault {
                        error: Error::NotMyStream(stream_id),
                        carry: decoder.take_buffer(),
                    });
                }
            }
        }

        {
            let mut st = status.lock();
            st.phase = Phase::Sending;
            st.cells_received += 1;
            st.cycles += 1;
        }

        let mut msg = Vec::new();
        let mut fault = None;
        loop {
            match decoder.pop() {
                Ok(Some((fragment, more))) => {
                    msg.extend_from_slice(&fragment);
                    if !more {
                        break;
                    }
                }
                Ok(None) => break,
                Err(Error::EndOfStream) => {
                    fault = Some(WorkerFault {
                        error: Error::EndOfStream,
                        carry: decoder.take_buffer(),
                    });
                    break;
                }
                Err(_) => {
                    fault = Some(WorkerFault {
                        error: Error::UnrecoverableDecryptionFailure,
                        carry: Vec::new(),
                    });
                    break;
                }
            }
        }

        if !msg.is_empty() && status.lock().source_alive != Some(false) {
            let delivered = net::send_all(&mut source, &msg);
            let mut st = status.lock();
            st.source_alive = Some(delivered);
            if delivered {
                st.decoder_pushed_at = Instant::now();
            }
        }

        if let Some(fault) = fault {
            break Err(fault);
        }
        let drained = !decoder.has_pending();
        if decoder_should_exit(knobs, &status.lock(), drained) {
            break Ok(());
        }
    };
    status.lock().decoder_exited = true;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::defs::load_definitions;
    use crate::encoder::EncoderRegistry;
    use crate::encrypter::Encrypter;
    use crate::net::pick_free_port;
    use pretty_assertions::assert_eq;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    fn knobs(mode: Mode) -> RelayKnobs {
        let mut cfg = Config::default();
        cfg.relay.clock_speed_ms = 5;
        cfg.relay.select_speed_ms = 5;
        RelayKnobs::from_config(&cfg, mode)
    }

    fn codec_pair(
        stream_id: u32,
        outgoing: &str,
        incoming: &str,
    ) -> (RecordEncoder, RecordDecoder) {
        let registry = EncoderRegistry::build_all(load_definitions()).unwrap();
        let encrypter = Encrypter::from_session_key(&[0x77; 32]);
        let encoder = RecordEncoder::new(
            stream_id,
            encrypter.clone(),
            registry.get(outgoing).unwrap(),
            4096,
        )
        .unwrap();
        let decoder =
            RecordDecoder::new(stream_id, encrypter, registry.get(incoming).unwrap()).unwrap();
        (encoder, decoder)
    }

    /// Two relays wired tunnel-to-tunnel carry bytes both ways and exit
    /// when the client application closes.
    #[test]
    fn paired_relays_carry_both_directions() {
        let tunnel_port = pick_free_port().unwrap();
        let tunnel_listener = TcpListener::bind(("127.0.0.1", tunnel_port)).unwrap();

        // Server side: relay between an in-test echo origin and the tunnel.
        let server = std::thread::spawn(move || {
            let (tunnel, _) = tunnel_listener.accept().unwrap();
            let origin_listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
            let origin_addr = origin_listener.local_addr().unwrap();
            let echo = std::thread::spawn(move || {
                let (mut sock, _) = origin_listener.accept().unwrap();
                let mut buf = [0u8; 1024];
                loop {
                    match sock.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if sock.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
            let origin = TcpStream::connect(origin_addr).unwrap();
            let (encoder, decoder) = codec_pair(9, "http-response", "http-request");
            let outcome = run(&knobs(Mode::Server), &origin, &tunnel, encoder, decoder).unwrap();
            net::close_stream(&origin, true);
            echo.join().unwrap();
            outcome
        });

        let tunnel = TcpStream::connect(("127.0.0.1", tunnel_port)).unwrap();
        let app_listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let app_addr = app_listener.local_addr().unwrap();
        let mut app = TcpStream::connect(app_addr).unwrap();
        let (app_peer, _) = app_listener.accept().unwrap();

        let (encoder, decoder) = codec_pair(9, "http-request", "http-response");
        let client = std::thread::spawn(move || {
            run(&knobs(Mode::Client), &app_peer, &tunnel, encoder, decoder).unwrap()
        });

        app.write_all(b"ping over the covert channel").unwrap();
        let mut echoed = vec![0u8; 28];
        app.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"ping over the covert channel");

        drop(app);
        let client_outcome = client.join().unwrap();
        assert!(matches!(
            client_outcome,
            RelayOutcome::Clean | RelayOutcome::Reset
        ));
        let server_outcome = server.join().unwrap();
        assert!(matches!(
            server_outcome,
            RelayOutcome::EndOfStream { .. } | RelayOutcome::Clean
        ));
    }
}
