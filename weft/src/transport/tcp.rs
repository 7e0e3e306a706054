//! TCP transport.
//!
//! One actor per connection in a split-pump loop: drain queued writes,
//! flush, then read with a short timeout so writes are never starved.
//! Inbound bytes run through the stream reassembler and surface as one
//! [`NetEvent::Received`] per complete frame.
//!
//! Connections are opened on demand by `send`/`connect`, shared between
//! the listener and the dialer side, and reference-counted: `disconnect`
//! drops one reference and the last reference closes the socket.

use crate::addr::NodeAddr;
use crate::transport::{NetEvent, Transport};
use bytes::Bytes;
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use compio::net::{TcpListener, TcpStream};
use flume::{Receiver, Sender};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};
use weft_core::error::{Result, WeftError};
use weft_wire::frame::{encode_stream_frame, StreamDecoder};

const READ_BUF_CAP: usize = 8192;
const READ_POLL: Duration = Duration::from_millis(10);

#[derive(Debug)]
enum ConnCmd {
    Send(Bytes),
    Close,
}

struct ConnHandle {
    cmd_tx: Sender<ConnCmd>,
    refs: u32,
}

type ConnMap = Arc<Mutex<HashMap<SocketAddr, ConnHandle>>>;

/// TCP transport bound to a listen port.
pub struct TcpTransport {
    local: NodeAddr,
    events: Sender<NetEvent>,
    conns: ConnMap,
    // Dropping the handle cancels the accept loop
    _accept_task: Option<compio::runtime::Task<()>>,
}

impl TcpTransport {
    /// Bind `port` (zero picks an ephemeral port) and start accepting.
    ///
    /// Must be called on the compio runtime; the returned transport posts
    /// its events into `events`.
    pub async fn start(port: u16, events: Sender<NetEvent>) -> Result<Self> {
        let listener = TcpListener::bind(format!("0.0.0.0:{port}"))
            .await
            .map_err(|_| WeftError::Network)?;
        let local = listener.local_addr().map_err(|_| WeftError::Network)?;
        debug!("[TCP] listening on {}", local);

        let conns: ConnMap = Arc::new(Mutex::new(HashMap::new()));
        let accept_task = compio::runtime::spawn(accept_loop(
            listener,
            conns.clone(),
            events.clone(),
        ));

        Ok(Self {
            local: NodeAddr::Tcp(local),
            events,
            conns,
            _accept_task: Some(accept_task),
        })
    }

    fn ensure_conn(&self, sa: SocketAddr) -> Sender<ConnCmd> {
        let mut conns = self.conns.lock();
        if let Some(handle) = conns.get(&sa) {
            return handle.cmd_tx.clone();
        }
        let (cmd_tx, cmd_rx) = flume::unbounded();
        conns.insert(
            sa,
            ConnHandle {
                cmd_tx: cmd_tx.clone(),
                refs: 0,
            },
        );
        compio::runtime::spawn(dial_and_run(
            sa,
            cmd_rx,
            self.conns.clone(),
            self.events.clone(),
        ))
        .detach();
        cmd_tx
    }

    fn socket_addr(to: &NodeAddr) -> Result<SocketAddr> {
        match to {
            NodeAddr::Tcp(sa) => Ok(*sa),
            NodeAddr::Inproc(_) => Err(WeftError::Args),
        }
    }
}

impl Transport for TcpTransport {
    fn local_addr(&self) -> NodeAddr {
        self.local.clone()
    }

    fn connect(&mut self, to: &NodeAddr) -> Result<()> {
        let sa = Self::socket_addr(to)?;
        let established = {
            let conns = self.conns.lock();
            conns.contains_key(&sa)
        };
        self.ensure_conn(sa);
        if let Some(handle) = self.conns.lock().get_mut(&sa) {
            handle.refs += 1;
        }
        if established {
            // Already connected; complete immediately
            let _ = self.events.send(NetEvent::Connected { addr: to.clone() });
        }
        Ok(())
    }

    fn send(&mut self, to: &NodeAddr, frame: Bytes) -> Result<()> {
        let sa = Self::socket_addr(to)?;
        let cmd_tx = self.ensure_conn(sa);
        cmd_tx
            .send(ConnCmd::Send(frame))
            .map_err(|_| WeftError::Network)
    }

    fn disconnect(&mut self, to: &NodeAddr) {
        let Ok(sa) = Self::socket_addr(to) else {
            return;
        };
        let mut conns = self.conns.lock();
        if let Some(handle) = conns.get_mut(&sa) {
            handle.refs = handle.refs.saturating_sub(1);
            if handle.refs == 0 {
                let _ = handle.cmd_tx.send(ConnCmd::Close);
                conns.remove(&sa);
            }
        }
    }

    fn shutdown(&mut self) {
        let mut conns = self.conns.lock();
        for (_, handle) in conns.drain() {
            let _ = handle.cmd_tx.send(ConnCmd::Close);
        }
        self._accept_task = None;
    }
}

async fn accept_loop(listener: TcpListener, conns: ConnMap, events: Sender<NetEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let Ok(peer) = stream.peer_addr() else {
                    continue;
                };
                trace!("[TCP] accepted {}", peer);
                let (cmd_tx, cmd_rx) = flume::unbounded();
                conns.lock().insert(peer, ConnHandle { cmd_tx, refs: 0 });
                compio::runtime::spawn(conn_actor(
                    stream,
                    peer,
                    cmd_rx,
                    conns.clone(),
                    events.clone(),
                ))
                .detach();
            }
            Err(e) => {
                warn!("[TCP] accept failed: {}", e);
                break;
            }
        }
    }
}

async fn dial_and_run(
    sa: SocketAddr,
    cmd_rx: Receiver<ConnCmd>,
    conns: ConnMap,
    events: Sender<NetEvent>,
) {
    match TcpStream::connect(sa).await {
        Ok(stream) => {
            let _ = events.send(NetEvent::Connected {
                addr: NodeAddr::Tcp(sa),
            });
            conn_actor(stream, sa, cmd_rx, conns, events).await;
        }
        Err(e) => {
            debug!("[TCP] connect {} failed: {}", sa, e);
            conns.lock().remove(&sa);
            let _ = events.send(NetEvent::ConnectFailed {
                addr: NodeAddr::Tcp(sa),
                error: WeftError::from(e),
            });
        }
    }
}

/// Split-pump connection actor: application bytes out, framed messages in.
async fn conn_actor(
    mut stream: TcpStream,
    peer: SocketAddr,
    cmd_rx: Receiver<ConnCmd>,
    conns: ConnMap,
    events: Sender<NetEvent>,
) {
    let addr = NodeAddr::Tcp(peer);
    let mut decoder = StreamDecoder::new();
    let mut close_error = WeftError::Eof;

    'outer: loop {
        // === WRITE PUMP (non-blocking drain) ===
        while let Ok(cmd) = cmd_rx.try_recv() {
            match cmd {
                ConnCmd::Send(frame) => {
                    let framed = encode_stream_frame("", &frame);
                    let BufResult(res, _) = stream.write_all(framed.to_vec()).await;
                    let status = res.map(|_| ()).map_err(|_| WeftError::Network);
                    let failed = status.is_err();
                    let _ = events.send(NetEvent::SendComplete {
                        to: addr.clone(),
                        status,
                    });
                    if failed {
                        close_error = WeftError::Network;
                        break 'outer;
                    }
                }
                ConnCmd::Close => {
                    close_error = WeftError::Eof;
                    break 'outer;
                }
            }
        }

        // === READ PUMP (bounded wait so writes stay live) ===
        let read = compio::time::timeout(READ_POLL, stream.read(Vec::with_capacity(READ_BUF_CAP)));
        match read.await {
            Err(_elapsed) => {} // no data this tick; check writes again
            Ok(BufResult(Ok(0), _)) => {
                close_error = WeftError::Eof;
                break;
            }
            Ok(BufResult(Ok(n), buf)) => {
                decoder.push(&buf[..n]);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(frame)) => {
                            let _ = events.send(NetEvent::Received {
                                from: addr.clone(),
                                bytes: frame.envelope,
                            });
                        }
                        Ok(None) => break,
                        Err(e) => {
                            // Framing violation: the connection is unusable
                            warn!("[TCP] bad frame from {}: {}", peer, e);
                            close_error = e;
                            break 'outer;
                        }
                    }
                }
            }
            Ok(BufResult(Err(e), _)) => {
                close_error = WeftError::from(e);
                break;
            }
        }
    }

    conns.lock().remove(&peer);
    let _ = events.send(NetEvent::PeerClosed {
        addr,
        error: close_error,
    });
}
