use std::{
    collections::HashMap,
    net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    config::NodeAddress,
    coverage::{CoverageEntry, PartitionRange, encode_plan},
    lock,
};

use super::{
    COVERAGE_REQUEST, ErrorResponse, Frame, FrameTransport, PING_REQUEST, PING_RESPONSE,
    ThreadPool, transport::TransportError,
};

/// What the server does after reading one request frame.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Write each frame in order.
    Frames(Vec<Frame>),
    /// Write raw bytes, which need not form whole frames.
    Raw(Vec<u8>),
    /// Write raw bytes and then close the connection.
    RawThenClose(Vec<u8>),
    /// Close the connection without answering.
    Close,
    /// Read the next request without answering this one.
    Silent,
    /// Sleep, then carry out the inner reply.
    After(Duration, Box<Reply>),
}

impl Reply {
    pub fn frame(frame: Frame) -> Self {
        Reply::Frames(vec![frame])
    }
}

/// Decides how to answer each request.
pub trait FrameHandler: Send + Sync + 'static {
    fn handle(&self, request: Frame) -> Reply;
}

impl<F> FrameHandler for F
where
    F: Fn(Frame) -> Reply + Send + Sync + 'static,
{
    fn handle(&self, request: Frame) -> Reply {
        self(request)
    }
}

/// Counters read through [`ServerHandle`].
#[derive(Debug, Default)]
struct ServerStats {
    connections: AtomicUsize,
    requests: AtomicUsize,
}

/// Answers pings, describes itself as the only coverage entry and echoes
/// everything else.
pub struct StubHandler {
    pub address: NodeAddress,
}

impl FrameHandler for StubHandler {
    fn handle(&self, request: Frame) -> Reply {
        match request.code {
            PING_REQUEST => Reply::frame(Frame::empty(PING_RESPONSE)),
            COVERAGE_REQUEST => {
                let entry = CoverageEntry {
                    range: PartitionRange::unbounded("time"),
                    host: self.address.host.clone(),
                    port: self.address.port,
                    context: self.address.to_string().into_bytes(),
                };
                match encode_plan(&[entry]).or_else(|e| {
                    ErrorResponse::new(500, e.to_string()).into_frame()
                }) {
                    Ok(frame) => Reply::frame(frame),
                    Err(_) => Reply::Close,
                }
            }
            _ => Reply::frame(request),
        }
    }
}

/// Minimal frame server that plays the part of a store node.
///
/// Each accepted connection is served on a worker thread, reading one frame
/// at a time and writing whatever the [`FrameHandler`] decides.
pub struct FrameServer {
    listener: TcpListener,
    handler: Arc<dyn FrameHandler>,
    pool: ThreadPool,
    max_frame_size: usize,
    stats: Arc<ServerStats>,
    stopped: Arc<AtomicBool>,
    clients: Arc<Mutex<HashMap<usize, TcpStream>>>,
}

impl FrameServer {
    pub fn bind<A, H>(address: A, handler: H, workers: usize) -> Result<Self, TransportError>
    where
        A: ToSocketAddrs,
        H: FrameHandler,
    {
        let listener = TcpListener::bind(address)?;
        Ok(Self {
            listener,
            handler: Arc::new(handler),
            pool: ThreadPool::new("frame-server", workers),
            max_frame_size: super::DEFAULT_MAX_FRAME_SIZE,
            stats: Arc::new(ServerStats::default()),
            stopped: Arc::new(AtomicBool::new(false)),
            clients: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves connections until stopped.
    pub fn listen(self) -> Result<(), TransportError> {
        info!("listening at {}", self.local_addr()?);

        for (id, stream) in self.listener.incoming().enumerate() {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => {
                    self.stats.connections.fetch_add(1, Ordering::SeqCst);
                    if let Ok(clone) = stream.try_clone() {
                        lock(&self.clients).insert(id, clone);
                    }

                    let handler = Arc::clone(&self.handler);
                    let stats = Arc::clone(&self.stats);
                    let clients = Arc::clone(&self.clients);
                    let max_frame_size = self.max_frame_size;
                    let queued = self.pool.execute(move || {
                        if let Err(e) =
                            handle_connection(stream, handler.as_ref(), &stats, max_frame_size)
                        {
                            debug!("connection {id} ended: {e}");
                        }
                        if let Some(s) = lock(&clients).remove(&id) {
                            let _ = s.shutdown(Shutdown::Both);
                        }
                    });
                    if queued.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }

        info!("listener stopped");
        Ok(())
    }

    /// Runs [`listen`](Self::listen) on a background thread.
    pub fn spawn(self) -> Result<ServerHandle, TransportError> {
        let address = self.local_addr()?;
        let handle = ServerHandle {
            address,
            stats: Arc::clone(&self.stats),
            stopped: Arc::clone(&self.stopped),
            clients: Arc::clone(&self.clients),
        };

        thread::Builder::new()
            .name(format!("frame-server-{}", address.port()))
            .spawn(move || {
                if let Err(e) = self.listen() {
                    warn!("frame server failed: {e}");
                }
            })?;

        Ok(handle)
    }
}

/// Control handle for a spawned [`FrameServer`].
#[derive(Clone)]
pub struct ServerHandle {
    address: SocketAddr,
    stats: Arc<ServerStats>,
    stopped: Arc<AtomicBool>,
    clients: Arc<Mutex<HashMap<usize, TcpStream>>>,
}

impl ServerHandle {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn node_address(&self) -> NodeAddress {
        self.address.into()
    }

    pub fn connections(&self) -> usize {
        self.stats.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.stats.requests.load(Ordering::SeqCst)
    }

    /// Stops accepting and closes every open client connection.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the blocked accept so the listener sees the flag.
        let _ = TcpStream::connect_timeout(&self.address, Duration::from_millis(200));
        for (_, stream) in lock(&self.clients).drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn handle_connection(
    stream: TcpStream,
    handler: &dyn FrameHandler,
    stats: &ServerStats,
    max_frame_size: usize,
) -> Result<(), TransportError> {
    let mut transport = FrameTransport::new(stream, max_frame_size);

    loop {
        let req = match transport.read_frame() {
            Ok(req) => req,
            Err(TransportError::Closed { buffered: 0 }) => return Ok(()),
            Err(e) => return Err(e),
        };
        stats.requests.fetch_add(1, Ordering::SeqCst);
        debug!("received request code={}", req.code);

        let mut reply = handler.handle(req);
        loop {
            match reply {
                Reply::After(delay, inner) => {
                    thread::sleep(delay);
                    reply = *inner;
                    continue;
                }
                Reply::Frames(frames) => {
                    for frame in frames {
                        transport.write_frame(&frame)?;
                    }
                }
                Reply::Raw(bytes) => transport.write_raw(&bytes)?,
                Reply::RawThenClose(bytes) => {
                    transport.write_raw(&bytes)?;
                    transport.stream().shutdown(Shutdown::Both)?;
                    return Ok(());
                }
                Reply::Close => {
                    transport.stream().shutdown(Shutdown::Both)?;
                    return Ok(());
                }
                Reply::Silent => {}
            }
            break;
        }
    }
}
