//! Store daemon
//!
//! Listens on a Unix socket and serves the framed protocol from
//! [`crate::protocol`]. Each connection runs in its own task and handles its
//! requests strictly in order. Unsealed objects created on a connection are
//! aborted when it closes, so a writer that dies mid-put never leaks bytes.

mod arena;
mod table;

pub use table::ObjectTable;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, StoreConfig};
use crate::error::{ShmError, ShmResult};
use crate::protocol::{self, frame_kind, Request, Response};
use arena::{clear_stale_arenas, create_arena, remove_arena};
use table::SessionId;

/// State shared by every connection task
struct StoreState {
    config: StoreConfig,
    store_id: u64,
    table: ObjectTable,
}

impl StoreState {
    fn handle(&self, session: SessionId, request: Request) -> Response {
        let op = request.op_name();
        let result = match request {
            Request::Hello { pid } => {
                debug!(session, pid, "Client hello");
                Ok(Response::Welcome {
                    store_id: self.store_id,
                    shm_dir: self.table.dir().to_path_buf(),
                    capacity_bytes: self.config.capacity_bytes,
                })
            }
            Request::Create { id, meta, nbytes } => self
                .table
                .create(session, id, meta.clone(), nbytes)
                .map(|segment| Response::Segment { meta, segment }),
            Request::Seal { id } => self.table.seal(session, &id).map(|()| Response::Done),
            Request::Abort { id } => self.table.abort(session, &id).map(|()| Response::Done),
            Request::Link { id, source } => self
                .table
                .link(id, &source)
                .map(|(meta, segment)| Response::Segment { meta, segment }),
            Request::Get { id } => self
                .table
                .get(&id)
                .map(|(meta, segment)| Response::Segment { meta, segment }),
            Request::Contains { id } => Ok(Response::Bool(self.table.contains(&id))),
            Request::List => Ok(Response::Ids(self.table.list())),
            Request::Delete { id } => self.table.delete(&id).map(|()| Response::Done),
            Request::Stats => Ok(Response::Stats(self.table.stats())),
        };
        result.unwrap_or_else(|e| {
            debug!(session, op, error = %e, "Request failed");
            Response::from_error(&e)
        })
    }
}

/// Shared-memory tensor store bound to its endpoint
pub struct StoreServer {
    listener: UnixListener,
    state: Arc<StoreState>,
    next_session: AtomicU64,
}

impl StoreServer {
    /// Bind the endpoint and create this store's arena inside `shm_dir`.
    ///
    /// A socket file left by a dead store is replaced; a live store on the
    /// same endpoint is an error. Stores on other endpoints may share
    /// `shm_dir`: each allocates segments in its own arena, and only arenas
    /// of stores that are no longer running are removed.
    pub async fn bind(config: StoreConfig) -> ShmResult<Self> {
        config.validate()?;

        remove_stale_socket(&config.socket_path)?;
        if let Some(parent) = config.socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let listener = UnixListener::bind(&config.socket_path).map_err(|e| {
            ShmError::Connection(format!(
                "failed to bind {}: {e}",
                config.socket_path.display()
            ))
        })?;

        let store_id = rand::random::<u64>();
        let arena = match prepare_arena(&config, store_id) {
            Ok(arena) => arena,
            Err(e) => {
                let _ = std::fs::remove_file(&config.socket_path);
                return Err(e);
            }
        };
        info!(
            socket = %config.socket_path.display(),
            arena = %arena.display(),
            capacity_bytes = config.capacity_bytes,
            "Store listening"
        );

        let table = ObjectTable::new(&arena, config.capacity_bytes);
        Ok(Self {
            listener,
            state: Arc::new(StoreState {
                config,
                store_id,
                table,
            }),
            next_session: AtomicU64::new(1),
        })
    }

    /// Random token identifying this store instance
    pub fn store_id(&self) -> u64 {
        self.state.store_id
    }

    /// Endpoint path
    pub fn socket_path(&self) -> &Path {
        &self.state.config.socket_path
    }

    /// Object index
    pub fn table(&self) -> &ObjectTable {
        &self.state.table
    }

    /// Serve until SIGINT or SIGTERM
    pub async fn run(self) -> ShmResult<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve until `shutdown` completes, then remove the endpoint and the
    /// arena
    pub async fn run_until<F>(self, shutdown: F) -> ShmResult<()>
    where
        F: Future<Output = ()>,
    {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let session = self.next_session.fetch_add(1, Ordering::Relaxed);
                            let state = Arc::clone(&self.state);
                            let shutdown_rx = shutdown_tx.subscribe();
                            tokio::spawn(serve_connection(stream, state, session, shutdown_rx));
                        }
                        Err(e) => {
                            // usually descriptor exhaustion; back off and keep serving
                            warn!(error = %e, "Accept failed");
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    }
                }
                _ = &mut shutdown => break,
            }
        }

        let _ = shutdown_tx.send(());
        self.state.table.clear();
        remove_arena(self.state.table.dir());
        if let Err(e) = std::fs::remove_file(&self.state.config.socket_path) {
            debug!(error = %e, "Socket already removed");
        }
        info!(socket = %self.state.config.socket_path.display(), "Store stopped");
        Ok(())
    }
}

async fn serve_connection(
    mut stream: UnixStream,
    state: Arc<StoreState>,
    session: SessionId,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    debug!(session, "Connection opened");
    let max_frame = state.config.max_frame_bytes;

    loop {
        let read = tokio::select! {
            read = protocol::read_frame_async::<_, Request>(&mut stream, frame_kind::REQUEST, max_frame) => read,
            _ = shutdown_rx.recv() => break,
        };
        let request = match read {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                warn!(session, error = %e, "Dropping connection after bad frame");
                let reply = Response::from_error(&e);
                let _ = protocol::write_frame_async(&mut stream, frame_kind::RESPONSE, &reply).await;
                break;
            }
        };

        let response = state.handle(session, request);
        if let Err(e) =
            protocol::write_frame_async(&mut stream, frame_kind::RESPONSE, &response).await
        {
            debug!(session, error = %e, "Failed to send response");
            break;
        }
    }

    let aborted = state.table.abort_session(session);
    if aborted > 0 {
        info!(session, aborted, "Aborted unsealed objects of closed connection");
    }
    debug!(session, "Connection closed");
}

fn prepare_arena(config: &StoreConfig, store_id: u64) -> ShmResult<PathBuf> {
    std::fs::create_dir_all(&config.shm_dir)?;
    let stale = clear_stale_arenas(&config.shm_dir, &config.socket_path)?;
    if stale > 0 {
        warn!(count = stale, dir = %config.shm_dir.display(), "Removed arenas of stopped stores");
    }
    create_arena(&config.shm_dir, store_id, &config.socket_path)
}

fn remove_stale_socket(path: &Path) -> ShmResult<()> {
    if !path.exists() {
        return Ok(());
    }
    if std::os::unix::net::UnixStream::connect(path).is_ok() {
        return Err(ShmError::Connection(format!(
            "a store is already serving {}",
            path.display()
        )));
    }
    std::fs::remove_file(path)?;
    debug!(socket = %path.display(), "Removed stale socket");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => info!("Received ctrl-c"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Store running on a dedicated thread with its own runtime.
///
/// Dropping the handle stops the store and removes its endpoint and
/// segments.
pub struct BackgroundStore {
    socket_path: PathBuf,
    store_id: u64,
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<ShmResult<()>>>,
}

impl BackgroundStore {
    /// Endpoint path
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Random token identifying the store instance
    pub fn store_id(&self) -> u64 {
        self.store_id
    }

    /// Client config pointing at this store
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::with_socket(&self.socket_path)
    }

    /// Stop the store and wait for it to finish
    pub fn shutdown(mut self) -> ShmResult<()> {
        self.stop()
    }

    fn stop(&mut self) -> ShmResult<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| ShmError::Connection("store thread panicked".into()))?,
            None => Ok(()),
        }
    }
}

impl Drop for BackgroundStore {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Background store stopped with error");
        }
    }
}

/// Start a store on a background thread and wait until it accepts
/// connections
pub fn spawn_background(config: StoreConfig) -> ShmResult<BackgroundStore> {
    let socket_path = config.socket_path.clone();
    let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<ShmResult<u64>>(1);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let thread = std::thread::Builder::new()
        .name("warp-shm-store".into())
        .spawn(move || -> ShmResult<()> {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = ready_tx.send(Err(ShmError::Io(e)));
                    return Ok(());
                }
            };
            runtime.block_on(async move {
                let server = match StoreServer::bind(config).await {
                    Ok(server) => server,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return Ok(());
                    }
                };
                let _ = ready_tx.send(Ok(server.store_id()));
                server
                    .run_until(async {
                        let _ = shutdown_rx.await;
                    })
                    .await
            })
        })?;

    let store_id = match ready_rx.recv() {
        Ok(Ok(store_id)) => store_id,
        Ok(Err(e)) => {
            let _ = thread.join();
            return Err(e);
        }
        Err(_) => {
            let _ = thread.join();
            return Err(ShmError::Connection("store thread exited before binding".into()));
        }
    };

    Ok(BackgroundStore {
        socket_path,
        store_id,
        shutdown_tx: Some(shutdown_tx),
        thread: Some(thread),
    })
}
