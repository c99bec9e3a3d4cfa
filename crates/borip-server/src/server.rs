//! The BorIP listener: accept loop, live-client registry, and shutdown.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use borip_server::{BoripServer, DeviceRegistry, ServerOptions, sim};
//!
//! # async fn example() -> borip_core::Result<()> {
//! let mut registry = DeviceRegistry::new(28888);
//! sim::register(&mut registry);
//!
//! let mut server = BoripServer::new(ServerOptions::default(), registry);
//! server.start().await?;
//! tokio::signal::ctrl_c().await?;
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use borip_core::error::{Error, Result};
use borip_core::transport::StreamDevice;
use borip_transport::ControlConnection;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::options::ServerOptions;
use crate::registry::DeviceRegistry;
use crate::session::{Session, SessionContext};

/// A live session as seen by the server.
struct ClientHandle {
    peer: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

type ClientMap = Arc<Mutex<HashMap<u64, ClientHandle>>>;

fn lock_clients(clients: &ClientMap) -> MutexGuard<'_, HashMap<u64, ClientHandle>> {
    clients.lock().unwrap_or_else(|p| p.into_inner())
}

/// Handle to the running accept loop.
struct ListenerHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// BorIP control server.
pub struct BoripServer {
    options: Arc<ServerOptions>,
    registry: Arc<DeviceRegistry>,
    shared: Option<Arc<dyn StreamDevice>>,
    /// Whether `shared` was created by the server and must be closed by it.
    owns_shared: bool,
    clients: ClientMap,
    listener: Option<ListenerHandle>,
}

impl BoripServer {
    pub fn new(options: ServerOptions, mut registry: DeviceRegistry) -> Self {
        if options.default_module.is_some() {
            registry.set_default_module(options.default_module.clone());
        }
        Self {
            options: Arc::new(options),
            registry: Arc::new(registry),
            shared: None,
            owns_shared: false,
            clients: Arc::new(Mutex::new(HashMap::new())),
            listener: None,
        }
    }

    /// Serve an externally owned device to every session (locked mode).
    ///
    /// The server never closes a supplied device.
    pub fn with_device(mut self, device: Arc<dyn StreamDevice>) -> Self {
        self.shared = Some(device);
        self.owns_shared = false;
        self
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// The shared device, if the server runs in locked mode.
    pub fn shared_device(&self) -> Option<&Arc<dyn StreamDevice>> {
        self.shared.as_ref()
    }

    /// Address of the bound listener, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|l| l.local_addr)
    }

    /// Number of connected sessions.
    pub fn client_count(&self) -> usize {
        lock_clients(&self.clients).len()
    }

    /// Peer addresses of connected sessions.
    pub fn clients(&self) -> Vec<SocketAddr> {
        lock_clients(&self.clients).values().map(|c| c.peer).collect()
    }

    /// Create the shared device if configured, bind the listener, and spawn
    /// the accept loop.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            return Err(Error::Config("server already started".into()));
        }

        if self.options.lock && self.shared.is_none() {
            let hint = self.options.device_hint.clone().unwrap_or_default();
            let device = self.registry.create(&hint).await?;
            tracing::info!(name = %device.name(), "Created shared device");
            self.shared = Some(device);
            self.owns_shared = true;
        }

        let listener = self.bind().await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, locked = self.shared.is_some(), "BorIP server listening");

        let ctx = Arc::new(SessionContext {
            registry: Arc::clone(&self.registry),
            options: Arc::clone(&self.options),
            shared: self.shared.clone(),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            ctx,
            Arc::clone(&self.clients),
            cancel.clone(),
        ));

        self.listener = Some(ListenerHandle {
            local_addr,
            cancel,
            task,
        });
        Ok(local_addr)
    }

    /// Bind the listen port, retrying while the address is in use.
    async fn bind(&self) -> Result<TcpListener> {
        let addr = self.options.listen_addr();
        loop {
            match TcpListener::bind(&addr).await {
                Ok(listener) => return Ok(listener),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    tracing::warn!(
                        addr = %addr,
                        retry_ms = self.options.bind_retry_interval.as_millis(),
                        "Listen address in use, retrying"
                    );
                    tokio::time::sleep(self.options.bind_retry_interval).await;
                }
                Err(e) => {
                    return Err(Error::Transport(format!("failed to bind {}: {}", addr, e)));
                }
            }
        }
    }

    /// Disconnect every session, stop the listener, and release the shared
    /// device if the server created it.
    pub async fn stop(&mut self) {
        let sessions: Vec<(u64, ClientHandle)> = {
            let mut clients = lock_clients(&self.clients);
            for (id, client) in clients.iter() {
                tracing::debug!(session = id, peer = %client.peer, "Disconnecting client");
                client.cancel.cancel();
            }
            if let Some(listener) = &self.listener {
                listener.cancel.cancel();
            }
            clients.drain().collect()
        };

        if let Some(listener) = self.listener.take() {
            if let Err(e) = listener.task.await {
                tracing::warn!(error = %e, "Accept loop ended abnormally");
            }
        }

        for (id, client) in sessions {
            if let Err(e) = client.task.await {
                tracing::warn!(session = id, error = %e, "Session ended abnormally");
            }
        }

        if self.owns_shared {
            if let Some(device) = self.shared.take() {
                tracing::info!(name = %device.name(), "Closing shared device");
                if let Err(e) = device.close().await {
                    tracing::warn!(error = %e, "Failed to close shared device");
                }
            }
            self.owns_shared = false;
        }
        tracing::info!("BorIP server stopped");
    }
}

impl Drop for BoripServer {
    fn drop(&mut self) {
        if let Some(listener) = &self.listener {
            listener.cancel.cancel();
        }
        for client in lock_clients(&self.clients).values() {
            client.cancel.cancel();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    clients: ClientMap,
    cancel: CancellationToken,
) {
    let mut next_id: u64 = 0;
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Accept loop cancelled");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    continue;
                }
            },
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        next_id += 1;
        let id = next_id;
        let session_cancel = CancellationToken::new();
        let conn = ControlConnection::from_stream(stream, peer.to_string());
        let session = Session::new(id, conn, peer, Arc::clone(&ctx), session_cancel.clone());

        // Registered under the lock before the task can deregister itself.
        let mut registered = lock_clients(&clients);
        if cancel.is_cancelled() {
            break;
        }
        let task = {
            let clients = Arc::clone(&clients);
            tokio::spawn(async move {
                session.run().await;
                lock_clients(&clients).remove(&id);
            })
        };
        registered.insert(
            id,
            ClientHandle {
                peer,
                cancel: session_cancel,
                task,
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim;
    use borip_core::device::Device;
    use borip_test_harness::MockDevice;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    const WAIT: Duration = Duration::from_secs(2);

    fn options() -> ServerOptions {
        ServerOptions::new().bind_host("127.0.0.1").listen_port(0)
    }

    fn sim_registry() -> DeviceRegistry {
        let mut registry = DeviceRegistry::new(28888);
        sim::register(&mut registry);
        registry
    }

    struct TestClient {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (r, w) = stream.into_split();
            Self {
                reader: BufReader::new(r),
                writer: w,
            }
        }

        async fn line(&mut self) -> String {
            let mut line = String::new();
            tokio::time::timeout(WAIT, self.reader.read_line(&mut line))
                .await
                .expect("response timeout")
                .unwrap();
            line.trim_end_matches('\n').to_string()
        }

        async fn send(&mut self, raw: &[u8]) {
            self.writer.write_all(raw).await.unwrap();
        }

        async fn request(&mut self, line: &str) -> String {
            self.send(format!("{}\n", line).as_bytes()).await;
            self.line().await
        }
    }

    async fn wait_for_clients(server: &BoripServer, n: usize) {
        for _ in 0..100 {
            if server.client_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} clients, have {}", n, server.client_count());
    }

    #[tokio::test]
    async fn fresh_session_selects_and_streams() {
        let mut server = BoripServer::new(options(), sim_registry());
        let addr = server.start().await.unwrap();

        let mut client = TestClient::connect(addr).await;
        assert_eq!(client.line().await, "DEVICE -");

        // UDP receiver on the client side, pointed at by DEST.
        let udp = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_port = udp.local_addr().unwrap().port();

        assert_eq!(
            client.request("DEVICE rtl").await,
            "DEVICE rtl-sdr|0.0|49.6|0.1|2048000|1024|Receive|0001"
        );
        assert_eq!(
            client.request(&format!("DEST 127.0.0.1:{}", udp_port)).await,
            format!("DEST OK 127.0.0.1:{}", udp_port)
        );
        assert_eq!(client.request("RATE 256000").await, "RATE OK 256000.0");
        assert_eq!(client.request("GO").await, "GO OK");

        let mut buf = vec![0u8; 8192];
        let n = tokio::time::timeout(WAIT, udp.recv(&mut buf))
            .await
            .expect("no datagram")
            .unwrap();
        assert_eq!(n, 4 + 4096);
        assert_eq!(buf[0] & 0x10, 0x10);

        assert_eq!(client.request("STOP").await, "STOP OK STOPPED");
        server.stop().await;
    }

    #[tokio::test]
    async fn partial_and_coalesced_lines() {
        let mut server = BoripServer::new(options(), sim_registry());
        let addr = server.start().await.unwrap();

        let mut client = TestClient::connect(addr).await;
        assert_eq!(client.line().await, "DEVICE -");

        client.send(b"PI").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.send(b"NG\n\nFOO\nGO\n").await;
        assert_eq!(client.line().await, "PING OK");
        assert_eq!(client.line().await, "FOO UNKNOWN");
        assert_eq!(client.line().await, "GO DEVICE");

        server.stop().await;
    }

    #[tokio::test]
    async fn locked_mode_shares_device_and_dest_is_last_write_wins() {
        let mock = Arc::new(MockDevice::new("shared"));
        mock.open().await.unwrap();
        let mut server =
            BoripServer::new(options().lock(true), sim_registry()).with_device(mock.clone());
        let addr = server.start().await.unwrap();

        let mut a = TestClient::connect(addr).await;
        let mut b = TestClient::connect(addr).await;
        assert!(a.line().await.starts_with("DEVICE shared|"));
        assert!(b.line().await.starts_with("DEVICE shared|"));

        assert_eq!(a.request("DEST -").await, "DEST OK 127.0.0.1:28888");
        assert_eq!(b.request("DEST 127.0.0.2:4000").await, "DEST OK 127.0.0.2:4000");
        assert_eq!(a.request("DEST").await, "DEST 127.0.0.2:4000");

        // DEVICE selection is ignored in locked mode.
        assert!(a.request("DEVICE rtl").await.starts_with("DEVICE shared|"));

        drop(a);
        wait_for_clients(&server, 1).await;
        assert!(!mock.calls().contains(&"close".to_string()));

        server.stop().await;
        assert_eq!(server.client_count(), 0);
        // Supplied devices are never closed by the server.
        assert!(!mock.calls().contains(&"close".to_string()));
    }

    #[tokio::test]
    async fn per_session_device_from_hint() {
        let mut server = BoripServer::new(options().device_hint("sim"), sim_registry());
        let addr = server.start().await.unwrap();

        let mut client = TestClient::connect(addr).await;
        let greeting = client.line().await;
        assert!(greeting.starts_with("DEVICE sim|"), "got: {}", greeting);
        assert_eq!(client.request("DEST").await, "DEST 127.0.0.1:28888");
        assert_eq!(client.request("DEVICE !").await, "DEVICE -");
        assert_eq!(client.request("FREQ").await, "FREQ DEVICE");

        server.stop().await;
    }

    #[tokio::test]
    async fn stop_disconnects_clients() {
        let mut server = BoripServer::new(options(), sim_registry());
        let addr = server.start().await.unwrap();

        let mut a = TestClient::connect(addr).await;
        let mut b = TestClient::connect(addr).await;
        a.line().await;
        b.line().await;
        wait_for_clients(&server, 2).await;

        tokio::time::timeout(WAIT, server.stop()).await.unwrap();
        assert_eq!(server.client_count(), 0);
        assert!(server.local_addr().is_none());

        let mut rest = String::new();
        let n = tokio::time::timeout(WAIT, a.reader.read_line(&mut rest))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn bind_retries_while_address_in_use() {
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = blocker.local_addr().unwrap().port();

        let mut server = BoripServer::new(
            options()
                .listen_port(port)
                .bind_retry_interval(Duration::from_millis(50)),
            sim_registry(),
        );
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            drop(blocker);
        });

        let addr = tokio::time::timeout(WAIT, server.start())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(addr.port(), port);
        release.await.unwrap();
        server.stop().await;
    }

    #[tokio::test]
    async fn locked_mode_creates_and_closes_shared_device() {
        let mut server = BoripServer::new(options().lock(true).device_hint("rtl"), sim_registry());
        server.start().await.unwrap();
        let shared = server.shared_device().cloned().unwrap();
        assert_eq!(shared.name(), "rtl-sdr");
        server.stop().await;
        assert!(server.shared_device().is_none());
    }
}
