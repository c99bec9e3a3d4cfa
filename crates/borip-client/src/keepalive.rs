//! Background `PING` heartbeat.
//!
//! The keepalive takes the same lock as command exchanges, so a `PING`
//! never interleaves with an in-flight command. Its response is discarded.
//! Any error (including a reply slower than the command timeout) closes
//! and removes the connection before the task ends, so a late `PING OK`
//! can never be read as the answer to a later command. The command path
//! then finds the connection gone and reconnects.

use std::sync::Arc;
use std::time::Duration;

use borip_protocol::codec::{Command, Request};
use borip_transport::ControlConnection;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handle to a running keepalive task.
#[derive(Debug)]
pub(crate) struct Keepalive {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Keepalive {
    pub(crate) fn spawn(
        conn: Arc<Mutex<Option<ControlConnection>>>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(keepalive_loop(conn, interval, timeout, cancel.clone()));
        Self { cancel, task }
    }

    /// Stop the task without waiting for it.
    pub(crate) fn stop(self) {
        self.cancel.cancel();
        drop(self.task);
    }

    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn keepalive_loop(
    conn: Arc<Mutex<Option<ControlConnection>>>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let ping = Request::query(Command::Ping).to_string();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let mut guard = conn.lock().await;
        if cancel.is_cancelled() {
            break;
        }
        let Some(conn) = guard.as_mut() else {
            break;
        };

        let result = match conn.send_line(&ping).await {
            Ok(()) => conn.recv_line(timeout).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(addr = %conn.addr(), error = %e, "Keepalive failed, dropping connection");
            if let Some(mut conn) = guard.take() {
                conn.close().await;
            }
            break;
        }
        tracing::trace!(addr = %conn.addr(), "Keepalive");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use borip_test_harness::{AfterScript, MockBoripServer};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Greets one connection and answers each `PING` after `delay`.
    async fn slow_ping_server(delay: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            writer.write_all(b"DEVICE -\n").await.unwrap();
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim() == "PING" {
                    tokio::time::sleep(delay).await;
                    if writer.write_all(b"PING OK\n").await.is_err() {
                        break;
                    }
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn pings_under_the_connection_lock() {
        let mut server = MockBoripServer::new().await.unwrap();
        server.expect("PING", "PING OK");
        server.expect("PING", "PING OK");
        server.after_script(AfterScript::Close);
        let addr = server.addr().to_string();
        server.start();

        let mut conn = ControlConnection::connect(&addr).await.unwrap();
        assert_eq!(conn.read_line().await.unwrap(), "DEVICE -");
        let conn = Arc::new(Mutex::new(Some(conn)));

        let keepalive = Keepalive::spawn(
            conn.clone(),
            Duration::from_millis(20),
            Duration::from_secs(1),
        );

        assert_eq!(server.wait().await.unwrap(), vec!["PING", "PING"]);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !keepalive.is_finished() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn late_reply_closes_and_removes_the_connection() {
        let addr = slow_ping_server(Duration::from_millis(300)).await;
        let mut conn = ControlConnection::connect(&addr).await.unwrap();
        assert_eq!(conn.read_line().await.unwrap(), "DEVICE -");
        let conn = Arc::new(Mutex::new(Some(conn)));

        let keepalive = Keepalive::spawn(
            conn.clone(),
            Duration::from_millis(20),
            Duration::from_millis(100),
        );
        tokio::time::timeout(Duration::from_secs(2), async {
            while !keepalive.is_finished() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Nothing is left behind for the next command to read.
        assert!(conn.lock().await.is_none());
    }

    #[tokio::test]
    async fn stops_when_connection_is_gone() {
        let conn = Arc::new(Mutex::new(None));
        let keepalive = Keepalive::spawn(conn, Duration::from_millis(5), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(keepalive.is_finished());
    }
}
