//! UDP sample transport.
//!
//! [`UdpSampleSink`] is the server-side [`SampleSink`]: it cuts the byte
//! stream produced by a device into fixed-size datagrams, optionally prefixed
//! with a [`PacketHeader`], and sends them to the current destination.
//!
//! [`UdpSampleSource`] is the receiving side used by the client proxy. It
//! strips headers, counts gaps in the packet index, and forwards payloads
//! over a channel. Cancelling the source closes the channel, which the
//! consumer sees as end of stream.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use borip_core::error::{Error, Result};
use borip_core::stream::{Overrun, SampleSink, SinkStatus, StatusQueue};
use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::packet::{HEADER_LEN, PacketFlags, PacketHeader, SequenceTracker};

/// Default datagram payload in bytes.
pub const DEFAULT_PAYLOAD_SIZE: usize = 4096;

/// Receive buffer large enough for any UDP datagram.
const RECV_BUFFER_LEN: usize = 65536;

/// Capacity of the payload channel handed out by [`UdpSampleSource::bind`].
const CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SinkState {
    socket: Option<UdpSocket>,
    peer: Option<SocketAddr>,
    residual: BytesMut,
    idx: u16,
    first: bool,
    sent: bool,
}

/// Packetizing UDP sender.
#[derive(Debug)]
pub struct UdpSampleSink {
    state: tokio::sync::Mutex<SinkState>,
    header: AtomicBool,
    payload_size: AtomicUsize,
    pending: AtomicU8,
    status: Mutex<Option<StatusQueue>>,
}

impl Default for UdpSampleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpSampleSink {
    /// An unconnected sink with framing enabled and a 4096-byte payload.
    pub fn new() -> Self {
        Self {
            state: tokio::sync::Mutex::new(SinkState::default()),
            header: AtomicBool::new(true),
            payload_size: AtomicUsize::new(DEFAULT_PAYLOAD_SIZE),
            pending: AtomicU8::new(0),
            status: Mutex::new(None),
        }
    }

    /// Current destination, if connected.
    pub async fn peer(&self) -> Option<SocketAddr> {
        self.state.lock().await.peer
    }

    pub fn header(&self) -> bool {
        self.header.load(Ordering::SeqCst)
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size.load(Ordering::SeqCst)
    }

    fn notify(&self, status: SinkStatus) {
        let queue = self.status.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(queue) = queue.as_ref() {
            let _ = queue.send(status);
        }
    }

    /// Build the next datagram around `payload`, consuming pending flags.
    fn frame(&self, state: &mut SinkState, payload: &[u8]) -> Vec<u8> {
        if !self.header() {
            return payload.to_vec();
        }
        let mut flags = PacketFlags::from_bits(self.pending.swap(0, Ordering::SeqCst));
        if state.first {
            flags |= PacketFlags::STREAM_START;
            state.first = false;
        }
        if payload.is_empty() {
            flags |= PacketFlags::EMPTY_PAYLOAD;
        }
        let header = PacketHeader::new(flags, state.idx);
        state.idx = state.idx.wrapping_add(1);

        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        packet.extend_from_slice(&header.encode());
        packet.extend_from_slice(payload);
        packet
    }

    async fn send(&self, state: &mut SinkState, packet: &[u8]) {
        let Some(socket) = state.socket.as_ref() else {
            return;
        };
        match socket.send(packet).await {
            Ok(_) => state.sent = true,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                tracing::trace!(peer = ?state.peer, "Receiver refused datagram, discarding");
                self.notify(SinkStatus::SendRefused);
            }
            Err(e) => {
                tracing::debug!(peer = ?state.peer, error = %e, "Failed to send datagram");
                self.pending
                    .fetch_or(PacketFlags::NETWORK_OVERRUN.bits(), Ordering::SeqCst);
                self.notify(SinkStatus::SendFailed(e.to_string()));
            }
        }
    }

    /// Send the end-of-stream marker and drop the socket.
    async fn shutdown(&self, state: &mut SinkState) -> bool {
        if state.socket.is_none() {
            return false;
        }
        if self.header() && state.sent {
            let mut flags = PacketFlags::STREAM_END | PacketFlags::EMPTY_PAYLOAD;
            flags |= PacketFlags::from_bits(self.pending.swap(0, Ordering::SeqCst));
            let end = PacketHeader::new(flags, state.idx).encode();
            state.idx = state.idx.wrapping_add(1);
            self.send(state, &end).await;
        }
        tracing::debug!(peer = ?state.peer, "Sample sink disconnected");
        state.socket = None;
        state.peer = None;
        state.residual.clear();
        state.sent = false;
        true
    }
}

#[async_trait]
impl SampleSink for UdpSampleSink {
    async fn connect(&self, host: &str, port: u16) -> Result<()> {
        let addr = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| Error::Transport(format!("failed to resolve {}: {}", host, e)))?
            .next()
            .ok_or_else(|| Error::Transport(format!("no address for {}", host)))?;

        let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await.map_err(|e| {
            tracing::error!(addr = %bind_addr, error = %e, "Failed to bind UDP socket");
            Error::Io(e)
        })?;
        socket
            .connect(addr)
            .await
            .map_err(|e| Error::Transport(format!("failed to connect UDP socket to {}: {}", addr, e)))?;

        let mut state = self.state.lock().await;
        if self.shutdown(&mut state).await {
            self.notify(SinkStatus::Disconnected);
        }
        state.socket = Some(socket);
        state.peer = Some(addr);
        state.first = true;
        state.idx = 0;
        drop(state);

        tracing::debug!(peer = %addr, "Sample sink connected");
        self.notify(SinkStatus::Connected {
            host: host.to_string(),
            port,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if self.shutdown(&mut state).await {
            drop(state);
            self.notify(SinkStatus::Disconnected);
        }
        Ok(())
    }

    fn set_header(&self, enable: bool) {
        self.header.store(enable, Ordering::SeqCst);
    }

    fn set_payload_size(&self, size: usize) {
        self.payload_size.store(size, Ordering::SeqCst);
    }

    async fn write(&self, data: &[u8]) -> Result<usize> {
        let mut state = self.state.lock().await;
        if state.socket.is_none() {
            return Ok(data.len());
        }

        state.residual.extend_from_slice(data);
        let payload_size = match self.payload_size() {
            0 => state.residual.len(),
            n => n,
        };
        while payload_size > 0 && state.residual.len() >= payload_size {
            let chunk = state.residual.split_to(payload_size);
            let packet = self.frame(&mut state, &chunk);
            self.send(&mut state, &packet).await;
        }
        Ok(data.len())
    }

    fn report_overrun(&self, kind: Overrun) {
        self.pending
            .fetch_or(PacketFlags::from(kind).bits(), Ordering::SeqCst);
    }

    fn set_status_queue(&self, queue: StatusQueue) {
        *self.status.lock().unwrap_or_else(|p| p.into_inner()) = Some(queue);
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Receive counters of a [`UdpSampleSource`].
#[derive(Debug, Default)]
pub struct SourceStats {
    packets: AtomicU64,
    bytes: AtomicU64,
    dropped: AtomicU64,
}

impl SourceStats {
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Datagrams missing from the packet index sequence.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Background UDP receiver producing sample payloads.
#[derive(Debug)]
pub struct UdpSampleSource {
    local_addr: SocketAddr,
    header: Arc<AtomicBool>,
    stats: Arc<SourceStats>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpSampleSource {
    /// Bind `addr` and start receiving.
    ///
    /// `packet_size` is the payload size the sender is expected to use; it
    /// only affects logging. Payloads arrive on the returned channel, which
    /// closes once [`signal_eos`](Self::signal_eos) is called.
    pub async fn bind(
        addr: &str,
        packet_size: usize,
        header: bool,
    ) -> Result<(Self, mpsc::Receiver<Bytes>)> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            Error::Transport(format!("failed to bind UDP socket on {}: {}", addr, e))
        })?;
        let local_addr = socket.local_addr()?;
        tracing::debug!(local_addr = %local_addr, packet_size, header, "UDP sample receiver started");

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let header = Arc::new(AtomicBool::new(header));
        let stats = Arc::new(SourceStats::default());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(recv_loop(
            socket,
            tx,
            packet_size,
            Arc::clone(&header),
            Arc::clone(&stats),
            cancel.clone(),
        ));

        Ok((
            Self {
                local_addr,
                header,
                stats,
                cancel,
                task: Mutex::new(Some(task)),
            },
            rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether received datagrams are expected to carry a header.
    pub fn set_header(&self, enable: bool) {
        self.header.store(enable, Ordering::SeqCst);
    }

    pub fn stats(&self) -> &SourceStats {
        &self.stats
    }

    /// Stop receiving and close the payload channel.
    pub fn signal_eos(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(local_addr = %self.local_addr, "Signalling end of stream");
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Signal end of stream and wait for the receive task to exit.
    pub async fn close(&self) {
        self.signal_eos();
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for UdpSampleSource {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn recv_loop(
    socket: UdpSocket,
    tx: mpsc::Sender<Bytes>,
    packet_size: usize,
    header: Arc<AtomicBool>,
    stats: Arc<SourceStats>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    let mut tracker = SequenceTracker::new();

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok((n, _)) => n,
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "UDP receive failed");
                    break;
                }
            },
        };

        let mut payload = &buf[..n];
        if header.load(Ordering::SeqCst) {
            let Some(h) = PacketHeader::decode(payload) else {
                tracing::debug!(bytes = n, "Datagram shorter than header, ignoring");
                continue;
            };
            if h.flags.contains(PacketFlags::STREAM_START) {
                tracing::debug!(idx = h.idx, "Stream started");
            }
            let dropped = tracker.observe(&h);
            if dropped > 0 {
                stats.dropped.fetch_add(u64::from(dropped), Ordering::Relaxed);
                tracing::debug!(idx = h.idx, dropped, "Packets dropped");
            }
            let overrun = PacketFlags::HARDWARE_OVERRUN
                | PacketFlags::NETWORK_OVERRUN
                | PacketFlags::BUFFER_OVERRUN;
            if h.flags.bits() & overrun.bits() != 0 {
                tracing::debug!(idx = h.idx, flags = ?h.flags, "Sender reported overrun");
            }
            if h.flags.contains(PacketFlags::STREAM_END) {
                tracing::debug!(idx = h.idx, "Stream ended");
                tracker.reset();
            }
            if h.flags.contains(PacketFlags::EMPTY_PAYLOAD) {
                continue;
            }
            payload = &payload[HEADER_LEN..];
        }
        if payload.is_empty() {
            continue;
        }
        if payload.len() != packet_size {
            tracing::trace!(bytes = payload.len(), expected = packet_size, "Unexpected payload size");
        }

        stats.packets.fetch_add(1, Ordering::Relaxed);
        stats.bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);
        if tx.send(Bytes::copy_from_slice(payload)).await.is_err() {
            tracing::debug!("Sample consumer dropped, stopping receiver");
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn receiver() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    async fn recv(socket: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 2048];
        let n = tokio::time::timeout(Duration::from_secs(2), socket.recv(&mut buf))
            .await
            .expect("datagram timeout")
            .unwrap();
        buf[..n].to_vec()
    }

    #[tokio::test]
    async fn sink_frames_packets() {
        let (rx, port) = receiver().await;
        let (status_tx, mut status_rx) = mpsc::unbounded_channel();

        let sink = UdpSampleSink::new();
        sink.set_status_queue(status_tx);
        sink.set_payload_size(8);
        sink.connect("127.0.0.1", port).await.unwrap();

        assert_eq!(sink.write(&[1u8; 20]).await.unwrap(), 20);
        let first = recv(&rx).await;
        assert_eq!(&first[..4], &[0x10, 0x00, 0x00, 0x00]);
        assert_eq!(&first[4..], &[1u8; 8]);
        let second = recv(&rx).await;
        assert_eq!(&second[..4], &[0x00, 0x00, 0x01, 0x00]);

        sink.report_overrun(Overrun::Hardware);
        sink.write(&[2u8; 4]).await.unwrap();
        let third = recv(&rx).await;
        assert_eq!(&third[..4], &[0x01, 0x00, 0x02, 0x00]);
        assert_eq!(&third[4..], &[1, 1, 1, 1, 2, 2, 2, 2]);

        sink.disconnect().await.unwrap();
        assert_eq!(recv(&rx).await, vec![0x28, 0x00, 0x03, 0x00]);

        assert_eq!(
            status_rx.recv().await,
            Some(SinkStatus::Connected {
                host: "127.0.0.1".into(),
                port
            })
        );
        assert_eq!(status_rx.recv().await, Some(SinkStatus::Disconnected));
    }

    #[tokio::test]
    async fn sink_without_header_sends_raw_payload() {
        let (rx, port) = receiver().await;
        let sink = UdpSampleSink::new();
        sink.set_header(false);
        sink.set_payload_size(4);
        sink.connect("127.0.0.1", port).await.unwrap();

        sink.write(&[9, 8, 7, 6, 5]).await.unwrap();
        assert_eq!(recv(&rx).await, vec![9, 8, 7, 6]);

        // No end marker without a header.
        sink.disconnect().await.unwrap();
        let mut buf = [0u8; 16];
        let more = tokio::time::timeout(Duration::from_millis(100), rx.recv(&mut buf)).await;
        assert!(more.is_err());
    }

    #[tokio::test]
    async fn sink_discards_when_not_connected() {
        let sink = UdpSampleSink::new();
        assert_eq!(sink.write(&[0u8; 10_000]).await.unwrap(), 10_000);
        assert!(sink.peer().await.is_none());
        sink.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn sink_survives_refused_receiver() {
        let (rx, port) = receiver().await;
        drop(rx);

        let sink = UdpSampleSink::new();
        sink.set_payload_size(4);
        sink.connect("127.0.0.1", port).await.unwrap();
        for _ in 0..5 {
            assert_eq!(sink.write(&[0u8; 4]).await.unwrap(), 4);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sink.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn reconnect_restarts_stream() {
        let (rx_a, port_a) = receiver().await;
        let (rx_b, port_b) = receiver().await;
        let sink = UdpSampleSink::new();
        sink.set_payload_size(4);

        sink.connect("127.0.0.1", port_a).await.unwrap();
        sink.write(&[0u8; 4]).await.unwrap();
        assert_eq!(recv(&rx_a).await[0], 0x10);

        sink.connect("127.0.0.1", port_b).await.unwrap();
        assert_eq!(recv(&rx_a).await, vec![0x28, 0x00, 0x01, 0x00]);
        sink.write(&[0u8; 4]).await.unwrap();
        assert_eq!(&recv(&rx_b).await[..4], &[0x10, 0x00, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn source_strips_headers_and_counts_drops() {
        let (source, mut rx) = UdpSampleSource::bind("127.0.0.1:0", 4, true).await.unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        tx.connect(source.local_addr()).await.unwrap();

        tx.send(&[0x10, 0, 0, 0, 1, 2, 3, 4]).await.unwrap();
        tx.send(&[0x00, 0, 1, 0, 5, 6, 7, 8]).await.unwrap();
        tx.send(&[0x00, 0, 4, 0, 9, 9, 9, 9]).await.unwrap();
        tx.send(&[0x28, 0, 5, 0]).await.unwrap();

        let wait = Duration::from_secs(2);
        let a = tokio::time::timeout(wait, rx.recv()).await.unwrap().unwrap();
        let b = tokio::time::timeout(wait, rx.recv()).await.unwrap().unwrap();
        let c = tokio::time::timeout(wait, rx.recv()).await.unwrap().unwrap();
        assert_eq!(&a[..], &[1, 2, 3, 4]);
        assert_eq!(&b[..], &[5, 6, 7, 8]);
        assert_eq!(&c[..], &[9, 9, 9, 9]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(source.stats().packets(), 3);
        assert_eq!(source.stats().bytes(), 12);
        assert_eq!(source.stats().dropped(), 2);

        source.signal_eos();
        let end = tokio::time::timeout(wait, rx.recv()).await.unwrap();
        assert!(end.is_none());
        assert!(source.is_closed());
    }

    #[tokio::test]
    async fn sink_to_source() {
        let (source, mut rx) = UdpSampleSource::bind("127.0.0.1:0", 16, true).await.unwrap();
        let sink = UdpSampleSink::new();
        sink.set_payload_size(16);
        sink.connect("127.0.0.1", source.local_addr().port()).await.unwrap();

        let samples: Vec<u8> = (0..48).collect();
        sink.write(&samples).await.unwrap();
        sink.disconnect().await.unwrap();

        let mut received = Vec::new();
        for _ in 0..3 {
            let chunk = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, samples);

        source.close().await;
        assert_eq!(source.stats().dropped(), 0);
    }
}
