//! Transport glue.
//!
//! A [`Link`] is one end of a bidirectional frame pipe. The network core only
//! ever sees links; what sits on the far side is one of:
//! - an in-memory loopback peer (tests, local play), optionally lossy on the
//!   best-effort channel;
//! - the socket pumps in this module: TCP with length-prefixed frames for the
//!   reliable channel, UDP datagrams for the best-effort channel.
//!
//! Sending into a link never blocks; the socket pumps run as tokio tasks.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, UdpSocket,
    },
    sync::mpsc,
};
use tracing::{debug, trace, warn};

use crate::error::NetError;

/// Frames larger than this are rejected by the TCP reader.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const MAX_DATAGRAM_LEN: usize = 64 * 1024;

/// Logical channel a frame travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Ordered, never lost.
    Reliable,
    /// May be dropped or reordered.
    BestEffort,
}

/// One serialized message.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub channel: Channel,
    pub bytes: Bytes,
}

struct LossModel {
    drop_rate: f64,
    rng: StdRng,
}

/// One end of a frame pipe.
pub struct Link {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    rx: mpsc::UnboundedReceiver<Frame>,
    loss: Option<LossModel>,
}

impl Link {
    pub fn new(tx: mpsc::UnboundedSender<Frame>, rx: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self {
            tx: Some(tx),
            rx,
            loss: None,
        }
    }

    /// Drops outgoing best-effort frames with probability `drop_rate`.
    pub fn with_loss(mut self, drop_rate: f64, seed: u64) -> Self {
        self.loss = Some(LossModel {
            drop_rate: drop_rate.clamp(0.0, 1.0),
            rng: StdRng::seed_from_u64(seed),
        });
        self
    }

    /// Hands a frame to the transport. Never blocks.
    pub fn send(&mut self, frame: Frame) -> Result<(), NetError> {
        let Some(tx) = &self.tx else {
            return Err(NetError::Transport("link closed".to_string()));
        };
        if frame.channel == Channel::BestEffort {
            if let Some(loss) = &mut self.loss {
                if loss.rng.gen_bool(loss.drop_rate) {
                    trace!("best-effort frame dropped by loss model");
                    return Ok(());
                }
            }
        }
        tx.send(frame)
            .map_err(|_| NetError::Transport("peer closed".to_string()))
    }

    /// Returns the next received frame, `None` when nothing is waiting.
    pub fn try_recv(&mut self) -> Result<Option<Frame>, NetError> {
        match self.rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(NetError::Transport("transport closed".to_string()))
            }
        }
    }

    /// Stops sending and receiving. Frames already handed over still drain
    /// on the far side.
    pub fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

/// Two in-memory links wired to each other.
pub fn loopback_pair() -> (Link, Link) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (Link::new(a_tx, a_rx), Link::new(b_tx, b_rx))
}

/// Like [`loopback_pair`] but both directions drop best-effort frames.
pub fn lossy_loopback_pair(drop_rate: f64, seed: u64) -> (Link, Link) {
    let (a, b) = loopback_pair();
    (
        a.with_loss(drop_rate, seed),
        b.with_loss(drop_rate, seed.wrapping_add(1)),
    )
}

async fn write_frame(stream: &mut OwnedWriteHalf, payload: &[u8]) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    stream.write_all(&buf).await.context("tcp write")?;
    Ok(())
}

async fn read_frame(stream: &mut OwnedReadHalf) -> anyhow::Result<Bytes> {
    let len = stream.read_u32().await.context("tcp read len")? as usize;
    anyhow::ensure!(len <= MAX_FRAME_LEN, "frame of {len} bytes exceeds limit");
    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .context("tcp read payload")?;
    Ok(Bytes::from(payload))
}

fn datagram(token: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(token);
    buf.extend_from_slice(payload);
    buf.freeze()
}

fn split_datagram(buf: &[u8]) -> Option<(u32, &[u8])> {
    if buf.len() < 4 {
        return None;
    }
    let token = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    Some((token, &buf[4..]))
}

/// Forwards reliable frames until the stream ends, then stops `companion` so
/// the last inbound sender goes away and the link reports the close.
fn spawn_tcp_reader(
    mut read: OwnedReadHalf,
    inbound: mpsc::UnboundedSender<Frame>,
    companion: tokio::task::JoinHandle<()>,
) {
    tokio::spawn(async move {
        loop {
            match read_frame(&mut read).await {
                Ok(bytes) => {
                    let frame = Frame {
                        channel: Channel::Reliable,
                        bytes,
                    };
                    if inbound.send(frame).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "tcp reader stopped");
                    break;
                }
            }
        }
        companion.abort();
    });
}

type Routes = Arc<Mutex<HashMap<u32, Route>>>;

struct Route {
    inbound: mpsc::UnboundedSender<Frame>,
    udp_peer: Option<SocketAddr>,
}

/// Server side socket transport.
///
/// Each accepted TCP stream gets a token which the client prefixes to every
/// UDP datagram; the listener learns the client's UDP address from the first
/// datagram carrying that token.
pub struct NetListener {
    tcp: TcpListener,
    udp: Arc<UdpSocket>,
    routes: Routes,
    next_token: AtomicU32,
}

impl NetListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let tcp = TcpListener::bind(addr).await.context("tcp bind")?;
        let udp_addr = tcp.local_addr().context("tcp local_addr")?;
        let udp = Arc::new(UdpSocket::bind(udp_addr).await.context("udp bind")?);
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        Self::spawn_udp_demux(udp.clone(), routes.clone());
        Ok(Self {
            tcp,
            udp,
            routes,
            next_token: AtomicU32::new(1),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.tcp.local_addr()?)
    }

    fn spawn_udp_demux(udp: Arc<UdpSocket>, routes: Routes) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
            loop {
                let (n, from) = match udp.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "udp demux stopped");
                        break;
                    }
                };
                let Some((token, payload)) = split_datagram(&buf[..n]) else {
                    continue;
                };
                let Ok(mut routes) = routes.lock() else {
                    break;
                };
                let Some(route) = routes.get_mut(&token) else {
                    trace!(token, %from, "datagram for unknown token");
                    continue;
                };
                route.udp_peer = Some(from);
                if !payload.is_empty() {
                    let _ = route.inbound.send(Frame {
                        channel: Channel::BestEffort,
                        bytes: Bytes::copy_from_slice(payload),
                    });
                }
            }
        });
    }

    /// Accepts one client stream and returns its link.
    pub async fn accept(&self) -> anyhow::Result<(Link, SocketAddr)> {
        let (stream, peer) = self.tcp.accept().await.context("tcp accept")?;
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (read, mut write) = stream.into_split();
        write.write_u32(token).await.context("send token")?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();
        self.routes
            .lock()
            .map_err(|_| anyhow::anyhow!("route table poisoned"))?
            .insert(
                token,
                Route {
                    inbound: in_tx.clone(),
                    udp_peer: None,
                },
            );

        // The reader owns the last inbound sender besides the route; when the
        // stream dies the route goes too, which closes the link.
        let routes = self.routes.clone();
        tokio::spawn(async move {
            let mut read = read;
            loop {
                match read_frame(&mut read).await {
                    Ok(bytes) => {
                        let frame = Frame {
                            channel: Channel::Reliable,
                            bytes,
                        };
                        if in_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(token, error = %e, "client stream closed");
                        break;
                    }
                }
            }
            if let Ok(mut routes) = routes.lock() {
                routes.remove(&token);
            }
        });

        let udp = self.udp.clone();
        let routes = self.routes.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                match frame.channel {
                    Channel::Reliable => {
                        if let Err(e) = write_frame(&mut write, &frame.bytes).await {
                            debug!(token, error = %e, "client writer stopped");
                            break;
                        }
                    }
                    Channel::BestEffort => {
                        let peer = routes
                            .lock()
                            .ok()
                            .and_then(|r| r.get(&token).and_then(|route| route.udp_peer));
                        // Unknown UDP address yet: best-effort frames may be lost.
                        if let Some(peer) = peer {
                            let _ = udp.send_to(&datagram(token, &frame.bytes), peer).await;
                        }
                    }
                }
            }
        });

        Ok((Link::new(out_tx, in_rx), peer))
    }
}

/// Connects to a [`NetListener`] and returns the client link.
pub async fn connect(server: SocketAddr) -> anyhow::Result<Link> {
    let stream = TcpStream::connect(server).await.context("tcp connect")?;
    let (read, mut write) = stream.into_split();
    let mut read = read;
    let token = read.read_u32().await.context("read token")?;

    let bind_ip = match server.ip() {
        IpAddr::V4(ip) if ip.is_loopback() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
    };
    let udp = Arc::new(
        UdpSocket::bind(SocketAddr::new(bind_ip, 0))
            .await
            .context("udp bind")?,
    );
    udp.connect(server).await.context("udp connect")?;
    // Registers our UDP address with the listener; later datagrams re-register.
    udp.send(&datagram(token, &[]))
        .await
        .context("udp register")?;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();

    let udp_rx = udp.clone();
    let udp_in = in_tx.clone();
    let udp_reader = tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        loop {
            let n = match udp_rx.recv(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "udp reader stopped");
                    break;
                }
            };
            let Some((_, payload)) = split_datagram(&buf[..n]) else {
                continue;
            };
            let frame = Frame {
                channel: Channel::BestEffort,
                bytes: Bytes::copy_from_slice(payload),
            };
            if udp_in.send(frame).is_err() {
                break;
            }
        }
    });
    spawn_tcp_reader(read, in_tx, udp_reader);

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            match frame.channel {
                Channel::Reliable => {
                    if let Err(e) = write_frame(&mut write, &frame.bytes).await {
                        debug!(error = %e, "server writer stopped");
                        break;
                    }
                }
                Channel::BestEffort => {
                    let _ = udp.send(&datagram(token, &frame.bytes)).await;
                }
            }
        }
    });

    Ok(Link::new(out_tx, in_rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(channel: Channel, byte: u8) -> Frame {
        Frame {
            channel,
            bytes: Bytes::from(vec![byte]),
        }
    }

    #[test]
    fn loopback_delivers_in_order() {
        let (mut a, mut b) = loopback_pair();
        a.send(frame(Channel::Reliable, 1)).unwrap();
        a.send(frame(Channel::BestEffort, 2)).unwrap();
        assert_eq!(b.try_recv().unwrap().unwrap().bytes[0], 1);
        assert_eq!(b.try_recv().unwrap().unwrap().bytes[0], 2);
        assert!(b.try_recv().unwrap().is_none());
    }

    #[test]
    fn closed_peer_surfaces_as_transport_error() {
        let (mut a, mut b) = loopback_pair();
        a.send(frame(Channel::Reliable, 9)).unwrap();
        a.close();
        assert!(a.send(frame(Channel::Reliable, 1)).is_err());
        // Already queued frames still arrive before the close is observed.
        assert_eq!(b.try_recv().unwrap().unwrap().bytes[0], 9);
        assert!(matches!(b.try_recv(), Err(NetError::Transport(_))));
        assert!(b.send(frame(Channel::Reliable, 1)).is_err());
    }

    #[test]
    fn loss_model_never_drops_reliable_frames() {
        let (a, mut b) = loopback_pair();
        let mut a = a.with_loss(1.0, 7);
        for i in 0..20 {
            a.send(frame(Channel::Reliable, i)).unwrap();
            a.send(frame(Channel::BestEffort, 100 + i)).unwrap();
        }
        let mut got = Vec::new();
        while let Some(f) = b.try_recv().unwrap() {
            got.push(f);
        }
        assert_eq!(got.len(), 20);
        assert!(got.iter().all(|f| f.channel == Channel::Reliable));
    }

    #[test]
    fn datagram_token_roundtrip() {
        let d = datagram(0xAABBCCDD, b"hi");
        let (token, payload) = split_datagram(&d).unwrap();
        assert_eq!(token, 0xAABBCCDD);
        assert_eq!(payload, b"hi");
        assert!(split_datagram(&[1, 2]).is_none());
    }

    #[tokio::test]
    async fn socket_link_carries_both_channels() -> anyhow::Result<()> {
        let listener = NetListener::bind("127.0.0.1:0".parse()?).await?;
        let addr = listener.local_addr()?;
        let accept = tokio::spawn(async move {
            let (link, _) = listener.accept().await?;
            Ok::<_, anyhow::Error>((listener, link))
        });
        let mut client = connect(addr).await?;
        let (_listener, mut server) = accept.await??;

        client.send(frame(Channel::Reliable, 5))?;
        let mut got = None;
        for _ in 0..100 {
            if let Some(f) = server.try_recv()? {
                got = Some(f);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let got = got.context("no reliable frame")?;
        assert_eq!(got.channel, Channel::Reliable);
        assert_eq!(got.bytes[0], 5);

        // Keep sending until the listener has learned our UDP address.
        let mut best_effort = None;
        for _ in 0..100 {
            client.send(frame(Channel::BestEffort, 6))?;
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            if let Some(f) = server.try_recv()? {
                best_effort = Some(f);
                break;
            }
        }
        let best_effort = best_effort.context("no best-effort frame")?;
        assert_eq!(best_effort.channel, Channel::BestEffort);
        Ok(())
    }
}
