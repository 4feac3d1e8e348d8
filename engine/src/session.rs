//! Sockets and the pool that bounds them
//!
//! A [`Session`] is one socket slot. UDP sessions keep their socket between
//! exchanges; TCP exchanges open a stream for the duration of one attempt and
//! only borrow the slot. The [`SessionPool`] hands out at most `max_sockets`
//! slots and resets each one when it comes back.

use log::debug;
use protocol::{Completion, QueryError, Result, Transport};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout_at, Instant};

use crate::config::QueryPolicy;

/// One outbound request and the rule that says when its answer is complete
#[derive(Debug, Clone)]
pub struct Request {
    pub target: SocketAddr,
    pub transport: Transport,
    pub packet: Vec<u8>,
    pub completion: Completion,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub attempts: u32,
}

#[derive(Debug)]
pub struct Session {
    id: usize,
    socket: Option<UdpSocket>,
    last_target: Option<SocketAddr>,
    stats: SessionStats,
}

impl Session {
    fn new(id: usize) -> Self {
        Self {
            id,
            socket: None,
            last_target: None,
            stats: SessionStats::default(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn last_target(&self) -> Option<SocketAddr> {
        self.last_target
    }

    /// Back to a clean state; the UDP socket survives, minus anything queued on it
    fn reset(&mut self) {
        self.stats = SessionStats::default();
        if let Some(socket) = &self.socket {
            let mut scratch = [0u8; 2048];
            while socket.try_recv_from(&mut scratch).is_ok() {}
        }
    }

    /// Sends `request` and collects datagrams until the answer is complete,
    /// re-sending after each timeout up to the policy's attempt count
    pub async fn exchange(&mut self, request: &Request, policy: &QueryPolicy) -> Result<Vec<Vec<u8>>> {
        self.last_target = Some(request.target);
        match request.transport {
            Transport::Udp => self.exchange_udp(request, policy).await,
            Transport::Tcp => self.exchange_tcp(request, policy).await,
        }
    }

    async fn exchange_udp(&mut self, request: &Request, policy: &QueryPolicy) -> Result<Vec<Vec<u8>>> {
        let socket = bound_socket(&mut self.socket, request.target).await?;
        let mut buffer = vec![0u8; policy.recv_buffer_size];
        let mut packets = Vec::new();

        for attempt in 1..=policy.attempts() {
            self.stats.attempts = attempt;
            let sent = socket.send_to(&request.packet, request.target).await?;
            self.stats.bytes_sent += sent as u64;
            debug!("sent {} byte(s) to {} (attempt {})", sent, request.target, attempt);

            let deadline = Instant::now() + policy.timeout;
            while let Ok(received) = timeout_at(deadline, socket.recv_from(&mut buffer)).await {
                let (len, peer) = received?;
                if peer != request.target {
                    debug!("dropping {} byte(s) from unexpected peer {}", len, peer);
                    continue;
                }

                self.stats.bytes_received += len as u64;
                packets.push(buffer[..len].to_vec());
                debug!("received {} byte(s) from {}", len, peer);

                if request.completion.is_complete(&packets) {
                    return Ok(packets);
                }
            }

            if attempt < policy.attempts() {
                debug!("no complete answer from {}, retrying", request.target);
            }
        }

        Err(QueryError::SocketTimeout {
            attempts: policy.attempts(),
        })
    }

    async fn exchange_tcp(&mut self, request: &Request, policy: &QueryPolicy) -> Result<Vec<Vec<u8>>> {
        for attempt in 1..=policy.attempts() {
            self.stats.attempts = attempt;
            let deadline = Instant::now() + policy.timeout;
            match timeout_at(deadline, self.stream_once(request, policy)).await {
                Ok(result) => return result,
                Err(_) if attempt < policy.attempts() => {
                    debug!("no complete answer from {}, retrying", request.target);
                }
                Err(_) => {}
            }
        }

        Err(QueryError::SocketTimeout {
            attempts: policy.attempts(),
        })
    }

    async fn stream_once(&mut self, request: &Request, policy: &QueryPolicy) -> Result<Vec<Vec<u8>>> {
        let mut stream = TcpStream::connect(request.target).await?;
        stream.write_all(&request.packet).await?;
        self.stats.bytes_sent += request.packet.len() as u64;
        debug!("sent {} byte(s) to {} over tcp", request.packet.len(), request.target);

        let mut buffer = vec![0u8; policy.recv_buffer_size];
        let mut packets = Vec::new();
        loop {
            let len = stream.read(&mut buffer).await?;
            if len == 0 {
                break;
            }
            self.stats.bytes_received += len as u64;
            packets.push(buffer[..len].to_vec());
            if request.completion.is_complete(&packets) {
                break;
            }
        }

        if packets.is_empty() {
            return Err(QueryError::malformed("connection closed without a response"));
        }
        Ok(packets)
    }
}

/// Returns the slot's socket, (re)binding it when the address family doesn't match
async fn bound_socket(slot: &mut Option<UdpSocket>, target: SocketAddr) -> io::Result<&UdpSocket> {
    let same_family = |socket: &UdpSocket| {
        socket
            .local_addr()
            .map(|local| local.is_ipv4() == target.is_ipv4())
            .unwrap_or(false)
    };

    if let Some(socket) = slot.take().filter(same_family) {
        return Ok(&*slot.insert(socket));
    }

    let local: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    debug!("bound query socket {}", socket.local_addr()?);
    Ok(&*slot.insert(socket))
}

/// Bounded set of reusable sessions
#[derive(Debug)]
pub struct SessionPool {
    idle: Vec<Session>,
    open: usize,
    capacity: usize,
}

impl SessionPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Vec::new(),
            open: 0,
            capacity: capacity.max(1),
        }
    }

    /// Hands out a session for `target`, or `None` when every slot is busy
    ///
    /// An idle session that last talked to a different target is preferred,
    /// so late datagrams from `target` can't land in the new exchange.
    pub fn checkout(&mut self, target: SocketAddr) -> Option<Session> {
        if let Some(index) = self
            .idle
            .iter()
            .position(|session| session.last_target != Some(target))
        {
            return Some(self.idle.swap_remove(index));
        }

        if self.open < self.capacity {
            self.open += 1;
            return Some(Session::new(self.open));
        }

        self.idle.pop()
    }

    pub fn checkin(&mut self, mut session: Session) {
        session.reset();
        self.idle.push(session);
    }

    /// Slots created so far
    pub fn open(&self) -> usize {
        self.open
    }

    pub fn in_use(&self) -> usize {
        self.open - self.idle.len()
    }
}
