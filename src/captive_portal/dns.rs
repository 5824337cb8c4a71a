//! DNS 劫持：所有 A 查询都解析到配网地址
//!
//! 只回答第一个 question，不区分查询类型和域名。

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use mio::net::UdpSocket;

use super::reactor::{Interest, PollEvent, Reactor, DNS_SOCKET};

const HEADER_LEN: usize = 12;
const ANSWER_LEN: usize = 16;
const MAX_DATAGRAM: usize = 512;
const TTL_SECS: u32 = 60;

pub struct DnsResponder {
    socket: UdpSocket,
    address: Ipv4Addr,
}

impl DnsResponder {
    pub fn start(reactor: &mut Reactor, bind: SocketAddr, address: Ipv4Addr) -> io::Result<Self> {
        let mut socket = UdpSocket::bind(bind)?;
        reactor.register(&mut socket, DNS_SOCKET, Interest::Readable)?;
        log::info!("DNS server started on {}, answering {}", socket.local_addr()?, address);

        Ok(Self { socket, address })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// 读空 socket 里的所有查询，返回回答的个数
    pub fn handle(&mut self, event: &PollEvent) -> io::Result<usize> {
        // UDP 的 hangup 没有意义
        if !event.readable {
            return Ok(0);
        }

        let mut query = [0u8; MAX_DATAGRAM];
        let mut reply = [0u8; MAX_DATAGRAM];
        let mut answered = 0;

        loop {
            let (len, peer) = match self.socket.recv_from(&mut query) {
                Ok(r) => r,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e),
            };

            let Some(n) = build_response(&query[..len], self.address, &mut reply) else {
                log::debug!("Dropped malformed DNS datagram ({} bytes) from {}", len, peer);
                continue;
            };

            match self.socket.send_to(&reply[..n], peer) {
                Ok(_) => {
                    answered += 1;
                    log::debug!("DNS answer {} -> {}", self.address, peer);
                }
                Err(e) => log::warn!("Failed to send DNS answer to {}: {}", peer, e),
            }
        }

        Ok(answered)
    }

    pub fn stop(mut self, reactor: &mut Reactor) {
        if let Err(e) = reactor.unregister(&mut self.socket, DNS_SOCKET) {
            log::warn!("Failed to unregister DNS socket: {}", e);
        }
        log::info!("DNS server stopped");
    }
}

/// 第一个 question 结束的位置（含 QTYPE/QCLASS）
fn question_end(query: &[u8]) -> Option<usize> {
    let mut pos = HEADER_LEN;
    loop {
        let len = *query.get(pos)? as usize;
        if len & 0xC0 != 0 {
            // 压缩指针占两个字节，并结束域名
            pos += 2;
            break;
        }
        pos += 1;
        if len == 0 {
            break;
        }
        pos += len;
    }
    let end = pos + 4;
    (end <= query.len()).then_some(end)
}

/// 构造只有一条 A 记录的回答，写入 `out`，返回长度。
/// 只有截断的报文返回 `None`，其他格式问题照常回答。
pub fn build_response(query: &[u8], address: Ipv4Addr, out: &mut [u8]) -> Option<usize> {
    if query.len() < HEADER_LEN {
        return None;
    }
    let end = question_end(query)?;
    let total = end + ANSWER_LEN;
    if total > out.len() {
        return None;
    }

    // 事务 ID
    out[0..2].copy_from_slice(&query[0..2]);
    // QR=1，保留 opcode 和 RD，RA=1，RCODE=0
    out[2] = 0x80 | (query[2] & 0x79);
    out[3] = 0x80;
    out[4..6].copy_from_slice(&1u16.to_be_bytes());
    out[6..8].copy_from_slice(&1u16.to_be_bytes());
    out[8..12].fill(0);
    out[HEADER_LEN..end].copy_from_slice(&query[HEADER_LEN..end]);

    let answer = &mut out[end..total];
    // 指向偏移 12 处的域名
    answer[0..2].copy_from_slice(&[0xC0, 0x0C]);
    answer[2..4].copy_from_slice(&1u16.to_be_bytes());
    answer[4..6].copy_from_slice(&1u16.to_be_bytes());
    answer[6..10].copy_from_slice(&TTL_SECS.to_be_bytes());
    answer[10..12].copy_from_slice(&4u16.to_be_bytes());
    answer[12..16].copy_from_slice(&address.octets());

    Some(total)
}
