//! 单线程就绪事件分发
//!
//! 对 `mio::Poll` 的薄封装。每个 token 同一时刻只关注一个方向，
//! 由 socket 的所有者在读阶段和写阶段之间切换。

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use mio::event::{Event, Source};
use mio::{Events, Poll, Token};

pub const HTTP_LISTENER: Token = Token(0);
pub const DNS_SOCKET: Token = Token(1);
const FIRST_CONNECTION: usize = 2;

pub fn connection_token(slot: usize) -> Token {
    Token(FIRST_CONNECTION + slot)
}

pub fn connection_slot(token: Token) -> Option<usize> {
    token.0.checked_sub(FIRST_CONNECTION)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

impl Interest {
    fn as_mio(self) -> mio::Interest {
        match self {
            Interest::Readable => mio::Interest::READABLE,
            Interest::Writable => mio::Interest::WRITABLE,
        }
    }
}

/// 一次 poll 得到的就绪事件，只在本轮分发中有效
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvent {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// 对端关闭了读或写方向
    pub hangup: bool,
    pub error: bool,
}

impl From<&Event> for PollEvent {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            hangup: event.is_read_closed() || event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    interests: HashMap<Token, Interest>,
}

impl Reactor {
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
            interests: HashMap::new(),
        })
    }

    pub fn register<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll
            .registry()
            .register(source, token, interest.as_mio())?;
        self.interests.insert(token, interest);
        Ok(())
    }

    /// 切换关注方向。对同一方向重复调用会重新布防，
    /// 如果 socket 已经就绪会再产生一个事件。
    pub fn modify<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        if !self.interests.contains_key(&token) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("token {} is not registered", token.0),
            ));
        }
        self.poll
            .registry()
            .reregister(source, token, interest.as_mio())?;
        self.interests.insert(token, interest);
        Ok(())
    }

    /// 未注册的 token 直接忽略
    pub fn unregister<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
    ) -> io::Result<()> {
        if self.interests.remove(&token).is_none() {
            return Ok(());
        }
        self.poll.registry().deregister(source)
    }

    pub fn interest(&self, token: Token) -> Option<Interest> {
        self.interests.get(&token).copied()
    }

    pub fn registered(&self) -> usize {
        self.interests.len()
    }

    /// 最多等待 `timeout`；被信号打断视为没有事件
    pub fn poll(&mut self, timeout: Duration) -> io::Result<Vec<PollEvent>> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        Ok(self
            .events
            .iter()
            .filter(|event| self.interests.contains_key(&event.token()))
            .map(PollEvent::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn token_slots() {
        assert_eq!(connection_slot(connection_token(0)), Some(0));
        assert_eq!(connection_slot(connection_token(7)), Some(7));
        assert_eq!(connection_slot(HTTP_LISTENER), None);
        assert_eq!(connection_slot(DNS_SOCKET), None);
    }

    #[test]
    fn empty_poll_respects_timeout() {
        let mut reactor = Reactor::new(8).unwrap();
        let start = Instant::now();
        let events = reactor.poll(Duration::from_millis(20)).unwrap();
        assert!(events.is_empty());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn readable_datagram_and_double_unregister() {
        let mut reactor = Reactor::new(8).unwrap();
        let mut socket = mio::net::UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = socket.local_addr().unwrap();
        reactor
            .register(&mut socket, DNS_SOCKET, Interest::Readable)
            .unwrap();
        assert_eq!(reactor.interest(DNS_SOCKET), Some(Interest::Readable));

        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"ping", addr).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = false;
        while !seen && Instant::now() < deadline {
            seen = reactor
                .poll(Duration::from_millis(50))
                .unwrap()
                .iter()
                .any(|e| e.token == DNS_SOCKET && e.readable);
        }
        assert!(seen);

        reactor.unregister(&mut socket, DNS_SOCKET).unwrap();
        reactor.unregister(&mut socket, DNS_SOCKET).unwrap();
        assert_eq!(reactor.registered(), 0);
        assert!(reactor
            .modify(&mut socket, DNS_SOCKET, Interest::Writable)
            .is_err());
    }
}
