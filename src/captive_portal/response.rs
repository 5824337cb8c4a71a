//! HTTP 响应与分段发送
//!
//! 响应头和响应体串成一个 `Read`，每次可写事件最多发送一个 TCP 分段。

use std::io::{self, Cursor, Read, Write};
use std::net::Ipv4Addr;

use http::StatusCode;

/// TCP 默认 MSS
pub const SEGMENT_SIZE: usize = 536;

pub type Body = Box<dyn Read>;

pub struct Response {
    pub status: StatusCode,
    pub headers: Vec<(&'static str, String)>,
    pub body: Body,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Box::new(io::empty()),
        }
    }

    pub fn ok(content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self::new(StatusCode::OK)
            .header("Content-Type", content_type)
            .body(Cursor::new(body.into()))
    }

    pub fn redirect(address: Ipv4Addr) -> Self {
        Self::new(StatusCode::TEMPORARY_REDIRECT).header("Location", format!("http://{}/", address))
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND)
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn body(mut self, body: impl Read + 'static) -> Self {
        self.body = Box::new(body);
        self
    }

    /// 状态行 + 头 + 空行
    pub fn head(&self) -> Vec<u8> {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\n",
            self.status.as_u16(),
            self.status.canonical_reason().unwrap_or("")
        );
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("Connection: close\r\n\r\n");
        head.into_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProgress {
    /// 发出了一个分段，还有剩余
    Sent,
    /// socket 暂时写不进去
    Blocked,
    /// 全部发完或对端不再接收，可以关闭
    Complete,
}

/// 单个连接的发送状态。
///
/// `start..end` 是缓冲区中还没写出去的部分，只有完全写完后才从源重新填充。
pub struct OutboundConnection {
    source: Body,
    buffer: Box<[u8]>,
    start: usize,
    end: usize,
}

impl OutboundConnection {
    pub fn new(response: Response, segment_size: usize) -> io::Result<Self> {
        let head = response.head();
        let mut source: Body = Box::new(Cursor::new(head).chain(response.body));
        let mut buffer = vec![0u8; segment_size.max(1)].into_boxed_slice();
        let end = fill(source.as_mut(), &mut buffer)?;

        Ok(Self {
            source,
            buffer,
            start: 0,
            end,
        })
    }

    pub fn pending(&self) -> &[u8] {
        &self.buffer[self.start..self.end]
    }

    pub fn write_to<W: Write + ?Sized>(&mut self, sink: &mut W) -> io::Result<WriteProgress> {
        if self.start == self.end {
            return Ok(WriteProgress::Complete);
        }

        let written = match sink.write(&self.buffer[self.start..self.end]) {
            Ok(0) => return Ok(WriteProgress::Complete),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(WriteProgress::Blocked),
            Err(e) => return Err(e),
        };

        if written < self.end - self.start {
            self.start += written;
            return Ok(WriteProgress::Sent);
        }

        // 缓冲区没填满说明源已经读完
        if self.end < self.buffer.len() {
            self.start = self.end;
            return Ok(WriteProgress::Complete);
        }

        self.start = 0;
        self.end = fill(self.source.as_mut(), &mut self.buffer)?;
        if self.end == 0 {
            Ok(WriteProgress::Complete)
        } else {
            Ok(WriteProgress::Sent)
        }
    }
}

/// 尽量填满缓冲区，直到源读完
fn fill(source: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
