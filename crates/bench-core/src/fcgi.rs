//! Minimal FastCGI client: one responder request at a time per connection.
//!
//! Only the records a GET-style request needs are produced. The stdout
//! stream is interpreted as a CGI response (header block, blank line, body).

use crate::connection::{
    Body, BoxFuture, Connection, ConnectionError, Dialer, Network, RequestParams, Response,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::{debug, warn};

pub const FCGI_VERSION_1: u8 = 1;
pub const HEADER_LEN: usize = 8;
pub const MAX_CONTENT_LEN: usize = 65_535;

const REQUEST_ID: u16 = 1;
const ROLE_RESPONDER: u16 = 1;
const FLAG_KEEP_CONN: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
}

impl RecordType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RecordType::BeginRequest),
            2 => Some(RecordType::AbortRequest),
            3 => Some(RecordType::EndRequest),
            4 => Some(RecordType::Params),
            5 => Some(RecordType::Stdin),
            6 => Some(RecordType::Stdout),
            7 => Some(RecordType::Stderr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub record_type: u8,
    pub request_id: u16,
    pub content: Bytes,
}

/// Append one record, padding the content to an 8-byte boundary.
pub fn write_record(
    buf: &mut BytesMut,
    record_type: RecordType,
    request_id: u16,
    content: &[u8],
) {
    debug_assert!(content.len() <= MAX_CONTENT_LEN);
    let padding = (8 - content.len() % 8) % 8;
    buf.reserve(HEADER_LEN + content.len() + padding);
    buf.put_u8(FCGI_VERSION_1);
    buf.put_u8(record_type as u8);
    buf.put_u16(request_id);
    buf.put_u16(content.len() as u16);
    buf.put_u8(padding as u8);
    buf.put_u8(0);
    buf.put_slice(content);
    buf.put_bytes(0, padding);
}

/// Append a record stream, splitting `content` at the maximum record size.
/// The terminating empty record is not written.
fn write_stream(buf: &mut BytesMut, record_type: RecordType, request_id: u16, content: &[u8]) {
    for chunk in content.chunks(MAX_CONTENT_LEN) {
        write_record(buf, record_type, request_id, chunk);
    }
}

fn put_length(buf: &mut BytesMut, len: usize) {
    if len < 128 {
        buf.put_u8(len as u8);
    } else {
        buf.put_u32(len as u32 | 0x8000_0000);
    }
}

pub fn encode_name_value(buf: &mut BytesMut, name: &str, value: &str) {
    put_length(buf, name.len());
    put_length(buf, value.len());
    buf.put_slice(name.as_bytes());
    buf.put_slice(value.as_bytes());
}

fn take_length(buf: &mut &[u8]) -> Result<usize, ConnectionError> {
    if !buf.has_remaining() {
        return Err(ConnectionError::Protocol("missing name/value length".into()));
    }
    if buf[0] & 0x80 == 0 {
        return Ok(buf.get_u8() as usize);
    }
    if buf.remaining() < 4 {
        return Err(ConnectionError::Protocol("short 4-byte length".into()));
    }
    Ok((buf.get_u32() & 0x7fff_ffff) as usize)
}

pub fn decode_name_values(mut buf: &[u8]) -> Result<Vec<(String, String)>, ConnectionError> {
    let mut pairs = Vec::new();
    while buf.has_remaining() {
        let name_len = take_length(&mut buf)?;
        let value_len = take_length(&mut buf)?;
        if buf.remaining() < name_len + value_len {
            return Err(ConnectionError::Protocol("name/value pair overruns record".into()));
        }
        let name = String::from_utf8_lossy(&buf[..name_len]).into_owned();
        buf.advance(name_len);
        let value = String::from_utf8_lossy(&buf[..value_len]).into_owned();
        buf.advance(value_len);
        pairs.push((name, value));
    }
    Ok(pairs)
}

/// Encode a complete responder request with an empty stdin.
pub fn encode_request(params: &RequestParams, keep_alive: bool) -> BytesMut {
    let mut buf = BytesMut::new();

    let mut begin = [0u8; 8];
    begin[..2].copy_from_slice(&ROLE_RESPONDER.to_be_bytes());
    begin[2] = if keep_alive { FLAG_KEEP_CONN } else { 0 };
    write_record(&mut buf, RecordType::BeginRequest, REQUEST_ID, &begin);

    let mut pairs = BytesMut::new();
    for (name, value) in params.iter() {
        encode_name_value(&mut pairs, name, value);
    }
    if !params.contains("REQUEST_METHOD") {
        encode_name_value(&mut pairs, "REQUEST_METHOD", "GET");
    }
    if !params.contains("CONTENT_LENGTH") {
        encode_name_value(&mut pairs, "CONTENT_LENGTH", "0");
    }
    write_stream(&mut buf, RecordType::Params, REQUEST_ID, &pairs);
    write_record(&mut buf, RecordType::Params, REQUEST_ID, &[]);
    write_record(&mut buf, RecordType::Stdin, REQUEST_ID, &[]);
    buf
}

pub async fn read_record<R>(reader: &mut R) -> Result<Record, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    if header[0] != FCGI_VERSION_1 {
        return Err(ConnectionError::Protocol(format!(
            "unsupported record version {}",
            header[0]
        )));
    }
    let request_id = u16::from_be_bytes([header[2], header[3]]);
    let content_len = u16::from_be_bytes([header[4], header[5]]) as usize;
    let padding_len = header[6] as usize;

    let mut content = vec![0u8; content_len + padding_len];
    reader.read_exact(&mut content).await?;
    content.truncate(content_len);

    Ok(Record {
        record_type: header[1],
        request_id,
        content: Bytes::from(content),
    })
}

/// Status and headers of a CGI response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiHead {
    pub status: u16,
    pub headers: BTreeMap<String, Vec<String>>,
}

/// Locate the blank line ending the header block. Returns the offset of the
/// separator and its length.
pub fn find_header_end(stdout: &[u8]) -> Option<(usize, usize)> {
    let crlf = stdout.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    let lf = stdout.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// True when every line before the blank line has the `Name: value` shape.
/// Raw script output that merely contains a blank line is not a header block.
pub fn is_header_block(block: &[u8]) -> bool {
    let text = String::from_utf8_lossy(block);
    let mut lines = text.split('\n').map(|l| l.trim_end_matches('\r')).peekable();
    lines.peek().is_some_and(|first| !first.is_empty())
        && lines.all(|line| match line.split_once(':') {
            Some((name, _)) => !name.is_empty() && !name.contains(char::is_whitespace),
            None => false,
        })
}

pub fn parse_head(block: &[u8]) -> Result<CgiHead, ConnectionError> {
    let text = String::from_utf8_lossy(block);
    let mut status = 200;
    let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for line in text.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ConnectionError::Protocol(format!("malformed header line {line:?}")))?;
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("status") {
            let code = value.split_whitespace().next().unwrap_or_default();
            status = code
                .parse()
                .map_err(|_| ConnectionError::Protocol(format!("invalid status {value:?}")))?;
        }
        headers
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
    }

    Ok(CgiHead { status, headers })
}

trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

async fn connect(network: Network, address: &str) -> std::io::Result<Box<dyn Transport>> {
    match network {
        Network::Tcp => {
            let stream = TcpStream::connect(address).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Network::Unix => Ok(Box::new(tokio::net::UnixStream::connect(address).await?)),
        #[cfg(not(unix))]
        Network::Unix => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "unix sockets are not supported on this platform",
        )),
    }
}

/// Dials FastCGI connections over TCP or a Unix socket.
#[derive(Debug, Clone)]
pub struct FcgiDialer {
    network: Network,
    address: String,
}

impl FcgiDialer {
    pub fn new(network: Network, address: impl Into<String>) -> Self {
        Self {
            network,
            address: address.into(),
        }
    }
}

impl Dialer for FcgiDialer {
    fn name(&self) -> &'static str {
        "fcgi"
    }

    fn dial(&self) -> BoxFuture<'_, Result<Box<dyn Connection>, ConnectionError>> {
        Box::pin(async move {
            let stream = connect(self.network, &self.address).await?;
            debug!("Connected to {} {}", self.network, self.address);
            Ok(Box::new(FcgiConnection {
                stream: Some(BufStream::new(stream)),
                keep_alive: false,
            }) as Box<dyn Connection>)
        })
    }
}

pub struct FcgiConnection {
    stream: Option<BufStream<Box<dyn Transport>>>,
    keep_alive: bool,
}

impl FcgiConnection {
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let stream: Box<dyn Transport> = Box::new(stream);
        Self {
            stream: Some(BufStream::new(stream)),
            keep_alive: false,
        }
    }

    async fn round_trip(&mut self, params: &RequestParams) -> Result<Response, ConnectionError> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            ConnectionError::Transport(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection is closed",
            ))
        })?;

        let request = encode_request(params, self.keep_alive);
        stream.write_all(&request).await?;
        stream.flush().await?;

        let mut stdout = BytesMut::new();
        let mut head: Option<CgiHead> = None;
        // Set once stdout is known to carry no header block.
        let mut raw = false;
        let mut scan_from = 0;

        loop {
            let record = match read_record(&mut *stream).await {
                Ok(record) => record,
                Err(e) => match head {
                    // Headers already arrived: the failure belongs to the body.
                    Some(head) => {
                        let body = Body::truncated(stdout.freeze(), e.to_string());
                        return Ok(response_from(head, body));
                    }
                    None => return Err(e),
                },
            };

            if record.request_id != REQUEST_ID {
                debug!("Ignoring record for request id {}", record.request_id);
                continue;
            }

            match RecordType::from_u8(record.record_type) {
                Some(RecordType::Stdout) => {
                    stdout.extend_from_slice(&record.content);
                    if head.is_none() && !raw {
                        match find_header_end(&stdout[scan_from..]) {
                            Some((end, sep)) => {
                                let end = scan_from + end;
                                if is_header_block(&stdout[..end]) {
                                    head = Some(parse_head(&stdout[..end])?);
                                    stdout.advance(end + sep);
                                } else {
                                    raw = true;
                                }
                            }
                            // a separator may straddle the next record
                            None => scan_from = stdout.len().saturating_sub(3),
                        }
                    }
                }
                Some(RecordType::Stderr) => {
                    warn!("fcgi stderr: {}", String::from_utf8_lossy(&record.content).trim_end());
                }
                Some(RecordType::EndRequest) => break,
                _ => {
                    return Err(ConnectionError::Protocol(format!(
                        "unexpected record type {}",
                        record.record_type
                    )));
                }
            }
        }

        if !self.keep_alive {
            self.stream = None;
        }

        let body = Body::complete(stdout.freeze());
        Ok(match head {
            Some(head) => response_from(head, body),
            None => Response {
                proto_major: 0,
                proto_minor: 0,
                status: 0,
                headers: BTreeMap::new(),
                body,
            },
        })
    }
}

fn response_from(head: CgiHead, body: Body) -> Response {
    Response {
        proto_major: 1,
        proto_minor: 1,
        status: head.status,
        headers: head.headers,
        body,
    }
}

impl Connection for FcgiConnection {
    fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    fn get<'a>(
        &'a mut self,
        params: &'a RequestParams,
    ) -> BoxFuture<'a, Result<Response, ConnectionError>> {
        Box::pin(self.round_trip(params))
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(mut stream) = self.stream.take() {
                if let Err(e) = stream.shutdown().await {
                    debug!("Error shutting down connection: {}", e);
                }
            }
        })
    }
}
