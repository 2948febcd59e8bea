//! Minimal HTTP/1.1 message codec. Built directly on `httparse` (the same
//! incremental header parser the framework's own HTTP engine uses
//! internally) rather than pulling in the framework's full hyper-derived
//! connection driver, which is built around a `Service`-per-connection
//! model that cannot give the pipeline the byte-level control it needs at
//! the `CONNECT` boundary (§4.4 step 4 requires reading exactly one byte
//! off the wire *after* a response has already been flushed, something a
//! connection-owning `Service` driver does not expose).

mod body;
pub use body::{BODY_LIMIT, RecvBody, SendBody};
pub(crate) use body::{BodyLen, read_bounded};

use std::str::FromStr;

use bytes::{Buf, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HEADERS: usize = 128;
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Read one HTTP/1.x request head plus body from `reader`, reusing
/// whatever is already sitting in `buf`.
///
/// Returns `Ok(None)` if the peer closed the connection before sending any
/// bytes (a clean "nothing more to read", not an error — §4.3 expects the
/// pipeline to close quietly in this case).
#[allow(clippy::expect_used)]
pub(crate) async fn read_request<R>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> std::io::Result<Option<Request<RecvBody>>>
where
    R: AsyncRead + Unpin,
{
    let head_len = loop {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        match parsed
            .parse(buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?
        {
            httparse::Status::Complete(n) => break n,
            httparse::Status::Partial => {
                if buf.len() >= MAX_HEAD_SIZE {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "request head too large",
                    ));
                }
                if reader.read_buf(buf).await? == 0 {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
                }
            }
        }
    };

    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut raw_headers);
    let _ = parsed.parse(buf).map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
    })?;

    let method = Method::from_bytes(parsed.method.unwrap_or("GET").as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    let uri_raw = parsed.path.unwrap_or("/").to_owned();
    let version = if parsed.version == Some(1) {
        Version::HTTP_11
    } else {
        Version::HTTP_10
    };

    let mut header_map = HeaderMap::new();
    for h in parsed.headers.iter() {
        if h.name.is_empty() {
            continue;
        }
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        header_map.append(name, value);
    }

    buf.advance(head_len);

    let body_len = if method == Method::CONNECT {
        BodyLen::None
    } else {
        body_len_from_headers(&header_map)
    };
    let body = read_bounded(reader, buf, body_len, BODY_LIMIT).await?;

    let uri = if method == Method::CONNECT {
        Uri::from_str(&uri_raw)
    } else {
        Uri::from_str(&uri_raw)
    }
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

    let mut builder = Request::builder().method(method).uri(uri).version(version);
    *builder.headers_mut().expect("builder has no error yet") = header_map;
    builder
        .body(RecvBody(body))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
        .map(Some)
}

/// Read one HTTP/1.x response head plus body from `reader`. `request_method`
/// decides whether a body is expected at all (HEAD responses never have
/// one, regardless of headers, per RFC 7230 §3.3.3).
#[allow(clippy::expect_used)]
pub(crate) async fn read_response<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    request_method: &Method,
) -> std::io::Result<Response<RecvBody>>
where
    R: AsyncRead + Unpin,
{
    let head_len = loop {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut headers);
        match parsed
            .parse(buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?
        {
            httparse::Status::Complete(n) => break n,
            httparse::Status::Partial => {
                if buf.len() >= MAX_HEAD_SIZE {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "response head too large",
                    ));
                }
                if reader.read_buf(buf).await? == 0 {
                    return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
                }
            }
        }
    };

    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut raw_headers);
    let _ = parsed
        .parse(buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

    let status = StatusCode::from_u16(parsed.code.unwrap_or(502))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    let version = if parsed.version == Some(1) {
        Version::HTTP_11
    } else {
        Version::HTTP_10
    };

    let mut header_map = HeaderMap::new();
    for h in parsed.headers.iter() {
        if h.name.is_empty() {
            continue;
        }
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        header_map.append(name, value);
    }

    buf.advance(head_len);

    let no_body = request_method == Method::HEAD
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
        || status.is_informational();
    let body_len = if no_body {
        BodyLen::None
    } else {
        body_len_from_headers(&header_map)
    };
    let body = read_bounded(reader, buf, body_len, BODY_LIMIT).await?;

    let mut builder = Response::builder().status(status).version(version);
    *builder.headers_mut().expect("builder has no error yet") = header_map;
    builder
        .body(RecvBody(body))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

fn body_len_from_headers(headers: &HeaderMap) -> BodyLen {
    if let Some(te) = headers.get(http::header::TRANSFER_ENCODING) {
        if te
            .to_str()
            .unwrap_or_default()
            .rsplit(',')
            .next()
            .unwrap_or_default()
            .trim()
            .eq_ignore_ascii_case("chunked")
        {
            return BodyLen::Chunked;
        }
    }
    if let Some(cl) = headers.get(http::header::CONTENT_LENGTH) {
        if let Ok(n) = cl.to_str().unwrap_or_default().trim().parse::<u64>() {
            return BodyLen::Fixed(n);
        }
    }
    BodyLen::None
}

/// Serialize and write a request head plus body (used by the round-trip
/// delegator to speak HTTP/1 upstream, §4.6).
pub(crate) async fn write_request<W>(writer: &mut W, req: &Request<SendBody>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let mut head = format!("{} {} HTTP/1.1\r\n", req.method(), path);
    for (name, value) in req.headers() {
        head.push_str(name.as_str());
        head.push_str(": ");
        head.push_str(value.to_str().unwrap_or_default());
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(&req.body().0).await?;
    writer.flush().await
}

/// Serialize and write a response head plus body to the client (§4.3
/// "Write", §4.4 step 3).
pub(crate) async fn write_response<W>(writer: &mut W, res: &Response<SendBody>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reason = res.status().canonical_reason().unwrap_or("");
    let mut head = format!("HTTP/1.1 {} {}\r\n", res.status().as_str(), reason);
    for (name, value) in res.headers() {
        head.push_str(name.as_str());
        head.push_str(": ");
        head.push_str(value.to_str().unwrap_or_default());
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(&res.body().0).await?;
    writer.flush().await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn parses_simple_get() {
        let raw = b"GET / HTTP/1.1\r\nHost: example.test\r\n\r\n".to_vec();
        let mut reader = BufReader::new(std::io::Cursor::new(raw));
        let mut buf = BytesMut::new();
        let req = read_request(&mut reader, &mut buf).await.unwrap().unwrap();
        assert_eq!(req.method(), Method::GET);
        assert_eq!(req.headers().get("host").unwrap(), "example.test");
        assert!(req.body().0.is_empty());
    }

    #[tokio::test]
    async fn parses_post_with_content_length() {
        let raw = b"POST /x HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello".to_vec();
        let mut reader = BufReader::new(std::io::Cursor::new(raw));
        let mut buf = BytesMut::new();
        let req = read_request(&mut reader, &mut buf).await.unwrap().unwrap();
        assert_eq!(&req.body().0[..], b"hello");
    }

    #[tokio::test]
    async fn empty_stream_yields_none() {
        let mut reader = BufReader::new(std::io::Cursor::new(Vec::<u8>::new()));
        let mut buf = BytesMut::new();
        assert!(read_request(&mut reader, &mut buf).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn parses_response_with_chunked_body() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n0\r\n\r\n"
            .to_vec();
        let mut reader = BufReader::new(std::io::Cursor::new(raw));
        let mut buf = BytesMut::new();
        let res = read_response(&mut reader, &mut buf, &Method::GET)
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(&res.body().0[..], b"Wiki");
    }

    #[tokio::test]
    async fn head_response_has_no_body_even_with_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n".to_vec();
        let mut reader = BufReader::new(std::io::Cursor::new(raw));
        let mut buf = BytesMut::new();
        let res = read_response(&mut reader, &mut buf, &Method::HEAD)
            .await
            .unwrap();
        assert!(res.body().0.is_empty());
    }

    #[tokio::test]
    async fn writes_request_head_and_body() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("/foo?bar=1")
            .header("host", "example.test")
            .body(SendBody::empty())
            .unwrap();
        let mut out = Vec::new();
        write_request(&mut out, &req).await.unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.starts_with("GET /foo?bar=1 HTTP/1.1\r\n"));
        assert!(s.contains("host: example.test\r\n"));
    }
}
