// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Fetching package archives.

Two URL schemes are supported: `file://` (and bare paths), which open the
file directly, and `https://`, which streams through [RangeRetryReader].
The range-retry body issues a plain GET and, when a read fails mid-stream
at byte offset `N`, transparently re-issues the request with
`Range: bytes=N-` and resumes from a validated `206 Partial Content`
response. It sits outside any response caching so a cached body is never
resumed.
*/

use {
    crate::{
        cache::local_path,
        error::{ApkError, Result},
        package::IndexPackage,
    },
    bytes::Bytes,
    futures::{future::BoxFuture, stream::BoxStream, FutureExt, StreamExt, TryStreamExt},
    log::{debug, warn},
    reqwest::{header, Client, Response, StatusCode},
    std::{
        io,
        pin::Pin,
        task::{Context, Poll},
    },
    tokio::io::{AsyncRead, ReadBuf},
    tokio_util::{io::StreamReader, sync::CancellationToken},
};

/// How many times a body read may be resumed before giving up.
const RANGE_RETRY_ATTEMPTS: usize = 5;

type BodyStream = BoxStream<'static, io::Result<Bytes>>;
type Body = StreamReader<BodyStream, Bytes>;

fn response_body(response: Response) -> Body {
    StreamReader::new(
        response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            .boxed(),
    )
}

enum State {
    Streaming(Body),
    Reconnecting(BoxFuture<'static, io::Result<Body>>),
}

/// A byte stream over an HTTP response body that resumes after mid-stream
/// read errors by issuing byte-range continuation requests.
pub struct RangeRetryReader {
    client: Client,
    url: String,
    offset: u64,
    attempts_left: usize,
    state: State,
}

impl RangeRetryReader {
    /// Issue the initial GET and wrap the response body.
    pub async fn open(client: Client, url: String) -> Result<Self> {
        let response = client.get(url.as_str()).send().await?;
        if !response.status().is_success() {
            return Err(ApkError::Fetch(format!(
                "unexpected status {} fetching {}",
                response.status(),
                url
            )));
        }

        Ok(Self {
            client,
            url,
            offset: 0,
            attempts_left: RANGE_RETRY_ATTEMPTS,
            state: State::Streaming(response_body(response)),
        })
    }
}

/// Re-issue a request for the remainder of the body from `offset`.
fn reconnect(client: Client, url: String, offset: u64) -> BoxFuture<'static, io::Result<Body>> {
    async move {
        let response = client
            .get(url.as_str())
            .header(header::RANGE, format!("bytes={}-", offset))
            .send()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "expected 206 resuming {} at offset {}, got {}",
                    url,
                    offset,
                    response.status()
                ),
            ));
        }

        let content_range = response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_range.starts_with(&format!("bytes {}-", offset)) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "range response for {} starts at the wrong offset: {:?}",
                    url, content_range
                ),
            ));
        }

        Ok(response_body(response))
    }
    .boxed()
}

impl AsyncRead for RangeRetryReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            let next = match &mut this.state {
                State::Streaming(body) => {
                    let before = buf.filled().len();
                    match Pin::new(body).poll_read(cx, buf) {
                        Poll::Ready(Ok(())) => {
                            this.offset += (buf.filled().len() - before) as u64;
                            return Poll::Ready(Ok(()));
                        }
                        Poll::Ready(Err(e)) => {
                            if this.attempts_left == 0 {
                                return Poll::Ready(Err(e));
                            }
                            this.attempts_left -= 1;
                            warn!(
                                "read of {} failed at offset {} ({}); resuming with a range request",
                                this.url, this.offset, e
                            );
                            State::Reconnecting(reconnect(
                                this.client.clone(),
                                this.url.clone(),
                                this.offset,
                            ))
                        }
                        Poll::Pending => return Poll::Pending,
                    }
                }
                State::Reconnecting(fut) => match fut.as_mut().poll(cx) {
                    Poll::Ready(Ok(body)) => State::Streaming(body),
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                },
            };

            this.state = next;
        }
    }
}

/// Open a package archive for reading.
pub(crate) async fn fetch_package(
    token: &CancellationToken,
    client: &Client,
    pkg: &IndexPackage,
) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
    if token.is_cancelled() {
        return Err(ApkError::Cancelled);
    }

    let url = pkg.url();
    debug!("fetching {} ({}) from {}", pkg.name, pkg.version, url);

    if let Some(path) = local_path(&url) {
        let file = tokio::fs::File::open(&path).await?;
        return Ok(Box::new(file));
    }

    match url.split("://").next().unwrap_or_default() {
        "https" => Ok(Box::new(
            RangeRetryReader::open(client.clone(), url).await?,
        )),
        scheme => Err(ApkError::UnsupportedScheme(scheme.to_string())),
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::io::sha1_digest,
        std::sync::Arc,
        tokio::{
            io::{AsyncReadExt, AsyncWriteExt},
            net::TcpListener,
            sync::Mutex,
        },
    };

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            if n == 0 || request.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        String::from_utf8_lossy(&request).to_string()
    }

    fn range_start(request: &str) -> Option<usize> {
        request.lines().find_map(|line| {
            line.strip_prefix("Range: bytes=")
                .and_then(|rest| rest.trim_end_matches('-').parse().ok())
        })
    }

    /// Serve `body`, truncating the first response after `cut` bytes and
    /// honoring byte-range requests afterwards.
    async fn flaky_server(
        listener: TcpListener,
        body: Vec<u8>,
        cut: usize,
        requests: Arc<Mutex<Vec<String>>>,
    ) {
        let mut first = true;

        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };

            let request = read_request(&mut socket).await;
            requests.lock().await.push(request.clone());

            if first {
                first = false;
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                socket.write_all(head.as_bytes()).await.unwrap();
                socket.write_all(&body[..cut]).await.unwrap();
                socket.flush().await.unwrap();
                // Drop the socket mid-body.
                drop(socket);
            } else {
                let start = range_start(&request).unwrap_or(0);
                let rest = &body[start..];
                let head = format!(
                    "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nConnection: close\r\n\r\n",
                    rest.len(),
                    start,
                    body.len() - 1,
                    body.len()
                );
                socket.write_all(head.as_bytes()).await.unwrap();
                socket.write_all(rest).await.unwrap();
                socket.flush().await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn range_retry_resumes_mid_stream() -> Result<()> {
        let body: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let cut = 40_000;

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(Mutex::new(Vec::new()));

        let server = tokio::spawn(flaky_server(
            listener,
            body.clone(),
            cut,
            Arc::clone(&requests),
        ));

        let url = format!("http://{}/pkgs/hello-1.0-r0.apk", addr);
        let mut reader = RangeRetryReader::open(Client::new(), url).await?;

        let mut fetched = Vec::new();
        reader.read_to_end(&mut fetched).await?;

        assert_eq!(fetched.len(), body.len());
        assert_eq!(sha1_digest(&fetched), sha1_digest(&body));

        let requests = requests.lock().await;
        assert!(requests.len() >= 2);
        assert!(
            requests[1..].iter().any(|r| r.contains("Range: bytes=")),
            "no range follow-up request was issued"
        );

        server.abort();

        Ok(())
    }

    #[tokio::test]
    async fn bad_status_is_a_fetch_error() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let server = tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let _ = read_request(&mut socket).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                    .await;
            }
        });

        let url = format!("http://{}/missing.apk", addr);
        assert!(matches!(
            RangeRetryReader::open(Client::new(), url).await,
            Err(ApkError::Fetch(_))
        ));

        server.abort();

        Ok(())
    }

    #[tokio::test]
    async fn fetch_package_from_file_url() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("hello-1.0-r0.apk");
        std::fs::write(&path, b"archive bytes")?;

        let pkg = IndexPackage {
            name: "hello".to_string(),
            version: "1.0-r0".to_string(),
            url: Some(format!("file://{}", path.display())),
            ..Default::default()
        };

        let token = CancellationToken::new();
        let mut reader = fetch_package(&token, &Client::new(), &pkg).await?;

        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        assert_eq!(data, b"archive bytes");

        token.cancel();
        assert!(matches!(
            fetch_package(&token, &Client::new(), &pkg).await,
            Err(ApkError::Cancelled)
        ));

        Ok(())
    }

    #[tokio::test]
    async fn unsupported_scheme() {
        let pkg = IndexPackage {
            name: "hello".to_string(),
            version: "1.0-r0".to_string(),
            url: Some("ftp://example.org/hello-1.0-r0.apk".to_string()),
            ..Default::default()
        };

        let token = CancellationToken::new();
        assert!(matches!(
            fetch_package(&token, &Client::new(), &pkg).await,
            Err(ApkError::UnsupportedScheme(_))
        ));
    }
}
