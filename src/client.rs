//! Minimal client for a running daemon, used by the CLI and the integration tests.

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::daemon::BoundAddress;
use crate::protocol::{encode, FrameDecoder, Request, Response};

const MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;

enum Transport {
    #[cfg(unix)]
    Socket {
        stream: tokio::net::UnixStream,
        decoder: FrameDecoder,
    },
    Http {
        http: reqwest::Client,
        url: String,
    },
}

pub struct Client {
    transport: Transport,
    next_id: u64,
}

impl Client {
    pub async fn connect(address: &BoundAddress) -> Result<Self> {
        let transport = match address {
            #[cfg(unix)]
            BoundAddress::Socket(path) => Transport::Socket {
                stream: tokio::net::UnixStream::connect(path)
                    .await
                    .with_context(|| format!("failed to connect to {}", path.display()))?,
                decoder: FrameDecoder::new(MAX_RESPONSE_BYTES),
            },
            #[cfg(not(unix))]
            BoundAddress::Socket(path) => bail!("cannot reach {} on this platform", path.display()),
            BoundAddress::Http(addr) => Transport::Http {
                http: reqwest::Client::new(),
                url: format!("http://{addr}/rpc"),
            },
        };
        Ok(Self {
            transport,
            next_id: 1,
        })
    }

    /// Send one request and wait for its response.
    pub async fn call(&mut self, method: &str, params: Value) -> Result<Response> {
        let id = self.next_id;
        self.next_id += 1;
        let bytes = encode(&Request::new(method, params, id))?;

        match &mut self.transport {
            #[cfg(unix)]
            Transport::Socket { .. } => {
                self.send_bytes(&bytes).await?;
                self.read_response()
                    .await?
                    .ok_or_else(|| anyhow!("daemon closed the connection"))
            }
            Transport::Http { http, url } => {
                let body = http
                    .post(url.as_str())
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(bytes)
                    .send()
                    .await
                    .with_context(|| format!("request to {url} failed"))?
                    .bytes()
                    .await
                    .context("failed to read response body")?;
                serde_json::from_slice(&body).context("daemon sent an invalid response")
            }
        }
    }

    /// Write raw bytes to the socket. Socket transport only.
    pub async fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        match &mut self.transport {
            #[cfg(unix)]
            Transport::Socket { stream, .. } => {
                stream.write_all(bytes).await.context("write failed")?;
                stream.flush().await.context("flush failed")?;
                Ok(())
            }
            Transport::Http { .. } => bail!("raw writes need the socket transport"),
        }
    }

    /// Read the next response envelope. `Ok(None)` once the daemon closes the stream.
    pub async fn read_response(&mut self) -> Result<Option<Response>> {
        match &mut self.transport {
            #[cfg(unix)]
            Transport::Socket { stream, decoder } => {
                let mut buf = [0u8; 8192];
                loop {
                    if let Some(value) = decoder.next_frame().map_err(|e| anyhow!("{e}"))? {
                        let response = serde_json::from_value(value)
                            .context("daemon sent an invalid response")?;
                        return Ok(Some(response));
                    }
                    let n = stream.read(&mut buf).await.context("read failed")?;
                    if n == 0 {
                        return Ok(None);
                    }
                    decoder.push(&buf[..n]);
                }
            }
            Transport::Http { .. } => bail!("streamed reads need the socket transport"),
        }
    }
}

/// One-shot call against `address`.
pub async fn call(address: &BoundAddress, method: &str, params: Value) -> Result<Response> {
    Client::connect(address).await?.call(method, params).await
}
