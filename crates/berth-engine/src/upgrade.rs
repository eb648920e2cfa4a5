//! Upgraded engine connections.
//!
//! The attach endpoint answers `101 Switching Protocols` and then carries the
//! container's stdio over the bare connection. How the output is framed
//! depends on the container's terminal setting, which the connection itself
//! does not say, so it is handed back undecoded.

use std::path::Path;
use std::sync::Arc;

use berth_common::config::TlsMaterial;
use berth_common::error::{BerthError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper::header::{CONNECTION, HOST, UPGRADE};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// A connection after the protocol switch, read and written as plain bytes.
pub type RawConnection = TokioIo<hyper::upgrade::Upgraded>;

/// Engine port assumed for a TCP host without one.
const PLAIN_PORT: u16 = 2375;
/// Engine port assumed for a TLS host without one.
const TLS_PORT: u16 = 2376;

/// Where raw connections to the engine are opened.
#[derive(Debug, Clone)]
pub struct Endpoint {
    host: String,
    tls: Option<TlsMaterial>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl Endpoint {
    /// An endpoint for `host`. TCP connections use `tls` when it is set.
    #[must_use]
    pub fn new(host: impl Into<String>, tls: Option<TlsMaterial>) -> Self {
        Self {
            host: host.into(),
            tls,
        }
    }

    /// Sends `POST path` asking to switch to a raw stream and returns the
    /// switched connection. `id` names the container in errors.
    ///
    /// # Errors
    ///
    /// Returns `Connection` if the engine cannot be reached or refuses the
    /// switch, `NotFound` if the container does not exist, and `Engine`
    /// for any other error status.
    pub async fn upgrade(&self, path: &str, id: &str) -> Result<RawConnection> {
        let (scheme, address) = self
            .host
            .split_once("://")
            .unwrap_or(("tcp", self.host.as_str()));
        match scheme {
            #[cfg(unix)]
            "unix" => {
                let stream = tokio::net::UnixStream::connect(address)
                    .await
                    .map_err(|e| self.connection_error(&e))?;
                switch(stream, "localhost", path, id).await
            }
            #[cfg(windows)]
            "npipe" => {
                let pipe = address.replace('/', "\\");
                let stream = tokio::net::windows::named_pipe::ClientOptions::new()
                    .open(&pipe)
                    .map_err(|e| self.connection_error(&e))?;
                switch(stream, "localhost", path, id).await
            }
            "tcp" | "http" | "https" => {
                let authority = self.authority(address);
                let stream = TcpStream::connect(&authority)
                    .await
                    .map_err(|e| self.connection_error(&e))?;
                match &self.tls {
                    Some(tls) => {
                        let stream = tls_connect(tls, &authority, stream).await?;
                        switch(stream, &authority, path, id).await
                    }
                    None => switch(stream, &authority, path, id).await,
                }
            }
            other => Err(BerthError::Connection {
                message: format!("{}: cannot open a raw connection over {other}", self.host),
            }),
        }
    }

    fn authority(&self, address: &str) -> String {
        let authority = address.split('/').next().unwrap_or(address);
        if authority.rsplit_once(':').is_some_and(|(_, port)| port.parse::<u16>().is_ok()) {
            authority.to_string()
        } else {
            let port = if self.tls.is_some() { TLS_PORT } else { PLAIN_PORT };
            format!("{authority}:{port}")
        }
    }

    fn connection_error(&self, err: &dyn std::fmt::Display) -> BerthError {
        BerthError::Connection {
            message: format!("{}: {err}", self.host),
        }
    }
}

/// Sends the upgrade request over `stream` and waits for the switch.
async fn switch<S>(stream: S, authority: &str, path: &str, id: &str) -> Result<RawConnection>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let failed = |stage: &str, e: &dyn std::fmt::Display| BerthError::Connection {
        message: format!("{stage} for {path}: {e}"),
    };

    let (mut sender, connection) = http1::handshake::<_, Empty<Bytes>>(TokioIo::new(stream))
        .await
        .map_err(|e| failed("handshake", &e))?;
    // Driving the connection is what hands the socket over on upgrade.
    drop(tokio::spawn(async move {
        if let Err(e) = connection.with_upgrades().await {
            tracing::debug!(error = %e, "upgraded engine connection ended");
        }
    }));

    let request = Request::post(path)
        .header(HOST, authority)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "tcp")
        .body(Empty::<Bytes>::new())
        .map_err(|e| failed("request", &e))?;
    let response = sender
        .send_request(request)
        .await
        .map_err(|e| failed("request", &e))?;

    match response.status() {
        StatusCode::SWITCHING_PROTOCOLS => {}
        StatusCode::NOT_FOUND => {
            return Err(BerthError::NotFound {
                kind: "container",
                id: id.to_string(),
            });
        }
        status => {
            let body = response
                .into_body()
                .collect()
                .await
                .map(http_body_util::Collected::to_bytes)
                .unwrap_or_default();
            return Err(BerthError::Engine {
                status: Some(status.as_u16()),
                message: error_message(&body),
            });
        }
    }

    let upgraded = hyper::upgrade::on(response)
        .await
        .map_err(|e| failed("upgrade", &e))?;
    Ok(TokioIo::new(upgraded))
}

fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<ErrorBody>(body).map_or_else(
        |_| String::from_utf8_lossy(body).trim().to_string(),
        |error| error.message,
    )
}

async fn tls_connect(
    tls: &TlsMaterial,
    authority: &str,
    stream: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let tls_error = |e: &dyn std::fmt::Display| BerthError::Connection {
        message: format!("TLS to {authority}: {e}"),
    };

    let mut roots = rustls::RootCertStore::empty();
    for cert in read_certs(&tls.ca).await? {
        roots.add(cert).map_err(|e| tls_error(&e))?;
    }
    let chain = read_certs(&tls.cert).await?;
    let key = read_key(&tls.key).await?;
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_error(&e))?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| tls_error(&e))?;

    let host = authority
        .rsplit_once(':')
        .map_or(authority, |(host, _)| host)
        .trim_start_matches('[')
        .trim_end_matches(']');
    let name = ServerName::try_from(host.to_string()).map_err(|e| tls_error(&e))?;
    TlsConnector::from(Arc::new(config))
        .connect(name, stream)
        .await
        .map_err(|e| tls_error(&e))
}

async fn read_pem(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|source| BerthError::Io {
        path: path.to_path_buf(),
        source,
    })
}

async fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = read_pem(path).await?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|source| BerthError::Io {
            path: path.to_path_buf(),
            source,
        })
}

async fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = read_pem(path).await?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|source| BerthError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| BerthError::Connection {
            message: format!("no private key in {}", path.display()),
        })
}
