use std::{io, net::SocketAddr, time::Duration};

use log::{debug, trace};
use thiserror::Error;
use tokio::{
    net::{self, TcpStream},
    time,
};
use tokio_rustls::{TlsConnector, client::TlsStream};

use crate::{
    http::{RequestDescriptor, Scheme, Status},
    tls,
};

#[derive(Error, Debug)]
pub(crate) enum Error {
    #[error("could not resolve '{0}': {1}")]
    Resolve(String, io::Error),
    #[error("no address found for '{0}'")]
    NoAddress(String),
    #[error("could not connect to {0}: {1}")]
    Connect(SocketAddr, io::Error),
    #[error("TLS error: {0}")]
    Tls(anyhow::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Status to report to the client.
    pub(crate) fn status(&self) -> Status {
        match self {
            Error::Timeout(_) => Status::GatewayTimeout,
            _ => Status::BadGateway,
        }
    }
}

/// Connection to a destination.
pub(crate) enum Outbound {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// Opens a connection to the destination of a request, using TLS (through
/// `connector`) for https ones. The whole operation is bounded by `timeout`.
pub(crate) async fn connect(
    desc: &RequestDescriptor,
    timeout: Duration,
    connector: &TlsConnector,
) -> Result<Outbound, Error> {
    time::timeout(timeout, async {
        let stream = tcp_connect(&desc.host, desc.port).await?;
        Ok::<_, Error>(match desc.scheme {
            Scheme::Http => Outbound::Plain(stream),
            Scheme::Https => Outbound::Tls(Box::new(
                tls::connect(connector, &desc.host, stream)
                    .await
                    .map_err(Error::Tls)?,
            )),
        })
    })
    .await
    .map_err(|_| Error::Timeout(timeout))?
}

/// Opens a raw TCP connection to `host`:`port`, bounded by `timeout`.
pub(crate) async fn connect_tcp(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream, Error> {
    time::timeout(timeout, tcp_connect(host, port))
        .await
        .map_err(|_| Error::Timeout(timeout))?
}

/// Resolves `host` and tries its addresses in order until one accepts the
/// connection.
async fn tcp_connect(host: &str, port: u16) -> Result<TcpStream, Error> {
    let addrs = net::lookup_host((host, port))
        .await
        .map_err(|e| Error::Resolve(host.to_string(), e))?;

    let mut last = Error::NoAddress(host.to_string());
    for addr in addrs {
        trace!("Trying {addr}");
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                debug!("Connected to {addr}");
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Could not set TCP_NODELAY on the destination stream: {e}");
                }
                return Ok(stream);
            }
            Err(e) => last = Error::Connect(addr, e),
        }
    }

    Err(last)
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    fn desc(host: &str, port: u16, scheme: Scheme) -> RequestDescriptor {
        RequestDescriptor {
            method: "GET".to_string(),
            scheme,
            host: host.to_string(),
            port,
            path: Some("/".to_string()),
        }
    }

    /// Returns a local port nothing listens on.
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn connect_plain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let connector = tls::connector(None).unwrap();
        let conn = connect(
            &desc("127.0.0.1", port, Scheme::Http),
            Duration::from_secs(3),
            &connector,
        )
        .await
        .unwrap();
        assert!(matches!(conn, Outbound::Plain(_)));

        let stream = connect_tcp("localhost", port, Duration::from_secs(3)).await;
        // localhost might resolve to ::1 first, which is fine as long as one
        // of the addresses works.
        assert!(stream.is_ok());
    }

    #[tokio::test]
    async fn connect_errors() {
        let port = closed_port().await;

        let e = connect_tcp("127.0.0.1", port, Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(e, Error::Connect(_, _)));
        assert_eq!(e.status(), Status::BadGateway);

        let e = connect_tcp("invalid.invalid", 80, Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(e, Error::Resolve(_, _) | Error::Timeout(_)));

        // A plain TCP server can't complete a TLS handshake.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });
        let connector = tls::connector(None).unwrap();
        let e = connect(
            &desc("127.0.0.1", port, Scheme::Https),
            Duration::from_secs(3),
            &connector,
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(e, Error::Tls(_)));
        assert_eq!(e.status(), Status::BadGateway);

        assert_eq!(
            Error::Timeout(Duration::from_secs(1)).status(),
            Status::GatewayTimeout
        );
    }
}
