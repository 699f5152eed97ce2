use std::{path::Path, sync::Arc};

use anyhow::{Result, anyhow, bail};
use log::warn;
use rustls::{
    ClientConfig, RootCertStore,
    crypto::ring,
    pki_types::{CertificateDer, ServerName, pem::PemObject},
};
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, client::TlsStream};

/// Builds the TLS connector used for https destinations. Server certificates
/// are checked against the web PKI roots, and against the certificates found
/// in `ca_file` (PEM) if one is given.
pub(crate) fn connector(ca_file: Option<&Path>) -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = ca_file {
        let certs = CertificateDer::pem_file_iter(path)
            .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
            .map_err(|e| anyhow!("Could not read CA file '{}': {e}", path.display()))?;

        let (added, ignored) = roots.add_parsable_certificates(certs);
        if added == 0 {
            bail!("No usable certificate in CA file '{}'", path.display());
        }
        if ignored > 0 {
            warn!(
                "Ignored {ignored} invalid certificate(s) from '{}'",
                path.display()
            );
        }
    }

    let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Starts a TLS session with `host` on top of an established TCP connection.
/// The server certificate must be valid for `host`.
pub(crate) async fn connect(
    connector: &TlsConnector,
    host: &str,
    stream: TcpStream,
) -> Result<TlsStream<TcpStream>> {
    let name = ServerName::try_from(host.to_string())
        .map_err(|e| anyhow!("Invalid TLS server name '{host}': {e}"))?;

    Ok(connector.connect(name, stream).await?)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{fs, path::PathBuf};

    use rcgen::{CertificateParams, KeyPair};
    use rustls::{
        ServerConfig,
        pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer},
    };
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    use super::*;

    /// Self-signed certificate for 127.0.0.1, with its PEM written in a
    /// temporary CA file.
    pub(crate) struct TestCert {
        pub(crate) acceptor: TlsAcceptor,
        pub(crate) ca_file: PathBuf,
        _dir: TempDir,
    }

    impl TestCert {
        pub(crate) fn new() -> Self {
            let key = KeyPair::generate().unwrap();
            let cert = CertificateParams::new(vec!["127.0.0.1".to_string()])
                .unwrap()
                .self_signed(&key)
                .unwrap();

            let dir = tempfile::tempdir().unwrap();
            let ca_file = dir.path().join("ca.pem");
            fs::write(&ca_file, cert.pem()).unwrap();

            let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
                .with_safe_default_protocol_versions()
                .unwrap()
                .with_no_client_auth()
                .with_single_cert(
                    vec![cert.der().clone()],
                    PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
                )
                .unwrap();

            Self {
                acceptor: TlsAcceptor::from(Arc::new(config)),
                ca_file,
                _dir: dir,
            }
        }
    }

    #[test]
    fn ca_file() {
        assert!(connector(None).is_ok());

        let cert = TestCert::new();
        assert!(connector(Some(&cert.ca_file)).is_ok());

        // Missing file, or without any certificate.
        assert!(connector(Some(Path::new("/nonexistent/ca.pem"))).is_err());
        let empty = cert.ca_file.with_file_name("empty.pem");
        fs::write(&empty, "not a certificate\n").unwrap();
        assert!(connector(Some(&empty)).is_err());
    }

    #[tokio::test]
    async fn handshake() {
        let cert = TestCert::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = cert.acceptor.clone();
        tokio::spawn(async move {
            for _ in 0..2 {
                let (stream, _) = listener.accept().await.unwrap();
                let _ = acceptor.accept(stream).await;
            }
        });

        // Only trusted with the CA file.
        let stream = TcpStream::connect(addr).await.unwrap();
        let trusted = connector(Some(&cert.ca_file)).unwrap();
        assert!(connect(&trusted, "127.0.0.1", stream).await.is_ok());

        let stream = TcpStream::connect(addr).await.unwrap();
        let default = connector(None).unwrap();
        assert!(connect(&default, "127.0.0.1", stream).await.is_err());
    }

    #[tokio::test]
    async fn handshake_failure() {
        // A peer answering garbage to the client hello.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = tokio::io::AsyncWriteExt::write_all(
                &mut stream,
                b"HTTP/1.1 400 Bad Request\r\n\r\n",
            )
            .await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let connector = connector(None).unwrap();
        assert!(connect(&connector, "localhost", stream).await.is_err());
    }
}
