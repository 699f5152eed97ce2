use std::{io, sync::Arc};

use anyhow::{Result, bail};
use log::{debug, error, info, trace};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::Semaphore,
    time,
};

use crate::{
    config::Config,
    context::*,
    http::{self, Status},
    reader::ReaderBuf,
    tcp::{forward, tunnel},
};

/// Starts a TCP server on the configured address and proxies incoming
/// connections.
pub(crate) async fn listen_and_proxy(config: Arc<Config>) -> Result<()> {
    let listener = TcpListener::bind(config.bind).await?;
    info!("Proxy running on {}", listener.local_addr()?);

    serve(config, listener).await
}

/// Accepts connections on `listener`, each of them being handled in its own
/// task.
pub(crate) async fn serve(config: Arc<Config>, listener: TcpListener) -> Result<()> {
    let slots = Arc::new(Semaphore::new(config.max_connections));

    // Do not return an error starting from here, this would close the whole
    // listener.

    loop {
        // Wait for a connection to end before accepting new ones, if we're
        // at the limit.
        let slot = match Arc::clone(&slots).acquire_owned().await {
            Ok(slot) => slot,
            Err(e) => bail!("Connection slots are gone: {e}"),
        };

        // Do not fail on stream errors.
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Connection error: {e}");
                continue;
            }
        };

        let local = match stream.local_addr() {
            Ok(local) => local,
            Err(e) => {
                match e.kind() {
                    // Even in this small window the client could close the connection.
                    io::ErrorKind::NotConnected => continue,
                    _ => {
                        error!("Could not get local address: {e}");
                        continue;
                    }
                }
            }
        };

        // Handle the connection async.
        let config = Arc::clone(&config);
        tokio::spawn(with_req_context(
            ReqContext::from(local, peer),
            async move {
                debug!("New connection from client");

                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Could not set TCP_NODELAY on the client stream: {e}");
                }

                if let Err(e) = handle_stream(config, stream).await {
                    error!("{e}");
                }

                drop(slot);
            },
        ));
    }
}

/// Reads a request head from a new client connection and dispatches it to
/// the tunnel or the forward handler.
pub(crate) async fn handle_stream(config: Arc<Config>, stream: TcpStream) -> Result<()> {
    let mut rb = ReaderBuf::with_capacity(config.max_header_size, stream);

    let read = time::timeout(
        config.header_timeout(),
        http::read_request(&mut rb, config.max_header_size),
    )
    .await;

    let (req, len) = match read {
        Ok(Ok(parsed)) => parsed,
        Ok(Err(e)) => {
            match e.downcast_ref::<http::Error>().and_then(http::Error::status) {
                Some(status) => {
                    http::try_reply(rb.get_mut(), status, &config.proxy_agent).await;
                }
                // Port scans and such, not worth an error.
                None if rb.len() == 0 => {
                    debug!("Connection closed before any request");
                    return Ok(());
                }
                None => (),
            }
            bail!("Could not read request: {e}");
        }
        Err(_) => {
            http::try_reply(rb.get_mut(), Status::RequestTimeout, &config.proxy_agent).await;
            bail!("Timed out waiting for the request head");
        }
    };
    trace!("{} {} HTTP/1.{}", req.method, req.target, req.version);

    // Whatever follows the head belongs to the destination.
    let (stream, mut buf) = rb.into_parts();
    let early = buf.split_off(len);

    match req.is_connect() {
        true => tunnel::handle_connect(&config, stream, req, early).await,
        false => forward::handle_request(&config, stream, req, early).await,
    }
}
