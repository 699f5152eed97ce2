use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use anyhow::{Result, anyhow, bail};
use log::{debug, info, trace};
use tokio::{
    io::{self, AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, tcp::OwnedReadHalf},
    time,
};

use crate::{
    body,
    config::Config,
    context,
    http::{self, Body, Request, Status},
    reader::ReaderBuf,
    relay::{self, Activity},
    tcp::outbound::{self, Outbound},
};

/// Maximum size of a response head.
const MAX_RESPONSE_HEAD: usize = 64 * 1024;
/// Maximum time given to the client to close its side, once served.
const LINGER: Duration = Duration::from_secs(2);

/// How an exchange ended.
enum Outcome {
    /// The final response was fully relayed.
    Done,
    /// The destination switched protocols, what follows is opaque.
    Upgraded,
}

/// Handle a forward (non-CONNECT) request: replay it to the destination found
/// in its absolute URL target and relay the response back. `early` holds the
/// bytes the client already sent past the request head (start of the body).
///
/// The client connection carries this single request: it is closed once the
/// response was relayed, and anything the client sent past the request body
/// never reaches the destination.
pub(crate) async fn handle_request(
    config: &Config,
    mut client: TcpStream,
    req: Request,
    early: Vec<u8>,
) -> Result<()> {
    let desc = match req.forward_descriptor() {
        Ok(desc) => desc,
        Err(e) => {
            http::try_reply(&mut client, Status::BadRequest, &config.proxy_agent).await;
            bail!("Could not forward request: {e}");
        }
    };
    context::set_target(&desc.authority())?;

    let body = match req.body() {
        Ok(body) => body,
        Err(e) => {
            http::try_reply(&mut client, Status::BadRequest, &config.proxy_agent).await;
            bail!("Could not forward request: {e}");
        }
    };

    let path = desc.path.as_deref().unwrap_or("/");
    info!("{} {path}", desc.method);

    let connector = match config.tls_connector() {
        Ok(connector) => connector,
        Err(e) => {
            http::try_reply(&mut client, Status::BadGateway, &config.proxy_agent).await;
            bail!("Could not set up TLS: {e}");
        }
    };
    let dest = match outbound::connect(&desc, config.connect_timeout(), connector).await {
        Ok(dest) => dest,
        Err(e) => {
            http::try_reply(&mut client, e.status(), &config.proxy_agent).await;
            bail!("Could not connect to destination: {e}");
        }
    };

    let head = req.outbound_head(path);
    match dest {
        Outbound::Plain(dest) => exchange(config, &req, body, head, client, early, dest).await,
        Outbound::Tls(dest) => exchange(config, &req, body, head, client, early, *dest).await,
    }
}

/// Sends the request to the destination and relays its response back. Both
/// happen at the same time: the destination can answer before getting the
/// whole body (100-continue, early errors).
async fn exchange<S>(
    config: &Config,
    req: &Request,
    body: Body,
    head: Vec<u8>,
    client: TcpStream,
    early: Vec<u8>,
    dest: S,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (client_rx, mut client_tx) = client.into_split();
    let mut client_rx = ReaderBuf::from_parts(client_rx, early);
    let (dest_rx, mut dest_tx) = io::split(dest);
    let mut dest_rx = ReaderBuf::with_capacity(16 * 1024, dest_rx);

    let activity = Activity::new();
    let responded = AtomicBool::new(false);
    let mut timed_out = false;

    let ret = {
        let upload = async {
            let ret = async {
                dest_tx.write_all(&head).await?;
                activity.touch();
                body::copy(&mut client_rx, &mut dest_tx, body, &activity).await
            }
            .await;

            // Let the destination know nothing more is coming.
            if ret.is_err() {
                let _ = dest_tx.shutdown().await;
            }
            ret
        };
        let download = download(req, &mut dest_rx, &mut client_tx, &activity, &responded);
        let idle = relay::idle(&activity, config.idle_timeout());
        tokio::pin!(upload, download, idle);

        let mut uploading = true;
        loop {
            tokio::select! {
                ret = &mut upload, if uploading => {
                    uploading = false;
                    match ret {
                        Ok(len) => debug!("Request sent ({len} bytes of body)"),
                        // The destination might have answered already, it has
                        // the final say.
                        Err(e) => debug!("Could not send the whole request: {e}"),
                    }
                }
                ret = &mut download => {
                    // Upgraded connections carry raw data from now on, the
                    // request must be out first.
                    if uploading && matches!(ret, Ok(Outcome::Upgraded)) {
                        if let Err(e) = (&mut upload).await {
                            break Err(e);
                        }
                    }
                    break ret;
                }
                _ = &mut idle => {
                    timed_out = true;
                    break Err(anyhow!("Exchange was idle for too long"));
                }
            }
        }
    };

    match ret {
        Ok(Outcome::Done) => {
            drop((dest_rx, dest_tx));
            let _ = client_tx.shutdown().await;
            let (client_rx, _) = client_rx.into_parts();
            linger(client_rx).await;
            Ok(())
        }
        Ok(Outcome::Upgraded) => {
            debug!("Destination switched protocols");

            // Data read past the heads belongs to the new protocol.
            let (client_rx, up) = client_rx.into_parts();
            let (dest_rx, down) = dest_rx.into_parts();
            dest_tx.write_all(&up).await?;
            dest_tx.flush().await?;
            client_tx.write_all(&down).await?;

            relay::proxy_split(client_rx, client_tx, dest_rx, dest_tx, config.idle_timeout()).await
        }
        Err(e) => {
            // Nothing was sent to the client yet, it can still get an error
            // status.
            if !responded.load(Ordering::Relaxed) {
                let status = match timed_out {
                    true => Status::GatewayTimeout,
                    false => Status::BadGateway,
                };
                http::try_reply(&mut client_tx, status, &config.proxy_agent).await;
            }
            let _ = client_tx.shutdown().await;
            bail!("Could not relay the response: {e}");
        }
    }
}

/// Relays the destination responses to the client, informational ones first
/// if any, then the final one.
async fn download<R, W>(
    req: &Request,
    rb: &mut ReaderBuf<R>,
    client: &mut W,
    activity: &Activity,
    responded: &AtomicBool,
) -> Result<Outcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let (resp, len) = http::read_response(rb, MAX_RESPONSE_HEAD).await?;
        responded.store(true, Ordering::Relaxed);
        trace!("HTTP/1.{} {}", resp.version, resp.code);

        // The head goes out unmodified.
        client.write_all(&rb.buf()[..len]).await?;
        client.flush().await?;
        rb.consume(len);
        activity.touch();

        if resp.code == 101 {
            return Ok(Outcome::Upgraded);
        }
        if resp.is_informational() {
            continue;
        }

        let len = body::copy(rb, client, resp.body(&req.method)?, activity).await?;
        debug!("Response relayed ({}, {len} bytes of body)", resp.code);
        return Ok(Outcome::Done);
    }
}

/// Reads and drops what the client still sends, until it closes its side or
/// for `LINGER` at most. Closing with unread data would reset the connection
/// and the client could lose the end of the response.
async fn linger(mut client: OwnedReadHalf) {
    let _ = time::timeout(LINGER, io::copy(&mut client, &mut io::sink())).await;
}
