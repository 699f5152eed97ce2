use anyhow::{Result, bail};
use log::{debug, info};
use tokio::{io::AsyncWriteExt, net::TcpStream};

use crate::{
    config::Config,
    context,
    http::{self, Request, Status},
    relay,
    tcp::outbound,
};

/// Handle a CONNECT request: open a TCP connection to the requested
/// destination, acknowledge the tunnel and relay opaque data both ways. `head`
/// holds the bytes the client sent right after the request head; they go to
/// the destination first.
pub(crate) async fn handle_connect(
    config: &Config,
    mut client: TcpStream,
    req: Request,
    head: Vec<u8>,
) -> Result<()> {
    let desc = match req.tunnel_descriptor() {
        Ok(desc) => desc,
        Err(e) => {
            http::try_reply(&mut client, Status::BadRequest, &config.proxy_agent).await;
            bail!("Could not open tunnel: {e}");
        }
    };
    context::set_target(&desc.authority())?;
    info!("CONNECT");

    // Nothing was sent to the client yet, it can still get an error status.
    let mut dest =
        match outbound::connect_tcp(&desc.host, desc.port, config.connect_timeout()).await {
            Ok(dest) => dest,
            Err(e) => {
                http::try_reply(&mut client, e.status(), &config.proxy_agent).await;
                bail!("Could not connect to destination: {e}");
            }
        };

    client
        .write_all(http::established_response(&config.proxy_agent).as_bytes())
        .await?;

    if !head.is_empty() {
        debug!("Forwarding {} bytes of early data", head.len());
        dest.write_all(&head).await?;
    }

    relay::proxy(client, dest, config.idle_timeout()).await
}
