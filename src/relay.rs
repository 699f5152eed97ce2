use std::{
    io,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use anyhow::{Result, anyhow};
use log::debug;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::{self, Instant},
};

use crate::zc;

/// Per direction buffer size, when relaying through user space.
const BUF_SIZE: usize = 16 * 1024;

/// Keeps track of when data last moved through a relay.
pub(crate) struct Activity {
    start: Instant,
    /// Milliseconds since `start`.
    last: AtomicU64,
}

impl Activity {
    pub(crate) fn new() -> Self {
        Self {
            start: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    /// Record data was moved.
    pub(crate) fn touch(&self) {
        self.last
            .store(self.start.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.start + Duration::from_millis(self.last.load(Ordering::Relaxed))
    }
}

/// Completes once no data moved for `timeout`. Never completes if no timeout
/// is given.
pub(crate) async fn idle(activity: &Activity, timeout: Option<Duration>) {
    let Some(timeout) = timeout else {
        return std::future::pending().await;
    };

    loop {
        let deadline = activity.last() + timeout;
        if deadline <= Instant::now() {
            return;
        }
        time::sleep_until(deadline).await;
    }
}

/// Relay data between a client and a destination TCP streams until one of
/// them is done, then close both.
pub(crate) async fn proxy(
    mut client: TcpStream,
    mut dest: TcpStream,
    idle_timeout: Option<Duration>,
) -> Result<()> {
    // Send keepalive to both the client and the destination.
    let keep_alive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(60));
    socket2::SockRef::from(&client).set_tcp_keepalive(&keep_alive)?;
    socket2::SockRef::from(&dest).set_tcp_keepalive(&keep_alive)?;

    let activity = Activity::new();

    debug!("Starting relaying the connection");
    let ret = tokio::select! {
        ret = zc::copy_bidirectional(&mut client, &mut dest, &activity) => ret.map(|(up, down)| {
            debug!("Connection shut down ({up} bytes up, {down} bytes down)");
        }),
        _ = idle(&activity, idle_timeout) => Err(anyhow!("Connection was idle for too long")),
    };

    // Do not leave half-open connections behind.
    let _ = client.shutdown().await;
    let _ = dest.shutdown().await;
    ret
}

/// Relay data between the read and write halves of a client and a
/// destination of any kind until one of them is done, then close both. Data
/// goes through a fixed size buffer in each direction.
pub(crate) async fn proxy_split<CR, CW, DR, DW>(
    mut client_rx: CR,
    mut client_tx: CW,
    mut dest_rx: DR,
    mut dest_tx: DW,
    idle_timeout: Option<Duration>,
) -> Result<()>
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    DR: AsyncRead + Unpin,
    DW: AsyncWrite + Unpin,
{
    let activity = Activity::new();

    debug!("Starting relaying the connection");
    let ret = tokio::select! {
        ret = pump(&mut client_rx, &mut dest_tx, &activity) => ret.map_err(anyhow::Error::from).map(|up| {
            debug!("Connection shut down by the client ({up} bytes up)");
        }),
        ret = pump(&mut dest_rx, &mut client_tx, &activity) => ret.map_err(anyhow::Error::from).map(|down| {
            debug!("Connection shut down by the destination ({down} bytes down)");
        }),
        _ = idle(&activity, idle_timeout) => Err(anyhow!("Connection was idle for too long")),
    };

    let _ = client_tx.shutdown().await;
    let _ = dest_tx.shutdown().await;
    ret
}

/// Copy data from `r` to `w` until `r` is done. Never reads more than what
/// `w` accepted so far.
async fn pump<R, W>(r: &mut R, w: &mut W, activity: &Activity) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0; BUF_SIZE];
    let mut moved = 0;

    loop {
        let read = match r.read(&mut buf).await {
            Ok(0) => return Ok(moved),
            Ok(read) => read,
            Err(e) => match e.kind() {
                // Peer went away (or a TLS peer did not send close_notify).
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof => return Ok(moved),
                _ => return Err(e),
            },
        };
        activity.touch();

        w.write_all(&buf[..read]).await?;
        w.flush().await?;
        moved += read as u64;
        activity.touch();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex, split};

    use super::*;

    #[tokio::test]
    async fn idle_watchdog() {
        let activity = Activity::new();
        assert!(activity.last() <= Instant::now());

        // Without a timeout, never fires.
        assert!(
            time::timeout(Duration::from_millis(50), idle(&activity, None))
                .await
                .is_err()
        );

        // With one, fires once enough time passed since the last move.
        time::sleep(Duration::from_millis(20)).await;
        activity.touch();
        let touched = activity.last();
        assert!(touched > activity.start);
        idle(&activity, Some(Duration::from_millis(50))).await;
        assert!(Instant::now() >= touched + Duration::from_millis(50));
    }

    /// Relays between two in-memory pipes, returns the far ends.
    fn proxy_duplex(
        idle_timeout: Option<Duration>,
    ) -> (
        tokio::io::DuplexStream,
        tokio::io::DuplexStream,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        // Small buffers on both sides, so the relay has to wait for readers.
        let (client, proxy_client) = duplex(64);
        let (proxy_dest, dest) = duplex(64);

        let (client_rx, client_tx) = split(proxy_client);
        let (dest_rx, dest_tx) = split(proxy_dest);
        let relay = tokio::spawn(super::proxy_split(
            client_rx,
            client_tx,
            dest_rx,
            dest_tx,
            idle_timeout,
        ));

        (client, dest, relay)
    }

    #[tokio::test]
    async fn proxy_split() {
        let (mut client, mut dest, relay) = proxy_duplex(None);

        let data: Vec<u8> = (0..(1 << 20)).map(|i| (i % 253) as u8).collect();
        let expected = data.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&data).await.unwrap();
            client
        });

        let mut received = vec![0; expected.len()];
        dest.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        dest.write_all(b"\x00\xffreply").await.unwrap();
        let mut client = writer.await.unwrap();
        let mut buf = [0; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x00\xffreply");

        // The destination going away closes the client side.
        drop(dest);
        assert!(relay.await.unwrap().is_ok());
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn proxy_split_idle() {
        let start = Instant::now();
        let (_client, mut dest, relay) = proxy_duplex(Some(Duration::from_millis(100)));
        assert!(relay.await.unwrap().is_err());
        assert!(start.elapsed() >= Duration::from_millis(100));

        // The destination was closed.
        let mut buf = [0; 1];
        assert_eq!(dest.read(&mut buf).await.unwrap(), 0);
    }
}
