use std::cmp;

use anyhow::{Result, bail};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::{
    http::{Body, Error},
    reader::ReaderBuf,
    relay::Activity,
};

/// Chunk size and trailer lines longer than this are refused.
const MAX_LINE: usize = 4096;
/// Maximum amount of body data read at once.
const BUF_SIZE: usize = 16 * 1024;

/// Copies a message body from `rb` to `w`, byte for byte (chunked framing
/// included), stopping right at its end: whatever follows the body stays in
/// `rb`. Returns how many bytes were copied.
pub(crate) async fn copy<R, W>(
    rb: &mut ReaderBuf<R>,
    w: &mut W,
    body: Body,
    activity: &Activity,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = match body {
        Body::Empty => 0,
        Body::Length(len) => copy_exact(rb, w, len, activity).await?,
        Body::Chunked => copy_chunked(rb, w, activity).await?,
        Body::UntilClose => copy_to_end(rb, w, activity).await?,
    };

    w.flush().await?;
    Ok(copied)
}

/// Writes the first `len` bytes of the buffer and drops them from it.
async fn forward<R, W>(
    rb: &mut ReaderBuf<R>,
    w: &mut W,
    len: usize,
    activity: &Activity,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    w.write_all(&rb.buf()[..len]).await?;
    rb.consume(len);
    activity.touch();
    Ok(())
}

async fn copy_exact<R, W>(
    rb: &mut ReaderBuf<R>,
    w: &mut W,
    len: u64,
    activity: &Activity,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut left = len;

    while left > 0 {
        if rb.len() == 0 && rb.fill(cmp::min(left, BUF_SIZE as u64) as usize).await? == 0 {
            bail!(Error::BodyTruncated);
        }

        let n = cmp::min(left, rb.len() as u64) as usize;
        forward(rb, w, n, activity).await?;
        left -= n as u64;
    }

    Ok(len)
}

async fn copy_to_end<R, W>(rb: &mut ReaderBuf<R>, w: &mut W, activity: &Activity) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0;

    loop {
        if rb.len() == 0 && rb.fill(BUF_SIZE).await? == 0 {
            return Ok(copied);
        }

        let n = rb.len();
        forward(rb, w, n, activity).await?;
        copied += n as u64;
    }
}

async fn copy_chunked<R, W>(rb: &mut ReaderBuf<R>, w: &mut W, activity: &Activity) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0;

    loop {
        let (line, size) = chunk_size(rb).await?;
        forward(rb, w, line, activity).await?;
        copied += line as u64;

        if size == 0 {
            break;
        }

        // Chunk data and its CRLF.
        let Some(size) = size.checked_add(2) else {
            bail!(Error::ChunkSize);
        };
        copied += copy_exact(rb, w, size, activity).await?;
    }

    // Trailer section, up to and including the empty line.
    loop {
        let len = line(rb).await?;
        let last = matches!(&rb.buf()[..len], b"\r\n" | b"\n");
        forward(rb, w, len, activity).await?;
        copied += len as u64;

        if last {
            return Ok(copied);
        }
    }
}

/// Reads a chunk size line, returns its length and the chunk size.
async fn chunk_size<R>(rb: &mut ReaderBuf<R>) -> Result<(usize, u64)>
where
    R: AsyncRead + Unpin,
{
    loop {
        match httparse::parse_chunk_size(rb.buf()) {
            Ok(httparse::Status::Complete(parsed)) => return Ok(parsed),
            Ok(httparse::Status::Partial) => fill_line(rb).await?,
            Err(_) => bail!(Error::ChunkSize),
        }
    }
}

/// Reads a line, returns its length (line ending included).
async fn line<R>(rb: &mut ReaderBuf<R>) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(end) = rb.buf().iter().position(|b| *b == b'\n') {
            return Ok(end + 1);
        }
        fill_line(rb).await?;
    }
}

async fn fill_line<R>(rb: &mut ReaderBuf<R>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    if rb.len() >= MAX_LINE {
        bail!(Error::InvalidBody(format!(
            "line longer than {MAX_LINE} bytes"
        )));
    }
    if rb.fill(MAX_LINE - rb.len()).await? == 0 {
        bail!(Error::BodyTruncated);
    }
    Ok(())
}
