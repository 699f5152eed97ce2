use std::{
    future::poll_fn,
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    pin::Pin,
    ptr,
    task::{Context, Poll, ready},
};

use anyhow::{Result, bail};
use tokio::{
    io::{AsyncWrite, Interest},
    net::TcpStream,
};

use crate::relay::Activity;

// Default Linux pipe capacity. This is the most data a direction can hold
// between the source and the destination sockets.
const PIPE_SIZE: usize = 64 * 1024;

/// Bidirectional copy between two TCP streams, in a zero-copy fashion: data
/// never reaches user space and goes through a pipe using splice(2). Returns
/// how many bytes were moved from `a` to `b` and from `b` to `a`, as soon as
/// one of the directions is done. Every data move is recorded in `activity`.
pub(crate) async fn copy_bidirectional(
    a: &mut TcpStream,
    b: &mut TcpStream,
    activity: &Activity,
) -> Result<(u64, u64)> {
    let mut ab = Direction::new()?;
    let mut ba = Direction::new()?;

    poll_fn(|ctx| {
        let ab_done = ab.poll(ctx, &*a, &mut *b, activity)?.is_ready();
        let ba_done = ba.poll(ctx, &*b, &mut *a, activity)?.is_ready();

        // Do not wait for both directions to be done.
        match ab_done || ba_done {
            true => Poll::Ready(Ok((ab.moved, ba.moved))),
            false => Poll::Pending,
        }
    })
    .await
}

/// State of a single direction copy.
enum State {
    /// Data is being moved from the source to the destination.
    Copying,
    /// The source reached EOF, the destination write side is being shut down.
    ShuttingDown,
    /// Nothing left to do.
    Done,
}

/// Zero-copy transfer from one socket to another.
struct Direction {
    pipe: Pipe,
    /// Bytes read from the source and not yet written to the destination.
    in_pipe: usize,
    /// Bytes written to the destination.
    moved: u64,
    state: State,
}

impl Direction {
    fn new() -> Result<Self> {
        Ok(Self {
            pipe: Pipe::new()?,
            in_pipe: 0,
            moved: 0,
            state: State::Copying,
        })
    }

    /// Drives the transfer; completes once the source is done and the
    /// destination was shut down.
    fn poll(
        &mut self,
        ctx: &mut Context<'_>,
        src: &TcpStream,
        dst: &mut TcpStream,
        activity: &Activity,
    ) -> Poll<Result<()>> {
        loop {
            match self.state {
                State::Copying => {
                    ready!(self.poll_copy(ctx, src, dst, activity))?;
                    self.state = State::ShuttingDown;
                }
                State::ShuttingDown => {
                    if let Err(e) = ready!(Pin::new(&mut *dst).poll_shutdown(ctx)) {
                        // Ignore error if the socket is already closed.
                        if e.kind() != io::ErrorKind::NotConnected {
                            return Poll::Ready(Err(e.into()));
                        }
                    }
                    self.state = State::Done;
                }
                State::Done => return Poll::Ready(Ok(())),
            }
        }
    }

    fn poll_copy(
        &mut self,
        ctx: &mut Context<'_>,
        src: &TcpStream,
        dst: &TcpStream,
        activity: &Activity,
    ) -> Poll<Result<()>> {
        loop {
            // Fill the pipe, only once it was fully drained.
            if self.in_pipe == 0 {
                ready!(src.poll_read_ready(ctx))?;

                match src.try_io(Interest::READABLE, || {
                    splice(src.as_raw_fd(), self.pipe.write.as_raw_fd(), PIPE_SIZE)
                }) {
                    Ok(0) => return Poll::Ready(Ok(())),
                    Ok(n) => {
                        self.in_pipe = n;
                        activity.touch();
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) if is_disconnect(&e) => return Poll::Ready(Ok(())),
                    Err(e) => return Poll::Ready(Err(e.into())),
                }
            }

            // Drain the pipe. We won't read from the source until the
            // destination accepted all of it.
            while self.in_pipe > 0 {
                ready!(dst.poll_write_ready(ctx))?;

                match dst.try_io(Interest::WRITABLE, || {
                    splice(self.pipe.read.as_raw_fd(), dst.as_raw_fd(), self.in_pipe)
                }) {
                    Ok(n) => {
                        self.in_pipe -= n;
                        self.moved += n as u64;
                        activity.touch();
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) if is_disconnect(&e) => return Poll::Ready(Ok(())),
                    Err(e) => return Poll::Ready(Err(e.into())),
                }
            }
        }
    }
}

/// Peer went away, this is a normal end of the copy.
fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

/// Moves up to `size` bytes from `src` to `dst`, one of them being a pipe.
fn splice(src: RawFd, dst: RawFd, size: usize) -> io::Result<usize> {
    loop {
        // SAFETY: both fds are valid for the duration of the call, offsets are
        // not used.
        let ret = unsafe {
            libc::splice(
                src,
                ptr::null_mut::<libc::loff_t>(),
                dst,
                ptr::null_mut::<libc::loff_t>(),
                size,
                libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK,
            )
        };

        // EAGAIN is reported as io::ErrorKind::WouldBlock, which is what tokio
        // try_io helpers expect to clear the readiness of the socket.
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        return Ok(ret as usize);
    }
}

/// Non-blocking Linux pipe, see pipe(2).
struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl Pipe {
    fn new() -> Result<Self> {
        let mut fds: [libc::c_int; 2] = [-1; 2];

        // SAFETY: fds is a valid array of two ints.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } < 0 {
            bail!("Could not create pipe: {}", io::Error::last_os_error());
        }

        // SAFETY: both fds were just returned by pipe2 and are owned by us.
        Ok(unsafe {
            Self {
                read: OwnedFd::from_raw_fd(fds[0]),
                write: OwnedFd::from_raw_fd(fds[1]),
            }
        })
    }
}
