use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Buffered reader accumulating what is read from its inner reader, so the
/// data can be parsed in place and later replayed (or handed over) as-is. It
/// never reads more than requested: what sits in the buffer is exactly what
/// was read from the inner reader and not yet consumed.
pub(crate) struct ReaderBuf<R> {
    /// Inner reader, implementing AsyncRead.
    inner: R,
    /// Inner buffer, holding all the data read so far.
    buffer: Vec<u8>,
}

impl<R: AsyncRead + Unpin> ReaderBuf<R> {
    /// Create a new ReaderBuf with an explicit inner buffer capacity.
    pub(crate) fn with_capacity(capacity: usize, inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Create a new ReaderBuf whose inner buffer already holds `buffer`,
    /// e.g. data read by another ReaderBuf.
    pub(crate) fn from_parts(inner: R, buffer: Vec<u8>) -> Self {
        Self { inner, buffer }
    }

    /// Unwraps the inner reader, alongside all the data read so far.
    pub(crate) fn into_parts(self) -> (R, Vec<u8>) {
        (self.inner, self.buffer)
    }

    /// Get a mutable reference to the inner reader.
    pub(crate) fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Returns a reference to the inner buffer.
    pub(crate) fn buf(&self) -> &[u8] {
        &self.buffer
    }

    /// Length of the inner buffer.
    pub(crate) fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Removes the first `len` bytes of the inner buffer, once they were
    /// handled.
    pub(crate) fn consume(&mut self, len: usize) {
        self.buffer.drain(..len);
    }

    /// Reads at most `len` bytes from the inner reader into the inner buffer,
    /// returns how many bytes were read. A single read is performed; 0 means
    /// the inner reader reached EOF.
    pub(crate) async fn fill(&mut self, len: usize) -> Result<usize> {
        let end = self.len();

        // Resize the internal buffer to accept the additional data.
        self.buffer.resize(end + len, 0);

        let read = match self.inner.read(&mut self.buffer[end..]).await {
            Ok(read) => read,
            Err(e) => {
                self.buffer.truncate(end);
                return Err(e.into());
            }
        };

        // Drop the part of the buffer we couldn't fill.
        self.buffer.truncate(end + read);
        Ok(read)
    }
}

#[cfg(test)]
impl<'a> ReaderBuf<&'a [u8]> {
    /// Creates a new ReaderBuf from a byte array, for testing purposes.
    pub(crate) fn from_bytes(bytes: &'a [u8]) -> Self {
        Self::with_capacity(0, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::ReaderBuf as B;

    #[tokio::test]
    async fn reader() {
        let data: Vec<u8> = (1..=30).collect();
        let mut rb = B::from_bytes(&data);

        // We haven't read anything yet.
        assert_eq!(rb.buf(), &[] as &[u8]);

        // Reading 3 bytes.
        assert_eq!(rb.fill(3).await.unwrap(), 3);
        assert_eq!(rb.buf(), &(1..=3).collect::<Vec<u8>>());

        // Reading 7 more bytes.
        assert_eq!(rb.fill(7).await.unwrap(), 7);
        assert_eq!(rb.buf(), &(1..=10).collect::<Vec<u8>>());

        // Reading 12 more bytes.
        assert_eq!(rb.fill(12).await.unwrap(), 12);
        assert_eq!(rb.buf(), &(1..=22).collect::<Vec<u8>>());

        // Trying to read more than the available data (8 bytes left).
        assert_eq!(rb.fill(10).await.unwrap(), 8);
        assert_eq!(rb.buf(), &(1..=30).collect::<Vec<u8>>());
        assert_eq!(rb.len(), 30);

        // No data left.
        assert_eq!(rb.fill(1).await.unwrap(), 0);
        assert_eq!(rb.len(), 30);

        // Consuming only drops what was handled.
        rb.consume(25);
        assert_eq!(rb.buf(), &(26..=30).collect::<Vec<u8>>());

        let (inner, buf) = rb.into_parts();
        assert!(inner.is_empty());
        assert_eq!(buf, (26..=30).collect::<Vec<u8>>());

        let mut rb = B::from_parts(&data[20..], vec![0, 0]);
        assert_eq!(rb.fill(4).await.unwrap(), 4);
        assert_eq!(rb.buf(), &[0, 0, 21, 22, 23, 24]);
    }
}
