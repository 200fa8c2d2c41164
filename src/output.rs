//! Prefixed output.
//!
//! Everything temaki copies to the terminal on behalf of someone else (the
//! test command, the image build, a service's own logs) goes through a
//! [`PrefixWriter`] so its origin stays visible.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Prefix for the test command's output.
pub const CMD_PREFIX: &str = "cmd:";

/// Prefix for image build output.
pub const BUILD_PREFIX: &str = "build:";

/// Writes `prefix + " " + buf` for every chunk handed to it.
///
/// Callers hand it whole lines; a chunk is never split or merged.
pub struct PrefixWriter<W> {
    prefix: String,
    inner: W,
}

impl<W: AsyncWrite + Unpin> PrefixWriter<W> {
    pub fn new(prefix: impl Into<String>, inner: W) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    /// Prefix for a service's log lines.
    pub fn for_service(service: &str, inner: W) -> Self {
        Self::new(format!("[{}]", service), inner)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Writes one prefixed chunk and returns the number of bytes written,
    /// prefix and separator included.
    pub async fn write_prefixed(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut line = Vec::with_capacity(self.prefix.len() + 1 + buf.len());
        line.extend_from_slice(self.prefix.as_bytes());
        line.push(b' ');
        line.extend_from_slice(buf);

        self.inner.write_all(&line).await?;
        self.inner.flush().await?;
        Ok(line.len())
    }

    /// Copies `reader` line by line until EOF. A final line without a
    /// newline gets one.
    pub async fn copy_lines<R>(&mut self, mut reader: R) -> std::io::Result<u64>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut total = 0u64;
        let mut line = Vec::new();

        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                break;
            }
            if line.last() != Some(&b'\n') {
                line.push(b'\n');
            }
            total += self.write_prefixed(&line).await? as u64;
        }

        Ok(total)
    }

    /// Splits a chunk into lines and writes each with the prefix.
    ///
    /// A chunk from a log stream usually holds one line but may hold several.
    pub async fn write_lines(&mut self, chunk: &[u8]) -> std::io::Result<usize> {
        let mut total = 0;
        for line in chunk.split_inclusive(|b| *b == b'\n') {
            if line.last() == Some(&b'\n') {
                total += self.write_prefixed(line).await?;
            } else {
                let mut owned = line.to_vec();
                owned.push(b'\n');
                total += self.write_prefixed(&owned).await?;
            }
        }
        Ok(total)
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_prefixed() {
        let mock = tokio_test::io::Builder::new()
            .write(b"prefix some-message")
            .build();
        let mut writer = PrefixWriter::new("prefix", mock);

        let n = writer.write_prefixed(b"some-message").await.unwrap();
        assert_eq!(n, 19);
    }

    #[tokio::test]
    async fn test_copy_lines() {
        let input: &[u8] = b"collected 3 items\n\ntests pass";
        let mut writer = PrefixWriter::new(CMD_PREFIX, Vec::new());

        writer.copy_lines(input).await.unwrap();

        let out = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(out, "cmd: collected 3 items\ncmd: \ncmd: tests pass\n");
    }

    #[tokio::test]
    async fn test_write_lines_splits_chunks() {
        let mut writer = PrefixWriter::for_service("REDIS_URL", Vec::new());
        assert_eq!(writer.prefix(), "[REDIS_URL]");

        writer
            .write_lines(b"Ready to accept connections\nDB loaded")
            .await
            .unwrap();

        let out = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(
            out,
            "[REDIS_URL] Ready to accept connections\n[REDIS_URL] DB loaded\n"
        );
    }
}
