// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! I/O helpers for the archive splitter.

The splitter reads one gzip member at a time off a shared buffered stream.
[RawCaptureReader] sits between the stream and the decompressor and copies
every *consumed* byte to a sink, so the raw compressed bytes of a member are
preserved verbatim while a parallel decompressed view is hashed.
*/

use {
    sha1::{Digest, Sha1},
    std::io::{BufRead, Read, Write},
};

/// Byte length of a SHA-1 digest.
pub const SHA1_LEN: usize = 20;

/// Compute the SHA-1 digest of a byte slice.
pub fn sha1_digest(data: &[u8]) -> Vec<u8> {
    Sha1::digest(data).to_vec()
}

/// A [BufRead] adapter that tees consumed bytes into a writer.
///
/// Only bytes actually consumed by the reader are captured. A decompressor
/// driven through this adapter therefore leaves any bytes beyond the end of
/// its gzip member both unconsumed upstream and uncaptured downstream.
pub struct RawCaptureReader<'a, R: BufRead, W: Write> {
    inner: &'a mut R,
    sink: &'a mut W,
    error: Option<std::io::Error>,
}

impl<'a, R: BufRead, W: Write> RawCaptureReader<'a, R, W> {
    pub fn new(inner: &'a mut R, sink: &'a mut W) -> Self {
        Self {
            inner,
            sink,
            error: None,
        }
    }
}

impl<'a, R: BufRead, W: Write> Read for RawCaptureReader<'a, R, W> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let available = self.fill_buf()?;
        let count = std::cmp::min(available.len(), buf.len());
        buf[..count].copy_from_slice(&available[..count]);
        self.consume(count);

        if let Some(err) = self.error.take() {
            return Err(err);
        }

        Ok(count)
    }
}

impl<'a, R: BufRead, W: Write> BufRead for RawCaptureReader<'a, R, W> {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }

        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        // BufRead::consume cannot fail, so a sink error is surfaced on the
        // next read instead.
        if self.error.is_none() {
            if let Ok(buf) = self.inner.fill_buf() {
                if let Err(e) = self.sink.write_all(&buf[..amt]) {
                    self.error = Some(e);
                }
            }
        }

        self.inner.consume(amt);
    }
}

/// A [Write] adapter that computes a SHA-1 digest of everything written.
pub struct DigestingWriter<W: Write> {
    hasher: Sha1,
    dest: W,
}

impl<W: Write> DigestingWriter<W> {
    /// Construct a new instance from a destination writer.
    pub fn new(dest: W) -> Self {
        Self {
            hasher: Sha1::new(),
            dest,
        }
    }

    /// Finish the stream, returning the destination and the digest.
    pub fn finish(self) -> (W, Vec<u8>) {
        (self.dest, self.hasher.finalize().to_vec())
    }
}

impl<W: Write> Write for DigestingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let count = self.dest.write(buf)?;
        self.hasher.update(&buf[..count]);
        Ok(count)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.dest.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn capture_records_consumed_bytes() {
        let data = b"hello world".to_vec();
        let mut reader = std::io::BufReader::new(std::io::Cursor::new(data.clone()));
        let mut sink = Vec::new();

        {
            let mut capture = RawCaptureReader::new(&mut reader, &mut sink);
            let mut out = Vec::new();
            capture.read_to_end(&mut out).unwrap();
            assert_eq!(out, data);
        }

        assert_eq!(sink, data);
    }

    #[test]
    fn capture_leaves_unconsumed_bytes() {
        let mut reader = std::io::BufReader::new(std::io::Cursor::new(b"abcdef".to_vec()));
        let mut sink = Vec::new();

        {
            let mut capture = RawCaptureReader::new(&mut reader, &mut sink);
            let mut buf = [0u8; 3];
            capture.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"abc");
        }

        assert_eq!(sink, b"abc");

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"def");
    }

    #[test]
    fn digesting_writer() {
        let mut writer = DigestingWriter::new(Vec::new());
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();

        let (dest, digest) = writer.finish();
        assert_eq!(dest, b"hello world");
        assert_eq!(digest, sha1_digest(b"hello world"));
        assert_eq!(digest.len(), SHA1_LEN);
    }
}
