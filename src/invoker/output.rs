//! Captured process output
//!
//! [`OutputBuffer`] is the append-only log a running process writes into.
//! Only the invoker's collector task appends; any number of readers take
//! snapshots concurrently. Appends are whole UTF-8 chunks, so every snapshot
//! is a prefix of the final output and never ends in half a code point.

use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Default)]
struct Inner {
    text: String,
    sealed: bool,
}

/// Growable, thread-safe text buffer holding a process's combined output
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    inner: Arc<RwLock<Inner>>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything captured so far
    pub fn snapshot(&self) -> String {
        self.read(|inner| inner.text.clone())
    }

    /// Output captured after `offset` bytes
    ///
    /// Pair with [`len`](Self::len) to look only at output produced after a
    /// known point, e.g. after editing a source file in watch mode.
    pub fn since(&self, offset: usize) -> String {
        self.read(|inner| inner.text.get(offset..).unwrap_or_default().to_string())
    }

    /// Whether the captured output contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.read(|inner| inner.text.contains(needle))
    }

    /// Number of bytes captured so far
    pub fn len(&self) -> usize {
        self.read(|inner| inner.text.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The last `n` lines, for failure diagnostics
    pub fn tail(&self, n: usize) -> String {
        self.read(|inner| {
            let lines: Vec<&str> = inner.text.lines().collect();
            let start = lines.len().saturating_sub(n);
            lines.get(start..).unwrap_or_default().join("\n")
        })
    }

    /// Whether the buffer stopped accepting output
    pub fn is_sealed(&self) -> bool {
        self.read(|inner| inner.sealed)
    }

    /// Append a chunk; returns false once the buffer is sealed
    pub(crate) fn append(&self, chunk: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.sealed {
            return false;
        }
        inner.text.push_str(chunk);
        true
    }

    /// Stop accepting output
    pub(crate) fn seal(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .sealed = true;
    }

    fn read<R>(&self, f: impl FnOnce(&Inner) -> R) -> R {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&inner)
    }
}

/// Incremental UTF-8 decoder for one byte stream
///
/// Holds back an incomplete trailing sequence until the next read completes
/// it; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // incomplete sequence at the end, wait for more
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is left at end of stream
    pub(crate) fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read() {
        let buffer = OutputBuffer::new();
        assert!(buffer.is_empty());

        assert!(buffer.append("Starting watch\n"));
        assert!(buffer.append("ready\n"));

        assert_eq!(buffer.snapshot(), "Starting watch\nready\n");
        assert!(buffer.contains("ready"));
        assert_eq!(buffer.len(), 21);
        assert_eq!(buffer.since(15), "ready\n");
        assert_eq!(buffer.since(1000), "");
    }

    #[test]
    fn test_sealed_buffer_drops_appends() {
        let buffer = OutputBuffer::new();
        buffer.append("before\n");
        buffer.seal();

        assert!(!buffer.append("after\n"));
        assert_eq!(buffer.snapshot(), "before\n");
        assert!(buffer.is_sealed());
    }

    #[test]
    fn test_tail() {
        let buffer = OutputBuffer::new();
        buffer.append("one\ntwo\nthree\nfour\n");
        assert_eq!(buffer.tail(2), "three\nfour");
        assert_eq!(buffer.tail(10), "one\ntwo\nthree\nfour");
    }

    #[test]
    fn test_clones_share_storage() {
        let writer = OutputBuffer::new();
        let reader = writer.clone();
        writer.append("shared");
        assert_eq!(reader.snapshot(), "shared");
    }

    #[test]
    fn test_decoder_holds_split_code_point() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "héllo ✓".as_bytes();

        // split inside 'é' (2 bytes) and inside '✓' (3 bytes)
        let first = decoder.push(&bytes[..2]);
        let second = decoder.push(&bytes[2..8]);
        let third = decoder.push(&bytes[8..]);

        assert_eq!(first, "h");
        assert_eq!(second, "éllo ");
        assert_eq!(third, "✓");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.push(b"ok\xffok"), "ok\u{FFFD}ok");
    }

    #[test]
    fn test_decoder_finish_flushes_truncated_sequence() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.push(&[b'a', 0xE2, 0x9C]), "a");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn test_concurrent_readers_see_prefixes() {
        let buffer = OutputBuffer::new();
        let expected: String = (0..500).map(|i| format!("línea {i} ✓\n")).collect();

        let reader = buffer.clone();
        let expected_clone = expected.clone();
        let handle = std::thread::spawn(move || {
            for _ in 0..500 {
                let seen = reader.snapshot();
                assert!(expected_clone.starts_with(&seen), "snapshot is not a prefix");
            }
        });

        for i in 0..500 {
            buffer.append(&format!("línea {i} ✓\n"));
        }
        handle.join().unwrap();
        assert_eq!(buffer.snapshot(), expected);
    }
}
