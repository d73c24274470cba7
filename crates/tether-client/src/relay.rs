//! Byte-to-text relay between a transport and the terminal sink.
//!
//! Pumps raw bytes from the transport through a charset decoder,
//! re-encodes the text as canonical UTF-8 and forwards complete runs to
//! the sink. Malformed or unmappable input becomes U+FFFD, never an
//! error. The charset can be swapped while the pump runs; the change
//! takes effect at the next read boundary.

use encoding_rs::{CoderResult, Encoding, UTF_8};
use std::sync::{Arc, Mutex};
use tether_core::{Sink, TetherResult, Transport};
use tracing::{debug, trace, warn};

/// The charset shared between the relay's decode side and the session's
/// outbound encode side. Swaps are picked up at the next use.
pub struct Charset {
    current: Mutex<&'static Encoding>,
}

impl Charset {
    pub fn new(label: &str) -> Self {
        let encoding = Encoding::for_label(label.as_bytes()).unwrap_or_else(|| {
            warn!(label, "unknown charset label, falling back to UTF-8");
            UTF_8
        });
        Self {
            current: Mutex::new(encoding),
        }
    }

    /// Switch to a new charset. Returns false (and keeps the old one)
    /// when the label is unknown.
    pub fn set_label(&self, label: &str) -> bool {
        match Encoding::for_label(label.as_bytes()) {
            Some(encoding) => {
                debug!(charset = encoding.name(), "charset changed");
                *self.current.lock().expect("charset poisoned") = encoding;
                true
            }
            None => {
                warn!(label, "ignoring unknown charset label");
                false
            }
        }
    }

    pub fn get(&self) -> &'static Encoding {
        *self.current.lock().expect("charset poisoned")
    }

    /// Encode outbound text into the transport's byte form. Unmappable
    /// characters are replaced, never dropped.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        let (bytes, _, _) = self.get().encode(text);
        bytes.into_owned()
    }
}

/// Pumps transport bytes through the decoder into the sink.
pub struct Relay {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn Sink>,
    charset: Arc<Charset>,
    buffer_size: usize,
}

impl Relay {
    pub fn new(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn Sink>,
        charset: Arc<Charset>,
        buffer_size: usize,
    ) -> Self {
        Self {
            transport,
            sink,
            charset,
            buffer_size,
        }
    }

    /// Run the pump loop until EOF or an I/O failure.
    ///
    /// Returns `Ok(())` for a clean end-of-stream and `Err` for an I/O
    /// failure; either way the caller owns the disconnect that follows.
    pub async fn pump(self) -> TetherResult<()> {
        let mut encoding = self.charset.get();
        let mut decoder = encoding.new_decoder();
        let mut bytes = vec![0u8; self.buffer_size];
        let mut out = String::with_capacity(self.buffer_size);

        loop {
            // Pick up a charset swap at the read boundary. A decoder
            // mid-sequence is simply discarded with its partial state.
            let wanted = self.charset.get();
            if wanted != encoding {
                encoding = wanted;
                decoder = encoding.new_decoder();
            }

            let n = self.transport.read(&mut bytes).await?;

            if n == 0 {
                // Flush whatever tail state the decoder still holds.
                loop {
                    let (result, _, _) = decoder.decode_to_string(&[], &mut out, true);
                    self.flush(&mut out);
                    if result == CoderResult::InputEmpty {
                        break;
                    }
                }
                debug!("relay reached end of stream");
                return Ok(());
            }

            trace!(bytes = n, "relay read");
            let mut pos = 0;
            while pos < n {
                let (result, read, _) = decoder.decode_to_string(&bytes[pos..n], &mut out, false);
                pos += read;
                match result {
                    CoderResult::InputEmpty => break,
                    // Decode buffer filled: hand the run to the sink,
                    // compact, and retry. Nothing is dropped.
                    CoderResult::OutputFull => self.flush(&mut out),
                }
            }
            self.flush(&mut out);
        }
    }

    fn flush(&self, out: &mut String) {
        if !out.is_empty() {
            self.sink.receive(out.as_bytes());
            out.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{CollectSink, MockTransport};

    fn relay_over(chunks: Vec<Vec<u8>>, label: &str) -> (Relay, Arc<CollectSink>) {
        let transport: Arc<dyn Transport> = Arc::new(MockTransport::with_incoming(chunks));
        let sink = Arc::new(CollectSink::default());
        let relay = Relay::new(transport, sink.clone(), Arc::new(Charset::new(label)), 4096);
        (relay, sink)
    }

    #[tokio::test]
    async fn utf8_passes_through() {
        let (relay, sink) = relay_over(vec![b"hello \xc3\xa9".to_vec()], "utf-8");
        relay.pump().await.unwrap();
        assert_eq!(sink.text(), "hello é");
    }

    #[tokio::test]
    async fn latin1_is_transcoded_to_utf8() {
        // 0xE9 is 'é' in ISO-8859-1.
        let (relay, sink) = relay_over(vec![vec![0x68, 0x69, 0xE9]], "latin1");
        relay.pump().await.unwrap();
        assert_eq!(sink.text(), "hié");
    }

    #[tokio::test]
    async fn malformed_input_becomes_replacement_char() {
        let (relay, sink) = relay_over(vec![vec![0xFF, b'o', b'k']], "utf-8");
        relay.pump().await.unwrap();
        assert_eq!(sink.text(), "\u{FFFD}ok");
    }

    #[tokio::test]
    async fn multibyte_sequence_split_across_reads() {
        // 'é' split across two reads must still decode as one char.
        let (relay, sink) = relay_over(vec![vec![0xC3], vec![0xA9]], "utf-8");
        relay.pump().await.unwrap();
        assert_eq!(sink.text(), "é");
    }

    #[tokio::test]
    async fn truncated_tail_flushed_as_replacement_on_eof() {
        // A lone UTF-8 lead byte at EOF flushes to U+FFFD.
        let (relay, sink) = relay_over(vec![vec![b'a', 0xC3]], "utf-8");
        relay.pump().await.unwrap();
        assert_eq!(sink.text(), "a\u{FFFD}");
    }

    #[tokio::test]
    async fn charset_swap_applies_on_next_read() {
        let transport: Arc<dyn Transport> =
            Arc::new(MockTransport::with_incoming(vec![vec![0xE9], vec![0xE9]]));
        let sink = Arc::new(CollectSink::default());
        let charset = Arc::new(Charset::new("latin1"));
        let relay = Relay::new(transport, sink.clone(), charset.clone(), 4096);

        // Swap before the pump starts: the very first read already uses
        // the new charset.
        assert!(charset.set_label("windows-1251"));
        relay.pump().await.unwrap();
        // 0xE9 is 'й' in windows-1251.
        assert_eq!(sink.text(), "йй");
    }

    #[tokio::test]
    async fn io_error_terminates_with_error() {
        let transport: Arc<dyn Transport> = Arc::new(MockTransport::failing_read());
        let sink = Arc::new(CollectSink::default());
        let relay = Relay::new(transport, sink, Arc::new(Charset::new("utf-8")), 4096);
        assert!(relay.pump().await.is_err());
    }

    #[test]
    fn unknown_label_keeps_previous() {
        let charset = Charset::new("utf-8");
        assert!(!charset.set_label("no-such-charset"));
        assert_eq!(charset.get(), UTF_8);
    }

    #[test]
    fn outbound_encode_round_trip() {
        let charset = Charset::new("latin1");
        assert_eq!(charset.encode("hié"), vec![0x68, 0x69, 0xE9]);
    }
}
