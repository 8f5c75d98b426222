//! Application data framing over an established context.
//!
//! Outbound plaintext is cut into chunks of at most `max_message` bytes and
//! sealed one provider message at a time. Inbound records are opened from
//! the [`RecordAssembler`] and their plaintext queued for the reader.

use platls_types::TlsError;
use tracing::{debug, trace};

use crate::provider::{
    BufferType, ContextHandle, PlatformSecurityContext, ProviderStatus, SecureBuffer, StreamSizes,
};
use crate::record::{Consumption, RecordAssembler};
use crate::transport::{send_all, Transport};

/// Result of one [`EncryptedStreamCodec::decode`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// One record was opened and this many plaintext bytes were queued.
    Plaintext(usize),
    /// No complete record is buffered.
    NeedMoreData,
    /// The peer started a new handshake; its record stays buffered.
    Renegotiate,
    /// The peer closed the context.
    PeerClosed,
    /// Any other provider status.
    Failed(ProviderStatus),
}

/// Plaintext queues and record sizes of an established context.
#[derive(Debug, Default)]
pub struct EncryptedStreamCodec {
    sizes: Option<StreamSizes>,
    outbound: Vec<u8>,
    inbound: Vec<u8>,
}

impl EncryptedStreamCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sizes(&mut self, sizes: StreamSizes) {
        self.sizes = Some(sizes);
    }

    pub fn sizes(&self) -> Option<StreamSizes> {
        self.sizes
    }

    /// Queue plaintext for the next [`encode`](Self::encode).
    pub fn queue_write(&mut self, data: &[u8]) {
        self.outbound.extend_from_slice(data);
    }

    pub fn pending_write(&self) -> usize {
        self.outbound.len()
    }

    /// Decrypted bytes waiting for the reader.
    pub fn readable(&self) -> usize {
        self.inbound.len()
    }

    /// Take up to `max` decrypted bytes.
    pub fn take_readable(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.inbound.len());
        self.inbound.drain(..n).collect()
    }

    /// Forget the context's sizes and unsent plaintext. Decrypted bytes stay readable.
    pub fn reset(&mut self) {
        self.sizes = None;
        self.outbound.clear();
    }

    /// Seal and send all queued plaintext; returns the plaintext bytes sent.
    ///
    /// A chunk leaves the queue only after it was both encrypted and written,
    /// so a failure keeps it for a later attempt.
    pub fn encode<P, T>(
        &mut self,
        provider: &mut P,
        context: &ContextHandle,
        transport: &mut T,
    ) -> Result<usize, TlsError>
    where
        P: PlatformSecurityContext + ?Sized,
        T: Transport + ?Sized,
    {
        let Some(sizes) = self.sizes else {
            return Err(TlsError::InvalidState(
                "stream sizes are unknown before the handshake completes".into(),
            ));
        };
        let max_message = sizes.max_message.max(1);

        let mut sent = 0;
        while !self.outbound.is_empty() {
            let n = self.outbound.len().min(max_message);
            let mut message = [
                SecureBuffer::new(BufferType::StreamHeader, vec![0; sizes.header]),
                SecureBuffer::new(BufferType::Data, self.outbound[..n].to_vec()),
                SecureBuffer::new(BufferType::StreamTrailer, vec![0; sizes.trailer]),
            ];
            let status = provider.encrypt(context, &mut message);
            if !status.is_ok() {
                debug!(%status, chunk = n, "encrypt failed");
                return Err(TlsError::ResourceError(format!("encrypt failed: {status}")));
            }

            let wire: Vec<u8> = message
                .iter()
                .flat_map(|b| b.data.iter().copied())
                .collect();
            send_all(transport, &wire)?;
            self.outbound.drain(..n);
            sent += n;
            trace!(chunk = n, wire = wire.len(), "record sent");
        }
        Ok(sent)
    }

    /// Open at most one record from `assembler`.
    pub fn decode<P>(
        &mut self,
        provider: &mut P,
        context: &ContextHandle,
        assembler: &mut RecordAssembler,
    ) -> DecodeOutcome
    where
        P: PlatformSecurityContext + ?Sized,
    {
        let inbound = &mut self.inbound;
        let outcome = assembler.consume_for_step(|input| {
            let out = provider.decrypt(context, input);
            let extra = out.extra_len();
            let consumption = match &out.status {
                ProviderStatus::IncompleteMessage { missing } => Consumption::Incomplete {
                    missing: *missing,
                },
                _ if extra > 0 => Consumption::Extra(extra),
                _ => Consumption::All,
            };
            let outcome = match &out.status {
                ProviderStatus::Ok => {
                    let before = inbound.len();
                    for chunk in out.plaintext() {
                        inbound.extend_from_slice(chunk);
                    }
                    DecodeOutcome::Plaintext(inbound.len() - before)
                }
                ProviderStatus::IncompleteMessage { .. } => DecodeOutcome::NeedMoreData,
                ProviderStatus::Renegotiate => DecodeOutcome::Renegotiate,
                ProviderStatus::ContextExpired => DecodeOutcome::PeerClosed,
                other => DecodeOutcome::Failed(other.clone()),
            };
            (consumption, outcome)
        });
        outcome.unwrap_or(DecodeOutcome::NeedMoreData)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::loopback::test_support::{establish, established_pair};
    use crate::provider::loopback::{hello_request_record, LoopbackProvider};
    use crate::transport::MemoryTransport;
    use proptest::prelude::*;

    const SIZES: StreamSizes = StreamSizes {
        header: 5,
        trailer: 8,
        max_message: 16 * 1024,
    };

    fn codec_with(max_message: usize) -> EncryptedStreamCodec {
        let mut codec = EncryptedStreamCodec::new();
        codec.set_sizes(StreamSizes {
            max_message,
            ..SIZES
        });
        codec
    }

    /// Decode everything in `wire`, returning the plaintext.
    fn open_all(provider: &mut LoopbackProvider, ctx: &ContextHandle, wire: &[u8]) -> Vec<u8> {
        let mut codec = codec_with(SIZES.max_message);
        let mut assembler = RecordAssembler::new();
        assembler.append(wire).unwrap();
        while let DecodeOutcome::Plaintext(_) = codec.decode(provider, ctx, &mut assembler) {}
        assert!(assembler.is_empty());
        codec.take_readable(usize::MAX)
    }

    #[test]
    fn test_encode_before_sizes_is_invalid_state() {
        let (mut client, cctx, _, _) = established_pair();
        let mut codec = EncryptedStreamCodec::new();
        codec.queue_write(b"early");
        let mut transport = MemoryTransport::new();
        let err = codec.encode(&mut client, &cctx, &mut transport).unwrap_err();
        assert!(matches!(err, TlsError::InvalidState(_)));
        assert_eq!(codec.pending_write(), 5);
    }

    #[test]
    fn test_encode_writes_actual_record_lengths() {
        let (mut client, cctx, mut server, sctx) = established_pair();
        let mut codec = codec_with(SIZES.max_message);
        let mut transport = MemoryTransport::new();
        codec.queue_write(b"hello");
        assert_eq!(codec.encode(&mut client, &cctx, &mut transport).unwrap(), 5);
        // Header 5 + payload 5 + 4-byte checksum, not the 8-byte trailer capacity.
        assert_eq!(transport.outbound().len(), 14);
        assert_eq!(open_all(&mut server, &sctx, transport.outbound()), b"hello");
    }

    #[test]
    fn test_encode_nothing_queued_writes_nothing() {
        let (mut client, cctx, _, _) = established_pair();
        let mut codec = codec_with(16);
        let mut transport = MemoryTransport::new();
        assert_eq!(codec.encode(&mut client, &cctx, &mut transport).unwrap(), 0);
        assert!(transport.outbound().is_empty());
        assert_eq!(client.encrypt_calls(), 0);
    }

    #[test]
    fn test_failed_encrypt_keeps_unsent_chunks() {
        let (mut client, cctx, mut server, sctx) =
            establish(LoopbackProvider::new().fail_encrypt_at(2), LoopbackProvider::new());
        let mut codec = codec_with(4);
        let mut transport = MemoryTransport::new();
        codec.queue_write(b"aaaabbbbcc");

        let err = codec.encode(&mut client, &cctx, &mut transport).unwrap_err();
        assert!(matches!(err, TlsError::ResourceError(_)));
        // First chunk committed, second and third still queued.
        assert_eq!(codec.pending_write(), 6);
        assert_eq!(open_all(&mut server, &sctx, &transport.take_outbound()), b"aaaa");

        assert_eq!(codec.encode(&mut client, &cctx, &mut transport).unwrap(), 6);
        assert_eq!(open_all(&mut server, &sctx, &transport.take_outbound()), b"bbbbcc");
    }

    #[test]
    fn test_short_write_keeps_chunk() {
        let (mut client, cctx, _, _) = established_pair();
        let mut codec = codec_with(SIZES.max_message);
        let mut transport = MemoryTransport::new().with_write_limit(3);
        codec.queue_write(b"payload");
        let err = codec.encode(&mut client, &cctx, &mut transport).unwrap_err();
        assert!(matches!(err, TlsError::IoError(_)));
        assert_eq!(codec.pending_write(), 7);
    }

    #[test]
    fn test_decode_partial_record_waits() {
        let (mut client, cctx, mut server, sctx) = established_pair();
        let mut sender = codec_with(SIZES.max_message);
        let mut transport = MemoryTransport::new();
        sender.queue_write(b"split me");
        sender.encode(&mut client, &cctx, &mut transport).unwrap();
        let wire = transport.take_outbound();

        let mut codec = codec_with(SIZES.max_message);
        let mut assembler = RecordAssembler::new();
        assembler.append(&wire[..6]).unwrap();
        assert_eq!(
            codec.decode(&mut server, &sctx, &mut assembler),
            DecodeOutcome::NeedMoreData
        );
        assert_eq!(assembler.missing(), wire.len() - 6);
        assembler.append(&wire[6..]).unwrap();
        assert_eq!(
            codec.decode(&mut server, &sctx, &mut assembler),
            DecodeOutcome::Plaintext(8)
        );
        assert_eq!(codec.take_readable(3), b"spl");
        assert_eq!(codec.take_readable(100), b"it me");
    }

    #[test]
    fn test_decode_tampered_record_fails() {
        let (mut client, cctx, mut server, sctx) = established_pair();
        let mut sender = codec_with(SIZES.max_message);
        let mut transport = MemoryTransport::new();
        sender.queue_write(b"data");
        sender.encode(&mut client, &cctx, &mut transport).unwrap();
        let mut wire = transport.take_outbound();
        let last = wire.len() - 1;
        wire[last] ^= 1;

        let mut codec = codec_with(SIZES.max_message);
        let mut assembler = RecordAssembler::new();
        assembler.append(&wire).unwrap();
        assert_eq!(
            codec.decode(&mut server, &sctx, &mut assembler),
            DecodeOutcome::Failed(ProviderStatus::MessageAltered)
        );
        assert_eq!(codec.readable(), 0);
    }

    #[test]
    fn test_decode_handshake_record_keeps_it_buffered() {
        let (mut client, cctx, _, _) = established_pair();
        let mut codec = codec_with(SIZES.max_message);
        let mut assembler = RecordAssembler::new();
        let record = hello_request_record();
        assembler.append(&record).unwrap();
        assert_eq!(
            codec.decode(&mut client, &cctx, &mut assembler),
            DecodeOutcome::Renegotiate
        );
        assert_eq!(assembler.pending(), &record[..]);
    }

    #[test]
    fn test_reset_keeps_readable_bytes() {
        let mut codec = codec_with(8);
        codec.inbound.extend_from_slice(b"left");
        codec.queue_write(b"unsent");
        codec.reset();
        assert_eq!(codec.sizes(), None);
        assert_eq!(codec.pending_write(), 0);
        assert_eq!(codec.take_readable(10), b"left");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_chunking_calls_encrypt_ceil_len_over_max(
            data in proptest::collection::vec(any::<u8>(), 0..3000),
            max_message in 1usize..700,
        ) {
            let (mut client, cctx, mut server, sctx) = established_pair();
            let mut codec = codec_with(max_message);
            let mut transport = MemoryTransport::new();
            codec.queue_write(&data);
            prop_assert_eq!(codec.encode(&mut client, &cctx, &mut transport).unwrap(), data.len());
            prop_assert_eq!(client.encrypt_calls(), data.len().div_ceil(max_message));
            prop_assert_eq!(open_all(&mut server, &sctx, transport.outbound()), data);
        }
    }
}
