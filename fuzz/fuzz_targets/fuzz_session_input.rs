#![no_main]
use libfuzzer_sys::fuzz_target;
use platls_pki::x509::CertificateBuilder;
use platls_tls::config::PrivateKey;
use platls_tls::provider::loopback::LoopbackProvider;
use platls_tls::transport::MemoryTransport;
use platls_tls::{TlsConfig, TlsSession};

// Arbitrary bytes as a client's first flight, delivered in pieces whose
// size comes from the first byte.
fuzz_target!(|data: &[u8]| {
    let Some((&chunk, input)) = data.split_first() else {
        return;
    };
    let cert = CertificateBuilder::new("fuzz.example").build();
    let config = TlsConfig::builder()
        .certificate_chain(vec![cert])
        .private_key(PrivateKey::new(vec![1; 16]))
        .max_pending(64 * 1024)
        .build();
    let mut server = TlsSession::server(config, LoopbackProvider::new(), MemoryTransport::new());
    if server.start_server_handshake().is_err() {
        return;
    }
    for piece in input.chunks(usize::from(chunk).max(1)) {
        server.transport_mut().push_inbound(piece);
        if server.transmit().is_err() {
            break;
        }
    }
    let _ = server.read(usize::MAX);
});
