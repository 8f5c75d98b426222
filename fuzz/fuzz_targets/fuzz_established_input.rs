#![no_main]
use libfuzzer_sys::fuzz_target;
use platls_pki::x509::CertificateBuilder;
use platls_tls::config::{PeerVerifyMode, PrivateKey};
use platls_tls::provider::loopback::LoopbackProvider;
use platls_tls::transport::MemoryTransport;
use platls_tls::{TlsConfig, TlsSession};

type Session = TlsSession<LoopbackProvider, MemoryTransport>;

fn relay(from: &mut Session, to: &mut Session) -> bool {
    let bytes = from.transport_mut().take_outbound();
    if bytes.is_empty() {
        return false;
    }
    to.transport_mut().push_inbound(&bytes);
    to.transmit().is_ok()
}

// Arbitrary bytes arriving after the handshake on an established client.
fuzz_target!(|data: &[u8]| {
    let cert = CertificateBuilder::new("fuzz.example").build();
    let server_config = TlsConfig::builder()
        .certificate_chain(vec![cert.clone()])
        .private_key(PrivateKey::new(vec![1; 16]))
        .verify_mode(PeerVerifyMode::None)
        .build();
    let client_config = TlsConfig::builder()
        .verify_mode(PeerVerifyMode::None)
        .build();
    let mut server = Session::server(server_config, LoopbackProvider::new(), MemoryTransport::new());
    let mut client = Session::client(
        client_config,
        LoopbackProvider::new().with_peer_certificates(vec![cert]),
        MemoryTransport::new(),
    );
    if server.start_server_handshake().is_err()
        || client.start_client_handshake("fuzz.example").is_err()
    {
        return;
    }
    while relay(&mut client, &mut server) | relay(&mut server, &mut client) {}
    if !client.is_encrypted() {
        return;
    }

    client.transport_mut().push_inbound(data);
    for _ in 0..4 {
        if client.transmit().is_err() || !client.needs_follow_up() {
            break;
        }
    }
    let _ = client.read(usize::MAX);
});
