#![no_main]
use libfuzzer_sys::fuzz_target;
use platls_pki::x509::hostname::matches_dns;

fuzz_target!(|data: &[u8]| {
    // pattern \0 hostname
    let Some(split) = data.iter().position(|&b| b == 0) else {
        return;
    };
    let pattern = String::from_utf8_lossy(&data[..split]);
    let hostname = String::from_utf8_lossy(&data[split + 1..]);
    let _ = matches_dns(&pattern, &hostname);
});
