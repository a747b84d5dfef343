//! Profile parsing and PUSH_REPLY decoding benchmarks

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rovpn::options::{ConfigurationParser, PushReply};
use rovpn::ClientProfile;
use std::hint::black_box;
use std::str::FromStr;

const OVPN: &str = "client
dev tun
proto udp
remote vpn.example.com 1194
remote vpn2.example.com 443 tcp
resolv-retry infinite
nobind
cipher AES-256-GCM
auth SHA256
comp-lzo no
ping 10
ping-restart 60
reneg-sec 3600
<ca>
-----BEGIN CERTIFICATE-----
MIIBszCCAVmgAwIBAgIUeXampleCertificateBodyOnlyForParsing0wCgYIKoZI
-----END CERTIFICATE-----
</ca>
";

const PROFILE_TOML: &str = r#"
[profile]
ovpn_path = "client.ovpn"

[auth]
username = "testuser"
password = "testpass"

[session]
keepalive_interval = 15

[logging]
level = "info"
"#;

const SMALL_REPLY: &str = "PUSH_REPLY,topology subnet,route-gateway 10.8.0.1,ifconfig 10.8.0.2 255.255.255.0";

fn large_reply() -> String {
    let mut reply = String::from(
        "PUSH_REPLY,topology subnet,route-gateway 10.8.0.1,ifconfig 10.8.0.2 255.255.255.0,\
         redirect-gateway def1,dhcp-option DNS 1.1.1.1,dhcp-option DNS 8.8.8.8,\
         dhcp-option DOMAIN example.com,peer-id 7,cipher AES-256-GCM,ping 10,ping-restart 60",
    );
    for i in 0..64 {
        reply.push_str(&format!(",route 10.{i}.0.0 255.255.0.0"));
    }
    reply
}

fn profile_parsing_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("profile_parsing");

    group.bench_function("parse_ovpn", |b| {
        b.iter(|| {
            let result = ConfigurationParser::parse_str(black_box(OVPN), false).unwrap();
            black_box(result);
        });
    });

    group.bench_function("parse_ovpn_stripped", |b| {
        b.iter(|| {
            let result = ConfigurationParser::parse_str(black_box(OVPN), true).unwrap();
            black_box(result);
        });
    });

    group.bench_function("parse_client_profile", |b| {
        b.iter(|| {
            let profile = ClientProfile::from_str(black_box(PROFILE_TOML)).unwrap();
            black_box(profile);
        });
    });

    group.bench_function("validate_client_profile", |b| {
        let profile = ClientProfile::from_str(PROFILE_TOML).unwrap();
        b.iter(|| {
            let result = black_box(&profile).validate();
            let _ = black_box(result);
        });
    });

    group.finish();
}

fn push_reply_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("push_reply");

    let large = large_reply();
    let replies = vec![("small", SMALL_REPLY.to_string()), ("large", large)];

    for (size, reply) in replies {
        group.throughput(Throughput::Bytes(reply.len() as u64));
        group.bench_with_input(BenchmarkId::new("parse", size), &reply, |b, reply| {
            b.iter(|| {
                let parsed = PushReply::parse(black_box(reply)).unwrap();
                black_box(parsed);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, profile_parsing_benchmark, push_reply_benchmark);
criterion_main!(benches);
