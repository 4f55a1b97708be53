use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::net::SocketAddrV4;

use tunsocks::packet::{build_tcp, build_udp, checksum, Ipv4Header, TcpFlags, TcpSegment};
use tunsocks::socks::udp::{decap, encap};

fn endpoints() -> (SocketAddrV4, SocketAddrV4) {
    (
        "1.1.1.1:443".parse().unwrap(),
        "10.0.0.2:50000".parse().unwrap(),
    )
}

fn bench_build_tcp(c: &mut Criterion) {
    let (src, dst) = endpoints();
    let payload = vec![0x5a; 1400];

    c.bench_function("build_tcp_mtu_payload", |b| {
        b.iter(|| {
            black_box(build_tcp(
                src,
                dst,
                7,
                TcpFlags::PSH | TcpFlags::ACK,
                0x1000_0000,
                0x2000_0000,
                &payload,
            ));
        });
    });

    c.bench_function("build_tcp_empty_ack", |b| {
        b.iter(|| {
            black_box(build_tcp(
                src,
                dst,
                7,
                TcpFlags::ACK,
                0x1000_0000,
                0x2000_0000,
                &[],
            ));
        });
    });
}

fn bench_build_udp(c: &mut Criterion) {
    let (src, dst) = endpoints();
    let payload = vec![0x5a; 512];

    c.bench_function("build_udp_dns_sized", |b| {
        b.iter(|| {
            black_box(build_udp(src, dst, 7, &payload));
        });
    });
}

fn bench_parse(c: &mut Criterion) {
    let (src, dst) = endpoints();
    let payload = vec![0x5a; 1400];
    let packet = build_tcp(
        src,
        dst,
        7,
        TcpFlags::PSH | TcpFlags::ACK,
        1,
        2,
        &payload,
    );

    c.bench_function("parse_ipv4_tcp", |b| {
        b.iter(|| {
            let ip = Ipv4Header::parse(black_box(&packet)).unwrap();
            let segment = TcpSegment::parse(ip.payload(&packet)).unwrap();
            black_box(segment.seq);
        });
    });

    c.bench_function("verify_packet_checksums", |b| {
        b.iter(|| {
            black_box(checksum::verify_packet(black_box(&packet)));
        });
    });
}

fn bench_wrapper(c: &mut Criterion) {
    let payload = vec![0x5a; 1400];
    let wrapped = encap("93.184.216.34:443".parse().unwrap(), &payload);

    c.bench_function("socks_udp_encap", |b| {
        b.iter(|| {
            black_box(encap("93.184.216.34:443".parse().unwrap(), &payload));
        });
    });

    c.bench_function("socks_udp_decap", |b| {
        b.iter(|| {
            black_box(decap(black_box(&wrapped)));
        });
    });
}

criterion_group!(
    benches,
    bench_build_tcp,
    bench_build_udp,
    bench_parse,
    bench_wrapper
);
criterion_main!(benches);
