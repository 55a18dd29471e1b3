//! Routing-table hot path benchmarks

use std::net::SocketAddr;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;
use verikad::routing::{Contact, RoutingTable};
use verikad::NodeId;

fn bench_addr(i: u16) -> SocketAddr {
    format!("10.1.0.1:{}", 1024 + i).parse().unwrap()
}

fn populated_table(rng: &mut StdRng, contacts: usize) -> RoutingTable {
    let mut table = RoutingTable::new(NodeId::random(rng), 20, 3, 1, 0);
    for i in 0..contacts {
        table.insert(
            Contact::new(NodeId::random(rng), bench_addr(i as u16), 1, 0),
            0,
        );
    }
    table
}

fn bench_insert(c: &mut Criterion) {
    c.bench_function("routing_table_insert_1k", |b| {
        let mut rng = StdRng::seed_from_u64(7);
        let candidates: Vec<Contact> = (0..1000)
            .map(|i| Contact::new(NodeId::random(&mut rng), bench_addr(i), 1, 0))
            .collect();
        b.iter(|| {
            let mut table = RoutingTable::new(NodeId::random(&mut rng), 20, 3, 1, 0);
            for contact in &candidates {
                table.insert(black_box(contact.clone()), 0);
            }
            black_box(table.len())
        });
    });
}

fn bench_k_closest(c: &mut Criterion) {
    c.bench_function("routing_table_k_closest", |b| {
        let mut rng = StdRng::seed_from_u64(11);
        let table = populated_table(&mut rng, 1000);
        let target = NodeId::random(&mut rng);
        b.iter(|| black_box(table.k_closest(black_box(&target), 20, None)));
    });
}

fn bench_distance(c: &mut Criterion) {
    c.bench_function("xor_distance", |b| {
        let mut rng = StdRng::seed_from_u64(13);
        let a = NodeId::random(&mut rng);
        let t = NodeId::random(&mut rng);
        b.iter(|| black_box(a.distance(black_box(&t)).leading_zeros()));
    });
}

criterion_group!(benches, bench_insert, bench_k_closest, bench_distance);
criterion_main!(benches);
