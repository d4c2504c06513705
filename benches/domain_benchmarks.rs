use criterion::{Criterion, criterion_group, criterion_main};
use payin_relay::app::{FeeGate, SendGroup, SpecificationDefaults, SpecificationResolver};
use payin_relay::domain::{
    AmlCheck, Asset, Blockchain, BlockchainAddress, DepositRoute, DepositRouteType,
    DetectedTransfer, PayIn, PayInPurpose, TransactionDirection, TransactionSpecification,
};
use payin_relay::test_utils::MockSpecificationRepository;
use rust_decimal::Decimal;
use std::hint::black_box;
use std::sync::Arc;
use validator::Validate;

fn transfer(n: usize) -> DetectedTransfer {
    DetectedTransfer {
        address: BlockchainAddress::new(format!("0xdeposit-{}", n % 8), Blockchain::Ethereum),
        tx_id: format!("0xin-{}", n),
        tx_type: None,
        tx_sequence: None,
        block_height: Some(19_000_000),
        amount: Decimal::new(125, 2),
        asset: Some(Asset::token(2, "USDT", Blockchain::Ethereum, "0xdac17f")),
    }
}

fn bench_validation(c: &mut Criterion) {
    let transfer = transfer(0);

    c.bench_function("validate_detected_transfer", |b| {
        b.iter(|| {
            let _ = black_box(&transfer).validate();
        })
    });
}

fn bench_spec_resolution(c: &mut Criterion) {
    let specs = (0..50)
        .map(|i| TransactionSpecification {
            id: i,
            system: Blockchain::ALL[i as usize % Blockchain::ALL.len()]
                .as_str()
                .to_string(),
            asset: (i % 3 != 0).then(|| format!("ASSET{}", i)),
            direction: (i % 2 == 0).then_some(TransactionDirection::In),
            min_fee: Decimal::new(i, 1),
            min_volume: Decimal::from(i),
        })
        .collect();
    let resolver = SpecificationResolver::new(
        Arc::new(MockSpecificationRepository::with_specs(specs)),
        SpecificationDefaults::default(),
    );
    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    runtime.block_on(resolver.refresh()).expect("refresh");

    c.bench_function("resolve_specification", |b| {
        b.iter(|| {
            black_box(resolver.resolve(
                black_box("Ethereum"),
                black_box("ASSET20"),
                TransactionDirection::In,
            ))
        })
    });
}

fn bench_fee_gate(c: &mut Criterion) {
    let gate = FeeGate::new(Decimal::new(5, 2));

    c.bench_function("verify_forward_fee", |b| {
        b.iter(|| {
            let _ = gate.verify(
                black_box(Some(Decimal::new(3, 4))),
                black_box(Decimal::new(1, 4)),
                black_box(Decimal::ONE),
            );
        })
    });
}

fn bench_grouping(c: &mut Criterion) {
    let pay_ins: Vec<PayIn> = (0..200)
        .map(|n| {
            let transfer = transfer(n);
            let deposit = transfer.address.clone();
            let mut pay_in = PayIn::create(transfer, Some(Decimal::ONE), Some(Decimal::ONE));
            let _ = pay_in.acknowledge(
                PayInPurpose::BuyCrypto,
                DepositRoute {
                    id: 1,
                    route_type: DepositRouteType::Sell,
                    deposit,
                },
                AmlCheck::Pass,
            );
            let _ = pay_in
                .designate_forward(BlockchainAddress::new("0xforward", Blockchain::Ethereum));
            pay_in
        })
        .collect();

    c.bench_function("group_send_candidates", |b| {
        b.iter(|| black_box(SendGroup::group(black_box(pay_ins.clone()))))
    });
}

criterion_group!(
    benches,
    bench_validation,
    bench_spec_resolution,
    bench_fee_gate,
    bench_grouping
);
criterion_main!(benches);
