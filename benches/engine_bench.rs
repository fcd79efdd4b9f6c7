//! Throughput benchmark for the per-bar execution loop.

use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use kestrel::config::EngineConfig;
use kestrel::data::SliceProvider;
use kestrel::engine::Engine;
use kestrel::error::Result;
use kestrel::indicators::IndicatorValues;
use kestrel::strategy::Strategy;
use kestrel::types::{Bar, Order, OrderRequest, Position, Side};

fn synthetic_bars(count: usize) -> Vec<Bar> {
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    (0..count)
        .map(|i| {
            let px = 100.0 + (i as f64 * 0.05).sin() * 5.0;
            Bar::new(
                base + Duration::minutes(i as i64),
                px,
                px + 0.8,
                px - 0.8,
                px + 0.2,
                1_000.0,
            )
        })
        .collect()
}

struct Churn;

impl Strategy for Churn {
    fn on_bar(
        &mut self,
        _bar: &Bar,
        _indicators: &IndicatorValues,
        positions: &[Position],
    ) -> Result<Vec<OrderRequest>> {
        if positions.is_empty() {
            Ok(vec![Order::market(Side::Long)
                .with_stop_loss(0.01)
                .with_take_profit(0.01)
                .into()])
        } else {
            Ok(Vec::new())
        }
    }
}

fn bench_engine(c: &mut Criterion) {
    let bars = synthetic_bars(50_000);

    c.bench_function("run_50k_bars_churning", |b| {
        b.iter(|| {
            let mut engine = Engine::new(EngineConfig::default()).unwrap();
            let mut provider = SliceProvider::new(bars.clone(), "ETH");
            let results = engine.run(&mut Churn, &mut provider).unwrap();
            black_box(results.total_trades)
        })
    });

    let mut config = EngineConfig::default();
    config.indicators.insert(
        "ema_fast".to_string(),
        serde_json::from_str(r#"{"type": "ema", "period": 15, "timeframe": "30m"}"#).unwrap(),
    );
    config.indicators.insert(
        "rsi_7".to_string(),
        serde_json::from_str(r#"{"type": "rsi", "period": 7}"#).unwrap(),
    );

    c.bench_function("run_50k_bars_with_indicators", |b| {
        b.iter(|| {
            let mut engine = Engine::new(config.clone()).unwrap();
            let mut provider = SliceProvider::new(bars.clone(), "ETH");
            let results = engine.run(&mut Churn, &mut provider).unwrap();
            black_box(results.total_trades)
        })
    });
}

criterion_group!(benches, bench_engine);
criterion_main!(benches);
