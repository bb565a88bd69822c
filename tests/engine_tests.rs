//! End-to-end engine behavior over in-memory collaborators.

mod support;

use std::time::Duration;

use rust_decimal_macros::dec;
use support::harness::{eventually, eventually_async, Harness};
use tripwire::application::ReportOutcome;
use tripwire::domain::{CloseReason, Direction, Instrument, WatchKind};
use tripwire::port::PositionStore;
use tripwire::testkit::domain::{quote, tick};

#[tokio::test]
async fn take_profit_closes_long_and_credits_proceeds() {
    let mut h = Harness::start();
    let user = h.fund("alice", dec!(1000));
    h.feed.set_quotes(&[quote("BTC", dec!(99), dec!(100))]);

    let trading = h.engine.trading();
    let position = trading
        .open_position(user.clone(), Instrument::from("BTC"), dec!(2), Direction::Long)
        .await
        .unwrap();
    assert_eq!(position.purchase_price, dec!(100));
    assert_eq!(h.ledger.balance(&user), Some(dec!(800)));

    let position = trading.set_take_profit(&position.id, dec!(110)).await.unwrap();
    let thresholds = h.engine.thresholds().clone();
    eventually("take-profit watcher", || {
        thresholds.is_watching(&position, WatchKind::TakeProfit)
    })
    .await;
    eventually("subscription", || {
        h.feed.last_subscription() == Some(vec![Instrument::from("BTC")])
    })
    .await;

    h.feed.send(vec![tick("BTC", dec!(105))]);
    assert!(h.maybe_report_for(&position.id, Duration::from_millis(50)).await.is_none());
    h.feed.send(vec![tick("BTC", dec!(111))]);

    let report = h.report_for(&position.id).await;
    assert_eq!(report.reason, CloseReason::TakeProfit);
    assert_eq!(
        report.outcome,
        ReportOutcome::Settled {
            price: dec!(111),
            net: dec!(222),
        }
    );
    assert_eq!(h.ledger.balance(&user), Some(dec!(1022)));

    let closed = h.store.get_by_id(&position.id).await.unwrap();
    assert!(!closed.is_open());
    assert_eq!(closed.closing_price, Some(dec!(111)));

    eventually("subscription cleared", || {
        h.feed.last_subscription() == Some(Vec::new())
    })
    .await;
    h.feed.send(vec![tick("BTC", dec!(130))]);
    assert!(h.maybe_report_for(&position.id, Duration::from_millis(100)).await.is_none());

    h.shutdown().await;
}

#[tokio::test]
async fn margin_call_liquidates_short_with_net_loss() {
    let mut h = Harness::start();
    let user = h.fund("bob", dec!(10000));
    h.feed.set_quotes(&[tick("ETH", dec!(30))]);

    let position = h
        .engine
        .trading()
        .open_position(user.clone(), Instrument::from("ETH"), dec!(100), Direction::Short)
        .await
        .unwrap();
    assert_eq!(h.ledger.balance(&user), Some(dec!(7000)));

    let margin = h.engine.margin().clone();
    let id = position.id.clone();
    eventually("margin tracking", || margin.is_tracking(&id)).await;

    // 100 × (2 × 30 − 65) = −500
    h.feed.send(vec![quote("ETH", dec!(65), dec!(66))]);

    let report = h.report_for(&position.id).await;
    assert_eq!(report.reason, CloseReason::MarginCall);
    assert_eq!(
        report.outcome,
        ReportOutcome::Settled {
            price: dec!(65),
            net: dec!(-500),
        }
    );
    assert_eq!(h.ledger.balance(&user), Some(dec!(6500)));
    assert!(!margin.is_tracking(&position.id));
    assert_eq!(margin.users(), 0);

    h.shutdown().await;
}

#[tokio::test]
async fn short_stop_loss_fires_above_threshold() {
    let mut h = Harness::start();
    let user = h.fund("carol", dec!(1000));
    h.feed.set_quotes(&[tick("SOL", dec!(100))]);

    let trading = h.engine.trading();
    let position = trading
        .open_position(user.clone(), Instrument::from("SOL"), dec!(1), Direction::Short)
        .await
        .unwrap();
    let position = trading.set_stop_loss(&position.id, dec!(120)).await.unwrap();
    let thresholds = h.engine.thresholds().clone();
    eventually("stop-loss watcher", || {
        thresholds.is_watching(&position, WatchKind::StopLoss)
    })
    .await;

    h.feed.send(vec![tick("SOL", dec!(125))]);

    let report = h.report_for(&position.id).await;
    assert_eq!(report.reason, CloseReason::StopLoss);
    // 1 × (2 × 100 − 125)
    assert_eq!(
        report.outcome,
        ReportOutcome::Settled {
            price: dec!(125),
            net: dec!(75),
        }
    );
    assert_eq!(h.ledger.balance(&user), Some(dec!(975)));

    h.shutdown().await;
}

#[tokio::test]
async fn racing_triggers_settle_exactly_once() {
    let mut h = Harness::start();
    let user = h.fund("dave", dec!(10000));
    h.feed.set_quotes(&[tick("ETH", dec!(30))]);

    let trading = h.engine.trading();
    let position = trading
        .open_position(user.clone(), Instrument::from("ETH"), dec!(100), Direction::Short)
        .await
        .unwrap();
    let position = trading.set_stop_loss(&position.id, dec!(60)).await.unwrap();

    let thresholds = h.engine.thresholds().clone();
    let margin = h.engine.margin().clone();
    eventually("both watchers", || {
        thresholds.is_watching(&position, WatchKind::StopLoss) && margin.is_tracking(&position.id)
    })
    .await;

    // Crosses the stop-loss and puts the margin book underwater at once.
    h.feed.send(vec![tick("ETH", dec!(65))]);

    let first = h.report_for(&position.id).await;
    assert!(matches!(first.outcome, ReportOutcome::Settled { .. }));
    if let Some(second) = h.maybe_report_for(&position.id, Duration::from_millis(300)).await {
        assert_eq!(second.outcome, ReportOutcome::AlreadyClosed);
    }
    assert_eq!(h.ledger.balance(&user), Some(dec!(6500)));

    h.shutdown().await;
}

#[tokio::test]
async fn price_feed_failures_are_retried() {
    let mut h = Harness::start();
    let user = h.fund("erin", dec!(1000));
    h.feed.set_quotes(&[tick("BTC", dec!(100))]);

    let trading = h.engine.trading();
    let position = trading
        .open_position(user, Instrument::from("BTC"), dec!(1), Direction::Long)
        .await
        .unwrap();
    let position = trading.set_stop_loss(&position.id, dec!(90)).await.unwrap();
    let thresholds = h.engine.thresholds().clone();
    eventually("stop-loss watcher", || {
        thresholds.is_watching(&position, WatchKind::StopLoss)
    })
    .await;

    h.feed.fail_batch("connection reset");
    h.feed.fail_batch("connection reset");
    h.feed.send(vec![tick("BTC", dec!(85))]);

    let report = h.report_for(&position.id).await;
    assert_eq!(report.reason, CloseReason::StopLoss);
    assert!(matches!(report.outcome, ReportOutcome::Settled { .. }));

    h.shutdown().await;
}

#[tokio::test]
async fn failed_settlement_is_reported_and_position_stays_open() {
    let mut h = Harness::start();
    let user = h.fund("frank", dec!(1000));
    h.feed.set_quotes(&[tick("BTC", dec!(100))]);

    let trading = h.engine.trading();
    let position = trading
        .open_position(user.clone(), Instrument::from("BTC"), dec!(1), Direction::Long)
        .await
        .unwrap();
    let position = trading.set_take_profit(&position.id, dec!(110)).await.unwrap();
    let thresholds = h.engine.thresholds().clone();
    eventually("take-profit watcher", || {
        thresholds.is_watching(&position, WatchKind::TakeProfit)
    })
    .await;

    h.ledger.fail_after(0);
    h.feed.send(vec![tick("BTC", dec!(115))]);

    let report = h.report_for(&position.id).await;
    assert!(matches!(report.outcome, ReportOutcome::Failed { .. }));
    assert_eq!(h.ledger.balance(&user), Some(dec!(900)));

    let store = h.store.clone();
    let id = position.id.clone();
    eventually_async("row still open", || {
        let store = store.clone();
        let id = id.clone();
        async move { store.get_by_id(&id).await.is_ok_and(|p| p.is_open()) }
    })
    .await;

    // Not requeued: the watcher was consumed by its trigger.
    assert!(!thresholds.is_watching(&position, WatchKind::TakeProfit));

    h.shutdown().await;
}

#[tokio::test]
async fn manual_close_releases_watchers_and_margin() {
    let h = Harness::start();
    let user = h.fund("gina", dec!(1000));
    h.feed.set_quotes(&[tick("ETH", dec!(10))]);

    let trading = h.engine.trading();
    let position = trading
        .open_position(user.clone(), Instrument::from("ETH"), dec!(10), Direction::Short)
        .await
        .unwrap();
    let position = trading.set_take_profit(&position.id, dec!(5)).await.unwrap();

    let thresholds = h.engine.thresholds().clone();
    let margin = h.engine.margin().clone();
    eventually("tracking", || {
        thresholds.is_watching(&position, WatchKind::TakeProfit) && margin.is_tracking(&position.id)
    })
    .await;

    h.feed.set_quotes(&[tick("ETH", dec!(8))]);
    let closed = trading.close_position(&position.id).await.unwrap();
    assert_eq!(closed.closing_price, Some(dec!(8)));
    // 10 × (2 × 10 − 8)
    assert_eq!(h.ledger.balance(&user), Some(dec!(1020)));

    eventually("released", || {
        !thresholds.is_watching(&position, WatchKind::TakeProfit) && !margin.is_tracking(&position.id)
    })
    .await;

    let again = trading.close_position(&position.id).await.unwrap_err();
    assert!(again.is_already_closed());

    h.shutdown().await;
}

#[tokio::test]
async fn shutdown_is_prompt_with_live_watchers() {
    let h = Harness::start();
    let user = h.fund("hank", dec!(1000));
    h.feed.set_quotes(&[tick("BTC", dec!(100))]);
    let trading = h.engine.trading();
    for _ in 0..5 {
        let p = trading
            .open_position(user.clone(), Instrument::from("BTC"), dec!(1), Direction::Short)
            .await
            .unwrap();
        trading.set_stop_loss(&p.id, dec!(150)).await.unwrap();
    }
    let thresholds = h.engine.thresholds().clone();
    eventually("watchers", || thresholds.len() == 5).await;

    h.shutdown().await;
}
