//! Concurrent intake and host actions against one market.

use futures::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use market_game::error::GameError;
use market_game::storage::EntityStore;

use crate::harness::{
    baguette_market, file_sqlite_service, memory_service, sqlite_service, TempDb,
};

fn short_name() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_submissions_all_land() {
    let game = memory_service();
    let market = game.create_market(baguette_market(15)).await.unwrap();

    let mut traders = Vec::new();
    for _ in 0..24 {
        traders.push(
            game.join_market(&market.market_id, &short_name(), None)
                .await
                .unwrap(),
        );
    }

    let handles = traders.iter().enumerate().map(|(i, trader)| {
        let game = game.clone();
        let market_id = market.market_id.clone();
        let trader_id = trader.id;
        tokio::spawn(async move {
            game.submit_trade(&market_id, trader_id, 0, Decimal::from(i as i64 % 9 + 1), 10)
                .await
        })
    });
    for result in join_all(handles).await {
        result.unwrap().unwrap();
    }

    let progress = game.market_progress(&market.market_id).await.unwrap();
    assert_eq!(progress.num_ready_traders, 24);

    let report = game.advance_round(&market.market_id, Some(0)).await.unwrap();
    assert_eq!(report.num_forced, 0);
    assert_eq!(report.outcomes.len(), 24);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_submissions_race() {
    let game = memory_service();
    let market = game.create_market(baguette_market(15)).await.unwrap();
    let eva = game.join_market(&market.market_id, "eva", None).await.unwrap();
    let eva_id = eva.id;

    let attempts = (0..8).map(|i| {
        let game = game.clone();
        let market_id = market.market_id.clone();
        tokio::spawn(async move {
            game.submit_trade(&market_id, eva_id, 0, Decimal::from(i + 1), 5)
                .await
        })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let accepted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(accepted, 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, GameError::Uniqueness(_))));
    assert_eq!(game.store().trades_for_trader(eva.id, 0).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_double_advance_settles_once() {
    let game = memory_service();
    let market = game.create_market(baguette_market(15)).await.unwrap();
    let eva = game.join_market(&market.market_id, "eva", None).await.unwrap();
    game.submit_trade(&market.market_id, eva.id, 0, dec!(10), 5)
        .await
        .unwrap();

    let clicks = (0..2).map(|_| {
        let game = game.clone();
        let market_id = market.market_id.clone();
        tokio::spawn(async move { game.advance_round(&market_id, Some(0)).await })
    });
    let results: Vec<_> = join_all(clicks).await.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(GameError::AlreadySettled { round: 0, .. }))));

    assert_eq!(game.current_round(&market.market_id).await.unwrap(), 1);
    let balance = game.store().get_trader(eva.id).await.unwrap().balance;
    // 105 - 175 + 145.8 = 75.8 -> 76 demanded, 5 sold
    assert_eq!(balance, dec!(5000) + dec!(50) - dec!(40));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reads_during_settlement() {
    let game = sqlite_service().await;
    let market = game.create_market(baguette_market(15)).await.unwrap();
    for _ in 0..10 {
        game.join_market(&market.market_id, &short_name(), None)
            .await
            .unwrap();
    }

    let settle = {
        let game = game.clone();
        let market_id = market.market_id.clone();
        tokio::spawn(async move { game.advance_round(&market_id, Some(0)).await })
    };
    let polls = (0..10).map(|_| {
        let game = game.clone();
        let market_id = market.market_id.clone();
        tokio::spawn(async move { game.current_round(&market_id).await })
    });

    for round in join_all(polls).await {
        let round = round.unwrap().unwrap();
        assert!(round == 0 || round == 1);
    }
    settle.await.unwrap().unwrap();
    assert_eq!(game.current_round(&market.market_id).await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_markets_settle_in_parallel_on_file_store() {
    let db = TempDb::new();
    let game = file_sqlite_service(&db).await;

    let mut markets = Vec::new();
    for _ in 0..8 {
        let market = game.create_market(baguette_market(50)).await.unwrap();
        let mut traders = Vec::new();
        for _ in 0..6 {
            traders.push(
                game.join_market(&market.market_id, &short_name(), None)
                    .await
                    .unwrap(),
            );
        }
        markets.push((market.market_id, traders));
    }

    for round in 0..6_i64 {
        let advances = markets.iter().map(|(market_id, _)| {
            let game = game.clone();
            let market_id = market_id.clone();
            tokio::spawn(async move { game.advance_round(&market_id, Some(round)).await })
        });
        // One trader per market tries to decide while the round closes.
        let submits = markets.iter().map(|(market_id, traders)| {
            let game = game.clone();
            let market_id = market_id.clone();
            let trader_id = traders[0].id;
            tokio::spawn(async move {
                game.submit_trade(&market_id, trader_id, round, dec!(6.50), 12)
                    .await
            })
        });
        let (advanced, submitted) = futures::join!(join_all(advances), join_all(submits));

        for result in advanced {
            let report = result.unwrap().unwrap();
            assert_eq!(report.round, round);
            assert_eq!(report.num_trades, 6);
        }
        for result in submitted {
            match result.unwrap() {
                Ok(_) | Err(GameError::Validation(_)) => {}
                Err(other) => panic!("unexpected intake error: {other}"),
            }
        }
    }

    for (market_id, traders) in &markets {
        assert_eq!(game.current_round(market_id).await.unwrap(), 6);
        assert_eq!(game.round_history(market_id).await.unwrap().len(), 6);
        for trader in traders {
            let stored = game.store().get_trader(trader.id).await.unwrap();
            let last = &game.store().trades_for_trader(trader.id, 5).await.unwrap()[0];
            assert_eq!(last.balance_after, Some(stored.balance));
        }
    }
}
