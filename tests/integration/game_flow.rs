//! Whole-game flows through `GameService` on the in-memory store.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use market_game::error::GameError;
use market_game::storage::EntityStore;
use market_game::types::MarketUpdate;

use crate::harness::{baguette_market, expected_profit, market_with_traders, memory_service};

#[tokio::test]
async fn test_classroom_round() {
    let game = memory_service();
    let (market, traders) = market_with_traders(&game, baguette_market(15), &["eva", "bo"]).await;
    let id = &market.market_id;

    game.submit_trade(id, traders[0].id, 0, dec!(10), 5).await.unwrap();
    assert!(game.is_ready(traders[0].id).await.unwrap());
    assert!(!game.is_ready(traders[1].id).await.unwrap());

    let report = game.advance_round(id, Some(0)).await.unwrap();
    assert_eq!(report.avg_price, dec!(5.00));
    assert_eq!(report.stat.round, 0);

    let eva = &report.outcomes[0];
    assert_eq!((eva.demand, eva.units_sold), (3, 3));
    assert_eq!(eva.profit, dec!(-10));
    assert_eq!(eva.balance_after, dec!(4990));

    let bo = &report.outcomes[1];
    assert_eq!((bo.demand, bo.units_sold), (178, 0));
    assert_eq!(bo.balance_after, dec!(5000));

    let bo_trades = game.store().trades_for_trader(traders[1].id, 0).await.unwrap();
    assert!(bo_trades[0].was_forced);
    assert!(!game.is_ready(traders[0].id).await.unwrap());
}

#[tokio::test]
async fn test_multi_round_simulation() {
    let game = memory_service();
    let names = ["eva", "bo", "cy", "dee"];
    let (market, traders) = market_with_traders(&game, baguette_market(15), &names).await;
    let id = &market.market_id;

    let decisions: [[(Decimal, i64); 4]; 5] = [
        [(dec!(6.00), 30), (dec!(7.50), 20), (dec!(9.10), 10), (dec!(5.25), 40)],
        [(dec!(6.20), 25), (dec!(8.00), 15), (dec!(4.99), 60), (dec!(5.50), 35)],
        [(dec!(12.00), 5), (dec!(6.75), 22), (dec!(6.10), 28), (dec!(7.00), 18)],
        [(dec!(5.80), 33), (dec!(5.90), 31), (dec!(6.00), 29), (dec!(6.10), 27)],
        [(dec!(3.00), 80), (dec!(0.00), 0), (dec!(9.99), 3), (dec!(6.66), 21)],
    ];

    let mut balances = vec![dec!(5000.00); traders.len()];
    for (round, row) in decisions.iter().enumerate() {
        let round = round as i64;
        assert_eq!(game.current_round(id).await.unwrap(), round);

        // The last trader sits out every odd round and gets a forced trade.
        for (i, (price, amount)) in row.iter().enumerate() {
            if i == 3 && round % 2 == 1 {
                continue;
            }
            game.submit_trade(id, traders[i].id, round, *price, *amount)
                .await
                .unwrap();
        }

        let report = game.advance_round(id, Some(round)).await.unwrap();
        assert_eq!(report.num_trades, traders.len());
        assert_eq!(report.num_forced, usize::from(round % 2 == 1));

        let prices: Vec<Decimal> = row
            .iter()
            .enumerate()
            .map(|(i, (p, _))| if i == 3 && round % 2 == 1 { Decimal::ZERO } else { *p })
            .collect();
        let avg = prices.iter().copied().sum::<Decimal>() / Decimal::from(prices.len());

        for (i, trader) in traders.iter().enumerate() {
            let trade = &game.store().trades_for_trader(trader.id, round).await.unwrap()[0];
            let (price, amount) = (trade.price_or_zero(), trade.amount_or_zero());
            let profit = trade.profit.unwrap();

            assert_eq!(
                profit,
                expected_profit(&market, trader.prod_cost, price, amount, avg)
            );
            assert_eq!(
                profit,
                price * Decimal::from(trade.units_sold.unwrap())
                    - trader.prod_cost * Decimal::from(amount)
            );
            balances[i] += profit;
            assert_eq!(trade.balance_after, Some(balances[i]));
        }
    }

    for (trader, balance) in traders.iter().zip(&balances) {
        assert_eq!(game.store().get_trader(trader.id).await.unwrap().balance, *balance);
    }
    let history = game.round_history(id).await.unwrap();
    let rounds: Vec<i64> = history.iter().map(|s| s.round).collect();
    assert_eq!(rounds, vec![0, 1, 2, 3, 4]);
    assert_eq!(game.current_round(id).await.unwrap(), 5);
}

#[tokio::test]
async fn test_game_ends_after_max_rounds() {
    let game = memory_service();
    let (market, traders) = market_with_traders(&game, baguette_market(3), &["eva"]).await;
    let id = &market.market_id;

    for round in 0..3 {
        let report = game.advance_round(id, Some(round)).await.unwrap();
        assert_eq!(report.game_over, round == 2);
    }

    let stored = game.market(id).await.unwrap();
    assert!(stored.game_over);
    assert_eq!(stored.round, 3);

    assert!(matches!(
        game.advance_round(id, None).await,
        Err(GameError::GameOver(_))
    ));
    assert!(matches!(
        game.submit_trade(id, traders[0].id, 3, dec!(5), 5).await,
        Err(GameError::GameOver(_))
    ));
    assert!(matches!(
        game.join_market(id, "late", None).await,
        Err(GameError::GameOver(_))
    ));
}

#[tokio::test]
async fn test_endless_market_keeps_going() {
    let game = memory_service();
    let mut new = baguette_market(2);
    new.endless = true;
    let (market, _) = market_with_traders(&game, new, &["eva"]).await;

    for round in 0..5 {
        let report = game.advance_round(&market.market_id, Some(round)).await.unwrap();
        assert!(!report.game_over);
    }
    assert_eq!(game.current_round(&market.market_id).await.unwrap(), 5);
}

#[tokio::test]
async fn test_late_submission_for_settled_round() {
    let game = memory_service();
    let (market, traders) = market_with_traders(&game, baguette_market(15), &["eva", "bo"]).await;
    let id = &market.market_id;

    game.submit_trade(id, traders[0].id, 0, dec!(5), 5).await.unwrap();
    game.advance_round(id, Some(0)).await.unwrap();

    let late = game.submit_trade(id, traders[1].id, 0, dec!(5), 5).await;
    assert!(matches!(late, Err(GameError::Validation(_))));
    let forced = game.store().trades_for_trader(traders[1].id, 0).await.unwrap();
    assert_eq!(forced.len(), 1);
    assert!(forced[0].was_forced);
}

#[tokio::test]
async fn test_host_edit_applies_to_next_settlement() {
    let game = memory_service();
    let (market, traders) = market_with_traders(&game, baguette_market(15), &["eva"]).await;
    let id = &market.market_id;

    game.update_market(
        id,
        &MarketUpdate {
            alpha: Some(dec!(50)),
            beta: Some(dec!(1)),
            theta: Some(dec!(0)),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(game.current_round(id).await.unwrap(), 0);

    game.submit_trade(id, traders[0].id, 0, dec!(10), 100).await.unwrap();
    let report = game.advance_round(id, None).await.unwrap();
    // 50 - 1 * 10 + 0 = 40 units demanded
    assert_eq!(report.outcomes[0].demand, 40);
    assert_eq!(report.outcomes[0].units_sold, 40);
    assert_eq!(report.outcomes[0].profit, dec!(400) - dec!(800));
}

#[tokio::test]
async fn test_negative_units_sold_preserved() {
    let game = memory_service();
    let (market, traders) = market_with_traders(&game, baguette_market(15), &["eva", "bo"]).await;
    let id = &market.market_id;

    game.submit_trade(id, traders[0].id, 0, dec!(50), 10).await.unwrap();
    let report = game.advance_round(id, None).await.unwrap();

    let eva = &report.outcomes[0];
    assert!(eva.units_sold < 0);
    assert_eq!(
        eva.profit,
        dec!(50) * Decimal::from(eva.units_sold) - dec!(8) * dec!(10)
    );
}

#[tokio::test]
async fn test_owner_listing() {
    let game = memory_service();
    game.create_market(baguette_market(15)).await.unwrap();
    game.create_market(baguette_market(15)).await.unwrap();
    let mut anonymous = baguette_market(15);
    anonymous.created_by = None;
    game.create_market(anonymous).await.unwrap();

    let mine = game.markets_created_by("host@example.org").await.unwrap();
    assert_eq!(mine.len(), 2);
    assert!(mine.iter().all(|m| m.market_id.len() == 8));
}

#[tokio::test]
async fn test_out_of_range_round_is_rejected_cleanly() {
    let game = memory_service();
    let mut new = baguette_market(15);
    new.alpha = dec!(0);
    new.beta = dec!(900000000);
    new.theta = dec!(0);
    let (market, traders) = market_with_traders(&game, new, &["eva"]).await;
    let id = &market.market_id;

    game.submit_trade(id, traders[0].id, 0, dec!(9999999999.99), 5)
        .await
        .unwrap();
    let result = game.advance_round(id, Some(0)).await;
    assert!(matches!(result, Err(GameError::Overflow(_))));

    assert_eq!(game.current_round(id).await.unwrap(), 0);
    assert!(game.round_history(id).await.unwrap().is_empty());
    let eva = game.store().get_trader(traders[0].id).await.unwrap();
    assert_eq!(eva.balance, traders[0].balance);
}
