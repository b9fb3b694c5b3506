//! The SQLite store keeps the same contract as the memory store.

use rust_decimal_macros::dec;

use market_game::engine::GameService;
use market_game::error::GameError;
use market_game::storage::EntityStore;
use market_game::types::{SettlementBatch, TradeOutcome};

use crate::harness::{baguette_market, market_with_traders, memory_service, sqlite_service};

async fn play_two_rounds<S>(game: &GameService<S>) -> Vec<TradeOutcome>
where
    S: EntityStore + ?Sized,
{
    let (market, traders) =
        market_with_traders(game, baguette_market(15), &["eva", "bo", "cy"]).await;
    let id = &market.market_id;

    game.submit_trade(id, traders[0].id, 0, dec!(6.40), 25).await.unwrap();
    game.submit_trade(id, traders[1].id, 0, dec!(7.15), 12).await.unwrap();
    let mut outcomes = game.advance_round(id, Some(0)).await.unwrap().outcomes;

    game.submit_trade(id, traders[0].id, 1, dec!(5.95), 30).await.unwrap();
    game.submit_trade(id, traders[2].id, 1, dec!(8.05), 9).await.unwrap();
    outcomes.extend(game.advance_round(id, Some(1)).await.unwrap().outcomes);
    outcomes
}

#[tokio::test]
async fn test_same_results_as_memory_store() {
    let sqlite = play_two_rounds(&*sqlite_service().await).await;
    let memory = play_two_rounds(&*memory_service()).await;

    let strip = |o: &TradeOutcome| (o.demand, o.units_sold, o.profit, o.balance_after);
    assert_eq!(
        sqlite.iter().map(strip).collect::<Vec<_>>(),
        memory.iter().map(strip).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_settled_values_survive_reload() {
    let game = sqlite_service().await;
    let (market, traders) = market_with_traders(&game, baguette_market(15), &["eva", "bo"]).await;
    game.submit_trade(&market.market_id, traders[0].id, 0, dec!(10), 5)
        .await
        .unwrap();
    game.advance_round(&market.market_id, None).await.unwrap();

    let trade = &game.store().trades_for_trader(traders[0].id, 0).await.unwrap()[0];
    assert_eq!(trade.unit_price, Some(dec!(10)));
    assert_eq!(trade.demand, Some(3));
    assert_eq!(trade.units_sold, Some(3));
    assert_eq!(trade.profit, Some(dec!(-10)));
    assert_eq!(trade.balance_after, Some(dec!(4990)));

    let stat = game
        .store()
        .round_stat(&market.market_id, 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stat.avg_price, dec!(5.00));
}

#[tokio::test]
async fn test_broken_batch_rolls_back() {
    let game = sqlite_service().await;
    let (market, traders) = market_with_traders(&game, baguette_market(15), &["eva", "bo"]).await;
    let id = &market.market_id;
    let eva_trade = game
        .submit_trade(id, traders[0].id, 0, dec!(10), 5)
        .await
        .unwrap();

    let batch = SettlementBatch {
        market_id: id.clone(),
        round: 0,
        avg_price: dec!(10),
        outcomes: vec![
            TradeOutcome {
                trade_id: eva_trade.id,
                trader_id: traders[0].id,
                demand: 3,
                units_sold: 3,
                profit: dec!(-10),
                balance_after: dec!(4990),
            },
            TradeOutcome {
                trade_id: 999_999,
                trader_id: traders[1].id,
                demand: 1,
                units_sold: 1,
                profit: dec!(1),
                balance_after: dec!(5001),
            },
        ],
        ends_game: false,
    };
    let result = game.store().commit_settlement(&batch).await;
    assert!(matches!(result, Err(GameError::NotFound { .. })));

    let store = game.store();
    assert_eq!(store.get_trader(traders[0].id).await.unwrap().balance, dec!(5000));
    assert!(!store.get_trade(eva_trade.id).await.unwrap().is_settled());
    assert_eq!(store.get_market(id).await.unwrap().round, 0);
    assert!(store.round_stat(id, 0).await.unwrap().is_none());
}

#[tokio::test]
async fn test_uniqueness_constraints() {
    let game = sqlite_service().await;
    let (market, traders) = market_with_traders(&game, baguette_market(15), &["eva"]).await;
    let id = &market.market_id;

    assert!(matches!(
        game.join_market(id, "eva", None).await,
        Err(GameError::Uniqueness(_))
    ));

    game.submit_trade(id, traders[0].id, 0, dec!(4), 4).await.unwrap();
    assert!(matches!(
        game.submit_trade(id, traders[0].id, 0, dec!(5), 5).await,
        Err(GameError::Uniqueness(_))
    ));
    let kept = game.store().trades_for_trader(traders[0].id, 0).await.unwrap();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].unit_price, Some(dec!(4)));
}

#[tokio::test]
async fn test_cascading_deletes() {
    let game = sqlite_service().await;
    let (market, traders) = market_with_traders(&game, baguette_market(15), &["eva", "bo"]).await;
    let id = &market.market_id;
    let eva_trade = game
        .submit_trade(id, traders[0].id, 0, dec!(4), 4)
        .await
        .unwrap();
    let bo_trade = game
        .submit_trade(id, traders[1].id, 0, dec!(4), 4)
        .await
        .unwrap();

    game.delete_trader(traders[0].id).await.unwrap();
    assert!(game.store().get_trade(eva_trade.id).await.is_err());
    assert!(game.store().get_trade(bo_trade.id).await.is_ok());

    game.delete_market(id).await.unwrap();
    assert!(matches!(
        game.store().get_trader(traders[1].id).await,
        Err(GameError::NotFound { .. })
    ));
    assert!(game.store().get_trade(bo_trade.id).await.is_err());
}
