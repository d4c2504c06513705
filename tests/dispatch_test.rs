//! Strategy registry and facade tests against mock chain clients.

use std::sync::Arc;

use rust_decimal::Decimal;

use payin_relay::app::Strategies;
use payin_relay::app::dispatch::{
    DeclaresAliases, NoPreparationStrategy, PayoutAlias, PayoutStrategy, PrepareAlias,
    PrepareStrategy, SellLiquidityAlias, SellLiquidityStrategy, SendAlias, SendStrategy,
    StrategyRegistry,
};
use payin_relay::domain::{Asset, Blockchain, PayoutOrder};
use payin_relay::test_utils::{MockChains, MockPriceProvider};

fn strategies(chains: &MockChains) -> Strategies {
    Strategies::build(&chains.dependencies(Arc::new(MockPriceProvider::new())))
        .expect("complete dependencies")
}

#[test]
fn test_every_alias_is_registered() {
    let chains = MockChains::new();
    let strategies = strategies(&chains);

    assert_eq!(strategies.payout.len(), PayoutAlias::ALL.len());
    assert_eq!(strategies.payout.len(), 11);
    assert_eq!(strategies.send.len(), 11);
    assert_eq!(strategies.prepare.len(), PrepareAlias::ALL.len());
    assert_eq!(strategies.sell_liquidity.len(), SellLiquidityAlias::ALL.len());
}

#[test]
fn test_selection_by_asset_and_alias_agree() {
    let chains = MockChains::new();
    let strategies = strategies(&chains);
    let usdt = Asset::token(2, "USDT", Blockchain::Ethereum, "0xdac17f");

    let by_asset = strategies.select_send_strategy(&usdt).unwrap();
    let by_alias = strategies
        .select_send_strategy(SendAlias::EthereumToken)
        .unwrap();
    assert!(Arc::ptr_eq(&by_asset, &by_alias));
    assert_eq!(by_asset.aliases(), vec![SendAlias::EthereumToken]);
    assert_eq!(by_asset.forward_address().address, "ethereum-forward");
}

#[test]
fn test_unknown_alias_name_is_reported() {
    let chains = MockChains::new();
    let strategies = strategies(&chains);

    let Some(err) = strategies.prepare.select_by_name("NonExistingAlias").err() else {
        panic!("unknown alias resolved");
    };
    assert_eq!(
        err.to_string(),
        "No PrepareStrategy found. Alias: NonExistingAlias"
    );

    assert!(strategies.prepare.select_by_name("Ethereum").is_ok());
}

#[test]
fn test_asset_without_alias_is_reported() {
    let chains = MockChains::new();
    let strategies = strategies(&chains);
    let dfi = Asset::coin(5, "DFI", Blockchain::DeFiChain);

    let Some(err) = strategies.select_sell_liquidity_strategy(&dfi).err() else {
        panic!("DeFiChain has no liquidity venue");
    };
    assert_eq!(
        err.to_string(),
        "No SellLiquidityStrategy found. Alias: DeFiChainCoin"
    );
}

#[test]
fn test_registry_rejects_duplicate_alias() {
    let mut prepare: Vec<Arc<dyn PrepareStrategy>> = PrepareAlias::ALL
        .iter()
        .map(|&alias| Arc::new(NoPreparationStrategy::new(alias)) as Arc<dyn PrepareStrategy>)
        .collect();
    prepare.push(Arc::new(NoPreparationStrategy::new(PrepareAlias::Bitcoin)));

    let Some(err) = StrategyRegistry::<PrepareAlias, dyn PrepareStrategy>::build(prepare).err()
    else {
        panic!("duplicate alias accepted");
    };
    assert!(err.to_string().contains("Bitcoin registered more than once"));
}

#[test]
fn test_registry_rejects_missing_alias() {
    let prepare: Vec<Arc<dyn PrepareStrategy>> = PrepareAlias::ALL
        .iter()
        .filter(|&&alias| alias != PrepareAlias::Optimism)
        .map(|&alias| Arc::new(NoPreparationStrategy::new(alias)) as Arc<dyn PrepareStrategy>)
        .collect();

    let Some(err) = StrategyRegistry::<PrepareAlias, dyn PrepareStrategy>::build(prepare).err()
    else {
        panic!("incomplete registry accepted");
    };
    assert!(
        err.to_string()
            .contains("PrepareStrategy: no strategy registered for alias Optimism")
    );
}

#[test]
fn test_build_fails_without_liquidity_venue() {
    let chains = MockChains::new();
    let mut deps = chains.dependencies(Arc::new(MockPriceProvider::new()));
    deps.dex_clients.remove(&Blockchain::BinanceSmartChain);

    assert!(Strategies::build(&deps).is_err());
}

#[tokio::test]
async fn test_sell_liquidity_goes_through_dex() {
    let chains = MockChains::new();
    let strategies = strategies(&chains);
    let bnb = Asset::coin(7, "BNB", Blockchain::BinanceSmartChain);

    let tx_id = strategies
        .select_sell_liquidity_strategy(&bnb)
        .unwrap()
        .sell_liquidity(&bnb, Decimal::from(3))
        .await
        .unwrap();

    assert_eq!(tx_id, "dex-binancesmartchain-1");
    assert_eq!(
        chains.dex[&Blockchain::BinanceSmartChain].sales(),
        vec![("BNB".to_string(), Decimal::from(3))]
    );
    assert!(chains.dex[&Blockchain::Ethereum].sales().is_empty());
}

#[tokio::test]
async fn test_sell_liquidity_unsupported_chain_declines() {
    let chains = MockChains::new();
    let strategies = strategies(&chains);
    let arb = Asset::coin(8, "ETH", Blockchain::Arbitrum);

    let result = strategies
        .select_sell_liquidity_strategy(&arb)
        .unwrap()
        .sell_liquidity(&arb, Decimal::ONE)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_payout_skips_orders_with_tx() {
    let chains = MockChains::new();
    let strategies = strategies(&chains);
    let eth = Asset::coin(10, "ETH", Blockchain::Ethereum);

    let mut done = PayoutOrder::new("order-1", eth.clone(), Decimal::ONE, "0xcustomer-1");
    done.payout_tx_id = Some("0xpaid".to_string());
    let mut orders = vec![
        done,
        PayoutOrder::new("order-2", eth.clone(), Decimal::TWO, "0xcustomer-2"),
    ];

    strategies
        .select_payout_strategy(&eth)
        .unwrap()
        .do_payout(&mut orders)
        .await
        .unwrap();

    let sent = chains.client(Blockchain::Ethereum).sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].from, "ethereum-payout");
    assert_eq!(sent[0].to, "0xcustomer-2");
    assert_eq!(sent[0].amount, Decimal::TWO);
    assert_eq!(orders[0].payout_tx_id.as_deref(), Some("0xpaid"));
    assert_eq!(orders[1].payout_tx_id.as_deref(), Some(sent[0].tx_id.as_str()));
}

#[tokio::test]
async fn test_token_payout_uses_token_transfer() {
    let chains = MockChains::new();
    let strategies = strategies(&chains);
    let usdc = Asset::token(11, "USDC", Blockchain::Optimism, "0x0b2c");

    let mut orders = vec![PayoutOrder::new("order-3", usdc.clone(), Decimal::TEN, "0xc")];
    let strategy = strategies.select_payout_strategy(&usdc).unwrap();
    strategy.do_payout(&mut orders).await.unwrap();

    let sent = chains.client(Blockchain::Optimism).sent();
    assert_eq!(sent[0].asset.as_deref(), Some("USDC"));
    assert!(strategy.check_payout_completion(&orders[0]).await.unwrap());
}

#[tokio::test]
async fn test_utxo_token_payout_is_topped_up_once() {
    let chains = MockChains::new();
    let strategies = strategies(&chains);
    let token = Asset::token(12, "DUSD", Blockchain::DeFiChain, "15");
    let client = chains.client(Blockchain::DeFiChain);

    let mut order = PayoutOrder::new("order-4", token.clone(), Decimal::from(50), "df1customer");
    let strategy = strategies.select_prepare_strategy(&token).unwrap();

    client.set_complete_by_default(false);
    strategy.prepare_payout(&mut order).await.unwrap();
    assert!(!strategy.check_preparation_completion(&order).await.unwrap());

    strategy.prepare_payout(&mut order).await.unwrap();
    let sent = client.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].from, "defichain-fee");
    assert_eq!(sent[0].to, "defichain-payout");
    assert_eq!(sent[0].amount, Decimal::new(1, 2));

    client.set_complete_by_default(true);
    assert!(strategy.check_preparation_completion(&order).await.unwrap());
}

#[tokio::test]
async fn test_account_chain_needs_no_preparation() {
    let chains = MockChains::new();
    let strategies = strategies(&chains);
    let usdt = Asset::token(2, "USDT", Blockchain::BinanceSmartChain, "0x55d3");

    let mut order = PayoutOrder::new("order-5", usdt.clone(), Decimal::ONE, "0xc");
    let strategy = strategies.select_prepare_strategy(&usdt).unwrap();
    strategy.prepare_payout(&mut order).await.unwrap();

    assert_eq!(order.prepare_tx_id, None);
    assert!(strategy.check_preparation_completion(&order).await.unwrap());
    assert!(chains.client(Blockchain::BinanceSmartChain).sent().is_empty());
}
