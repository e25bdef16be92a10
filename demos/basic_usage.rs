// demos/basic_usage.rs
use mixing_coordinator::chain::{BlockchainClient, MockChainClient};
use mixing_coordinator::monitoring::NotificationDispatcher;
use mixing_coordinator::repository::InMemoryRepository;
use mixing_coordinator::ring::DecoyCandidate;
use mixing_coordinator::types::{
    CoordinatorConfig, EngineConfig, MixOutput, WalletType,
};
use mixing_coordinator::wallet::new_wallet;
use mixing_coordinator::{CreateMixRequest, Currency, MixStatus, MixingCoordinator};
use std::collections::HashMap;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let repository = Arc::new(InMemoryRepository::new());
    let btc = MockChainClient::new(Currency::Btc);
    let mut chains: HashMap<Currency, Arc<dyn BlockchainClient>> = HashMap::new();
    chains.insert(Currency::Btc, Arc::new(btc.clone()));

    let config = CoordinatorConfig {
        engine: EngineConfig {
            tick_interval_secs: 1,
            ..EngineConfig::default()
        },
        hd_seed_phrase: Some(
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about"
                .to_string(),
        ),
        ..CoordinatorConfig::default()
    };

    let mut coordinator =
        MixingCoordinator::new(config, repository, chains, NotificationDispatcher::new(3)).await?;

    // seed pool liquidity and a decoy set so the ring path can run
    coordinator
        .wallets()
        .create(new_wallet(
            Currency::Btc,
            WalletType::Pool,
            "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq".to_string(),
            50.0,
        ))
        .await?;
    let decoys: Vec<DecoyCandidate> = (0..64)
        .map(|i| DecoyCandidate {
            public_key: mixing_coordinator::crypto::generate_keypair().unwrap().public,
            amount: 0.1,
            block_height: 799_100 + (i * 10) % 800,
        })
        .collect();
    coordinator.ring().add_decoy_candidates(decoys).await;

    coordinator.start();

    println!("creating a 0.137 BTC mix request with two output legs...");
    let created = coordinator
        .create_request(CreateMixRequest {
            currency: Currency::Btc,
            input_amount: 0.137,
            outputs: vec![
                MixOutput {
                    address: "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa".into(),
                    percentage: 60.0,
                },
                MixOutput {
                    address: "1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2".into(),
                    percentage: 40.0,
                },
            ],
            user_id: Some("demo-user".into()),
        })
        .await?;

    println!("request {}", created.request.id);
    println!("deposit {} BTC to {}", created.expected_amount, created.deposit_address);

    // simulate the user's deposit confirming on chain
    btc.confirm_deposit(&created.deposit_address, "demo-deposit-tx", 0.137, 3)
        .await;

    loop {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        let request = coordinator.request_status(created.request.id).await?;
        println!("status: {}", request.status.as_str());
        match request.status {
            MixStatus::Completing => {
                // confirm the payout legs so the request can finish
                for leg in coordinator.engine().output_legs(created.request.id).await? {
                    if let Some(txid) = leg.txid {
                        btc.advance_confirmations(&txid, 3).await;
                    }
                }
            }
            MixStatus::Completed => {
                println!("mix complete");
                break;
            }
            MixStatus::Failed | MixStatus::Blocked | MixStatus::Cancelled => {
                println!("terminal: {:?}", request.error_message);
                break;
            }
            _ => {}
        }
    }

    coordinator.health_check().await?;
    println!("health check passed");
    coordinator.shutdown().await;
    Ok(())
}
