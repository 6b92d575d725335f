use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use custody_engine::models::{
    AccountType, AddressStatus, Currency, TransferKind, TransferStatus, User, WithdrawalInterval,
    WithdrawalWallet, settings,
};
use custody_engine::processing::mock::fake_address;
use custody_engine::processing::{EngineError, MockProcessingClient};
use custody_engine::rates::StaticRateProvider;
use custody_engine::storage::MemoryStorage;
use custody_engine::withdrawal::{EnqueueRequest, WithdrawalAddressBook};
use custody_engine::{
    Blockchain, ProcessingWithdrawalQueue, SchedulerConfig, Sweeper, TransferInitiator,
    WalletAddressPool, WithdrawalScheduler,
};

struct App {
    storage: Arc<MemoryStorage>,
    engine: Arc<MockProcessingClient>,
    pool: Arc<WalletAddressPool>,
    queue: Arc<ProcessingWithdrawalQueue>,
    book: WithdrawalAddressBook,
    scheduler: WithdrawalScheduler,
}

/// Wire the engine the same way the binary does, over test doubles
fn app() -> App {
    let storage = Arc::new(MemoryStorage::new());
    let engine = Arc::new(MockProcessingClient::new());
    storage.insert_currency(Currency {
        id: "TRX".into(),
        code: "TRX".into(),
        blockchain: Blockchain::Tron,
        contract_address: None,
        is_stablecoin: false,
        precision: 6,
    });
    storage.insert_currency(Currency {
        id: "USDT.Tron".into(),
        code: "USDT".into(),
        blockchain: Blockchain::Tron,
        contract_address: Some("TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t".into()),
        is_stablecoin: true,
        precision: 6,
    });

    let rates = Arc::new(
        StaticRateProvider::default()
            .with_rate("binance", "TRX", "0.12".parse().unwrap()),
    );
    let pool = Arc::new(WalletAddressPool::new(
        storage.clone(),
        engine.clone(),
        HashMap::new(),
    ));
    let initiator = Arc::new(TransferInitiator::new(storage.clone(), engine.clone()));
    let queue = Arc::new(ProcessingWithdrawalQueue::new(
        storage.clone(),
        engine.clone(),
        rates,
        initiator.clone(),
    ));
    let sweeper = Arc::new(Sweeper::new(
        storage.clone(),
        engine.clone(),
        pool.clone(),
        initiator,
    ));
    let scheduler = WithdrawalScheduler::new(
        SchedulerConfig {
            interval: std::time::Duration::from_secs(2),
            blockchains: vec![Blockchain::Tron],
        },
        queue.clone(),
        sweeper,
    );
    let book = WithdrawalAddressBook::new(storage.clone(), engine.clone());
    App {
        storage,
        engine,
        pool,
        queue,
        book,
        scheduler,
    }
}

fn merchant(app: &App) -> User {
    let user = User {
        id: Uuid::new_v4(),
        email: "shop@example.com".into(),
        processing_owner_id: Some(Uuid::new_v4()),
        rate_source: "binance".into(),
    };
    app.storage.insert_user(user.clone());
    user
}

fn idle() -> watch::Receiver<bool> {
    watch::channel(false).1
}

#[tokio::test]
async fn deposit_address_to_cold_wallet_sweep() {
    let app = app();
    let user = merchant(&app);
    let store_id = Uuid::new_v4();
    let usdt = Currency {
        id: "USDT.Tron".into(),
        code: "USDT".into(),
        blockchain: Blockchain::Tron,
        contract_address: Some("TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t".into()),
        is_stablecoin: true,
        precision: 6,
    };

    // A customer receives a deposit address; tron mints rows for TRX and USDT
    let hot = app.pool.get_available(&user, store_id, &usdt).await.unwrap();
    assert_eq!(hot.account_type, AccountType::Rotate);
    assert_eq!(app.storage.wallet_addresses().len(), 2);

    // Funds arrive
    app.storage
        .set_address_balance(hot.id, Decimal::from(250), Decimal::from(250));

    // The merchant approves a cold wallet and enables hourly sweeps
    let cold = fake_address(Blockchain::Tron, 9_001);
    app.book
        .add_addresses(&user, "USDT.Tron", vec![cold.clone()], "123456")
        .await
        .unwrap();
    let mut wallet = app.book_wallet(&user, "USDT.Tron").await;
    wallet.withdrawal_enabled = true;
    wallet.min_balance_usd = Decimal::from(100);
    wallet.interval = WithdrawalInterval::EveryOneHour;
    app.storage.put_withdrawal_wallet(wallet);
    app.storage
        .set_user_setting(user.id, settings::TRON_TRANSFER_TYPE, settings::TRANSFER_TYPE_RESOURCES);

    let report = app.scheduler.run_once(&idle()).await;
    assert_eq!(report.initiated, 1);

    let transfer = &app.storage.transfers()[0];
    assert_eq!(transfer.kind, TransferKind::FromAddress);
    assert_eq!(transfer.status, TransferStatus::New);
    assert_eq!(transfer.from_addresses, vec![hot.address.clone()]);
    assert_eq!(transfer.to_address, cold);
    assert_eq!(transfer.amount, Decimal::from(250));

    let request = &app.engine.withdrawal_requests()[0];
    assert_eq!(request.contract_address, "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t");
    assert!(request.kind.is_some());

    let address = app
        .storage
        .wallet_addresses()
        .into_iter()
        .find(|a| a.id == hot.id)
        .unwrap();
    assert_eq!(address.status, AddressStatus::Available);
}

#[tokio::test]
async fn merchant_withdrawal_from_processing_wallet() {
    let app = app();
    let user = merchant(&app);
    app.storage
        .set_user_setting(user.id, settings::WITHDRAW_FROM_PROCESSING, settings::ENABLED);

    let queued = app
        .queue
        .enqueue(
            &user,
            EnqueueRequest {
                currency_id: "TRX".into(),
                request_id: "payout-2024-001".into(),
                to_address: fake_address(Blockchain::Tron, 77),
                amount: Decimal::from(1_000),
            },
        )
        .await
        .unwrap();
    assert!(queued.is_queued());

    // First attempt hits an engine outage and is retried on the next tick
    app.engine
        .fail_next_withdrawal(EngineError::Unavailable("connection refused".into()));
    let report = app.scheduler.run_once(&idle()).await;
    assert_eq!(report.deferred, 1);
    assert_eq!(app.storage.transfer_count(), 0);

    let report = app.scheduler.run_once(&idle()).await;
    assert_eq!(report.initiated, 1);

    let row = &app.storage.processing_withdrawals()[0];
    assert_eq!(row.transfer_id, Some(queued.id));
    assert_eq!(row.amount_usd, Some(Decimal::from(120)));
    assert_eq!(app.storage.transfers()[0].kind, TransferKind::FromProcessing);
}

impl App {
    async fn book_wallet(&self, user: &User, currency_id: &str) -> WithdrawalWallet {
        use custody_engine::storage::Storage;
        self.storage
            .get_or_create_withdrawal_wallet(user.id, currency_id)
            .await
            .unwrap()
    }
}
