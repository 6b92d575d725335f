//! PostgreSQL storage (runtime-checked `sqlx` queries).
//!
//! Reference schema: `migrations/0001_custody.sql`.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use super::{
    NewAddressLog, NewProcessingWithdrawal, NewTransfer, NewWalletAddress, QueuedWithdrawal,
    Storage, StorageTx, StoreError,
};
use crate::core_types::{Blockchain, OwnerId, StoreId, TransferId, UserId};
use crate::models::{
    AddressLogEntry, AddressStatus, BalanceThreshold, Currency, MultiWithdrawalMode,
    MultiWithdrawalRule, Transfer, User, WalletAddress, WithdrawalFromProcessingWallet,
    WithdrawalWallet, WithdrawalWalletAddress,
};

const USER_COLUMNS: &str = "id, email, processing_owner_id, rate_source";
const CURRENCY_COLUMNS: &str =
    "id, code, blockchain, contract_address, is_stablecoin, precision";
const WALLET_COLUMNS: &str = "w.id, w.user_id, w.currency_id, w.blockchain, w.withdrawal_enabled, \
     w.min_balance_native, w.min_balance_usd, w.interval, w.created_at";
const ADDRESS_COLUMNS: &str = "id, user_id, store_id, account_id, currency_id, blockchain, \
     address, status, account_type, dirty, balance, balance_usd, created_at, updated_at";
const TRANSFER_COLUMNS: &str = "id, user_id, kind, stage, status, currency_id, blockchain, \
     from_addresses, to_address, amount, amount_usd, message, created_at";
const PROCESSING_WITHDRAWAL_COLUMNS: &str = "id, user_id, currency_id, request_id, to_address, \
     amount, amount_usd, transfer_id, created_at";

/// Enabled, not `never`, and no address sweep inside the interval
const WALLET_IS_DUE: &str = "w.withdrawal_enabled AND w.interval <> 'never' \
     AND NOT EXISTS ( \
         SELECT 1 FROM transfers t \
         WHERE t.user_id = w.user_id AND t.currency_id = w.currency_id \
           AND t.kind = 'from_address' \
           AND t.created_at > NOW() - CASE w.interval \
               WHEN 'every_one_hour' THEN INTERVAL '1 hour' \
               WHEN 'every_one_day' THEN INTERVAL '1 day' \
               ELSE INTERVAL '1 week' END)";

/// Available address meeting the threshold bound to $3 (native) / $4 (usd)
const ADDRESS_IS_WITHDRAWABLE: &str = "user_id = $1 AND currency_id = $2 \
     AND status = 'available' AND balance > 0 \
     AND (($3::numeric = 0 AND $4::numeric = 0) \
          OR ($3::numeric > 0 AND balance >= $3) \
          OR ($4::numeric > 0 AND balance_usd >= $4))";

fn parse<T: FromStr<Err = String>>(value: String) -> Result<T, StoreError> {
    value.parse().map_err(StoreError::Corrupt)
}

fn user_from_row(r: &PgRow) -> User {
    User {
        id: r.get("id"),
        email: r.get("email"),
        processing_owner_id: r.get("processing_owner_id"),
        rate_source: r.get("rate_source"),
    }
}

fn currency_from_row(r: &PgRow) -> Result<Currency, StoreError> {
    let precision: i32 = r.get("precision");
    Ok(Currency {
        id: r.get("id"),
        code: r.get("code"),
        blockchain: parse(r.get("blockchain"))?,
        contract_address: r.get("contract_address"),
        is_stablecoin: r.get("is_stablecoin"),
        precision: u32::try_from(precision)
            .map_err(|_| StoreError::Corrupt(format!("precision {}", precision)))?,
    })
}

fn wallet_from_row(r: &PgRow) -> Result<WithdrawalWallet, StoreError> {
    Ok(WithdrawalWallet {
        id: r.get("id"),
        user_id: r.get("user_id"),
        currency_id: r.get("currency_id"),
        blockchain: parse(r.get("blockchain"))?,
        withdrawal_enabled: r.get("withdrawal_enabled"),
        min_balance_native: r.get("min_balance_native"),
        min_balance_usd: r.get("min_balance_usd"),
        interval: parse(r.get("interval"))?,
        created_at: r.get("created_at"),
    })
}

fn rule_from_row(r: &PgRow) -> Result<MultiWithdrawalRule, StoreError> {
    Ok(MultiWithdrawalRule {
        id: r.get("rule_id"),
        withdrawal_wallet_id: r.get("withdrawal_wallet_id"),
        mode: parse(r.get("mode"))?,
        manual_address: r.get("manual_address"),
    })
}

fn address_from_row(r: &PgRow) -> Result<WalletAddress, StoreError> {
    Ok(WalletAddress {
        id: r.get("id"),
        user_id: r.get("user_id"),
        store_id: r.get("store_id"),
        account_id: r.get("account_id"),
        currency_id: r.get("currency_id"),
        blockchain: parse(r.get("blockchain"))?,
        address: r.get("address"),
        status: parse(r.get("status"))?,
        account_type: parse(r.get("account_type"))?,
        dirty: r.get("dirty"),
        balance: r.get("balance"),
        balance_usd: r.get("balance_usd"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn withdrawal_address_from_row(r: &PgRow) -> WithdrawalWalletAddress {
    WithdrawalWalletAddress {
        id: r.get("id"),
        withdrawal_wallet_id: r.get("withdrawal_wallet_id"),
        address: r.get("address"),
        name: r.get("name"),
        deleted_at: r.get("deleted_at"),
    }
}

fn transfer_from_row(r: &PgRow) -> Result<Transfer, StoreError> {
    Ok(Transfer {
        id: r.get("id"),
        user_id: r.get("user_id"),
        kind: parse(r.get("kind"))?,
        stage: parse(r.get("stage"))?,
        status: parse(r.get("status"))?,
        currency_id: r.get("currency_id"),
        blockchain: parse(r.get("blockchain"))?,
        from_addresses: r.get("from_addresses"),
        to_address: r.get("to_address"),
        amount: r.get("amount"),
        amount_usd: r.get("amount_usd"),
        message: r.get("message"),
        created_at: r.get("created_at"),
    })
}

fn processing_withdrawal_from_row(r: &PgRow) -> WithdrawalFromProcessingWallet {
    WithdrawalFromProcessingWallet {
        id: r.get("id"),
        user_id: r.get("user_id"),
        currency_id: r.get("currency_id"),
        request_id: r.get("request_id"),
        to_address: r.get("to_address"),
        amount: r.get("amount"),
        amount_usd: r.get("amount_usd"),
        transfer_id: r.get("transfer_id"),
        created_at: r.get("created_at"),
    }
}

async fn insert_transfer<'e, E>(executor: E, t: NewTransfer) -> Result<Transfer, StoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let sql = format!(
        "INSERT INTO transfers (id, user_id, kind, stage, status, currency_id, blockchain, \
         from_addresses, to_address, amount, amount_usd, message) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
         RETURNING {}",
        TRANSFER_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(t.id)
        .bind(t.user_id)
        .bind(t.kind.as_str())
        .bind(t.stage.as_str())
        .bind(t.status.as_str())
        .bind(&t.currency_id)
        .bind(t.blockchain.as_str())
        .bind(&t.from_addresses)
        .bind(&t.to_address)
        .bind(t.amount)
        .bind(t.amount_usd)
        .bind(&t.message)
        .fetch_one(executor)
        .await?;
    transfer_from_row(&row)
}

pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        tracing::info!("PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn begin(&self) -> Result<Box<dyn StorageTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStorageTx { tx }))
    }

    async fn get_user(&self, user_id: UserId) -> Result<User, StoreError> {
        let sql = format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))?;
        Ok(user_from_row(&row))
    }

    async fn get_processing_owner_ids(&self) -> Result<Vec<OwnerId>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT processing_owner_id FROM users \
             WHERE processing_owner_id IS NOT NULL ORDER BY processing_owner_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("processing_owner_id")).collect())
    }

    async fn get_user_setting(
        &self,
        user_id: UserId,
        key: &str,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM user_settings WHERE user_id = $1 AND key = $2")
            .bind(user_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn get_currency(&self, currency_id: &str) -> Result<Currency, StoreError> {
        let sql = format!("SELECT {} FROM currencies WHERE id = $1", CURRENCY_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(currency_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("currency {}", currency_id)))?;
        currency_from_row(&row)
    }

    async fn get_currencies_by_blockchain(
        &self,
        blockchain: Blockchain,
    ) -> Result<Vec<Currency>, StoreError> {
        let sql = format!(
            "SELECT {} FROM currencies WHERE blockchain = $1 ORDER BY id",
            CURRENCY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(blockchain.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(currency_from_row).collect()
    }

    async fn get_eligible_withdrawal_wallets(
        &self,
        blockchain: Blockchain,
    ) -> Result<Vec<WithdrawalWallet>, StoreError> {
        let sql = format!(
            "SELECT {} FROM withdrawal_wallets w \
             WHERE w.blockchain = $1 AND {} \
               AND NOT EXISTS (SELECT 1 FROM multi_withdrawal_rules r \
                               WHERE r.withdrawal_wallet_id = w.id) \
             ORDER BY w.created_at, w.id",
            WALLET_COLUMNS, WALLET_IS_DUE
        );
        let rows = sqlx::query(&sql)
            .bind(blockchain.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(wallet_from_row).collect()
    }

    async fn get_multi_withdrawal_wallets(
        &self,
    ) -> Result<Vec<(WithdrawalWallet, MultiWithdrawalRule)>, StoreError> {
        let sql = format!(
            "SELECT {}, r.id AS rule_id, r.withdrawal_wallet_id, r.mode, r.manual_address \
             FROM withdrawal_wallets w \
             JOIN multi_withdrawal_rules r ON r.withdrawal_wallet_id = w.id \
             WHERE {} \
             ORDER BY w.created_at, w.id",
            WALLET_COLUMNS, WALLET_IS_DUE
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| Ok((wallet_from_row(r)?, rule_from_row(r)?)))
            .collect()
    }

    async fn get_or_create_withdrawal_wallet(
        &self,
        user_id: UserId,
        currency_id: &str,
    ) -> Result<WithdrawalWallet, StoreError> {
        sqlx::query(
            r#"INSERT INTO withdrawal_wallets (id, user_id, currency_id, blockchain)
               SELECT $1, $2, c.id, c.blockchain FROM currencies c WHERE c.id = $3
               ON CONFLICT (user_id, currency_id) DO NOTHING"#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(currency_id)
        .execute(&self.pool)
        .await?;

        let sql = format!(
            "SELECT {} FROM withdrawal_wallets w WHERE w.user_id = $1 AND w.currency_id = $2",
            WALLET_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(currency_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("currency {}", currency_id)))?;
        wallet_from_row(&row)
    }

    async fn get_multi_withdrawal_rule(
        &self,
        withdrawal_wallet_id: Uuid,
    ) -> Result<Option<MultiWithdrawalRule>, StoreError> {
        let row = sqlx::query(
            r#"SELECT id AS rule_id, withdrawal_wallet_id, mode, manual_address
               FROM multi_withdrawal_rules WHERE withdrawal_wallet_id = $1"#,
        )
        .bind(withdrawal_wallet_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(rule_from_row).transpose()
    }

    async fn upsert_multi_withdrawal_rule(
        &self,
        withdrawal_wallet_id: Uuid,
        mode: MultiWithdrawalMode,
        manual_address: Option<&str>,
    ) -> Result<MultiWithdrawalRule, StoreError> {
        let row = sqlx::query(
            r#"INSERT INTO multi_withdrawal_rules (id, withdrawal_wallet_id, mode, manual_address)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (withdrawal_wallet_id)
               DO UPDATE SET mode = EXCLUDED.mode, manual_address = EXCLUDED.manual_address
               RETURNING id AS rule_id, withdrawal_wallet_id, mode, manual_address"#,
        )
        .bind(Uuid::new_v4())
        .bind(withdrawal_wallet_id)
        .bind(mode.as_str())
        .bind(manual_address)
        .fetch_one(&self.pool)
        .await?;
        rule_from_row(&row)
    }

    async fn get_approved_addresses(
        &self,
        withdrawal_wallet_id: Uuid,
    ) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT address FROM withdrawal_wallet_addresses
               WHERE withdrawal_wallet_id = $1 AND deleted_at IS NULL
               ORDER BY address"#,
        )
        .bind(withdrawal_wallet_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("address")).collect())
    }

    async fn upsert_withdrawal_addresses(
        &self,
        withdrawal_wallet_id: Uuid,
        addresses: &[String],
    ) -> Result<Vec<WithdrawalWalletAddress>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut saved = Vec::with_capacity(addresses.len());
        for address in addresses {
            let row = sqlx::query(
                r#"INSERT INTO withdrawal_wallet_addresses (id, withdrawal_wallet_id, address)
                   VALUES ($1, $2, $3)
                   ON CONFLICT (withdrawal_wallet_id, address) DO UPDATE SET deleted_at = NULL
                   RETURNING id, withdrawal_wallet_id, address, name, deleted_at"#,
            )
            .bind(Uuid::new_v4())
            .bind(withdrawal_wallet_id)
            .bind(address)
            .fetch_one(&mut *tx)
            .await?;
            saved.push(withdrawal_address_from_row(&row));
        }
        tx.commit().await?;
        Ok(saved)
    }

    async fn soft_delete_withdrawal_address(
        &self,
        withdrawal_wallet_id: Uuid,
        address: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"UPDATE withdrawal_wallet_addresses SET deleted_at = NOW()
               WHERE withdrawal_wallet_id = $1 AND address = $2 AND deleted_at IS NULL"#,
        )
        .bind(withdrawal_wallet_id)
        .bind(address)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("withdrawal address {}", address)));
        }
        Ok(())
    }

    async fn get_address_for_withdrawal(
        &self,
        user_id: UserId,
        currency_id: &str,
        threshold: BalanceThreshold,
    ) -> Result<Option<WalletAddress>, StoreError> {
        let sql = format!(
            "SELECT {} FROM wallet_addresses WHERE {} ORDER BY balance DESC, id LIMIT 1",
            ADDRESS_COLUMNS, ADDRESS_IS_WITHDRAWABLE
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(currency_id)
            .bind(threshold.min_native)
            .bind(threshold.min_usd)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(address_from_row).transpose()
    }

    async fn get_addresses_for_multi_withdrawal(
        &self,
        user_id: UserId,
        currency_id: &str,
        threshold: BalanceThreshold,
    ) -> Result<Vec<WalletAddress>, StoreError> {
        let sql = format!(
            "SELECT {} FROM wallet_addresses WHERE {} ORDER BY created_at, id",
            ADDRESS_COLUMNS, ADDRESS_IS_WITHDRAWABLE
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(currency_id)
            .bind(threshold.min_native)
            .bind(threshold.min_usd)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(address_from_row).collect()
    }

    async fn find_available_address(
        &self,
        user_id: UserId,
        store_id: StoreId,
        currency_id: &str,
    ) -> Result<Option<WalletAddress>, StoreError> {
        let sql = format!(
            "SELECT {} FROM wallet_addresses \
             WHERE user_id = $1 AND store_id = $2 AND currency_id = $3 \
               AND status = 'available' AND account_type = 'rotate' AND NOT dirty \
             ORDER BY created_at, id LIMIT 1",
            ADDRESS_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(store_id)
            .bind(currency_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(address_from_row).transpose()
    }

    async fn get_wallet_address(&self, id: Uuid) -> Result<WalletAddress, StoreError> {
        let sql = format!("SELECT {} FROM wallet_addresses WHERE id = $1", ADDRESS_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("wallet address {}", id)))?;
        address_from_row(&row)
    }

    async fn get_addresses_by_account_id(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<WalletAddress>, StoreError> {
        let sql = format!(
            "SELECT {} FROM wallet_addresses WHERE account_id = $1 ORDER BY created_at, id",
            ADDRESS_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(address_from_row).collect()
    }

    async fn create_wallet_addresses(
        &self,
        rows: Vec<NewWalletAddress>,
    ) -> Result<Vec<WalletAddress>, StoreError> {
        let sql = format!(
            "INSERT INTO wallet_addresses \
             (id, user_id, store_id, account_id, currency_id, blockchain, address, account_type) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {}",
            ADDRESS_COLUMNS
        );

        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(rows.len());
        for row in rows {
            let inserted = sqlx::query(&sql)
                .bind(Uuid::new_v4())
                .bind(row.user_id)
                .bind(row.store_id)
                .bind(row.account_id)
                .bind(&row.currency_id)
                .bind(row.blockchain.as_str())
                .bind(&row.address)
                .bind(row.account_type.as_str())
                .fetch_one(&mut *tx)
                .await?;
            created.push(address_from_row(&inserted)?);
        }
        tx.commit().await?;
        Ok(created)
    }

    async fn compare_and_set_address_status(
        &self,
        id: Uuid,
        expected: AddressStatus,
        new: AddressStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"UPDATE wallet_addresses SET status = $3, updated_at = NOW()
               WHERE id = $1 AND status = $2"#,
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(new.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists = sqlx::query("SELECT 1 FROM wallet_addresses WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("wallet address {}", id))),
        }
    }

    async fn mark_address_dirty(&self, address: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE wallet_addresses SET dirty = TRUE, updated_at = NOW() WHERE address = $1",
        )
        .bind(address)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn append_address_log(&self, entry: NewAddressLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO wallet_address_logs
               (id, wallet_address_id, old_status, new_status, message)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.wallet_address_id)
        .bind(entry.old_status.as_str())
        .bind(entry.new_status.as_str())
        .bind(&entry.message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_address_logs(
        &self,
        wallet_address_id: Uuid,
    ) -> Result<Vec<AddressLogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT id, wallet_address_id, old_status, new_status, message, created_at
               FROM wallet_address_logs WHERE wallet_address_id = $1
               ORDER BY created_at, id"#,
        )
        .bind(wallet_address_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(AddressLogEntry {
                    id: r.get("id"),
                    wallet_address_id: r.get("wallet_address_id"),
                    old_status: parse(r.get("old_status"))?,
                    new_status: parse(r.get("new_status"))?,
                    message: r.get("message"),
                    created_at: r.get("created_at"),
                })
            })
            .collect()
    }

    async fn create_transfer(&self, transfer: NewTransfer) -> Result<Transfer, StoreError> {
        insert_transfer(&self.pool, transfer).await
    }

    async fn find_previous_destination(
        &self,
        from_address: &str,
        approved: &[String],
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            r#"SELECT to_address FROM transactions
               WHERE from_address = $1 AND to_address = ANY($2)
               ORDER BY created_at DESC LIMIT 1"#,
        )
        .bind(from_address)
        .bind(approved)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("to_address")))
    }

    async fn processing_withdrawal_exists(&self, request_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM withdrawals_from_processing_wallet WHERE request_id = $1")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn create_processing_withdrawal(
        &self,
        request: NewProcessingWithdrawal,
    ) -> Result<WithdrawalFromProcessingWallet, StoreError> {
        let sql = format!(
            "INSERT INTO withdrawals_from_processing_wallet \
             (id, user_id, currency_id, request_id, to_address, amount) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {}",
            PROCESSING_WITHDRAWAL_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(request.user_id)
            .bind(&request.currency_id)
            .bind(&request.request_id)
            .bind(&request.to_address)
            .bind(request.amount)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match StoreError::from(e) {
                StoreError::Duplicate(_) => {
                    StoreError::Duplicate(format!("request_id {}", request.request_id))
                }
                other => other,
            })?;
        Ok(processing_withdrawal_from_row(&row))
    }
}

pub struct PgStorageTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StorageTx for PgStorageTx {
    async fn get_queued_processing_withdrawals(
        &mut self,
    ) -> Result<Vec<QueuedWithdrawal>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT p.id, p.user_id, p.currency_id, p.request_id, p.to_address, p.amount,
                      p.amount_usd, p.transfer_id, p.created_at,
                      u.email, u.processing_owner_id, u.rate_source,
                      c.code, c.blockchain, c.contract_address, c.is_stablecoin, c.precision
               FROM withdrawals_from_processing_wallet p
               JOIN users u ON u.id = p.user_id
               JOIN currencies c ON c.id = p.currency_id
               WHERE p.transfer_id IS NULL
               ORDER BY p.created_at, p.id
               FOR UPDATE OF p SKIP LOCKED"#,
        )
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter()
            .map(|r| {
                let request = processing_withdrawal_from_row(r);
                let precision: i32 = r.get("precision");
                Ok(QueuedWithdrawal {
                    user: User {
                        id: request.user_id,
                        email: r.get("email"),
                        processing_owner_id: r.get("processing_owner_id"),
                        rate_source: r.get("rate_source"),
                    },
                    currency: Currency {
                        id: request.currency_id.clone(),
                        code: r.get("code"),
                        blockchain: parse(r.get("blockchain"))?,
                        contract_address: r.get("contract_address"),
                        is_stablecoin: r.get("is_stablecoin"),
                        precision: u32::try_from(precision)
                            .map_err(|_| StoreError::Corrupt(format!("precision {}", precision)))?,
                    },
                    request,
                })
            })
            .collect()
    }

    async fn create_transfer(&mut self, transfer: NewTransfer) -> Result<Transfer, StoreError> {
        insert_transfer(&mut *self.tx, transfer).await
    }

    async fn link_transfer_to_processing_withdrawal(
        &mut self,
        id: Uuid,
        transfer_id: TransferId,
        amount_usd: Option<Decimal>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"UPDATE withdrawals_from_processing_wallet
               SET transfer_id = $2, amount_usd = $3
               WHERE id = $1 AND transfer_id IS NULL"#,
        )
        .bind(id)
        .bind(transfer_id)
        .bind(amount_usd)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "processing withdrawal {} already linked",
                id
            )));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
