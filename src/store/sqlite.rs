//! SQLite-backed record store and metric cache.
//!
//! Amounts are stored as decimal text so they read back exactly; enums use
//! their serde names.

use anyhow::{anyhow, Context};
use chrono::{NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use super::{accepted_cash_flows, accepted_investments, MetricCache, RecordStore};
use crate::errors::{IngestError, Result};
use crate::metrics::{Metric, Scope};
use crate::models::{CashFlow, Dataset, Investment, LinkKey, LiquidityBalance, Platform, PortfolioPosition};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS investments (
        user_id TEXT NOT NULL,
        id TEXT NOT NULL,
        platform TEXT NOT NULL,
        platform_id TEXT,
        investment_type TEXT NOT NULL,
        asset_class TEXT NOT NULL,
        project_name TEXT NOT NULL,
        company_name TEXT NOT NULL,
        invested_amount TEXT NOT NULL,
        annual_rate TEXT,
        duration_months INTEGER,
        capital_repaid TEXT NOT NULL,
        remaining_capital TEXT NOT NULL,
        investment_date TEXT NOT NULL,
        signature_date TEXT,
        expected_end_date TEXT,
        actual_end_date TEXT,
        monthly_payment TEXT,
        status TEXT NOT NULL,
        is_delayed INTEGER NOT NULL DEFAULT 0,
        is_short_term INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (user_id, id)
    );

    CREATE TABLE IF NOT EXISTS cash_flows (
        user_id TEXT NOT NULL,
        id TEXT NOT NULL,
        platform TEXT NOT NULL,
        investment_id TEXT,
        link TEXT NOT NULL,
        flow_type TEXT NOT NULL,
        flow_direction TEXT NOT NULL,
        gross_amount TEXT NOT NULL,
        net_amount TEXT NOT NULL,
        tax_amount TEXT NOT NULL,
        capital_amount TEXT NOT NULL,
        interest_amount TEXT NOT NULL,
        allocation TEXT NOT NULL,
        transaction_date TEXT NOT NULL,
        description TEXT NOT NULL,
        quantity TEXT,
        unit_price TEXT,
        confidence TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (user_id, id)
    );

    CREATE INDEX IF NOT EXISTS idx_cash_flows_investment ON cash_flows(user_id, investment_id);
    CREATE INDEX IF NOT EXISTS idx_cash_flows_date ON cash_flows(user_id, transaction_date);

    CREATE TABLE IF NOT EXISTS positions (
        user_id TEXT NOT NULL,
        platform TEXT NOT NULL,
        valuation_date TEXT NOT NULL,
        isin TEXT NOT NULL,
        asset_name TEXT NOT NULL,
        asset_class TEXT NOT NULL,
        quantity TEXT NOT NULL,
        current_price TEXT NOT NULL,
        market_value TEXT NOT NULL,
        portfolio_share TEXT,
        PRIMARY KEY (user_id, platform, valuation_date, isin)
    );

    CREATE TABLE IF NOT EXISTS liquidity_balances (
        user_id TEXT NOT NULL,
        platform TEXT NOT NULL,
        balance_date TEXT NOT NULL,
        amount TEXT NOT NULL,
        PRIMARY KEY (user_id, platform, balance_date)
    );

    CREATE TABLE IF NOT EXISTS metric_cache (
        user_id TEXT NOT NULL,
        scope TEXT NOT NULL,
        metric_type TEXT NOT NULL,
        value REAL,
        metric TEXT NOT NULL,
        computed_at TEXT NOT NULL,
        PRIMARY KEY (user_id, scope, metric_type)
    );
"#;

fn store_err(err: anyhow::Error) -> IngestError {
    IngestError::Store(format!("{:#}", err))
}

// =============================================================================
// Column conversions
// =============================================================================

fn enum_text<T: Serialize>(value: &T) -> anyhow::Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(anyhow!("expected a unit variant, got {}", other)),
    }
}

fn conversion_failure<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn enum_at<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_value(serde_json::Value::String(text)).map_err(|e| conversion_failure(idx, e))
}

fn decimal_at(row: &Row, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    Decimal::from_str(&text).map_err(|e| conversion_failure(idx, e))
}

fn opt_decimal_at(row: &Row, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| Decimal::from_str(&t).map_err(|e| conversion_failure(idx, e)))
        .transpose()
}

fn uuid_at(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text).map_err(|e| conversion_failure(idx, e))
}

fn opt_text(value: Option<Decimal>) -> Option<String> {
    value.map(|d| d.to_string())
}

// =============================================================================
// Store
// =============================================================================

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(SCHEMA).context("creating schema")?;
        Ok(Self { conn })
    }

    fn write_investments(&mut self, user: &str, investments: &[&Investment]) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO investments (
                    user_id, id, platform, platform_id, investment_type, asset_class, project_name,
                    company_name, invested_amount, annual_rate, duration_months, capital_repaid,
                    remaining_capital, investment_date, signature_date, expected_end_date,
                    actual_end_date, monthly_payment, status, is_delayed, is_short_term, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
            )?;
            for inv in investments {
                stmt.execute(params![
                    user,
                    inv.id.to_string(),
                    inv.platform.key(),
                    inv.platform_id,
                    enum_text(&inv.investment_type)?,
                    enum_text(&inv.asset_class)?,
                    inv.project_name,
                    inv.company_name,
                    inv.invested_amount.to_string(),
                    opt_text(inv.annual_rate),
                    inv.duration_months,
                    inv.capital_repaid.to_string(),
                    inv.remaining_capital.to_string(),
                    inv.investment_date,
                    inv.signature_date,
                    inv.expected_end_date,
                    inv.actual_end_date,
                    opt_text(inv.monthly_payment),
                    enum_text(&inv.status)?,
                    inv.is_delayed,
                    inv.is_short_term,
                    now,
                ])
                .with_context(|| format!("writing investment {}", inv.natural_key()))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn write_cash_flows(&mut self, user: &str, flows: &[&CashFlow]) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO cash_flows (
                    user_id, id, platform, investment_id, link, flow_type, flow_direction,
                    gross_amount, net_amount, tax_amount, capital_amount, interest_amount,
                    allocation, transaction_date, description, quantity, unit_price, confidence, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            )?;
            for flow in flows {
                stmt.execute(params![
                    user,
                    flow.id.to_string(),
                    flow.platform.key(),
                    flow.investment_id.map(|id| id.to_string()),
                    serde_json::to_string(&flow.link)?,
                    enum_text(&flow.flow_type)?,
                    enum_text(&flow.flow_direction)?,
                    flow.gross_amount.to_string(),
                    flow.net_amount.to_string(),
                    flow.tax_amount.to_string(),
                    flow.capital_amount.to_string(),
                    flow.interest_amount.to_string(),
                    enum_text(&flow.allocation)?,
                    flow.transaction_date,
                    flow.description,
                    opt_text(flow.quantity),
                    opt_text(flow.unit_price),
                    enum_text(&flow.confidence)?,
                    now,
                ])
                .with_context(|| format!("writing cash flow {}", flow.id))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn write_positions(
        &mut self,
        user: &str,
        platform: Platform,
        valuation_date: NaiveDate,
        positions: &[PortfolioPosition],
    ) -> anyhow::Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM positions WHERE user_id = ?1 AND platform = ?2 AND valuation_date = ?3",
            params![user, platform.key(), valuation_date],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO positions (
                    user_id, platform, valuation_date, isin, asset_name, asset_class,
                    quantity, current_price, market_value, portfolio_share
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for p in positions {
                stmt.execute(params![
                    user,
                    platform.key(),
                    valuation_date,
                    p.isin,
                    p.asset_name,
                    enum_text(&p.asset_class)?,
                    p.quantity.to_string(),
                    p.current_price.to_string(),
                    p.market_value.to_string(),
                    opt_text(p.portfolio_share),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn write_liquidity(&mut self, user: &str, balances: &[LiquidityBalance]) -> anyhow::Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO liquidity_balances (user_id, platform, balance_date, amount)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for b in balances {
                stmt.execute(params![user, b.platform.key(), b.balance_date, b.amount.to_string()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn read_dataset(&self, user: &str) -> anyhow::Result<Dataset> {
        let mut stmt = self.conn.prepare(
            "SELECT platform, platform_id, investment_type, asset_class, project_name, company_name,
                    invested_amount, annual_rate, duration_months, capital_repaid, remaining_capital,
                    investment_date, signature_date, expected_end_date, actual_end_date, monthly_payment,
                    status, is_delayed, is_short_term, id
             FROM investments WHERE user_id = ?1 ORDER BY id",
        )?;
        let investments = stmt
            .query_map(params![user], |row| {
                Ok(Investment {
                    id: uuid_at(row, 19)?,
                    platform: enum_at(row, 0)?,
                    platform_id: row.get(1)?,
                    investment_type: enum_at(row, 2)?,
                    asset_class: enum_at(row, 3)?,
                    project_name: row.get(4)?,
                    company_name: row.get(5)?,
                    invested_amount: decimal_at(row, 6)?,
                    annual_rate: opt_decimal_at(row, 7)?,
                    duration_months: row.get(8)?,
                    capital_repaid: decimal_at(row, 9)?,
                    remaining_capital: decimal_at(row, 10)?,
                    investment_date: row.get(11)?,
                    signature_date: row.get(12)?,
                    expected_end_date: row.get(13)?,
                    actual_end_date: row.get(14)?,
                    monthly_payment: opt_decimal_at(row, 15)?,
                    status: enum_at(row, 16)?,
                    is_delayed: row.get(17)?,
                    is_short_term: row.get(18)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("reading investments")?;

        let mut stmt = self.conn.prepare(
            "SELECT id, platform, investment_id, link, flow_type, flow_direction, gross_amount,
                    net_amount, tax_amount, capital_amount, interest_amount, allocation,
                    transaction_date, description, quantity, unit_price, confidence
             FROM cash_flows WHERE user_id = ?1 ORDER BY transaction_date, id",
        )?;
        let cash_flows = stmt
            .query_map(params![user], |row| {
                let link: String = row.get(3)?;
                let investment_id: Option<String> = row.get(2)?;
                Ok(CashFlow {
                    id: uuid_at(row, 0)?,
                    platform: enum_at(row, 1)?,
                    investment_id: investment_id
                        .map(|id| Uuid::parse_str(&id).map_err(|e| conversion_failure(2, e)))
                        .transpose()?,
                    link: serde_json::from_str::<LinkKey>(&link).map_err(|e| conversion_failure(3, e))?,
                    flow_type: enum_at(row, 4)?,
                    flow_direction: enum_at(row, 5)?,
                    gross_amount: decimal_at(row, 6)?,
                    net_amount: decimal_at(row, 7)?,
                    tax_amount: decimal_at(row, 8)?,
                    capital_amount: decimal_at(row, 9)?,
                    interest_amount: decimal_at(row, 10)?,
                    allocation: enum_at(row, 11)?,
                    transaction_date: row.get(12)?,
                    description: row.get(13)?,
                    quantity: opt_decimal_at(row, 14)?,
                    unit_price: opt_decimal_at(row, 15)?,
                    confidence: enum_at(row, 16)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("reading cash flows")?;

        let mut stmt = self.conn.prepare(
            "SELECT platform, isin, asset_name, asset_class, quantity, current_price, market_value,
                    portfolio_share, valuation_date
             FROM positions WHERE user_id = ?1 ORDER BY platform, valuation_date, isin",
        )?;
        let positions = stmt
            .query_map(params![user], |row| {
                Ok(PortfolioPosition {
                    platform: enum_at(row, 0)?,
                    isin: row.get(1)?,
                    asset_name: row.get(2)?,
                    asset_class: enum_at(row, 3)?,
                    quantity: decimal_at(row, 4)?,
                    current_price: decimal_at(row, 5)?,
                    market_value: decimal_at(row, 6)?,
                    portfolio_share: opt_decimal_at(row, 7)?,
                    valuation_date: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("reading positions")?;

        let mut stmt = self.conn.prepare(
            "SELECT platform, balance_date, amount FROM liquidity_balances
             WHERE user_id = ?1 ORDER BY platform, balance_date",
        )?;
        let liquidity = stmt
            .query_map(params![user], |row| {
                Ok(LiquidityBalance {
                    platform: enum_at(row, 0)?,
                    balance_date: row.get(1)?,
                    amount: decimal_at(row, 2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("reading liquidity balances")?;

        Ok(Dataset { investments, cash_flows, positions, liquidity })
    }

    fn write_metrics(&mut self, user: &str, scope: Scope, metrics: &[Metric]) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM metric_cache WHERE user_id = ?1 AND scope = ?2",
            params![user, scope.key()],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO metric_cache (user_id, scope, metric_type, value, metric, computed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for metric in metrics {
                stmt.execute(params![
                    user,
                    scope.key(),
                    metric.metric_type.as_str(),
                    metric.value.as_f64(),
                    serde_json::to_string(metric)?,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn read_metrics(&self, user: &str, scope: Scope) -> anyhow::Result<Vec<Metric>> {
        let mut stmt = self
            .conn
            .prepare("SELECT metric FROM metric_cache WHERE user_id = ?1 AND scope = ?2 ORDER BY rowid")?;
        let raw = stmt
            .query_map(params![user, scope.key()], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.iter()
            .map(|json| serde_json::from_str::<Metric>(json).context("decoding cached metric"))
            .collect()
    }
}

impl RecordStore for SqliteStore {
    fn upsert_investments(&mut self, user: &str, investments: &[Investment]) -> Result<usize> {
        let accepted = accepted_investments(investments);
        self.write_investments(user, &accepted).map_err(store_err)?;
        Ok(accepted.len())
    }

    fn upsert_cash_flows(&mut self, user: &str, flows: &[CashFlow]) -> Result<usize> {
        let accepted = accepted_cash_flows(flows);
        self.write_cash_flows(user, &accepted).map_err(store_err)?;
        Ok(accepted.len())
    }

    fn replace_positions(
        &mut self,
        user: &str,
        platform: Platform,
        valuation_date: NaiveDate,
        positions: &[PortfolioPosition],
    ) -> Result<usize> {
        self.write_positions(user, platform, valuation_date, positions).map_err(store_err)?;
        Ok(positions.len())
    }

    fn upsert_liquidity(&mut self, user: &str, balances: &[LiquidityBalance]) -> Result<usize> {
        self.write_liquidity(user, balances).map_err(store_err)?;
        Ok(balances.len())
    }

    fn load_dataset(&self, user: &str) -> Result<Dataset> {
        self.read_dataset(user).map_err(store_err)
    }
}

impl MetricCache for SqliteStore {
    fn store_metrics(&mut self, user: &str, scope: Scope, metrics: &[Metric]) -> Result<()> {
        self.write_metrics(user, scope, metrics).map_err(store_err)
    }

    fn cached_metrics(&self, user: &str, scope: Scope) -> Result<Vec<Metric>> {
        self.read_metrics(user, scope).map_err(store_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{date, sample_dataset, sample_metrics};

    #[test]
    fn test_round_trip_is_exact() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let data = sample_dataset();
        store.save_dataset("alice", &data).unwrap();
        assert_eq!(store.load_dataset("alice").unwrap(), data);
        assert!(store.load_dataset("bob").unwrap().is_empty());
    }

    #[test]
    fn test_saving_twice_does_not_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patrimoine.db");
        let data = sample_dataset();
        {
            let mut store = SqliteStore::open(&path).unwrap();
            store.save_dataset("alice", &data).unwrap();
        }
        let mut store = SqliteStore::open(&path).unwrap();
        store.save_dataset("alice", &data).unwrap();

        let loaded = store.load_dataset("alice").unwrap();
        assert_eq!(loaded.investments.len(), 1);
        assert_eq!(loaded.cash_flows.len(), 1);
        assert_eq!(loaded.positions.len(), 1);
        assert_eq!(loaded.liquidity.len(), 1);
    }

    #[test]
    fn test_snapshot_replacement_and_invalid_records() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let mut data = sample_dataset();
        store.save_dataset("alice", &data).unwrap();

        store.replace_positions("alice", Platform::Pea, date(2024, 3, 31), &[]).unwrap();
        assert!(store.load_dataset("alice").unwrap().positions.is_empty());

        data.investments[0].remaining_capital = Decimal::ONE;
        assert_eq!(store.upsert_investments("alice", &data.investments).unwrap(), 0);
    }

    #[test]
    fn test_metric_cache_replaces_scope() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let metrics = sample_metrics();
        store.store_metrics("alice", Scope::Global, &metrics).unwrap();
        store.store_metrics("alice", Scope::Global, &metrics[..1]).unwrap();
        assert_eq!(store.cached_metrics("alice", Scope::Global).unwrap(), metrics[..1].to_vec());

        store.store_metrics("alice", Scope::Platform(Platform::Pea), &metrics).unwrap();
        assert_eq!(store.cached_metrics("alice", Scope::Platform(Platform::Pea)).unwrap(), metrics);
    }
}
