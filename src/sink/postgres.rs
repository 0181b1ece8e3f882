use chrono::NaiveDateTime;
use postgres::{Client, NoTls};

use crate::config::DatabaseConfig;
use crate::error::{BoxError, SinkError};
use crate::model::option::{OPTION_COLUMNS, OPTION_KEY};
use crate::model::{BarRecord, OptionSnapshot, Series};

use super::{
    check_column_set, check_columns, upsert_counts, OptionChainSink, Sink, TargetInfo, WriteReport,
};

/// Shared PostgreSQL database, one table per series inside `schema`.
pub struct PostgresSink {
    client: Client,
    schema: String,
}

impl PostgresSink {
    pub fn connect(config: &DatabaseConfig) -> Result<Self, SinkError> {
        let label = format!(
            "postgres://{}:{}/{}",
            config.host.as_deref().unwrap_or("?"),
            config.port,
            config.name.as_deref().unwrap_or("?")
        );
        let params = config
            .postgres_params()
            .map_err(|e| SinkError::connection(&label, e.to_string()))?;
        let client = Client::connect(&params, NoTls).map_err(|e| SinkError::connection(&label, e))?;
        tracing::info!(target_db = %label, schema = %config.schema, "Connected to PostgreSQL");
        Ok(Self {
            client,
            schema: config.schema.clone(),
        })
    }

    fn qualified(&self, table: &str) -> String {
        qualified_name(&self.schema, table)
    }

    fn existing_columns(&mut self, table: &str, target: &str) -> Result<Vec<String>, SinkError> {
        let rows = self
            .client
            .query(
                "SELECT column_name::text FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
                &[&self.schema, &table],
            )
            .map_err(|e| SinkError::persistence(target, e))?;
        Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn qualified_name(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

pub fn create_table_sql(schema: &str, table: &str) -> String {
    let t = qualified_name(schema, table);
    let idx = quote_ident(&format!("idx_{}_date", table));
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {t} (
            date TIMESTAMP PRIMARY KEY,
            open DOUBLE PRECISION NOT NULL,
            high DOUBLE PRECISION NOT NULL,
            low DOUBLE PRECISION NOT NULL,
            close DOUBLE PRECISION NOT NULL,
            volume BIGINT NOT NULL,
            price_change DOUBLE PRECISION NOT NULL,
            price_change_pct DOUBLE PRECISION NOT NULL,
            high_low_range DOUBLE PRECISION NOT NULL,
            range_pct DOUBLE PRECISION NOT NULL,
            day_of_week TEXT NOT NULL,
            month INTEGER NOT NULL,
            year INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS {idx} ON {t} (date);
        "#
    )
}

pub fn upsert_sql(schema: &str, table: &str) -> String {
    format!(
        r#"
        INSERT INTO {} (
            date, open, high, low, close, volume, price_change, price_change_pct,
            high_low_range, range_pct, day_of_week, month, year
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ON CONFLICT (date) DO UPDATE SET
            open = EXCLUDED.open,
            high = EXCLUDED.high,
            low = EXCLUDED.low,
            close = EXCLUDED.close,
            volume = EXCLUDED.volume,
            price_change = EXCLUDED.price_change,
            price_change_pct = EXCLUDED.price_change_pct,
            high_low_range = EXCLUDED.high_low_range,
            range_pct = EXCLUDED.range_pct,
            day_of_week = EXCLUDED.day_of_week,
            month = EXCLUDED.month,
            year = EXCLUDED.year
        "#,
        qualified_name(schema, table)
    )
}

pub fn create_options_table_sql(schema: &str, table: &str) -> String {
    let t = qualified_name(schema, table);
    let ts_idx = quote_ident(&format!("idx_{}_timestamp", table));
    let expiry_idx = quote_ident(&format!("idx_{}_expiry", table));
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {t} (
            timestamp TIMESTAMP NOT NULL,
            spot_price DOUBLE PRECISION NOT NULL,
            strike INTEGER NOT NULL,
            option_type VARCHAR(2) NOT NULL,
            expiry_date DATE NOT NULL,
            moneyness VARCHAR(10) NOT NULL,
            tradingsymbol TEXT NOT NULL,
            open DOUBLE PRECISION NOT NULL,
            high DOUBLE PRECISION NOT NULL,
            low DOUBLE PRECISION NOT NULL,
            close DOUBLE PRECISION NOT NULL,
            last_price DOUBLE PRECISION NOT NULL,
            volume BIGINT NOT NULL,
            oi BIGINT NOT NULL,
            bid_price DOUBLE PRECISION,
            ask_price DOUBLE PRECISION,
            bid_qty BIGINT,
            ask_qty BIGINT,
            change DOUBLE PRECISION NOT NULL,
            change_pct DOUBLE PRECISION NOT NULL,
            PRIMARY KEY (timestamp, strike, option_type, expiry_date)
        );
        CREATE INDEX IF NOT EXISTS {ts_idx} ON {t} (timestamp);
        CREATE INDEX IF NOT EXISTS {expiry_idx} ON {t} (expiry_date);
        "#
    )
}

pub fn upsert_options_sql(schema: &str, table: &str) -> String {
    let placeholders: Vec<String> = (1..=OPTION_COLUMNS.len()).map(|i| format!("${}", i)).collect();
    let updates: Vec<String> = OPTION_COLUMNS
        .iter()
        .filter(|c| !OPTION_KEY.contains(*c))
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({}) \
         ON CONFLICT (timestamp, strike, option_type, expiry_date) DO UPDATE SET {}",
        qualified_name(schema, table),
        OPTION_COLUMNS.join(", "),
        placeholders.join(", "),
        updates.join(", ")
    )
}

fn count_rows(client: &mut impl postgres::GenericClient, table: &str) -> Result<usize, BoxError> {
    let n: i64 = client
        .query_one(&format!("SELECT COUNT(*) FROM {}", table), &[])?
        .get(0);
    Ok(usize::try_from(n)?)
}

impl Sink for PostgresSink {
    fn target(&self, series: &Series) -> String {
        format!("{}.{}", self.schema, series.table_name())
    }

    fn write_batch(
        &mut self,
        series: &Series,
        records: &[BarRecord],
    ) -> Result<WriteReport, SinkError> {
        let table = series.table_name();
        let target = self.target(series);
        let qualified = self.qualified(&table);

        let existing = self.existing_columns(&table, &target)?;
        if !existing.is_empty() {
            check_columns(&target, &existing)?;
        }

        let mut tx = self
            .client
            .transaction()
            .map_err(|e| SinkError::persistence(&target, e))?;
        tx.batch_execute(&create_table_sql(&self.schema, &table))
            .map_err(|e| SinkError::persistence(&target, e))?;
        let before = count_rows(&mut tx, &qualified).map_err(|e| SinkError::persistence(&target, e))?;

        let stmt = tx
            .prepare(&upsert_sql(&self.schema, &table))
            .map_err(|e| SinkError::persistence(&target, e))?;
        for r in records {
            let volume = r.volume_i64().map_err(|e| SinkError::persistence(&target, e))?;
            let month = r.month_i32().map_err(|e| SinkError::persistence(&target, e))?;
            tx.execute(
                &stmt,
                &[
                    &r.date,
                    &r.open,
                    &r.high,
                    &r.low,
                    &r.close,
                    &volume,
                    &r.price_change,
                    &r.price_change_pct,
                    &r.high_low_range,
                    &r.range_pct,
                    &r.day_of_week,
                    &month,
                    &r.year,
                ],
            )
            .map_err(|e| SinkError::persistence(&target, e))?;
        }

        let after = count_rows(&mut tx, &qualified).map_err(|e| SinkError::persistence(&target, e))?;
        tx.commit().map_err(|e| SinkError::persistence(&target, e))?;

        let (inserted, updated) = upsert_counts(before, after, records.len());
        tracing::info!(
            series = %series,
            table = %target,
            inserted,
            updated,
            total = after,
            "PostgreSQL upsert committed"
        );
        Ok(WriteReport {
            target,
            inserted,
            updated,
            total_rows: after,
        })
    }

    fn describe(&mut self, series: &Series) -> Result<Option<TargetInfo>, SinkError> {
        let table = series.table_name();
        let target = self.target(series);
        if self.existing_columns(&table, &target)?.is_empty() {
            return Ok(None);
        }
        let row = self
            .client
            .query_one(
                &format!(
                    "SELECT COUNT(*), MIN(date), MAX(date) FROM {}",
                    self.qualified(&table)
                ),
                &[],
            )
            .map_err(|e| SinkError::persistence(&target, e))?;
        let count: i64 = row.get(0);
        let first: Option<NaiveDateTime> = row.get(1);
        let last: Option<NaiveDateTime> = row.get(2);
        let row_count = usize::try_from(count).map_err(|e| SinkError::persistence(&target, e))?;
        Ok(Some(TargetInfo {
            target,
            row_count,
            first,
            last,
        }))
    }
}

impl OptionChainSink for PostgresSink {
    fn chain_target(&self, table: &str) -> String {
        format!("{}.{}", self.schema, table)
    }

    fn write_snapshots(
        &mut self,
        table: &str,
        snapshots: &[OptionSnapshot],
    ) -> Result<WriteReport, SinkError> {
        let target = self.chain_target(table);
        let qualified = self.qualified(table);

        let existing = self.existing_columns(table, &target)?;
        if !existing.is_empty() {
            check_column_set(&target, &OPTION_COLUMNS, &existing)?;
        }

        let mut tx = self
            .client
            .transaction()
            .map_err(|e| SinkError::persistence(&target, e))?;
        tx.batch_execute(&create_options_table_sql(&self.schema, table))
            .map_err(|e| SinkError::persistence(&target, e))?;
        let before = count_rows(&mut tx, &qualified).map_err(|e| SinkError::persistence(&target, e))?;

        let stmt = tx
            .prepare(&upsert_options_sql(&self.schema, table))
            .map_err(|e| SinkError::persistence(&target, e))?;
        for s in snapshots {
            let strike = i32::try_from(s.strike).map_err(|e| SinkError::persistence(&target, e))?;
            let volume = s.volume_i64().map_err(|e| SinkError::persistence(&target, e))?;
            let oi = s.oi_i64().map_err(|e| SinkError::persistence(&target, e))?;
            let bid_qty = s.bid_qty_i64().map_err(|e| SinkError::persistence(&target, e))?;
            let ask_qty = s.ask_qty_i64().map_err(|e| SinkError::persistence(&target, e))?;
            let option_type = s.option_type.code();
            tx.execute(
                &stmt,
                &[
                    &s.timestamp,
                    &s.spot_price,
                    &strike,
                    &option_type,
                    &s.expiry_date,
                    &s.moneyness,
                    &s.tradingsymbol,
                    &s.open,
                    &s.high,
                    &s.low,
                    &s.close,
                    &s.last_price,
                    &volume,
                    &oi,
                    &s.bid_price,
                    &s.ask_price,
                    &bid_qty,
                    &ask_qty,
                    &s.change,
                    &s.change_pct,
                ],
            )
            .map_err(|e| SinkError::persistence(&target, e))?;
        }

        let after = count_rows(&mut tx, &qualified).map_err(|e| SinkError::persistence(&target, e))?;
        tx.commit().map_err(|e| SinkError::persistence(&target, e))?;

        let (inserted, updated) = upsert_counts(before, after, snapshots.len());
        tracing::info!(
            table = %target,
            inserted,
            updated,
            total = after,
            "PostgreSQL option snapshot committed"
        );
        Ok(WriteReport {
            target,
            inserted,
            updated,
            total_rows: after,
        })
    }
}
