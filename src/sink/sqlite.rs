use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::SinkError;
use crate::model::bar::{timestamp_format, TIMESTAMP_FORMAT};
use crate::model::option::{EXPIRY_FORMAT, OPTION_COLUMNS};
use crate::model::{BarRecord, OptionSnapshot, OptionType, Series};

use super::{
    check_column_set, check_columns, upsert_counts, OptionChainSink, Sink, TargetInfo, WriteReport,
};

/// Local single-file database, one table per series.
pub struct SqliteSink {
    conn: Connection,
    label: String,
}

impl SqliteSink {
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        let label = path.display().to_string();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| SinkError::connection(&label, e))?;
        }
        let conn = Connection::open(path).map_err(|e| SinkError::connection(&label, e))?;
        Ok(Self { conn, label })
    }

    pub fn in_memory() -> Result<Self, SinkError> {
        let conn = Connection::open_in_memory().map_err(|e| SinkError::connection(":memory:", e))?;
        Ok(Self {
            conn,
            label: ":memory:".to_string(),
        })
    }

    fn existing_columns(&self, table: &str, target: &str) -> Result<Vec<String>, SinkError> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))
            .map_err(|e| SinkError::persistence(target, e))?;
        let cols = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(|e| SinkError::persistence(target, e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| SinkError::persistence(target, e))?;
        Ok(cols)
    }

    fn row_count(conn: &Connection, table: &str) -> rusqlite::Result<usize> {
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
            [],
            |row| row.get(0),
        )?;
        usize::try_from(n).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(0, n))
    }

    /// All stored rows for `series`, oldest first.
    pub fn load(&self, series: &Series) -> Result<Vec<BarRecord>, SinkError> {
        let table = series.table_name();
        let target = self.target(series);
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT date, open, high, low, close, volume, price_change, price_change_pct, \
                 high_low_range, range_pct, day_of_week, month, year FROM {} ORDER BY date",
                quote_ident(&table)
            ))
            .map_err(|e| SinkError::persistence(&target, e))?;
        let rows = stmt
            .query_map([], |row| {
                let date: String = row.get(0)?;
                let volume: i64 = row.get(5)?;
                let month: i64 = row.get(11)?;
                Ok(BarRecord {
                    date: parse_date(&date, 0)?,
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: unsigned(volume, 5)?,
                    price_change: row.get(6)?,
                    price_change_pct: row.get(7)?,
                    high_low_range: row.get(8)?,
                    range_pct: row.get(9)?,
                    day_of_week: row.get(10)?,
                    month: u32::try_from(month)
                        .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(11, month))?,
                    year: row.get(12)?,
                })
            })
            .map_err(|e| SinkError::persistence(&target, e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| SinkError::persistence(&target, e))?;
        Ok(rows)
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn parse_date(raw: &str, col: usize) -> rusqlite::Result<NaiveDateTime> {
    timestamp_format::parse(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(col, Type::Text, Box::new(e)))
}

fn parse_expiry(raw: &str, col: usize) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, EXPIRY_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(col, Type::Text, Box::new(e)))
}

fn unsigned(v: i64, col: usize) -> rusqlite::Result<u64> {
    u64::try_from(v).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(col, v))
}

fn create_table_sql(table: &str) -> String {
    let t = quote_ident(table);
    let idx = quote_ident(&format!("idx_{}_date", table));
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {t} (
            date TEXT PRIMARY KEY,
            open REAL NOT NULL,
            high REAL NOT NULL,
            low REAL NOT NULL,
            close REAL NOT NULL,
            volume INTEGER NOT NULL,
            price_change REAL NOT NULL,
            price_change_pct REAL NOT NULL,
            high_low_range REAL NOT NULL,
            range_pct REAL NOT NULL,
            day_of_week TEXT NOT NULL,
            month INTEGER NOT NULL,
            year INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS {idx} ON {t} (date);
        "#
    )
}

fn upsert_sql(table: &str) -> String {
    format!(
        r#"
        INSERT INTO {} (
            date, open, high, low, close, volume, price_change, price_change_pct,
            high_low_range, range_pct, day_of_week, month, year
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        ON CONFLICT(date) DO UPDATE SET
            open = excluded.open,
            high = excluded.high,
            low = excluded.low,
            close = excluded.close,
            volume = excluded.volume,
            price_change = excluded.price_change,
            price_change_pct = excluded.price_change_pct,
            high_low_range = excluded.high_low_range,
            range_pct = excluded.range_pct,
            day_of_week = excluded.day_of_week,
            month = excluded.month,
            year = excluded.year
        "#,
        quote_ident(table)
    )
}

fn create_options_table_sql(table: &str) -> String {
    let t = quote_ident(table);
    let ts_idx = quote_ident(&format!("idx_{}_timestamp", table));
    let expiry_idx = quote_ident(&format!("idx_{}_expiry", table));
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {t} (
            timestamp TEXT NOT NULL,
            spot_price REAL NOT NULL,
            strike INTEGER NOT NULL,
            option_type TEXT NOT NULL,
            expiry_date TEXT NOT NULL,
            moneyness TEXT NOT NULL,
            tradingsymbol TEXT NOT NULL,
            open REAL NOT NULL,
            high REAL NOT NULL,
            low REAL NOT NULL,
            close REAL NOT NULL,
            last_price REAL NOT NULL,
            volume INTEGER NOT NULL,
            oi INTEGER NOT NULL,
            bid_price REAL,
            ask_price REAL,
            bid_qty INTEGER,
            ask_qty INTEGER,
            change REAL NOT NULL,
            change_pct REAL NOT NULL,
            PRIMARY KEY (timestamp, strike, option_type, expiry_date)
        );
        CREATE INDEX IF NOT EXISTS {ts_idx} ON {t} (timestamp);
        CREATE INDEX IF NOT EXISTS {expiry_idx} ON {t} (expiry_date);
        "#
    )
}

fn upsert_options_sql(table: &str) -> String {
    format!(
        r#"
        INSERT INTO {} (
            timestamp, spot_price, strike, option_type, expiry_date, moneyness, tradingsymbol,
            open, high, low, close, last_price, volume, oi,
            bid_price, ask_price, bid_qty, ask_qty, change, change_pct
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
        ON CONFLICT(timestamp, strike, option_type, expiry_date) DO UPDATE SET
            spot_price = excluded.spot_price,
            moneyness = excluded.moneyness,
            tradingsymbol = excluded.tradingsymbol,
            open = excluded.open,
            high = excluded.high,
            low = excluded.low,
            close = excluded.close,
            last_price = excluded.last_price,
            volume = excluded.volume,
            oi = excluded.oi,
            bid_price = excluded.bid_price,
            ask_price = excluded.ask_price,
            bid_qty = excluded.bid_qty,
            ask_qty = excluded.ask_qty,
            change = excluded.change,
            change_pct = excluded.change_pct
        "#,
        quote_ident(table)
    )
}

impl SqliteSink {
    /// Stored snapshots in `table`, by time, then side, then strike.
    pub fn load_snapshots(&self, table: &str) -> Result<Vec<OptionSnapshot>, SinkError> {
        let target = self.chain_target(table);
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM {} ORDER BY timestamp, option_type, strike",
                OPTION_COLUMNS.join(", "),
                quote_ident(table)
            ))
            .map_err(|e| SinkError::persistence(&target, e))?;
        let rows = stmt
            .query_map([], |row| {
                let timestamp: String = row.get(0)?;
                let strike: i64 = row.get(2)?;
                let option_type: String = row.get(3)?;
                let expiry: String = row.get(4)?;
                let bid_qty: Option<i64> = row.get(16)?;
                let ask_qty: Option<i64> = row.get(17)?;
                Ok(OptionSnapshot {
                    timestamp: parse_date(&timestamp, 0)?,
                    spot_price: row.get(1)?,
                    strike: u32::try_from(strike)
                        .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(2, strike))?,
                    option_type: OptionType::from_code(&option_type).ok_or_else(|| {
                        rusqlite::Error::FromSqlConversionFailure(
                            3,
                            Type::Text,
                            format!("unknown option type '{}'", option_type).into(),
                        )
                    })?,
                    expiry_date: parse_expiry(&expiry, 4)?,
                    moneyness: row.get(5)?,
                    tradingsymbol: row.get(6)?,
                    open: row.get(7)?,
                    high: row.get(8)?,
                    low: row.get(9)?,
                    close: row.get(10)?,
                    last_price: row.get(11)?,
                    volume: unsigned(row.get(12)?, 12)?,
                    oi: unsigned(row.get(13)?, 13)?,
                    bid_price: row.get(14)?,
                    ask_price: row.get(15)?,
                    bid_qty: bid_qty.map(|v| unsigned(v, 16)).transpose()?,
                    ask_qty: ask_qty.map(|v| unsigned(v, 17)).transpose()?,
                    change: row.get(18)?,
                    change_pct: row.get(19)?,
                })
            })
            .map_err(|e| SinkError::persistence(&target, e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| SinkError::persistence(&target, e))?;
        Ok(rows)
    }
}

impl OptionChainSink for SqliteSink {
    fn chain_target(&self, table: &str) -> String {
        format!("{}:{}", self.label, table)
    }

    fn write_snapshots(
        &mut self,
        table: &str,
        snapshots: &[OptionSnapshot],
    ) -> Result<WriteReport, SinkError> {
        let target = self.chain_target(table);

        let existing = self.existing_columns(table, &target)?;
        if !existing.is_empty() {
            check_column_set(&target, &OPTION_COLUMNS, &existing)?;
        }

        let tx = self
            .conn
            .transaction()
            .map_err(|e| SinkError::persistence(&target, e))?;
        tx.execute_batch(&create_options_table_sql(table))
            .map_err(|e| SinkError::persistence(&target, e))?;
        let before = Self::row_count(&tx, table).map_err(|e| SinkError::persistence(&target, e))?;
        {
            let mut stmt = tx
                .prepare(&upsert_options_sql(table))
                .map_err(|e| SinkError::persistence(&target, e))?;
            for s in snapshots {
                let volume = s.volume_i64().map_err(|e| SinkError::persistence(&target, e))?;
                let oi = s.oi_i64().map_err(|e| SinkError::persistence(&target, e))?;
                let bid_qty = s.bid_qty_i64().map_err(|e| SinkError::persistence(&target, e))?;
                let ask_qty = s.ask_qty_i64().map_err(|e| SinkError::persistence(&target, e))?;
                stmt.execute(params![
                    s.timestamp.format(TIMESTAMP_FORMAT).to_string(),
                    s.spot_price,
                    i64::from(s.strike),
                    s.option_type.code(),
                    s.expiry_date.format(EXPIRY_FORMAT).to_string(),
                    s.moneyness,
                    s.tradingsymbol,
                    s.open,
                    s.high,
                    s.low,
                    s.close,
                    s.last_price,
                    volume,
                    oi,
                    s.bid_price,
                    s.ask_price,
                    bid_qty,
                    ask_qty,
                    s.change,
                    s.change_pct,
                ])
                .map_err(|e| SinkError::persistence(&target, e))?;
            }
        }
        let after = Self::row_count(&tx, table).map_err(|e| SinkError::persistence(&target, e))?;
        tx.commit().map_err(|e| SinkError::persistence(&target, e))?;

        let (inserted, updated) = upsert_counts(before, after, snapshots.len());
        tracing::info!(
            table = %table,
            inserted,
            updated,
            total = after,
            "SQLite option snapshot committed"
        );
        Ok(WriteReport {
            target,
            inserted,
            updated,
            total_rows: after,
        })
    }
}

impl Sink for SqliteSink {
    fn target(&self, series: &Series) -> String {
        format!("{}:{}", self.label, series.table_name())
    }

    fn write_batch(
        &mut self,
        series: &Series,
        records: &[BarRecord],
    ) -> Result<WriteReport, SinkError> {
        let table = series.table_name();
        let target = self.target(series);

        let existing = self.existing_columns(&table, &target)?;
        if !existing.is_empty() {
            check_columns(&target, &existing)?;
        }

        let tx = self
            .conn
            .transaction()
            .map_err(|e| SinkError::persistence(&target, e))?;
        tx.execute_batch(&create_table_sql(&table))
            .map_err(|e| SinkError::persistence(&target, e))?;
        let before = Self::row_count(&tx, &table).map_err(|e| SinkError::persistence(&target, e))?;
        {
            let mut stmt = tx
                .prepare(&upsert_sql(&table))
                .map_err(|e| SinkError::persistence(&target, e))?;
            for r in records {
                let volume = r.volume_i64().map_err(|e| SinkError::persistence(&target, e))?;
                let month = r.month_i32().map_err(|e| SinkError::persistence(&target, e))?;
                stmt.execute(params![
                    r.date.format(TIMESTAMP_FORMAT).to_string(),
                    r.open,
                    r.high,
                    r.low,
                    r.close,
                    volume,
                    r.price_change,
                    r.price_change_pct,
                    r.high_low_range,
                    r.range_pct,
                    r.day_of_week,
                    month,
                    r.year,
                ])
                .map_err(|e| SinkError::persistence(&target, e))?;
            }
        }
        let after = Self::row_count(&tx, &table).map_err(|e| SinkError::persistence(&target, e))?;
        tx.commit().map_err(|e| SinkError::persistence(&target, e))?;

        let (inserted, updated) = upsert_counts(before, after, records.len());
        tracing::info!(
            series = %series,
            table = %table,
            inserted,
            updated,
            total = after,
            "SQLite upsert committed"
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
        let span: Option<(i64, Option<String>, Option<String>)> = self
            .conn
            .query_row(
                &format!(
                    "SELECT COUNT(*), MIN(date), MAX(date) FROM {}",
                    quote_ident(&table)
                ),
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(|e| SinkError::persistence(&target, e))?;
        let Some((count, first, last)) = span else {
            return Ok(None);
        };
        let first = first
            .map(|s| parse_date(&s, 1))
            .transpose()
            .map_err(|e| SinkError::persistence(&target, e))?;
        let last = last
            .map(|s| parse_date(&s, 2))
            .transpose()
            .map_err(|e| SinkError::persistence(&target, e))?;
        let row_count = usize::try_from(count).map_err(|e| SinkError::persistence(&target, e))?;
        Ok(Some(TargetInfo {
            target,
            row_count,
            first,
            last,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("nifty_5m"), "\"nifty_5m\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn option_upsert_keys_on_snapshot_identity() {
        let sql = upsert_options_sql("nifty_options_5m");
        assert!(sql.contains("ON CONFLICT(timestamp, strike, option_type, expiry_date)"));
        assert!(sql.contains("?20"));
        assert_eq!(sql.matches("= excluded.").count(), OPTION_COLUMNS.len() - 4);
        assert!(create_options_table_sql("nifty_options_5m")
            .contains("PRIMARY KEY (timestamp, strike, option_type, expiry_date)"));
    }

    #[test]
    fn upsert_updates_every_non_key_column() {
        let sql = upsert_sql("nifty_5m");
        assert!(sql.contains("ON CONFLICT(date) DO UPDATE SET"));
        assert_eq!(sql.matches("= excluded.").count(), 12);
    }
}
