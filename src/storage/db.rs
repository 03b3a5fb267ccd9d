//! Durable rows: vendors, per-vendor catalog, canonical lookups, aggregates.
//!
//! WAL mode for concurrent reads during sync writes. All access goes through
//! one connection behind a mutex; critical sections are short and never held
//! across await points.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::models::{
    CountryLookup, NormalizationMode, ProviderCountry, ProviderService, ServiceAggregate,
    ServiceLookup, SyncStatus, Vendor,
};
use crate::providers::mapping::VendorMapping;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -16000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS vendors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    priority INTEGER NOT NULL DEFAULT 100,
    weight REAL NOT NULL DEFAULT 1.0,
    price_multiplier REAL NOT NULL DEFAULT 1.0,
    fixed_markup REAL NOT NULL DEFAULT 0.0,
    currency TEXT NOT NULL DEFAULT 'USD',
    deposit_currency TEXT,
    normalization_mode TEXT NOT NULL DEFAULT 'AUTO',
    normalization_rate REAL,
    deposit_spent REAL,
    deposit_received REAL,
    use_global_sync INTEGER NOT NULL DEFAULT 0,
    balance REAL,
    balance_alert_threshold REAL,
    sync_status TEXT NOT NULL DEFAULT 'idle',
    sync_count INTEGER NOT NULL DEFAULT 0,
    last_sync_at TEXT,
    last_metadata_sync_at TEXT,
    mapping TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS country_lookup (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS service_lookup (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS provider_countries (
    vendor_id INTEGER NOT NULL,
    external_id TEXT NOT NULL,
    code TEXT NOT NULL,
    name TEXT NOT NULL,
    flag_url TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    last_sync_at TEXT,
    PRIMARY KEY (vendor_id, external_id)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_provider_countries_code ON provider_countries(code);

CREATE TABLE IF NOT EXISTS provider_services (
    vendor_id INTEGER NOT NULL,
    external_id TEXT NOT NULL,
    code TEXT NOT NULL,
    name TEXT NOT NULL,
    icon_url TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    last_sync_at TEXT,
    PRIMARY KEY (vendor_id, external_id)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_provider_services_code ON provider_services(code);

CREATE TABLE IF NOT EXISTS service_aggregates (
    service_id INTEGER PRIMARY KEY,
    code TEXT NOT NULL,
    name TEXT NOT NULL,
    provider_count INTEGER NOT NULL,
    min_price REAL NOT NULL,
    total_stock INTEGER NOT NULL,
    refreshed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    action TEXT NOT NULL,
    meta TEXT,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);
"#;

const VENDOR_COLS: &str = "id, name, display_name, is_active, priority, weight, price_multiplier, \
    fixed_markup, currency, deposit_currency, normalization_mode, normalization_rate, \
    deposit_spent, deposit_received, use_global_sync, balance, balance_alert_threshold, \
    sync_status, sync_count, last_sync_at, last_metadata_sync_at, mapping, created_at, updated_at";

pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

fn ts_opt(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc)))
}

fn ts(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    Ok(ts_opt(row, idx)?.unwrap_or_else(Utc::now))
}

fn vendor_from_row(row: &Row) -> rusqlite::Result<Vendor> {
    let mode: String = row.get(10)?;
    let status: String = row.get(17)?;
    let mapping_raw: String = row.get(21)?;
    let mapping: VendorMapping = serde_json::from_str(&mapping_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(21, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Vendor {
        id: row.get(0)?,
        name: row.get(1)?,
        display_name: row.get(2)?,
        is_active: row.get::<_, i64>(3)? != 0,
        priority: row.get(4)?,
        weight: row.get(5)?,
        price_multiplier: row.get(6)?,
        fixed_markup: row.get(7)?,
        currency: row.get(8)?,
        deposit_currency: row.get(9)?,
        normalization_mode: NormalizationMode::parse(&mode),
        normalization_rate: row.get(11)?,
        deposit_spent: row.get(12)?,
        deposit_received: row.get(13)?,
        use_global_sync: row.get::<_, i64>(14)? != 0,
        balance: row.get(15)?,
        balance_alert_threshold: row.get(16)?,
        sync_status: SyncStatus::parse(&status),
        sync_count: row.get(18)?,
        last_sync_at: ts_opt(row, 19)?,
        last_metadata_sync_at: ts_opt(row, 20)?,
        mapping,
        created_at: ts(row, 22)?,
        updated_at: ts(row, 23)?,
    })
}

impl Storage {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening database at {}", path.display()))?;
        conn.execute_batch(SCHEMA_SQL).context("applying schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory database")?;
        conn.execute_batch(SCHEMA_SQL).context("applying schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---- vendors ----

    pub fn insert_vendor(&self, vendor: &Vendor) -> Result<i64> {
        if !Vendor::valid_slug(&vendor.name) {
            anyhow::bail!("invalid vendor slug: {}", vendor.name);
        }
        let mapping = serde_json::to_string(&vendor.mapping).context("serializing mapping")?;
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO vendors (name, display_name, is_active, priority, weight,
                price_multiplier, fixed_markup, currency, deposit_currency,
                normalization_mode, normalization_rate, deposit_spent, deposit_received,
                use_global_sync, balance, balance_alert_threshold, sync_status, sync_count,
                mapping, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                ?17, 0, ?18, ?19, ?19)",
            params![
                vendor.name,
                vendor.display_name,
                vendor.is_active as i64,
                vendor.priority,
                vendor.weight,
                vendor.price_multiplier,
                vendor.fixed_markup,
                vendor.currency,
                vendor.deposit_currency,
                vendor.normalization_mode.as_str(),
                vendor.normalization_rate,
                vendor.deposit_spent,
                vendor.deposit_received,
                vendor.use_global_sync as i64,
                vendor.balance,
                vendor.balance_alert_threshold,
                vendor.sync_status.as_str(),
                mapping,
                now,
            ],
        )
        .with_context(|| format!("inserting vendor {}", vendor.name))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_vendors(&self) -> Result<Vec<Vendor>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM vendors ORDER BY priority ASC, name ASC",
                VENDOR_COLS
            ))
            .context("preparing vendor list")?;
        let vendors = stmt
            .query_map([], vendor_from_row)
            .context("listing vendors")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("reading vendor rows")?;
        Ok(vendors)
    }

    pub fn active_vendors(&self) -> Result<Vec<Vendor>> {
        Ok(self
            .list_vendors()?
            .into_iter()
            .filter(|v| v.is_active)
            .collect())
    }

    pub fn vendor_by_slug(&self, slug: &str) -> Result<Option<Vendor>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM vendors WHERE name = ?1", VENDOR_COLS),
            params![slug],
            vendor_from_row,
        )
        .optional()
        .with_context(|| format!("loading vendor {}", slug))
    }

    pub fn set_sync_status(&self, slug: &str, status: SyncStatus) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE vendors SET sync_status = ?2, updated_at = ?3 WHERE name = ?1",
                params![slug, status.as_str(), Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("updating sync status for {}", slug))?;
        Ok(())
    }

    /// Terminal bookkeeping for one sync run.
    pub fn finish_sync(&self, slug: &str, status: SyncStatus) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .lock()
            .execute(
                "UPDATE vendors SET sync_status = ?2, last_sync_at = ?3,
                     sync_count = sync_count + 1, updated_at = ?3
                 WHERE name = ?1",
                params![slug, status.as_str(), now],
            )
            .with_context(|| format!("finishing sync for {}", slug))?;
        Ok(())
    }

    pub fn touch_metadata_sync(&self, slug: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .lock()
            .execute(
                "UPDATE vendors SET last_metadata_sync_at = ?2, updated_at = ?2 WHERE name = ?1",
                params![slug, now],
            )
            .with_context(|| format!("touching metadata sync for {}", slug))?;
        Ok(())
    }

    pub fn set_balance(&self, slug: &str, balance: f64) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE vendors SET balance = ?2, updated_at = ?3 WHERE name = ?1",
                params![slug, balance, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("updating balance for {}", slug))?;
        Ok(())
    }

    pub fn set_vendor_active(&self, slug: &str, active: bool) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE vendors SET is_active = ?2, updated_at = ?3 WHERE name = ?1",
                params![slug, active as i64, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("updating active flag for {}", slug))?;
        Ok(())
    }

    /// Vendor removal is the only path that deletes catalog rows.
    pub fn delete_vendor(&self, slug: &str) -> Result<()> {
        let conn = self.conn.lock();
        let id: Option<i64> = conn
            .query_row("SELECT id FROM vendors WHERE name = ?1", params![slug], |r| {
                r.get(0)
            })
            .optional()
            .context("resolving vendor id")?;
        if let Some(id) = id {
            conn.execute("DELETE FROM provider_countries WHERE vendor_id = ?1", params![id])
                .context("deleting provider countries")?;
            conn.execute("DELETE FROM provider_services WHERE vendor_id = ?1", params![id])
                .context("deleting provider services")?;
            conn.execute("DELETE FROM vendors WHERE id = ?1", params![id])
                .context("deleting vendor")?;
        }
        Ok(())
    }

    // ---- per-vendor catalog ----

    pub fn provider_countries(&self, vendor_id: i64) -> Result<Vec<ProviderCountry>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT vendor_id, external_id, code, name, flag_url, is_active, last_sync_at
                 FROM provider_countries WHERE vendor_id = ?1 ORDER BY external_id",
            )
            .context("preparing provider countries")?;
        let rows = stmt
            .query_map(params![vendor_id], |row| {
                Ok(ProviderCountry {
                    vendor_id: row.get(0)?,
                    external_id: row.get(1)?,
                    code: row.get(2)?,
                    name: row.get(3)?,
                    flag_url: row.get(4)?,
                    is_active: row.get::<_, i64>(5)? != 0,
                    last_sync_at: ts_opt(row, 6)?,
                })
            })
            .context("listing provider countries")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("reading provider countries")?;
        Ok(rows)
    }

    pub fn provider_services(&self, vendor_id: i64) -> Result<Vec<ProviderService>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT vendor_id, external_id, code, name, icon_url, is_active, last_sync_at
                 FROM provider_services WHERE vendor_id = ?1 ORDER BY external_id",
            )
            .context("preparing provider services")?;
        let rows = stmt
            .query_map(params![vendor_id], |row| {
                Ok(ProviderService {
                    vendor_id: row.get(0)?,
                    external_id: row.get(1)?,
                    code: row.get(2)?,
                    name: row.get(3)?,
                    icon_url: row.get(4)?,
                    is_active: row.get::<_, i64>(5)? != 0,
                    last_sync_at: ts_opt(row, 6)?,
                })
            })
            .context("listing provider services")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("reading provider services")?;
        Ok(rows)
    }

    /// Write only on change. Returns whether a write happened so sync runs
    /// can report "no changes detected".
    pub fn upsert_provider_country(&self, row: &ProviderCountry) -> Result<bool> {
        let conn = self.conn.lock();
        let existing: Option<(String, String, Option<String>, bool)> = conn
            .query_row(
                "SELECT code, name, flag_url, is_active FROM provider_countries
                 WHERE vendor_id = ?1 AND external_id = ?2",
                params![row.vendor_id, row.external_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get::<_, i64>(3)? != 0)),
            )
            .optional()
            .context("checking provider country")?;

        if let Some((code, name, flag_url, is_active)) = existing {
            if code == row.code
                && name == row.name
                && flag_url == row.flag_url
                && is_active == row.is_active
            {
                return Ok(false);
            }
        }
        conn.execute(
            "INSERT INTO provider_countries
                 (vendor_id, external_id, code, name, flag_url, is_active, last_sync_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(vendor_id, external_id) DO UPDATE SET
                 code = excluded.code, name = excluded.name, flag_url = excluded.flag_url,
                 is_active = excluded.is_active, last_sync_at = excluded.last_sync_at",
            params![
                row.vendor_id,
                row.external_id,
                row.code,
                row.name,
                row.flag_url,
                row.is_active as i64,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("upserting provider country")?;
        Ok(true)
    }

    pub fn upsert_provider_service(&self, row: &ProviderService) -> Result<bool> {
        let conn = self.conn.lock();
        let existing: Option<(String, String, Option<String>, bool)> = conn
            .query_row(
                "SELECT code, name, icon_url, is_active FROM provider_services
                 WHERE vendor_id = ?1 AND external_id = ?2",
                params![row.vendor_id, row.external_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get::<_, i64>(3)? != 0)),
            )
            .optional()
            .context("checking provider service")?;

        if let Some((code, name, icon_url, is_active)) = existing {
            if code == row.code
                && name == row.name
                && icon_url == row.icon_url
                && is_active == row.is_active
            {
                return Ok(false);
            }
        }
        conn.execute(
            "INSERT INTO provider_services
                 (vendor_id, external_id, code, name, icon_url, is_active, last_sync_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(vendor_id, external_id) DO UPDATE SET
                 code = excluded.code, name = excluded.name, icon_url = excluded.icon_url,
                 is_active = excluded.is_active, last_sync_at = excluded.last_sync_at",
            params![
                row.vendor_id,
                row.external_id,
                row.code,
                row.name,
                row.icon_url,
                row.is_active as i64,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("upserting provider service")?;
        Ok(true)
    }

    /// Hide rows that vanished from the vendor's catalog without deleting
    /// them; admin still sees them.
    pub fn deactivate_countries_except(&self, vendor_id: i64, keep: &[String]) -> Result<usize> {
        self.deactivate_except("provider_countries", vendor_id, keep)
    }

    pub fn deactivate_services_except(&self, vendor_id: i64, keep: &[String]) -> Result<usize> {
        self.deactivate_except("provider_services", vendor_id, keep)
    }

    fn deactivate_except(&self, table: &str, vendor_id: i64, keep: &[String]) -> Result<usize> {
        let conn = self.conn.lock();
        if keep.is_empty() {
            let n = conn
                .execute(
                    &format!(
                        "UPDATE {} SET is_active = 0 WHERE vendor_id = ?1 AND is_active = 1",
                        table
                    ),
                    params![vendor_id],
                )
                .context("deactivating catalog rows")?;
            return Ok(n);
        }
        let placeholders = std::iter::repeat("?")
            .take(keep.len())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "UPDATE {} SET is_active = 0
             WHERE vendor_id = ? AND is_active = 1 AND external_id NOT IN ({})",
            table, placeholders
        );
        let mut args: Vec<rusqlite::types::Value> = vec![vendor_id.into()];
        args.extend(keep.iter().map(|s| s.clone().into()));
        let n = conn
            .execute(&sql, params_from_iter(args))
            .context("deactivating catalog rows")?;
        Ok(n)
    }

    // ---- canonical lookups ----

    pub fn get_or_create_country_lookup(&self, code: &str, name: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO country_lookup (code, name) VALUES (?1, ?2)
             ON CONFLICT(code) DO NOTHING",
            params![code, name],
        )
        .context("inserting country lookup")?;
        conn.query_row(
            "SELECT id FROM country_lookup WHERE code = ?1",
            params![code],
            |r| r.get(0),
        )
        .with_context(|| format!("resolving country lookup {}", code))
    }

    pub fn get_or_create_service_lookup(&self, code: &str, name: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO service_lookup (code, name) VALUES (?1, ?2)
             ON CONFLICT(code) DO NOTHING",
            params![code, name],
        )
        .context("inserting service lookup")?;
        conn.query_row(
            "SELECT id FROM service_lookup WHERE code = ?1",
            params![code],
            |r| r.get(0),
        )
        .with_context(|| format!("resolving service lookup {}", code))
    }

    pub fn country_lookups(&self) -> Result<Vec<CountryLookup>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, code, name FROM country_lookup ORDER BY id")
            .context("preparing country lookups")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(CountryLookup {
                    id: r.get(0)?,
                    code: r.get(1)?,
                    name: r.get(2)?,
                })
            })
            .context("listing country lookups")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("reading country lookups")?;
        Ok(rows)
    }

    pub fn service_lookups(&self) -> Result<Vec<ServiceLookup>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, code, name FROM service_lookup ORDER BY id")
            .context("preparing service lookups")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(ServiceLookup {
                    id: r.get(0)?,
                    code: r.get(1)?,
                    name: r.get(2)?,
                })
            })
            .context("listing service lookups")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("reading service lookups")?;
        Ok(rows)
    }

    // ---- aggregates & audit ----

    pub fn replace_service_aggregates(&self, aggregates: &[ServiceAggregate]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("starting aggregate tx")?;
        tx.execute("DELETE FROM service_aggregates", [])
            .context("clearing aggregates")?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO service_aggregates
                         (service_id, code, name, provider_count, min_price, total_stock, refreshed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )
                .context("preparing aggregate insert")?;
            let now = Utc::now().to_rfc3339();
            for agg in aggregates {
                stmt.execute(params![
                    agg.service_id,
                    agg.code,
                    agg.name,
                    agg.provider_count,
                    agg.min_price,
                    agg.total_stock,
                    now,
                ])
                .context("inserting aggregate")?;
            }
        }
        tx.commit().context("committing aggregates")?;
        Ok(())
    }

    pub fn service_aggregates(&self) -> Result<Vec<ServiceAggregate>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT service_id, code, name, provider_count, min_price, total_stock
                 FROM service_aggregates ORDER BY code",
            )
            .context("preparing aggregates")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(ServiceAggregate {
                    service_id: r.get(0)?,
                    code: r.get(1)?,
                    name: r.get(2)?,
                    provider_count: r.get(3)?,
                    min_price: r.get(4)?,
                    total_stock: r.get(5)?,
                })
            })
            .context("listing aggregates")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("reading aggregates")?;
        Ok(rows)
    }

    pub fn append_audit(&self, action: &str, meta: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO audit_log (action, meta) VALUES (?1, ?2)",
                params![action, meta],
            )
            .context("appending audit row")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::vendor_fixture;

    #[test]
    fn vendor_round_trip() {
        let storage = Storage::open_in_memory().unwrap();
        let vendor = vendor_fixture("sms-hub");
        let id = storage.insert_vendor(&vendor).unwrap();
        assert!(id > 0);

        let loaded = storage.vendor_by_slug("sms-hub").unwrap().unwrap();
        assert_eq!(loaded.name, "sms-hub");
        assert_eq!(loaded.mapping, vendor.mapping);
        assert_eq!(loaded.sync_status, SyncStatus::Idle);
        assert!(storage.vendor_by_slug("nope").unwrap().is_none());
    }

    #[test]
    fn invalid_slug_rejected() {
        let storage = Storage::open_in_memory().unwrap();
        let mut vendor = vendor_fixture("ok");
        vendor.name = "Bad Slug!".into();
        assert!(storage.insert_vendor(&vendor).is_err());
    }

    #[test]
    fn active_vendors_ordered_by_priority() {
        let storage = Storage::open_in_memory().unwrap();
        let mut a = vendor_fixture("aaa");
        a.priority = 5;
        let mut b = vendor_fixture("bbb");
        b.priority = 1;
        let mut c = vendor_fixture("ccc");
        c.priority = 3;
        c.is_active = false;
        for v in [&a, &b, &c] {
            storage.insert_vendor(v).unwrap();
        }
        let active: Vec<String> = storage
            .active_vendors()
            .unwrap()
            .into_iter()
            .map(|v| v.name)
            .collect();
        assert_eq!(active, vec!["bbb".to_string(), "aaa".to_string()]);
    }

    #[test]
    fn smart_upsert_writes_only_on_change() {
        let storage = Storage::open_in_memory().unwrap();
        let vendor_id = storage.insert_vendor(&vendor_fixture("v")).unwrap();
        let row = ProviderCountry {
            vendor_id,
            external_id: "187".into(),
            code: "us".into(),
            name: "United States".into(),
            flag_url: None,
            is_active: true,
            last_sync_at: None,
        };
        assert!(storage.upsert_provider_country(&row).unwrap());
        assert!(!storage.upsert_provider_country(&row).unwrap());

        let changed = ProviderCountry {
            name: "USA".into(),
            ..row
        };
        assert!(storage.upsert_provider_country(&changed).unwrap());
        let rows = storage.provider_countries(vendor_id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "USA");
    }

    #[test]
    fn deactivate_except_hides_missing_rows() {
        let storage = Storage::open_in_memory().unwrap();
        let vendor_id = storage.insert_vendor(&vendor_fixture("v")).unwrap();
        for ext in ["1", "2", "3"] {
            storage
                .upsert_provider_service(&ProviderService {
                    vendor_id,
                    external_id: ext.into(),
                    code: format!("svc{}", ext),
                    name: format!("Service {}", ext),
                    icon_url: None,
                    is_active: true,
                    last_sync_at: None,
                })
                .unwrap();
        }
        let n = storage
            .deactivate_services_except(vendor_id, &["1".into(), "3".into()])
            .unwrap();
        assert_eq!(n, 1);
        let rows = storage.provider_services(vendor_id).unwrap();
        let inactive: Vec<_> = rows.iter().filter(|r| !r.is_active).collect();
        assert_eq!(inactive.len(), 1);
        assert_eq!(inactive[0].external_id, "2");
    }

    #[test]
    fn lookup_ids_are_monotonic_and_stable() {
        let storage = Storage::open_in_memory().unwrap();
        let a = storage.get_or_create_country_lookup("us", "United States").unwrap();
        let b = storage.get_or_create_country_lookup("ru", "Russia").unwrap();
        assert!(b > a);
        assert_eq!(
            storage.get_or_create_country_lookup("us", "ignored").unwrap(),
            a
        );
        // Name from first write wins.
        let lookups = storage.country_lookups().unwrap();
        assert_eq!(lookups[0].name, "United States");
    }

    #[test]
    fn vendor_deletion_removes_catalog_rows() {
        let storage = Storage::open_in_memory().unwrap();
        let vendor_id = storage.insert_vendor(&vendor_fixture("gone")).unwrap();
        storage
            .upsert_provider_country(&ProviderCountry {
                vendor_id,
                external_id: "1".into(),
                code: "us".into(),
                name: "United States".into(),
                flag_url: None,
                is_active: true,
                last_sync_at: None,
            })
            .unwrap();
        storage.delete_vendor("gone").unwrap();
        assert!(storage.vendor_by_slug("gone").unwrap().is_none());
        assert!(storage.provider_countries(vendor_id).unwrap().is_empty());
    }
}
