use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use rusqlite::{params, Connection, DatabaseName, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::format_description::FormatItem;
use time::{Date, OffsetDateTime, Time};
use trace_ledger_core::{
    receive_cte_for_announcement, AnnouncementId, AnnouncementKey, AnnouncementStatus, CoolFields,
    CteId, CtePayload, CteRecord, CteType, FirstLandReceiveFields, FtlItem, HarvestFields,
    InitialPackFields, InitialPackSproutsFields, LedgerError, Location, LocationId, ReceiveFields,
    ReceiveOutcome, ShipFields, ShipmentAnnouncement, SproutSeedLineage, TlcId, TlcSource,
    TraceabilityLotCode, TransformFields, UnitOfMeasure,
};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS locations (
  location_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  city TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trace_lot_codes (
  tlc_id TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  gtin TEXT,
  batch_lot TEXT,
  sscc TEXT,
  pack_date TEXT,
  harvest_date TEXT,
  best_by_date TEXT,
  logistics_serial TEXT,
  source_location TEXT REFERENCES locations(location_id),
  source_reference TEXT,
  created_at TEXT NOT NULL,
  deleted_at TEXT,
  CHECK ((source_location IS NULL) <> (source_reference IS NULL))
);

CREATE TABLE IF NOT EXISTS ctes (
  cte_id TEXT PRIMARY KEY,
  cte_type TEXT NOT NULL CHECK (cte_type IN (
    'harvest','cool','initial_pack_produce','initial_pack_sprouts','initial_pack_eggs',
    'first_land_receive','receive','receive_exempt','ship','transform')),
  ftl_item TEXT NOT NULL,
  location TEXT NOT NULL REFERENCES locations(location_id),
  prod_desc TEXT NOT NULL,
  variety TEXT,
  tlc TEXT REFERENCES trace_lot_codes(tlc_id),
  quantity REAL NOT NULL CHECK (quantity > 0),
  unit TEXT NOT NULL,
  tlc_source TEXT REFERENCES locations(location_id),
  tlc_source_reference TEXT,
  reference_doc_type TEXT NOT NULL,
  reference_doc_num TEXT NOT NULL,
  event_date TEXT NOT NULL,
  created_at TEXT NOT NULL,
  deleted_at TEXT
);

CREATE TABLE IF NOT EXISTS harvest_payloads (
  cte_id TEXT PRIMARY KEY REFERENCES ctes(cte_id),
  harvest_date TEXT NOT NULL,
  field_name TEXT
);

CREATE TABLE IF NOT EXISTS cool_payloads (
  cte_id TEXT PRIMARY KEY REFERENCES ctes(cte_id),
  cool_date TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS initial_pack_payloads (
  cte_id TEXT PRIMARY KEY REFERENCES ctes(cte_id),
  pack_date TEXT NOT NULL,
  harvest_date TEXT,
  seed_grower_location TEXT REFERENCES locations(location_id),
  seed_harvesting_date TEXT,
  seed_conditioner_location TEXT REFERENCES locations(location_id),
  seed_tlc TEXT REFERENCES trace_lot_codes(tlc_id),
  seed_packing_house_location TEXT REFERENCES locations(location_id),
  seed_supplier_location TEXT REFERENCES locations(location_id)
);

CREATE TABLE IF NOT EXISTS first_land_receive_payloads (
  cte_id TEXT PRIMARY KEY REFERENCES ctes(cte_id),
  landed_date TEXT NOT NULL,
  harvest_date_begin TEXT NOT NULL,
  harvest_date_end TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS receive_payloads (
  cte_id TEXT PRIMARY KEY REFERENCES ctes(cte_id),
  receive_date TEXT NOT NULL,
  receive_time TEXT NOT NULL,
  ips_location TEXT NOT NULL REFERENCES locations(location_id)
);

CREATE TABLE IF NOT EXISTS ship_payloads (
  cte_id TEXT PRIMARY KEY REFERENCES ctes(cte_id),
  ship_date TEXT NOT NULL,
  ship_to_location TEXT NOT NULL REFERENCES locations(location_id)
);

CREATE TABLE IF NOT EXISTS transform_payloads (
  cte_id TEXT PRIMARY KEY REFERENCES ctes(cte_id),
  trans_date TEXT NOT NULL,
  input_tlc TEXT NOT NULL REFERENCES trace_lot_codes(tlc_id),
  input_quantity REAL NOT NULL CHECK (input_quantity > 0),
  input_unit TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS shipment_announcements (
  announcement_id TEXT PRIMARY KEY,
  sscc TEXT,
  logistics_serial TEXT,
  status TEXT NOT NULL CHECK (status IN ('pending','received','cancelled')),
  tlc TEXT NOT NULL REFERENCES trace_lot_codes(tlc_id),
  quantity REAL NOT NULL CHECK (quantity > 0),
  unit TEXT NOT NULL,
  ftl_item TEXT NOT NULL,
  variety TEXT,
  prod_desc TEXT NOT NULL,
  ship_to_location TEXT NOT NULL REFERENCES locations(location_id),
  ship_from_location TEXT NOT NULL REFERENCES locations(location_id),
  ship_date TEXT NOT NULL,
  tlc_source TEXT REFERENCES locations(location_id),
  tlc_source_reference TEXT,
  reference_doc_type TEXT NOT NULL,
  reference_doc_num TEXT NOT NULL,
  cte_receive TEXT REFERENCES ctes(cte_id),
  created_at TEXT NOT NULL,
  deleted_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_ctes_tlc ON ctes(tlc);
CREATE INDEX IF NOT EXISTS idx_ctes_location ON ctes(location);
CREATE INDEX IF NOT EXISTS idx_ctes_event_date ON ctes(event_date);
CREATE INDEX IF NOT EXISTS idx_transform_payloads_input_tlc ON transform_payloads(input_tlc);
CREATE INDEX IF NOT EXISTS idx_announcements_match_key
  ON shipment_announcements(tlc, ship_to_location, status);
CREATE INDEX IF NOT EXISTS idx_announcements_status ON shipment_announcements(status);
";

const CTE_COLUMNS: &str = "cte_id, cte_type, ftl_item, location, prod_desc, variety, tlc, \
     quantity, unit, tlc_source, tlc_source_reference, reference_doc_type, reference_doc_num, \
     created_at, deleted_at";

const ANNOUNCEMENT_COLUMNS: &str = "announcement_id, sscc, logistics_serial, status, tlc, \
     quantity, unit, ftl_item, variety, prod_desc, ship_to_location, ship_from_location, \
     ship_date, tlc_source, tlc_source_reference, reference_doc_type, reference_doc_num, \
     cte_receive, created_at, deleted_at";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Domain(#[from] LedgerError),
    #[error("database busy: {0}")]
    Busy(String),
    #[error("database error: {0}")]
    Sqlite(String),
    #[error("storage error: {0}")]
    Internal(String),
}

impl StoreError {
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, _) = &err {
            if matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) {
                return Self::Busy(err.to_string());
            }
        }
        Self::Sqlite(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Filter for ledger listings. Soft-deleted events are excluded unless
/// explicitly requested.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CteFilter {
    pub tlc_value: Option<String>,
    pub location: Option<LocationId>,
    pub date_from: Option<Date>,
    pub date_to: Option<Date>,
    #[serde(default)]
    pub include_deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DuplicatePendingKey {
    pub sscc: Option<String>,
    pub tlc: String,
    pub ship_to_location: String,
    pub pending_rows: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub duplicate_pending_keys: Vec<DuplicatePendingKey>,
    pub schema_status: SchemaStatus,
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open a `SQLite`-backed ledger store and configure required runtime
    /// pragmas. The busy timeout bounds how long a reconciliation call may
    /// wait on a racing writer.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas
    /// cannot be applied.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(|err| {
            StoreError::internal(format!(
                "failed to open sqlite database at {}: {err}",
                path.display()
            ))
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|err| StoreError::internal(format!("failed to configure sqlite pragmas: {err}")))?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> StoreResult<SchemaStatus> {
        self.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema
    /// version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration
    /// step fails.
    pub fn migrate(&mut self) -> StoreResult<()> {
        self.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;

        let mut version = current_schema_version(&self.conn)?;
        if version < 1 {
            self.conn.execute_batch(MIGRATION_001_SQL)?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(StoreError::internal(format!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            )));
        }

        Ok(())
    }

    /// Register one trading-partner location in the directory.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn register_location(&mut self, location: &Location) -> StoreResult<()> {
        location.validate()?;
        self.conn.execute(
            "INSERT INTO locations(location_id, name, city, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                location.location_id.to_string(),
                location.name,
                location.city,
                now_rfc3339()?
            ],
        )?;
        Ok(())
    }

    /// Resolve one location id to its thin projection.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn resolve_location(&self, location_id: LocationId) -> StoreResult<Option<Location>> {
        let mut stmt = self
            .conn
            .prepare("SELECT location_id, name, city FROM locations WHERE location_id = ?1")?;
        let location = stmt
            .query_row(params![location_id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, Option<String>>(2)?))
            })
            .optional()?;

        match location {
            Some((raw_id, name, city)) => Ok(Some(Location {
                location_id: LocationId(parse_ulid(&raw_id)?),
                name,
                city,
            })),
            None => Ok(None),
        }
    }

    /// Persist one immutable trace lot code record. Lot codes are created
    /// exactly once by the event that assigns them and never re-created.
    ///
    /// # Errors
    /// Returns a validation error for a malformed record, not-found when
    /// the assigning source location is unknown, or a storage error.
    pub fn create_tlc(&mut self, tlc: &TraceabilityLotCode) -> StoreResult<()> {
        tlc.validate()?;
        if let Some(source_location) = tlc.source.location() {
            require_location(&self.conn, source_location)?;
        }

        self.conn.execute(
            "INSERT INTO trace_lot_codes(
                tlc_id, value, gtin, batch_lot, sscc, pack_date, harvest_date, best_by_date,
                logistics_serial, source_location, source_reference, created_at, deleted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                tlc.tlc_id.to_string(),
                tlc.value,
                tlc.gtin,
                tlc.batch_lot,
                tlc.sscc,
                tlc.pack_date.map(fmt_date).transpose()?,
                tlc.harvest_date.map(fmt_date).transpose()?,
                tlc.best_by_date.map(fmt_date).transpose()?,
                tlc.logistics_serial,
                tlc.source.location().map(|location| location.to_string()),
                tlc.source.reference(),
                rfc3339(tlc.created_at)?,
                tlc.deleted_at.map(rfc3339).transpose()?,
            ],
        )?;
        Ok(())
    }

    /// Fetch one trace lot code by id. Soft-deleted lot codes stay
    /// resolvable so lineage queries never dangle.
    ///
    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn get_tlc(&self, tlc_id: TlcId) -> StoreResult<Option<TraceabilityLotCode>> {
        let mut stmt = self.conn.prepare(
            "SELECT tlc_id, value, gtin, batch_lot, sscc, pack_date, harvest_date, best_by_date,
                    logistics_serial, source_location, source_reference, created_at, deleted_at
             FROM trace_lot_codes WHERE tlc_id = ?1",
        )?;

        let row = stmt
            .query_row(params![tlc_id.to_string()], |row| {
                Ok(TlcRow {
                    tlc_id: row.get(0)?,
                    value: row.get(1)?,
                    gtin: row.get(2)?,
                    batch_lot: row.get(3)?,
                    sscc: row.get(4)?,
                    pack_date: row.get(5)?,
                    harvest_date: row.get(6)?,
                    best_by_date: row.get(7)?,
                    logistics_serial: row.get(8)?,
                    source_location: row.get(9)?,
                    source_reference: row.get(10)?,
                    created_at: row.get(11)?,
                    deleted_at: row.get(12)?,
                })
            })
            .optional()?;

        row.map(decode_tlc_row).transpose()
    }

    /// Soft-delete one trace lot code for record-retention purposes.
    /// Idempotent for an already-deleted row.
    ///
    /// # Errors
    /// Returns not-found when the lot code does not exist.
    pub fn soft_delete_tlc(&mut self, tlc_id: TlcId) -> StoreResult<()> {
        let updated = self.conn.execute(
            "UPDATE trace_lot_codes SET deleted_at = ?1 WHERE tlc_id = ?2 AND deleted_at IS NULL",
            params![now_rfc3339()?, tlc_id.to_string()],
        )?;
        if updated == 0 && !tlc_exists(&self.conn, tlc_id)? {
            return Err(LedgerError::not_found("trace lot code", tlc_id).into());
        }
        Ok(())
    }

    /// Append one critical tracking event to the ledger. Events are
    /// immutable once written; the only later mutation is a soft delete.
    ///
    /// # Errors
    /// Returns a validation error when the record violates its variant's
    /// clause, not-found when a referenced lot code or location is
    /// unresolved, or a storage error.
    pub fn append_cte(&mut self, record: &CteRecord) -> StoreResult<()> {
        record.validate(OffsetDateTime::now_utc().date())?;
        self.check_cte_references(record)?;

        let tx = self.conn.transaction()?;
        insert_cte_row(&tx, record)?;
        insert_payload(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    fn check_cte_references(&self, record: &CteRecord) -> StoreResult<()> {
        require_location(&self.conn, record.location)?;
        if let Some(tlc) = record.tlc {
            require_tlc(&self.conn, tlc)?;
        }
        if let Some(tlc_source) = record.tlc_source {
            require_location(&self.conn, tlc_source)?;
        }

        match &record.payload {
            CtePayload::Receive(fields) | CtePayload::ReceiveExempt(fields) => {
                require_location(&self.conn, fields.ips_location)?;
            }
            CtePayload::Ship(fields) => {
                require_location(&self.conn, fields.ship_to_location)?;
            }
            CtePayload::InitialPackSprouts(fields) => {
                let lineage = &fields.seed_lineage;
                require_tlc(&self.conn, lineage.seed_tlc)?;
                require_location(&self.conn, lineage.seed_conditioner_location)?;
                require_location(&self.conn, lineage.seed_packing_house_location)?;
                require_location(&self.conn, lineage.seed_supplier_location)?;
                if let Some(grower) = lineage.seed_grower_location {
                    require_location(&self.conn, grower)?;
                }
            }
            CtePayload::Transform(fields) => {
                require_tlc(&self.conn, fields.input_tlc)?;
                self.check_transform_availability(fields)?;
            }
            CtePayload::Harvest(_)
            | CtePayload::Cool(_)
            | CtePayload::InitialPackProduce(_)
            | CtePayload::InitialPackEggs(_)
            | CtePayload::FirstLandReceive(_) => {}
        }

        Ok(())
    }

    /// A transformation may not be dated before its input lot existed.
    /// The input lot's pack date (or, failing that, harvest date) stands
    /// in for its availability; lots carrying neither are not date-checked.
    fn check_transform_availability(&self, fields: &TransformFields) -> StoreResult<()> {
        let Some(input) = self.get_tlc(fields.input_tlc)? else {
            return Err(LedgerError::not_found("trace lot code", fields.input_tlc).into());
        };

        if let Some(available) = input.pack_date.or(input.harvest_date) {
            if fields.trans_date < available {
                return Err(LedgerError::Validation(format!(
                    "trans_date precedes availability of input lot {}",
                    fields.input_tlc
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Fetch one event by id, soft-deleted or not.
    ///
    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn get_cte(&self, cte_id: CteId) -> StoreResult<Option<CteRecord>> {
        let sql = format!("SELECT {CTE_COLUMNS} FROM ctes WHERE cte_id = ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let row = stmt
            .query_row(params![cte_id.to_string()], |row| CteRow::from_row(row))
            .optional()?;

        match row {
            Some(row) => Ok(Some(self.decode_cte_row(row)?)),
            None => Ok(None),
        }
    }

    /// List ledger events matching the filter, ordered by event date
    /// ascending. The result is finite and restartable; soft-deleted
    /// events are excluded unless the filter asks for them.
    ///
    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn list_ctes(&self, filter: &CteFilter) -> StoreResult<Vec<CteRecord>> {
        let columns = qualified_cte_columns("c");
        let sql = format!(
            "SELECT {columns} FROM ctes c
             LEFT JOIN trace_lot_codes t ON c.tlc = t.tlc_id
             WHERE (?1 IS NULL OR t.value = ?1)
               AND (?2 IS NULL OR c.location = ?2)
               AND (?3 IS NULL OR c.event_date >= ?3)
               AND (?4 IS NULL OR c.event_date <= ?4)
               AND (?5 = 1 OR c.deleted_at IS NULL)
             ORDER BY c.event_date ASC, c.created_at ASC, c.cte_id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                filter.tlc_value,
                filter.location.map(|location| location.to_string()),
                filter.date_from.map(fmt_date).transpose()?,
                filter.date_to.map(fmt_date).transpose()?,
                i64::from(filter.include_deleted),
            ],
            CteRow::from_row,
        )?;

        let mut records = Vec::new();
        for row in rows {
            records.push(self.decode_cte_row(row?)?);
        }
        Ok(records)
    }

    /// Soft-delete one event for record-retention purposes. The event
    /// stays resolvable by id so lineage never breaks. Idempotent for an
    /// already-deleted row.
    ///
    /// # Errors
    /// Returns not-found when the event does not exist.
    pub fn soft_delete_cte(&mut self, cte_id: CteId) -> StoreResult<()> {
        let updated = self.conn.execute(
            "UPDATE ctes SET deleted_at = ?1 WHERE cte_id = ?2 AND deleted_at IS NULL",
            params![now_rfc3339()?, cte_id.to_string()],
        )?;
        if updated == 0 {
            let exists = self.conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM ctes WHERE cte_id = ?1)",
                params![cte_id.to_string()],
                |row| row.get::<_, i64>(0),
            )?;
            if exists == 0 {
                return Err(LedgerError::not_found("critical tracking event", cte_id).into());
            }
        }
        Ok(())
    }

    /// Reconstruct the event lineage of one lot: every event referencing
    /// it, plus the events of each input lot reachable through
    /// transformation edges. Soft-deleted events are included; retention
    /// deletes never break lineage.
    ///
    /// # Errors
    /// Returns not-found when the starting lot code does not exist.
    pub fn trace_lineage(&self, tlc_id: TlcId) -> StoreResult<Vec<CteRecord>> {
        require_tlc(&self.conn, tlc_id)?;

        let mut visited: BTreeSet<TlcId> = BTreeSet::new();
        let mut queue = vec![tlc_id];
        let mut events: Vec<CteRecord> = Vec::new();

        while let Some(current) = queue.pop() {
            if !visited.insert(current) {
                continue;
            }

            let sql = format!(
                "SELECT {CTE_COLUMNS} FROM ctes WHERE tlc = ?1
                 ORDER BY event_date ASC, created_at ASC, cte_id ASC"
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params![current.to_string()], CteRow::from_row)?;
            for row in rows {
                let record = self.decode_cte_row(row?)?;
                if let CtePayload::Transform(fields) = &record.payload {
                    queue.push(fields.input_tlc);
                }
                events.push(record);
            }
        }

        events.sort_by(|lhs, rhs| {
            lhs.payload
                .event_date()
                .cmp(&rhs.payload.event_date())
                .then_with(|| lhs.created_at.cmp(&rhs.created_at))
                .then_with(|| lhs.cte_id.cmp(&rhs.cte_id))
        });
        Ok(events)
    }

    /// Persist one outbound shipment announcement. The status is forced
    /// to Pending; at most one Pending announcement may exist per
    /// (sscc, tlc, ship-to) key, enforced here at the only write path.
    ///
    /// # Errors
    /// Returns a validation error for a malformed announcement or a
    /// duplicate Pending key, not-found for unresolved references, or a
    /// storage error.
    pub fn create_announcement(
        &mut self,
        announcement: &ShipmentAnnouncement,
    ) -> StoreResult<ShipmentAnnouncement> {
        announcement.validate()?;
        require_tlc(&self.conn, announcement.tlc)?;
        require_location(&self.conn, announcement.ship_to_location)?;
        require_location(&self.conn, announcement.ship_from_location)?;
        if let Some(tlc_source) = announcement.tlc_source {
            require_location(&self.conn, tlc_source)?;
        }

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let key = announcement.key();
        let pending: i64 = tx.query_row(
            "SELECT COUNT(*) FROM shipment_announcements
             WHERE sscc IS ?1 AND tlc = ?2 AND ship_to_location = ?3
               AND status = 'pending' AND deleted_at IS NULL",
            params![key.sscc, key.tlc.to_string(), key.ship_to_location.to_string()],
            |row| row.get(0),
        )?;
        if pending > 0 {
            return Err(LedgerError::Validation(format!(
                "a pending announcement already exists for sscc={:?} tlc={} ship_to={}",
                key.sscc, key.tlc, key.ship_to_location
            ))
            .into());
        }

        let mut stored = announcement.clone();
        stored.status = AnnouncementStatus::Pending;
        stored.cte_receive = None;

        tx.execute(
            &format!(
                "INSERT INTO shipment_announcements({ANNOUNCEMENT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
            ),
            params![
                stored.announcement_id.to_string(),
                stored.sscc,
                stored.logistics_serial,
                stored.status.as_str(),
                stored.tlc.to_string(),
                stored.quantity,
                stored.unit.as_str(),
                stored.ftl_item.as_str(),
                stored.variety,
                stored.prod_desc,
                stored.ship_to_location.to_string(),
                stored.ship_from_location.to_string(),
                fmt_date(stored.ship_date)?,
                stored.tlc_source.map(|location| location.to_string()),
                stored.tlc_source_reference,
                stored.reference_doc_type,
                stored.reference_doc_num,
                Option::<String>::None,
                rfc3339(stored.created_at)?,
                stored.deleted_at.map(rfc3339).transpose()?,
            ],
        )?;

        tx.commit()?;
        Ok(stored)
    }

    /// Fetch one announcement by id.
    ///
    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn get_announcement(
        &self,
        announcement_id: AnnouncementId,
    ) -> StoreResult<Option<ShipmentAnnouncement>> {
        get_announcement_in(&self.conn, announcement_id)
    }

    /// Find the unique announcement matching the scan key in the given
    /// status. More than one row is a data-integrity violation: the
    /// uniqueness invariant was broken upstream, and the engine refuses
    /// to silently pick a row.
    ///
    /// # Errors
    /// Returns [`LedgerError::Integrity`] (logged with candidate ids) for
    /// a duplicated key, or a storage error.
    pub fn find_announcement(
        &self,
        key: &AnnouncementKey,
        status: AnnouncementStatus,
    ) -> StoreResult<Option<ShipmentAnnouncement>> {
        find_announcement_in(&self.conn, key, status)
    }

    /// Reconcile an inbound receiving scan against its announcement.
    ///
    /// Runs as one IMMEDIATE transaction so that two receivers racing on
    /// the same key serialize: exactly one observes the Pending row,
    /// writes the Receive event, and flips the status; the loser observes
    /// the Received row and gets `AlreadyExists`. The Receive event and
    /// the status transition commit together or not at all. A lock wait
    /// exceeding the busy timeout surfaces as [`StoreError::Busy`],
    /// distinct from the three reconciliation outcomes.
    ///
    /// # Errors
    /// Returns [`LedgerError::Integrity`] for a duplicated Pending key,
    /// [`StoreError::Busy`] on lock timeout, or a storage error.
    pub fn receive_shipment(
        &mut self,
        key: &AnnouncementKey,
        receive_date: Date,
        receive_time: Time,
    ) -> StoreResult<ReceiveOutcome> {
        let receive_location = key.ship_to_location;
        require_location(&self.conn, receive_location)?;

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let pending = find_announcement_in(&tx, key, AnnouncementStatus::Pending)?;
        let Some(announcement) = pending else {
            let received = find_announcement_in(&tx, key, AnnouncementStatus::Received)?;
            drop(tx);
            return match received {
                Some(announcement) => {
                    let Some(cte_receive) = announcement.cte_receive else {
                        return Err(LedgerError::Integrity(format!(
                            "received announcement {} has no linked receive event",
                            announcement.announcement_id
                        ))
                        .into());
                    };
                    Ok(ReceiveOutcome::AlreadyExists {
                        announcement_id: announcement.announcement_id,
                        cte_receive,
                    })
                }
                None => Ok(ReceiveOutcome::NotFound),
            };
        };

        let cte = receive_cte_for_announcement(
            &announcement,
            receive_location,
            receive_date,
            receive_time,
            OffsetDateTime::now_utc(),
        );
        insert_cte_row(&tx, &cte)?;
        insert_payload(&tx, &cte)?;

        let updated = tx.execute(
            "UPDATE shipment_announcements SET status = 'received', cte_receive = ?1
             WHERE announcement_id = ?2 AND status = 'pending'",
            params![cte.cte_id.to_string(), announcement.announcement_id.to_string()],
        )?;
        if updated != 1 {
            return Err(LedgerError::Integrity(format!(
                "announcement {} left pending state mid-transaction",
                announcement.announcement_id
            ))
            .into());
        }

        tx.commit()?;
        tracing::debug!(
            announcement_id = %announcement.announcement_id,
            cte_id = %cte.cte_id,
            "shipment reconciled"
        );
        Ok(ReceiveOutcome::Created {
            cte: Box::new(cte),
            announcement_id: announcement.announcement_id,
        })
    }

    /// Administrative Pending -> Cancelled transition, under the same
    /// serialization discipline as reconciliation. Terminal announcements
    /// refuse the transition.
    ///
    /// # Errors
    /// Returns not-found for an unknown announcement, a validation error
    /// for a non-Pending one, or a storage error.
    pub fn cancel_announcement(
        &mut self,
        announcement_id: AnnouncementId,
    ) -> StoreResult<ShipmentAnnouncement> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(mut announcement) = get_announcement_in(&tx, announcement_id)? else {
            return Err(LedgerError::not_found("shipment announcement", announcement_id).into());
        };
        if announcement.status != AnnouncementStatus::Pending {
            return Err(LedgerError::Validation(format!(
                "announcement {announcement_id} is {}; only pending announcements can be cancelled",
                announcement.status.as_str()
            ))
            .into());
        }

        let updated = tx.execute(
            "UPDATE shipment_announcements SET status = 'cancelled'
             WHERE announcement_id = ?1 AND status = 'pending'",
            params![announcement_id.to_string()],
        )?;
        if updated != 1 {
            return Err(LedgerError::Integrity(format!(
                "announcement {announcement_id} left pending state mid-transaction"
            ))
            .into());
        }

        tx.commit()?;
        announcement.status = AnnouncementStatus::Cancelled;
        Ok(announcement)
    }

    /// Run quick-check, foreign-key-check, schema status, and the
    /// duplicate-Pending-key probe.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> StoreResult<IntegrityReport> {
        let quick_check_message: String =
            self.conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;

        let mut stmt = self.conn.prepare("PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;
        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let mut stmt = self.conn.prepare(
            "SELECT sscc, tlc, ship_to_location, COUNT(*) FROM shipment_announcements
             WHERE status = 'pending' AND deleted_at IS NULL
             GROUP BY sscc, tlc, ship_to_location
             HAVING COUNT(*) > 1",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DuplicatePendingKey {
                sscc: row.get(0)?,
                tlc: row.get(1)?,
                ship_to_location: row.get(2)?,
                pending_rows: row.get(3)?,
            })
        })?;
        let mut duplicate_pending_keys = Vec::new();
        for row in rows {
            duplicate_pending_keys.push(row?);
        }

        if !duplicate_pending_keys.is_empty() {
            tracing::error!(
                keys = ?duplicate_pending_keys,
                "duplicate pending announcement keys detected"
            );
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            duplicate_pending_keys,
            schema_status,
        })
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or the
    /// backup fails.
    pub fn backup_database(&self, out_file: &Path) -> StoreResult<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                StoreError::internal(format!(
                    "failed to create parent directory for backup file {}: {err}",
                    out_file.display()
                ))
            })?;
        }

        self.conn.backup(DatabaseName::Main, out_file, None).map_err(|err| {
            StoreError::internal(format!(
                "failed to create sqlite backup at {}: {err}",
                out_file.display()
            ))
        })
    }

    /// Restore this database from a `SQLite` backup file, then migrate to
    /// the latest schema.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails,
    /// or migration fails.
    pub fn restore_database(&mut self, in_file: &Path) -> StoreResult<()> {
        if !in_file.exists() {
            return Err(StoreError::internal(format!(
                "backup file does not exist: {}",
                in_file.display()
            )));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .map_err(|err| {
                StoreError::internal(format!(
                    "failed to restore sqlite backup from {}: {err}",
                    in_file.display()
                ))
            })?;

        self.migrate()?;
        Ok(())
    }

    fn decode_cte_row(&self, row: CteRow) -> StoreResult<CteRecord> {
        let cte_type = CteType::parse(&row.cte_type)
            .ok_or_else(|| StoreError::internal(format!("unknown cte_type: {}", row.cte_type)))?;
        let cte_id = CteId(parse_ulid(&row.cte_id)?);
        let payload = load_payload(&self.conn, cte_id, cte_type)?;

        Ok(CteRecord {
            cte_id,
            ftl_item: FtlItem::parse(&row.ftl_item)
                .ok_or_else(|| StoreError::internal(format!("unknown ftl_item: {}", row.ftl_item)))?,
            location: LocationId(parse_ulid(&row.location)?),
            prod_desc: row.prod_desc,
            variety: row.variety,
            tlc: row.tlc.as_deref().map(parse_ulid).transpose()?.map(TlcId),
            quantity: row.quantity,
            unit: UnitOfMeasure::parse(&row.unit)
                .ok_or_else(|| StoreError::internal(format!("unknown unit: {}", row.unit)))?,
            tlc_source: row.tlc_source.as_deref().map(parse_ulid).transpose()?.map(LocationId),
            tlc_source_reference: row.tlc_source_reference,
            reference_doc_type: row.reference_doc_type,
            reference_doc_num: row.reference_doc_num,
            payload,
            created_at: parse_rfc3339(&row.created_at)?,
            deleted_at: row.deleted_at.as_deref().map(parse_rfc3339).transpose()?,
        })
    }
}

#[derive(Debug)]
struct TlcRow {
    tlc_id: String,
    value: String,
    gtin: Option<String>,
    batch_lot: Option<String>,
    sscc: Option<String>,
    pack_date: Option<String>,
    harvest_date: Option<String>,
    best_by_date: Option<String>,
    logistics_serial: Option<String>,
    source_location: Option<String>,
    source_reference: Option<String>,
    created_at: String,
    deleted_at: Option<String>,
}

fn decode_tlc_row(row: TlcRow) -> StoreResult<TraceabilityLotCode> {
    let source = match (&row.source_location, &row.source_reference) {
        (Some(raw), None) => TlcSource::Location(LocationId(parse_ulid(raw)?)),
        (None, Some(reference)) => TlcSource::Reference(reference.clone()),
        _ => {
            return Err(StoreError::internal(format!(
                "trace lot code {} has an invalid source pairing",
                row.tlc_id
            )));
        }
    };

    Ok(TraceabilityLotCode {
        tlc_id: TlcId(parse_ulid(&row.tlc_id)?),
        value: row.value,
        gtin: row.gtin,
        batch_lot: row.batch_lot,
        sscc: row.sscc,
        pack_date: row.pack_date.as_deref().map(parse_date).transpose()?,
        harvest_date: row.harvest_date.as_deref().map(parse_date).transpose()?,
        best_by_date: row.best_by_date.as_deref().map(parse_date).transpose()?,
        logistics_serial: row.logistics_serial,
        source,
        created_at: parse_rfc3339(&row.created_at)?,
        deleted_at: row.deleted_at.as_deref().map(parse_rfc3339).transpose()?,
    })
}

#[derive(Debug)]
struct CteRow {
    cte_id: String,
    cte_type: String,
    ftl_item: String,
    location: String,
    prod_desc: String,
    variety: Option<String>,
    tlc: Option<String>,
    quantity: f64,
    unit: String,
    tlc_source: Option<String>,
    tlc_source_reference: Option<String>,
    reference_doc_type: String,
    reference_doc_num: String,
    created_at: String,
    deleted_at: Option<String>,
}

impl CteRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            cte_id: row.get(0)?,
            cte_type: row.get(1)?,
            ftl_item: row.get(2)?,
            location: row.get(3)?,
            prod_desc: row.get(4)?,
            variety: row.get(5)?,
            tlc: row.get(6)?,
            quantity: row.get(7)?,
            unit: row.get(8)?,
            tlc_source: row.get(9)?,
            tlc_source_reference: row.get(10)?,
            reference_doc_type: row.get(11)?,
            reference_doc_num: row.get(12)?,
            created_at: row.get(13)?,
            deleted_at: row.get(14)?,
        })
    }
}

fn insert_cte_row(conn: &Connection, record: &CteRecord) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO ctes(
            cte_id, cte_type, ftl_item, location, prod_desc, variety, tlc, quantity, unit,
            tlc_source, tlc_source_reference, reference_doc_type, reference_doc_num,
            event_date, created_at, deleted_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            record.cte_id.to_string(),
            record.payload.cte_type().as_str(),
            record.ftl_item.as_str(),
            record.location.to_string(),
            record.prod_desc,
            record.variety,
            record.tlc.map(|tlc| tlc.to_string()),
            record.quantity,
            record.unit.as_str(),
            record.tlc_source.map(|location| location.to_string()),
            record.tlc_source_reference,
            record.reference_doc_type,
            record.reference_doc_num,
            fmt_date(record.payload.event_date())?,
            rfc3339(record.created_at)?,
            record.deleted_at.map(rfc3339).transpose()?,
        ],
    )?;
    Ok(())
}

fn insert_payload(conn: &Connection, record: &CteRecord) -> StoreResult<()> {
    let cte_id = record.cte_id.to_string();
    match &record.payload {
        CtePayload::Harvest(fields) => {
            conn.execute(
                "INSERT INTO harvest_payloads(cte_id, harvest_date, field_name) VALUES (?1, ?2, ?3)",
                params![cte_id, fmt_date(fields.harvest_date)?, fields.field_name],
            )?;
        }
        CtePayload::Cool(fields) => {
            conn.execute(
                "INSERT INTO cool_payloads(cte_id, cool_date) VALUES (?1, ?2)",
                params![cte_id, fmt_date(fields.cool_date)?],
            )?;
        }
        CtePayload::InitialPackProduce(fields) | CtePayload::InitialPackEggs(fields) => {
            conn.execute(
                "INSERT INTO initial_pack_payloads(cte_id, pack_date, harvest_date)
                 VALUES (?1, ?2, ?3)",
                params![cte_id, fmt_date(fields.pack_date)?, fields.harvest_date.map(fmt_date).transpose()?],
            )?;
        }
        CtePayload::InitialPackSprouts(fields) => {
            let lineage = &fields.seed_lineage;
            conn.execute(
                "INSERT INTO initial_pack_payloads(
                    cte_id, pack_date, seed_grower_location, seed_harvesting_date,
                    seed_conditioner_location, seed_tlc, seed_packing_house_location,
                    seed_supplier_location
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    cte_id,
                    fmt_date(fields.pack_date)?,
                    lineage.seed_grower_location.map(|location| location.to_string()),
                    lineage.seed_harvesting_date.map(fmt_date).transpose()?,
                    lineage.seed_conditioner_location.to_string(),
                    lineage.seed_tlc.to_string(),
                    lineage.seed_packing_house_location.to_string(),
                    lineage.seed_supplier_location.to_string(),
                ],
            )?;
        }
        CtePayload::FirstLandReceive(fields) => {
            conn.execute(
                "INSERT INTO first_land_receive_payloads(
                    cte_id, landed_date, harvest_date_begin, harvest_date_end
                ) VALUES (?1, ?2, ?3, ?4)",
                params![
                    cte_id,
                    fmt_date(fields.landed_date)?,
                    fmt_date(fields.harvest_date_begin)?,
                    fmt_date(fields.harvest_date_end)?,
                ],
            )?;
        }
        CtePayload::Receive(fields) | CtePayload::ReceiveExempt(fields) => {
            conn.execute(
                "INSERT INTO receive_payloads(cte_id, receive_date, receive_time, ips_location)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    cte_id,
                    fmt_date(fields.receive_date)?,
                    fmt_time(fields.receive_time)?,
                    fields.ips_location.to_string(),
                ],
            )?;
        }
        CtePayload::Ship(fields) => {
            conn.execute(
                "INSERT INTO ship_payloads(cte_id, ship_date, ship_to_location) VALUES (?1, ?2, ?3)",
                params![cte_id, fmt_date(fields.ship_date)?, fields.ship_to_location.to_string()],
            )?;
        }
        CtePayload::Transform(fields) => {
            conn.execute(
                "INSERT INTO transform_payloads(
                    cte_id, trans_date, input_tlc, input_quantity, input_unit
                ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    cte_id,
                    fmt_date(fields.trans_date)?,
                    fields.input_tlc.to_string(),
                    fields.input_quantity,
                    fields.input_unit.as_str(),
                ],
            )?;
        }
    }

    Ok(())
}

fn load_payload(conn: &Connection, cte_id: CteId, cte_type: CteType) -> StoreResult<CtePayload> {
    let id = cte_id.to_string();
    match cte_type {
        CteType::Harvest => {
            let (harvest_date, field_name) = conn
                .query_row(
                    "SELECT harvest_date, field_name FROM harvest_payloads WHERE cte_id = ?1",
                    params![id],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
                )
                .optional()?
                .ok_or_else(|| missing_payload(cte_id, cte_type))?;
            Ok(CtePayload::Harvest(HarvestFields {
                harvest_date: parse_date(&harvest_date)?,
                field_name,
            }))
        }
        CteType::Cool => {
            let cool_date = conn
                .query_row(
                    "SELECT cool_date FROM cool_payloads WHERE cte_id = ?1",
                    params![id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
                .ok_or_else(|| missing_payload(cte_id, cte_type))?;
            Ok(CtePayload::Cool(CoolFields { cool_date: parse_date(&cool_date)? }))
        }
        CteType::InitialPackProduce | CteType::InitialPackEggs => {
            let (pack_date, harvest_date) = conn
                .query_row(
                    "SELECT pack_date, harvest_date FROM initial_pack_payloads WHERE cte_id = ?1",
                    params![id],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
                )
                .optional()?
                .ok_or_else(|| missing_payload(cte_id, cte_type))?;
            let fields = InitialPackFields {
                pack_date: parse_date(&pack_date)?,
                harvest_date: harvest_date.as_deref().map(parse_date).transpose()?,
            };
            if cte_type == CteType::InitialPackProduce {
                Ok(CtePayload::InitialPackProduce(fields))
            } else {
                Ok(CtePayload::InitialPackEggs(fields))
            }
        }
        CteType::InitialPackSprouts => {
            let row = conn
                .query_row(
                    "SELECT pack_date, seed_grower_location, seed_harvesting_date,
                            seed_conditioner_location, seed_tlc, seed_packing_house_location,
                            seed_supplier_location
                     FROM initial_pack_payloads WHERE cte_id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, Option<String>>(6)?,
                        ))
                    },
                )
                .optional()?
                .ok_or_else(|| missing_payload(cte_id, cte_type))?;
            let (pack_date, grower, harvesting, conditioner, seed_tlc, packing_house, supplier) =
                row;
            let (Some(conditioner), Some(seed_tlc), Some(packing_house), Some(supplier)) =
                (conditioner, seed_tlc, packing_house, supplier)
            else {
                return Err(StoreError::internal(format!(
                    "sprouts payload for {cte_id} is missing mandatory seed lineage columns"
                )));
            };
            Ok(CtePayload::InitialPackSprouts(InitialPackSproutsFields {
                pack_date: parse_date(&pack_date)?,
                seed_lineage: SproutSeedLineage {
                    seed_grower_location: grower
                        .as_deref()
                        .map(parse_ulid)
                        .transpose()?
                        .map(LocationId),
                    seed_harvesting_date: harvesting.as_deref().map(parse_date).transpose()?,
                    seed_conditioner_location: LocationId(parse_ulid(&conditioner)?),
                    seed_tlc: TlcId(parse_ulid(&seed_tlc)?),
                    seed_packing_house_location: LocationId(parse_ulid(&packing_house)?),
                    seed_supplier_location: LocationId(parse_ulid(&supplier)?),
                },
            }))
        }
        CteType::FirstLandReceive => {
            let (landed, begin, end) = conn
                .query_row(
                    "SELECT landed_date, harvest_date_begin, harvest_date_end
                     FROM first_land_receive_payloads WHERE cte_id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?
                .ok_or_else(|| missing_payload(cte_id, cte_type))?;
            Ok(CtePayload::FirstLandReceive(FirstLandReceiveFields {
                landed_date: parse_date(&landed)?,
                harvest_date_begin: parse_date(&begin)?,
                harvest_date_end: parse_date(&end)?,
            }))
        }
        CteType::Receive | CteType::ReceiveExempt => {
            let (receive_date, receive_time, ips_location) = conn
                .query_row(
                    "SELECT receive_date, receive_time, ips_location
                     FROM receive_payloads WHERE cte_id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?
                .ok_or_else(|| missing_payload(cte_id, cte_type))?;
            let fields = ReceiveFields {
                receive_date: parse_date(&receive_date)?,
                receive_time: parse_time(&receive_time)?,
                ips_location: LocationId(parse_ulid(&ips_location)?),
            };
            if cte_type == CteType::Receive {
                Ok(CtePayload::Receive(fields))
            } else {
                Ok(CtePayload::ReceiveExempt(fields))
            }
        }
        CteType::Ship => {
            let (ship_date, ship_to) = conn
                .query_row(
                    "SELECT ship_date, ship_to_location FROM ship_payloads WHERE cte_id = ?1",
                    params![id],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?
                .ok_or_else(|| missing_payload(cte_id, cte_type))?;
            Ok(CtePayload::Ship(ShipFields {
                ship_date: parse_date(&ship_date)?,
                ship_to_location: LocationId(parse_ulid(&ship_to)?),
            }))
        }
        CteType::Transform => {
            let (trans_date, input_tlc, input_quantity, input_unit) = conn
                .query_row(
                    "SELECT trans_date, input_tlc, input_quantity, input_unit
                     FROM transform_payloads WHERE cte_id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, f64>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?
                .ok_or_else(|| missing_payload(cte_id, cte_type))?;
            Ok(CtePayload::Transform(TransformFields {
                trans_date: parse_date(&trans_date)?,
                input_tlc: TlcId(parse_ulid(&input_tlc)?),
                input_quantity,
                input_unit: UnitOfMeasure::parse(&input_unit)
                    .ok_or_else(|| StoreError::internal(format!("unknown unit: {input_unit}")))?,
            }))
        }
    }
}

fn missing_payload(cte_id: CteId, cte_type: CteType) -> StoreError {
    StoreError::internal(format!("missing {} payload for {cte_id}", cte_type.as_str()))
}

// The ledger/lot-code join shares created_at/deleted_at column names, so
// joined queries need the ledger side spelled out per alias.
fn qualified_cte_columns(alias: &str) -> String {
    CTE_COLUMNS
        .split(", ")
        .map(|column| format!("{alias}.{column}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn get_announcement_in(
    conn: &Connection,
    announcement_id: AnnouncementId,
) -> StoreResult<Option<ShipmentAnnouncement>> {
    let sql =
        format!("SELECT {ANNOUNCEMENT_COLUMNS} FROM shipment_announcements WHERE announcement_id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let row = stmt
        .query_row(params![announcement_id.to_string()], AnnouncementRow::from_row)
        .optional()?;
    row.map(decode_announcement_row).transpose()
}

fn find_announcement_in(
    conn: &Connection,
    key: &AnnouncementKey,
    status: AnnouncementStatus,
) -> StoreResult<Option<ShipmentAnnouncement>> {
    let sql = format!(
        "SELECT {ANNOUNCEMENT_COLUMNS} FROM shipment_announcements
         WHERE sscc IS ?1 AND tlc = ?2 AND ship_to_location = ?3 AND status = ?4
           AND deleted_at IS NULL
         ORDER BY announcement_id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![key.sscc, key.tlc.to_string(), key.ship_to_location.to_string(), status.as_str()],
        AnnouncementRow::from_row,
    )?;

    let mut matches = Vec::new();
    for row in rows {
        matches.push(decode_announcement_row(row?)?);
    }

    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.pop()),
        found => {
            let candidates = matches
                .iter()
                .map(|announcement| announcement.announcement_id.to_string())
                .collect::<Vec<_>>();
            tracing::error!(
                sscc = ?key.sscc,
                tlc = %key.tlc,
                ship_to_location = %key.ship_to_location,
                status = status.as_str(),
                candidates = ?candidates,
                "announcement uniqueness invariant violated"
            );
            Err(LedgerError::Integrity(format!(
                "found {found} {} announcements for one matching key; candidates: {}",
                status.as_str(),
                candidates.join(", ")
            ))
            .into())
        }
    }
}

#[derive(Debug)]
struct AnnouncementRow {
    announcement_id: String,
    sscc: Option<String>,
    logistics_serial: Option<String>,
    status: String,
    tlc: String,
    quantity: f64,
    unit: String,
    ftl_item: String,
    variety: Option<String>,
    prod_desc: String,
    ship_to_location: String,
    ship_from_location: String,
    ship_date: String,
    tlc_source: Option<String>,
    tlc_source_reference: Option<String>,
    reference_doc_type: String,
    reference_doc_num: String,
    cte_receive: Option<String>,
    created_at: String,
    deleted_at: Option<String>,
}

impl AnnouncementRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            announcement_id: row.get(0)?,
            sscc: row.get(1)?,
            logistics_serial: row.get(2)?,
            status: row.get(3)?,
            tlc: row.get(4)?,
            quantity: row.get(5)?,
            unit: row.get(6)?,
            ftl_item: row.get(7)?,
            variety: row.get(8)?,
            prod_desc: row.get(9)?,
            ship_to_location: row.get(10)?,
            ship_from_location: row.get(11)?,
            ship_date: row.get(12)?,
            tlc_source: row.get(13)?,
            tlc_source_reference: row.get(14)?,
            reference_doc_type: row.get(15)?,
            reference_doc_num: row.get(16)?,
            cte_receive: row.get(17)?,
            created_at: row.get(18)?,
            deleted_at: row.get(19)?,
        })
    }
}

fn decode_announcement_row(row: AnnouncementRow) -> StoreResult<ShipmentAnnouncement> {
    Ok(ShipmentAnnouncement {
        announcement_id: AnnouncementId(parse_ulid(&row.announcement_id)?),
        sscc: row.sscc,
        logistics_serial: row.logistics_serial,
        status: AnnouncementStatus::parse(&row.status)
            .ok_or_else(|| StoreError::internal(format!("unknown status: {}", row.status)))?,
        tlc: TlcId(parse_ulid(&row.tlc)?),
        quantity: row.quantity,
        unit: UnitOfMeasure::parse(&row.unit)
            .ok_or_else(|| StoreError::internal(format!("unknown unit: {}", row.unit)))?,
        ftl_item: FtlItem::parse(&row.ftl_item)
            .ok_or_else(|| StoreError::internal(format!("unknown ftl_item: {}", row.ftl_item)))?,
        variety: row.variety,
        prod_desc: row.prod_desc,
        ship_to_location: LocationId(parse_ulid(&row.ship_to_location)?),
        ship_from_location: LocationId(parse_ulid(&row.ship_from_location)?),
        ship_date: parse_date(&row.ship_date)?,
        tlc_source: row.tlc_source.as_deref().map(parse_ulid).transpose()?.map(LocationId),
        tlc_source_reference: row.tlc_source_reference,
        reference_doc_type: row.reference_doc_type,
        reference_doc_num: row.reference_doc_num,
        cte_receive: row.cte_receive.as_deref().map(parse_ulid).transpose()?.map(CteId),
        created_at: parse_rfc3339(&row.created_at)?,
        deleted_at: row.deleted_at.as_deref().map(parse_rfc3339).transpose()?,
    })
}

fn location_exists(conn: &Connection, location_id: LocationId) -> StoreResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM locations WHERE location_id = ?1)",
        params![location_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn require_location(conn: &Connection, location_id: LocationId) -> StoreResult<()> {
    if location_exists(conn, location_id)? {
        return Ok(());
    }
    Err(LedgerError::not_found("location", location_id).into())
}

fn tlc_exists(conn: &Connection, tlc_id: TlcId) -> StoreResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM trace_lot_codes WHERE tlc_id = ?1)",
        params![tlc_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn require_tlc(conn: &Connection, tlc_id: TlcId) -> StoreResult<()> {
    if tlc_exists(conn, tlc_id)? {
        return Ok(());
    }
    Err(LedgerError::not_found("trace lot code", tlc_id).into())
}

fn current_schema_version(conn: &Connection) -> StoreResult<i64> {
    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> StoreResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now_rfc3339()?],
    )?;
    Ok(())
}

fn date_items() -> &'static [FormatItem<'static>] {
    static ITEMS: OnceLock<Vec<FormatItem<'static>>> = OnceLock::new();
    ITEMS.get_or_init(|| {
        time::format_description::parse("[year]-[month]-[day]").unwrap_or_default()
    })
}

fn time_items() -> &'static [FormatItem<'static>] {
    static ITEMS: OnceLock<Vec<FormatItem<'static>>> = OnceLock::new();
    ITEMS.get_or_init(|| {
        time::format_description::parse("[hour]:[minute]:[second]").unwrap_or_default()
    })
}

fn fmt_date(value: Date) -> StoreResult<String> {
    value
        .format(date_items())
        .map_err(|err| StoreError::internal(format!("failed to format date: {err}")))
}

fn parse_date(value: &str) -> StoreResult<Date> {
    Date::parse(value, date_items())
        .map_err(|err| StoreError::internal(format!("invalid date `{value}`: {err}")))
}

fn fmt_time(value: Time) -> StoreResult<String> {
    value
        .format(time_items())
        .map_err(|err| StoreError::internal(format!("failed to format time: {err}")))
}

fn parse_time(value: &str) -> StoreResult<Time> {
    Time::parse(value, time_items())
        .map_err(|err| StoreError::internal(format!("invalid time `{value}`: {err}")))
}

fn now_rfc3339() -> StoreResult<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> StoreResult<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| StoreError::internal(format!("failed to format RFC3339 timestamp: {err}")))
}

fn parse_rfc3339(value: &str) -> StoreResult<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| StoreError::internal(format!("invalid RFC3339 timestamp `{value}`: {err}")))
}

fn parse_ulid(raw: &str) -> StoreResult<Ulid> {
    Ulid::from_str(raw).map_err(|err| StoreError::internal(format!("invalid ULID `{raw}`: {err}")))
}

#[cfg(test)]
mod tests {
    use std::thread;

    use time::Month;

    use super::*;

    fn fixture_date(year: i32, month: Month, day: u8) -> Date {
        match Date::from_calendar_date(year, month, day) {
            Ok(date) => date,
            Err(err) => panic!("invalid fixture date {year}-{month:?}-{day}: {err}"),
        }
    }

    fn fixture_time_of_day() -> Time {
        match Time::from_hms(9, 30, 0) {
            Ok(time) => time,
            Err(err) => panic!("invalid fixture time: {err}"),
        }
    }

    fn open_store() -> StoreResult<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn register_fixture_location(store: &mut SqliteStore, name: &str) -> StoreResult<LocationId> {
        let location = Location {
            location_id: LocationId::new(),
            name: name.to_string(),
            city: Some("Salinas".to_string()),
        };
        store.register_location(&location)?;
        Ok(location.location_id)
    }

    fn create_fixture_tlc(store: &mut SqliteStore, source: LocationId) -> StoreResult<TlcId> {
        let tlc = TraceabilityLotCode {
            tlc_id: TlcId::new(),
            value: format!("LOT-{}", Ulid::new()),
            gtin: Some("00812345678901".to_string()),
            batch_lot: Some("B-7".to_string()),
            sscc: None,
            pack_date: Some(fixture_date(2024, Month::October, 14)),
            harvest_date: Some(fixture_date(2024, Month::October, 12)),
            best_by_date: None,
            logistics_serial: None,
            source: TlcSource::Location(source),
            created_at: OffsetDateTime::now_utc(),
            deleted_at: None,
        };
        store.create_tlc(&tlc)?;
        Ok(tlc.tlc_id)
    }

    fn mk_fixture_announcement(
        sscc: &str,
        tlc: TlcId,
        ship_to: LocationId,
        ship_from: LocationId,
    ) -> ShipmentAnnouncement {
        ShipmentAnnouncement {
            announcement_id: AnnouncementId::new(),
            sscc: Some(sscc.to_string()),
            logistics_serial: Some("LS-1".to_string()),
            status: AnnouncementStatus::Pending,
            tlc,
            quantity: 12.0,
            unit: UnitOfMeasure::Case,
            ftl_item: FtlItem::LeafyGreens,
            variety: Some("romaine".to_string()),
            prod_desc: "romaine lettuce".to_string(),
            ship_to_location: ship_to,
            ship_from_location: ship_from,
            ship_date: fixture_date(2024, Month::October, 17),
            tlc_source: Some(ship_from),
            tlc_source_reference: None,
            reference_doc_type: "bol".to_string(),
            reference_doc_num: "BOL-77".to_string(),
            cte_receive: None,
            created_at: OffsetDateTime::now_utc(),
            deleted_at: None,
        }
    }

    fn mk_ship_record(tlc: TlcId, from: LocationId, to: LocationId) -> CteRecord {
        CteRecord {
            cte_id: CteId::new(),
            ftl_item: FtlItem::LeafyGreens,
            location: from,
            prod_desc: "romaine lettuce".to_string(),
            variety: Some("romaine".to_string()),
            tlc: Some(tlc),
            quantity: 12.0,
            unit: UnitOfMeasure::Case,
            tlc_source: Some(from),
            tlc_source_reference: None,
            reference_doc_type: "bol".to_string(),
            reference_doc_num: "BOL-77".to_string(),
            payload: CtePayload::Ship(ShipFields {
                ship_date: fixture_date(2024, Month::October, 17),
                ship_to_location: to,
            }),
            created_at: OffsetDateTime::now_utc(),
            deleted_at: None,
        }
    }

    const TEST_SSCC: &str = "001234567890123456";

    fn scan_key(sscc: &str, tlc: TlcId, ship_to: LocationId) -> AnnouncementKey {
        AnnouncementKey { sscc: Some(sscc.to_string()), tlc, ship_to_location: ship_to }
    }

    // Test IDs: TDB-001
    #[test]
    fn schema_checks_reject_invalid_enum_values() -> StoreResult<()> {
        let store = open_store()?;
        let result = store.conn.execute(
            "INSERT INTO ctes(
                cte_id, cte_type, ftl_item, location, prod_desc, variety, tlc, quantity, unit,
                tlc_source, tlc_source_reference, reference_doc_type, reference_doc_num,
                event_date, created_at, deleted_at
            ) VALUES (?1, 'not_a_cte_type', 'leafy_greens', ?2, 'x', NULL, NULL, 1.0, 'case',
                      NULL, NULL, 'bol', 'B-1', '2024-10-17', '2024-10-17T00:00:00Z', NULL)",
            params![CteId::new().to_string(), LocationId::new().to_string()],
        );
        assert!(result.is_err());
        Ok(())
    }

    // Test IDs: TDB-002
    #[test]
    fn foreign_keys_reject_unknown_references() -> StoreResult<()> {
        let store = open_store()?;
        let result = store.conn.execute(
            &format!(
                "INSERT INTO shipment_announcements({ANNOUNCEMENT_COLUMNS})
                 VALUES (?1, NULL, NULL, 'pending', ?2, 1.0, 'case', 'leafy_greens', NULL, 'x',
                         ?3, ?4, '2024-10-17', NULL, NULL, 'bol', 'B-1', NULL,
                         '2024-10-17T00:00:00Z', NULL)"
            ),
            params![
                AnnouncementId::new().to_string(),
                TlcId::new().to_string(),
                LocationId::new().to_string(),
                LocationId::new().to_string(),
            ],
        );
        assert!(result.is_err());
        Ok(())
    }

    // Test IDs: TDB-003
    #[test]
    fn tlc_create_and_get_round_trip() -> StoreResult<()> {
        let mut store = open_store()?;
        let source = register_fixture_location(&mut store, "Rivera Farms")?;
        let tlc_id = create_fixture_tlc(&mut store, source)?;

        let Some(loaded) = store.get_tlc(tlc_id)? else {
            panic!("tlc should be resolvable after creation");
        };
        assert_eq!(loaded.tlc_id, tlc_id);
        assert_eq!(loaded.source, TlcSource::Location(source));
        assert_eq!(loaded.harvest_date, Some(fixture_date(2024, Month::October, 12)));
        Ok(())
    }

    // Test IDs: TDB-004
    #[test]
    fn tlc_create_rejects_unknown_source_location() -> StoreResult<()> {
        let mut store = open_store()?;
        let tlc = TraceabilityLotCode {
            tlc_id: TlcId::new(),
            value: "LOT-1".to_string(),
            gtin: None,
            batch_lot: None,
            sscc: None,
            pack_date: None,
            harvest_date: None,
            best_by_date: None,
            logistics_serial: None,
            source: TlcSource::Location(LocationId::new()),
            created_at: OffsetDateTime::now_utc(),
            deleted_at: None,
        };
        let result = store.create_tlc(&tlc);
        assert!(matches!(
            result,
            Err(StoreError::Domain(LedgerError::NotFound { entity: "location", .. }))
        ));
        Ok(())
    }

    // Test IDs: TDB-005
    #[test]
    fn tlc_source_pairing_is_checked_at_the_schema_level() -> StoreResult<()> {
        let store = open_store()?;
        let result = store.conn.execute(
            "INSERT INTO trace_lot_codes(
                tlc_id, value, source_location, source_reference, created_at
             ) VALUES (?1, 'LOT-X', NULL, NULL, '2024-10-17T00:00:00Z')",
            params![TlcId::new().to_string()],
        );
        assert!(result.is_err());
        Ok(())
    }

    // Test IDs: TLED-001
    #[test]
    fn append_rejects_unresolved_lot_code_reference() -> StoreResult<()> {
        let mut store = open_store()?;
        let from = register_fixture_location(&mut store, "Rivera Farms")?;
        let to = register_fixture_location(&mut store, "Valley DC")?;

        let record = mk_ship_record(TlcId::new(), from, to);
        let result = store.append_cte(&record);
        assert!(matches!(
            result,
            Err(StoreError::Domain(LedgerError::NotFound { entity: "trace lot code", .. }))
        ));
        Ok(())
    }

    // Test IDs: TLED-002
    #[test]
    fn append_rejects_unresolved_location_reference() -> StoreResult<()> {
        let mut store = open_store()?;
        let from = register_fixture_location(&mut store, "Rivera Farms")?;
        let tlc = create_fixture_tlc(&mut store, from)?;

        let record = mk_ship_record(tlc, from, LocationId::new());
        let result = store.append_cte(&record);
        assert!(matches!(
            result,
            Err(StoreError::Domain(LedgerError::NotFound { entity: "location", .. }))
        ));
        Ok(())
    }

    // Test IDs: TLED-003
    #[test]
    fn sprouts_payload_round_trips_seed_lineage() -> StoreResult<()> {
        let mut store = open_store()?;
        let packer = register_fixture_location(&mut store, "Sprout House")?;
        let conditioner = register_fixture_location(&mut store, "Seed Conditioning Co")?;
        let packing_house = register_fixture_location(&mut store, "Seed Packing House")?;
        let supplier = register_fixture_location(&mut store, "Seed Supplier")?;
        let seed_tlc = create_fixture_tlc(&mut store, supplier)?;
        let output_tlc = create_fixture_tlc(&mut store, packer)?;

        let record = CteRecord {
            cte_id: CteId::new(),
            ftl_item: FtlItem::Sprouts,
            location: packer,
            prod_desc: "alfalfa sprouts".to_string(),
            variety: Some("alfalfa".to_string()),
            tlc: Some(output_tlc),
            quantity: 200.0,
            unit: UnitOfMeasure::Carton,
            tlc_source: Some(packer),
            tlc_source_reference: None,
            reference_doc_type: "pack_order".to_string(),
            reference_doc_num: "PO-12".to_string(),
            payload: CtePayload::InitialPackSprouts(InitialPackSproutsFields {
                pack_date: fixture_date(2024, Month::October, 16),
                seed_lineage: SproutSeedLineage {
                    seed_grower_location: None,
                    seed_harvesting_date: Some(fixture_date(2024, Month::September, 2)),
                    seed_conditioner_location: conditioner,
                    seed_tlc,
                    seed_packing_house_location: packing_house,
                    seed_supplier_location: supplier,
                },
            }),
            created_at: OffsetDateTime::now_utc(),
            deleted_at: None,
        };

        store.append_cte(&record)?;
        let Some(loaded) = store.get_cte(record.cte_id)? else {
            panic!("sprouts event should be resolvable after append");
        };
        let CtePayload::InitialPackSprouts(fields) = &loaded.payload else {
            panic!("loaded payload should be initial_pack_sprouts");
        };
        assert_eq!(fields.seed_lineage.seed_tlc, seed_tlc);
        assert_eq!(fields.seed_lineage.seed_conditioner_location, conditioner);
        assert_eq!(fields.seed_lineage.seed_grower_location, None);
        Ok(())
    }

    // Test IDs: TLED-004
    #[test]
    fn list_orders_by_event_date_and_honors_filters() -> StoreResult<()> {
        let mut store = open_store()?;
        let farm = register_fixture_location(&mut store, "Rivera Farms")?;
        let dc = register_fixture_location(&mut store, "Valley DC")?;
        let tlc = create_fixture_tlc(&mut store, farm)?;

        let mut cool = mk_ship_record(tlc, farm, dc);
        cool.payload = CtePayload::Cool(CoolFields {
            cool_date: fixture_date(2024, Month::October, 13),
        });
        store.append_cte(&cool)?;

        let ship = mk_ship_record(tlc, farm, dc);
        store.append_cte(&ship)?;

        let listed = store.list_ctes(&CteFilter::default())?;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].payload.cte_type(), CteType::Cool);
        assert_eq!(listed[1].payload.cte_type(), CteType::Ship);

        let filtered = store.list_ctes(&CteFilter {
            date_from: Some(fixture_date(2024, Month::October, 15)),
            ..CteFilter::default()
        })?;
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].payload.cte_type(), CteType::Ship);

        let by_location = store.list_ctes(&CteFilter {
            location: Some(dc),
            ..CteFilter::default()
        })?;
        assert!(by_location.is_empty());
        Ok(())
    }

    // Test IDs: TLED-005
    #[test]
    fn soft_deleted_events_leave_list_but_stay_resolvable() -> StoreResult<()> {
        let mut store = open_store()?;
        let farm = register_fixture_location(&mut store, "Rivera Farms")?;
        let dc = register_fixture_location(&mut store, "Valley DC")?;
        let tlc = create_fixture_tlc(&mut store, farm)?;

        let ship = mk_ship_record(tlc, farm, dc);
        store.append_cte(&ship)?;
        store.soft_delete_cte(ship.cte_id)?;

        assert!(store.list_ctes(&CteFilter::default())?.is_empty());
        let with_deleted = store.list_ctes(&CteFilter {
            include_deleted: true,
            ..CteFilter::default()
        })?;
        assert_eq!(with_deleted.len(), 1);

        let Some(resolved) = store.get_cte(ship.cte_id)? else {
            panic!("soft-deleted event must stay resolvable by id");
        };
        assert!(resolved.deleted_at.is_some());
        Ok(())
    }

    // Test IDs: TLED-006
    #[test]
    fn transform_rejects_date_before_input_lot_availability() -> StoreResult<()> {
        let mut store = open_store()?;
        let plant = register_fixture_location(&mut store, "Fresh Cut Plant")?;
        let input_tlc = create_fixture_tlc(&mut store, plant)?;
        let output_tlc = create_fixture_tlc(&mut store, plant)?;

        let mut record = mk_ship_record(output_tlc, plant, plant);
        record.payload = CtePayload::Transform(TransformFields {
            // Input lot was packed on Oct 14.
            trans_date: fixture_date(2024, Month::October, 10),
            input_tlc,
            input_quantity: 5.0,
            input_unit: UnitOfMeasure::Case,
        });
        let result = store.append_cte(&record);
        assert!(matches!(
            result,
            Err(StoreError::Domain(LedgerError::Validation(message)))
                if message.contains("precedes availability")
        ));

        record.payload = CtePayload::Transform(TransformFields {
            trans_date: fixture_date(2024, Month::October, 15),
            input_tlc,
            input_quantity: 5.0,
            input_unit: UnitOfMeasure::Case,
        });
        store.append_cte(&record)?;
        Ok(())
    }

    // Test IDs: TLED-007
    #[test]
    fn lineage_walks_transform_edges_back_to_origin_lots() -> StoreResult<()> {
        let mut store = open_store()?;
        let plant = register_fixture_location(&mut store, "Fresh Cut Plant")?;
        let dc = register_fixture_location(&mut store, "Valley DC")?;
        let input_tlc = create_fixture_tlc(&mut store, plant)?;
        let output_tlc = create_fixture_tlc(&mut store, plant)?;

        let mut pack = mk_ship_record(input_tlc, plant, dc);
        pack.payload = CtePayload::InitialPackProduce(InitialPackFields {
            pack_date: fixture_date(2024, Month::October, 14),
            harvest_date: Some(fixture_date(2024, Month::October, 12)),
        });
        store.append_cte(&pack)?;

        let mut transform = mk_ship_record(output_tlc, plant, dc);
        transform.payload = CtePayload::Transform(TransformFields {
            trans_date: fixture_date(2024, Month::October, 16),
            input_tlc,
            input_quantity: 6.0,
            input_unit: UnitOfMeasure::Case,
        });
        store.append_cte(&transform)?;

        let ship = mk_ship_record(output_tlc, plant, dc);
        store.append_cte(&ship)?;

        let lineage = store.trace_lineage(output_tlc)?;
        let types = lineage
            .iter()
            .map(|record| record.payload.cte_type())
            .collect::<Vec<_>>();
        assert_eq!(
            types,
            vec![CteType::InitialPackProduce, CteType::Transform, CteType::Ship]
        );

        let missing = store.trace_lineage(TlcId::new());
        assert!(matches!(
            missing,
            Err(StoreError::Domain(LedgerError::NotFound { entity: "trace lot code", .. }))
        ));
        Ok(())
    }

    // Test IDs: TREC-001 (scenario A + B)
    #[test]
    fn receive_reconciles_exactly_once_then_reports_already_exists() -> StoreResult<()> {
        let mut store = open_store()?;
        let farm = register_fixture_location(&mut store, "Rivera Farms")?;
        let dc = register_fixture_location(&mut store, "Valley DC")?;
        let tlc = create_fixture_tlc(&mut store, farm)?;

        let announcement = mk_fixture_announcement(TEST_SSCC, tlc, dc, farm);
        let stored = store.create_announcement(&announcement)?;
        assert_eq!(stored.status, AnnouncementStatus::Pending);

        let outcome = store.receive_shipment(
            &scan_key(TEST_SSCC, tlc, dc),
            fixture_date(2024, Month::October, 18),
            fixture_time_of_day(),
        )?;
        let ReceiveOutcome::Created { cte, announcement_id } = outcome else {
            panic!("first receive should create the receive event");
        };
        assert_eq!(announcement_id, stored.announcement_id);

        let Some(after) = store.get_announcement(stored.announcement_id)? else {
            panic!("announcement should still exist after reconciliation");
        };
        assert_eq!(after.status, AnnouncementStatus::Received);
        assert_eq!(after.cte_receive, Some(cte.cte_id));

        let repeat = store.receive_shipment(
            &scan_key(TEST_SSCC, tlc, dc),
            fixture_date(2024, Month::October, 18),
            fixture_time_of_day(),
        )?;
        let ReceiveOutcome::AlreadyExists { announcement_id, cte_receive } = repeat else {
            panic!("second identical receive should be detected as already processed");
        };
        assert_eq!(announcement_id, stored.announcement_id);
        assert_eq!(cte_receive, cte.cte_id);

        // Exactly one receive event was written.
        let receive_rows: i64 = store.conn.query_row(
            "SELECT COUNT(*) FROM ctes WHERE cte_type = 'receive'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(receive_rows, 1);
        Ok(())
    }

    // Test IDs: TREC-002 (scenario C)
    #[test]
    fn receive_with_unregistered_sscc_reports_not_found() -> StoreResult<()> {
        let mut store = open_store()?;
        let farm = register_fixture_location(&mut store, "Rivera Farms")?;
        let dc = register_fixture_location(&mut store, "Valley DC")?;
        let tlc = create_fixture_tlc(&mut store, farm)?;

        let announcement = mk_fixture_announcement(TEST_SSCC, tlc, dc, farm);
        store.create_announcement(&announcement)?;

        let outcome = store.receive_shipment(
            &scan_key("009999999999999999", tlc, dc),
            fixture_date(2024, Month::October, 18),
            fixture_time_of_day(),
        )?;
        assert_eq!(outcome, ReceiveOutcome::NotFound);
        Ok(())
    }

    // Test IDs: TREC-003
    #[test]
    fn receive_copies_announcement_kdes_into_the_stored_event() -> StoreResult<()> {
        let mut store = open_store()?;
        let farm = register_fixture_location(&mut store, "Rivera Farms")?;
        let dc = register_fixture_location(&mut store, "Valley DC")?;
        let tlc = create_fixture_tlc(&mut store, farm)?;

        let announcement = mk_fixture_announcement(TEST_SSCC, tlc, dc, farm);
        let stored = store.create_announcement(&announcement)?;

        let outcome = store.receive_shipment(
            &scan_key(TEST_SSCC, tlc, dc),
            fixture_date(2024, Month::October, 18),
            fixture_time_of_day(),
        )?;
        let ReceiveOutcome::Created { cte, .. } = outcome else {
            panic!("receive should create the receive event");
        };

        let Some(loaded) = store.get_cte(cte.cte_id)? else {
            panic!("receive event should be resolvable after reconciliation");
        };
        assert_eq!(loaded.prod_desc, stored.prod_desc);
        assert_eq!(loaded.variety, stored.variety);
        assert_eq!(loaded.tlc, Some(stored.tlc));
        assert!((loaded.quantity - stored.quantity).abs() < f64::EPSILON);
        assert_eq!(loaded.unit, stored.unit);
        assert_eq!(loaded.ftl_item, stored.ftl_item);
        assert_eq!(loaded.tlc_source, stored.tlc_source);
        assert_eq!(loaded.tlc_source_reference, stored.tlc_source_reference);
        assert_eq!(loaded.reference_doc_type, stored.reference_doc_type);
        assert_eq!(loaded.reference_doc_num, stored.reference_doc_num);
        assert_eq!(loaded.location, dc);
        let CtePayload::Receive(fields) = &loaded.payload else {
            panic!("stored payload should be receive");
        };
        assert_eq!(fields.ips_location, stored.ship_from_location);
        Ok(())
    }

    // Test IDs: TREC-004 (scenario D)
    #[test]
    fn duplicate_pending_rows_surface_as_integrity_error() -> StoreResult<()> {
        let mut store = open_store()?;
        let farm = register_fixture_location(&mut store, "Rivera Farms")?;
        let dc = register_fixture_location(&mut store, "Valley DC")?;
        let tlc = create_fixture_tlc(&mut store, farm)?;

        let first = mk_fixture_announcement(TEST_SSCC, tlc, dc, farm);
        store.create_announcement(&first)?;

        // Bypass the guarded write path to break the uniqueness invariant,
        // the way a buggy upstream writer would.
        let second = mk_fixture_announcement(TEST_SSCC, tlc, dc, farm);
        store.conn.execute(
            &format!(
                "INSERT INTO shipment_announcements({ANNOUNCEMENT_COLUMNS})
                 VALUES (?1, ?2, NULL, 'pending', ?3, 12.0, 'case', 'leafy_greens', NULL,
                         'romaine lettuce', ?4, ?5, '2024-10-17', NULL, NULL, 'bol', 'BOL-78',
                         NULL, '2024-10-17T00:00:00Z', NULL)"
            ),
            params![
                second.announcement_id.to_string(),
                TEST_SSCC,
                tlc.to_string(),
                dc.to_string(),
                farm.to_string(),
            ],
        )?;

        let result = store.receive_shipment(
            &scan_key(TEST_SSCC, tlc, dc),
            fixture_date(2024, Month::October, 18),
            fixture_time_of_day(),
        );
        assert!(matches!(
            result,
            Err(StoreError::Domain(LedgerError::Integrity(message)))
                if message.contains("announcements for one matching key")
        ));

        let report = store.integrity_check()?;
        assert_eq!(report.duplicate_pending_keys.len(), 1);
        assert_eq!(report.duplicate_pending_keys[0].pending_rows, 2);
        Ok(())
    }

    // Test IDs: TREC-005
    #[test]
    fn create_announcement_rejects_second_pending_for_same_key() -> StoreResult<()> {
        let mut store = open_store()?;
        let farm = register_fixture_location(&mut store, "Rivera Farms")?;
        let dc = register_fixture_location(&mut store, "Valley DC")?;
        let tlc = create_fixture_tlc(&mut store, farm)?;

        store.create_announcement(&mk_fixture_announcement(TEST_SSCC, tlc, dc, farm))?;
        let result = store.create_announcement(&mk_fixture_announcement(TEST_SSCC, tlc, dc, farm));
        assert!(matches!(
            result,
            Err(StoreError::Domain(LedgerError::Validation(message)))
                if message.contains("pending announcement already exists")
        ));

        // A different ship-to keeps the key distinct and is accepted.
        let other_dc = register_fixture_location(&mut store, "Coastal DC")?;
        store.create_announcement(&mk_fixture_announcement(TEST_SSCC, tlc, other_dc, farm))?;
        Ok(())
    }

    // Test IDs: TREC-006
    #[test]
    fn cancelled_announcements_no_longer_match_receives() -> StoreResult<()> {
        let mut store = open_store()?;
        let farm = register_fixture_location(&mut store, "Rivera Farms")?;
        let dc = register_fixture_location(&mut store, "Valley DC")?;
        let tlc = create_fixture_tlc(&mut store, farm)?;

        let stored = store.create_announcement(&mk_fixture_announcement(TEST_SSCC, tlc, dc, farm))?;
        let cancelled = store.cancel_announcement(stored.announcement_id)?;
        assert_eq!(cancelled.status, AnnouncementStatus::Cancelled);

        let outcome = store.receive_shipment(
            &scan_key(TEST_SSCC, tlc, dc),
            fixture_date(2024, Month::October, 18),
            fixture_time_of_day(),
        )?;
        assert_eq!(outcome, ReceiveOutcome::NotFound);

        // Terminal states refuse the transition.
        let again = store.cancel_announcement(stored.announcement_id);
        assert!(matches!(
            again,
            Err(StoreError::Domain(LedgerError::Validation(message)))
                if message.contains("only pending announcements can be cancelled")
        ));
        Ok(())
    }

    // Test IDs: TDB-006
    #[test]
    fn integrity_check_reports_clean_database() -> StoreResult<()> {
        let store = open_store()?;
        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert!(report.duplicate_pending_keys.is_empty());
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);
        Ok(())
    }

    // Test IDs: TDB-007
    #[test]
    fn backup_and_restore_round_trip() -> StoreResult<()> {
        let mut source = open_store()?;
        let farm = register_fixture_location(&mut source, "Rivera Farms")?;
        let tlc = create_fixture_tlc(&mut source, farm)?;

        let backup_file =
            std::env::temp_dir().join(format!("trace-ledger-backup-{}.sqlite3", Ulid::new()));
        source.backup_database(&backup_file)?;

        let mut target = SqliteStore::open(Path::new(":memory:"))?;
        target.restore_database(&backup_file)?;
        assert!(target.get_tlc(tlc)?.is_some());

        fs::remove_file(&backup_file).map_err(|err| {
            StoreError::internal(format!(
                "failed to cleanup temp backup file {}: {err}",
                backup_file.display()
            ))
        })?;
        Ok(())
    }

    // Test IDs: TCONC-001
    #[test]
    fn concurrent_receives_reconcile_exactly_once() -> StoreResult<()> {
        let db_path =
            std::env::temp_dir().join(format!("trace-ledger-conc-{}.sqlite3", Ulid::new()));

        let (tlc, dc) = {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
            let farm = register_fixture_location(&mut init, "Rivera Farms")?;
            let dc = register_fixture_location(&mut init, "Valley DC")?;
            let tlc = create_fixture_tlc(&mut init, farm)?;
            init.create_announcement(&mk_fixture_announcement(TEST_SSCC, tlc, dc, farm))?;
            (tlc, dc)
        };

        let receiver_threads = 4;
        let mut handles = Vec::new();
        for _ in 0..receiver_threads {
            let path = db_path.clone();
            handles.push(thread::spawn(move || -> StoreResult<ReceiveOutcome> {
                let mut store = SqliteStore::open(&path)?;
                store.receive_shipment(
                    &scan_key(TEST_SSCC, tlc, dc),
                    fixture_date(2024, Month::October, 18),
                    fixture_time_of_day(),
                )
            }));
        }

        let mut created = 0_usize;
        let mut already_exists = 0_usize;
        for handle in handles {
            let Ok(outcome) = handle.join() else {
                panic!("receiver thread panicked");
            };
            match outcome? {
                ReceiveOutcome::Created { .. } => created += 1,
                ReceiveOutcome::AlreadyExists { .. } => already_exists += 1,
                ReceiveOutcome::NotFound => panic!("racing receivers must never observe NotFound"),
            }
        }
        assert_eq!(created, 1);
        assert_eq!(already_exists, receiver_threads - 1);

        let store = SqliteStore::open(&db_path)?;
        let receive_rows: i64 = store.conn.query_row(
            "SELECT COUNT(*) FROM ctes WHERE cte_type = 'receive'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(receive_rows, 1);

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());

        for suffix in ["", "-wal", "-shm"] {
            let path = if suffix.is_empty() {
                db_path.clone()
            } else {
                std::path::PathBuf::from(format!("{}{}", db_path.display(), suffix))
            };
            if path.exists() {
                fs::remove_file(&path).map_err(|err| {
                    StoreError::internal(format!(
                        "failed to cleanup sqlite file {}: {err}",
                        path.display()
                    ))
                })?;
            }
        }
        Ok(())
    }
}
