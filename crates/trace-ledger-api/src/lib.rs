use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime, Time};
use trace_ledger_core::{
    AnnouncementId, AnnouncementKey, AnnouncementStatus, CallerIdentity, CteId, CtePayload,
    CteRecord, FtlItem, LedgerError, Location, LocationId, ReceiveOutcome, ShipmentAnnouncement,
    TlcId, TlcSource, TraceabilityLotCode, UnitOfMeasure,
};
use trace_ledger_store_sqlite::{
    CteFilter, IntegrityReport, SchemaStatus, SqliteStore, StoreError, StoreResult,
};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterLocationRequest {
    pub name: String,
    pub city: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateTlcRequest {
    pub value: String,
    pub gtin: Option<String>,
    pub batch_lot: Option<String>,
    pub sscc: Option<String>,
    pub pack_date: Option<Date>,
    pub harvest_date: Option<Date>,
    pub best_by_date: Option<Date>,
    pub logistics_serial: Option<String>,
    pub source_location: Option<LocationId>,
    pub source_reference: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppendCteRequest {
    pub ftl_item: FtlItem,
    pub location: LocationId,
    pub prod_desc: String,
    pub variety: Option<String>,
    pub tlc: Option<TlcId>,
    pub quantity: f64,
    pub unit: UnitOfMeasure,
    pub tlc_source: Option<LocationId>,
    pub tlc_source_reference: Option<String>,
    pub reference_doc_type: String,
    pub reference_doc_num: String,
    pub payload: CtePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnnounceShipmentRequest {
    pub sscc: Option<String>,
    pub logistics_serial: Option<String>,
    pub tlc: TlcId,
    pub quantity: f64,
    pub unit: UnitOfMeasure,
    pub ftl_item: FtlItem,
    pub variety: Option<String>,
    pub prod_desc: String,
    pub ship_to_location: LocationId,
    pub ship_from_location: LocationId,
    pub ship_date: Date,
    pub tlc_source: Option<LocationId>,
    pub tlc_source_reference: Option<String>,
    pub reference_doc_type: String,
    pub reference_doc_num: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FindAnnouncementRequest {
    pub sscc: Option<String>,
    pub tlc: TlcId,
    pub ship_to_location: LocationId,
    pub status: AnnouncementStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReceiveShipmentRequest {
    pub sscc: Option<String>,
    pub tlc: TlcId,
    pub receive_location: LocationId,
    pub receive_date: Date,
    pub receive_time: Time,
    pub caller: CallerIdentity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CancelAnnouncementRequest {
    pub announcement_id: AnnouncementId,
    pub caller: CallerIdentity,
}

#[derive(Debug, Clone)]
pub struct TraceLedgerApi {
    db_path: PathBuf,
}

impl TraceLedgerApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> StoreResult<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or queried.
    pub fn schema_status(&self) -> StoreResult<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run
    /// mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> StoreResult<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Run the store's integrity probes.
    ///
    /// # Errors
    /// Returns an error when a probe query fails.
    pub fn integrity_check(&self) -> StoreResult<IntegrityReport> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.integrity_check()
    }

    /// Register one trading-partner location.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn register_location(&self, input: RegisterLocationRequest) -> StoreResult<Location> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let location =
            Location { location_id: LocationId::new(), name: input.name, city: input.city };
        store.register_location(&location)?;
        Ok(location)
    }

    /// Resolve one location id.
    ///
    /// # Errors
    /// Returns not-found for an unknown id.
    pub fn get_location(&self, location_id: LocationId) -> StoreResult<Location> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store
            .resolve_location(location_id)?
            .ok_or_else(|| LedgerError::not_found("location", location_id).into())
    }

    /// Create one immutable trace lot code.
    ///
    /// # Errors
    /// Returns a validation error when the source pairing or a field is
    /// malformed, not-found for an unresolved source location, or a
    /// storage error.
    pub fn create_tlc(&self, input: CreateTlcRequest) -> StoreResult<TraceabilityLotCode> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let source = TlcSource::from_parts(input.source_location, input.source_reference)
            .map_err(StoreError::from)?;
        let tlc = TraceabilityLotCode {
            tlc_id: TlcId::new(),
            value: input.value,
            gtin: input.gtin,
            batch_lot: input.batch_lot,
            sscc: input.sscc,
            pack_date: input.pack_date,
            harvest_date: input.harvest_date,
            best_by_date: input.best_by_date,
            logistics_serial: input.logistics_serial,
            source,
            created_at: OffsetDateTime::now_utc(),
            deleted_at: None,
        };
        store.create_tlc(&tlc)?;
        Ok(tlc)
    }

    /// Fetch one trace lot code.
    ///
    /// # Errors
    /// Returns not-found for an unknown id.
    pub fn get_tlc(&self, tlc_id: TlcId) -> StoreResult<TraceabilityLotCode> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store
            .get_tlc(tlc_id)?
            .ok_or_else(|| LedgerError::not_found("trace lot code", tlc_id).into())
    }

    /// Soft-delete one trace lot code for record retention.
    ///
    /// # Errors
    /// Returns not-found for an unknown id.
    pub fn delete_tlc(&self, tlc_id: TlcId) -> StoreResult<()> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.soft_delete_tlc(tlc_id)
    }

    /// Append one critical tracking event to the ledger.
    ///
    /// # Errors
    /// Returns validation/not-found errors per the ledger's contract, or
    /// a storage error.
    pub fn append_cte(&self, input: AppendCteRequest) -> StoreResult<CteRecord> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let record = CteRecord {
            cte_id: CteId::new(),
            ftl_item: input.ftl_item,
            location: input.location,
            prod_desc: input.prod_desc,
            variety: input.variety,
            tlc: input.tlc,
            quantity: input.quantity,
            unit: input.unit,
            tlc_source: input.tlc_source,
            tlc_source_reference: input.tlc_source_reference,
            reference_doc_type: input.reference_doc_type,
            reference_doc_num: input.reference_doc_num,
            payload: input.payload,
            created_at: OffsetDateTime::now_utc(),
            deleted_at: None,
        };
        store.append_cte(&record)?;
        Ok(record)
    }

    /// Fetch one event by id.
    ///
    /// # Errors
    /// Returns not-found for an unknown id.
    pub fn get_cte(&self, cte_id: CteId) -> StoreResult<CteRecord> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store
            .get_cte(cte_id)?
            .ok_or_else(|| LedgerError::not_found("critical tracking event", cte_id).into())
    }

    /// List ledger events matching the filter.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_ctes(&self, filter: &CteFilter) -> StoreResult<Vec<CteRecord>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_ctes(filter)
    }

    /// Soft-delete one event for record retention.
    ///
    /// # Errors
    /// Returns not-found for an unknown id.
    pub fn delete_cte(&self, cte_id: CteId) -> StoreResult<()> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.soft_delete_cte(cte_id)
    }

    /// Reconstruct one lot's event lineage across transformation edges.
    ///
    /// # Errors
    /// Returns not-found for an unknown lot code.
    pub fn trace_lineage(&self, tlc_id: TlcId) -> StoreResult<Vec<CteRecord>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.trace_lineage(tlc_id)
    }

    /// Create one outbound shipment announcement (status forced Pending).
    ///
    /// # Errors
    /// Returns validation/not-found errors per the announcement contract,
    /// or a storage error.
    pub fn announce_shipment(
        &self,
        input: AnnounceShipmentRequest,
    ) -> StoreResult<ShipmentAnnouncement> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let announcement = ShipmentAnnouncement {
            announcement_id: AnnouncementId::new(),
            sscc: input.sscc,
            logistics_serial: input.logistics_serial,
            status: AnnouncementStatus::Pending,
            tlc: input.tlc,
            quantity: input.quantity,
            unit: input.unit,
            ftl_item: input.ftl_item,
            variety: input.variety,
            prod_desc: input.prod_desc,
            ship_to_location: input.ship_to_location,
            ship_from_location: input.ship_from_location,
            ship_date: input.ship_date,
            tlc_source: input.tlc_source,
            tlc_source_reference: input.tlc_source_reference,
            reference_doc_type: input.reference_doc_type,
            reference_doc_num: input.reference_doc_num,
            cte_receive: None,
            created_at: OffsetDateTime::now_utc(),
            deleted_at: None,
        };
        store.create_announcement(&announcement)
    }

    /// Read-only announcement lookup by matching key and status.
    ///
    /// # Errors
    /// Returns an integrity error for a duplicated key, or a storage
    /// error.
    pub fn find_announcement(
        &self,
        input: &FindAnnouncementRequest,
    ) -> StoreResult<Option<ShipmentAnnouncement>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let key = AnnouncementKey {
            sscc: input.sscc.clone(),
            tlc: input.tlc,
            ship_to_location: input.ship_to_location,
        };
        store.find_announcement(&key, input.status)
    }

    /// Reconcile an inbound receiving scan. The caller must be at the
    /// receiving location (or hold the root capability); the check runs
    /// before the engine touches any state.
    ///
    /// # Errors
    /// Returns forbidden for an unauthorized caller, integrity for a
    /// duplicated Pending key, busy on lock timeout, or a storage error.
    pub fn receive_shipment(&self, input: ReceiveShipmentRequest) -> StoreResult<ReceiveOutcome> {
        input
            .caller
            .authorize_receive_at(input.receive_location)
            .map_err(StoreError::from)?;

        let mut store = self.open_store()?;
        store.migrate()?;
        let key = AnnouncementKey {
            sscc: input.sscc,
            tlc: input.tlc,
            ship_to_location: input.receive_location,
        };
        store.receive_shipment(&key, input.receive_date, input.receive_time)
    }

    /// Administrative cancellation of one Pending announcement.
    ///
    /// # Errors
    /// Returns forbidden for a non-root caller, not-found for an unknown
    /// announcement, or a validation error for a terminal one.
    pub fn cancel_announcement(
        &self,
        input: CancelAnnouncementRequest,
    ) -> StoreResult<ShipmentAnnouncement> {
        input.caller.authorize_admin("cancel_announcement").map_err(StoreError::from)?;

        let mut store = self.open_store()?;
        store.migrate()?;
        store.cancel_announcement(input.announcement_id)
    }
}

#[cfg(test)]
mod tests {
    use time::Month;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("trace-ledger-api-{}.sqlite3", ulid::Ulid::new()))
    }

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

    fn fixture_announce_request(
        tlc: TlcId,
        ship_to: LocationId,
        ship_from: LocationId,
    ) -> AnnounceShipmentRequest {
        AnnounceShipmentRequest {
            sscc: Some("001234567890123456".to_string()),
            logistics_serial: None,
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
        }
    }

    // Test IDs: TAPI-001
    #[test]
    fn announce_receive_and_repeat_flow_round_trip() -> StoreResult<()> {
        let db_path = unique_temp_db_path();
        let api = TraceLedgerApi::new(db_path.clone());

        let farm = api.register_location(RegisterLocationRequest {
            name: "Rivera Farms".to_string(),
            city: Some("Salinas".to_string()),
        })?;
        let dc = api.register_location(RegisterLocationRequest {
            name: "Valley DC".to_string(),
            city: Some("Fresno".to_string()),
        })?;

        let tlc = api.create_tlc(CreateTlcRequest {
            value: "LOT-2024-112".to_string(),
            gtin: Some("00812345678901".to_string()),
            batch_lot: None,
            sscc: None,
            pack_date: Some(fixture_date(2024, Month::October, 14)),
            harvest_date: None,
            best_by_date: None,
            logistics_serial: None,
            source_location: Some(farm.location_id),
            source_reference: None,
        })?;

        let announced =
            api.announce_shipment(fixture_announce_request(tlc.tlc_id, dc.location_id, farm.location_id))?;
        assert_eq!(announced.status, AnnouncementStatus::Pending);

        let receiver = CallerIdentity { location_id: dc.location_id, root_admin: false };
        let outcome = api.receive_shipment(ReceiveShipmentRequest {
            sscc: Some("001234567890123456".to_string()),
            tlc: tlc.tlc_id,
            receive_location: dc.location_id,
            receive_date: fixture_date(2024, Month::October, 18),
            receive_time: fixture_time_of_day(),
            caller: receiver,
        })?;
        let ReceiveOutcome::Created { cte, announcement_id } = outcome else {
            panic!("first receive should create the receive event");
        };
        assert_eq!(announcement_id, announced.announcement_id);
        assert_eq!(cte.prod_desc, announced.prod_desc);

        let repeat = api.receive_shipment(ReceiveShipmentRequest {
            sscc: Some("001234567890123456".to_string()),
            tlc: tlc.tlc_id,
            receive_location: dc.location_id,
            receive_date: fixture_date(2024, Month::October, 18),
            receive_time: fixture_time_of_day(),
            caller: receiver,
        })?;
        assert!(matches!(repeat, ReceiveOutcome::AlreadyExists { .. }));

        let found = api.find_announcement(&FindAnnouncementRequest {
            sscc: Some("001234567890123456".to_string()),
            tlc: tlc.tlc_id,
            ship_to_location: dc.location_id,
            status: AnnouncementStatus::Received,
        })?;
        assert!(found.is_some_and(|announcement| announcement.cte_receive == Some(cte.cte_id)));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn receive_from_foreign_location_is_forbidden_before_matching() -> StoreResult<()> {
        let db_path = unique_temp_db_path();
        let api = TraceLedgerApi::new(db_path.clone());

        let farm = api.register_location(RegisterLocationRequest {
            name: "Rivera Farms".to_string(),
            city: None,
        })?;
        let dc = api.register_location(RegisterLocationRequest {
            name: "Valley DC".to_string(),
            city: None,
        })?;
        let tlc = api.create_tlc(CreateTlcRequest {
            value: "LOT-1".to_string(),
            gtin: None,
            batch_lot: None,
            sscc: None,
            pack_date: None,
            harvest_date: None,
            best_by_date: None,
            logistics_serial: None,
            source_location: Some(farm.location_id),
            source_reference: None,
        })?;
        let announced =
            api.announce_shipment(fixture_announce_request(tlc.tlc_id, dc.location_id, farm.location_id))?;

        let stranger = CallerIdentity { location_id: farm.location_id, root_admin: false };
        let result = api.receive_shipment(ReceiveShipmentRequest {
            sscc: announced.sscc.clone(),
            tlc: tlc.tlc_id,
            receive_location: dc.location_id,
            receive_date: fixture_date(2024, Month::October, 18),
            receive_time: fixture_time_of_day(),
            caller: stranger,
        });
        assert!(matches!(
            result,
            Err(StoreError::Domain(LedgerError::Forbidden(_)))
        ));

        // The announcement is untouched; a root caller may still receive it.
        let root = CallerIdentity { location_id: farm.location_id, root_admin: true };
        let outcome = api.receive_shipment(ReceiveShipmentRequest {
            sscc: announced.sscc,
            tlc: tlc.tlc_id,
            receive_location: dc.location_id,
            receive_date: fixture_date(2024, Month::October, 18),
            receive_time: fixture_time_of_day(),
            caller: root,
        })?;
        assert!(matches!(outcome, ReceiveOutcome::Created { .. }));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn cancel_requires_the_root_capability() -> StoreResult<()> {
        let db_path = unique_temp_db_path();
        let api = TraceLedgerApi::new(db_path.clone());

        let farm = api.register_location(RegisterLocationRequest {
            name: "Rivera Farms".to_string(),
            city: None,
        })?;
        let dc = api.register_location(RegisterLocationRequest {
            name: "Valley DC".to_string(),
            city: None,
        })?;
        let tlc = api.create_tlc(CreateTlcRequest {
            value: "LOT-2".to_string(),
            gtin: None,
            batch_lot: None,
            sscc: None,
            pack_date: None,
            harvest_date: None,
            best_by_date: None,
            logistics_serial: None,
            source_location: Some(farm.location_id),
            source_reference: None,
        })?;
        let announced =
            api.announce_shipment(fixture_announce_request(tlc.tlc_id, dc.location_id, farm.location_id))?;

        let clerk = CallerIdentity { location_id: dc.location_id, root_admin: false };
        let denied = api.cancel_announcement(CancelAnnouncementRequest {
            announcement_id: announced.announcement_id,
            caller: clerk,
        });
        assert!(matches!(
            denied,
            Err(StoreError::Domain(LedgerError::Forbidden(_)))
        ));

        let root = CallerIdentity { location_id: dc.location_id, root_admin: true };
        let cancelled = api.cancel_announcement(CancelAnnouncementRequest {
            announcement_id: announced.announcement_id,
            caller: root,
        })?;
        assert_eq!(cancelled.status, AnnouncementStatus::Cancelled);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn create_tlc_rejects_ambiguous_source() -> StoreResult<()> {
        let db_path = unique_temp_db_path();
        let api = TraceLedgerApi::new(db_path.clone());

        let farm = api.register_location(RegisterLocationRequest {
            name: "Rivera Farms".to_string(),
            city: None,
        })?;
        let result = api.create_tlc(CreateTlcRequest {
            value: "LOT-3".to_string(),
            gtin: None,
            batch_lot: None,
            sscc: None,
            pack_date: None,
            harvest_date: None,
            best_by_date: None,
            logistics_serial: None,
            source_location: Some(farm.location_id),
            source_reference: Some("import ref".to_string()),
        });
        assert!(matches!(
            result,
            Err(StoreError::Domain(LedgerError::Validation(_)))
        ));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
