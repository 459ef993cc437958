use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime, Time};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
}

impl LedgerError {
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Display) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TlcId(pub Ulid);

impl TlcId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TlcId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TlcId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CteId(pub Ulid);

impl CteId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CteId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for CteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AnnouncementId(pub Ulid);

impl AnnouncementId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for AnnouncementId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for AnnouncementId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LocationId(pub Ulid);

impl LocationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for LocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for LocationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CteType {
    Harvest,
    Cool,
    InitialPackProduce,
    InitialPackSprouts,
    InitialPackEggs,
    FirstLandReceive,
    Receive,
    ReceiveExempt,
    Ship,
    Transform,
}

impl CteType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Harvest => "harvest",
            Self::Cool => "cool",
            Self::InitialPackProduce => "initial_pack_produce",
            Self::InitialPackSprouts => "initial_pack_sprouts",
            Self::InitialPackEggs => "initial_pack_eggs",
            Self::FirstLandReceive => "first_land_receive",
            Self::Receive => "receive",
            Self::ReceiveExempt => "receive_exempt",
            Self::Ship => "ship",
            Self::Transform => "transform",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "harvest" => Some(Self::Harvest),
            "cool" => Some(Self::Cool),
            "initial_pack_produce" => Some(Self::InitialPackProduce),
            "initial_pack_sprouts" => Some(Self::InitialPackSprouts),
            "initial_pack_eggs" => Some(Self::InitialPackEggs),
            "first_land_receive" => Some(Self::FirstLandReceive),
            "receive" => Some(Self::Receive),
            "receive_exempt" => Some(Self::ReceiveExempt),
            "ship" => Some(Self::Ship),
            "transform" => Some(Self::Transform),
            _ => None,
        }
    }

    /// Whether this event kind is permitted to omit a trace lot code.
    /// Only events recorded before a lot code is assigned qualify.
    #[must_use]
    pub fn allows_missing_tlc(self) -> bool {
        matches!(self, Self::Harvest | Self::Cool)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UnitOfMeasure {
    Case,
    Carton,
    Pound,
    Kilogram,
    Each,
    Tote,
    Bin,
    Pallet,
    Gallon,
    Liter,
}

impl UnitOfMeasure {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Case => "case",
            Self::Carton => "carton",
            Self::Pound => "pound",
            Self::Kilogram => "kilogram",
            Self::Each => "each",
            Self::Tote => "tote",
            Self::Bin => "bin",
            Self::Pallet => "pallet",
            Self::Gallon => "gallon",
            Self::Liter => "liter",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "case" => Some(Self::Case),
            "carton" => Some(Self::Carton),
            "pound" => Some(Self::Pound),
            "kilogram" => Some(Self::Kilogram),
            "each" => Some(Self::Each),
            "tote" => Some(Self::Tote),
            "bin" => Some(Self::Bin),
            "pallet" => Some(Self::Pallet),
            "gallon" => Some(Self::Gallon),
            "liter" => Some(Self::Liter),
            _ => None,
        }
    }
}

/// Food Traceability List category the recorded product falls under.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FtlItem {
    LeafyGreens,
    Sprouts,
    Melons,
    Peppers,
    Herbs,
    Tomatoes,
    Cucumbers,
    TropicalTreeFruits,
    ShellEggs,
    NutButter,
    FreshCutProduce,
    Finfish,
    SmokedFinfish,
    Crustaceans,
    MolluscanShellfish,
    DeliSalads,
    SoftCheese,
}

impl FtlItem {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LeafyGreens => "leafy_greens",
            Self::Sprouts => "sprouts",
            Self::Melons => "melons",
            Self::Peppers => "peppers",
            Self::Herbs => "herbs",
            Self::Tomatoes => "tomatoes",
            Self::Cucumbers => "cucumbers",
            Self::TropicalTreeFruits => "tropical_tree_fruits",
            Self::ShellEggs => "shell_eggs",
            Self::NutButter => "nut_butter",
            Self::FreshCutProduce => "fresh_cut_produce",
            Self::Finfish => "finfish",
            Self::SmokedFinfish => "smoked_finfish",
            Self::Crustaceans => "crustaceans",
            Self::MolluscanShellfish => "molluscan_shellfish",
            Self::DeliSalads => "deli_salads",
            Self::SoftCheese => "soft_cheese",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "leafy_greens" => Some(Self::LeafyGreens),
            "sprouts" => Some(Self::Sprouts),
            "melons" => Some(Self::Melons),
            "peppers" => Some(Self::Peppers),
            "herbs" => Some(Self::Herbs),
            "tomatoes" => Some(Self::Tomatoes),
            "cucumbers" => Some(Self::Cucumbers),
            "tropical_tree_fruits" => Some(Self::TropicalTreeFruits),
            "shell_eggs" => Some(Self::ShellEggs),
            "nut_butter" => Some(Self::NutButter),
            "fresh_cut_produce" => Some(Self::FreshCutProduce),
            "finfish" => Some(Self::Finfish),
            "smoked_finfish" => Some(Self::SmokedFinfish),
            "crustaceans" => Some(Self::Crustaceans),
            "molluscan_shellfish" => Some(Self::MolluscanShellfish),
            "deli_salads" => Some(Self::DeliSalads),
            "soft_cheese" => Some(Self::SoftCheese),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AnnouncementStatus {
    Pending,
    Received,
    Cancelled,
}

impl AnnouncementStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Received => "received",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "received" => Some(Self::Received),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Received | Self::Cancelled)
    }
}

/// Thin projection of a trading-partner location. The ledger only ever
/// needs the id for references and name/city for display.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Location {
    pub location_id: LocationId,
    pub name: String,
    pub city: Option<String>,
}

impl Location {
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the location name is blank.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.name.trim().is_empty() {
            return Err(LedgerError::Validation(
                "location name MUST be non-empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where a trace lot code was assigned: either a location inside the
/// system, or a free-form reference to an assigning party outside it.
/// Exactly one of the two carries meaning; the pair is only constructed
/// through [`TlcSource::from_parts`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TlcSource {
    Location(LocationId),
    Reference(String),
}

impl TlcSource {
    /// # Errors
    /// Returns [`LedgerError::Validation`] when both or neither of the
    /// source location / source reference are meaningfully supplied.
    pub fn from_parts(
        location: Option<LocationId>,
        reference: Option<String>,
    ) -> Result<Self, LedgerError> {
        let reference = reference.filter(|value| !value.trim().is_empty());
        match (location, reference) {
            (Some(location), None) => Ok(Self::Location(location)),
            (None, Some(reference)) => Ok(Self::Reference(reference)),
            (Some(_), Some(_)) => Err(LedgerError::Validation(
                "tlc source MUST NOT carry both a location and a reference".to_string(),
            )),
            (None, None) => Err(LedgerError::Validation(
                "tlc source MUST carry either a location or a reference".to_string(),
            )),
        }
    }

    #[must_use]
    pub fn location(&self) -> Option<LocationId> {
        match self {
            Self::Location(location) => Some(*location),
            Self::Reference(_) => None,
        }
    }

    #[must_use]
    pub fn reference(&self) -> Option<&str> {
        match self {
            Self::Location(_) => None,
            Self::Reference(reference) => Some(reference),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TraceabilityLotCode {
    pub tlc_id: TlcId,
    pub value: String,
    pub gtin: Option<String>,
    pub batch_lot: Option<String>,
    pub sscc: Option<String>,
    pub pack_date: Option<Date>,
    pub harvest_date: Option<Date>,
    pub best_by_date: Option<Date>,
    pub logistics_serial: Option<String>,
    pub source: TlcSource,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl TraceabilityLotCode {
    /// Validate a lot code record before it is persisted. Lot codes are
    /// immutable after creation; a correction means a new lot code.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the code value is blank or
    /// an attached GS1 identifier is malformed.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.value.trim().is_empty() {
            return Err(LedgerError::Validation(
                "trace lot code value MUST be non-empty".to_string(),
            ));
        }

        if let Some(gtin) = &self.gtin {
            if !is_digits(gtin, 14) {
                return Err(LedgerError::Validation(
                    "gtin MUST be exactly 14 digits".to_string(),
                ));
            }
        }

        if let Some(sscc) = &self.sscc {
            if !is_digits(sscc, 18) {
                return Err(LedgerError::Validation(
                    "sscc MUST be exactly 18 digits".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn is_digits(value: &str, expected_len: usize) -> bool {
    value.len() == expected_len && value.bytes().all(|byte| byte.is_ascii_digit())
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HarvestFields {
    pub harvest_date: Date,
    pub field_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CoolFields {
    pub cool_date: Date,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct InitialPackFields {
    pub pack_date: Date,
    pub harvest_date: Option<Date>,
}

/// Seed lineage recorded when sprouts are first packed. The conditioner,
/// seed lot, packing house, and supplier are mandatory under the sprouts
/// clause; grower and harvesting date stay optional.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SproutSeedLineage {
    pub seed_grower_location: Option<LocationId>,
    pub seed_harvesting_date: Option<Date>,
    pub seed_conditioner_location: LocationId,
    pub seed_tlc: TlcId,
    pub seed_packing_house_location: LocationId,
    pub seed_supplier_location: LocationId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct InitialPackSproutsFields {
    pub pack_date: Date,
    pub seed_lineage: SproutSeedLineage,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FirstLandReceiveFields {
    pub landed_date: Date,
    pub harvest_date_begin: Date,
    pub harvest_date_end: Date,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReceiveFields {
    pub receive_date: Date,
    pub receive_time: Time,
    pub ips_location: LocationId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ShipFields {
    pub ship_date: Date,
    pub ship_to_location: LocationId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransformFields {
    pub trans_date: Date,
    pub input_tlc: TlcId,
    pub input_quantity: f64,
    pub input_unit: UnitOfMeasure,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cte_type", content = "fields", rename_all = "snake_case")]
pub enum CtePayload {
    Harvest(HarvestFields),
    Cool(CoolFields),
    InitialPackProduce(InitialPackFields),
    InitialPackSprouts(InitialPackSproutsFields),
    InitialPackEggs(InitialPackFields),
    FirstLandReceive(FirstLandReceiveFields),
    Receive(ReceiveFields),
    ReceiveExempt(ReceiveFields),
    Ship(ShipFields),
    Transform(TransformFields),
}

impl CtePayload {
    #[must_use]
    pub fn cte_type(&self) -> CteType {
        match self {
            Self::Harvest(_) => CteType::Harvest,
            Self::Cool(_) => CteType::Cool,
            Self::InitialPackProduce(_) => CteType::InitialPackProduce,
            Self::InitialPackSprouts(_) => CteType::InitialPackSprouts,
            Self::InitialPackEggs(_) => CteType::InitialPackEggs,
            Self::FirstLandReceive(_) => CteType::FirstLandReceive,
            Self::Receive(_) => CteType::Receive,
            Self::ReceiveExempt(_) => CteType::ReceiveExempt,
            Self::Ship(_) => CteType::Ship,
            Self::Transform(_) => CteType::Transform,
        }
    }

    /// The business date the event occurred on; the ledger lists events
    /// in this order.
    #[must_use]
    pub fn event_date(&self) -> Date {
        match self {
            Self::Harvest(fields) => fields.harvest_date,
            Self::Cool(fields) => fields.cool_date,
            Self::InitialPackProduce(fields) | Self::InitialPackEggs(fields) => fields.pack_date,
            Self::InitialPackSprouts(fields) => fields.pack_date,
            Self::FirstLandReceive(fields) => fields.landed_date,
            Self::Receive(fields) | Self::ReceiveExempt(fields) => fields.receive_date,
            Self::Ship(fields) => fields.ship_date,
            Self::Transform(fields) => fields.trans_date,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CteRecord {
    pub cte_id: CteId,
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
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl CteRecord {
    /// Validate one critical tracking event against its variant's clause.
    /// `today` is the calendar date at insert time; harvest and cooling
    /// events may not be dated in its future.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when a shared or
    /// variant-specific key data element is missing or out of range.
    pub fn validate(&self, today: Date) -> Result<(), LedgerError> {
        if self.prod_desc.trim().is_empty() {
            return Err(LedgerError::Validation(
                "prod_desc MUST be provided for every event".to_string(),
            ));
        }

        if self.reference_doc_type.trim().is_empty() || self.reference_doc_num.trim().is_empty() {
            return Err(LedgerError::Validation(
                "reference document type and number MUST be provided".to_string(),
            ));
        }

        validate_quantity("quantity", self.quantity)?;

        let cte_type = self.payload.cte_type();
        if self.tlc.is_none() && !cte_type.allows_missing_tlc() {
            return Err(LedgerError::Validation(format!(
                "{} events MUST carry a trace lot code",
                cte_type.as_str()
            )));
        }

        match &self.payload {
            CtePayload::Harvest(fields) => {
                if fields.harvest_date > today {
                    return Err(LedgerError::Validation(
                        "harvest_date MUST NOT be in the future".to_string(),
                    ));
                }
            }
            CtePayload::Cool(fields) => {
                if fields.cool_date > today {
                    return Err(LedgerError::Validation(
                        "cool_date MUST NOT be in the future".to_string(),
                    ));
                }
            }
            CtePayload::FirstLandReceive(fields) => {
                if fields.harvest_date_begin > fields.harvest_date_end
                    || fields.harvest_date_end > fields.landed_date
                {
                    return Err(LedgerError::Validation(
                        "first-land receive dates MUST satisfy harvest_date_begin <= harvest_date_end <= landed_date"
                            .to_string(),
                    ));
                }
            }
            CtePayload::Transform(fields) => {
                validate_quantity("input_quantity", fields.input_quantity)?;
            }
            CtePayload::InitialPackProduce(_)
            | CtePayload::InitialPackSprouts(_)
            | CtePayload::InitialPackEggs(_)
            | CtePayload::Receive(_)
            | CtePayload::ReceiveExempt(_)
            | CtePayload::Ship(_) => {}
        }

        Ok(())
    }
}

fn validate_quantity(field: &str, value: f64) -> Result<(), LedgerError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(LedgerError::Validation(format!("{field} MUST be a positive number")));
    }
    Ok(())
}

/// Matching key for shipment reconciliation: a receiving scan carries the
/// shipping unit's SSCC (when labelled), the lot being received, and the
/// location the shipment was announced to.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct AnnouncementKey {
    pub sscc: Option<String>,
    pub tlc: TlcId,
    pub ship_to_location: LocationId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShipmentAnnouncement {
    pub announcement_id: AnnouncementId,
    pub sscc: Option<String>,
    pub logistics_serial: Option<String>,
    pub status: AnnouncementStatus,
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
    pub cte_receive: Option<CteId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl ShipmentAnnouncement {
    #[must_use]
    pub fn key(&self) -> AnnouncementKey {
        AnnouncementKey {
            sscc: self.sscc.clone(),
            tlc: self.tlc,
            ship_to_location: self.ship_to_location,
        }
    }

    /// Validate an announcement before it is persisted.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when a key data element is
    /// missing or out of range.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.prod_desc.trim().is_empty() {
            return Err(LedgerError::Validation(
                "prod_desc MUST be provided for every announcement".to_string(),
            ));
        }

        if self.reference_doc_type.trim().is_empty() || self.reference_doc_num.trim().is_empty() {
            return Err(LedgerError::Validation(
                "reference document type and number MUST be provided".to_string(),
            ));
        }

        validate_quantity("quantity", self.quantity)?;

        if let Some(sscc) = &self.sscc {
            if !is_digits(sscc, 18) {
                return Err(LedgerError::Validation(
                    "sscc MUST be exactly 18 digits".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Three-valued result of a reconciliation attempt. `AlreadyExists` is a
/// defined outcome, not a failure: the scan duplicates a receipt that was
/// already processed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReceiveOutcome {
    Created { cte: Box<CteRecord>, announcement_id: AnnouncementId },
    AlreadyExists { announcement_id: AnnouncementId, cte_receive: CteId },
    NotFound,
}

/// Identity of the caller as resolved by the external identity
/// collaborator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct CallerIdentity {
    pub location_id: LocationId,
    pub root_admin: bool,
}

impl CallerIdentity {
    /// A receiving scan is only accepted from the location the goods
    /// physically arrive at, or from the root capability.
    ///
    /// # Errors
    /// Returns [`LedgerError::Forbidden`] when the caller's home location
    /// differs from the receiving location and the caller is not root.
    pub fn authorize_receive_at(&self, receive_location: LocationId) -> Result<(), LedgerError> {
        if self.root_admin || self.location_id == receive_location {
            return Ok(());
        }
        Err(LedgerError::Forbidden(format!(
            "caller location {} may not receive for location {receive_location}",
            self.location_id
        )))
    }

    /// # Errors
    /// Returns [`LedgerError::Forbidden`] when the caller lacks the root
    /// capability required for administrative transitions.
    pub fn authorize_admin(&self, action: &str) -> Result<(), LedgerError> {
        if self.root_admin {
            return Ok(());
        }
        Err(LedgerError::Forbidden(format!("{action} requires the root capability")))
    }
}

/// Build the Receive event for a matched announcement. Every key data
/// element is copied verbatim from the announcement; the event location
/// is the receiving location and the immediate previous source is the
/// announced ship-from location.
#[must_use]
pub fn receive_cte_for_announcement(
    announcement: &ShipmentAnnouncement,
    receive_location: LocationId,
    receive_date: Date,
    receive_time: Time,
    created_at: OffsetDateTime,
) -> CteRecord {
    CteRecord {
        cte_id: CteId::new(),
        ftl_item: announcement.ftl_item,
        location: receive_location,
        prod_desc: announcement.prod_desc.clone(),
        variety: announcement.variety.clone(),
        tlc: Some(announcement.tlc),
        quantity: announcement.quantity,
        unit: announcement.unit,
        tlc_source: announcement.tlc_source,
        tlc_source_reference: announcement.tlc_source_reference.clone(),
        reference_doc_type: announcement.reference_doc_type.clone(),
        reference_doc_num: announcement.reference_doc_num.clone(),
        payload: CtePayload::Receive(ReceiveFields {
            receive_date,
            receive_time,
            ips_location: announcement.ship_from_location,
        }),
        created_at,
        deleted_at: None,
    }
}
