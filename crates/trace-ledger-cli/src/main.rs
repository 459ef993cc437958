use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use time::format_description::FormatItem;
use time::{Date, Time};
use trace_ledger_api::{
    AnnounceShipmentRequest, AppendCteRequest, CancelAnnouncementRequest, CreateTlcRequest,
    FindAnnouncementRequest, ReceiveShipmentRequest, RegisterLocationRequest, TraceLedgerApi,
};
use trace_ledger_core::{
    AnnouncementId, AnnouncementStatus, CallerIdentity, CteId, FtlItem, LocationId, TlcId,
    UnitOfMeasure,
};
use trace_ledger_store_sqlite::{CteFilter, SqliteStore};
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "tl")]
#[command(about = "Trace Ledger CLI")]
struct Cli {
    #[arg(long, default_value = "./trace_ledger.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Location {
        #[command(subcommand)]
        command: Box<LocationCommand>,
    },
    Tlc {
        #[command(subcommand)]
        command: Box<TlcCommand>,
    },
    Cte {
        #[command(subcommand)]
        command: Box<CteCommand>,
    },
    Ship {
        #[command(subcommand)]
        command: Box<ShipCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum LocationCommand {
    Add(LocationAddArgs),
    Show(IdArg),
}

#[derive(Debug, Args)]
struct LocationAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    city: Option<String>,
}

#[derive(Debug, Args)]
struct IdArg {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Subcommand)]
enum TlcCommand {
    Create(TlcCreateArgs),
    Show(IdArg),
    Delete(IdArg),
}

#[derive(Debug, Args)]
struct TlcCreateArgs {
    #[arg(long)]
    value: String,
    #[arg(long)]
    gtin: Option<String>,
    #[arg(long)]
    batch_lot: Option<String>,
    #[arg(long)]
    sscc: Option<String>,
    #[arg(long)]
    pack_date: Option<String>,
    #[arg(long)]
    harvest_date: Option<String>,
    #[arg(long)]
    best_by_date: Option<String>,
    #[arg(long)]
    logistics_serial: Option<String>,
    #[arg(long)]
    source_location: Option<String>,
    #[arg(long)]
    source_reference: Option<String>,
}

#[derive(Debug, Subcommand)]
enum CteCommand {
    /// Append one event from an AppendCteRequest JSON document
    /// (from --file, or stdin when omitted).
    Append(CteAppendArgs),
    Show(IdArg),
    List(CteListArgs),
    Delete(IdArg),
    Lineage(LineageArgs),
}

#[derive(Debug, Args)]
struct CteAppendArgs {
    #[arg(long)]
    file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct CteListArgs {
    #[arg(long)]
    tlc_value: Option<String>,
    #[arg(long)]
    location: Option<String>,
    #[arg(long = "from")]
    date_from: Option<String>,
    #[arg(long = "to")]
    date_to: Option<String>,
    #[arg(long, default_value_t = false)]
    include_deleted: bool,
}

#[derive(Debug, Args)]
struct LineageArgs {
    #[arg(long)]
    tlc: String,
}

#[derive(Debug, Subcommand)]
enum ShipCommand {
    Announce(ShipAnnounceArgs),
    Find(ShipFindArgs),
    Receive(ShipReceiveArgs),
    Cancel(ShipCancelArgs),
}

#[derive(Debug, Args)]
struct ShipAnnounceArgs {
    #[arg(long)]
    sscc: Option<String>,
    #[arg(long)]
    logistics_serial: Option<String>,
    #[arg(long)]
    tlc: String,
    #[arg(long)]
    quantity: f64,
    #[arg(long)]
    unit: String,
    #[arg(long)]
    ftl_item: String,
    #[arg(long)]
    variety: Option<String>,
    #[arg(long)]
    prod_desc: String,
    #[arg(long)]
    ship_to: String,
    #[arg(long)]
    ship_from: String,
    #[arg(long)]
    ship_date: String,
    #[arg(long)]
    tlc_source: Option<String>,
    #[arg(long)]
    tlc_source_reference: Option<String>,
    #[arg(long)]
    ref_doc_type: String,
    #[arg(long)]
    ref_doc_num: String,
}

#[derive(Debug, Args)]
struct ShipFindArgs {
    #[arg(long)]
    sscc: Option<String>,
    #[arg(long)]
    tlc: String,
    #[arg(long)]
    ship_to: String,
    #[arg(long)]
    status: String,
}

#[derive(Debug, Args)]
struct ShipReceiveArgs {
    #[arg(long)]
    sscc: Option<String>,
    #[arg(long)]
    tlc: String,
    #[arg(long)]
    receive_location: String,
    #[arg(long)]
    receive_date: String,
    #[arg(long)]
    receive_time: String,
    #[arg(long)]
    caller_location: String,
    #[arg(long, default_value_t = false)]
    root_admin: bool,
}

#[derive(Debug, Args)]
struct ShipCancelArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    caller_location: String,
    #[arg(long, default_value_t = false)]
    root_admin: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = TraceLedgerApi::new(cli.db.clone());
    match cli.command {
        Command::Db { command } => run_db(*command, &cli.db, &api),
        Command::Location { command } => run_location(*command, &api),
        Command::Tlc { command } => run_tlc(*command, &api),
        Command::Cte { command } => run_cte(*command, &api),
        Command::Ship { command } => run_ship(*command, &api),
    }
}

fn run_db(command: DbCommand, db_path: &Path, api: &TraceLedgerApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result)?)
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(serde_json::to_value(&report)?)
        }
        DbCommand::Backup(args) => {
            let mut store = SqliteStore::open(db_path)?;
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok",
            }))
        }
        DbCommand::Restore(args) => {
            let mut store = SqliteStore::open(db_path)?;
            store.restore_database(&args.input)?;
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
            }))
        }
    }
}

fn run_location(command: LocationCommand, api: &TraceLedgerApi) -> Result<()> {
    match command {
        LocationCommand::Add(args) => {
            let location = api
                .register_location(RegisterLocationRequest { name: args.name, city: args.city })?;
            emit_json(serde_json::to_value(&location)?)
        }
        LocationCommand::Show(args) => {
            let location = api.get_location(LocationId(parse_id(&args.id)?))?;
            emit_json(serde_json::to_value(&location)?)
        }
    }
}

fn run_tlc(command: TlcCommand, api: &TraceLedgerApi) -> Result<()> {
    match command {
        TlcCommand::Create(args) => {
            let tlc = api.create_tlc(CreateTlcRequest {
                value: args.value,
                gtin: args.gtin,
                batch_lot: args.batch_lot,
                sscc: args.sscc,
                pack_date: args.pack_date.as_deref().map(parse_date).transpose()?,
                harvest_date: args.harvest_date.as_deref().map(parse_date).transpose()?,
                best_by_date: args.best_by_date.as_deref().map(parse_date).transpose()?,
                logistics_serial: args.logistics_serial,
                source_location: args
                    .source_location
                    .as_deref()
                    .map(parse_id)
                    .transpose()?
                    .map(LocationId),
                source_reference: args.source_reference,
            })?;
            emit_json(serde_json::to_value(&tlc)?)
        }
        TlcCommand::Show(args) => {
            let tlc = api.get_tlc(TlcId(parse_id(&args.id)?))?;
            emit_json(serde_json::to_value(&tlc)?)
        }
        TlcCommand::Delete(args) => {
            let tlc_id = TlcId(parse_id(&args.id)?);
            api.delete_tlc(tlc_id)?;
            emit_json(serde_json::json!({
                "tlc_id": tlc_id.to_string(),
                "deleted": true,
            }))
        }
    }
}

fn run_cte(command: CteCommand, api: &TraceLedgerApi) -> Result<()> {
    match command {
        CteCommand::Append(args) => {
            let body = match args.file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => {
                    let mut buffer = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buffer)
                        .context("failed to read request from stdin")?;
                    buffer
                }
            };
            let request: AppendCteRequest =
                serde_json::from_str(&body).context("invalid AppendCteRequest JSON")?;
            let record = api.append_cte(request)?;
            emit_json(serde_json::to_value(&record)?)
        }
        CteCommand::Show(args) => {
            let record = api.get_cte(CteId(parse_id(&args.id)?))?;
            emit_json(serde_json::to_value(&record)?)
        }
        CteCommand::List(args) => {
            let filter = CteFilter {
                tlc_value: args.tlc_value,
                location: args.location.as_deref().map(parse_id).transpose()?.map(LocationId),
                date_from: args.date_from.as_deref().map(parse_date).transpose()?,
                date_to: args.date_to.as_deref().map(parse_date).transpose()?,
                include_deleted: args.include_deleted,
            };
            let records = api.list_ctes(&filter)?;
            emit_json(serde_json::json!({
                "count": records.len(),
                "events": records,
            }))
        }
        CteCommand::Delete(args) => {
            let cte_id = CteId(parse_id(&args.id)?);
            api.delete_cte(cte_id)?;
            emit_json(serde_json::json!({
                "cte_id": cte_id.to_string(),
                "deleted": true,
            }))
        }
        CteCommand::Lineage(args) => {
            let records = api.trace_lineage(TlcId(parse_id(&args.tlc)?))?;
            emit_json(serde_json::json!({
                "count": records.len(),
                "events": records,
            }))
        }
    }
}

fn run_ship(command: ShipCommand, api: &TraceLedgerApi) -> Result<()> {
    match command {
        ShipCommand::Announce(args) => {
            let announcement = api.announce_shipment(AnnounceShipmentRequest {
                sscc: args.sscc,
                logistics_serial: args.logistics_serial,
                tlc: TlcId(parse_id(&args.tlc)?),
                quantity: args.quantity,
                unit: parse_unit(&args.unit)?,
                ftl_item: parse_ftl_item(&args.ftl_item)?,
                variety: args.variety,
                prod_desc: args.prod_desc,
                ship_to_location: LocationId(parse_id(&args.ship_to)?),
                ship_from_location: LocationId(parse_id(&args.ship_from)?),
                ship_date: parse_date(&args.ship_date)?,
                tlc_source: args.tlc_source.as_deref().map(parse_id).transpose()?.map(LocationId),
                tlc_source_reference: args.tlc_source_reference,
                reference_doc_type: args.ref_doc_type,
                reference_doc_num: args.ref_doc_num,
            })?;
            emit_json(serde_json::to_value(&announcement)?)
        }
        ShipCommand::Find(args) => {
            let announcement = api.find_announcement(&FindAnnouncementRequest {
                sscc: args.sscc,
                tlc: TlcId(parse_id(&args.tlc)?),
                ship_to_location: LocationId(parse_id(&args.ship_to)?),
                status: parse_status(&args.status)?,
            })?;
            emit_json(serde_json::json!({
                "found": announcement.is_some(),
                "announcement": announcement,
            }))
        }
        ShipCommand::Receive(args) => {
            let outcome = api.receive_shipment(ReceiveShipmentRequest {
                sscc: args.sscc,
                tlc: TlcId(parse_id(&args.tlc)?),
                receive_location: LocationId(parse_id(&args.receive_location)?),
                receive_date: parse_date(&args.receive_date)?,
                receive_time: parse_time(&args.receive_time)?,
                caller: CallerIdentity {
                    location_id: LocationId(parse_id(&args.caller_location)?),
                    root_admin: args.root_admin,
                },
            })?;
            emit_json(serde_json::to_value(&outcome)?)
        }
        ShipCommand::Cancel(args) => {
            let announcement = api.cancel_announcement(CancelAnnouncementRequest {
                announcement_id: AnnouncementId(parse_id(&args.id)?),
                caller: CallerIdentity {
                    location_id: LocationId(parse_id(&args.caller_location)?),
                    root_admin: args.root_admin,
                },
            })?;
            emit_json(serde_json::to_value(&announcement)?)
        }
    }
}

fn parse_id(raw: &str) -> Result<Ulid> {
    Ulid::from_str(raw).map_err(|err| anyhow!("invalid id `{raw}`: {err}"))
}

fn date_items() -> Result<Vec<FormatItem<'static>>> {
    time::format_description::parse("[year]-[month]-[day]")
        .map_err(|err| anyhow!("invalid date format description: {err}"))
}

fn parse_date(raw: &str) -> Result<Date> {
    Date::parse(raw, &date_items()?)
        .map_err(|err| anyhow!("invalid date `{raw}` (expected YYYY-MM-DD): {err}"))
}

fn parse_time(raw: &str) -> Result<Time> {
    let items = time::format_description::parse("[hour]:[minute]:[second]")
        .map_err(|err| anyhow!("invalid time format description: {err}"))?;
    Time::parse(raw, &items)
        .map_err(|err| anyhow!("invalid time `{raw}` (expected HH:MM:SS): {err}"))
}

fn parse_unit(raw: &str) -> Result<UnitOfMeasure> {
    UnitOfMeasure::parse(raw).ok_or_else(|| anyhow!("unknown unit of measure: {raw}"))
}

fn parse_ftl_item(raw: &str) -> Result<FtlItem> {
    FtlItem::parse(raw).ok_or_else(|| anyhow!("unknown ftl item: {raw}"))
}

fn parse_status(raw: &str) -> Result<AnnouncementStatus> {
    AnnouncementStatus::parse(raw).ok_or_else(|| anyhow!("unknown announcement status: {raw}"))
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}
