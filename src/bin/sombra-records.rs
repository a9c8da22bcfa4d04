//! Binary entry point for inspecting and seeding record store directories.
#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use sombra_records::storage::{
    DynamicStore, MetaDataStore, Position, RecordFormat, RecordStore, StoreConfig, StoreFactory,
    META_DATA_STORE_NAME,
};
use sombra_records::{Result, StoreError};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "sombra-records",
    version,
    about = "Inspect and seed record store directories",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, global = true, value_name = "FILE", help = "TOML store configuration")]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create every store in a directory
    Init(DirArg),
    /// Print every metadata field
    Meta(DirArg),
    /// Overwrite one metadata field without opening the store
    SetField(SetFieldCmd),
    /// Print high ids and id usage of every store
    Ids(DirArg),
    /// Hex dump of raw record slots
    Dump(DumpCmd),
    /// Store a string in the string store
    PutString(PutStringCmd),
    /// Read a string from the string store
    GetString(GetStringCmd),
}

#[derive(Args, Debug)]
struct DirArg {
    #[arg(value_name = "DIR")]
    dir: PathBuf,
}

#[derive(Args, Debug)]
struct SetFieldCmd {
    #[arg(value_name = "DIR")]
    dir: PathBuf,

    #[arg(value_name = "FIELD", help = "Field name, e.g. log_version")]
    field: String,

    #[arg(value_name = "VALUE", allow_negative_numbers = true)]
    value: i64,
}

#[derive(Args, Debug)]
struct DumpCmd {
    #[arg(value_name = "DIR")]
    dir: PathBuf,

    #[arg(long, value_enum, default_value_t = StoreKind::Node)]
    store: StoreKind,

    #[arg(long, default_value_t = 0, help = "First record id")]
    id: i64,

    #[arg(long, default_value_t = 1, help = "Number of records")]
    count: i64,
}

#[derive(Args, Debug)]
struct PutStringCmd {
    #[arg(value_name = "DIR")]
    dir: PathBuf,

    #[arg(value_name = "TEXT")]
    text: String,
}

#[derive(Args, Debug)]
struct GetStringCmd {
    #[arg(value_name = "DIR")]
    dir: PathBuf,

    #[arg(value_name = "ID")]
    id: i64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
enum StoreKind {
    Meta,
    Node,
    String,
    Array,
    Schema,
}

impl StoreKind {
    const ALL: [StoreKind; 5] = [
        StoreKind::Meta,
        StoreKind::Node,
        StoreKind::String,
        StoreKind::Array,
        StoreKind::Schema,
    ];
}

#[derive(Debug, Serialize)]
struct StoreSummary {
    store: StoreKind,
    descriptor: &'static str,
    record_size: usize,
    reserved_records: i64,
    high_id: i64,
    ids_in_use: i64,
}

#[derive(Debug, Serialize)]
struct RawRecord {
    id: i64,
    in_use: bool,
    hex: String,
}

#[derive(Debug, Serialize)]
struct FieldValue {
    field: Position,
    value: i64,
    description: &'static str,
}

trait Inspect {
    fn summary(&self, kind: StoreKind) -> Result<StoreSummary>;
    fn raw(&self, id: i64) -> Result<RawRecord>;
    fn close(&self) -> Result<()>;
}

impl<F: RecordFormat> Inspect for RecordStore<F> {
    fn summary(&self, kind: StoreKind) -> Result<StoreSummary> {
        Ok(StoreSummary {
            store: kind,
            descriptor: self.type_descriptor(),
            record_size: self.record_size(),
            reserved_records: self.number_of_reserved_low_ids(),
            high_id: self.high_id()?,
            ids_in_use: self.number_of_ids_in_use()?,
        })
    }

    fn raw(&self, id: i64) -> Result<RawRecord> {
        Ok(RawRecord {
            id,
            in_use: self.is_in_use(id)?,
            hex: hex::encode(self.get_raw_record_data(id)?),
        })
    }

    fn close(&self) -> Result<()> {
        RecordStore::close(self)
    }
}

impl Inspect for MetaDataStore {
    fn summary(&self, kind: StoreKind) -> Result<StoreSummary> {
        self.store().summary(kind)
    }

    fn raw(&self, id: i64) -> Result<RawRecord> {
        self.store().raw(id)
    }

    fn close(&self) -> Result<()> {
        MetaDataStore::close(self)
    }
}

impl Inspect for DynamicStore {
    fn summary(&self, kind: StoreKind) -> Result<StoreSummary> {
        self.store().summary(kind)
    }

    fn raw(&self, id: i64) -> Result<RawRecord> {
        self.store().raw(id)
    }

    fn close(&self) -> Result<()> {
        DynamicStore::close(self)
    }
}

fn open_store(factory: &StoreFactory, kind: StoreKind, create: bool) -> Result<Box<dyn Inspect>> {
    Ok(match kind {
        StoreKind::Meta => Box::new(factory.open_meta_data_store(create)?),
        StoreKind::Node => Box::new(factory.open_node_store(create)?),
        StoreKind::String => Box::new(factory.open_string_store(create)?),
        StoreKind::Array => Box::new(factory.open_array_store(create)?),
        StoreKind::Schema => Box::new(factory.open_schema_store(create)?),
    })
}

fn with_store<T>(
    factory: &StoreFactory,
    kind: StoreKind,
    body: impl FnOnce(&dyn Inspect) -> Result<T>,
) -> Result<T> {
    let store = open_store(factory, kind, false)?;
    let result = body(store.as_ref());
    let closed = store.close();
    let value = result?;
    closed?;
    Ok(value)
}

fn load_config(path: Option<&Path>) -> Result<StoreConfig> {
    match path {
        Some(path) => StoreConfig::load(path),
        None => Ok(StoreConfig::default()),
    }
}

fn print_field(name: &str, value: impl std::fmt::Display) {
    println!("  {:.<44} {}", name, value);
}

fn emit_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| StoreError::Invalid(format!("cannot encode output: {err}")))?;
    println!("{text}");
    Ok(())
}

fn cmd_init(config: StoreConfig, dir: &Path, format: OutputFormat) -> Result<()> {
    let factory = StoreFactory::new(dir, config)?;
    let mut summaries = Vec::new();
    for kind in StoreKind::ALL {
        let store = open_store(&factory, kind, true)?;
        let summary = store.summary(kind);
        store.close()?;
        summaries.push(summary?);
    }
    match format {
        OutputFormat::Json => emit_json(&summaries),
        OutputFormat::Text => {
            println!("initialized {}", dir.display());
            for summary in &summaries {
                print_field(summary.descriptor, format!("{} byte records", summary.record_size));
            }
            Ok(())
        }
    }
}

fn cmd_meta(config: StoreConfig, dir: &Path, format: OutputFormat) -> Result<()> {
    let factory = StoreFactory::new(dir, config)?;
    let meta = factory.open_meta_data_store(false)?;
    let scanned = meta.scan_all_records();
    let closed = meta.close();
    let fields: Vec<FieldValue> = scanned?
        .into_iter()
        .map(|(field, value)| FieldValue {
            field,
            value,
            description: field.description(),
        })
        .collect();
    closed?;
    match format {
        OutputFormat::Json => emit_json(&fields),
        OutputFormat::Text => {
            for field in &fields {
                print_field(field.field.name(), field.value);
            }
            Ok(())
        }
    }
}

fn cmd_set_field(config: StoreConfig, cmd: &SetFieldCmd, format: OutputFormat) -> Result<()> {
    let position = Position::from_name(&cmd.field)
        .ok_or_else(|| StoreError::Invalid(format!("unknown field {:?}", cmd.field)))?;
    let factory = StoreFactory::new(&cmd.dir, config)?;
    let previous = MetaDataStore::set_record(
        factory.page_cache(),
        &factory.store_path(META_DATA_STORE_NAME),
        position,
        cmd.value,
    )?;
    match format {
        OutputFormat::Json => emit_json(&serde_json::json!({
            "field": position,
            "previous": previous,
            "value": cmd.value,
        })),
        OutputFormat::Text => {
            print_field(position.name(), format!("{previous} -> {}", cmd.value));
            Ok(())
        }
    }
}

fn cmd_ids(config: StoreConfig, dir: &Path, format: OutputFormat) -> Result<()> {
    let factory = StoreFactory::new(dir, config)?;
    let mut summaries = Vec::new();
    for kind in StoreKind::ALL {
        match with_store(&factory, kind, |store| store.summary(kind)) {
            Ok(summary) => summaries.push(summary),
            Err(StoreError::StoreNotFound(_)) => continue,
            Err(err) => return Err(err),
        }
    }
    match format {
        OutputFormat::Json => emit_json(&summaries),
        OutputFormat::Text => {
            for summary in &summaries {
                print_field(
                    summary.descriptor,
                    format!(
                        "high id {}, {} in use, {} reserved",
                        summary.high_id, summary.ids_in_use, summary.reserved_records
                    ),
                );
            }
            Ok(())
        }
    }
}

fn cmd_dump(config: StoreConfig, cmd: &DumpCmd, format: OutputFormat) -> Result<()> {
    if cmd.id < 0 || cmd.count < 0 {
        return Err(StoreError::Invalid("id and count must not be negative".into()));
    }
    let factory = StoreFactory::new(&cmd.dir, config)?;
    let records = with_store(&factory, cmd.store, |store| {
        (cmd.id..cmd.id.saturating_add(cmd.count))
            .map(|id| store.raw(id))
            .collect::<Result<Vec<_>>>()
    })?;
    match format {
        OutputFormat::Json => emit_json(&records),
        OutputFormat::Text => {
            for record in &records {
                let marker = if record.in_use { "+" } else { "-" };
                println!("{:>10} {marker} {}", record.id, record.hex);
            }
            Ok(())
        }
    }
}

fn cmd_put_string(config: StoreConfig, cmd: &PutStringCmd, format: OutputFormat) -> Result<()> {
    let factory = StoreFactory::new(&cmd.dir, config)?;
    let store = factory.open_string_store(false)?;
    let written = store.write_string(&cmd.text);
    let closed = store.close();
    let id = written?;
    closed?;
    match format {
        OutputFormat::Json => emit_json(&serde_json::json!({ "id": id })),
        OutputFormat::Text => {
            println!("{id}");
            Ok(())
        }
    }
}

fn cmd_get_string(config: StoreConfig, cmd: &GetStringCmd, format: OutputFormat) -> Result<()> {
    let factory = StoreFactory::new(&cmd.dir, config)?;
    let store = factory.open_string_store(false)?;
    let read = store.read_string(cmd.id);
    let closed = store.close();
    let text = read?;
    closed?;
    match format {
        OutputFormat::Json => emit_json(&serde_json::json!({ "id": cmd.id, "text": text })),
        OutputFormat::Text => {
            println!("{text}");
            Ok(())
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match &cli.command {
        Command::Init(arg) => cmd_init(config, &arg.dir, cli.format),
        Command::Meta(arg) => cmd_meta(config, &arg.dir, cli.format),
        Command::SetField(cmd) => cmd_set_field(config, cmd, cli.format),
        Command::Ids(arg) => cmd_ids(config, &arg.dir, cli.format),
        Command::Dump(cmd) => cmd_dump(config, cmd, cli.format),
        Command::PutString(cmd) => cmd_put_string(config, cmd, cli.format),
        Command::GetString(cmd) => cmd_get_string(config, cmd, cli.format),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
