use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dbm_adapters::export::save_download;
use dbm_adapters::HttpGateway;
use dbm_core::config::SessionConfig;
use dbm_core::export::CsvOptions;
use dbm_core::model::{DatabaseType, QueryOptions};
use dbm_core::Session;
use serde_json::json;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Connections,
    Databases {
        connection: String,
    },
    Tables {
        connection: String,
    },
    Schema {
        connection: String,
        table: String,
    },
    Query {
        connection: String,
        sql: String,
    },
    PreviewTypes {
        connection: String,
        target: DatabaseType,
        tables: Vec<String>,
    },
    ExportCsv {
        connection: String,
        sql: String,
        out: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct Invocation {
    config_path: Option<PathBuf>,
    gateway_url: Option<String>,
    database: Option<String>,
    schema: Option<String>,
    page: Option<u32>,
    page_size: Option<u32>,
    sort_by: Option<String>,
    sort_desc: bool,
    out: Option<PathBuf>,
    positionals: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ParseOutcome {
    Run(Invocation, Command),
    HelpRequested,
}

fn parse_args_from(args: impl IntoIterator<Item = String>) -> io::Result<ParseOutcome> {
    let mut invocation = Invocation::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(ParseOutcome::HelpRequested),
            "--config" => {
                invocation.config_path = Some(PathBuf::from(next_value(&mut args, "--config")?));
            }
            "--gateway" => invocation.gateway_url = Some(next_value(&mut args, "--gateway")?),
            "--database" => invocation.database = Some(next_value(&mut args, "--database")?),
            "--schema" => invocation.schema = Some(next_value(&mut args, "--schema")?),
            "--page" => {
                invocation.page = Some(
                    next_value(&mut args, "--page")?
                        .parse::<u32>()
                        .map_err(|error| io_other(format!("invalid --page value: {error}")))?,
                );
            }
            "--page-size" => {
                invocation.page_size = Some(
                    next_value(&mut args, "--page-size")?
                        .parse::<u32>()
                        .map_err(|error| io_other(format!("invalid --page-size value: {error}")))?,
                );
            }
            "--sort-by" => invocation.sort_by = Some(next_value(&mut args, "--sort-by")?),
            "--desc" => invocation.sort_desc = true,
            "--out" => invocation.out = Some(PathBuf::from(next_value(&mut args, "--out")?)),
            flag if flag.starts_with("--") => {
                return Err(io_other(format!("unknown argument `{flag}`")));
            }
            _ => invocation.positionals.push(arg),
        }
    }

    let command = command_from(&invocation)?;
    Ok(ParseOutcome::Run(invocation, command))
}

fn command_from(invocation: &Invocation) -> io::Result<Command> {
    let mut positionals = invocation.positionals.iter().cloned();
    let name = positionals
        .next()
        .ok_or_else(|| io_other("missing command; see --help"))?;
    let mut required = |what: &str| {
        positionals
            .next()
            .ok_or_else(|| io_other(format!("`{name}` needs a {what}")))
    };

    let command = match name.as_str() {
        "connections" => Command::Connections,
        "databases" => Command::Databases {
            connection: required("connection id")?,
        },
        "tables" => Command::Tables {
            connection: required("connection id")?,
        },
        "schema" => Command::Schema {
            connection: required("connection id")?,
            table: required("table name")?,
        },
        "query" => Command::Query {
            connection: required("connection id")?,
            sql: required("query")?,
        },
        "preview-types" => {
            let connection = required("connection id")?;
            let raw_target = required("target database type")?;
            let target = DatabaseType::parse(&raw_target)
                .ok_or_else(|| io_other(format!("unknown database type `{raw_target}`")))?;
            let tables = positionals.by_ref().collect::<Vec<_>>();
            if tables.is_empty() {
                return Err(io_other("`preview-types` needs at least one table"));
            }
            Command::PreviewTypes {
                connection,
                target,
                tables,
            }
        }
        "export-csv" => Command::ExportCsv {
            connection: required("connection id")?,
            sql: required("query")?,
            out: invocation
                .out
                .clone()
                .ok_or_else(|| io_other("`export-csv` needs --out <path>"))?,
        },
        other => return Err(io_other(format!("unknown command `{other}`"))),
    };

    if let Some(extra) = positionals.next() {
        return Err(io_other(format!("unexpected argument `{extra}`")));
    }
    Ok(command)
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> io::Result<String> {
    args.next()
        .ok_or_else(|| io_other(format!("missing value for `{flag}`")))
}

fn load_config(invocation: &Invocation) -> Result<SessionConfig, Box<dyn std::error::Error>> {
    let mut config = match &invocation.config_path {
        Some(path) => SessionConfig::load_from_path(path)?.with_env_overrides(),
        None => SessionConfig::load_default()?,
    };
    if let Some(url) = &invocation.gateway_url {
        config.gateway.base_url.clone_from(url);
    }
    Ok(config)
}

fn log_filter(config: &SessionConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn query_options(invocation: &Invocation) -> QueryOptions {
    let mut options = QueryOptions {
        database: invocation.database.clone(),
        page: invocation.page,
        page_size: invocation.page_size,
        ..QueryOptions::default()
    };
    if let Some(schema) = &invocation.schema {
        options = options.with_schema(schema.clone());
    }
    if let Some(column) = &invocation.sort_by {
        options = options.sorted_by(column.clone(), invocation.sort_desc);
    }
    options
}

async fn run(
    session: &Session<HttpGateway>,
    invocation: &Invocation,
    command: Command,
) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let database = invocation.database.as_deref();
    let schema = invocation.schema.as_deref();

    let output = match command {
        Command::Connections => {
            let connections = session.registry().fetch_connections().await?;
            json!({
                "groups": session.registry().list_groups(),
                "connections": connections,
            })
        }
        Command::Databases { connection } => {
            json!(session.schema_cache().fetch_databases(&connection).await?)
        }
        Command::Tables { connection } => {
            json!(session
                .schema_cache()
                .fetch_tables(&connection, database, schema)
                .await?)
        }
        Command::Schema { connection, table } => {
            session.registry().fetch_connections().await?;
            json!(session
                .focus_table_schema(&connection, &table, database, schema)
                .await?)
        }
        Command::Query { connection, sql } => {
            json!(session
                .queries()
                .execute(&connection, &sql, Some(query_options(invocation)))
                .await?)
        }
        Command::PreviewTypes {
            connection,
            target,
            tables,
        } => {
            let plan = session.type_mapping().plan(&connection, &tables, target).await?;
            json!({
                "result": plan.result(),
                "unresolved": plan.unresolved(),
            })
        }
        Command::ExportCsv {
            connection,
            sql,
            out,
        } => {
            let payload = session
                .exports()
                .export_csv(&connection, &sql, &CsvOptions::default(), database)
                .await?;
            let written = save_download(&out, &payload)?;
            json!({ "path": out.display().to_string(), "bytes": written })
        }
    };
    Ok(output)
}

fn print_help() {
    println!(
        "dbm gateway client\n\n\
Usage:\n  dbm-app [OPTIONS] <COMMAND> [ARGS]\n\n\
Commands:\n  connections                               List groups and connections\n  databases <connection>                    List databases\n  tables <connection>                       List tables (--database, --schema)\n  schema <connection> <table>               Show a table schema (--database, --schema)\n  query <connection> <sql>                  Run a query (--database, --schema, --page, --page-size,\n                                            --sort-by <column>, --desc)\n  preview-types <connection> <target> <table>...\n                                            Preview SQL export type mapping\n  export-csv <connection> <sql> --out <path>\n                                            Download a CSV export\n\n\
Options:\n  --config <path>                           Config file (default: platform config dir)\n  --gateway <url>                           Gateway base url override\n\n\
Environment:\n  DBM_CONFIG_DIR, DBM_GATEWAY_URL, RUST_LOG\n"
    );
}

fn io_other(error: impl std::fmt::Display) -> io::Error {
    io::Error::other(error.to_string())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (invocation, command) = match parse_args_from(std::env::args().skip(1))? {
        ParseOutcome::Run(invocation, command) => (invocation, command),
        ParseOutcome::HelpRequested => {
            print_help();
            return Ok(());
        }
    };

    let config = load_config(&invocation)?;
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(&config))
        .with_writer(io::stderr)
        .init();
    debug!(gateway = %config.gateway.base_url, ?command, "starting");

    let gateway = HttpGateway::new(&config.gateway)?;
    let session = Session::new(Arc::new(gateway), &config);
    let output = run(&session, &invocation, command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
