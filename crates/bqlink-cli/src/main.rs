use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bqlink_connector::WarehouseConnector;
use bqlink_core::{ConnectorConfig, ObjectUri, Schema};

/// Default config file looked up in the working directory
const DEFAULT_CONFIG: &str = "bqlink.toml";

/// bqlink - BigQuery dataset and table management
#[derive(Parser)]
#[command(name = "bqlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: bqlink.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the datasets of the project
    Datasets,

    /// Create a dataset (no-op if it exists)
    AddDataset {
        dataset: String,
    },

    /// List the tables of a dataset
    Tables {
        dataset: String,
    },

    /// Create a daily-partitioned table (no-op if it exists)
    CreateTable {
        dataset: String,
        table: String,

        /// JSON file with the column list
        #[arg(long, required_unless_present = "sample", conflicts_with = "sample")]
        schema: Option<PathBuf>,

        /// JSON file with one sample row to infer the columns from
        #[arg(long)]
        sample: Option<PathBuf>,

        /// Partition expiration in seconds (0 = never)
        #[arg(long, default_value_t = 0)]
        expiration: u64,
    },

    /// Show a table's columns
    Describe {
        dataset: String,
        table: String,
    },

    /// Read every row of a table and print the count
    Browse {
        dataset: String,
        table: String,
    },

    /// Replace a table with a copy of another
    Copy {
        dataset: String,
        source: String,
        destination: String,
    },

    /// Delete a table
    Delete {
        dataset: String,
        table: String,
    },

    /// Stream rows from a newline-delimited JSON file
    Insert {
        dataset: String,
        table: String,
        file: PathBuf,
    },

    /// Load CSV from a local file or an object-storage URI
    Import {
        dataset: String,
        table: String,

        /// Local path or URI such as gs://bucket/path/*.csv
        source: String,
    },

    /// Export a table as CSV to an object-storage URI
    Export {
        dataset: String,
        table: String,
        uri: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("{}", error_line(&e));
        std::process::exit(1);
    }
}

/// Fatal error with its context chain on one line
fn error_line(e: &anyhow::Error) -> String {
    format!("{} {:#}", "Error:".red().bold(), e)
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    dotenvy::dotenv().ok();

    let config = load_config(cli.config.as_deref(), cli.verbose)?;
    if cli.verbose {
        eprintln!("{} {}", "Using project".cyan(), config.project_id);
    }

    let connector = WarehouseConnector::connect(&config)
        .await
        .context("Failed to connect to BigQuery")?;
    tracing::debug!("Connected to {} project {}", connector.backend_name(), connector.project_id());

    match cli.command {
        Commands::Datasets => {
            for dataset in connector.list_datasets().await? {
                println!("{}", dataset);
            }
        }
        Commands::AddDataset { dataset } => {
            let dataset = connector.add_dataset(&dataset).await?;
            eprintln!("{} {}", "✓ Dataset ready:".green(), dataset);
        }
        Commands::Tables { dataset } => {
            for table in connector.list_tables(&dataset).await? {
                println!("{}", table);
            }
        }
        Commands::CreateTable { dataset, table, schema, sample, expiration } => {
            let schema = read_schema(schema.as_deref(), sample.as_deref())?;
            let table = connector
                .create_table_if_not_exists(&dataset, &table, &schema, expiration)
                .await?;
            eprintln!("{} {}", "✓ Table ready:".green(), table);
        }
        Commands::Describe { dataset, table } => {
            let schema = connector.describe_table(&dataset, &table).await?;
            print_schema(&schema);
        }
        Commands::Browse { dataset, table } => {
            let count = connector.browse_table(&dataset, &table).await?;
            println!("{}", count);
        }
        Commands::Copy { dataset, source, destination } => {
            connector.copy_table(&dataset, &source, &destination).await?;
            eprintln!("{} {} -> {}", "✓ Copied".green(), source, destination);
        }
        Commands::Delete { dataset, table } => {
            connector.delete_table(&dataset, &table).await?;
            eprintln!("{} {}.{}", "✓ Deleted".green(), dataset, table);
        }
        Commands::Insert { dataset, table, file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Cannot read {}", file.display()))?;
            let rows = parse_ndjson(&text)?;
            let summary = connector.save_events(&dataset, &table, &rows).await?;
            eprintln!("{} {} rows", "✓ Inserted".green(), summary.inserted);
        }
        Commands::Import { dataset, table, source } => {
            if is_object_uri(&source) {
                let uri = ObjectUri::parse(&source)?;
                connector.import_from_uri(&dataset, &table, &uri).await?;
            } else {
                connector.import_from_file(&dataset, &table, &source).await?;
            }
            eprintln!("{} {} into {}.{}", "✓ Imported".green(), source, dataset, table);
        }
        Commands::Export { dataset, table, uri } => {
            let uri = ObjectUri::parse(&uri)?;
            connector.export_to_uri(&dataset, &table, &uri).await?;
            eprintln!("{} {}.{} to {}", "✓ Exported".green(), dataset, table, uri);
        }
    }

    Ok(())
}

/// Config from file (explicit or default) with environment overrides
fn load_config(path: Option<&Path>, verbose: bool) -> Result<ConnectorConfig> {
    let project = std::env::var("BQLINK_PROJECT_ID").ok();
    let credentials = std::env::var("BQLINK_CREDENTIALS_DIR").ok();

    let config = if let Some(path) = path {
        Some(ConnectorConfig::from_file(path)?)
    } else if Path::new(DEFAULT_CONFIG).exists() {
        Some(ConnectorConfig::from_file(Path::new(DEFAULT_CONFIG))?)
    } else {
        if verbose {
            eprintln!("{}", "No config file found, using environment".yellow());
        }
        None
    };

    let config = apply_env_overrides(config, project, credentials)?;
    config.validate()?;
    Ok(config)
}

fn apply_env_overrides(
    config: Option<ConnectorConfig>,
    project: Option<String>,
    credentials: Option<String>,
) -> Result<ConnectorConfig> {
    let mut config = match (config, project) {
        (Some(mut config), Some(project)) => {
            config.project_id = project;
            config
        }
        (Some(config), None) => config,
        (None, Some(project)) => ConnectorConfig::new(project),
        (None, None) => {
            return Err(anyhow::anyhow!(
                "No project configured. Create {} or set BQLINK_PROJECT_ID.",
                DEFAULT_CONFIG
            ))
        }
    };

    if let Some(credentials) = credentials {
        config.credentials_dir = Some(PathBuf::from(credentials));
    }
    Ok(config)
}

fn read_schema(schema: Option<&Path>, sample: Option<&Path>) -> Result<Schema> {
    match (schema, sample) {
        (Some(path), _) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Cannot read {}", path.display()))?;
            Ok(Schema::from_json(&text)?)
        }
        (None, Some(path)) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Cannot read {}", path.display()))?;
            let sample: serde_json::Value = serde_json::from_str(&text)
                .with_context(|| format!("{} is not valid JSON", path.display()))?;
            Ok(Schema::infer_from_json(&sample)?)
        }
        (None, None) => Err(anyhow::anyhow!("Either --schema or --sample is required")),
    }
}

/// One JSON object per non-blank line
fn parse_ndjson(text: &str) -> Result<Vec<serde_json::Value>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid JSON on line {}", i + 1))
        })
        .collect()
}

fn is_object_uri(source: &str) -> bool {
    source.contains("://")
}

fn print_schema(schema: &Schema) {
    let width = schema.columns.iter().map(|c| c.name.len()).max().unwrap_or(0);

    for column in &schema.columns {
        println!(
            "{:width$}  {}  {}",
            column.name.bold(),
            column.logical_type.to_string().cyan(),
            column.mode.as_str().dimmed(),
            width = width
        );
    }
}
