use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

use tanker::{Config, Error, Rows, Tanker, Value};

#[derive(Parser)]
#[command(name = "tk", about = "Schema-driven relational access layer")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "tanker.yaml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List tables, or the columns of one table
    Info { table: Option<String> },

    /// Read a view; target is <table>[+field…]
    Read {
        target: String,
        /// Filter expression
        #[arg(short = 'F', long)]
        filter: Option<String>,
        /// Row limit
        #[arg(short, long)]
        limit: Option<u64>,
        /// Order field, optionally <field>:desc; repeatable
        #[arg(short, long)]
        order: Vec<String>,
        /// Tabular output instead of CSV
        #[arg(short = 't', long)]
        table: bool,
    },

    /// Write CSV rows into a table; the header row names the fields
    Write {
        table: String,
        /// CSV input file (defaults to stdin)
        #[arg(short, long)]
        file: Option<String>,
    },

    /// Delete rows matching a filter
    Delete {
        table: String,
        #[arg(short = 'F', long)]
        filter: String,
    },

    /// Create missing tables and indexes
    Init,

    /// Print the version
    Version,
}

fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<Error>() {
        Some(Error::Driver(_)) => 2,
        Some(Error::Constraint { .. }) => 3,
        Some(_) => 1,
        None => 1,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tk: error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Version = cli.command {
        println!("tk {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = Config::from_file(&cli.config)?;
    let tk = Tanker::connect(config).await?;

    match cli.command {
        Command::Version => unreachable!("handled above"),
        Command::Info { table } => info(&tk, table.as_deref()),
        Command::Init => {
            tk.create_tables().await?;
            Ok(())
        }
        Command::Read {
            target,
            filter,
            limit,
            order,
            table,
        } => {
            let mut parts = target.split('+');
            let base = parts.next().expect("split yields at least one part");
            let fields: Vec<&str> = parts.collect();

            let mut scope = tk.begin().await?;
            let mut view = scope.view(base)?;
            if !fields.is_empty() {
                view = view.fields(fields);
            }
            if let Some(f) = &filter {
                view = view.filter(f);
            }
            if let Some(n) = limit {
                view = view.limit(n);
            }
            for o in &order {
                view = match o.split_once(':') {
                    Some((field, "desc")) => view.order_by_desc(field),
                    Some((field, _)) => view.order_by(field),
                    None => view.order_by(o),
                };
            }
            let rows = view.read().await?;
            scope.commit().await?;

            if table {
                print_table(&rows);
            } else {
                print_csv(&rows)?;
            }
            Ok(())
        }
        Command::Write { table, file } => {
            let input: Box<dyn std::io::Read> = match &file {
                Some(path) => Box::new(std::fs::File::open(path)?),
                None => Box::new(std::io::stdin()),
            };
            let mut reader = csv::Reader::from_reader(input);
            let fields: Vec<String> = reader
                .headers()?
                .iter()
                .map(str::to_owned)
                .collect();

            let types: Vec<_> = fields
                .iter()
                .map(|f| tk.schema().terminal_type(&table, f))
                .collect::<tanker::Result<_>>()?;

            let mut rows = Vec::new();
            for record in reader.records() {
                let record = record?;
                let row: Vec<Value> = record
                    .iter()
                    .zip(&types)
                    .map(|(cell, ty)| Value::parse_typed(ty, cell))
                    .collect::<tanker::Result<_>>()?;
                rows.push(row);
            }

            let mut scope = tk.begin().await?;
            let n = scope.view(&table)?.fields(&fields).write(rows).await?;
            scope.commit().await?;
            eprintln!("{n} row(s) written");
            Ok(())
        }
        Command::Delete { table, filter } => {
            let mut scope = tk.begin().await?;
            let n = scope.view(&table)?.filter(&filter).delete().await?;
            scope.commit().await?;
            eprintln!("{n} row(s) deleted");
            Ok(())
        }
    }
}

fn info(tk: &Tanker, table: Option<&str>) -> Result<()> {
    match table {
        None => {
            for t in tk.schema().tables() {
                println!("{}", t.name);
            }
        }
        Some(name) => {
            let t = tk.schema().table(name)?;
            for c in t.columns.values() {
                let kind = match &c.kind {
                    tanker::schema::ColKind::Scalar(ty) => ty.to_string(),
                    tanker::schema::ColKind::ManyToOne { table, column } => {
                        format!("m2o {table}.{column}")
                    }
                    tanker::schema::ColKind::OneToMany { table, column } => {
                        format!("o2m {table}.{column}")
                    }
                };
                let key = if t.key.contains(&c.name) { " [key]" } else { "" };
                println!("{}\t{kind}{key}", c.name);
            }
        }
    }
    Ok(())
}

fn print_csv(rows: &Rows) -> Result<()> {
    let stdout = std::io::stdout();
    let mut writer = csv::Writer::from_writer(stdout.lock());
    writer.write_record(rows.names())?;
    for row in rows.all() {
        writer.write_record(row.iter().map(Value::to_string))?;
    }
    writer.flush()?;
    Ok(())
}

fn print_table(rows: &Rows) {
    let mut widths: Vec<usize> = rows.names().iter().map(String::len).collect();
    let rendered: Vec<Vec<String>> = rows
        .all()
        .iter()
        .map(|row| row.iter().map(Value::to_string).collect())
        .collect();
    for row in &rendered {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }
    let line = |cells: Vec<&str>| {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{c:<w$}"))
            .collect();
        println!("{}", padded.join("  "));
    };
    line(rows.names().iter().map(String::as_str).collect());
    for row in &rendered {
        line(row.iter().map(String::as_str).collect());
    }
}
