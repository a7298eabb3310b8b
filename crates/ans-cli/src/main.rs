use ans_core::{ExpenseRanking, PipelineConfig};
use ans_sync::{connect_pool, reset_database, PgPool, Pipeline};
use ans_web::{top_expenses_for_year, top_expenses_last_quarter, DEFAULT_EXPENSE_CATEGORY};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "ans-cli")]
#[command(about = "ANS operator data pipeline")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download the annex PDFs and archive them.
    Scrape,
    /// Extract the procedures table from annex I.
    Transform,
    /// Download the quarterly statements and the operator registry.
    Fetch,
    /// Clean the downloaded CSVs for loading.
    Normalize,
    /// COPY the normalized CSVs into the database.
    Load,
    /// Print the top-10 expense rankings.
    Report {
        #[arg(long)]
        year: Option<i32>,
        #[arg(long, default_value = DEFAULT_EXPENSE_CATEGORY)]
        category: String,
    },
    /// Serve the operator search endpoint.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Drop every table in the public schema.
    Reset {
        #[arg(long)]
        yes: bool,
    },
    /// All batch stages in order, then the report.
    Run,
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = match cli.verbose {
        0 => "ans=info",
        1 => "ans=debug",
        _ => "ans=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    match cli.log_format {
        LogFormat::Text => fmt().with_env_filter(filter).with_target(false).init(),
        LogFormat::Json => fmt().json().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = PipelineConfig::from_env().context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Scrape => {
            let summary = Pipeline::new(config)?
                .scrape_annexes()
                .await
                .context("scraping annexes")?;
            println!(
                "scrape complete: pdfs={} archive={}",
                summary.pdfs.len(),
                summary.archive.display()
            );
        }
        Commands::Transform => {
            let summary = Pipeline::new(config)?
                .transform_annex()
                .context("transforming annex I")?;
            println!(
                "transform complete: pages={} rows={} csv={} archive={}",
                summary.pages,
                summary.rows,
                summary.processed_csv.display(),
                summary.archive.display()
            );
        }
        Commands::Fetch => {
            let summary = Pipeline::new(config)?
                .fetch_statements()
                .await
                .context("fetching statements")?;
            println!(
                "fetch complete: archives={} registry={}",
                summary.archives.len(),
                summary.registry_csv.display()
            );
        }
        Commands::Normalize => {
            let files = Pipeline::new(config)?.normalize().context("normalizing csv files")?;
            for file in &files {
                println!("{:?}\t{}\t{}", file.dataset, file.rows, file.path.display());
            }
        }
        Commands::Load => {
            let pool = connect_pool(&config.database).await.context("connecting to database")?;
            let summary = Pipeline::new(config)?.load(&pool).await.context("loading csv files")?;
            println!(
                "load complete: files={} rows={}",
                summary.files.len(),
                summary.total_rows()
            );
        }
        Commands::Report { year, category } => {
            let pool = connect_pool(&config.database).await.context("connecting to database")?;
            report(&pool, &category, year.unwrap_or(config.report_year)).await?;
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.web_port);
            ans_web::serve(&config.database, port).await?;
        }
        Commands::Reset { yes } => {
            if !yes {
                bail!("refusing to drop tables without --yes");
            }
            let pool = connect_pool(&config.database).await.context("connecting to database")?;
            reset_database(&pool).await.context("dropping tables")?;
            println!("reset complete");
        }
        Commands::Run => {
            let year = config.report_year;
            let pool = connect_pool(&config.database).await.context("connecting to database")?;
            let summary = Pipeline::new(config)?.run_once(&pool).await.context("pipeline run")?;
            println!(
                "run complete: run_id={} rows_loaded={} summary={}",
                summary.run_id,
                summary.load.total_rows(),
                summary.report_path.display()
            );
            report(&pool, DEFAULT_EXPENSE_CATEGORY, year).await?;
        }
    }

    Ok(())
}

async fn report(pool: &PgPool, category: &str, year: i32) -> Result<()> {
    let quarter = top_expenses_last_quarter(pool, category)
        .await
        .context("last-quarter ranking")?;
    print_ranking("Top 10 operadoras no último trimestre", &quarter);

    let annual = top_expenses_for_year(pool, category, year)
        .await
        .context("annual ranking")?;
    print_ranking(&format!("Top 10 operadoras em {year}"), &annual);
    Ok(())
}

fn print_ranking(title: &str, rows: &[ExpenseRanking]) {
    println!("\n{title}");
    println!("{:<4} {:<10} {:<60} {:>20}", "#", "registro", "razao_social", "total");
    for (idx, row) in rows.iter().enumerate() {
        println!(
            "{:<4} {:<10} {:<60} {:>20.2}",
            idx + 1,
            row.registro_ans,
            row.razao_social.as_deref().unwrap_or("-"),
            row.total
        );
    }
}
