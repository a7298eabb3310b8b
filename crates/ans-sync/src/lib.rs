//! Field normalization, bulk loading and the batch pipeline driver.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use ans_adapters::{download_annex_pdfs, extract_table_to_csv, write_rows_csv};
use ans_core::{
    ensure_non_empty, DatabaseConfig, DocumentRef, EtlError, OperatorRecord, PipelineConfig, Result,
    Row, StatementEntry, TableRow,
};
use ans_storage::{compress, extract, DocumentFetcher, HttpClientConfig};
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
pub use sqlx::PgPool;
use tokio::io::AsyncReadExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ans-sync";

/// Replaces phone values longer than [`MAX_PHONE_LEN`].
pub const PHONE_SENTINEL: &str = "000000000";
pub const MAX_PHONE_LEN: usize = 15;

/// Exact-match cell expansions for the procedures table.
pub const ABBREVIATIONS: &[(&str, &str)] = &[("OD", "Odontologia"), ("AMB", "Ambulatorial")];

const COPY_BUFFER: usize = 64 * 1024;

pub fn expand_abbreviations(rows: &mut [Row]) {
    for row in rows {
        for cell in row.iter_mut() {
            let expansion = ABBREVIATIONS.iter().find(|(abbr, _)| *abbr == cell.as_str());
            if let Some((_, full)) = expansion {
                *cell = full.to_string();
            }
        }
    }
}

fn read_rows_csv(path: &Path) -> Result<Vec<Row>> {
    if !path.is_file() {
        return Err(EtlError::not_found(format!("csv not found: {}", path.display())));
    }
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.records() {
        rows.push(record?.iter().map(ToString::to_string).collect());
    }
    Ok(rows)
}

/// Expand abbreviations across every cell of `input`, header included.
pub fn expand_abbreviations_csv(input: &Path, output: &Path) -> Result<usize> {
    let mut rows = read_rows_csv(input)?;
    expand_abbreviations(&mut rows);
    write_rows_csv(&rows, output)?;
    ensure_non_empty(output, "expanded csv")?;
    info!(rows = rows.len(), output = %output.display(), "abbreviations expanded");
    Ok(rows.len())
}

fn present(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim)
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("nan"))
}

/// Parse a balance in either `1.234,56` or `1234.56` form; missing is zero.
pub fn parse_balance(raw: Option<&str>) -> Result<f64> {
    let Some(value) = present(raw) else {
        return Ok(0.0);
    };
    let canonical: Cow<str> = if value.contains(',') {
        Cow::Owned(value.replace('.', "").replace(',', "."))
    } else {
        Cow::Borrowed(value)
    };
    canonical
        .parse::<f64>()
        .map_err(|_| EtlError::integrity(format!("unparseable balance: {value:?}")))
}

pub fn normalize_balance(raw: Option<&str>) -> Result<String> {
    parse_balance(raw).map(|v| v.to_string())
}

/// First two digits of the area code with separators stripped, or `"0"`.
pub fn normalize_ddd(raw: Option<&str>) -> String {
    let digits = present(raw)
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_digit)
        .take(2)
        .collect::<String>();
    if digits.is_empty() {
        "0".to_string()
    } else {
        digits
    }
}

pub fn normalize_phone(raw: Option<&str>) -> String {
    let value = raw.unwrap_or_default().trim();
    if value.chars().count() > MAX_PHONE_LEN {
        PHONE_SENTINEL.to_string()
    } else {
        value.to_string()
    }
}

/// Rewrite `dd/mm/yyyy` as ISO; anything else passes through.
pub fn normalize_date(raw: Option<&str>) -> String {
    let value = raw.unwrap_or_default().trim();
    match NaiveDate::parse_from_str(value, "%d/%m/%Y") {
        Ok(date) => date.format("%Y-%m-%d").to_string(),
        Err(_) => value.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRule {
    Balance,
    AreaCode,
    Phone,
    Date,
}

impl ColumnRule {
    pub fn apply(self, raw: Option<&str>) -> Result<String> {
        Ok(match self {
            Self::Balance => normalize_balance(raw)?,
            Self::AreaCode => normalize_ddd(raw),
            Self::Phone => normalize_phone(raw),
            Self::Date => normalize_date(raw),
        })
    }
}

/// Validates one cleaned record before it is written.
pub type RecordCheck = fn(&csv::StringRecord) -> Result<()>;

/// Header name (case-insensitive) to cleanup rule, plus an optional row check.
#[derive(Debug, Clone)]
pub struct CleanupRules {
    pub columns: Vec<(&'static str, ColumnRule)>,
    pub check: Option<RecordCheck>,
}

/// Require `record` to deserialize positionally into `T`'s table row.
pub fn check_record<T: TableRow>(record: &csv::StringRecord) -> Result<()> {
    if record.len() != T::COLUMNS.len() {
        return Err(EtlError::integrity(format!(
            "{}: expected {} fields, found {}",
            T::TABLE,
            T::COLUMNS.len(),
            record.len()
        )));
    }
    record
        .deserialize::<T>(None)
        .map(drop)
        .map_err(|e| EtlError::integrity(format!("{}: invalid row: {e}", T::TABLE)))
}

impl CleanupRules {
    pub fn statements() -> Self {
        Self {
            columns: vec![
                ("DATA", ColumnRule::Date),
                ("VL_SALDO_INICIAL", ColumnRule::Balance),
                ("VL_SALDO_FINAL", ColumnRule::Balance),
            ],
            check: Some(check_record::<StatementEntry>),
        }
    }

    pub fn registry() -> Self {
        Self {
            columns: vec![
                ("DDD", ColumnRule::AreaCode),
                ("Telefone", ColumnRule::Phone),
                ("Data_Registro_ANS", ColumnRule::Date),
            ],
            check: Some(check_record::<OperatorRecord>),
        }
    }

    fn rule_for(&self, header: &str) -> Option<ColumnRule> {
        let header = header.trim().trim_start_matches('\u{feff}');
        self.columns
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(header))
            .map(|(_, rule)| *rule)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Dataset {
    Statements,
    Registry,
}

static STATEMENTS_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[1-4]T\d{4}\.csv$").expect("valid statements pattern"));
static REGISTRY_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(opsa|relatorio_cadop)\.csv$").expect("valid registry pattern")
});

impl Dataset {
    pub fn for_file(name: &str) -> Option<Self> {
        if STATEMENTS_FILE.is_match(name) {
            Some(Self::Statements)
        } else if REGISTRY_FILE.is_match(name) {
            Some(Self::Registry)
        } else {
            None
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Self::Statements => StatementEntry::TABLE,
            Self::Registry => OperatorRecord::TABLE,
        }
    }

    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Self::Statements => StatementEntry::COLUMNS,
            Self::Registry => OperatorRecord::COLUMNS,
        }
    }

    pub fn cleanup_rules(self) -> CleanupRules {
        match self {
            Self::Statements => CleanupRules::statements(),
            Self::Registry => CleanupRules::registry(),
        }
    }

    pub fn copy_statement(self) -> String {
        format!(
            "COPY {} ({}) FROM STDIN \
             WITH (FORMAT csv, DELIMITER ';', HEADER true, ENCODING 'UTF8')",
            self.table(),
            self.columns().join(", ")
        )
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Apply `rules` to the matching columns of a headed semicolon CSV.
///
/// Each cleaned row must pass the rules' check; the first failing row aborts.
pub fn normalize_csv(input: &Path, output: &Path, rules: &CleanupRules) -> Result<usize> {
    if !input.is_file() {
        return Err(EtlError::not_found(format!("csv not found: {}", input.display())));
    }
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .flexible(true)
        .from_path(input)?;
    let headers = reader.headers()?.clone();
    let plan = headers.iter().map(|h| rules.rule_for(h)).collect::<Vec<_>>();

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b';')
        .flexible(true)
        .from_path(output)?;
    writer.write_record(&headers)?;

    let mut rows = 0usize;
    for record in reader.records() {
        let record = record?;
        let mut out = Vec::with_capacity(plan.len().max(record.len()));
        for (idx, rule) in plan.iter().enumerate() {
            let raw = record.get(idx);
            out.push(match rule {
                Some(rule) => rule.apply(raw)?,
                None => raw.unwrap_or_default().to_string(),
            });
        }
        out.extend(record.iter().skip(plan.len()).map(ToString::to_string));
        let cleaned = csv::StringRecord::from(out);
        if let Some(check) = rules.check {
            check(&cleaned).map_err(|err| match err {
                EtlError::Integrity(msg) => {
                    EtlError::integrity(format!("{} row {}: {msg}", input.display(), rows + 2))
                }
                other => other,
            })?;
        }
        writer.write_record(&cleaned)?;
        rows += 1;
    }
    writer.flush()?;
    drop(writer);

    ensure_non_empty(output, "normalized csv")?;
    Ok(rows)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedFile {
    pub dataset: Dataset,
    pub path: PathBuf,
    pub rows: usize,
}

fn routed_csvs(dir: &Path) -> Result<Vec<(Dataset, PathBuf)>> {
    if !dir.is_dir() {
        return Err(EtlError::not_found(format!("directory not found: {}", dir.display())));
    }
    let mut files = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect::<Vec<_>>();
    files.sort();

    let mut routed = Vec::new();
    for path in files {
        let name = file_name(&path);
        match Dataset::for_file(&name) {
            Some(dataset) => routed.push((dataset, path)),
            None => warn!(file = %name, "no route for file, skipping"),
        }
    }
    Ok(routed)
}

/// Normalize every routed CSV in `input_dir` into `output_dir`, same file names.
pub fn normalize_directory(input_dir: &Path, output_dir: &Path) -> Result<Vec<NormalizedFile>> {
    let mut out = Vec::new();
    for (dataset, path) in routed_csvs(input_dir)? {
        let target = output_dir.join(file_name(&path));
        let rows = normalize_csv(&path, &target, &dataset.cleanup_rules())?;
        info!(?dataset, rows, file = %target.display(), "csv normalized");
        out.push(NormalizedFile {
            dataset,
            path: target,
            rows,
        });
    }
    Ok(out)
}

pub async fn connect_pool(config: &DatabaseConfig) -> Result<PgPool> {
    Ok(PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&config.url)
        .await?)
}

async fn ensure_table_exists(conn: &mut sqlx::PgConnection, table: &str) -> Result<()> {
    let found: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
        .bind(table)
        .fetch_one(&mut *conn)
        .await?;
    match found {
        Some(_) => Ok(()),
        None => Err(EtlError::Schema(table.to_string())),
    }
}

async fn copy_file(conn: &mut sqlx::PgConnection, dataset: Dataset, path: &Path) -> Result<u64> {
    let table = dataset.table();
    let mut file = tokio::fs::File::open(path).await?;
    let mut copy = conn
        .copy_in_raw(&dataset.copy_statement())
        .await
        .map_err(|e| EtlError::from_db(e, table))?;

    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        let read = match file.read(&mut buf).await {
            Ok(read) => read,
            Err(err) => {
                let _ = copy.abort(err.to_string()).await;
                return Err(err.into());
            }
        };
        if read == 0 {
            break;
        }
        copy.send(&buf[..read])
            .await
            .map_err(|e| EtlError::from_db(e, table))?;
    }
    copy.finish().await.map_err(|e| EtlError::from_db(e, table))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadedFile {
    pub table: String,
    pub path: PathBuf,
    pub rows: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub files: Vec<LoadedFile>,
}

impl LoadSummary {
    pub fn total_rows(&self) -> u64 {
        self.files.iter().map(|f| f.rows).sum()
    }
}

/// COPY each routed file into its table inside one transaction.
///
/// Nothing is committed unless every file loads; dropping the transaction on
/// error rolls back earlier copies.
pub async fn load_files(pool: &PgPool, files: &[(Dataset, PathBuf)]) -> Result<LoadSummary> {
    let mut tx = pool.begin().await?;
    let mut summary = LoadSummary::default();

    for (dataset, path) in files {
        ensure_non_empty(path, "csv to load")?;
        let span = info_span!("copy", table = dataset.table(), file = %path.display());
        let rows = async {
            ensure_table_exists(&mut tx, dataset.table()).await?;
            let rows = copy_file(&mut tx, *dataset, path).await?;
            info!(rows, "copied");
            Ok::<_, EtlError>(rows)
        }
        .instrument(span)
        .await?;
        summary.files.push(LoadedFile {
            table: dataset.table().to_string(),
            path: path.clone(),
            rows,
        });
    }

    tx.commit().await?;
    info!(files = summary.files.len(), rows = summary.total_rows(), "load committed");
    Ok(summary)
}

pub async fn load_directory(pool: &PgPool, dir: &Path) -> Result<LoadSummary> {
    let files = routed_csvs(dir)?;
    load_files(pool, &files).await
}

/// Drop every table in the `public` schema.
pub async fn reset_database(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        DO $$ DECLARE
            r RECORD;
        BEGIN
            FOR r IN (SELECT tablename FROM pg_tables WHERE schemaname = 'public') LOOP
                EXECUTE 'DROP TABLE IF EXISTS ' || quote_ident(r.tablename) || ' CASCADE';
            END LOOP;
        END $$;
        "#,
    )
    .execute(pool)
    .await?;
    info!("all public tables dropped");
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeSummary {
    pub pdfs: Vec<PathBuf>,
    pub archive: PathBuf,
    pub extracted_to: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransformSummary {
    pub raw_csv: PathBuf,
    pub processed_csv: PathBuf,
    pub archive: PathBuf,
    /// PDF pages scanned for tables.
    pub pages: usize,
    /// Rows extracted from the PDF, header included.
    pub table_rows: usize,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchSummary {
    pub archives: Vec<PathBuf>,
    pub statements_dir: PathBuf,
    pub registry_csv: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scrape: ScrapeSummary,
    pub transform: TransformSummary,
    pub fetch: FetchSummary,
    pub normalized: Vec<NormalizedFile>,
    pub load: LoadSummary,
    pub report_path: PathBuf,
}

/// Sequential driver over the pipeline stages; holds config only.
pub struct Pipeline {
    config: PipelineConfig,
    fetcher: DocumentFetcher,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let fetcher = DocumentFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
        })?;
        Ok(Self { config, fetcher })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Download the annex PDFs, archive them, and verify the archive expands.
    pub async fn scrape_annexes(&self) -> Result<ScrapeSummary> {
        let downloads = &self.config.downloads_dir;
        let page_url = &self.config.sources.annex_page_url;
        let docs = download_annex_pdfs(&self.fetcher, page_url, downloads).await?;
        let pdfs = docs.into_iter().map(|d| d.path).collect::<Vec<_>>();
        let archive = compress(&pdfs, &downloads.join("Anexos.zip"))?;
        let extracted_to = extract(&archive, &downloads.join("extracted"))?;
        Ok(ScrapeSummary {
            pdfs,
            archive,
            extracted_to,
        })
    }

    /// Extract the procedures table from annex I and expand its abbreviations.
    pub fn transform_annex(&self) -> Result<TransformSummary> {
        let pdf = self.config.downloads_dir.join("Anexo_1.pdf");
        let raw_csv = self.config.data_dir.join("rol_procedimentos_raw.csv");
        let processed_csv = self.config.data_dir.join("rol_procedimentos.csv");

        let extraction = extract_table_to_csv(&pdf, &raw_csv)?;
        let rows = expand_abbreviations_csv(&raw_csv, &processed_csv)?;
        if rows != extraction.rows {
            return Err(EtlError::integrity(format!(
                "extracted {} rows but wrote {rows} to {}",
                extraction.rows,
                processed_csv.display()
            )));
        }
        let archive = compress(
            std::slice::from_ref(&processed_csv),
            &self.config.data_dir.join("rol_procedimentos.zip"),
        )?;
        Ok(TransformSummary {
            raw_csv,
            processed_csv,
            archive,
            pages: extraction.pages,
            table_rows: extraction.rows,
            rows,
        })
    }

    /// Download and expand the quarterly statements plus the operator registry.
    pub async fn fetch_statements(&self) -> Result<FetchSummary> {
        let downloads = &self.config.downloads_dir;
        let statements_dir = self.config.statements_dir();
        let docs = self
            .config
            .sources
            .statement_archive_urls
            .iter()
            .enumerate()
            .map(|(idx, url)| {
                let target = downloads.join(format!("DemCon_{}.zip", idx + 1));
                DocumentRef::new(url.clone(), target)
            })
            .collect::<Vec<_>>();

        let archives = self
            .fetcher
            .download_all(&docs)
            .await?
            .into_iter()
            .map(|d| d.path)
            .collect::<Vec<_>>();
        for archive in &archives {
            extract(archive, &statements_dir)?;
        }

        let registry = self
            .fetcher
            .download(&DocumentRef::new(
                self.config.sources.registry_csv_url.clone(),
                statements_dir.join("OPSA.csv"),
            ))
            .await?;

        Ok(FetchSummary {
            archives,
            statements_dir,
            registry_csv: registry.path,
        })
    }

    pub fn normalize(&self) -> Result<Vec<NormalizedFile>> {
        normalize_directory(&self.config.statements_dir(), &self.config.normalized_dir())
    }

    pub async fn load(&self, pool: &PgPool) -> Result<LoadSummary> {
        load_directory(pool, &self.config.normalized_dir()).await
    }

    /// Every stage in order; the first failure aborts the run.
    pub async fn run_once(&self, pool: &PgPool) -> Result<PipelineRunSummary> {
        let run_id = Uuid::new_v4();
        self.run_stages(run_id, pool)
            .instrument(info_span!("pipeline_run", %run_id))
            .await
    }

    async fn run_stages(&self, run_id: Uuid, pool: &PgPool) -> Result<PipelineRunSummary> {
        let started_at = Utc::now();
        let scrape = self.scrape_annexes().await?;
        let transform = self.transform_annex()?;
        let fetch = self.fetch_statements().await?;
        let normalized = self.normalize()?;
        let load = self.load(pool).await?;

        let report_dir = self.config.data_dir.join("reports").join(run_id.to_string());
        let summary = PipelineRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            scrape,
            transform,
            fetch,
            normalized,
            load,
            report_path: report_dir.join("run_summary.json"),
        };
        write_run_summary(&summary)?;
        Ok(summary)
    }
}

fn write_run_summary(summary: &PipelineRunSummary) -> Result<()> {
    if let Some(parent) = summary.report_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(summary)
        .map_err(|e| EtlError::integrity(format!("serializing run summary: {e}")))?;
    std::fs::write(&summary.report_path, bytes)?;
    Ok(())
}
