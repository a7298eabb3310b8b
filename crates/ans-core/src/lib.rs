//! Core domain model, error taxonomy and configuration for the ANS pipeline.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ans-core";

/// One extracted table row: ordered string cells, one per column.
pub type Row = Vec<String>;

pub type Result<T, E = EtlError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum EtlError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("http status {status} for {url}")]
    Network { status: u16, url: String },
    #[error("integrity check failed: {0}")]
    Integrity(String),
    #[error("table '{0}' does not exist")]
    Schema(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    #[error("pdf: {0}")]
    Pdf(#[from] lopdf::Error),
    #[error("reading sources registry: {0}")]
    Registry(#[from] serde_yaml::Error),
}

impl EtlError {
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Map `undefined_table` (SQLSTATE 42P01) to `Schema`, keep anything else as-is.
    ///
    /// The relation named by the server wins over `table`, which only fills in
    /// when the message cannot be parsed.
    pub fn from_db(err: sqlx::Error, table: &str) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some(UNDEFINED_TABLE) {
                let missing = undefined_relation(db.message()).unwrap_or(table);
                return Self::Schema(missing.to_string());
            }
        }
        Self::Database(err)
    }
}

pub const UNDEFINED_TABLE: &str = "42P01";

/// Relation name from a `relation "x" does not exist` server message.
pub fn undefined_relation(message: &str) -> Option<&str> {
    let rest = message.strip_prefix("relation \"")?;
    let name = &rest[..rest.find('"')?];
    let name = name.rsplit('.').next().unwrap_or(name);
    (!name.is_empty()).then_some(name)
}

/// Fails with `IntegrityError` unless `path` exists and is non-empty.
pub fn ensure_non_empty(path: &Path, what: &str) -> Result<u64> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(meta.len()),
        Ok(_) => Err(EtlError::integrity(format!("{what} is empty: {}", path.display()))),
        Err(_) => Err(EtlError::integrity(format!("{what} is missing: {}", path.display()))),
    }
}

/// A remote document and where it should land on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub url: String,
    pub dest: PathBuf,
}

impl DocumentRef {
    pub fn new(url: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            dest: dest.into(),
        }
    }
}

/// Row of the `operadoras` registry table, in CSV column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorRecord {
    pub registro_ans: String,
    pub cnpj: String,
    pub razao_social: String,
    pub nome_fantasia: Option<String>,
    pub modalidade: Option<String>,
    pub logradouro: Option<String>,
    pub numero: Option<String>,
    pub complemento: Option<String>,
    pub bairro: Option<String>,
    pub cidade: Option<String>,
    pub uf: Option<String>,
    pub cep: Option<String>,
    pub ddd: Option<String>,
    pub telefone: Option<String>,
    pub fax: Option<String>,
    pub endereco_eletronico: Option<String>,
    pub representante: Option<String>,
    pub cargo_representante: Option<String>,
    pub regiao_de_comercializacao: Option<String>,
    pub data_registro_ans: Option<NaiveDate>,
}

/// A persisted entity loaded positionally from a normalized CSV.
pub trait TableRow: DeserializeOwned {
    const TABLE: &'static str;
    /// Target columns, in CSV field order.
    const COLUMNS: &'static [&'static str];
}

impl TableRow for OperatorRecord {
    const TABLE: &'static str = "operadoras";
    const COLUMNS: &'static [&'static str] = &[
        "registro_ans",
        "cnpj",
        "razao_social",
        "nome_fantasia",
        "modalidade",
        "logradouro",
        "numero",
        "complemento",
        "bairro",
        "cidade",
        "uf",
        "cep",
        "ddd",
        "telefone",
        "fax",
        "endereco_eletronico",
        "representante",
        "cargo_representante",
        "regiao_de_comercializacao",
        "data_registro_ans",
    ];
}

/// One accounting line of an operator's quarterly financial statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementEntry {
    pub data: NaiveDate,
    pub reg_ans: String,
    pub cd_conta_contabil: String,
    pub descricao: String,
    pub vl_saldo_inicial: f64,
    pub vl_saldo_final: f64,
}

impl TableRow for StatementEntry {
    const TABLE: &'static str = "demonstracoes_contabeis";
    const COLUMNS: &'static [&'static str] = &[
        "data",
        "reg_ans",
        "cd_conta_contabil",
        "descricao",
        "vl_saldo_inicial",
        "vl_saldo_final",
    ];
}

/// Projection returned by the operator text search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorSearchHit {
    pub id: i64,
    pub registro_ans: Option<String>,
    pub cnpj: Option<String>,
    pub razao_social: Option<String>,
    pub nome_fantasia: Option<String>,
    pub modalidade: Option<String>,
    pub cidade: Option<String>,
    pub uf: Option<String>,
}

/// One row of a top-N expense ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseRanking {
    pub registro_ans: String,
    pub razao_social: Option<String>,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub annex_page_url: String,
    pub registry_csv_url: String,
    #[serde(default)]
    pub statement_archive_urls: Vec<String>,
}

const ROL_PAGE_URL: &str = "https://www.gov.br/ans/pt-br/acesso-a-informacao/\
participacao-da-sociedade/atualizacao-do-rol-de-procedimentos";

impl Default for SourceRegistry {
    fn default() -> Self {
        let base = "https://dadosabertos.ans.gov.br/FTP/PDA";
        let statement_archive_urls = [2024, 2023]
            .into_iter()
            .flat_map(|year| {
                (1..=4).map(move |q| {
                    format!("{base}/demonstracoes_contabeis/{year}/{q}T{year}.zip")
                })
            })
            .collect();
        Self {
            annex_page_url: ROL_PAGE_URL.to_string(),
            registry_csv_url: format!(
                "{base}/operadoras_de_plano_de_saude_ativas/Relatorio_cadop.csv"
            ),
            statement_archive_urls,
        }
    }
}

impl SourceRegistry {
    /// Reads `sources.yaml` under `root`, falling back to the built-in sources.
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let path = root.join("sources.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        Ok(serde_yaml::from_str(&text)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            return Self { url };
        }
        let var =
            |key: &str, default: &str| std::env::var(key).unwrap_or_else(|_| default.to_string());
        Self {
            url: format!(
                "postgres://{}:{}@{}:{}/{}",
                var("DB_USER", "postgres"),
                var("DB_PASSWORD", "password"),
                var("DB_HOST", "localhost"),
                var("DB_PORT", "5432"),
                var("DB_NAME", "ans_database"),
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database: DatabaseConfig,
    pub downloads_dir: PathBuf,
    pub data_dir: PathBuf,
    pub user_agent: Option<String>,
    pub http_timeout_secs: u64,
    pub web_port: u16,
    pub report_year: i32,
    pub sources: SourceRegistry,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        let workspace_root = std::env::var("ANS_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Ok(Self {
            database: DatabaseConfig::from_env(),
            downloads_dir: std::env::var("ANS_DOWNLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("downloads")),
            data_dir: std::env::var("ANS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("data")),
            user_agent: std::env::var("ANS_USER_AGENT").ok(),
            http_timeout_secs: std::env::var("ANS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
            web_port: std::env::var("ANS_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            report_year: std::env::var("ANS_REPORT_YEAR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2024),
            sources: SourceRegistry::load_or_default(&workspace_root)?,
        })
    }

    /// Directory the statement archives and the registry CSV are expanded into.
    pub fn statements_dir(&self) -> PathBuf {
        self.downloads_dir.join("DemCon")
    }

    pub fn normalized_dir(&self) -> PathBuf {
        self.data_dir.join("normalized")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_sources_cover_two_years_of_quarters() {
        let sources = SourceRegistry::default();
        assert_eq!(sources.statement_archive_urls.len(), 8);
        assert!(sources.statement_archive_urls[0].ends_with("/2024/1T2024.zip"));
        assert!(sources.statement_archive_urls[7].ends_with("/2023/4T2023.zip"));
        assert!(sources.registry_csv_url.ends_with("Relatorio_cadop.csv"));
    }

    #[test]
    fn sources_yaml_overrides_defaults() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("sources.yaml"),
            "annex_page_url: http://localhost/rol\n\
             registry_csv_url: http://localhost/cadop.csv\n\
             statement_archive_urls:\n  - http://localhost/1T2024.zip\n",
        )
        .expect("write yaml");
        let sources = SourceRegistry::load_or_default(dir.path()).expect("load");
        assert_eq!(sources.annex_page_url, "http://localhost/rol");
        assert_eq!(sources.statement_archive_urls, vec!["http://localhost/1T2024.zip"]);
    }

    #[test]
    fn missing_sources_yaml_uses_defaults() {
        let dir = tempdir().expect("tempdir");
        let sources = SourceRegistry::load_or_default(dir.path()).expect("load");
        assert_eq!(sources, SourceRegistry::default());
    }

    #[test]
    fn ensure_non_empty_flags_missing_and_empty_files() {
        let dir = tempdir().expect("tempdir");
        let missing = dir.path().join("missing.csv");
        let empty = dir.path().join("empty.csv");
        let full = dir.path().join("full.csv");
        std::fs::write(&empty, b"").unwrap();
        std::fs::write(&full, b"a;b\n").unwrap();

        assert!(matches!(ensure_non_empty(&missing, "csv"), Err(EtlError::Integrity(_))));
        assert!(matches!(ensure_non_empty(&empty, "csv"), Err(EtlError::Integrity(_))));
        assert_eq!(ensure_non_empty(&full, "csv").unwrap(), 4);
    }

    #[test]
    fn column_lists_match_struct_fields() {
        assert_eq!(OperatorRecord::COLUMNS.len(), 20);
        assert_eq!(StatementEntry::COLUMNS.len(), 6);
        assert_eq!(OperatorRecord::COLUMNS[2], "razao_social");
    }

    #[test]
    fn statement_rows_deserialize_by_position() {
        let record = csv::StringRecord::from(vec![
            "2024-01-01",
            "326305",
            "411",
            "EVENTOS",
            "0",
            "1234.56",
        ]);
        let entry: StatementEntry = record.deserialize(None).unwrap();
        assert_eq!(entry.data, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(entry.vl_saldo_final, 1234.56);
    }

    #[test]
    fn undefined_relation_is_read_from_server_message() {
        assert_eq!(
            undefined_relation(r#"relation "operadoras" does not exist"#),
            Some("operadoras")
        );
        assert_eq!(
            undefined_relation(r#"relation "public.demonstracoes_contabeis" does not exist"#),
            Some("demonstracoes_contabeis")
        );
        assert_eq!(undefined_relation("syntax error at or near \"FROM\""), None);
    }
}
