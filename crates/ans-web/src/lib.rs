//! Axum JSON search endpoint and the fixed expense aggregations.

use std::sync::Arc;
use std::time::Duration;

use ans_core::{
    DatabaseConfig, EtlError, ExpenseRanking, OperatorRecord, OperatorSearchHit, StatementEntry,
    TableRow,
};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "ans-web";

pub const MIN_TERM_LEN: usize = 3;
pub const SEARCH_LIMIT: i64 = 10;

pub const DEFAULT_EXPENSE_CATEGORY: &str =
    "EVENTOS/ SINISTROS CONHECIDOS OU AVISADOS  DE ASSISTÊNCIA A SAÚDE MEDICO HOSPITALAR";

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
}

impl AppState {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Pool connects on first query, so the server starts without a database.
    pub fn lazy(config: &DatabaseConfig, acquire_timeout: Duration) -> Result<Self, EtlError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(&config.url)?;
        Ok(Self::new(pool))
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct SearchQuery {
    pub termo: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub data: Vec<OperatorSearchHit>,
}

#[derive(Debug)]
pub enum ApiError {
    InvalidTerm(String),
    Search(EtlError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            Self::InvalidTerm(detail) => (StatusCode::UNPROCESSABLE_ENTITY, detail),
            Self::Search(EtlError::Schema(table)) => {
                (StatusCode::NOT_FOUND, format!("Tabela '{table}' não encontrada."))
            }
            Self::Search(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Erro ao realizar a busca: {err}"),
            ),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

pub fn validate_term(termo: Option<&str>) -> Result<&str, ApiError> {
    match termo {
        None => Err(ApiError::InvalidTerm("O parâmetro 'termo' é obrigatório.".to_string())),
        Some(t) if t.chars().count() < MIN_TERM_LEN => Err(ApiError::InvalidTerm(format!(
            "O parâmetro 'termo' deve ter pelo menos {MIN_TERM_LEN} caracteres."
        ))),
        Some(t) => Ok(t),
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/operadoras/busca", get(search_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &DatabaseConfig, port: u16) -> anyhow::Result<()> {
    let state = AppState::lazy(config, Duration::from_secs(30))?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "search endpoint listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchResponse>, ApiError> {
    let termo = validate_term(query.termo.as_deref())?;
    let data = search_operators(&state.pool, termo).await.map_err(|err| {
        warn!(error = %err, termo, "operator search failed");
        ApiError::Search(err)
    })?;
    Ok(Json(SearchResponse { data }))
}

/// Case-insensitive substring match on legal or trade name, at most ten rows.
pub async fn search_operators(
    pool: &PgPool,
    termo: &str,
) -> Result<Vec<OperatorSearchHit>, EtlError> {
    let pattern = format!("%{termo}%");
    let rows = sqlx::query(
        r#"
        SELECT id::bigint AS id,
               registro_ans::text AS registro_ans,
               cnpj::text AS cnpj,
               razao_social::text AS razao_social,
               nome_fantasia::text AS nome_fantasia,
               modalidade::text AS modalidade,
               cidade::text AS cidade,
               uf::text AS uf
          FROM operadoras
         WHERE razao_social ILIKE $1 OR nome_fantasia ILIKE $1
         LIMIT $2
        "#,
    )
    .bind(&pattern)
    .bind(SEARCH_LIMIT)
    .fetch_all(pool)
    .await
    .map_err(|e| EtlError::from_db(e, OperatorRecord::TABLE))?;

    rows.iter()
        .map(|row| {
            Ok::<_, EtlError>(OperatorSearchHit {
                id: row.try_get("id")?,
                registro_ans: row.try_get("registro_ans")?,
                cnpj: row.try_get("cnpj")?,
                razao_social: row.try_get("razao_social")?,
                nome_fantasia: row.try_get("nome_fantasia")?,
                modalidade: row.try_get("modalidade")?,
                cidade: row.try_get("cidade")?,
                uf: row.try_get("uf")?,
            })
        })
        .collect()
}

const RANKING_SELECT: &str = r#"
    SELECT o.registro_ans::text AS registro_ans,
           MAX(o.razao_social)::text AS razao_social,
           COALESCE(SUM(d.vl_saldo_final), 0)::float8 AS total
      FROM demonstracoes_contabeis d
      JOIN operadoras o ON o.registro_ans::text = d.reg_ans::text
     WHERE UPPER(TRIM(d.descricao)) = UPPER($1)
"#;

const RANKING_TAIL: &str = r#"
     GROUP BY o.registro_ans
     ORDER BY total DESC
     LIMIT 10
"#;

fn ranking_rows(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<ExpenseRanking>, EtlError> {
    rows.iter()
        .map(|row| {
            Ok::<_, EtlError>(ExpenseRanking {
                registro_ans: row.try_get("registro_ans")?,
                razao_social: row.try_get("razao_social")?,
                total: row.try_get("total")?,
            })
        })
        .collect()
}

/// Top operators by closing balance within the most recent quarter on file.
///
/// A missing table is reported by the relation name the server rejected.
pub async fn top_expenses_last_quarter(
    pool: &PgPool,
    category: &str,
) -> Result<Vec<ExpenseRanking>, EtlError> {
    let sql = format!(
        "{RANKING_SELECT}
       AND date_trunc('quarter', d.data) =
           (SELECT date_trunc('quarter', MAX(data)) FROM demonstracoes_contabeis)
{RANKING_TAIL}"
    );
    let rows = sqlx::query(&sql)
        .bind(category)
        .fetch_all(pool)
        .await
        .map_err(|e| EtlError::from_db(e, StatementEntry::TABLE))?;
    ranking_rows(rows)
}

pub async fn top_expenses_for_year(
    pool: &PgPool,
    category: &str,
    year: i32,
) -> Result<Vec<ExpenseRanking>, EtlError> {
    let sql = format!(
        "{RANKING_SELECT}
       AND d.data >= make_date($2, 1, 1)
       AND d.data < make_date($2 + 1, 1, 1)
{RANKING_TAIL}"
    );
    let rows = sqlx::query(&sql)
        .bind(category)
        .bind(year)
        .fetch_all(pool)
        .await
        .map_err(|e| EtlError::from_db(e, StatementEntry::TABLE))?;
    ranking_rows(rows)
}
