//! Bulk-load checks against a scratch schema; skipped without `TEST_DATABASE_URL`.

use std::path::Path;

use ans_core::{DatabaseConfig, EtlError, OperatorRecord, PipelineConfig, SourceRegistry, TableRow};
use ans_storage::compress;
use ans_sync::{load_directory, reset_database, Pipeline};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream, StringFormat};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SCHEMA_SQL: &str = include_str!("../../../sql/schema.sql");

async fn scratch_pool() -> Option<(PgPool, PgPool, String)> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL unset, skipping");
        return None;
    };
    let schema = format!("ans_sync_it_{}", uuid::Uuid::new_v4().simple());
    let admin = PgPool::connect(&url).await.unwrap();
    sqlx::query(&format!("CREATE SCHEMA {schema}"))
        .execute(&admin)
        .await
        .unwrap();
    let search_path = format!("SET search_path TO {schema}");
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .after_connect(move |conn, _meta| {
            let stmt = search_path.clone();
            Box::pin(async move { sqlx::query(&stmt).execute(conn).await.map(|_| ()) })
        })
        .connect(&url)
        .await
        .unwrap();
    Some((admin, pool, schema))
}

async fn drop_schema(admin: &PgPool, pool: PgPool, schema: &str) {
    pool.close().await;
    sqlx::query(&format!("DROP SCHEMA {schema} CASCADE"))
        .execute(admin)
        .await
        .unwrap();
}

async fn count(pool: &PgPool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .unwrap()
}

fn operator_row(date: &str) -> String {
    let mut row = vec![""; OperatorRecord::COLUMNS.len()];
    row[0] = "326305";
    row[1] = "29309127000179";
    row[2] = "AMIL ASSISTENCIA MEDICA LTDA";
    row[12] = "11";
    row[13] = "30049000";
    row[19] = date;
    row.join(";")
}

fn write_normalized(dir: &Path) {
    std::fs::write(
        dir.join("1T2024.csv"),
        "DATA;REG_ANS;CD_CONTA_CONTABIL;DESCRICAO;VL_SALDO_INICIAL;VL_SALDO_FINAL\n\
         2024-01-01;326305;411;EVENTOS;0;1234.56\n\
         2024-01-01;326305;412;OUTROS;10;0\n",
    )
    .unwrap();
    let header = OperatorRecord::COLUMNS.join(";");
    let row = operator_row("1999-01-01");
    std::fs::write(dir.join("OPSA.csv"), format!("{header}\n{row}\n")).unwrap();
}

#[tokio::test]
async fn load_copies_every_routed_file() {
    let Some((admin, pool, schema)) = scratch_pool().await else {
        return;
    };
    sqlx::raw_sql(SCHEMA_SQL).execute(&pool).await.unwrap();
    let dir = tempdir().unwrap();
    write_normalized(dir.path());

    let summary = load_directory(&pool, dir.path()).await.unwrap();
    assert_eq!(summary.files.len(), 2);
    assert_eq!(summary.total_rows(), 3);
    assert_eq!(count(&pool, "demonstracoes_contabeis").await, 2);
    assert_eq!(count(&pool, "operadoras").await, 1);

    drop_schema(&admin, pool, &schema).await;
}

#[tokio::test]
async fn missing_table_rolls_back_earlier_copies() {
    let Some((admin, pool, schema)) = scratch_pool().await else {
        return;
    };
    sqlx::raw_sql(SCHEMA_SQL).execute(&pool).await.unwrap();
    sqlx::query("DROP TABLE operadoras").execute(&pool).await.unwrap();
    let dir = tempdir().unwrap();
    write_normalized(dir.path());

    let err = load_directory(&pool, dir.path()).await.unwrap_err();
    assert!(matches!(err, EtlError::Schema(ref table) if table == "operadoras"));
    assert_eq!(count(&pool, "demonstracoes_contabeis").await, 0);

    drop_schema(&admin, pool, &schema).await;
}

#[tokio::test]
async fn reset_drops_public_tables() {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        return;
    };
    if std::env::var("TEST_ALLOW_RESET").is_err() {
        eprintln!("TEST_ALLOW_RESET unset, skipping destructive reset");
        return;
    }
    let pool = PgPool::connect(&url).await.unwrap();
    sqlx::query("CREATE TABLE IF NOT EXISTS public.ans_reset_probe (id INT)")
        .execute(&pool)
        .await
        .unwrap();
    reset_database(&pool).await.unwrap();
    let left: Option<String> =
        sqlx::query_scalar("SELECT to_regclass('public.ans_reset_probe')::text")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(left.is_none());
}

fn annex_pdf() -> Vec<u8> {
    let cells = [
        (50, 800, "PROCEDIMENTO"),
        (250, 800, "VIGÊNCIA"),
        (350, 800, "OD"),
        (50, 780, "CONSULTA"),
        (250, 780, "01/04/2021"),
        (350, 780, "OD"),
    ];
    let operations: Vec<Operation> = cells
        .iter()
        .flat_map(|(x, y, text)| {
            let bytes = Document::encode_text(Some("WinAnsiEncoding"), text);
            vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 8.into()]),
                Operation::new("Td", vec![(*x).into(), (*y).into()]),
                Operation::new("Tj", vec![Object::String(bytes, StringFormat::Literal)]),
                Operation::new("ET", vec![]),
            ]
        })
        .collect();

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });
    let content = Content { operations }.encode().unwrap();
    let content_id = doc.add_object(Stream::new(dictionary! {}, content));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
            "Resources" => resources_id,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

async fn mount(server: &MockServer, route: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn run_once_loads_every_stage_and_writes_report() {
    let Some((admin, pool, schema)) = scratch_pool().await else {
        return;
    };
    sqlx::raw_sql(SCHEMA_SQL).execute(&pool).await.unwrap();

    let staging = tempdir().unwrap();
    let quarter = staging.path().join("1T2024.csv");
    std::fs::write(
        &quarter,
        "DATA;REG_ANS;CD_CONTA_CONTABIL;DESCRICAO;VL_SALDO_INICIAL;VL_SALDO_FINAL\n\
         01/01/2024;326305;411;EVENTOS;0;\"1.234,56\"\n",
    )
    .unwrap();
    let zip = compress(&[quarter], &staging.path().join("1T2024.zip")).unwrap();
    let registry = format!(
        "{}\n{}\n",
        OperatorRecord::COLUMNS.join(";"),
        operator_row("13/02/2008")
    );

    let server = MockServer::start().await;
    let page = r#"<a href="/Anexo_I.pdf">I</a><a href="/Anexo_II.pdf">II</a>"#;
    mount(&server, "/rol", page.as_bytes().to_vec()).await;
    mount(&server, "/Anexo_I.pdf", annex_pdf()).await;
    mount(&server, "/Anexo_II.pdf", b"%PDF-1.5 annex II".to_vec()).await;
    mount(&server, "/1T2024.zip", std::fs::read(&zip).unwrap()).await;
    mount(&server, "/Relatorio_cadop.csv", registry.into_bytes()).await;

    let root = tempdir().unwrap();
    let config = PipelineConfig {
        database: DatabaseConfig {
            url: "postgres://unused@127.0.0.1:1/unused".to_string(),
        },
        downloads_dir: root.path().join("downloads"),
        data_dir: root.path().join("data"),
        user_agent: None,
        http_timeout_secs: 5,
        web_port: 0,
        report_year: 2024,
        sources: SourceRegistry {
            annex_page_url: format!("{}/rol", server.uri()),
            registry_csv_url: format!("{}/Relatorio_cadop.csv", server.uri()),
            statement_archive_urls: vec![format!("{}/1T2024.zip", server.uri())],
        },
    };

    let summary = Pipeline::new(config).unwrap().run_once(&pool).await.unwrap();
    assert_eq!(summary.transform.rows, 2);
    assert_eq!(summary.load.total_rows(), 2);
    assert_eq!(count(&pool, "operadoras").await, 1);
    assert_eq!(count(&pool, "demonstracoes_contabeis").await, 1);

    let expected_report = root
        .path()
        .join("data/reports")
        .join(summary.run_id.to_string())
        .join("run_summary.json");
    assert_eq!(summary.report_path, expected_report);
    let report: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&expected_report).unwrap()).unwrap();
    assert_eq!(report["run_id"], summary.run_id.to_string());

    drop_schema(&admin, pool, &schema).await;
}
