//! Source adapters: annex page link scraping and PDF table extraction.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ans_core::{ensure_non_empty, DocumentRef, EtlError, Result, Row};
use ans_storage::{DocumentFetcher, DownloadedDocument};
use lopdf::content::{Content, Operation};
use lopdf::{Document, Object, ObjectId};
use scraper::{Html, Selector};
use tracing::{debug, info};
use url::Url;

pub const CRATE_NAME: &str = "ans-adapters";

/// Cell text marking the procedures table header row.
pub const HEADER_SENTINEL: &str = "VIGÊNCIA";

/// How many annex PDFs the rol page must link to.
pub const REQUIRED_ANNEXES: usize = 2;

const LINE_TOLERANCE: f64 = 2.0;
const COLUMN_TOLERANCE: f64 = 3.0;
const TJ_GAP_AS_SPACE: f64 = -200.0;
/// Vertical distance between consecutive lines that closes a table.
const TABLE_BREAK_GAP: f64 = 36.0;

/// Collect `a[href]` targets naming an annex PDF, in document order.
pub fn find_annex_pdf_links(html: &str, page_url: &str) -> Result<Vec<String>> {
    let selector = Selector::parse("a[href]")
        .map_err(|e| EtlError::integrity(format!("invalid link selector: {e}")))?;
    let base = Url::parse(page_url).ok();
    let document = Html::parse_document(html);

    Ok(document
        .select(&selector)
        .filter_map(|node| node.value().attr("href"))
        .map(str::trim)
        .filter(|href| href.contains("Anexo") && href.ends_with(".pdf"))
        .map(|href| match &base {
            Some(base) => base
                .join(href)
                .map(|u| u.to_string())
                .unwrap_or_else(|_| href.to_string()),
            None => href.to_string(),
        })
        .collect())
}

/// Scrape the rol page and download the first two annexes as `Anexo_{n}.pdf`.
pub async fn download_annex_pdfs(
    fetcher: &DocumentFetcher,
    page_url: &str,
    dest_dir: &Path,
) -> Result<Vec<DownloadedDocument>> {
    let html = fetcher.fetch_text(page_url).await?;
    let links = find_annex_pdf_links(&html, page_url)?;
    info!(found = links.len(), "annex links scraped");
    if links.len() < REQUIRED_ANNEXES {
        return Err(EtlError::not_found(format!(
            "expected at least {REQUIRED_ANNEXES} annex PDFs on {page_url}, found {}",
            links.len()
        )));
    }

    let docs = links
        .into_iter()
        .take(REQUIRED_ANNEXES)
        .enumerate()
        .map(|(idx, url)| {
            DocumentRef::new(url, dest_dir.join(format!("Anexo_{}.pdf", idx + 1)))
        })
        .collect::<Vec<_>>();
    fetcher.download_all(&docs).await
}

/// A run of text positioned at its starting point in page space.
#[derive(Debug, Clone, PartialEq)]
pub struct TextFragment {
    pub x: f64,
    pub y: f64,
    pub text: String,
}

impl TextFragment {
    pub fn new(x: f64, y: f64, text: impl Into<String>) -> Self {
        Self {
            x,
            y,
            text: text.into(),
        }
    }
}

/// Font resource name (as used by `Tf`) to its declared `/Encoding`.
pub type FontEncodings<'a> = BTreeMap<Vec<u8>, &'a str>;

pub fn page_font_encodings(doc: &Document, page_id: ObjectId) -> FontEncodings<'_> {
    doc.get_page_fonts(page_id)
        .into_iter()
        .map(|(name, font)| (name, font.get_font_encoding()))
        .collect()
}

fn number(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(*r as f64),
        _ => None,
    }
}

fn shown_text(operands: &[Object], encoding: Option<&str>) -> String {
    let mut out = String::new();
    for operand in operands {
        match operand {
            Object::String(bytes, _) => out.push_str(&Document::decode_text(encoding, bytes)),
            Object::Array(items) => {
                for item in items {
                    match item {
                        Object::String(bytes, _) => {
                            out.push_str(&Document::decode_text(encoding, bytes))
                        }
                        other => {
                            if number(other).is_some_and(|n| n <= TJ_GAP_AS_SPACE) {
                                out.push(' ');
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// Walk text-showing operators, tracking the text line origin and active font.
///
/// Strings are decoded with the encoding of the font selected by the last
/// `Tf`. Consecutive show operators with no repositioning between them extend
/// the same fragment.
pub fn fragments_from_operations(
    operations: &[Operation],
    encodings: &FontEncodings<'_>,
) -> Vec<TextFragment> {
    let mut fragments: Vec<TextFragment> = Vec::new();
    let (mut line_x, mut line_y) = (0.0_f64, 0.0_f64);
    let mut leading = 0.0_f64;
    let mut repositioned = true;
    let mut encoding: Option<&str> = None;

    for op in operations {
        let operands = &op.operands;
        let nums = || operands.iter().filter_map(number).collect::<Vec<_>>();
        match op.operator.as_str() {
            "BT" => {
                line_x = 0.0;
                line_y = 0.0;
                repositioned = true;
            }
            "Tf" => {
                encoding = operands
                    .first()
                    .and_then(|name| name.as_name().ok())
                    .and_then(|name| encodings.get(name).copied());
            }
            "Tm" => {
                let n = nums();
                if n.len() == 6 {
                    line_x = n[4];
                    line_y = n[5];
                    repositioned = true;
                }
            }
            "Td" | "TD" => {
                let n = nums();
                if n.len() == 2 {
                    line_x += n[0];
                    line_y += n[1];
                    if op.operator == "TD" {
                        leading = -n[1];
                    }
                    repositioned = true;
                }
            }
            "TL" => {
                if let Some(l) = nums().first() {
                    leading = *l;
                }
            }
            "T*" => {
                line_y -= leading;
                repositioned = true;
            }
            "Tj" | "TJ" | "'" | "\"" => {
                if matches!(op.operator.as_str(), "'" | "\"") {
                    line_y -= leading;
                    repositioned = true;
                }
                let text = shown_text(operands, encoding);
                if text.is_empty() {
                    continue;
                }
                match fragments.last_mut() {
                    Some(last) if !repositioned => last.text.push_str(&text),
                    _ => fragments.push(TextFragment::new(line_x, line_y, text)),
                }
                repositioned = false;
            }
            _ => {}
        }
    }

    fragments.retain(|f| !f.text.trim().is_empty());
    fragments
}

/// Cluster fragments into lines top-to-bottom, each sorted left-to-right.
pub fn group_lines(mut fragments: Vec<TextFragment>) -> Vec<Vec<TextFragment>> {
    fragments.sort_by(|a, b| b.y.total_cmp(&a.y).then(a.x.total_cmp(&b.x)));

    let mut lines: Vec<Vec<TextFragment>> = Vec::new();
    for fragment in fragments {
        match lines.last_mut() {
            Some(line) if (line[0].y - fragment.y).abs() <= LINE_TOLERANCE => line.push(fragment),
            _ => lines.push(vec![fragment]),
        }
    }
    for line in &mut lines {
        line.sort_by(|a, b| a.x.total_cmp(&b.x));
    }
    lines
}

fn column_for(anchors: &[f64], x: f64) -> usize {
    anchors
        .iter()
        .rposition(|anchor| *anchor <= x + COLUMN_TOLERANCE)
        .unwrap_or(0)
}

/// Split a page's lines into tables of rows.
///
/// Column anchors come from the line with the most fragments. A line filling
/// the first column and at least one other starts a row; any other line is a
/// wrapped continuation and is joined cell-wise onto the previous row with a
/// newline. A vertical gap wider than [`TABLE_BREAK_GAP`] closes the table.
pub fn page_tables(lines: &[Vec<TextFragment>]) -> Vec<Vec<Row>> {
    let Some(widest) = lines.iter().max_by_key(|line| line.len()) else {
        return Vec::new();
    };
    let anchors = widest.iter().map(|f| f.x).collect::<Vec<_>>();
    if anchors.len() < 2 {
        return Vec::new();
    }

    let mut tables: Vec<Vec<Row>> = Vec::new();
    let mut current: Vec<Row> = Vec::new();
    let mut previous_y: Option<f64> = None;

    for line in lines {
        let Some(first) = line.first() else {
            continue;
        };
        if previous_y.is_some_and(|y| y - first.y > TABLE_BREAK_GAP) && !current.is_empty() {
            tables.push(std::mem::take(&mut current));
        }
        previous_y = Some(first.y);

        let mut cells: Vec<Option<String>> = vec![None; anchors.len()];
        for fragment in line {
            let slot = &mut cells[column_for(&anchors, fragment.x)];
            match slot {
                Some(text) => {
                    text.push(' ');
                    text.push_str(fragment.text.trim());
                }
                None => *slot = Some(fragment.text.trim().to_string()),
            }
        }
        let filled = cells.iter().filter(|c| c.is_some()).count();

        if cells[0].is_some() && filled >= 2 {
            current.push(cells.into_iter().map(Option::unwrap_or_default).collect());
            continue;
        }
        // Text outside a table (titles, notes) has no row to attach to.
        let Some(prev) = current.last_mut() else {
            continue;
        };
        for (cell, extra) in prev.iter_mut().zip(cells) {
            if let Some(extra) = extra {
                if !cell.is_empty() {
                    cell.push('\n');
                }
                cell.push_str(&extra);
            }
        }
    }
    if !current.is_empty() {
        tables.push(current);
    }
    tables
}

pub fn collapse_newlines(cell: &str) -> String {
    cell.replace("\r\n", " ").replace('\n', " ")
}

pub fn is_header_row(row: &[String]) -> bool {
    row.iter().any(|cell| cell.trim() == HEADER_SENTINEL)
}

/// Flatten per-page tables into one row sequence in document order.
///
/// The first header row found anywhere is kept, placed first; every later
/// header row is dropped.
pub fn merge_page_tables(pages: Vec<Vec<Vec<Row>>>) -> Vec<Row> {
    let mut header: Option<Row> = None;
    let mut body: Vec<Row> = Vec::new();

    for row in pages.into_iter().flatten().flatten() {
        let row = row.iter().map(|c| collapse_newlines(c)).collect::<Row>();
        if is_header_row(&row) {
            if header.is_none() {
                header = Some(row);
            }
            continue;
        }
        body.push(row);
    }

    header.into_iter().chain(body).collect()
}

/// Tables found on each page of `doc`, pages in ascending order.
pub fn extract_page_tables(doc: &Document) -> Result<Vec<Vec<Vec<Row>>>> {
    let pages = doc.get_pages();
    let total = pages.len();
    let mut out = Vec::with_capacity(total);
    for (page_number, page_id) in pages {
        debug!("extracting tables from page {page_number}/{total}");
        let encodings = page_font_encodings(doc, page_id);
        let content = Content::decode(&doc.get_page_content(page_id)?)?;
        let lines = group_lines(fragments_from_operations(&content.operations, &encodings));
        out.push(page_tables(&lines));
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableExtraction {
    pub pages: usize,
    pub rows: usize,
    pub output: PathBuf,
}

/// Extract the document-wide table from `pdf_path` into a semicolon CSV.
pub fn extract_table_to_csv(pdf_path: &Path, output_csv: &Path) -> Result<TableExtraction> {
    if !pdf_path.is_file() {
        return Err(EtlError::not_found(format!("pdf not found: {}", pdf_path.display())));
    }
    let doc = Document::load(pdf_path)?;
    let pages = extract_page_tables(&doc)?;
    let page_count = pages.len();
    let rows = merge_page_tables(pages);

    write_rows_csv(&rows, output_csv)?;
    ensure_non_empty(output_csv, "extracted table csv")?;
    info!(
        pages = page_count,
        rows = rows.len(),
        output = %output_csv.display(),
        "table extracted"
    );

    Ok(TableExtraction {
        pages: page_count,
        rows: rows.len(),
        output: output_csv.to_path_buf(),
    })
}

pub fn write_rows_csv(rows: &[Row], output_csv: &Path) -> Result<()> {
    if let Some(parent) = output_csv.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b';')
        .flexible(true)
        .from_path(output_csv)?;
    for row in rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}
