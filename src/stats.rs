//! Database statistics and health overview.
//!
//! Summarizes what is indexed: documents by status and file type, chunk
//! and vector counts, and the model bound to each collection. Used by
//! `reportminer stats`.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

/// Vector counts of one collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionStats {
    pub name: String,
    pub model: String,
    pub dims: i64,
    pub vectors: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorpusStats {
    pub documents: i64,
    /// `(status, count)` ordered by status name.
    pub by_status: Vec<(String, i64)>,
    /// `(file_type, count)` ordered by file type.
    pub by_file_type: Vec<(String, i64)>,
    pub chunks: i64,
    pub total_tokens: i64,
    pub collections: Vec<CollectionStats>,
    /// Unix milliseconds of the most recent completion.
    pub last_completed_at: Option<i64>,
}

impl CorpusStats {
    pub fn count_for_status(&self, status: &str) -> i64 {
        self.by_status
            .iter()
            .find(|(s, _)| s == status)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

pub async fn collect_stats(pool: &SqlitePool) -> Result<CorpusStats> {
    let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(pool)
        .await?;

    let by_status = grouped(
        pool,
        "SELECT status AS k, COUNT(*) AS n FROM documents GROUP BY status ORDER BY status",
    )
    .await?;
    let by_file_type = grouped(
        pool,
        "SELECT file_type AS k, COUNT(*) AS n FROM documents GROUP BY file_type ORDER BY file_type",
    )
    .await?;

    let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(pool)
        .await?;
    let total_tokens: i64 =
        sqlx::query_scalar("SELECT COALESCE(SUM(token_estimate), 0) FROM chunks")
            .fetch_one(pool)
            .await?;
    let last_completed_at: Option<i64> =
        sqlx::query_scalar("SELECT MAX(processing_completed_at) FROM documents WHERE status = 'completed'")
            .fetch_one(pool)
            .await?;

    let collection_rows = sqlx::query(
        r#"
        SELECT
            vc.name AS name,
            vc.model AS model,
            vc.dims AS dims,
            COUNT(v.chunk_id) AS vectors
        FROM vector_collections vc
        LEFT JOIN vectors v ON v.collection = vc.name
        GROUP BY vc.name
        ORDER BY vc.name
        "#,
    )
    .fetch_all(pool)
    .await?;
    let collections = collection_rows
        .iter()
        .map(|row| CollectionStats {
            name: row.get("name"),
            model: row.get("model"),
            dims: row.get("dims"),
            vectors: row.get("vectors"),
        })
        .collect();

    Ok(CorpusStats {
        documents,
        by_status,
        by_file_type,
        chunks,
        total_tokens,
        collections,
        last_completed_at,
    })
}

async fn grouped(pool: &SqlitePool, sql: &str) -> Result<Vec<(String, i64)>> {
    let rows = sqlx::query(sql).fetch_all(pool).await?;
    Ok(rows
        .iter()
        .map(|row| (row.get::<String, _>("k"), row.get::<i64, _>("n")))
        .collect())
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = collect_stats(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("ReportMiner Database Stats");
    println!("==========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", stats.documents);
    for (status, count) in &stats.by_status {
        println!("    {:<18} {:>6}", status, count);
    }
    println!("  Chunks:      {}", stats.chunks);
    println!("  Tokens:      ~{}", stats.total_tokens);
    println!(
        "  Last completed: {}",
        stats
            .last_completed_at
            .map(|ms| format_ts_relative(ms / 1000))
            .unwrap_or_else(|| "never".to_string())
    );

    if !stats.by_file_type.is_empty() {
        println!();
        println!("  By file type:");
        for (file_type, count) in &stats.by_file_type {
            println!("    {:<18} {:>6}", file_type, count);
        }
    }

    if !stats.collections.is_empty() {
        println!();
        println!("  Collections:");
        println!(
            "  {:<16} {:<28} {:>6} {:>8}",
            "NAME", "MODEL", "DIMS", "VECTORS"
        );
        println!("  {}", "-".repeat(62));
        for c in &stats.collections {
            println!(
                "  {:<16} {:<28} {:>6} {:>8}",
                c.name, c.model, c.dims, c.vectors
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn recent_timestamp_is_just_now() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
    }
}
