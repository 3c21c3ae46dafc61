use anyhow::Context;
use chrono::{Local, TimeZone, Utc};
use clap::Parser;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

// Seconds between the WebKit epoch (1601-01-01) and the Unix epoch.
const WEBKIT_EPOCH_OFFSET_SECONDS: i64 = 11_644_473_600;

#[derive(Parser, Debug)]
#[command(name = "browser_collector", version)]
struct Args {
    /// Core endpoint, e.g. http://127.0.0.1:17710
    #[arg(long, default_value = "http://127.0.0.1:17710")]
    core_url: String,

    /// Explicit browser history database path (Chromium `History` or
    /// Firefox `places.sqlite`). Default: probe the standard profile
    /// locations for this OS.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Number of recent visits to push.
    #[arg(long, default_value_t = 10)]
    limit: usize,

    /// Push interval in seconds. 0 runs once and exits.
    #[arg(long, default_value_t = 0)]
    interval_seconds: u64,
}

#[derive(Serialize)]
struct BrowserLogPush {
    v: u32,
    ts: String,
    source: &'static str,
    lines: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "browser_collector=info".into()),
        )
        .init();

    let args = Args::parse();
    let endpoint = format!("{}/browser/log", args.core_url.trim_end_matches('/'));
    let client = reqwest::Client::new();

    info!("browser_collector starting");
    info!("pushing to {endpoint}");

    if args.interval_seconds == 0 {
        return collect_and_push(&client, &endpoint, args.db.as_deref(), args.limit).await;
    }

    loop {
        if let Err(err) =
            collect_and_push(&client, &endpoint, args.db.as_deref(), args.limit).await
        {
            error!("push failed: {err:#}");
        }
        tokio::time::sleep(Duration::from_secs(args.interval_seconds)).await;
    }
}

async fn collect_and_push(
    client: &reqwest::Client,
    endpoint: &str,
    db_override: Option<&Path>,
    limit: usize,
) -> anyhow::Result<()> {
    let db = match db_override {
        Some(p) => p.to_path_buf(),
        None => default_browser_db()
            .ok_or_else(|| anyhow::anyhow!("no browser history database found for this OS"))?,
    };

    let lines = read_browser_history(&db, limit)?;
    info!("read {} visits from {}", lines.len(), db.display());

    let push = BrowserLogPush {
        v: 1,
        ts: Utc::now().to_rfc3339(),
        source: "browser_collector",
        lines,
    };

    let response = client
        .post(endpoint)
        .json(&push)
        .send()
        .await
        .context("core push failed")?;
    if !response.status().is_success() {
        anyhow::bail!("core rejected push: {}", response.status());
    }
    Ok(())
}

/// The most recent visits as "HH:MM — URL" lines, newest first. Reads a
/// scratch copy because the live database is usually locked by the browser.
fn read_browser_history(db_path: &Path, limit: usize) -> anyhow::Result<Vec<String>> {
    if !db_path.exists() {
        anyhow::bail!("browser history database not found at {}", db_path.display());
    }

    let scratch = std::env::temp_dir().join(format!(
        "browser_collector-history-{}.sqlite",
        std::process::id()
    ));
    std::fs::copy(db_path, &scratch)
        .with_context(|| format!("failed to copy {}", db_path.display()))?;
    let result = read_history_copy(&scratch, limit);
    let _ = std::fs::remove_file(&scratch);
    result
}

fn read_history_copy(path: &Path, limit: usize) -> anyhow::Result<Vec<String>> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("failed to open {}", path.display()))?;

    if table_exists(&conn, "urls")? {
        // Chromium family: last_visit_time is microseconds since 1601-01-01.
        let mut stmt = conn.prepare(
            "SELECT url, last_visit_time FROM urls WHERE last_visit_time > 0 ORDER BY last_visit_time DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut out = Vec::new();
        for r in rows {
            let (url, visit_time) = r?;
            out.push(history_line(webkit_to_unix_seconds(visit_time), &url));
        }
        return Ok(out);
    }

    if table_exists(&conn, "moz_places")? {
        // Firefox: last_visit_date is microseconds since the Unix epoch.
        let mut stmt = conn.prepare(
            "SELECT url, last_visit_date FROM moz_places WHERE last_visit_date IS NOT NULL ORDER BY last_visit_date DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut out = Vec::new();
        for r in rows {
            let (url, visit_date) = r?;
            out.push(history_line(visit_date / 1_000_000, &url));
        }
        return Ok(out);
    }

    anyhow::bail!("unrecognized browser history schema (no urls or moz_places table)")
}

fn table_exists(conn: &Connection, name: &str) -> anyhow::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn webkit_to_unix_seconds(webkit_micros: i64) -> i64 {
    webkit_micros / 1_000_000 - WEBKIT_EPOCH_OFFSET_SECONDS
}

fn history_line(unix_seconds: i64, url: &str) -> String {
    format!("{} — {}", fmt_hhmm_unix(unix_seconds), url)
}

fn fmt_hhmm_unix(unix_seconds: i64) -> String {
    match Local.timestamp_opt(unix_seconds, 0).single() {
        Some(t) => t.format("%H:%M").to_string(),
        None => "??:??".to_string(),
    }
}

/// First existing browser profile database in the standard locations.
fn default_browser_db() -> Option<PathBuf> {
    browser_db_candidates().into_iter().find(|p| p.exists())
}

fn browser_db_candidates() -> Vec<PathBuf> {
    let mut out = Vec::new();

    if cfg!(target_os = "windows") {
        if let Ok(local) = std::env::var("LOCALAPPDATA") {
            let local = PathBuf::from(local);
            out.push(local.join("Google/Chrome/User Data/Default/History"));
            out.push(local.join("Microsoft/Edge/User Data/Default/History"));
        }
        if let Ok(roaming) = std::env::var("APPDATA") {
            out.extend(firefox_profile_dbs(
                &PathBuf::from(roaming).join("Mozilla/Firefox/Profiles"),
            ));
        }
    } else if cfg!(target_os = "macos") {
        if let Ok(home) = std::env::var("HOME") {
            let home = PathBuf::from(home);
            out.push(home.join("Library/Application Support/Google/Chrome/Default/History"));
            out.push(home.join("Library/Application Support/Chromium/Default/History"));
            out.extend(firefox_profile_dbs(
                &home.join("Library/Application Support/Firefox/Profiles"),
            ));
        }
    } else if let Ok(home) = std::env::var("HOME") {
        let home = PathBuf::from(home);
        out.push(home.join(".config/google-chrome/Default/History"));
        out.push(home.join(".config/chromium/Default/History"));
        out.extend(firefox_profile_dbs(&home.join(".mozilla/firefox")));
    }

    out
}

fn firefox_profile_dbs(profiles_dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Ok(entries) = std::fs::read_dir(profiles_dir) {
        for entry in entries.flatten() {
            let db = entry.path().join("places.sqlite");
            if db.exists() {
                out.push(db);
            }
        }
    }
    out
}
