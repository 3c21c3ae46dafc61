use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{Local, NaiveDate, TimeZone};
use clap::Parser;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

const DEFAULT_PORT: u16 = 17710;
const BROWSER_HISTORY_LIMIT: usize = 10;
const SAMPLING_TEMPERATURE: f32 = 0.7;
// Seconds between the WebKit epoch (1601-01-01) and the Unix epoch.
const WEBKIT_EPOCH_OFFSET_SECONDS: i64 = 11_644_473_600;

const HISTORY_COLUMNS: [&str; 9] = [
    "date",
    "goal",
    "actions",
    "browser",
    "time_spent",
    "priority",
    "gpt_score",
    "manual_score",
    "gpt_advice",
];

#[derive(Parser, Debug)]
#[command(name = "tracker_core", version)]
struct Args {
    /// Listen address.
    ///
    /// Accepts:
    /// - ip:port (recommended), e.g. 127.0.0.1:17710
    /// - ip (implies port 17710), e.g. 127.0.0.1
    #[arg(long, default_value = "127.0.0.1:17710")]
    listen: String,

    /// History log path (CSV, one row per analysis run).
    #[arg(long, default_value = "./data/history.csv")]
    history_file: PathBuf,

    /// Chat-completions endpoint URL.
    #[arg(long, default_value = "https://api.openai.com/v1/chat/completions")]
    api_url: String,

    /// Model identifier sent with every analysis request.
    #[arg(long, default_value = "gpt-4")]
    model: String,

    /// Explicit browser history database path (Chromium `History` or
    /// Firefox `places.sqlite`). Default: probe the standard profile
    /// locations for this OS.
    #[arg(long)]
    browser_db: Option<PathBuf>,
}

struct Config {
    api_url: String,
    model: String,
    /// Read once at startup from OPENAI_API_KEY. A missing key is only an
    /// error when an analysis is actually requested.
    api_key: Option<String>,
    browser_db: Option<PathBuf>,
}

/// Process-scoped session state. Lost on restart by design.
#[derive(Default)]
struct SessionState {
    goals: Vec<Goal>,
    browser_log: String,
    day: Option<DayDraft>,
}

#[derive(Clone)]
struct AppState {
    session: Arc<Mutex<SessionState>>,
    history: Arc<Mutex<HistoryStore>>,
    http: reqwest::Client,
    cfg: Arc<Config>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum GoalCategory {
    Career,
    Health,
    Learning,
    Relationships,
    Finance,
    Other,
}

impl GoalCategory {
    fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "career" => Some(GoalCategory::Career),
            "health" => Some(GoalCategory::Health),
            "learning" => Some(GoalCategory::Learning),
            "relationships" => Some(GoalCategory::Relationships),
            "finance" => Some(GoalCategory::Finance),
            "other" => Some(GoalCategory::Other),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
struct Goal {
    name: String,
    category: GoalCategory,
    priority: i64,
}

#[derive(Clone, Debug, Serialize)]
struct DayDraft {
    date: NaiveDate,
    goal: String,
    actions: String,
    time_spent_hours: i64,
}

/// One persisted analysis run. Field order here is the fixed column order of
/// the history CSV and never changes across appends.
#[derive(Clone, Debug, PartialEq, Serialize)]
struct HistoryRecord {
    date: String,
    goal: String,
    actions: String,
    browser: String,
    time_spent: i64,
    priority: i64,
    gpt_score: i64,
    manual_score: i64,
    gpt_advice: String,
}

/// Outcome of the response parser. `parsed == false` means the reply had no
/// usable score line and the score degraded to 0; the advice text is still
/// preserved so the caller can read the raw reply.
#[derive(Clone, Debug, PartialEq)]
struct ParsedReply {
    score: i64,
    advice: String,
    parsed: bool,
}

#[derive(Serialize)]
struct OkResponse<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Serialize)]
struct ErrResponse {
    ok: bool,
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

fn err_response(status: StatusCode, code: &'static str) -> Response {
    (
        status,
        Json(ErrResponse {
            ok: false,
            error: code,
            detail: None,
        }),
    )
        .into_response()
}

fn err_response_detail(status: StatusCode, code: &'static str, detail: String) -> Response {
    (
        status,
        Json(ErrResponse {
            ok: false,
            error: code,
            detail: Some(detail),
        }),
    )
        .into_response()
}

#[derive(Deserialize)]
struct AddGoalRequest {
    name: String,
    category: String,
    priority: i64,
}

#[derive(Deserialize)]
struct SaveDayRequest {
    /// Date in YYYY-MM-DD.
    date: String,
    goal: String,
    #[serde(default)]
    actions: String,
    time_spent_hours: i64,
}

#[derive(Deserialize)]
struct SetBrowserLogRequest {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    lines: Option<Vec<String>>,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Deserialize)]
struct AnalyzeRequest {
    /// Overrides the session browser log for this run (UI textarea value).
    #[serde(default)]
    browser_log: Option<String>,
}

#[derive(Serialize)]
struct BrowserLogView {
    log: String,
}

#[derive(Serialize)]
struct AnalyzeResult {
    record: HistoryRecord,
    /// False when the model reply carried no parseable score line.
    parsed: bool,
    raw_reply: String,
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    goal: Option<String>,
}

#[derive(Deserialize)]
struct ReportQuery {
    /// Date in YYYY-MM-DD; default is the most recent record.
    date: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tracker_core=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    if let Some(parent) = args.history_file.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty());
    if api_key.is_none() {
        info!("OPENAI_API_KEY is not set; /analyze will be rejected until it is");
    }

    let state = AppState {
        session: Arc::new(Mutex::new(SessionState::default())),
        history: Arc::new(Mutex::new(HistoryStore::new(args.history_file.clone()))),
        http: reqwest::Client::new(),
        cfg: Arc::new(Config {
            api_url: args.api_url,
            model: args.model,
            api_key,
            browser_db: args.browser_db,
        }),
    };

    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    let app = Router::new()
        .route("/health", get(health))
        .route("/goals", get(get_goals).post(post_goal).options(options_ok))
        .route("/goals/:index", delete(delete_goal).options(options_ok))
        .route("/day", get(get_day).post(post_day).options(options_ok))
        .route(
            "/browser/log",
            get(get_browser_log).post(post_browser_log).options(options_ok),
        )
        .route(
            "/browser/refresh",
            post(post_browser_refresh).options(options_ok),
        )
        .route("/analyze", post(post_analyze).options(options_ok))
        .route("/history", get(get_history))
        .route("/export/report", get(get_export_report))
        .route("/export/history", get(get_export_history))
        .with_state(state)
        .layer(cors);

    let addr = parse_listen(&args.listen)?;
    info!("Core listening on http://{addr}");
    info!("History log: {}", args.history_file.display());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn parse_listen(input: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    if input == "localhost" {
        return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), DEFAULT_PORT));
    }

    if let Some((host, port_str)) = input.rsplit_once(':') {
        if host == "localhost" {
            let port: u16 = port_str.parse().map_err(|_| {
                anyhow::anyhow!(
                    "invalid --listen '{}': bad port. Example: 127.0.0.1:{}",
                    input,
                    DEFAULT_PORT
                )
            })?;
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), port));
        }
    }

    Err(anyhow::anyhow!(
        "invalid --listen '{}'. Use ip:port (e.g. 127.0.0.1:{}) or ip (e.g. 127.0.0.1).",
        input,
        DEFAULT_PORT
    ))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

async fn options_ok() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
struct HealthInfo {
    service: &'static str,
    version: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(OkResponse {
        ok: true,
        data: Some(HealthInfo {
            service: "tracker_core",
            version: env!("CARGO_PKG_VERSION"),
        }),
    })
}

async fn get_goals(State(state): State<AppState>) -> Response {
    let session = state.session.lock().await;
    Json(OkResponse {
        ok: true,
        data: Some(session.goals.clone()),
    })
    .into_response()
}

fn goal_from_request(req: AddGoalRequest) -> Result<Goal, &'static str> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err("invalid_name");
    }
    let Some(category) = GoalCategory::parse(&req.category) else {
        return Err("invalid_category");
    };
    if !(1..=10).contains(&req.priority) {
        return Err("invalid_priority");
    }
    Ok(Goal {
        name,
        category,
        priority: req.priority,
    })
}

async fn post_goal(State(state): State<AppState>, Json(req): Json<AddGoalRequest>) -> Response {
    let goal = match goal_from_request(req) {
        Ok(goal) => goal,
        Err(code) => return err_response(StatusCode::BAD_REQUEST, code),
    };

    let mut session = state.session.lock().await;
    session.goals.push(goal.clone());
    info!("goal added: {} (priority {})", goal.name, goal.priority);
    Json(OkResponse {
        ok: true,
        data: Some(goal),
    })
    .into_response()
}

async fn delete_goal(State(state): State<AppState>, Path(index): Path<usize>) -> Response {
    let mut session = state.session.lock().await;
    if index >= session.goals.len() {
        return err_response(StatusCode::NOT_FOUND, "goal_not_found");
    }
    let removed = session.goals.remove(index);
    info!("goal removed: {}", removed.name);
    Json(OkResponse {
        ok: true,
        data: Some(removed),
    })
    .into_response()
}

async fn get_day(State(state): State<AppState>) -> Response {
    let session = state.session.lock().await;
    Json(OkResponse {
        ok: true,
        data: session.day.clone(),
    })
    .into_response()
}

async fn post_day(State(state): State<AppState>, Json(req): Json<SaveDayRequest>) -> Response {
    let Ok(date) = NaiveDate::parse_from_str(&req.date, "%Y-%m-%d") else {
        return err_response(StatusCode::BAD_REQUEST, "invalid_date");
    };
    if !(0..=24).contains(&req.time_spent_hours) {
        return err_response(StatusCode::BAD_REQUEST, "invalid_time_spent");
    }

    let draft = DayDraft {
        date,
        goal: req.goal,
        actions: req.actions,
        time_spent_hours: req.time_spent_hours,
    };

    let mut session = state.session.lock().await;
    session.day = Some(draft.clone());
    Json(OkResponse {
        ok: true,
        data: Some(draft),
    })
    .into_response()
}

async fn get_browser_log(State(state): State<AppState>) -> Response {
    let session = state.session.lock().await;
    Json(OkResponse {
        ok: true,
        data: Some(BrowserLogView {
            log: session.browser_log.clone(),
        }),
    })
    .into_response()
}

/// Manual paste from the UI, or a push from browser_collector.
async fn post_browser_log(
    State(state): State<AppState>,
    Json(req): Json<SetBrowserLogRequest>,
) -> Response {
    let log = match (req.text, req.lines) {
        (Some(text), _) => text,
        (None, Some(lines)) => lines.join("\n"),
        (None, None) => return err_response(StatusCode::BAD_REQUEST, "invalid_browser_log"),
    };

    if let Some(source) = req.source.as_deref() {
        info!("browser log updated by {source} ({} bytes)", log.len());
    }

    let mut session = state.session.lock().await;
    session.browser_log = log.clone();
    Json(OkResponse {
        ok: true,
        data: Some(BrowserLogView { log }),
    })
    .into_response()
}

async fn post_browser_refresh(State(state): State<AppState>) -> Response {
    let Some(db) = state.cfg.browser_db.clone().or_else(default_browser_db) else {
        return err_response_detail(
            StatusCode::BAD_GATEWAY,
            "browser_history_unavailable",
            "no browser history database found for this OS".to_string(),
        );
    };

    match read_browser_history(&db, BROWSER_HISTORY_LIMIT) {
        Ok(lines) => {
            let log = lines.join("\n");
            let mut session = state.session.lock().await;
            session.browser_log = log.clone();
            Json(OkResponse {
                ok: true,
                data: Some(BrowserLogView { log }),
            })
            .into_response()
        }
        Err(err) => {
            error!("browser history read failed: {err:#}");
            err_response_detail(
                StatusCode::BAD_GATEWAY,
                "browser_history_unavailable",
                format!("{err:#}"),
            )
        }
    }
}

async fn post_analyze(State(state): State<AppState>, Json(req): Json<AnalyzeRequest>) -> Response {
    // Snapshot the session under the lock; the model call runs without it.
    // The browser_log override stays local to this run until the run has
    // succeeded, so an aborted analysis leaves the session untouched.
    let (day, goals, browser_log) = {
        let session = state.session.lock().await;
        let Some(day) = session.day.clone() else {
            return err_response(StatusCode::BAD_REQUEST, "no_day_saved");
        };
        let browser_log = match req.browser_log {
            Some(log) => log,
            None => session.browser_log.clone(),
        };
        (day, session.goals.clone(), browser_log)
    };

    let Some(api_key) = state.cfg.api_key.clone() else {
        return err_response(StatusCode::BAD_REQUEST, "missing_api_key");
    };

    let prompt = build_prompt(&day.goal, &day.actions, &browser_log);
    let raw_reply = match request_analysis(&state.http, &state.cfg, &api_key, &prompt).await {
        Ok(reply) => reply,
        Err(err) => {
            error!("model request failed: {err:#}");
            return err_response_detail(
                StatusCode::BAD_GATEWAY,
                "model_request_failed",
                format!("{err:#}"),
            );
        }
    };

    let reply = parse_reply(&raw_reply);
    let parsed = reply.parsed;
    let priority = priority_for_goal(&goals, &day.goal);

    let record = HistoryRecord {
        date: day.date.to_string(),
        goal: day.goal,
        actions: day.actions,
        browser: browser_log,
        time_spent: day.time_spent_hours,
        priority,
        gpt_score: reply.score,
        manual_score: manual_score(day.time_spent_hours, priority),
        gpt_advice: reply.advice,
    };

    {
        let store = state.history.lock().await;
        if let Err(err) = store.append(&record) {
            error!("history append failed: {err:#}");
            return err_response_detail(
                StatusCode::INTERNAL_SERVER_ERROR,
                "persist_failed",
                format!("{err:#}"),
            );
        }
    }

    // Only a completed run commits the analyzed log back into the session.
    {
        let mut session = state.session.lock().await;
        session.browser_log = record.browser.clone();
    }

    info!(
        "analysis stored: {} gpt_score={} manual_score={}",
        record.date, record.gpt_score, record.manual_score
    );

    Json(OkResponse {
        ok: true,
        data: Some(AnalyzeResult {
            record,
            parsed,
            raw_reply,
        }),
    })
    .into_response()
}

async fn get_history(State(state): State<AppState>, Query(q): Query<HistoryQuery>) -> Response {
    let store = state.history.lock().await;
    if !store.exists() {
        return err_response(StatusCode::NOT_FOUND, "no_history");
    }

    let records = match store.load_all() {
        Ok(v) => v,
        Err(err) => {
            error!("history load failed: {err:#}");
            return err_response_detail(
                StatusCode::INTERNAL_SERVER_ERROR,
                "history_unreadable",
                format!("{err:#}"),
            );
        }
    };

    let goal = q.goal.as_deref().unwrap_or("All");
    Json(OkResponse {
        ok: true,
        data: Some(filter_by_goal(records, goal)),
    })
    .into_response()
}

async fn get_export_report(
    State(state): State<AppState>,
    Query(q): Query<ReportQuery>,
) -> Response {
    let records = {
        let store = state.history.lock().await;
        if !store.exists() {
            return err_response(StatusCode::NOT_FOUND, "no_history");
        }
        match store.load_all() {
            Ok(v) => v,
            Err(err) => {
                error!("history load failed: {err:#}");
                return err_response_detail(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "history_unreadable",
                    format!("{err:#}"),
                );
            }
        }
    };

    let record = match q.date.as_deref() {
        Some(date) => records.iter().rev().find(|r| r.date == date),
        None => records.last(),
    };
    let Some(record) = record else {
        return err_response(StatusCode::NOT_FOUND, "no_matching_record");
    };

    let md = render_report(record);
    (
        StatusCode::OK,
        [
            (
                axum::http::header::CONTENT_TYPE,
                "text/markdown; charset=utf-8".to_string(),
            ),
            (
                axum::http::header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"day_report_{}.md\"", record.date),
            ),
        ],
        md,
    )
        .into_response()
}

/// Byte-for-byte copy of the persisted log.
async fn get_export_history(State(state): State<AppState>) -> Response {
    let store = state.history.lock().await;
    if !store.exists() {
        return err_response(StatusCode::NOT_FOUND, "no_history");
    }

    match store.raw_bytes() {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (
                    axum::http::header::CONTENT_TYPE,
                    "text/csv; charset=utf-8".to_string(),
                ),
                (
                    axum::http::header::CONTENT_DISPOSITION,
                    "attachment; filename=\"full_history.csv\"".to_string(),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(err) => {
            error!("history read failed: {err:#}");
            err_response_detail(
                StatusCode::INTERNAL_SERVER_ERROR,
                "history_unreadable",
                format!("{err:#}"),
            )
        }
    }
}

// === Day Analysis & Scoring Pipeline ===

fn build_prompt(goal: &str, actions: &str, browser_log: &str) -> String {
    format!(
        "User goal: {goal}\n\
         Actions today: {actions}\n\
         Browser activity:\n{browser_log}\n\n\
         Review the user's day and rate how well their actions were aligned \
         with the stated goal, from 0 to 100.\n\
         Give 2-3 suggestions for aligning tomorrow's actions better with the goal.\n\
         Reply shape:\n\
         - Score: xx/100\n\
         - Advice:\n"
    )
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// One chat-completions call; no retry, no timeout of our own. Any transport
/// or API failure surfaces to the caller.
async fn request_analysis(
    client: &reqwest::Client,
    cfg: &Config,
    api_key: &str,
    prompt: &str,
) -> anyhow::Result<String> {
    let request = ChatRequest {
        model: cfg.model.clone(),
        messages: vec![ChatMessage {
            role: "user",
            content: prompt.to_string(),
        }],
        temperature: SAMPLING_TEMPERATURE,
    };

    let response = client
        .post(&cfg.api_url)
        .bearer_auth(api_key)
        .json(&request)
        .send()
        .await
        .context("chat completions request failed")?;

    let status = response.status();
    let body = response.text().await.context("reading model response failed")?;
    if !status.is_success() {
        let excerpt: String = body.chars().take(300).collect();
        anyhow::bail!("model API error {status}: {excerpt}");
    }

    let parsed: ChatResponse =
        serde_json::from_str(&body).context("model response was not valid JSON")?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| anyhow::anyhow!("model reply had no content"))
}

/// Extract the score and advice block from the model's free-text reply.
///
/// The first line containing the literal marker `Score` is the score line;
/// its digit characters are concatenated left-to-right and parsed as one
/// integer ("Score: 8/10 at 5pm" yields 8105). The advice block is every
/// line after the score line. No marker, no digits, or an integer too large
/// to hold all degrade to score 0 with the full reply kept as advice.
fn parse_reply(text: &str) -> ParsedReply {
    let trimmed = text.trim();
    let lines: Vec<&str> = trimmed.lines().collect();

    let Some(score_idx) = lines.iter().position(|line| line.contains("Score")) else {
        return ParsedReply {
            score: 0,
            advice: trimmed.to_string(),
            parsed: false,
        };
    };

    let digits: String = lines[score_idx]
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    let (score, parsed) = match digits.parse::<i64>() {
        Ok(v) => (v, true),
        Err(_) => (0, false),
    };

    ParsedReply {
        score,
        advice: lines[score_idx + 1..].join("\n").trim().to_string(),
        parsed,
    }
}

/// Deterministic score independent of the model: min(hours*4 + priority*2, 100).
/// Integer arithmetic only.
fn manual_score(time_spent_hours: i64, priority: i64) -> i64 {
    (time_spent_hours * 4 + priority * 2).min(100)
}

/// Priority of the named goal, or 5 when the name matches nothing.
fn priority_for_goal(goals: &[Goal], name: &str) -> i64 {
    goals
        .iter()
        .find(|g| g.name == name)
        .map(|g| g.priority)
        .unwrap_or(5)
}

// === History store (CSV) ===

struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn raw_bytes(&self) -> anyhow::Result<Vec<u8>> {
        std::fs::read(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))
    }

    /// Load-concat-rewrite append. The rewrite goes through a temp file and a
    /// rename, so a failed append leaves the previous rows intact.
    fn append(&self, record: &HistoryRecord) -> anyhow::Result<()> {
        let mut records = if self.exists() {
            self.load_all()?
        } else {
            Vec::new()
        };
        records.push(record.clone());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut out = String::new();
        out.push_str(&HISTORY_COLUMNS.join(","));
        out.push('\n');
        for r in &records {
            let row: Vec<String> = record_to_row(r).iter().map(|f| csv_escape(f)).collect();
            out.push_str(&row.join(","));
            out.push('\n');
        }

        let tmp = self.path.with_extension("csv.tmp");
        std::fs::write(&tmp, out)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    fn load_all(&self) -> anyhow::Result<Vec<HistoryRecord>> {
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("history file not found at {}", self.path.display()))?;

        let rows = parse_csv(&text);
        let Some(header) = rows.first() else {
            return Ok(Vec::new());
        };
        if header != &HISTORY_COLUMNS {
            anyhow::bail!(
                "unexpected history header '{}' (expected '{}')",
                header.join(","),
                HISTORY_COLUMNS.join(",")
            );
        }

        let mut out = Vec::new();
        for row in &rows[1..] {
            if row.len() == 1 && row[0].is_empty() {
                continue;
            }
            out.push(record_from_row(row)?);
        }
        Ok(out)
    }
}

fn filter_by_goal(records: Vec<HistoryRecord>, goal: &str) -> Vec<HistoryRecord> {
    if goal == "All" {
        return records;
    }
    records.into_iter().filter(|r| r.goal == goal).collect()
}

fn record_to_row(r: &HistoryRecord) -> [String; 9] {
    [
        r.date.clone(),
        r.goal.clone(),
        r.actions.clone(),
        r.browser.clone(),
        r.time_spent.to_string(),
        r.priority.to_string(),
        r.gpt_score.to_string(),
        r.manual_score.to_string(),
        r.gpt_advice.clone(),
    ]
}

fn record_from_row(row: &[String]) -> anyhow::Result<HistoryRecord> {
    if row.len() != HISTORY_COLUMNS.len() {
        anyhow::bail!(
            "malformed history row: expected {} fields, found {}",
            HISTORY_COLUMNS.len(),
            row.len()
        );
    }

    // Numeric fields parse leniently: external hand edits degrade to 0
    // rather than making the whole log unreadable.
    Ok(HistoryRecord {
        date: row[0].clone(),
        goal: row[1].clone(),
        actions: row[2].clone(),
        browser: row[3].clone(),
        time_spent: row[4].parse().unwrap_or(0),
        priority: row[5].parse().unwrap_or(0),
        gpt_score: row[6].parse().unwrap_or(0),
        manual_score: row[7].parse().unwrap_or(0),
        gpt_advice: row[8].clone(),
    })
}

fn csv_escape(s: &str) -> String {
    let needs_quote = s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r');
    if !needs_quote {
        return s.to_string();
    }
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Minimal quote-aware CSV reader matching what `csv_escape` writes: quoted
/// fields may contain commas, doubled quotes, and newlines.
fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut started = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
            continue;
        }

        match c {
            '"' => {
                in_quotes = true;
                started = true;
            }
            ',' => {
                row.push(std::mem::take(&mut field));
                started = true;
            }
            '\r' | '\n' => {
                if c == '\r' && chars.peek() == Some(&'\n') {
                    chars.next();
                }
                if started {
                    row.push(std::mem::take(&mut field));
                    rows.push(std::mem::take(&mut row));
                }
                started = false;
            }
            _ => {
                field.push(c);
                started = true;
            }
        }
    }

    if started {
        row.push(field);
        rows.push(row);
    }
    rows
}

// === Report exporter ===

/// Fixed-structure Markdown document for one analysis run. Pure formatting.
fn render_report(r: &HistoryRecord) -> String {
    format!(
        "## Day report — {date}\n\n\
         ### Goal\n{goal}\n\n\
         ### Actions\n{actions}\n\n\
         ### Browser activity\n{browser}\n\n\
         ### Model analysis\n\
         - Score: {gpt_score}/100\n\
         {gpt_advice}\n\n\
         ### Manual score\n{manual_score}/100\n",
        date = r.date,
        goal = r.goal,
        actions = r.actions,
        browser = r.browser,
        gpt_score = r.gpt_score,
        gpt_advice = r.gpt_advice,
        manual_score = r.manual_score,
    )
}

// === Browser history adapter ===

/// The 10 most recent visits as "HH:MM — URL" lines, newest first.
///
/// The live database is usually locked by the running browser, so we read a
/// scratch copy instead of the file itself.
fn read_browser_history(db_path: &std::path::Path, limit: usize) -> anyhow::Result<Vec<String>> {
    if !db_path.exists() {
        anyhow::bail!("browser history database not found at {}", db_path.display());
    }

    let scratch = std::env::temp_dir().join(format!(
        "tracker_core-browser-history-{}.sqlite",
        std::process::id()
    ));
    std::fs::copy(db_path, &scratch)
        .with_context(|| format!("failed to copy {}", db_path.display()))?;
    let result = read_history_copy(&scratch, limit);
    let _ = std::fs::remove_file(&scratch);
    result
}

fn read_history_copy(path: &std::path::Path, limit: usize) -> anyhow::Result<Vec<String>> {
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

fn firefox_profile_dbs(profiles_dir: &std::path::Path) -> Vec<PathBuf> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn goal(name: &str, priority: i64) -> Goal {
        Goal {
            name: name.to_string(),
            category: GoalCategory::Learning,
            priority,
        }
    }

    fn test_state(dir: &std::path::Path, api_key: Option<&str>) -> AppState {
        AppState {
            session: Arc::new(Mutex::new(SessionState::default())),
            history: Arc::new(Mutex::new(HistoryStore::new(dir.join("history.csv")))),
            http: reqwest::Client::new(),
            cfg: Arc::new(Config {
                // Nothing listens on port 1, so any model call fails fast.
                api_url: "http://127.0.0.1:1/v1/chat/completions".to_string(),
                model: "gpt-4".to_string(),
                api_key: api_key.map(|k| k.to_string()),
                browser_db: None,
            }),
        }
    }

    fn record(date: &str, goal: &str) -> HistoryRecord {
        HistoryRecord {
            date: date.to_string(),
            goal: goal.to_string(),
            actions: "read".to_string(),
            browser: "09:00 — docs.rs".to_string(),
            time_spent: 2,
            priority: 5,
            gpt_score: 50,
            manual_score: 18,
            gpt_advice: "keep going".to_string(),
        }
    }

    #[test]
    fn manual_score_matches_formula_over_full_range() {
        for hours in 0..=24 {
            for priority in 1..=10 {
                let expected = (hours * 4 + priority * 2).min(100);
                let score = manual_score(hours, priority);
                assert_eq!(score, expected);
                assert!((0..=100).contains(&score));
            }
        }
        assert_eq!(manual_score(3, 7), 26);
        assert_eq!(manual_score(24, 10), 100);
    }

    #[test]
    fn priority_lookup_defaults_to_five() {
        let goals = vec![goal("Learn Rust", 7), goal("Run", 3)];
        assert_eq!(priority_for_goal(&goals, "Learn Rust"), 7);
        assert_eq!(priority_for_goal(&goals, "Run"), 3);
        assert_eq!(priority_for_goal(&goals, "Sleep"), 5);
        assert_eq!(priority_for_goal(&[], "anything"), 5);
    }

    #[test]
    fn parse_reply_extracts_score_and_advice() {
        let reply = "- Score: 87/100\n- Advice:\nRead more.\nSleep earlier.";
        let parsed = parse_reply(reply);
        assert_eq!(parsed.score, 87);
        assert!(parsed.parsed);
        assert_eq!(parsed.advice, "- Advice:\nRead more.\nSleep earlier.");
    }

    #[test]
    fn parse_reply_without_marker_degrades_to_zero() {
        let reply = "The day went fine.\nNothing to add.";
        let parsed = parse_reply(reply);
        assert_eq!(parsed.score, 0);
        assert!(!parsed.parsed);
        assert_eq!(parsed.advice, "The day went fine.\nNothing to add.");
    }

    #[test]
    fn parse_reply_concatenates_digit_groups_left_to_right() {
        // Pinned: every digit on the score line joins one integer, in order.
        let parsed = parse_reply("Score: 8/10 at 5pm\nmore text");
        assert_eq!(parsed.score, 8105);
        assert!(parsed.parsed);
    }

    #[test]
    fn parse_reply_advice_starts_after_the_score_line() {
        let reply = "Here is my take.\nOverall ok.\n- Score: 60/100\n- Advice:\nDo X.";
        let parsed = parse_reply(reply);
        assert_eq!(parsed.score, 60);
        assert_eq!(parsed.advice, "- Advice:\nDo X.");
    }

    #[test]
    fn parse_reply_score_line_without_digits_is_unparsed() {
        let parsed = parse_reply("- Score: none\nAdvice here.");
        assert_eq!(parsed.score, 0);
        assert!(!parsed.parsed);
        assert_eq!(parsed.advice, "Advice here.");
    }

    #[test]
    fn prompt_embeds_all_fields_verbatim() {
        let prompt = build_prompt("Learn Rust", "Read chapter 3", "09:00 — docs.rs");
        assert!(prompt.contains("Learn Rust"));
        assert!(prompt.contains("Read chapter 3"));
        assert!(prompt.contains("09:00 — docs.rs"));
        assert!(prompt.contains("- Score: xx/100"));
        assert!(prompt.contains("- Advice:"));
    }

    #[test]
    fn csv_escape_quotes_only_when_needed() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("line\nbreak"), "\"line\nbreak\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn parse_csv_handles_quotes_commas_and_newlines() {
        let text = "a,\"b,c\",\"d\ne\",\"say \"\"hi\"\"\"\nplain,1,2,3\n";
        let rows = parse_csv(text);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec!["a", "b,c", "d\ne", "say \"hi\""]);
        assert_eq!(rows[1], vec!["plain", "1", "2", "3"]);
    }

    #[test]
    fn parse_csv_accepts_crlf_and_skips_blank_lines() {
        let rows = parse_csv("a,b\r\n\r\nc,d\r\n");
        assert_eq!(rows, vec![vec!["a", "b"], vec!["c", "d"]]);
    }

    #[test]
    fn history_roundtrip_preserves_embedded_commas_and_newlines() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.csv"));

        let mut r = record("2024-01-15", "Learn Rust");
        r.actions = "read, took notes\nwrote \"tests\"".to_string();
        r.gpt_advice = "- Advice:\nPractice more, daily.".to_string();
        store.append(&r).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], r);
    }

    #[test]
    fn history_append_preserves_existing_rows_in_order() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.csv"));

        store.append(&record("2024-01-15", "Learn Rust")).unwrap();
        store.append(&record("2024-01-16", "Run")).unwrap();
        store.append(&record("2024-01-17", "Learn Rust")).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].date, "2024-01-15");
        assert_eq!(loaded[1].date, "2024-01-16");
        assert_eq!(loaded[2].date, "2024-01-17");
    }

    #[test]
    fn filter_by_goal_all_returns_everything_in_order() {
        let records = vec![
            record("2024-01-15", "Learn Rust"),
            record("2024-01-16", "Run"),
            record("2024-01-17", "Learn Rust"),
        ];

        let all = filter_by_goal(records.clone(), "All");
        assert_eq!(all.len(), 3);

        let rust = filter_by_goal(records, "Learn Rust");
        assert_eq!(rust.len(), 2);
        assert_eq!(rust[0].date, "2024-01-15");
        assert_eq!(rust[1].date, "2024-01-17");
    }

    #[test]
    fn load_all_fails_when_no_file_exists() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.csv"));
        assert!(!store.exists());
        assert!(store.load_all().is_err());
    }

    #[test]
    fn header_only_file_loads_as_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.csv");
        std::fs::write(&path, format!("{}\n", HISTORY_COLUMNS.join(","))).unwrap();

        let store = HistoryStore::new(path);
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn append_rejects_foreign_header_and_leaves_file_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.csv");
        let original = "foo,bar\n1,2\n";
        std::fs::write(&path, original).unwrap();

        let store = HistoryStore::new(path.clone());
        assert!(store.append(&record("2024-01-15", "Learn Rust")).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
    }

    #[test]
    fn report_contains_the_supplied_values() {
        let r = record("2024-01-15", "Learn Rust");
        let md = render_report(&r);
        assert!(md.contains("2024-01-15"));
        assert!(md.contains("Learn Rust"));
        assert!(md.contains("read"));
        assert!(md.contains("18/100"));
        assert!(md.contains("09:00 — docs.rs"));
    }

    #[test]
    fn end_to_end_scenario_persists_the_expected_row() {
        let goals = vec![goal("Learn Rust", 7)];
        let reply = "- Score: 72/100\n- Advice:\nFocus more on practice.";
        let parsed = parse_reply(reply);
        assert_eq!(parsed.score, 72);
        assert_eq!(parsed.advice, "- Advice:\nFocus more on practice.");

        let priority = priority_for_goal(&goals, "Learn Rust");
        assert_eq!(priority, 7);
        let manual = manual_score(3, priority);
        assert_eq!(manual, 26);

        let r = HistoryRecord {
            date: "2024-01-15".to_string(),
            goal: "Learn Rust".to_string(),
            actions: "Read chapter 3".to_string(),
            browser: "09:00 — docs.rs".to_string(),
            time_spent: 3,
            priority,
            gpt_score: parsed.score,
            manual_score: manual,
            gpt_advice: parsed.advice.clone(),
        };

        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.csv"));
        store.append(&r).unwrap();

        let text = std::fs::read_to_string(dir.path().join("history.csv")).unwrap();
        assert!(text.starts_with(
            "date,goal,actions,browser,time_spent,priority,gpt_score,manual_score,gpt_advice\n"
        ));

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.last().unwrap(), &r);
    }

    #[test]
    fn webkit_epoch_conversion_is_exact() {
        // 2024-01-15T00:00:00Z is 1705276800 Unix.
        let webkit_micros = (1_705_276_800 + WEBKIT_EPOCH_OFFSET_SECONDS) * 1_000_000;
        assert_eq!(webkit_to_unix_seconds(webkit_micros), 1_705_276_800);
    }

    #[test]
    fn chromium_history_reads_newest_first_up_to_limit() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("History");
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch(
            "CREATE TABLE urls (id INTEGER PRIMARY KEY, url TEXT NOT NULL, last_visit_time INTEGER NOT NULL)",
        )
        .unwrap();

        let base_unix = 1_705_276_800i64;
        for i in 0..12i64 {
            let webkit = (base_unix + i * 60 + WEBKIT_EPOCH_OFFSET_SECONDS) * 1_000_000;
            conn.execute(
                "INSERT INTO urls (url, last_visit_time) VALUES (?1, ?2)",
                (format!("https://example.com/{i}"), webkit),
            )
            .unwrap();
        }
        drop(conn);

        let lines = read_browser_history(&db_path, BROWSER_HISTORY_LIMIT).unwrap();
        assert_eq!(lines.len(), 10);
        let newest = format!(
            "{} — https://example.com/11",
            fmt_hhmm_unix(base_unix + 11 * 60)
        );
        assert_eq!(lines[0], newest);
        assert!(lines[9].ends_with("https://example.com/2"));
    }

    #[test]
    fn firefox_history_is_recognized_by_schema() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("places.sqlite");
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch(
            "CREATE TABLE moz_places (id INTEGER PRIMARY KEY, url TEXT NOT NULL, last_visit_date INTEGER)",
        )
        .unwrap();
        let base_unix = 1_705_276_800i64;
        conn.execute(
            "INSERT INTO moz_places (url, last_visit_date) VALUES (?1, ?2)",
            ("https://mozilla.org/", base_unix * 1_000_000),
        )
        .unwrap();
        drop(conn);

        let lines = read_browser_history(&db_path, BROWSER_HISTORY_LIMIT).unwrap();
        assert_eq!(
            lines,
            vec![format!("{} — https://mozilla.org/", fmt_hhmm_unix(base_unix))]
        );
    }

    #[test]
    fn unknown_schema_is_an_error() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("whatever.sqlite");
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch("CREATE TABLE notes (id INTEGER PRIMARY KEY)").unwrap();
        drop(conn);

        assert!(read_browser_history(&db_path, 10).is_err());
    }

    #[test]
    fn goal_validation_rejects_bad_input() {
        let req = |name: &str, category: &str, priority: i64| AddGoalRequest {
            name: name.to_string(),
            category: category.to_string(),
            priority,
        };

        assert_eq!(goal_from_request(req("", "learning", 5)).unwrap_err(), "invalid_name");
        assert_eq!(goal_from_request(req("   ", "learning", 5)).unwrap_err(), "invalid_name");
        assert_eq!(
            goal_from_request(req("Learn Rust", "hobby", 5)).unwrap_err(),
            "invalid_category"
        );
        assert_eq!(
            goal_from_request(req("Learn Rust", "learning", 0)).unwrap_err(),
            "invalid_priority"
        );
        assert_eq!(
            goal_from_request(req("Learn Rust", "learning", 11)).unwrap_err(),
            "invalid_priority"
        );

        let goal = goal_from_request(req("  Learn Rust  ", "learning", 7)).unwrap();
        assert_eq!(goal.name, "Learn Rust");
        assert_eq!(goal.category, GoalCategory::Learning);
        assert_eq!(goal.priority, 7);
    }

    #[tokio::test]
    async fn analyze_without_saved_day_leaves_browser_log_untouched() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path(), Some("key"));
        state.session.lock().await.browser_log = "09:00 — docs.rs".to_string();

        let response = post_analyze(
            State(state.clone()),
            Json(AnalyzeRequest {
                browser_log: Some("10:00 — example.com".to_string()),
            }),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.session.lock().await.browser_log, "09:00 — docs.rs");
    }

    #[tokio::test]
    async fn failed_model_call_leaves_session_and_history_untouched() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path(), Some("key"));
        {
            let mut session = state.session.lock().await;
            session.browser_log = "09:00 — docs.rs".to_string();
            session.day = Some(DayDraft {
                date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
                goal: "Learn Rust".to_string(),
                actions: "Read chapter 3".to_string(),
                time_spent_hours: 3,
            });
        }

        let response = post_analyze(
            State(state.clone()),
            Json(AnalyzeRequest {
                browser_log: Some("10:00 — example.com".to_string()),
            }),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(state.session.lock().await.browser_log, "09:00 — docs.rs");
        assert!(!state.history.lock().await.exists());
    }

    #[tokio::test]
    async fn analyze_without_api_key_is_rejected_with_state_untouched() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path(), None);
        {
            let mut session = state.session.lock().await;
            session.browser_log = "09:00 — docs.rs".to_string();
            session.day = Some(DayDraft {
                date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
                goal: "Learn Rust".to_string(),
                actions: "Read chapter 3".to_string(),
                time_spent_hours: 3,
            });
        }

        let response = post_analyze(
            State(state.clone()),
            Json(AnalyzeRequest {
                browser_log: Some("10:00 — example.com".to_string()),
            }),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.session.lock().await.browser_log, "09:00 — docs.rs");
    }

    #[test]
    fn goal_category_parses_leniently() {
        assert_eq!(GoalCategory::parse("Career"), Some(GoalCategory::Career));
        assert_eq!(GoalCategory::parse(" health "), Some(GoalCategory::Health));
        assert_eq!(GoalCategory::parse("LEARNING"), Some(GoalCategory::Learning));
        assert_eq!(GoalCategory::parse("unknown"), None);
    }

    #[test]
    fn parse_listen_accepts_common_forms() {
        assert_eq!(
            parse_listen("127.0.0.1:1234").unwrap(),
            "127.0.0.1:1234".parse().unwrap()
        );
        assert_eq!(
            parse_listen("127.0.0.1").unwrap(),
            format!("127.0.0.1:{DEFAULT_PORT}").parse().unwrap()
        );
        assert_eq!(
            parse_listen("localhost").unwrap(),
            format!("127.0.0.1:{DEFAULT_PORT}").parse().unwrap()
        );
        assert_eq!(
            parse_listen("localhost:9000").unwrap(),
            "127.0.0.1:9000".parse().unwrap()
        );
        assert!(parse_listen("not an address").is_err());
    }
}
