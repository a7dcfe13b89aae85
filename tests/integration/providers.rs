//! HTTP providers against local axum servers standing in for FMP, Custom
//! Search, the model APIs and Google Sheets.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::Secret;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use market_explorer::data::fmp::FmpClient;
use market_explorer::data::search::CustomSearchClient;
use market_explorer::data::{MarketDataSource, SearchContextSource};
use market_explorer::llm::anthropic::AnthropicClient;
use market_explorer::llm::openai::OpenAiClient;
use market_explorer::llm::{ChatMessage, LanguageModel, Prompt};
use market_explorer::net::RateLimitedClient;
use market_explorer::storage::sheets::ServiceAccountKey;
use market_explorer::storage::{GoogleSheetsStore, SheetSink};
use market_explorer::types::{AnalysisRecord, PipelineError, RecordStatus, Ticker};

use crate::fakes::{fast_policy, orchestrator, run_date, settings, tickers, FakeMarket, FakeSearch, ScriptedModel};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn client(name: &str, min_interval: Option<Duration>) -> Arc<RateLimitedClient> {
    Arc::new(RateLimitedClient::new(name, min_interval, fast_policy()))
}

// ---------------------------------------------------------------------------
// FMP
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct FmpState {
    profile_hits: Arc<AtomicUsize>,
    fail_first: usize,
}

async fn fmp_profile(
    State(st): State<FmpState>,
    Path(symbol): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let n = st.profile_hits.fetch_add(1, Ordering::SeqCst) + 1;
    if params.get("apikey").map(String::as_str) != Some("test-key") {
        return (StatusCode::UNAUTHORIZED, "bad key").into_response();
    }
    if n <= st.fail_first {
        return (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response();
    }
    Json(json!([{
        "symbol": symbol,
        "companyName": "Acme Corp",
        "price": 12.5,
        "mktCap": 1.0e9,
        "beta": 1.1,
        "fullTimeEmployees": "1200"
    }]))
    .into_response()
}

async fn fmp_income(Path(_symbol): Path<String>) -> Json<Value> {
    Json(json!([
        {"revenue": 5.0e8, "netIncomeRatio": 0.12, "ebitda": 9.0e7},
        {"revenue": 4.0e8}
    ]))
}

async fn fmp_cash_flow(Path(_symbol): Path<String>) -> Json<Value> {
    Json(json!([]))
}

async fn fmp_server(fail_first: usize) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let state = FmpState {
        profile_hits: hits.clone(),
        fail_first,
    };
    let router = Router::new()
        .route("/api/v3/profile/:symbol", get(fmp_profile))
        .route("/api/v3/income-statement/:symbol", get(fmp_income))
        .route("/api/v3/cash-flow-statement/:symbol", get(fmp_cash_flow))
        .with_state(state);
    (serve(router).await, hits)
}

#[tokio::test]
async fn test_fmp_retries_transient_failures_within_budget() {
    let (base, hits) = fmp_server(2).await;
    let rl = client("fmp", None);
    let fmp = FmpClient::new(base, Secret::new("test-key".into()), TIMEOUT, rl.clone()).unwrap();

    let snap = fmp.snapshot(&Ticker::new("aaa")).await.unwrap();

    // Profile: fail, fail, succeed. Statements: one attempt each.
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(rl.total_calls(), 5);
    assert_eq!(rl.total_retries(), 2);

    assert_eq!(snap.ticker, "AAA");
    assert_eq!(snap.company_name.as_deref(), Some("Acme Corp"));
    assert_eq!(snap.get("price"), Some(12.5));
    assert_eq!(snap.get("employees"), Some(1200.0));
    assert_eq!(snap.get("revenue"), Some(5.0e8));
    assert_eq!(snap.get("net_margin"), Some(0.12));
    assert_eq!(snap.get("free_cash_flow"), None);
}

#[tokio::test]
async fn test_fmp_exhaustion_is_source_unavailable() {
    let (base, hits) = fmp_server(100).await;
    let fmp = FmpClient::new(base, Secret::new("test-key".into()), TIMEOUT, client("fmp", None)).unwrap();

    let err = fmp.snapshot(&Ticker::new("AAA")).await.unwrap_err();
    assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_fmp_auth_failure_is_not_retried() {
    let (base, hits) = fmp_server(0).await;
    let fmp = FmpClient::new(base, Secret::new("wrong".into()), TIMEOUT, client("fmp", None)).unwrap();

    let err = fmp.snapshot(&Ticker::new("AAA")).await.unwrap_err();
    assert!(err.to_string().contains("401"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rate_limit_spaces_provider_calls() {
    let (base, _hits) = fmp_server(0).await;
    let period = Duration::from_millis(60);
    let rl = client("fmp", Some(period));
    let fmp = FmpClient::new(base, Secret::new("test-key".into()), TIMEOUT, rl.clone()).unwrap();

    let started = Instant::now();
    fmp.snapshot(&Ticker::new("AAA")).await.unwrap();
    let calls = rl.total_calls() as u32;

    assert_eq!(calls, 3);
    assert!(started.elapsed() >= period * (calls - 1));
}

// ---------------------------------------------------------------------------
// Custom Search
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct SearchState {
    hits: Arc<AtomicUsize>,
    nums: Arc<Mutex<Vec<String>>>,
}

fn item(url: &str) -> Value {
    json!({"title": format!("Title  for\n{url}"), "snippet": "Snippet", "link": url})
}

async fn cse(State(st): State<SearchState>, Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    st.hits.fetch_add(1, Ordering::SeqCst);
    st.nums
        .lock()
        .unwrap()
        .push(params.get("num").cloned().unwrap_or_default());
    let q = params.get("q").cloned().unwrap_or_default();
    let items = if q == "AAA stock news" {
        vec![item("https://a.example"), item("https://b.example"), item("https://c.example")]
    } else {
        vec![item("https://b.example"), item("https://d.example")]
    };
    Json(json!({"kind": "customsearch#search", "items": items}))
}

#[tokio::test]
async fn test_search_dedupes_across_queries_then_truncates() {
    let state = SearchState::default();
    let base = serve(
        Router::new()
            .route("/customsearch/v1", get(cse))
            .with_state(state.clone()),
    )
    .await;
    let endpoint = format!("{base}/customsearch/v1");
    let ticker = Ticker::with_name("AAA", "Acme Corp");

    let all = CustomSearchClient::new(
        endpoint.as_str(),
        Secret::new("k".into()),
        "cx-1",
        5,
        TIMEOUT,
        client("google-cse", None),
    )
    .unwrap();
    let results = all.search(&ticker).await.unwrap();
    let urls: Vec<_> = results.iter().map(|r| r.url.as_str()).collect();
    assert_eq!(
        urls,
        vec!["https://a.example", "https://b.example", "https://c.example", "https://d.example"]
    );
    assert_eq!(results[0].title, "Title for https://a.example");
    assert_eq!(results[3].query, "Acme Corp financial outlook");
    assert_eq!(state.hits.load(Ordering::SeqCst), 2);

    let top3 = CustomSearchClient::new(
        endpoint.as_str(),
        Secret::new("k".into()),
        "cx-1",
        3,
        TIMEOUT,
        client("google-cse", None),
    )
    .unwrap();
    assert_eq!(top3.search(&ticker).await.unwrap().len(), 3);
    assert_eq!(state.nums.lock().unwrap().last().map(String::as_str), Some("3"));
}

// ---------------------------------------------------------------------------
// Language models
// ---------------------------------------------------------------------------

fn prompt() -> Prompt {
    Prompt {
        system: "Reply in JSON.".to_string(),
        messages: vec![ChatMessage::user("TICKER: AAA")],
    }
}

async fn openai_chat(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer sk-test") {
        return (StatusCode::UNAUTHORIZED, "no").into_response();
    }
    assert_eq!(body["response_format"]["type"], "json_object");
    assert_eq!(body["messages"][0]["role"], "system");
    Json(json!({
        "choices": [{"message": {"role": "assistant", "content": "{\"summary\":\"ok\"}"}}],
        "usage": {"prompt_tokens": 1000, "completion_tokens": 500}
    }))
    .into_response()
}

#[tokio::test]
async fn test_openai_client_round_trip() {
    let base = serve(Router::new().route("/v1/chat/completions", post(openai_chat))).await;
    let model = OpenAiClient::new(Secret::new("sk-test".into()), None, None, TIMEOUT, client("llm", None))
        .unwrap()
        .with_url(format!("{base}/v1/chat/completions"));

    let reply = model.complete(&prompt()).await.unwrap();
    assert_eq!(reply, "{\"summary\":\"ok\"}");
    assert_eq!(model.total_tokens(), 1500);
    assert!(model.cumulative_cost() > rust_decimal::Decimal::ZERO);
}

async fn anthropic_messages(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if headers.get("x-api-key").and_then(|v| v.to_str().ok()) != Some("ak-test") {
        return (StatusCode::UNAUTHORIZED, "no").into_response();
    }
    assert_eq!(body["system"], "Reply in JSON.");
    assert!(headers.get("anthropic-version").is_some());
    Json(json!({
        "content": [{"type": "text", "text": "{\"summary\""}, {"type": "text", "text": ":\"ok\"}"}],
        "usage": {"input_tokens": 200, "output_tokens": 100}
    }))
    .into_response()
}

#[tokio::test]
async fn test_anthropic_client_joins_text_blocks() {
    let base = serve(Router::new().route("/v1/messages", post(anthropic_messages))).await;
    let model = AnthropicClient::new(Secret::new("ak-test".into()), None, None, TIMEOUT, client("llm", None))
        .unwrap()
        .with_url(format!("{base}/v1/messages"));

    let reply = model.complete(&prompt()).await.unwrap();
    assert_eq!(reply, "{\"summary\":\"ok\"}");
}

// ---------------------------------------------------------------------------
// Google Sheets
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct SheetsState {
    token_hits: Arc<AtomicUsize>,
    batches: Arc<Mutex<Vec<Value>>>,
    reject_token: bool,
}

async fn sheets_api(
    State(st): State<SheetsState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let path = uri.path().to_string();
    if path == "/token" {
        st.token_hits.fetch_add(1, Ordering::SeqCst);
        assert!(body.contains("jwt-bearer"));
        if st.reject_token {
            return (StatusCode::UNAUTHORIZED, r#"{"error":"invalid_grant"}"#).into_response();
        }
        return Json(json!({"access_token": "tok-1", "expires_in": 3600, "token_type": "Bearer"})).into_response();
    }
    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer tok-1") {
        return (StatusCode::UNAUTHORIZED, "no token").into_response();
    }
    if method == Method::GET && path.starts_with("/v4/spreadsheets/sheet-123/values/") {
        return Json(json!({
            "range": "Analysis!A1:Z1000",
            "majorDimension": "ROWS",
            "values": [["ticker", "run_date", "price_formula"], ["AAA", "2024-06-03", "$1,234.50"]]
        }))
        .into_response();
    }
    if method == Method::POST && path.ends_with("/values:batchUpdate") {
        let parsed: Value = serde_json::from_str(&body).unwrap();
        st.batches.lock().unwrap().push(parsed);
        return Json(json!({"spreadsheetId": "sheet-123"})).into_response();
    }
    (StatusCode::NOT_FOUND, "unknown route").into_response()
}

async fn sheets_sink(state: SheetsState) -> SheetSink {
    let base = serve(Router::new().fallback(sheets_api).with_state(state)).await;

    let mut key_json: Value =
        serde_json::from_str(include_str!("../fixtures/service_account.json")).unwrap();
    key_json["token_uri"] = json!(format!("{base}/token"));
    let key = ServiceAccountKey::from_json(&key_json.to_string()).unwrap();

    let store = GoogleSheetsStore::new("sheet-123", key, TIMEOUT)
        .unwrap()
        .with_api_base(base.as_str());
    SheetSink::new(Arc::new(store), "Analysis", client("google-sheets", None))
}

#[tokio::test]
async fn test_rejected_service_account_stops_run_before_analysis() {
    let state = SheetsState {
        reject_token: true,
        ..SheetsState::default()
    };
    let sink = sheets_sink(state.clone()).await;

    let market = Arc::new(FakeMarket::new().with("AAA", 1.0));
    let model = Arc::new(ScriptedModel::new());
    let orch = orchestrator(market.clone(), Arc::new(FakeSearch::new()), model.clone(), settings(1, None));

    let err = orch.run(&tickers(&["AAA", "BBB"]), &sink).await.unwrap_err();
    assert!(matches!(err, PipelineError::ConfigurationFailed(_)));
    assert!(err.to_string().contains("invalid_grant"));
    assert_eq!(err.exit_code(), 2);

    assert_eq!(market.calls.load(Ordering::SeqCst), 0);
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    assert_eq!(state.token_hits.load(Ordering::SeqCst), 1);
    assert!(state.batches.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_sheets_store_upsert_uses_one_batch_and_cached_token() {
    let state = SheetsState::default();
    let sink = sheets_sink(state.clone()).await;
    sink.check_access().await.unwrap();

    let record = AnalysisRecord {
        ticker: "AAA".into(),
        run_date: run_date(),
        summary: Some("Steady.".into()),
        score: Some(7.0),
        citations: vec!["https://a.example".into()],
        insights: Vec::new(),
        status: RecordStatus::Ok,
        reason: None,
    };
    let summary = sink
        .upsert(&[record, AnalysisRecord::failed("BBB", run_date(), "market data unavailable")], run_date())
        .await
        .unwrap();

    assert_eq!(summary.overwritten, 1);
    assert_eq!(summary.appended, 1);
    assert!(summary.header_changed);
    assert_eq!(state.token_hits.load(Ordering::SeqCst), 1);

    let batches = state.batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    assert_eq!(batch["valueInputOption"], "RAW");
    let ranges: Vec<_> = batch["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["range"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        ranges,
        vec!["'Analysis'!D1", "'Analysis'!A2", "'Analysis'!D2", "'Analysis'!A3", "'Analysis'!D3"]
    );

    // The user's column C is never sent back, so its formula survives.
    for d in batch["data"].as_array().unwrap() {
        let range = d["range"].as_str().unwrap();
        let width = d["values"][0].as_array().unwrap().len();
        let start = range.rsplit('!').next().unwrap().as_bytes()[0];
        assert!(
            !(start..start + width as u8).contains(&b'C'),
            "{range} covers a column the sink does not own"
        );
    }

    let key_cells = &batch["data"][1]["values"][0];
    assert_eq!(key_cells, &json!(["AAA", "2024-06-03"]));
    let owned = &batch["data"][2]["values"][0];
    assert_eq!(owned[0], "Steady.");
    assert_eq!(owned[1], json!(7.0));
    assert!(owned[1].is_number());
}
