mod common;

use bq_analyst::agent::{AgentDefinition, Runner};
use bq_analyst::config::{AgentConfig, ServerConfig};
use bq_analyst::server::{self, AppState};
use bq_analyst::warehouse::InMemoryWarehouse;
use common::{ORDERS_COUNT_SQL, ScriptedModel, answer, sample_warehouse, tool_call};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;

/// Serve the API on an ephemeral port; returns its base URL.
async fn spawn_server(model: ScriptedModel, static_dir: PathBuf) -> String {
    spawn_server_with(
        Arc::new(model),
        Arc::new(sample_warehouse()),
        static_dir,
    )
    .await
}

async fn spawn_server_with(
    model: Arc<ScriptedModel>,
    warehouse: Arc<InMemoryWarehouse>,
    static_dir: PathBuf,
) -> String {
    let config = AgentConfig::default();
    let agent = AgentDefinition::from_config(&config, "gemini-2.5-flash", "acme");
    let runner = Runner::new(Arc::new(agent), model, warehouse);
    let state = Arc::new(AppState::new(config.app_name.clone(), Arc::new(runner)));
    let server_config = ServerConfig {
        static_dir,
        ..ServerConfig::default()
    };
    let app = server::router(state, &server_config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn counting_script() -> ScriptedModel {
    ScriptedModel::new(vec![
        tool_call("c1", "dry_run_query", json!({"query": ORDERS_COUNT_SQL})),
        tool_call("c2", "execute_query", json!({"query": ORDERS_COUNT_SQL})),
        answer("There are 3 orders."),
    ])
}

async fn create_session(client: &reqwest::Client, base: &str, user: &str) -> String {
    let resp = client
        .post(format!("{base}/apps/agent/users/{user}/sessions"))
        .json(&json!({"appName": "agent", "userId": user}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    body["id"].as_str().expect("session id").to_string()
}

fn run_body(session_id: &str, text: &str) -> Value {
    json!({
        "appName": "agent",
        "userId": "u1",
        "sessionId": session_id,
        "new_message": {"role": "user", "parts": [{"text": text}]}
    })
}

#[tokio::test]
async fn health_and_list_apps() {
    let base = spawn_server(counting_script(), PathBuf::from("does-not-exist")).await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let apps: Vec<String> = client
        .get(format!("{base}/list-apps"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(apps, vec!["agent"]);
}

#[tokio::test]
async fn run_returns_events_and_records_session() {
    let base = spawn_server(counting_script(), PathBuf::from("does-not-exist")).await;
    let client = reqwest::Client::new();
    let session_id = create_session(&client, &base, "u1").await;

    let resp = client
        .post(format!("{base}/run"))
        .json(&run_body(&session_id, "How many orders?"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let events: Vec<Value> = resp.json().await.unwrap();
    assert_eq!(events.len(), 5, "call, result, call, result, answer");
    assert_eq!(events[0]["functionCalls"][0]["name"], "dry_run_query");
    let last = events.last().unwrap();
    assert_eq!(last["content"]["parts"][0]["text"], "There are 3 orders.");
    assert_eq!(last["turnComplete"], true);

    let session: Value = client
        .get(format!("{base}/apps/agent/users/u1/sessions/{session_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(session["events"].as_array().map(Vec::len), Some(6));
    assert_eq!(session["events"][0]["author"], "user");
    assert!(
        session["state"]["validated_queries"].is_object(),
        "dry-run memory should persist in session state"
    );
}

#[tokio::test]
async fn run_sse_streams_data_lines() {
    let base = spawn_server(counting_script(), PathBuf::from("does-not-exist")).await;
    let client = reqwest::Client::new();
    let session_id = create_session(&client, &base, "u1").await;

    let resp = client
        .post(format!("{base}/run_sse"))
        .json(&run_body(&session_id, "How many orders?"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(
        resp.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    let body = resp.text().await.unwrap();
    let events: Vec<Value> = body
        .split("\n\n")
        .filter_map(|chunk| chunk.trim().strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).expect("event JSON"))
        .collect();
    assert_eq!(events.len(), 5);
    assert_eq!(events[0]["author"], "root_agent");
    assert_eq!(events[4]["content"]["parts"][0]["text"], "There are 3 orders.");
}

#[tokio::test]
async fn run_rejects_bad_requests() {
    let base = spawn_server(counting_script(), PathBuf::from("does-not-exist")).await;
    let client = reqwest::Client::new();
    let session_id = create_session(&client, &base, "u1").await;

    let unknown_session = client
        .post(format!("{base}/run"))
        .json(&run_body("missing", "hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown_session.status(), 404);

    let empty = client
        .post(format!("{base}/run"))
        .json(&run_body(&session_id, "   "))
        .send()
        .await
        .unwrap();
    assert_eq!(empty.status(), 400);
    let detail: Value = empty.json().await.unwrap();
    assert!(detail["detail"].is_string());

    let mut wrong_app = run_body(&session_id, "hi");
    wrong_app["appName"] = json!("other");
    let resp = client
        .post(format!("{base}/run_sse"))
        .json(&wrong_app)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn session_lifecycle() {
    let base = spawn_server(counting_script(), PathBuf::from("does-not-exist")).await;
    let client = reqwest::Client::new();
    let url = format!("{base}/apps/agent/users/u1/sessions/fixed-id");

    let created = client.post(&url).send().await.unwrap();
    assert_eq!(created.status(), 200);
    let again = client.post(&url).send().await.unwrap();
    assert_eq!(again.status(), 409);

    let listed: Vec<Value> = client
        .get(format!("{base}/apps/agent/users/u1/sessions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["id"], "fixed-id");

    let deleted = client.delete(&url).send().await.unwrap();
    assert_eq!(deleted.status(), 204);
    let gone = client.get(&url).send().await.unwrap();
    assert_eq!(gone.status(), 404);

    let wrong_app = client
        .get(format!("{base}/apps/other/users/u1/sessions"))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_app.status(), 404);
}

#[tokio::test]
async fn static_files_fall_back_to_index() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<html>analyst</html>").unwrap();
    let base = spawn_server(counting_script(), dir.path().to_path_buf()).await;
    let client = reqwest::Client::new();

    let root = client.get(format!("{base}/")).send().await.unwrap();
    assert_eq!(root.text().await.unwrap(), "<html>analyst</html>");

    let deep_link = client.get(format!("{base}/chat/123")).send().await.unwrap();
    assert_eq!(deep_link.text().await.unwrap(), "<html>analyst</html>");

    // API routes still win.
    let health = client.get(format!("{base}/health")).send().await.unwrap();
    assert!(health.text().await.unwrap().contains("ok"));
}

#[tokio::test]
async fn client_state_cannot_mark_queries_as_validated() {
    const DELETE_SQL: &str = "DELETE FROM `acme.sales.orders` WHERE true";
    let model = Arc::new(ScriptedModel::new(vec![
        tool_call("c1", "execute_query", json!({"query": DELETE_SQL})),
        answer("Done."),
    ]));
    let warehouse = Arc::new(sample_warehouse());
    let base = spawn_server_with(model, warehouse.clone(), PathBuf::from("does-not-exist")).await;
    let client = reqwest::Client::new();

    let mut validated = serde_json::Map::new();
    validated.insert(DELETE_SQL.into(), json!("SELECT"));
    let created: Value = client
        .post(format!("{base}/apps/agent/users/u1/sessions/seeded"))
        .json(&json!({
            "state": {"validated_queries": validated, "theme": "dark"}
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(created["state"].get("validated_queries").is_none());
    assert_eq!(created["state"]["theme"], "dark");

    let events: Vec<Value> = client
        .post(format!("{base}/run"))
        .json(&run_body("seeded", "Clear the orders table"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let error = events[1]["functionResponses"][0]["response"]["error"]
        .as_str()
        .expect("execute_query should fail");
    assert!(error.starts_with("Blocked:"), "{error}");
    assert!(
        !warehouse
            .calls()
            .await
            .iter()
            .any(|c| c.starts_with("execute:")),
        "nothing may reach the warehouse"
    );
}

#[tokio::test]
async fn concurrent_runs_on_one_session_take_turns() {
    let model = Arc::new(ScriptedModel::new(vec![
        answer("First answer."),
        answer("Second answer."),
    ]));
    let base = spawn_server_with(
        model.clone(),
        Arc::new(sample_warehouse()),
        PathBuf::from("does-not-exist"),
    )
    .await;
    let client = reqwest::Client::new();
    let session_id = create_session(&client, &base, "u1").await;

    let send = |text: &'static str| {
        client
            .post(format!("{base}/run"))
            .json(&run_body(&session_id, text))
            .send()
    };
    let (a, b) = tokio::join!(send("hello"), send("hi again"));
    assert_eq!(a.unwrap().status(), 200);
    assert_eq!(b.unwrap().status(), 200);

    // The later turn saw the earlier one in its history.
    assert_eq!(model.calls(), 2);
    assert_eq!(model.conversation(1).len(), 3);

    let session: Value = client
        .get(format!("{base}/apps/agent/users/u1/sessions/{session_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let authors: Vec<&str> = session["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["author"].as_str().unwrap())
        .collect();
    assert_eq!(authors, vec!["user", "root_agent", "user", "root_agent"]);
}
