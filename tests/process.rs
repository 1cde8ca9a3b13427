//! Extraction pipeline integration tests

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use chrono::NaiveDate;
use serde_json::json;
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use v2note_gateway::api::{ApiServer, AppState};
use v2note_gateway::db::{
    DateRange, DatedTranscript, ExtractionTable, MemoryEntry, NewRecord, Record, RecordRepo,
    RecordSource, RecordStatus, SkillToggle, SoulRepo, SqliteStore, Store, Tag, TagRepo, Todo,
    TodoRepo,
};
use v2note_gateway::pipeline::{
    LocalConfig, LocalSoul, PipelineDeps, ProcessPipeline, ProcessRequest,
};
use v2note_gateway::storage::FsAudioStore;
use v2note_gateway::tools::{ToolRegistry, ToolServerConfig, TransportKind};
use v2note_gateway::{Error, Result};

mod common;
use common::{
    ESTIMATE, PROCESS, SOUL_MERGE, ScriptedCompletion, ScriptedRecognizer, deps, eventually,
    setup_store,
};

async fn new_record(store: &dyn Store, device_id: &str) -> String {
    store
        .create_record(NewRecord {
            device_id: device_id.to_string(),
            status: RecordStatus::Processing,
            source: RecordSource::Manual,
            duration_seconds: None,
            location_text: None,
        })
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn extraction_is_persisted_and_record_completed() {
    let (pool, store) = setup_store();
    TagRepo::new(pool.clone()).create("工作").unwrap();
    let record_id = new_record(store.as_ref(), "d1").await;

    let llm = ScriptedCompletion::new();
    llm.on(
        PROCESS,
        r#"{"summary":"明天下午开会，记得带合同","todos":["明天下午开会","带合同"],
            "customer_requests":["客户要报价"],"setting_changes":[],
            "tags":["工作","新标签","其他"]}"#,
    );
    let pipeline = ProcessPipeline::new(deps(store.clone(), llm.clone()));

    let mut request = ProcessRequest::new("嗯明天下午开会，那个记得带合同", "d1", record_id.clone());
    request.local_config = Some(LocalConfig {
        existing_tags: Some(vec!["工作".to_string(), "新标签".to_string()]),
        ..LocalConfig::default()
    });
    let result = pipeline.run(request).await;

    assert!(result.error.is_none(), "unexpected error: {:?}", result.error);
    assert_eq!(result.todos, vec!["明天下午开会", "带合同"]);
    assert_eq!(result.customer_requests, vec!["客户要报价"]);
    assert_eq!(result.tags, vec!["工作", "新标签"]);
    assert_eq!(result.summary.as_deref(), Some("明天下午开会，记得带合同"));

    let records = RecordRepo::new(pool.clone());
    assert_eq!(records.get(&record_id).unwrap().unwrap().status, RecordStatus::Completed);
    assert_eq!(
        records.summary(&record_id).unwrap().as_deref(),
        Some("明天下午开会，记得带合同")
    );

    let todos = TodoRepo::new(pool.clone());
    assert_eq!(todos.count_for_record(ExtractionTable::Todos, &record_id).unwrap(), 2);
    assert_eq!(
        todos
            .count_for_record(ExtractionTable::CustomerRequests, &record_id)
            .unwrap(),
        1
    );

    // Only tags that already exist are linked; none are created
    let tags = TagRepo::new(pool);
    assert_eq!(tags.names_for_record(&record_id).unwrap(), vec!["工作"]);
    assert_eq!(tags.count().unwrap(), 1);

    // The prompt carried the allow-list
    let calls = llm.calls_for(PROCESS);
    assert!(calls[0][0].content.contains("- \"新标签\""));
    assert_eq!(calls[0][1].content, "嗯明天下午开会，那个记得带合同");
}

#[tokio::test]
async fn invalid_model_output_marks_record_errored() {
    let (pool, store) = setup_store();
    let record_id = new_record(store.as_ref(), "d1").await;

    let llm = ScriptedCompletion::new();
    llm.on(PROCESS, "好的，我来帮你整理");
    let pipeline = ProcessPipeline::new(deps(store, llm));

    let result = pipeline
        .run(ProcessRequest::new("随便说点什么", "d1", record_id.clone()))
        .await;

    assert_eq!(result.error.as_deref(), Some("AI response is not valid JSON"));
    assert!(result.todos.is_empty());
    let record = RecordRepo::new(pool).get(&record_id).unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Error);
}

/// Store whose summary and todo writes fail
struct BrokenWrites(Arc<SqliteStore>);

#[async_trait]
impl Store for BrokenWrites {
    async fn create_record(&self, new: NewRecord) -> Result<Record> {
        self.0.create_record(new).await
    }
    async fn update_record_status(&self, record_id: &str, status: RecordStatus) -> Result<()> {
        self.0.update_record_status(record_id, status).await
    }
    async fn set_record_audio(&self, record_id: &str, path: &str) -> Result<()> {
        self.0.set_record_audio(record_id, path).await
    }
    async fn add_transcript(&self, record_id: &str, text: &str, language: &str) -> Result<()> {
        self.0.add_transcript(record_id, text, language).await
    }
    async fn transcripts_in_range(
        &self,
        device_id: &str,
        range: &DateRange,
    ) -> Result<Vec<DatedTranscript>> {
        self.0.transcripts_in_range(device_id, range).await
    }
    async fn save_summary(&self, _record_id: &str, _summary: &str) -> Result<()> {
        Err(Error::Database("disk full".to_string()))
    }
    async fn create_todos(&self, _record_id: &str, _texts: &[String]) -> Result<Vec<Todo>> {
        Err(Error::Database("disk full".to_string()))
    }
    async fn pending_todos(&self, device_id: &str) -> Result<Vec<Todo>> {
        self.0.pending_todos(device_id).await
    }
    async fn update_todo_estimate(
        &self,
        todo_id: &str,
        minutes: u32,
        priority: u8,
    ) -> Result<()> {
        self.0.update_todo_estimate(todo_id, minutes, priority).await
    }
    async fn create_customer_requests(&self, record_id: &str, texts: &[String]) -> Result<()> {
        self.0.create_customer_requests(record_id, texts).await
    }
    async fn create_setting_changes(&self, record_id: &str, texts: &[String]) -> Result<()> {
        self.0.create_setting_changes(record_id, texts).await
    }
    async fn find_tag(&self, name: &str) -> Result<Option<Tag>> {
        self.0.find_tag(name).await
    }
    async fn tag_record(&self, record_id: &str, tag_id: &str) -> Result<()> {
        self.0.tag_record(record_id, tag_id).await
    }
    async fn skill_toggles(&self, device_id: &str) -> Result<Vec<SkillToggle>> {
        self.0.skill_toggles(device_id).await
    }
    async fn memories(
        &self,
        device_id: &str,
        range: Option<&DateRange>,
    ) -> Result<Vec<MemoryEntry>> {
        self.0.memories(device_id, range).await
    }
    async fn save_memory(
        &self,
        device_id: &str,
        content: &str,
        source_date: Option<NaiveDate>,
        importance: u8,
    ) -> Result<()> {
        self.0
            .save_memory(device_id, content, source_date, importance)
            .await
    }
    async fn soul(&self, device_id: &str) -> Result<Option<String>> {
        self.0.soul(device_id).await
    }
    async fn save_soul(&self, device_id: &str, content: &str) -> Result<()> {
        self.0.save_soul(device_id, content).await
    }
}

#[tokio::test]
async fn failed_writes_still_complete_the_record() {
    let (pool, store) = setup_store();
    let record_id = new_record(store.as_ref(), "d1").await;

    let llm = ScriptedCompletion::new();
    llm.on(
        PROCESS,
        r#"{"summary":"周五前交报告","todos":["周五前交报告"],"customer_requests":["客户要发票"]}"#,
    );
    let pipeline = ProcessPipeline::new(deps(Arc::new(BrokenWrites(store)), llm));

    let result = pipeline
        .run(ProcessRequest::new("周五前交报告，客户要发票", "d1", record_id.clone()))
        .await;

    assert!(result.error.is_none(), "unexpected error: {:?}", result.error);
    assert_eq!(result.todos, vec!["周五前交报告"]);
    assert_eq!(result.summary.as_deref(), Some("周五前交报告"));

    let record = RecordRepo::new(pool.clone()).get(&record_id).unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Completed);
    let todos = TodoRepo::new(pool);
    assert_eq!(todos.count_for_record(ExtractionTable::Todos, &record_id).unwrap(), 0);
    assert_eq!(
        todos
            .count_for_record(ExtractionTable::CustomerRequests, &record_id)
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn completion_failure_is_reported_in_result() {
    let (pool, store) = setup_store();
    let record_id = new_record(store.as_ref(), "d1").await;

    let llm = ScriptedCompletion::new();
    llm.fail_on(PROCESS, "AI API error 500: upstream down");
    let pipeline = ProcessPipeline::new(deps(store, llm));

    let result = pipeline
        .run(ProcessRequest::new("明天开会", "d1", record_id.clone()))
        .await;

    assert_eq!(result.error.as_deref(), Some("AI API error 500: upstream down"));
    let record = RecordRepo::new(pool).get(&record_id).unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Error);
}

#[tokio::test]
async fn tool_loop_stops_after_three_rounds() {
    let (_pool, store) = setup_store();
    let record_id = new_record(store.as_ref(), "d1").await;

    let llm = ScriptedCompletion::new();
    llm.on(
        PROCESS,
        r#"{"tool_calls":[{"name":"calendar__today","arguments":{}}],"todos":["查日程"]}"#,
    );
    let pipeline = ProcessPipeline::new(deps(store, llm.clone()));

    let result = pipeline
        .run(ProcessRequest::new("看看今天有什么安排", "d1", record_id))
        .await;

    // One initial call plus three tool rounds
    let calls = llm.calls_for(PROCESS);
    assert_eq!(calls.len(), 4);
    let last = calls.last().unwrap();
    assert_eq!(last.len(), 2 + 2 * 3);
    let tool_turn = &last[last.len() - 1].content;
    assert!(tool_turn.starts_with("工具调用结果：\n[calendar__today] Error:"));

    assert!(result.error.is_none());
    assert_eq!(result.todos, vec!["查日程"]);
}

#[tokio::test]
async fn tool_reported_errors_are_marked_for_the_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({"method": "initialize"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 1,
            "result": {"protocolVersion": "2024-11-05", "capabilities": {}, "serverInfo": {"name": "calendar"}}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({"method": "tools/list"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 2,
            "result": {"tools": [{"name": "today", "description": "今天的日程"}]}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({"method": "tools/call"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 3,
            "result": {"content": [{"type": "text", "text": "calendar locked"}], "isError": true}
        })))
        .mount(&server)
        .await;

    let tools = ToolRegistry::new();
    tools
        .register(ToolServerConfig {
            name: "calendar".to_string(),
            transport: TransportKind::Http,
            command: None,
            args: vec![],
            url: Some(format!("{}/rpc", server.uri())),
            description: None,
            enabled: true,
        })
        .await
        .unwrap();

    let (_pool, store) = setup_store();
    let record_id = new_record(store.as_ref(), "d1").await;
    let llm = ScriptedCompletion::new();
    llm.on(PROCESS, r#"{"tool_calls":[{"name":"calendar__today"}]}"#)
        .on(PROCESS, r#"{"todos":["稍后查日程"]}"#);
    let pipeline = ProcessPipeline::new(PipelineDeps {
        tools: Arc::new(tools),
        ..deps(store, llm.clone())
    });

    let result = pipeline
        .run(ProcessRequest::new("今天有什么安排", "d1", record_id))
        .await;

    let calls = llm.calls_for(PROCESS);
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[1].last().unwrap().content,
        "工具调用结果：\n[calendar__today] Error: calendar locked"
    );
    assert_eq!(result.todos, vec!["稍后查日程"]);
}

#[tokio::test]
async fn tool_loop_ends_when_no_calls_remain() {
    let (_pool, store) = setup_store();
    let record_id = new_record(store.as_ref(), "d1").await;

    let llm = ScriptedCompletion::new();
    llm.on(PROCESS, r#"{"tool_calls":[{"name":"weather__now","arguments":"{\"city\":\"杭州\"}"}]}"#)
        .on(PROCESS, r#"{"todos":["带伞"]}"#);
    let pipeline = ProcessPipeline::new(deps(store, llm.clone()));

    let result = pipeline
        .run(ProcessRequest::new("杭州会下雨吗", "d1", record_id))
        .await;

    assert_eq!(llm.calls_for(PROCESS).len(), 2);
    assert_eq!(result.todos, vec!["带伞"]);
}

#[tokio::test]
async fn new_todos_get_time_estimates() {
    let (pool, store) = setup_store();
    let record_id = new_record(store.as_ref(), "d1").await;

    let llm = ScriptedCompletion::new();
    llm.on(PROCESS, r#"{"todos":["写周报","订机票"]}"#).on(
        ESTIMATE,
        r#"{"estimates":[{"index":1,"estimated_minutes":60,"priority":4,"reasoning":"需要整理数据"}]}"#,
    );
    let pipeline = ProcessPipeline::new(deps(store, llm));

    pipeline
        .run(ProcessRequest::new("写周报，订机票", "d1", record_id.clone()))
        .await;

    let todos = TodoRepo::new(pool);
    eventually(|| {
        todos
            .list_by_record(&record_id)
            .unwrap()
            .iter()
            .any(|t| t.text == "写周报" && t.estimated_minutes == Some(60) && t.priority == Some(4))
    })
    .await;

    // Todos the reply skipped keep no estimate
    let booked = todos
        .list_by_record(&record_id)
        .unwrap()
        .into_iter()
        .find(|t| t.text == "订机票")
        .unwrap();
    assert_eq!(booked.estimated_minutes, None);
}

#[tokio::test]
async fn local_soul_overrides_stored_soul() {
    let (pool, store) = setup_store();
    store.save_soul("d1", "存储的身份").await.unwrap();
    let record_id = new_record(store.as_ref(), "d1").await;

    let llm = ScriptedCompletion::new();
    llm.on(PROCESS, r#"{"todos":[]}"#).on(SOUL_MERGE, "更新后的身份");
    let pipeline = ProcessPipeline::new(deps(store, llm.clone()));

    let mut request = ProcessRequest::new("以后叫我小王", "d1", record_id);
    request.local_config = Some(LocalConfig {
        soul: Some(LocalSoul {
            content: "本地身份".to_string(),
        }),
        ..LocalConfig::default()
    });
    pipeline.run(request).await;

    let system = &llm.calls_for(PROCESS)[0][0].content;
    assert!(system.contains("本地身份"));
    assert!(!system.contains("存储的身份"));

    // The persona merge runs in the background against the stored document
    let souls = SoulRepo::new(pool);
    eventually(|| souls.get("d1").unwrap().as_deref() == Some("更新后的身份")).await;
}

#[tokio::test]
async fn transcripts_feed_short_term_memory() {
    let (_pool, store) = setup_store();
    let first = new_record(store.as_ref(), "d1").await;
    let second = new_record(store.as_ref(), "d1").await;

    let llm = ScriptedCompletion::new();
    llm.on(PROCESS, r#"{"todos":[]}"#);
    let deps = deps(store, llm.clone());
    let sessions = deps.sessions.clone();
    let pipeline = ProcessPipeline::new(deps);

    pipeline.run(ProcessRequest::new("第一条记录", "d1", first)).await;
    pipeline.run(ProcessRequest::new("第二条记录", "d1", second)).await;

    assert_eq!(sessions.lock("d1").await.short_term.len(), 2);
    let system = &llm.calls_for(PROCESS)[1][0].content;
    assert!(system.contains("第一条记录"));
}

#[tokio::test]
async fn rest_endpoint_returns_process_result() {
    let (pool, store) = setup_store();
    let record_id = new_record(store.as_ref(), "d1").await;

    let llm = ScriptedCompletion::new();
    llm.on(PROCESS, r#"{"todos":["回电话"],"summary":"回电话"}"#);
    let (recognizer, _tasks) = ScriptedRecognizer::new();
    let audio_dir = tempfile::tempdir().unwrap();
    let state = AppState::new(
        deps(store, llm),
        recognizer,
        Arc::new(FsAudioStore::new(audio_dir.path())),
    );
    let app = ApiServer::new(Arc::new(state), 0).router();

    let body = serde_json::json!({"text": "回电话", "deviceId": "d1", "recordId": record_id});
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/process")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["todos"], serde_json::json!(["回电话"]));
    assert_eq!(json["tags"], serde_json::json!([]));
    assert!(json.get("error").is_none());

    let record = RecordRepo::new(pool).get(&record_id).unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Completed);
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let (_pool, store) = setup_store();
    let (recognizer, _tasks) = ScriptedRecognizer::new();
    let audio_dir = tempfile::tempdir().unwrap();
    let state = AppState::new(
        deps(store, ScriptedCompletion::new()),
        recognizer,
        Arc::new(FsAudioStore::new(audio_dir.path())),
    );
    let app = ApiServer::new(Arc::new(state), 0).router();

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert!(json["timestamp"].is_string());
}
