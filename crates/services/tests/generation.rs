use std::sync::Arc;

use async_trait::async_trait;
use db::{
    DBService,
    models::{
        contract::{Contract, ContractStatus},
        user::{CreateUser, User},
    },
};
use services::services::{
    cancellation::CancellationRegistry,
    generator::{GenerationService, GeneratorError},
    provider::{ChunkStream, ContentProvider, INSUFFICIENT_TITLE_SENTINEL, ProviderError},
};
use utils::sse::SseEvent;
use uuid::Uuid;

/// Deterministic stand-in for the generative backend.
struct ScriptedProvider {
    title: String,
    sections: Vec<String>,
    chunks_per_section: usize,
    failing_section: Option<String>,
    edit_chunks: Vec<String>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self {
            title: "Service Agreement".to_string(),
            sections: vec![
                "1. Introduction".to_string(),
                "2. Definitions".to_string(),
                "3. Termination".to_string(),
            ],
            chunks_per_section: 2,
            failing_section: None,
            edit_chunks: vec!["Edited ".to_string(), "contract ".to_string(), "content".to_string()],
        }
    }
}

#[async_trait]
impl ContentProvider for ScriptedProvider {
    async fn title_for(&self, _prompt: &str) -> Result<String, ProviderError> {
        Ok(self.title.clone())
    }

    async fn outline_for(&self, _prompt: &str) -> Result<Vec<String>, ProviderError> {
        Ok(self.sections.clone())
    }

    async fn write_section(
        &self,
        _prompt: &str,
        section_title: &str,
    ) -> Result<ChunkStream, ProviderError> {
        if self.failing_section.as_deref() == Some(section_title) {
            return Err(ProviderError::Malformed("scripted failure".to_string()));
        }
        let section = section_title.to_string();
        Ok(Box::pin(futures::stream::iter(
            (0..self.chunks_per_section).map(move |i| format!("{section} body {i}. ")),
        )))
    }

    async fn edit(
        &self,
        _document: &str,
        _instruction: &str,
    ) -> Result<ChunkStream, ProviderError> {
        Ok(Box::pin(futures::stream::iter(self.edit_chunks.clone())))
    }

    async fn suggest_edits(&self, _document: &str) -> Result<Vec<String>, ProviderError> {
        Ok(vec!["Add termination clause".to_string()])
    }
}

async fn setup(provider: ScriptedProvider) -> (GenerationService, DBService, User) {
    let db = DBService::new_in_memory().await.expect("db");
    let user = User::create(
        &db.pool,
        &CreateUser {
            email: "owner@example.com".to_string(),
            password_hash: "hash".to_string(),
        },
        Uuid::new_v4(),
    )
    .await
    .expect("user");
    let service = GenerationService::new(db.clone(), Arc::new(provider), CancellationRegistry::new());
    (service, db, user)
}

async fn collect(mut events: tokio::sync::mpsc::Receiver<SseEvent>) -> Vec<SseEvent> {
    let mut all = Vec::new();
    while let Some(event) = events.recv().await {
        all.push(event);
    }
    all
}

fn named<'a>(events: &'a [SseEvent], name: &str) -> Vec<&'a SseEvent> {
    events
        .iter()
        .filter(|event| event.event.as_deref() == Some(name))
        .collect()
}

#[tokio::test]
async fn generation_streams_and_persists_complete_contract() {
    let (service, db, user) = setup(ScriptedProvider::default()).await;

    let stream = service
        .start_generation(user.id, "Draft a service agreement for consulting work")
        .await
        .expect("start");
    let contract_id = stream.contract.id;
    let events = collect(stream.events).await;

    let id_events = named(&events, "contract_id");
    assert_eq!(id_events.len(), 1);
    assert_eq!(
        events.first().and_then(|event| event.event.as_deref()),
        Some("contract_id")
    );
    assert!(id_events[0].data.contains(&contract_id.to_string()));
    assert_eq!(named(&events, "done").len(), 1);
    assert_eq!(
        events.last().and_then(|event| event.event.as_deref()),
        Some("done")
    );
    assert!(named(&events, "cancelled").is_empty());
    assert!(named(&events, "error").is_empty());

    let row = Contract::find_by_id(&db.pool, contract_id)
        .await
        .expect("query")
        .expect("row");
    assert_eq!(row.status, ContractStatus::Completed);
    assert!(row.completed_at.is_some());
    let content = row.content.expect("content");
    assert!(content.contains("<h1>Service Agreement</h1>"));
    let mut last_index = 0;
    for section in ["1. Introduction", "2. Definitions", "3. Termination"] {
        let index = content[last_index..]
            .find(section)
            .unwrap_or_else(|| panic!("section {section} missing or out of order"));
        last_index += index;
    }

    // Terminal event emitted, so the token must be gone.
    assert!(
        !service
            .registry()
            .is_active(&CancellationRegistry::generation_key(contract_id))
    );
}

#[tokio::test]
async fn insufficient_prompt_is_rejected_without_persisting() {
    let provider = ScriptedProvider {
        title: INSUFFICIENT_TITLE_SENTINEL.to_string(),
        ..Default::default()
    };
    let (service, db, user) = setup(provider).await;

    let err = service
        .start_generation(user.id, "hello")
        .await
        .expect_err("should reject");
    assert!(matches!(err, GeneratorError::Validation(_)));

    let rows = Contract::find_for_user(&db.pool, user.id, 20, 0)
        .await
        .expect("rows");
    assert!(rows.is_empty());
}

#[tokio::test]
async fn blank_prompt_is_rejected() {
    let (service, _db, user) = setup(ScriptedProvider::default()).await;
    assert!(matches!(
        service.start_generation(user.id, "   ").await,
        Err(GeneratorError::Validation(_))
    ));
}

#[tokio::test]
async fn failed_section_is_isolated_and_generation_still_completes() {
    let provider = ScriptedProvider {
        failing_section: Some("2. Definitions".to_string()),
        ..Default::default()
    };
    let (service, db, user) = setup(provider).await;

    let stream = service
        .start_generation(user.id, "Draft a service agreement")
        .await
        .expect("start");
    let contract_id = stream.contract.id;
    let events = collect(stream.events).await;

    assert_eq!(named(&events, "done").len(), 1);
    assert!(named(&events, "error").is_empty());

    let row = Contract::find_by_id(&db.pool, contract_id)
        .await
        .expect("query")
        .expect("row");
    assert_eq!(row.status, ContractStatus::Completed);
    let content = row.content.expect("content");
    assert!(content.contains("Error in section '2. Definitions'"));
    assert!(content.contains("3. Termination"));
}

#[tokio::test]
async fn stop_cancels_generation_and_preserves_partial_content() {
    let provider = ScriptedProvider {
        chunks_per_section: 200,
        sections: vec!["1. Introduction".to_string(), "2. Definitions".to_string()],
        ..Default::default()
    };
    let (service, db, user) = setup(provider).await;

    let mut stream = service
        .start_generation(user.id, "Draft a service agreement")
        .await
        .expect("start");
    let contract_id = stream.contract.id;

    // Read a handful of frames, then signal cancellation mid-section. The
    // driver cannot run far ahead: it blocks once the channel buffer fills.
    let mut seen = Vec::new();
    for _ in 0..8 {
        seen.push(stream.events.recv().await.expect("frame"));
    }
    assert_eq!(service.stop(contract_id), 1);
    assert_eq!(service.stop(contract_id), 0, "second stop finds nothing live");

    while let Some(event) = stream.events.recv().await {
        seen.push(event);
    }

    assert_eq!(named(&seen, "cancelled").len(), 1);
    assert!(named(&seen, "done").is_empty());
    assert_eq!(
        seen.last().and_then(|event| event.event.as_deref()),
        Some("cancelled"),
        "no content may follow the cancellation event"
    );

    // The persisted row holds exactly the text streamed before cancellation:
    // every unnamed frame, in order, and nothing more.
    let streamed: String = seen
        .iter()
        .filter(|event| event.event.is_none())
        .map(|event| event.data.as_str())
        .collect();
    let row = Contract::find_by_id(&db.pool, contract_id)
        .await
        .expect("query")
        .expect("row");
    assert_eq!(row.status, ContractStatus::Cancelled);
    assert_eq!(row.content.as_deref(), Some(streamed.as_str()));
    assert!(
        !service
            .registry()
            .is_active(&CancellationRegistry::generation_key(contract_id))
    );
}

#[tokio::test]
async fn dropped_client_stops_generation_silently() {
    let provider = ScriptedProvider {
        chunks_per_section: 200,
        ..Default::default()
    };
    let (service, db, user) = setup(provider).await;

    let mut stream = service
        .start_generation(user.id, "Draft a service agreement")
        .await
        .expect("start");
    let contract_id = stream.contract.id;

    for _ in 0..4 {
        stream.events.recv().await.expect("frame");
    }
    drop(stream.events);

    // The driver notices the closed channel at its next liveness probe.
    let key = CancellationRegistry::generation_key(contract_id);
    for _ in 0..100 {
        if !service.registry().is_active(&key) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(!service.registry().is_active(&key));

    let row = Contract::find_by_id(&db.pool, contract_id)
        .await
        .expect("query")
        .expect("row");
    assert_eq!(row.status, ContractStatus::Cancelled);
}

async fn completed_contract(db: &DBService, user: &User) -> Contract {
    let contract = Contract::create(
        &db.pool,
        &db::models::contract::CreateContract {
            user_id: user.id,
            title: "Service Agreement".to_string(),
            prompt: "Draft a service agreement".to_string(),
        },
        Uuid::new_v4(),
    )
    .await
    .expect("contract");
    Contract::complete(&db.pool, contract.id, "<h1>Original body</h1>")
        .await
        .expect("complete");
    Contract::find_by_id(&db.pool, contract.id)
        .await
        .expect("query")
        .expect("row")
}

#[tokio::test]
async fn edit_streams_chunks_and_creates_a_new_version() {
    let (service, db, user) = setup(ScriptedProvider::default()).await;
    let original = completed_contract(&db, &user).await;

    let stream = service
        .start_edit(original.clone(), "Make the payment terms more flexible")
        .await
        .expect("start edit");
    assert!(stream.edit_id.starts_with(&format!("edit_{}_", original.id)));
    let events = collect(stream.events).await;

    assert_eq!(
        events.first().and_then(|event| event.event.as_deref()),
        Some("edit_started")
    );
    let complete = named(&events, "edit_complete");
    assert_eq!(complete.len(), 1);
    assert_eq!(
        events.last().and_then(|event| event.event.as_deref()),
        Some("edit_complete")
    );

    let payload: serde_json::Value =
        serde_json::from_str(&complete[0].data).expect("edit_complete payload");
    let new_id: Uuid = payload["new_contract_id"]
        .as_str()
        .expect("id string")
        .parse()
        .expect("uuid");
    assert_ne!(new_id, original.id);

    let version = Contract::find_by_id(&db.pool, new_id)
        .await
        .expect("query")
        .expect("row");
    assert_eq!(version.title, "Service Agreement (Edited)");
    assert_eq!(version.status, ContractStatus::Completed);
    assert_eq!(version.content.as_deref(), Some("Edited contract content"));

    let after = Contract::find_by_id(&db.pool, original.id)
        .await
        .expect("query")
        .expect("row");
    assert_eq!(after.content, original.content);
    assert_eq!(after.updated_at, original.updated_at);
}

#[tokio::test]
async fn edit_requires_content_and_a_prompt() {
    let (service, db, user) = setup(ScriptedProvider::default()).await;

    let empty = Contract::create(
        &db.pool,
        &db::models::contract::CreateContract {
            user_id: user.id,
            title: "Empty".to_string(),
            prompt: "p".to_string(),
        },
        Uuid::new_v4(),
    )
    .await
    .expect("contract");
    assert!(matches!(
        service.start_edit(empty, "change it").await,
        Err(GeneratorError::Validation(_))
    ));

    let full = completed_contract(&db, &user).await;
    assert!(matches!(
        service.start_edit(full, "  ").await,
        Err(GeneratorError::Validation(_))
    ));
}

#[tokio::test]
async fn cancelled_edit_preserves_partial_output_as_cancelled_version() {
    let provider = ScriptedProvider {
        edit_chunks: (0..400).map(|i| format!("chunk {i} ")).collect(),
        ..Default::default()
    };
    let (service, db, user) = setup(provider).await;
    let original = completed_contract(&db, &user).await;

    let mut stream = service
        .start_edit(original.clone(), "rewrite everything")
        .await
        .expect("start edit");

    let mut seen = Vec::new();
    for _ in 0..5 {
        seen.push(stream.events.recv().await.expect("frame"));
    }
    assert_eq!(service.stop(original.id), 1);
    while let Some(event) = stream.events.recv().await {
        seen.push(event);
    }

    assert_eq!(named(&seen, "cancelled").len(), 1);
    assert!(named(&seen, "edit_complete").is_empty());

    let rows = Contract::find_for_user(&db.pool, user.id, 20, 0)
        .await
        .expect("rows");
    let partial = rows
        .iter()
        .find(|row| row.status == ContractStatus::Cancelled)
        .expect("partial version row");
    assert_ne!(partial.id, original.id);
    assert_eq!(partial.title, "Service Agreement (Edited)");
    assert!(partial.content.as_deref().is_some_and(|c| c.starts_with("chunk 0 ")));

    let after = Contract::find_by_id(&db.pool, original.id)
        .await
        .expect("query")
        .expect("row");
    assert_eq!(after.status, ContractStatus::Completed);
    assert_eq!(after.content, original.content);
}

#[tokio::test]
async fn suggestions_require_content() {
    let (service, db, user) = setup(ScriptedProvider::default()).await;

    let empty = Contract::create(
        &db.pool,
        &db::models::contract::CreateContract {
            user_id: user.id,
            title: "Empty".to_string(),
            prompt: "p".to_string(),
        },
        Uuid::new_v4(),
    )
    .await
    .expect("contract");
    assert!(matches!(
        service.suggestions_for(&empty).await,
        Err(GeneratorError::Validation(_))
    ));

    let full = completed_contract(&db, &user).await;
    let suggestions = service.suggestions_for(&full).await.expect("suggestions");
    assert_eq!(suggestions, vec!["Add termination clause".to_string()]);
}
