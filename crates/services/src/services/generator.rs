use std::sync::Arc;

use db::{
    DBService,
    models::contract::{Contract, ContractStatus, CreateContract},
};
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use utils::sse::SseEvent;
use uuid::Uuid;

use crate::services::{
    cancellation::CancellationRegistry,
    provider::{ContentProvider, ProviderError, is_insufficient_title},
};

/// How many chunks accumulate between partial-content flushes. Bounds write
/// amplification while keeping a recent recovery point.
pub const FLUSH_INTERVAL: usize = 10;

/// Frames buffered between the driver task and the HTTP response. A slow or
/// absent reader blocks the driver at the next send, so a fast provider can
/// never run unboundedly ahead of the client.
const STREAM_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// A started generation: the freshly created row plus the event stream for
/// the HTTP response.
#[derive(Debug)]
pub struct GenerationStream {
    pub contract: Contract,
    pub events: mpsc::Receiver<SseEvent>,
}

/// A started streamed edit.
#[derive(Debug)]
pub struct EditStream {
    pub edit_id: String,
    pub events: mpsc::Receiver<SseEvent>,
}

enum Exit {
    Completed,
    Cancelled,
    Disconnected,
}

/// Drives one end-to-end contract build or edit: pulls structure and chunks
/// from the provider, forwards frames to the client, periodically persists
/// partial state, and checks cancellation and client liveness before every
/// unit of work.
#[derive(Clone)]
pub struct GenerationService {
    db: DBService,
    provider: Arc<dyn ContentProvider>,
    registry: CancellationRegistry,
}

impl GenerationService {
    pub fn new(
        db: DBService,
        provider: Arc<dyn ContentProvider>,
        registry: CancellationRegistry,
    ) -> Self {
        Self {
            db,
            provider,
            registry,
        }
    }

    pub fn registry(&self) -> &CancellationRegistry {
        &self.registry
    }

    /// Validates the prompt, creates the contract row in GENERATING, registers
    /// a cancellation token and spawns the driver task. Fails before any
    /// streaming starts, so errors here still map to plain HTTP statuses.
    pub async fn start_generation(
        &self,
        user_id: Uuid,
        prompt: &str,
    ) -> Result<GenerationStream, GeneratorError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(GeneratorError::Validation("Prompt is required".to_string()));
        }

        let title = self.provider.title_for(prompt).await?;
        if is_insufficient_title(&title) {
            return Err(GeneratorError::Validation(
                "The prompt does not contain sufficient information to generate a contract"
                    .to_string(),
            ));
        }

        let contract = Contract::create(
            &self.db.pool,
            &CreateContract {
                user_id,
                title,
                prompt: prompt.to_string(),
            },
            Uuid::new_v4(),
        )
        .await?;

        let key = CancellationRegistry::generation_key(contract.id);
        let token = self.registry.register(&key);
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        let service = self.clone();
        let driver_contract = contract.clone();
        tokio::spawn(async move {
            service.run_generation(driver_contract, token, tx).await;
        });

        Ok(GenerationStream {
            contract,
            events: rx,
        })
    }

    async fn run_generation(
        self,
        contract: Contract,
        token: CancellationToken,
        tx: mpsc::Sender<SseEvent>,
    ) {
        let mut buffer = String::new();
        match self
            .drive_generation(&contract, &token, &tx, &mut buffer)
            .await
        {
            Ok(Exit::Completed) => {
                tracing::info!(contract_id = %contract.id, "contract generation completed");
            }
            Ok(Exit::Cancelled) => {
                tracing::info!(contract_id = %contract.id, "contract generation cancelled");
            }
            Ok(Exit::Disconnected) => {
                tracing::info!(contract_id = %contract.id, "client disconnected, generation stopped");
            }
            Err(err) => {
                // Partial work is preserved as a cancelled row rather than
                // failed, and the error can only travel in-band at this point.
                tracing::error!(contract_id = %contract.id, error = %err, "contract generation failed");
                self.persist_cancelled(&contract, &buffer).await;
                send(&tx, SseEvent::named("error", err.to_string())).await;
            }
        }
        self.registry
            .remove(&CancellationRegistry::generation_key(contract.id));
    }

    async fn drive_generation(
        &self,
        contract: &Contract,
        token: &CancellationToken,
        tx: &mpsc::Sender<SseEvent>,
        buffer: &mut String,
    ) -> Result<Exit, GeneratorError> {
        let pool = &self.db.pool;
        let sections = self.provider.outline_for(&contract.prompt).await?;

        let id_payload = serde_json::json!({ "contract_id": contract.id }).to_string();
        if !send(tx, SseEvent::named("contract_id", id_payload)).await {
            self.persist_cancelled(contract, buffer).await;
            return Ok(Exit::Disconnected);
        }
        self.emit_fragment(tx, buffer, format!("<h1>{}</h1>\n", contract.title))
            .await;
        self.emit_fragment(tx, buffer, "<div class='contract-body'>".to_string())
            .await;

        let mut chunks_since_flush = 0usize;
        for section_title in &sections {
            if token.is_cancelled() {
                return self.finish_cancelled(contract, tx, buffer).await;
            }
            if tx.is_closed() {
                self.persist_cancelled(contract, buffer).await;
                return Ok(Exit::Disconnected);
            }

            self.emit_fragment(tx, buffer, format!("<h2>{section_title}</h2>"))
                .await;
            self.emit_fragment(tx, buffer, "<p>".to_string()).await;

            match self
                .provider
                .write_section(&contract.prompt, section_title)
                .await
            {
                Ok(mut chunks) => {
                    while let Some(chunk) = chunks.next().await {
                        // Checked before the chunk is appended or emitted so
                        // cancellation latency is bounded by chunk delivery,
                        // not section length.
                        if token.is_cancelled() {
                            return self.finish_cancelled(contract, tx, buffer).await;
                        }
                        if tx.is_closed() {
                            self.persist_cancelled(contract, buffer).await;
                            return Ok(Exit::Disconnected);
                        }

                        buffer.push_str(&chunk);
                        send(tx, SseEvent::message(chunk)).await;

                        chunks_since_flush += 1;
                        if chunks_since_flush >= FLUSH_INTERVAL {
                            Contract::update_content(pool, contract.id, buffer).await?;
                            chunks_since_flush = 0;
                        }
                    }
                }
                Err(err) => {
                    // One broken section must not abort the whole document.
                    tracing::warn!(
                        contract_id = %contract.id,
                        section = %section_title,
                        error = %err,
                        "section generation failed, continuing with next section"
                    );
                    self.emit_fragment(
                        tx,
                        buffer,
                        format!("Error in section '{section_title}': {err}"),
                    )
                    .await;
                }
            }

            self.emit_fragment(tx, buffer, "</p>".to_string()).await;
        }

        self.emit_fragment(tx, buffer, "</div>".to_string()).await;
        Contract::complete(pool, contract.id, buffer).await?;
        send(
            tx,
            SseEvent::named(
                "done",
                format!("<p><strong>Contract {} completed.</strong></p>", contract.id),
            ),
        )
        .await;
        Ok(Exit::Completed)
    }

    async fn finish_cancelled(
        &self,
        contract: &Contract,
        tx: &mpsc::Sender<SseEvent>,
        buffer: &str,
    ) -> Result<Exit, GeneratorError> {
        self.persist_cancelled(contract, buffer).await;
        send(tx, SseEvent::named("cancelled", "Generation cancelled by user")).await;
        Ok(Exit::Cancelled)
    }

    /// Best effort: a row deleted out from under us is logged, not fatal.
    async fn persist_cancelled(&self, contract: &Contract, buffer: &str) {
        let partial = (!buffer.is_empty()).then_some(buffer);
        match Contract::cancel(&self.db.pool, contract.id, partial).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(contract_id = %contract.id, "contract row vanished during cancellation");
            }
            Err(err) => {
                tracing::error!(contract_id = %contract.id, error = %err, "failed to persist cancelled contract");
            }
        }
    }

    /// Validates and spawns a streamed edit. The edited text becomes a brand
    /// new contract row on completion; the original row is never touched.
    pub async fn start_edit(
        &self,
        contract: Contract,
        edit_prompt: &str,
    ) -> Result<EditStream, GeneratorError> {
        let edit_prompt = edit_prompt.trim();
        if edit_prompt.is_empty() {
            return Err(GeneratorError::Validation(
                "Edit prompt is required".to_string(),
            ));
        }
        let Some(document) = contract
            .content
            .clone()
            .filter(|content| !content.trim().is_empty())
        else {
            return Err(GeneratorError::Validation(
                "Contract has no content to edit".to_string(),
            ));
        };

        let edit_id = CancellationRegistry::edit_key(contract.id);
        let token = self.registry.register(&edit_id);
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        let service = self.clone();
        let key = edit_id.clone();
        let instruction = edit_prompt.to_string();
        tokio::spawn(async move {
            service
                .run_edit(contract, document, instruction, key, token, tx)
                .await;
        });

        Ok(EditStream {
            edit_id,
            events: rx,
        })
    }

    async fn run_edit(
        self,
        contract: Contract,
        document: String,
        instruction: String,
        edit_id: String,
        token: CancellationToken,
        tx: mpsc::Sender<SseEvent>,
    ) {
        let mut buffer = String::new();
        match self
            .drive_edit(&contract, &document, &instruction, &edit_id, &token, &tx, &mut buffer)
            .await
        {
            Ok(Exit::Completed) => {
                tracing::info!(contract_id = %contract.id, edit_id = %edit_id, "contract edit completed");
            }
            Ok(Exit::Cancelled) => {
                tracing::info!(contract_id = %contract.id, edit_id = %edit_id, "contract edit cancelled");
            }
            Ok(Exit::Disconnected) => {
                tracing::info!(contract_id = %contract.id, edit_id = %edit_id, "client disconnected, edit stopped");
            }
            Err(err) => {
                tracing::error!(contract_id = %contract.id, edit_id = %edit_id, error = %err, "contract edit failed");
                self.preserve_partial_edit(&contract, &buffer).await;
                send(&tx, SseEvent::named("error", err.to_string())).await;
            }
        }
        self.registry.remove(&edit_id);
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive_edit(
        &self,
        contract: &Contract,
        document: &str,
        instruction: &str,
        edit_id: &str,
        token: &CancellationToken,
        tx: &mpsc::Sender<SseEvent>,
        buffer: &mut String,
    ) -> Result<Exit, GeneratorError> {
        let started = serde_json::json!({ "edit_id": edit_id }).to_string();
        if !send(tx, SseEvent::named("edit_started", started)).await {
            return Ok(Exit::Disconnected);
        }

        let mut chunks = self.provider.edit(document, instruction).await?;
        while let Some(chunk) = chunks.next().await {
            if token.is_cancelled() {
                self.preserve_partial_edit(contract, buffer).await;
                send(tx, SseEvent::named("cancelled", "Edit cancelled by user")).await;
                return Ok(Exit::Cancelled);
            }
            if tx.is_closed() {
                self.preserve_partial_edit(contract, buffer).await;
                return Ok(Exit::Disconnected);
            }

            buffer.push_str(&chunk);
            send(tx, SseEvent::message(chunk)).await;
        }

        let Some(version) =
            Contract::create_version(&self.db.pool, contract.id, buffer, contract.user_id).await?
        else {
            return Err(GeneratorError::Validation(
                "Original contract no longer exists".to_string(),
            ));
        };

        let completed = serde_json::json!({ "new_contract_id": version.id }).to_string();
        send(tx, SseEvent::named("edit_complete", completed)).await;
        Ok(Exit::Completed)
    }

    /// A cancelled or interrupted edit keeps its partial output as a new
    /// cancelled row so the work is inspectable; the original stays pristine.
    async fn preserve_partial_edit(&self, contract: &Contract, buffer: &str) {
        if buffer.is_empty() {
            return;
        }
        match Contract::create_version_as(
            &self.db.pool,
            contract.id,
            buffer,
            contract.user_id,
            ContractStatus::Cancelled,
        )
        .await
        {
            Ok(Some(version)) => {
                tracing::info!(
                    contract_id = %contract.id,
                    version_id = %version.id,
                    "partial edit preserved as cancelled version"
                );
            }
            Ok(None) => {
                tracing::warn!(contract_id = %contract.id, "original contract vanished during edit");
            }
            Err(err) => {
                tracing::error!(contract_id = %contract.id, error = %err, "failed to preserve partial edit");
            }
        }
    }

    /// Signals every active operation for the contract; returns how many were
    /// signalled. A zero count means "nothing active", which `/stop` maps to
    /// 404 rather than an error.
    pub fn stop(&self, contract_id: Uuid) -> usize {
        self.registry.cancel_for_contract(contract_id)
    }

    pub async fn suggestions_for(&self, contract: &Contract) -> Result<Vec<String>, GeneratorError> {
        let Some(document) = contract
            .content
            .as_deref()
            .filter(|content| !content.trim().is_empty())
        else {
            return Err(GeneratorError::Validation(
                "Contract has no content to analyze".to_string(),
            ));
        };
        Ok(self.provider.suggest_edits(document).await?)
    }

    async fn emit_fragment(
        &self,
        tx: &mpsc::Sender<SseEvent>,
        buffer: &mut String,
        fragment: String,
    ) {
        buffer.push_str(&fragment);
        send(tx, SseEvent::message(fragment)).await;
    }
}

/// Returns `false` when the client is gone; callers treat that as a liveness
/// signal rather than an error.
async fn send(tx: &mpsc::Sender<SseEvent>, event: SseEvent) -> bool {
    tx.send(event).await.is_ok()
}
