//! `process_document`

use rago_core::{
    CancellationToken, Component, Document, DocumentAction, DocumentRequest, DocumentResponse,
    GenerationRequest, Message, RagoError, RagoResult, SearchFilter, SearchResult,
};
use rago_rag::SearchQuery;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::client::Rago;

/// Tool preferred over the model for `extract`
pub const ENTITY_EXTRACTION_TOOL: &str = "entity_extraction";

fn instruction(action: DocumentAction) -> &'static str {
    match action {
        DocumentAction::Summarize => {
            "Summarize the following document concisely, keeping its key facts."
        }
        DocumentAction::Analyze => {
            "Analyze the following document. Describe its main topics, key points \
             and anything notable about its structure or tone."
        }
        DocumentAction::Extract => {
            "Extract the named entities (people, organizations, locations, dates) from \
             the following text. Answer with a JSON object mapping each entity type to \
             a list of values."
        }
        DocumentAction::Ingest => "",
    }
}

impl Rago {
    /// Ingests, analyzes, summarizes or extracts from a document
    pub async fn process_document(
        &self,
        request: DocumentRequest,
        cancel: &CancellationToken,
    ) -> RagoResult<DocumentResponse> {
        let timeout = request.parameters.timeout_secs.map(Duration::from_secs);
        self.scoped(cancel, timeout, |token| async move {
            let started = Instant::now();
            let action = request.action;
            let mut response = match action {
                DocumentAction::Ingest => self.ingest_document(request, &token).await?,
                DocumentAction::Analyze | DocumentAction::Summarize => {
                    self.generate_from_document(request, &token).await?
                }
                DocumentAction::Extract => self.extract_entities(request, &token).await?,
            };
            response.duration_ms = started.elapsed().as_millis() as u64;
            debug!(action = ?action, duration_ms = response.duration_ms, "Document processed");
            Ok(response)
        })
        .await
    }

    async fn ingest_document(
        &self,
        request: DocumentRequest,
        cancel: &CancellationToken,
    ) -> RagoResult<DocumentResponse> {
        let rag = self.rag_pillar("process_document")?;
        let content = request.content.ok_or_else(|| {
            RagoError::bad_request("ingest needs content").at(Component::Orchestrator, "process_document")
        })?;
        let mut doc = match request.document_id {
            Some(id) => Document::new(id, content),
            None => Document::anonymous(content),
        };
        if let Some(content_type) = request.content_type {
            doc = doc.with_content_type(content_type);
        }
        doc.metadata.extend(request.metadata);

        let result = rag.ingest(doc, request.overwrite, cancel).await?;
        info!(
            document_id = %result.document_id,
            chunks = result.chunk_count,
            replaced = result.replaced,
            "Document ingested"
        );
        Ok(DocumentResponse {
            content: format!(
                "Ingested document '{}' as {} chunks",
                result.document_id, result.chunk_count
            ),
            data: Some(json!({ "replaced": result.replaced })),
            document_id: Some(result.document_id),
            chunk_count: result.chunk_count,
            ..Default::default()
        })
    }

    /// Content of the request, or of the stored document it names
    fn document_text(&self, request: &DocumentRequest) -> RagoResult<String> {
        if let Some(content) = request.content.as_ref().filter(|c| !c.trim().is_empty()) {
            return Ok(content.clone());
        }
        let id = request.document_id.as_deref().ok_or_else(|| {
            RagoError::bad_request("request needs content or a document_id")
                .at(Component::Orchestrator, "process_document")
        })?;
        let stored = self.pillars.rag.as_ref().and_then(|rag| rag.get_document(id));
        stored.map(|doc| doc.content).ok_or_else(|| {
            RagoError::not_found(format!("document '{}' not found", id))
                .at(Component::Orchestrator, "process_document")
        })
    }

    /// Top chunks of a stored document, used as context for the model
    async fn document_context(
        &self,
        request: &DocumentRequest,
        cancel: &CancellationToken,
    ) -> RagoResult<Vec<SearchResult>> {
        let (Some(rag), Some(id)) = (self.pillars.rag.as_ref(), request.document_id.as_deref())
        else {
            return Ok(Vec::new());
        };
        if rag.get_document(id).is_none() {
            return Ok(Vec::new());
        }
        let limit = request
            .parameters
            .rag_limit
            .unwrap_or(self.config.orchestrator.rag_limit);
        let query = SearchQuery::new(instruction(request.action))
            .limit(limit)
            .threshold(0.0)
            .filter(SearchFilter::document(id));
        rag.search(&query, cancel).await
    }

    async fn generate_from_document(
        &self,
        request: DocumentRequest,
        cancel: &CancellationToken,
    ) -> RagoResult<DocumentResponse> {
        let llm = self.llm_pillar("process_document")?;
        let text = self.document_text(&request)?;
        let sources = self.document_context(&request, cancel).await?;

        let mut messages: Vec<Message> = sources
            .iter()
            .map(|s| {
                Message::system(format!(
                    "Relevant excerpt (chunk {}):\n{}",
                    s.chunk_id, s.content
                ))
            })
            .collect();
        messages.push(Message::user(format!(
            "{}\n\n{}",
            instruction(request.action),
            text
        )));
        let mut generation = GenerationRequest::new(messages);
        if let Some(model) = &request.parameters.model {
            generation = generation.with_model(model.clone());
        }
        if let Some(temperature) = request.parameters.temperature {
            generation = generation.with_temperature(temperature);
        }
        if let Some(max_tokens) = request.parameters.max_tokens {
            generation = generation.with_max_tokens(max_tokens);
        }

        let response = llm.generate(&generation, cancel).await?;
        Ok(DocumentResponse {
            document_id: request.document_id,
            content: response.content,
            sources,
            usage: response.usage,
            ..Default::default()
        })
    }

    /// Prefers the `entity_extraction` tool, falling back to the model
    async fn extract_entities(
        &self,
        request: DocumentRequest,
        cancel: &CancellationToken,
    ) -> RagoResult<DocumentResponse> {
        let tool = self
            .pillars
            .tools
            .as_ref()
            .filter(|host| {
                host.get_tool(ENTITY_EXTRACTION_TOOL)
                    .is_some_and(|t| t.enabled)
            });
        let Some(host) = tool else {
            let mut response = self.generate_from_document(request, cancel).await?;
            response.data = serde_json::from_str::<Value>(response.content.trim()).ok();
            return Ok(response);
        };

        let text = self.document_text(&request)?;
        let output = host
            .call_tool(ENTITY_EXTRACTION_TOOL, json!({ "text": text }), None, cancel)
            .await?;
        if output.is_error {
            return Err(RagoError::internal(format!(
                "{} failed: {}",
                ENTITY_EXTRACTION_TOOL,
                output.text()
            ))
            .at(Component::Orchestrator, "process_document"));
        }
        Ok(DocumentResponse {
            document_id: request.document_id,
            content: output.text(),
            data: Some(output.value()),
            ..Default::default()
        })
    }
}
