//! The definition store: validates author input, rewrites refs to ids,
//! fingerprints structural content, deduplicates via autoversion, and serves
//! reads.
//!
//! The input → storage pipeline is single-pass and deterministic:
//! validate → transform → fingerprint → autoversion → persist.

pub mod draft;
pub mod fingerprint;
pub mod transform;
pub mod validate;

pub use draft::{CreateDefinition, DraftForeach, DraftNode, DraftSync, DraftTransition, DraftWorkflow};

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use weft_domain::definition::{Definition, DefinitionKind, Owner};
use weft_domain::{Error, Result};
use weft_store::Store;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of a create call.
#[derive(Debug, Clone, Serialize)]
pub struct CreateOutcome {
    pub definition: Definition,
    /// True when autoversion matched an existing structurally-identical row.
    pub reused: bool,
    pub version: u32,
    pub latest_version: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Definition store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct DefinitionStore {
    store: Arc<dyn Store>,
}

impl DefinitionStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Run the full pipeline for one authored definition.
    pub async fn create(&self, input: CreateDefinition) -> Result<CreateOutcome> {
        // 1. Validate (pure).
        validate::validate(&input)?;
        let owner = input.owner().ok_or_else(|| {
            Error::validation("project_id/library_id", "an owner is required")
        })?;
        let reference = input.reference().to_string();

        // 2. Transform refs → ids and parse conditions/strategies. The
        //    transformed content is discarded on the reuse path, but
        //    transforming first keeps the pipeline single-pass: a draft
        //    that cannot transform never reaches the store.
        let transformed = transform::transform(&input)?;

        // 3. Fingerprint the structural draft content.
        let content_hash = fingerprint::fingerprint(&input)?;

        // 4. Autoversion.
        let latest = self
            .store
            .max_definition_version(input.kind, &reference, &owner)
            .await?;

        if input.autoversion {
            if let Some(existing) = self
                .store
                .find_definition_by_hash(input.kind, &reference, &owner, &content_hash)
                .await?
            {
                tracing::debug!(
                    reference,
                    version = existing.version,
                    "autoversion matched existing content hash"
                );
                return Ok(CreateOutcome {
                    reused: true,
                    version: existing.version,
                    latest_version: latest.unwrap_or(existing.version),
                    definition: existing,
                });
            }
        } else if let Some(max) = latest {
            let requested = input.version.unwrap_or(1);
            if requested <= max && !input.force {
                return Err(Error::Conflict(format!(
                    "definition '{reference}' version {requested} already exists"
                )));
            }
        }

        let version = if input.autoversion {
            latest.unwrap_or(0) + 1
        } else {
            input.version.unwrap_or(1)
        };

        // The id is stable across versions of one (reference, owner).
        let id = match self
            .store
            .get_definition_by_reference(input.kind, &reference, &owner)
            .await?
        {
            Some(existing) => existing.id,
            None => Uuid::new_v4().to_string(),
        };

        let now = Utc::now();
        let definition = Definition {
            id,
            version,
            kind: input.kind,
            name: input.name.clone(),
            reference,
            description: input.description.clone(),
            project_id: input.project_id.clone(),
            library_id: input.library_id.clone(),
            content: transformed.content,
            content_hash,
            created_at: now,
            updated_at: now,
        };

        // 5. Persist definition + node rows + transition rows in one batch.
        self.store
            .put_definition(&definition, &transformed.nodes, &transformed.transitions)
            .await?;

        tracing::info!(
            id = %definition.id,
            version,
            kind = ?definition.kind,
            reference = %definition.reference,
            "definition stored"
        );

        Ok(CreateOutcome {
            latest_version: version,
            version,
            reused: false,
            definition,
        })
    }

    /// `version = None` returns the latest.
    pub async fn get(&self, id: &str, version: Option<u32>) -> Result<Definition> {
        self.store
            .get_definition(id, version)
            .await?
            .ok_or_else(|| Error::NotFound(format!("definition {id}")))
    }

    pub async fn get_by_reference(
        &self,
        kind: DefinitionKind,
        reference: &str,
        owner: &Owner,
    ) -> Result<Definition> {
        self.store
            .get_definition_by_reference(kind, reference, owner)
            .await?
            .ok_or_else(|| Error::NotFound(format!("definition ref '{reference}'")))
    }

    /// Latest-per-reference listing.
    pub async fn list(
        &self,
        kind: DefinitionKind,
        project_id: Option<&str>,
        library_id: Option<&str>,
    ) -> Result<Vec<Definition>> {
        self.store.list_definitions(kind, project_id, library_id).await
    }
}
