//! Engine State
//!
//! Owns storage, configuration, the session store and the engines, and
//! exposes the UI intents that span more than one engine.

use std::sync::Arc;

use forgeflow_core::AgentStream;
use tokio::sync::RwLock;
use tracing::info;

use crate::models::settings::{ConfigUpdate, EngineConfig};
use crate::models::workflow::{NewWorkflow, PauseBehavior, StepType, Workflow, WorkflowStep};
use crate::services::clarification::{ClarificationEngine, ClarificationSnapshot};
use crate::services::conversation::{AgentSummarizer, ConversationEngine, Summarizer};
use crate::services::pipeline::PipelineEngine;
use crate::session_store::{SessionState, SessionStore};
use crate::storage::{ConfigService, Database};
use crate::utils::error::{AppError, AppResult};

/// Everything the UI talks to.
pub struct EngineState {
    database: Arc<Database>,
    config: RwLock<ConfigService>,
    store: Arc<SessionStore>,
    pipeline: Arc<PipelineEngine>,
    clarification: Arc<ClarificationEngine>,
    conversations: Arc<ConversationEngine>,
}

impl EngineState {
    /// Open the on-disk database and config under `~/.forgeflow`.
    pub fn new(agent: Arc<dyn AgentStream>) -> AppResult<Self> {
        let database = Database::new()?;
        let config = ConfigService::new()?;
        Ok(Self::open(database, config, agent))
    }

    /// Wire the engines over existing storage, summarizing through the agent.
    pub fn open(database: Database, config: ConfigService, agent: Arc<dyn AgentStream>) -> Self {
        let summarizer = Arc::new(AgentSummarizer::new(agent.clone()));
        Self::with_summarizer(database, config, agent, summarizer)
    }

    pub fn with_summarizer(
        database: Database,
        config: ConfigService,
        agent: Arc<dyn AgentStream>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        let database = Arc::new(database);
        let store = Arc::new(SessionStore::new());
        let engine_config = config.get_config_clone();

        let pipeline = Arc::new(PipelineEngine::new(database.clone()));
        let clarification = Arc::new(ClarificationEngine::new(
            pipeline.clone(),
            agent.clone(),
            store.clone(),
            engine_config.clarification.max_questions as usize,
        ));
        let conversations = Arc::new(ConversationEngine::new(
            database.clone(),
            agent,
            summarizer,
            store.clone(),
            engine_config,
        ));

        info!("[Engine] Initialized with config {}", config.path().display());
        Self {
            database,
            config: RwLock::new(config),
            store,
            pipeline,
            clarification,
            conversations,
        }
    }

    pub fn pipeline(&self) -> &Arc<PipelineEngine> {
        &self.pipeline
    }

    pub fn clarification(&self) -> &Arc<ClarificationEngine> {
        &self.clarification
    }

    pub fn conversations(&self) -> &Arc<ConversationEngine> {
        &self.conversations
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub async fn session_state(&self) -> SessionState {
        self.store.snapshot().await
    }

    /// Create a workflow, falling back to the configured pause behavior.
    pub async fn create_workflow(
        &self,
        project_id: i64,
        feature_request: &str,
        pause_behavior: Option<PauseBehavior>,
        skip_clarification: bool,
        clarification_agent_id: Option<String>,
    ) -> AppResult<(Workflow, Vec<WorkflowStep>)> {
        let pause_behavior = match pause_behavior {
            Some(behavior) => behavior,
            None => self.config.read().await.get_config().default_pause_behavior,
        };
        self.pipeline.create_workflow(NewWorkflow {
            project_id,
            feature_request: feature_request.to_string(),
            pause_behavior,
            skip_clarification,
            clarification_agent_id,
        })
    }

    /// Expand a step (or collapse with `None`). Expanding a clarification
    /// step returns its snapshot.
    pub async fn expand_step(&self, step_id: Option<i64>) -> AppResult<Option<ClarificationSnapshot>> {
        let Some(step_id) = step_id else {
            self.store.set_expanded_step(None).await;
            return Ok(None);
        };

        let step = self.pipeline.get_step(step_id)?;
        self.store.set_expanded_step(Some(step_id)).await;
        if step.step_type != StepType::Clarification {
            return Ok(None);
        }
        self.clarification.snapshot(step_id).await.map(Some)
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    pub async fn get_config(&self) -> EngineConfig {
        self.config.read().await.get_config_clone()
    }

    /// Persist a partial update and hand the result to the engines.
    pub async fn update_config(&self, update: ConfigUpdate) -> AppResult<EngineConfig> {
        let config = self.config.write().await.update_config(update)?;
        self.apply_config(&config).await;
        Ok(config)
    }

    pub async fn reload_config(&self) -> AppResult<EngineConfig> {
        let config = {
            let mut service = self.config.write().await;
            service.reload()?;
            service.get_config_clone()
        };
        self.apply_config(&config).await;
        Ok(config)
    }

    async fn apply_config(&self, config: &EngineConfig) {
        self.clarification
            .set_max_questions(config.clarification.max_questions as usize);
        self.conversations.set_config(config.clone()).await;
    }

    // ========================================================================
    // Health
    // ========================================================================

    pub fn is_database_healthy(&self) -> bool {
        self.database.is_healthy()
    }

    pub fn is_config_healthy(&self) -> bool {
        self.config
            .try_read()
            .map(|config| config.is_healthy())
            .unwrap_or(false)
    }

    /// Fail fast when either store is unusable.
    pub fn ensure_healthy(&self) -> AppResult<()> {
        if !self.is_database_healthy() {
            return Err(AppError::unavailable("Database is not reachable"));
        }
        if !self.is_config_healthy() {
            return Err(AppError::config("Configuration is missing or invalid"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineState")
            .field("database", &self.database)
            .finish()
    }
}
