// SPDX-License-Identifier: Apache-2.0

//! Engine facade
//!
//! Wires the session service, validators, planner and dispatch core together
//! and exposes the client operations. The transport server routes every
//! decoded [`ClientMessage`] through [`Engine::handle`].

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use tessera_core::envelope::RequestMessage;
use tessera_core::{
    EngineError, EngineResult, EntitlementService, LogonResult, MetadataService, RequestId,
    Resolver, SessionToken, TransactionService,
};

use crate::config::EngineConfig;
use crate::dispatch::{ConnectorRegistry, DispatchCore, ModelPlanner, Planner, RequestResults, WarningSink};
use crate::session::{Authenticator, Credentials, SessionListener, SessionService};
use crate::transaction::TransactionRegistry;
use crate::transport::protocol::{ClientMessage, ServerMessage};
use crate::transport::server::{ServerHandle, TransportServer};
use crate::transport::tls;
use crate::validator::{AuthorizationValidator, ExemptProcedures, VisibilityValidator};

pub struct EngineBuilder {
    config: EngineConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
    resolver: Option<Arc<dyn Resolver>>,
    metadata: Option<Arc<dyn MetadataService>>,
    entitlements: Option<Arc<dyn EntitlementService>>,
    connectors: ConnectorRegistry,
    planner: Option<Arc<dyn Planner>>,
    transactions: Option<Arc<dyn TransactionService>>,
    exempt_procedures: Option<Arc<ExemptProcedures>>,
    listeners: Vec<Arc<dyn SessionListener>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            authenticator: None,
            resolver: None,
            metadata: None,
            entitlements: None,
            connectors: ConnectorRegistry::new(),
            planner: None,
            transactions: None,
            exempt_procedures: None,
            listeners: Vec::new(),
        }
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn metadata(mut self, metadata: Arc<dyn MetadataService>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn entitlements(mut self, entitlements: Arc<dyn EntitlementService>) -> Self {
        self.entitlements = Some(entitlements);
        self
    }

    pub fn connectors(mut self, connectors: ConnectorRegistry) -> Self {
        self.connectors = connectors;
        self
    }

    /// Replaces the default [`ModelPlanner`].
    pub fn planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// Replaces the built-in [`TransactionRegistry`].
    pub fn transactions(mut self, transactions: Arc<dyn TransactionService>) -> Self {
        self.transactions = Some(transactions);
        self
    }

    pub fn exempt_procedures(mut self, exempt: Arc<ExemptProcedures>) -> Self {
        self.exempt_procedures = Some(exempt);
        self
    }

    /// Extra collaborator told about every invalidated session.
    pub fn session_listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> EngineResult<Engine> {
        self.config.validate()?;
        let missing = |what: &str| EngineError::invalid_argument(format!("engine requires {what}"));
        let authenticator = self.authenticator.ok_or_else(|| missing("an authenticator"))?;
        let resolver = self.resolver.ok_or_else(|| missing("a resolver"))?;
        let metadata = self.metadata.ok_or_else(|| missing("a metadata service"))?;
        let entitlements = self.entitlements.ok_or_else(|| missing("an entitlement service"))?;

        let sessions = Arc::new(SessionService::new(
            authenticator,
            self.config.session.clone(),
            self.config.cluster_name.clone(),
            self.config.product_name.clone(),
            self.config.node_id,
        ));
        let dispatch = Arc::new(DispatchCore::new(self.connectors, self.config.dispatch.clone()));
        sessions.add_listener(dispatch.clone());

        let transactions = match self.transactions {
            Some(transactions) => transactions,
            None => {
                let registry = Arc::new(TransactionRegistry::new());
                sessions.add_listener(registry.clone());
                registry as Arc<dyn TransactionService>
            }
        };
        for listener in self.listeners {
            sessions.add_listener(listener);
        }

        let exempt = self
            .exempt_procedures
            .unwrap_or_else(|| Arc::new(ExemptProcedures::with_defaults()));
        let planner = self
            .planner
            .unwrap_or_else(|| Arc::new(ModelPlanner::new(metadata.clone())));

        info!(
            cluster = %self.config.cluster_name,
            node = self.config.node_id,
            connectors = dispatch.registry().len(),
            "Engine assembled"
        );

        Ok(Engine {
            authorization: AuthorizationValidator::new(metadata.clone(), entitlements, exempt),
            visibility: VisibilityValidator::new(metadata),
            config: self.config,
            sessions,
            resolver,
            planner,
            transactions,
            dispatch,
        })
    }
}

pub struct Engine {
    config: EngineConfig,
    sessions: Arc<SessionService>,
    resolver: Arc<dyn Resolver>,
    authorization: AuthorizationValidator,
    visibility: VisibilityValidator,
    planner: Arc<dyn Planner>,
    transactions: Arc<dyn TransactionService>,
    dispatch: Arc<DispatchCore>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionService> {
        &self.sessions
    }

    pub fn dispatch(&self) -> &Arc<DispatchCore> {
        &self.dispatch
    }

    pub fn authorization(&self) -> &AuthorizationValidator {
        &self.authorization
    }

    pub async fn logon(&self, credentials: Credentials) -> EngineResult<LogonResult> {
        self.sessions.logon(credentials).await
    }

    pub async fn ping(&self, token: &SessionToken) -> EngineResult<()> {
        self.sessions.ping(token).await
    }

    pub async fn logoff(&self, token: &SessionToken) -> EngineResult<()> {
        self.sessions.logoff(token).await
    }

    /// Resolves, validates, plans and dispatches one client request.
    ///
    /// Validation failures abort before any atomic request is created.
    #[instrument(skip_all, fields(session = %token.session_id, execution = request.execution_id))]
    pub async fn execute(
        &self,
        token: &SessionToken,
        request: RequestMessage,
        warnings: Option<WarningSink>,
    ) -> EngineResult<RequestResults> {
        let session = self.sessions.session_info(token).await?;
        let request_id = RequestId::new(session.session_id, request.execution_id);

        let command = self.resolver.resolve(&request.sql, &session.vdb)?;
        self.authorization.validate(&command, session.session_id).await?;
        self.visibility.validate(&command, &session.vdb)?;

        let fragments = self.planner.plan(&command, &session.vdb)?;
        let transaction = self.transactions.current(session.session_id);
        debug!(request = %request_id, fragments = fragments.len(), "Request planned");

        let prepared = self.dispatch.prepare(request_id, &request, fragments, transaction)?;
        // A logoff that raced validation either fails this check or finds the
        // registered request and cancels it.
        if let Err(e) = self.sessions.session_info(token).await {
            self.dispatch.abandon(prepared);
            return Err(e);
        }
        self.dispatch.run(prepared, &request, warnings).await
    }

    /// Cancels one request of the caller's session.
    pub async fn cancel_request(&self, token: &SessionToken, execution_id: u64) -> EngineResult<bool> {
        let session = self.sessions.session_info(token).await?;
        Ok(self
            .dispatch
            .cancel_request(&RequestId::new(session.session_id, execution_id))
            .await)
    }

    /// Cancels every outstanding request of the caller's session; the
    /// session itself stays valid.
    pub async fn cancel_session_queries(&self, token: &SessionToken) -> EngineResult<usize> {
        let session = self.sessions.session_info(token).await?;
        Ok(self.dispatch.cancel_queries(session.session_id).await)
    }

    pub async fn close_request(&self, token: &SessionToken, execution_id: u64) -> EngineResult<bool> {
        let session = self.sessions.session_info(token).await?;
        Ok(self
            .dispatch
            .close_request(&RequestId::new(session.session_id, execution_id))
            .await)
    }

    /// Routes one protocol message to the matching operation.
    pub async fn handle(
        &self,
        message: ClientMessage,
        warnings: Option<WarningSink>,
    ) -> EngineResult<ServerMessage> {
        match message {
            ClientMessage::Logon { credentials } => {
                self.logon(credentials).await.map(ServerMessage::LogonResult)
            }
            ClientMessage::Ping { token } => self.ping(&token).await.map(|_| ServerMessage::Ack),
            ClientMessage::Logoff { token } => self.logoff(&token).await.map(|_| ServerMessage::Ack),
            ClientMessage::Execute { token, request } => self
                .execute(&token, request, warnings)
                .await
                .map(ServerMessage::Results),
            ClientMessage::CancelRequest { token, execution_id } => self
                .cancel_request(&token, execution_id)
                .await
                .map(|found| ServerMessage::Cancelled {
                    count: usize::from(found),
                }),
            ClientMessage::CancelSessionQueries { token } => self
                .cancel_session_queries(&token)
                .await
                .map(|count| ServerMessage::Cancelled { count }),
            ClientMessage::CloseRequest { token, execution_id } => self
                .close_request(&token, execution_id)
                .await
                .map(|released| ServerMessage::Closed { released }),
        }
    }

    /// Starts the session reaper.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        self.sessions.spawn_reaper()
    }

    /// Binds the transport listener from the engine's configuration,
    /// building the TLS engine when enabled.
    pub async fn serve(self: &Arc<Self>) -> EngineResult<ServerHandle> {
        let acceptor = if self.config.transport.use_tls {
            let props = tls::merge_platform_properties(&self.config.tls_properties, |key| {
                std::env::var(key).ok()
            });
            let material = tls::resolve_tls_material(&props, self.config.resource_dir.as_deref())?;
            Some(tls::build_server_engine(&material)?)
        } else {
            None
        };
        TransportServer::new(Arc::clone(self), self.config.transport.clone(), acceptor)
            .bind()
            .await
    }

    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }
}
