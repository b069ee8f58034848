// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;

use tessera::catalog::InMemoryCatalog;
use tessera::core_types::command::{Command, ElementSymbol, Expression, GroupSymbol, MetadataId, Query};
use tessera::core_types::{
    AuditContext, AuthAction, EngineResult, EntitlementService, LogonResult, SessionId, Value, VdbRef,
};
use tessera::dispatch::{ConnectorRegistry, MemoryConnector};
use tessera::entitlement::RoleEntitlements;
use tessera::resolver::StaticResolver;
use tessera::session::{Credentials, PasswordAuthenticator};
use tessera::{Engine, EngineConfig};

pub const VDB: &str = "sales";
pub const SINGLE_MODEL_SQL: &str = "SELECT * FROM modelA.t1";
pub const JOIN_SQL: &str = "SELECT * FROM modelA.t1, modelB.t2";

pub struct Fixture {
    pub engine: Arc<Engine>,
    pub catalog: Arc<InMemoryCatalog>,
    pub entitlements: Arc<RoleEntitlements>,
    pub pg: Arc<MemoryConnector>,
    pub mongo: Arc<MemoryConnector>,
    pub gate: Arc<EntitlementGate>,
}

/// Entitlement service that can hold a check open after it has been
/// answered, until the test releases it.
#[derive(Default)]
pub struct EntitlementGate {
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl EntitlementGate {
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Waits until a check is being held.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.release.notify_one();
    }
}

struct GatedEntitlements {
    inner: Arc<RoleEntitlements>,
    gate: Arc<EntitlementGate>,
}

#[async_trait]
impl EntitlementService for GatedEntitlements {
    async fn inaccessible(
        &self,
        session: SessionId,
        action: AuthAction,
        resources: &BTreeSet<String>,
        context: AuditContext,
    ) -> EngineResult<BTreeSet<String>> {
        let answer = self.inner.inaccessible(session, action, resources, context).await;
        if self.gate.armed.load(Ordering::SeqCst) {
            self.gate.entered.notify_one();
            self.gate.release.notified().await;
        }
        answer
    }
}

fn group(name: &str) -> GroupSymbol {
    GroupSymbol::new(name, MetadataId::catalog(name))
}

fn element(name: &str) -> Expression {
    Expression::element(ElementSymbol::new(name, MetadataId::catalog(name)))
}

pub fn vdb() -> VdbRef {
    VdbRef::new(VDB, 1)
}

/// Two models on two connectors: `modelA.t1(e1)` on `pg` and
/// `modelB.t2(e2)` on `mongo`. Users `alice` and `bob`, both with password
/// `secret`. Role `analyst` may read both models.
pub fn fixture(config: EngineConfig, mongo: MemoryConnector) -> Fixture {
    let catalog = Arc::new(InMemoryCatalog::new());
    catalog.add_model("modelA", "pg");
    catalog.add_model("modelB", "mongo");
    let t1 = catalog.add_group("modelA", "t1").unwrap();
    catalog.add_element(&t1, "e1").unwrap();
    let t2 = catalog.add_group("modelB", "t2").unwrap();
    catalog.add_element(&t2, "e2").unwrap();

    let authenticator = Arc::new(PasswordAuthenticator::new());
    authenticator.add_user("alice", "secret").unwrap();
    authenticator.add_user("bob", "secret").unwrap();
    authenticator.deploy_vdb(VDB, 1);

    let resolver = Arc::new(StaticResolver::new());
    resolver.register(
        VDB,
        SINGLE_MODEL_SQL,
        Command::Query(Query::new(vec![element("modelA.t1.e1")], vec![group("modelA.t1")])),
    );
    resolver.register(
        VDB,
        JOIN_SQL,
        Command::Query(Query::new(
            vec![element("modelA.t1.e1"), element("modelB.t2.e2")],
            vec![group("modelA.t1"), group("modelB.t2")],
        )),
    );

    let entitlements = Arc::new(RoleEntitlements::new());
    entitlements.grant("analyst", AuthAction::Read, "modelA");
    entitlements.grant("analyst", AuthAction::Read, "modelB");
    entitlements.grant("reader_a", AuthAction::Read, "modelA");

    let pg = Arc::new(MemoryConnector::new("pg"));
    pg.set_rows("modelA.t1", (1..=3).map(|i| vec![Value::Int(i)]).collect());
    let mongo = Arc::new(mongo);
    mongo.set_rows("modelB.t2", vec![vec![Value::Text("x".into())]]);

    let gate = Arc::new(EntitlementGate::default());
    let gated = Arc::new(GatedEntitlements {
        inner: entitlements.clone(),
        gate: gate.clone(),
    });

    let mut connectors = ConnectorRegistry::new();
    connectors.register(pg.clone());
    connectors.register(mongo.clone());

    let engine = Engine::builder(config)
        .authenticator(authenticator)
        .resolver(resolver)
        .metadata(catalog.clone())
        .entitlements(gated)
        .connectors(connectors)
        .session_listener(entitlements.clone())
        .build()
        .unwrap();

    Fixture {
        engine: Arc::new(engine),
        catalog,
        entitlements,
        pg,
        mongo,
        gate,
    }
}

impl Fixture {
    pub fn standard() -> Self {
        fixture(EngineConfig::default(), MemoryConnector::new("mongo"))
    }

    /// Logs `user` on and assigns it `role`.
    pub async fn logon_as(&self, user: &str, role: &str) -> LogonResult {
        let logon = self
            .engine
            .logon(Credentials::new(user, "secret", VDB))
            .await
            .unwrap();
        self.entitlements.assign(logon.session_id(), role);
        logon
    }
}
