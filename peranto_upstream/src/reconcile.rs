//! Idempotent reconciliation against the upstream identity API
//!
//! Writes to the upstream are reconciliations, not blind mutations: a
//! creation first looks the resource up by its natural key, and role
//! assignment computes the delta against the upstream's current state
//! before touching anything. Replaying a reconciliation therefore
//! converges instead of duplicating.

use std::collections::HashSet;

use aliri_clock::Clock;
use peranto::{RoleId, UserId};
use serde_json::Value;

use crate::{
    client::ResilientClient,
    error::UpstreamError,
    transport::UpstreamRequest,
};

/// The kinds of upstream resource that can be reconciled by natural key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    /// A user, keyed by email address
    User,
    /// A role, keyed by its name
    Role,
}

impl ResourceKind {
    fn noun(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Role => "role",
        }
    }

    fn id_field(self) -> &'static str {
        match self {
            Self::User => "user_id",
            Self::Role => "id",
        }
    }

    fn create_path(self) -> &'static str {
        match self {
            Self::User => "api/v2/users",
            Self::Role => "api/v2/roles",
        }
    }

    fn lookup(self, key: &str) -> UpstreamRequest {
        match self {
            Self::User => {
                UpstreamRequest::get("api/v2/users-by-email").with_query("email", key)
            }
            Self::Role => UpstreamRequest::get("api/v2/roles").with_query("name_filter", key),
        }
    }

    /// Finds the entry exactly matching `key` in a lookup response
    ///
    /// The role listing endpoint filters by substring, so an exact match
    /// on the name is applied client-side.
    fn find_existing<'a>(self, key: &str, body: &'a Value) -> Option<&'a Value> {
        let candidates = match self {
            Self::User => body.as_array()?.iter().collect::<Vec<_>>(),
            Self::Role => body
                .get("roles")
                .or(Some(body))
                .and_then(Value::as_array)?
                .iter()
                .filter(|role| role.get("name").and_then(Value::as_str) == Some(key))
                .collect(),
        };
        candidates.into_iter().next()
    }
}

/// What to do when the resource to create already exists
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExistingPolicy {
    /// Treat the existing resource as the outcome
    Return,
    /// Report a conflict carrying the existing resource's identifier
    Conflict,
}

/// The outcome of a create-by-key reconciliation
#[derive(Clone, Debug)]
pub struct Reconciled {
    /// The resource as the upstream holds it
    pub resource: Value,
    /// The upstream identifier of the resource
    pub id: String,
    /// Whether this call created the resource
    pub created: bool,
}

/// The direction of a role-set reconciliation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetOp {
    /// Ensure the requested roles are assigned
    Add,
    /// Ensure the requested roles are not assigned
    Remove,
}

/// The outcome of a role-set reconciliation
#[derive(Clone, Debug)]
pub struct RoleReconciliation {
    /// How many roles the caller asked about
    pub requested: usize,
    /// How many roles actually changed upstream
    pub changed: usize,
    /// How many roles were already in the requested state
    pub already_satisfied: usize,
    /// The roles assigned to the user after reconciliation
    pub assigned: Vec<RoleId>,
}

/// Reconciles resources and role assignments against the upstream
#[derive(Debug)]
pub struct ReconciliationEngine<'a, C> {
    client: &'a ResilientClient<C>,
}

impl<'a, C: Clock> ReconciliationEngine<'a, C> {
    /// Constructs an engine issuing its calls through `client`
    pub fn new(client: &'a ResilientClient<C>) -> Self {
        Self { client }
    }

    /// Creates a resource unless one already exists under its natural key
    ///
    /// The existing resource is either returned or reported as a conflict,
    /// according to `policy`. The upstream lookup and creation are not
    /// atomic; a concurrent creation between the two steps can still
    /// surface as an upstream rejection.
    pub async fn create_by_key(
        &self,
        kind: ResourceKind,
        key: &str,
        payload: Value,
        policy: ExistingPolicy,
    ) -> Result<Reconciled, UpstreamError> {
        let lookup = self.client.call(kind.lookup(key)).await?;

        if let Some(existing) = kind.find_existing(key, &lookup.body) {
            let id = extract_id(kind, existing)?;
            return match policy {
                ExistingPolicy::Return => {
                    tracing::debug!(
                        resource = kind.noun(),
                        resource.id = %id,
                        "resource already exists, returning it"
                    );
                    Ok(Reconciled {
                        resource: existing.clone(),
                        id,
                        created: false,
                    })
                }
                ExistingPolicy::Conflict => Err(UpstreamError::Conflict {
                    resource: kind.noun(),
                    existing_id: id,
                }),
            };
        }

        let created = self
            .client
            .call(UpstreamRequest::post(kind.create_path(), payload))
            .await?;
        let id = extract_id(kind, &created.body)?;
        tracing::info!(resource = kind.noun(), resource.id = %id, "created upstream resource");

        Ok(Reconciled {
            resource: created.body,
            id,
            created: true,
        })
    }

    /// Brings a user's role assignments into the requested state
    ///
    /// Fetches the user's current roles, computes which of the requested
    /// roles actually need to change, and mutates only that delta in a
    /// single upstream call. When nothing needs to change, no mutation is
    /// issued at all.
    pub async fn reconcile_roles(
        &self,
        user_id: &UserId,
        requested: &[RoleId],
        op: SetOp,
    ) -> Result<RoleReconciliation, UpstreamError> {
        let roles_path = format!("api/v2/users/{}/roles", user_id);
        let current = self.fetch_assigned_roles(&roles_path).await?;

        let delta: Vec<&RoleId> = match op {
            SetOp::Add => requested
                .iter()
                .filter(|role| !current.contains(*role))
                .collect(),
            SetOp::Remove => requested
                .iter()
                .filter(|role| current.contains(*role))
                .collect(),
        };

        if delta.is_empty() {
            tracing::debug!(
                user.id = %user_id,
                requested = requested.len(),
                "role assignments already satisfied, nothing to do"
            );
            return Ok(RoleReconciliation {
                requested: requested.len(),
                changed: 0,
                already_satisfied: requested.len(),
                assigned: current.into_iter().collect(),
            });
        }

        let body = serde_json::json!({
            "roles": delta.iter().map(|role| role.as_str()).collect::<Vec<_>>(),
        });
        let request = match op {
            SetOp::Add => UpstreamRequest::post(roles_path.clone(), body),
            SetOp::Remove => UpstreamRequest::delete(roles_path.clone()).with_body(body),
        };
        self.client.call(request).await?;

        tracing::info!(
            user.id = %user_id,
            changed = delta.len(),
            op = ?op,
            "reconciled role assignments"
        );

        let assigned = self.fetch_assigned_roles(&roles_path).await?;
        Ok(RoleReconciliation {
            requested: requested.len(),
            changed: delta.len(),
            already_satisfied: requested.len() - delta.len(),
            assigned: assigned.into_iter().collect(),
        })
    }

    async fn fetch_assigned_roles(&self, path: &str) -> Result<HashSet<RoleId>, UpstreamError> {
        let response = self.client.call(UpstreamRequest::get(path)).await?;
        let roles = response
            .body
            .as_array()
            .ok_or(UpstreamError::Decode("role listing is not an array"))?;
        roles
            .iter()
            .map(|role| {
                role.get("id")
                    .and_then(Value::as_str)
                    .map(RoleId::from)
                    .ok_or(UpstreamError::Decode("role entry has no id"))
            })
            .collect()
    }
}

fn extract_id(kind: ResourceKind, resource: &Value) -> Result<String, UpstreamError> {
    resource
        .get(kind.id_field())
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or(UpstreamError::Decode("resource has no identifier"))
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use aliri::jwt;
    use aliri_clock::DurationSecs;
    use async_trait::async_trait;
    use http::{Method, StatusCode};
    use peranto::BoxError;

    use super::*;
    use crate::{
        braids::{AccessToken, AccessTokenRef},
        token::{AccessTokenSource, IssuedToken},
        transport::{UpstreamResponse, UpstreamTransport},
    };

    struct StaticTokenSource;

    #[async_trait]
    impl AccessTokenSource for StaticTokenSource {
        async fn request_token(&self) -> Result<IssuedToken, BoxError> {
            Ok(IssuedToken {
                access_token: AccessToken::from_static("static-token"),
                lifetime: DurationSecs(3600),
            })
        }
    }

    type Responder = Box<dyn Fn(&UpstreamRequest) -> UpstreamResponse + Send + Sync>;

    struct RoutedTransport {
        responder: Responder,
        mutations: AtomicUsize,
        log: Mutex<Vec<(Method, String)>>,
    }

    impl RoutedTransport {
        fn new(responder: Responder) -> Self {
            Self {
                responder,
                mutations: AtomicUsize::new(0),
                log: Mutex::new(Vec::new()),
            }
        }

        fn mutations(&self) -> usize {
            self.mutations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl UpstreamTransport for RoutedTransport {
        async fn send(
            &self,
            _bearer: &AccessTokenRef,
            request: &UpstreamRequest,
        ) -> Result<UpstreamResponse, BoxError> {
            if request.method() != Method::GET {
                self.mutations.fetch_add(1, Ordering::SeqCst);
            }
            self.log
                .lock()
                .unwrap()
                .push((request.method().clone(), request.path().to_owned()));
            Ok((self.responder)(request))
        }
    }

    fn ok(body: Value) -> UpstreamResponse {
        UpstreamResponse {
            status: StatusCode::OK,
            body,
            rate_limit_reset: None,
        }
    }

    fn client(transport: Arc<RoutedTransport>) -> ResilientClient {
        ResilientClient::new(
            transport,
            Arc::new(StaticTokenSource),
            jwt::Audience::from_static("https://upstream.example.com/api/v2/"),
        )
    }

    #[tokio::test]
    async fn creating_an_absent_user_posts_and_reports_created() {
        let transport = Arc::new(RoutedTransport::new(Box::new(|request| {
            match (request.method().as_str(), request.path()) {
                ("GET", "api/v2/users-by-email") => ok(serde_json::json!([])),
                ("POST", "api/v2/users") => ok(serde_json::json!({
                    "user_id": "auth0|new-user",
                    "email": "new@example.com",
                })),
                other => panic!("unexpected request: {:?}", other),
            }
        })));
        let client = client(Arc::clone(&transport));
        let engine = ReconciliationEngine::new(&client);

        let outcome = engine
            .create_by_key(
                ResourceKind::User,
                "new@example.com",
                serde_json::json!({ "email": "new@example.com" }),
                ExistingPolicy::Return,
            )
            .await
            .unwrap();

        assert!(outcome.created);
        assert_eq!(outcome.id, "auth0|new-user");
        assert_eq!(transport.mutations(), 1);
    }

    #[tokio::test]
    async fn an_existing_user_is_returned_without_a_mutation() {
        let transport = Arc::new(RoutedTransport::new(Box::new(|request| {
            assert_eq!(request.method(), Method::GET);
            ok(serde_json::json!([
                { "user_id": "auth0|existing", "email": "known@example.com" },
            ]))
        })));
        let client = client(Arc::clone(&transport));
        let engine = ReconciliationEngine::new(&client);

        let outcome = engine
            .create_by_key(
                ResourceKind::User,
                "known@example.com",
                serde_json::json!({ "email": "known@example.com" }),
                ExistingPolicy::Return,
            )
            .await
            .unwrap();

        assert!(!outcome.created);
        assert_eq!(outcome.id, "auth0|existing");
        assert_eq!(transport.mutations(), 0);
    }

    #[tokio::test]
    async fn conflict_policy_reports_the_existing_identifier() {
        let transport = Arc::new(RoutedTransport::new(Box::new(|_| {
            ok(serde_json::json!([
                { "user_id": "auth0|existing", "email": "known@example.com" },
            ]))
        })));
        let client = client(transport);
        let engine = ReconciliationEngine::new(&client);

        let err = engine
            .create_by_key(
                ResourceKind::User,
                "known@example.com",
                serde_json::json!({ "email": "known@example.com" }),
                ExistingPolicy::Conflict,
            )
            .await
            .unwrap_err();

        match err {
            UpstreamError::Conflict {
                resource,
                existing_id,
            } => {
                assert_eq!(resource, "user");
                assert_eq!(existing_id, "auth0|existing");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn replaying_a_role_creation_issues_exactly_one_post() {
        let created = Arc::new(Mutex::new(Vec::<Value>::new()));
        let responder_state = Arc::clone(&created);
        let transport = Arc::new(RoutedTransport::new(Box::new(move |request| {
            match (request.method().as_str(), request.path()) {
                ("GET", "api/v2/roles") => ok(serde_json::json!({
                    "roles": responder_state.lock().unwrap().clone(),
                })),
                ("POST", "api/v2/roles") => {
                    let role = serde_json::json!({ "id": "rol_new", "name": "auditor" });
                    responder_state.lock().unwrap().push(role.clone());
                    ok(role)
                }
                other => panic!("unexpected request: {:?}", other),
            }
        })));
        let client = client(Arc::clone(&transport));
        let engine = ReconciliationEngine::new(&client);
        let payload = serde_json::json!({ "name": "auditor" });

        let first = engine
            .create_by_key(
                ResourceKind::Role,
                "auditor",
                payload.clone(),
                ExistingPolicy::Return,
            )
            .await
            .unwrap();
        let second = engine
            .create_by_key(ResourceKind::Role, "auditor", payload, ExistingPolicy::Return)
            .await
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, "rol_new");
        assert_eq!(second.id, "rol_new");
        assert_eq!(transport.mutations(), 1);
    }

    #[tokio::test]
    async fn role_lookup_applies_an_exact_name_match() {
        let transport = Arc::new(RoutedTransport::new(Box::new(|request| {
            match (request.method().as_str(), request.path()) {
                ("GET", "api/v2/roles") => ok(serde_json::json!({
                    "roles": [
                        { "id": "rol_1", "name": "admin-plus" },
                        { "id": "rol_2", "name": "admin" },
                    ],
                })),
                other => panic!("unexpected request: {:?}", other),
            }
        })));
        let client = client(Arc::clone(&transport));
        let engine = ReconciliationEngine::new(&client);

        let outcome = engine
            .create_by_key(
                ResourceKind::Role,
                "admin",
                serde_json::json!({ "name": "admin" }),
                ExistingPolicy::Return,
            )
            .await
            .unwrap();

        assert!(!outcome.created);
        assert_eq!(outcome.id, "rol_2");
    }

    #[tokio::test]
    async fn adding_roles_mutates_only_the_missing_ones() {
        let transport = Arc::new(RoutedTransport::new(Box::new(|request| {
            match (request.method().as_str(), request.path()) {
                ("GET", "api/v2/users/auth0|u1/roles") => ok(serde_json::json!([
                    { "id": "rol_a", "name": "reader" },
                ])),
                ("POST", "api/v2/users/auth0|u1/roles") => {
                    let roles = request.body().unwrap()["roles"].as_array().unwrap();
                    assert_eq!(roles.len(), 1);
                    assert_eq!(roles[0], "rol_b");
                    ok(Value::Null)
                }
                other => panic!("unexpected request: {:?}", other),
            }
        })));
        let client = client(Arc::clone(&transport));
        let engine = ReconciliationEngine::new(&client);

        let outcome = engine
            .reconcile_roles(
                &UserId::from_static("auth0|u1"),
                &[RoleId::from_static("rol_a"), RoleId::from_static("rol_b")],
                SetOp::Add,
            )
            .await
            .unwrap();

        assert_eq!(outcome.requested, 2);
        assert_eq!(outcome.changed, 1);
        assert_eq!(outcome.already_satisfied, 1);
        assert_eq!(transport.mutations(), 1);
    }

    #[tokio::test]
    async fn an_already_satisfied_assignment_issues_no_mutation() {
        let transport = Arc::new(RoutedTransport::new(Box::new(|request| {
            assert_eq!(request.method(), Method::GET);
            ok(serde_json::json!([
                { "id": "rol_a", "name": "reader" },
                { "id": "rol_b", "name": "writer" },
            ]))
        })));
        let client = client(Arc::clone(&transport));
        let engine = ReconciliationEngine::new(&client);

        let outcome = engine
            .reconcile_roles(
                &UserId::from_static("auth0|u1"),
                &[RoleId::from_static("rol_a"), RoleId::from_static("rol_b")],
                SetOp::Add,
            )
            .await
            .unwrap();

        assert_eq!(outcome.changed, 0);
        assert_eq!(outcome.already_satisfied, 2);
        assert_eq!(transport.mutations(), 0);
    }

    #[tokio::test]
    async fn removal_touches_only_roles_the_user_holds() {
        let transport = Arc::new(RoutedTransport::new(Box::new(|request| {
            match (request.method().as_str(), request.path()) {
                ("GET", "api/v2/users/auth0|u1/roles") => ok(serde_json::json!([
                    { "id": "rol_a", "name": "reader" },
                ])),
                ("DELETE", "api/v2/users/auth0|u1/roles") => {
                    let roles = request.body().unwrap()["roles"].as_array().unwrap();
                    assert_eq!(roles.len(), 1);
                    assert_eq!(roles[0], "rol_a");
                    ok(Value::Null)
                }
                other => panic!("unexpected request: {:?}", other),
            }
        })));
        let client = client(Arc::clone(&transport));
        let engine = ReconciliationEngine::new(&client);

        let outcome = engine
            .reconcile_roles(
                &UserId::from_static("auth0|u1"),
                &[RoleId::from_static("rol_a"), RoleId::from_static("rol_x")],
                SetOp::Remove,
            )
            .await
            .unwrap();

        assert_eq!(outcome.changed, 1);
        assert_eq!(outcome.already_satisfied, 1);
        assert_eq!(transport.mutations(), 1);
    }
}
