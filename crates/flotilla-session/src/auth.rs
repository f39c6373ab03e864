use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalKind {
    Agent,
    PodRuntime,
}

/// The authenticated peer behind a session, resolved once at identity
/// binding time.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: String,
    pub kind: PrincipalKind,
    pub admin: bool,
}

/// Seam to the external auth provider. Consulted exactly once per session,
/// when the identity claim arrives; heartbeats and scheduling never touch
/// it.
#[async_trait]
pub trait TokenVerifier: Send + Sync + 'static {
    async fn verify(
        &self,
        token: Option<&str>,
        kind: PrincipalKind,
    ) -> Result<Principal, String>;
}

/// Accepts every connection as an anonymous, non-admin principal. Default
/// for tests and single-user deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousVerifier;

#[async_trait]
impl TokenVerifier for AnonymousVerifier {
    async fn verify(
        &self,
        _token: Option<&str>,
        kind: PrincipalKind,
    ) -> Result<Principal, String> {
        Ok(Principal { id: "anonymous".into(), kind, admin: false })
    }
}
