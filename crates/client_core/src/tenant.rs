use shared::{domain::TenantId, error::SyncError};

/// Ambient inputs a tenant can be derived from. Pure data; building one has
/// no side effects, so resolution stays synchronous and testable.
#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
    /// Tenant pinned to the signed-in session, highest precedence.
    pub session_tenant: Option<String>,
    pub env_tenant: Option<String>,
    /// Host the deployment is served from, e.g. `acme.chat.example.com`.
    pub deployment_host: Option<String>,
}

impl RuntimeContext {
    pub fn from_env() -> Self {
        Self {
            session_tenant: None,
            env_tenant: std::env::var("APP__TENANT_ID").ok(),
            deployment_host: std::env::var("APP__DEPLOYMENT_HOST").ok(),
        }
    }

    pub fn with_session_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.session_tenant = Some(tenant.into());
        self
    }
}

/// Derives the tenant namespace every read/write path is scoped to.
///
/// Precedence: session tenant, then env override, then the first label of
/// the deployment host. Failing to resolve is a configuration error; callers
/// must not fall back to an unscoped path.
pub fn resolve(context: &RuntimeContext) -> Result<TenantId, SyncError> {
    let candidate = context
        .session_tenant
        .clone()
        .or_else(|| context.env_tenant.clone())
        .or_else(|| context.deployment_host.as_deref().and_then(host_tenant));

    let raw = candidate.ok_or_else(|| {
        SyncError::Config("no tenant could be resolved from the runtime context".to_string())
    })?;
    let trimmed = raw.trim();
    if trimmed.is_empty()
        || !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(SyncError::Config(format!(
            "invalid tenant identifier {trimmed:?}"
        )));
    }
    Ok(TenantId::from(trimmed))
}

fn host_tenant(host: &str) -> Option<String> {
    let host = host.split(':').next()?;
    let mut labels = host.split('.');
    let first = labels.next()?;
    // A bare host ("localhost") carries no tenant label.
    labels.next()?;
    if first.is_empty() || first == "www" {
        return None;
    }
    Some(first.to_string())
}
