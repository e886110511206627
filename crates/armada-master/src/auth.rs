// Authorization boundary
//
// Backends are out of scope; the master only consults this interface
// before mutating the registry. Denial produces a protocol error and
// no state change.

use async_trait::async_trait;

use armada_types::FrameworkInfo;

/// Decides whether a framework may register with its declared
/// principal and role.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize_framework(&self, info: &FrameworkInfo) -> bool;
}

/// Allows everything; the default when no authorizer is configured.
#[derive(Default)]
pub struct PermissiveAuthorizer;

#[async_trait]
impl Authorizer for PermissiveAuthorizer {
    async fn authorize_framework(&self, _info: &FrameworkInfo) -> bool {
        true
    }
}
