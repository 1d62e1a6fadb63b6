//! Network policy for the `http` capability (§4.4): scheme/port rules,
//! private-IP denial, and a pluggable DNS resolver so the ACL sees the same
//! addresses the request will actually connect to.

mod acl;
mod dns;
mod private_ranges;

use http::{Method, Uri};

pub use acl::{AclPolicy, AclPolicyBuilder};
pub use acl::{Action as AclAction, HostMatch as AclHostMatch, PortRange as AclPortRange, Rule as AclRule, Scheme as AclScheme};
pub use dns::{DnsResolver, TokioDnsResolver};
pub(crate) use private_ranges::is_private_ip;

#[derive(Debug, Clone)]
pub struct HttpMeta {
    pub method: Method,
    pub uri: Uri,
}

#[async_trait::async_trait]
pub trait NetworkPolicy: Send + Sync + 'static {
    async fn check_http(&self, meta: &HttpMeta) -> core::result::Result<(), String>;
}

/// Permits every request. Used in tests and for deployments that haven't
/// configured an ACL.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllPolicy;

#[async_trait::async_trait]
impl NetworkPolicy for AllowAllPolicy {
    async fn check_http(&self, _meta: &HttpMeta) -> core::result::Result<(), String> {
        Ok(())
    }
}
