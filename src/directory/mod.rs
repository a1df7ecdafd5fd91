//! Directory service — transitive group membership resolution.
//!
//! Viewer permissions are directory object ids (users or security groups).
//! [`resolve_identity_tokens`] turns one authenticated principal into the set
//! of ids it can match: its own object id plus every security group it
//! transitively belongs to, drained from the paginated membership API before
//! any authorization decision is made.
//!
//! Resolution runs on every authorized request (it is the dominant latency
//! cost of those routes) and is never cached across requests, so group
//! changes take effect on the next call.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::authz::IdentityTokens;
use crate::config::DirectoryConfig;
use crate::credentials::TokenCache;
use crate::retry::{RetryPolicy, with_retry};
use crate::{Error, Result};

/// One page of transitive group memberships.
#[derive(Debug, Clone)]
pub struct GroupPage {
    /// Group object ids on this page
    pub groups: Vec<String>,
    /// Continuation token for the next page, if any
    pub next_page: Option<String>,
}

/// Paged access to a principal's transitive security-group memberships.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Fetch one page. `page_token` is `None` for the first page and the
    /// previously returned continuation token afterwards.
    async fn member_groups_page(
        &self,
        principal_id: &str,
        page_token: Option<&str>,
    ) -> Result<GroupPage>;
}

/// Resolve the full identity-token set for a principal.
///
/// Seeds the set with the principal's own id, then follows continuation
/// pages until exhausted. No page is skipped; an empty first page with no
/// continuation yields just the principal id. A failure mid-pagination is an
/// error: a partial set must never drive an authorization decision.
///
/// # Errors
///
/// Propagates the directory client's error for any page.
pub async fn resolve_identity_tokens(
    client: &dyn DirectoryClient,
    principal_id: &str,
) -> Result<IdentityTokens> {
    let mut tokens = IdentityTokens::for_principal(principal_id);
    let mut page_token: Option<String> = None;

    loop {
        let page = client
            .member_groups_page(principal_id, page_token.as_deref())
            .await?;
        tokens.extend(page.groups);

        match page.next_page {
            Some(next) => page_token = Some(next),
            None => break,
        }
    }

    debug!(principal = %principal_id, tokens = tokens.len(), "Resolved identity tokens");
    Ok(tokens)
}

/// Graph-style directory client.
///
/// `POST {endpoint}/v1.0/users/{id}/getMemberGroups` with
/// `{"securityEnabledOnly": true}`; pages continue via `@odata.nextLink`.
/// Lookups are idempotent reads, so transport failures and 5xx responses are
/// retried with bounded backoff; 4xx responses surface verbatim.
pub struct GraphDirectory {
    http: reqwest::Client,
    endpoint: String,
    credentials: Arc<TokenCache>,
    retry: RetryPolicy,
}

/// Wire form of a membership page.
#[derive(Debug, Deserialize)]
struct MemberGroupsPage {
    #[serde(default)]
    value: Vec<String>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

impl GraphDirectory {
    /// Create a client from configuration and a service token cache.
    #[must_use]
    pub fn new(http: reqwest::Client, config: &DirectoryConfig, credentials: Arc<TokenCache>) -> Self {
        Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            credentials,
            retry: RetryPolicy::new(&config.retry),
        }
    }

    async fn fetch_page(&self, url: &str) -> Result<MemberGroupsPage> {
        let bearer = self.credentials.token().await?;

        let response = self
            .http
            .post(url)
            .bearer_auth(bearer)
            .json(&json!({ "securityEnabledOnly": true }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Upstream {
                status: response.status().as_u16(),
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl DirectoryClient for GraphDirectory {
    async fn member_groups_page(
        &self,
        principal_id: &str,
        page_token: Option<&str>,
    ) -> Result<GroupPage> {
        let url = match page_token {
            Some(next_link) => next_link.to_string(),
            None => format!(
                "{}/v1.0/users/{principal_id}/getMemberGroups",
                self.endpoint
            ),
        };

        let page = with_retry(&self.retry, "member_groups_page", || {
            self.fetch_page(&url)
        })
        .await?;

        Ok(GroupPage {
            groups: page.value,
            next_page: page.next_link,
        })
    }
}
