//! Account endpoints of the remote service
//!
//! `AccountApi` is the seam the tenant facade calls through; every method
//! takes the credential to authenticate with so the facade can retry with a
//! refreshed one. `HttpAccountApi` speaks the JSON API:
//!
//! - `GET /users/me/wallet` → `Balance`
//! - `GET /users/me/restrictions` → `Restrictions`
//! - `GET /users/me/wallet/transactions` → `[Transaction]`, paged with the
//!   `X-Page` / `X-Size` request headers; the collection size comes back in
//!   `X-Total`.

use std::future::Future;
use std::pin::Pin;

use auth::Credential;
use remote::{Page, RemoteError, classify_transport, error_for_response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const PAGE_HEADER: &str = "X-Page";
pub const SIZE_HEADER: &str = "X-Size";
pub const TOTAL_HEADER: &str = "X-Total";

/// Amounts are in minor currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub available: i64,
    pub blocked: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Restrictions {
    pub investing_allowed: bool,
    pub minimum_amount: i64,
    pub maximum_amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: u64,
    pub amount: i64,
    pub category: String,
    pub date: String,
}

type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = remote::Result<T>> + Send + 'a>>;

/// Account operations against the remote service.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn AccountApi>`).
pub trait AccountApi: Send + Sync {
    fn balance<'a>(&'a self, credential: &'a Credential) -> ApiFuture<'a, Balance>;

    fn restrictions<'a>(&'a self, credential: &'a Credential) -> ApiFuture<'a, Restrictions>;

    /// One page of the transaction list, `page` counted from 0.
    fn transactions<'a>(
        &'a self,
        credential: &'a Credential,
        page: u32,
        size: u32,
    ) -> ApiFuture<'a, Page<Transaction>>;
}

/// `AccountApi` over HTTP.
#[derive(Clone)]
pub struct HttpAccountApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpAccountApi {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn get(
        &self,
        context: &str,
        path: &str,
        credential: &Credential,
        paging: Option<(u32, u32)>,
    ) -> remote::Result<reqwest::Response> {
        let mut request = self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(credential.access.expose());
        if let Some((page, size)) = paging {
            request = request.header(PAGE_HEADER, page).header(SIZE_HEADER, size);
        }

        let response = request.send().await.map_err(|e| {
            RemoteError::new(classify_transport(&e), format!("{context} request failed: {e}"))
        })?;
        debug!(context, status = response.status().as_u16(), "remote response");

        if !response.status().is_success() {
            return Err(error_for_response(context, response).await);
        }
        Ok(response)
    }
}

async fn decode<T: DeserializeOwned>(
    context: &str,
    response: reqwest::Response,
) -> remote::Result<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| RemoteError::permanent(format!("invalid {context} response: {e}")))
}

fn total_items(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(TOTAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

impl AccountApi for HttpAccountApi {
    fn balance<'a>(&'a self, credential: &'a Credential) -> ApiFuture<'a, Balance> {
        Box::pin(async move {
            let response = self.get("balance", "/users/me/wallet", credential, None).await?;
            decode("balance", response).await
        })
    }

    fn restrictions<'a>(&'a self, credential: &'a Credential) -> ApiFuture<'a, Restrictions> {
        Box::pin(async move {
            let response = self
                .get("restrictions", "/users/me/restrictions", credential, None)
                .await?;
            decode("restrictions", response).await
        })
    }

    fn transactions<'a>(
        &'a self,
        credential: &'a Credential,
        page: u32,
        size: u32,
    ) -> ApiFuture<'a, Page<Transaction>> {
        Box::pin(async move {
            let response = self
                .get(
                    "transactions",
                    "/users/me/wallet/transactions",
                    credential,
                    Some((page, size)),
                )
                .await?;
            let total = total_items(&response);
            let items = decode("transactions", response).await?;
            Ok(Page::new(items, total))
        })
    }
}
