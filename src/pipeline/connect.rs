//! Binds the attempt to a healthy connection and a fresh codec.

use std::sync::Arc;

use async_trait::async_trait;
use http::Method;
use tracing::trace;

use crate::error::{Error, Result};
use crate::http::Response;

use super::{BoundStream, Chain, Interceptor};

/// Resolves a connection through the call's allocation.
///
/// Pooled connections get the extensive health check (a non-blocking read
/// probe) unless the method is `GET`.
pub(crate) struct Connect;

#[async_trait]
impl Interceptor for Connect {
    async fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
        let allocation = chain
            .allocation()
            .cloned()
            .ok_or_else(|| Error::illegal_state("connect stage reached without an allocation"))?;

        let request = chain.request().clone();
        let extensive = request.method() != Method::GET;
        let params = chain.client().connect_params();

        let (codec, lease) = allocation.new_stream(&params, extensive).await?;
        let connection = allocation.connection();
        trace!(
            call = %chain.call_id(),
            connection = ?connection.as_ref().map(|c| c.id()),
            "Attempt bound"
        );

        chain
            .proceed_with(
                request,
                Some(Arc::clone(&allocation)),
                Some(BoundStream { codec, lease }),
                connection,
            )
            .await
    }

    fn name(&self) -> &str {
        "Connect"
    }
}
