//! Last stage: the wire exchange.
//!
//! Writes the request through the bound codec and reads the response head.
//! The response body keeps the stream's lease; the allocation learns the
//! stream finished when the body ends, fails or is dropped.
//!
//! | Outcome | Lease finished with |
//! |---------|---------------------|
//! | body read to the end | `no_new_streams` only if close-delimited |
//! | body read error | `no_new_streams` |
//! | body dropped unread | `no_new_streams` |
//! | `101 Switching Protocols` | `no_new_streams`, immediately |
//! | empty body | reuse, immediately |

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::http::request::permits_request_body;
use crate::http::{BodySource, Response, ResponseBody, ResponseHead, content_length, wants_close};
use crate::transport::allocation::StreamLease;

use super::{BoundStream, Chain, Interceptor};

// ============================================================================
// CallServer
// ============================================================================

/// Performs the exchange on the bound codec.
pub(crate) struct CallServer;

#[async_trait]
impl Interceptor for CallServer {
    async fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
        let BoundStream { mut codec, lease } = chain
            .take_stream()
            .ok_or_else(|| Error::illegal_state("call server stage reached without a stream"))?;
        let allocation = Arc::clone(lease.allocation());
        let request = chain.request().clone();
        let (handshake, multiplexed) = chain.connection().map_or((None, false), |c| {
            (c.handshake().cloned(), c.is_multiplexed())
        });

        let sent_at = SystemTime::now();
        codec.write_request_headers(&request).await?;

        let mut early: Option<ResponseHead> = None;
        if permits_request_body(request.method())
            && let Some(body) = request.body()
        {
            if expects_continue(request.header("expect")) {
                codec.flush_request().await?;
                let head = codec.read_response_headers().await?;
                if head.status != StatusCode::CONTINUE {
                    early = Some(head);
                }
            }

            if early.is_none() {
                codec.begin_body(body.content_length()).await?;
                body.write_to(codec.as_mut()).await?;
                codec.end_body().await?;
            } else if !multiplexed {
                // The unsent body leaves the connection mid-request.
                allocation.no_new_streams();
            }
        }

        let mut head = match early {
            Some(head) => head,
            None => {
                codec.finish_request().await?;
                codec.read_response_headers().await?
            }
        };
        while head.status == StatusCode::CONTINUE {
            head = codec.read_response_headers().await?;
        }
        let received_at = SystemTime::now();

        let code = head.status.as_u16();
        trace!(call = %chain.call_id(), status = code, method = %request.method(), "Response received");

        if wants_close(request.headers()) || wants_close(&head.headers) {
            allocation.no_new_streams();
        }

        if matches!(code, 204 | 205)
            && let Some(length) = content_length(&head.headers).filter(|n| *n > 0)
        {
            return Err(Error::protocol(format!(
                "HTTP {code} had non-zero Content-Length: {length}"
            )));
        }

        let body = if head.status == StatusCode::SWITCHING_PROTOCOLS {
            drop(codec);
            debug!(call = %chain.call_id(), "Upgrade response, surrendering stream");
            lease.finish(true);
            ResponseBody::empty()
        } else {
            let body = codec.open_response_body(&head, &request)?;
            if body.is_closed() {
                lease.finish(false);
                body
            } else {
                body.map_source(|source| {
                    Box::new(LeasedBody {
                        inner: source,
                        lease: Some(lease),
                    }) as Box<dyn BodySource>
                })
            }
        };

        let response = Response::new(request, head, body)
            .with_handshake(handshake)
            .with_timing(sent_at, received_at);
        Ok(response)
    }

    fn name(&self) -> &str {
        "CallServer"
    }
}

fn expects_continue(expect: Option<&str>) -> bool {
    expect.is_some_and(|value| value.trim().eq_ignore_ascii_case("100-continue"))
}

// ============================================================================
// LeasedBody
// ============================================================================

/// Body source that reports the end of its stream to the allocation.
struct LeasedBody {
    inner: Box<dyn BodySource>,
    lease: Option<StreamLease>,
}

impl LeasedBody {
    fn finish(&mut self, no_new_streams: bool) {
        if let Some(lease) = self.lease.take() {
            lease.finish(no_new_streams);
        }
    }
}

#[async_trait]
impl BodySource for LeasedBody {
    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        match self.inner.read_chunk().await {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                let ends_connection = self.inner.ends_connection();
                self.finish(ends_connection);
                Ok(None)
            }
            Err(e) => {
                self.finish(true);
                Err(e)
            }
        }
    }

    fn ends_connection(&self) -> bool {
        self.inner.ends_connection()
    }
}

impl Drop for LeasedBody {
    fn drop(&mut self) {
        self.finish(true);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expects_continue() {
        assert!(expects_continue(Some("100-continue")));
        assert!(expects_continue(Some(" 100-Continue ")));
        assert!(!expects_continue(Some("200-ok")));
        assert!(!expects_continue(None));
    }
}
