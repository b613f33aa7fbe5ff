//! GraphQL over HTTP/1.1 POST
//!
//! A response is a failure when its JSON body carries a non-empty `errors`
//! array, even with status 200.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use surge_core::{ErrorKind, OpContext, OpError, OpRecorder, ProtocolKind, Request, SurgeError};

use crate::client::{finish, guarded, Outcome, ProtocolClient, Response};
use crate::http1::Http1Client;

#[derive(Serialize)]
struct Query<'a> {
    query: &'a str,
    #[serde(skip_serializing_if = "Value::is_null")]
    variables: Value,
    #[serde(rename = "operationName", skip_serializing_if = "Option::is_none")]
    operation_name: Option<&'a str>,
}

/// JSON request body for a query
pub fn query_body(query: &str, variables: Value, operation_name: Option<&str>) -> Bytes {
    let body = Query {
        query,
        variables,
        operation_name,
    };
    // Serializing borrowed strs and a Value cannot fail
    Bytes::from(serde_json::to_vec(&body).unwrap_or_default())
}

fn response_errors(response: &Response) -> Option<OpError> {
    if response.status >= 400 {
        return None;
    }
    let doc: Value = match serde_json::from_slice(&response.body) {
        Ok(doc) => doc,
        Err(e) => {
            return Some(OpError::new(
                ErrorKind::Protocol,
                format!("GraphQL response is not JSON: {e}"),
            ))
        }
    };
    let errors = doc.get("errors")?.as_array()?;
    let first = errors.first()?;
    let message = first
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    Some(OpError::new(
        ErrorKind::Protocol,
        format!("GraphQL error ({} total): {message}", errors.len()),
    ))
}

pub struct GraphQlClient {
    http1: Arc<Http1Client>,
}

impl GraphQlClient {
    pub fn new(http1: Arc<Http1Client>) -> Self {
        Self { http1 }
    }

    async fn call(&self, request: &Request, rec: &mut OpRecorder) -> Result<Response, SurgeError> {
        let mut request = request.clone();
        if request.method == "GET" && !request.body.is_empty() {
            request.method = "POST".to_string();
        }
        if !request.headers.contains("content-type") {
            request.headers.insert("Content-Type", "application/json");
        }
        if !request.headers.contains("accept") {
            request.headers.insert("Accept", "application/json");
        }
        self.http1.exchange(&request, rec).await
    }
}

#[async_trait]
impl ProtocolClient for GraphQlClient {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Graphql
    }

    async fn execute(&self, request: &Request, ctx: &OpContext) -> Outcome {
        let mut rec = ctx.recorder(Some(ProtocolKind::Graphql), request.url.as_str());
        let deadline = request
            .timeout
            .unwrap_or(self.http1.config().request_timeout);
        let res = guarded(&ctx.cancel, deadline, self.call(request, &mut rec)).await;
        finish(rec, res, response_errors)
    }

    async fn close(&self) -> Result<(), SurgeError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(body: &'static str) -> Response {
        Response {
            status: 200,
            body: Bytes::from_static(body.as_bytes()),
            ..Default::default()
        }
    }

    #[test]
    fn test_query_body() {
        let body = query_body("{ me { id } }", json!({"a": 1}), None);
        let doc: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(doc["query"], "{ me { id } }");
        assert_eq!(doc["variables"]["a"], 1);
        assert!(doc.get("operationName").is_none());
    }

    #[test]
    fn test_errors_array_fails_operation() {
        assert!(response_errors(&response(r#"{"data":{"me":null}}"#)).is_none());
        assert!(response_errors(&response(r#"{"data":{},"errors":[]}"#)).is_none());
        let err =
            response_errors(&response(r#"{"errors":[{"message":"denied"}]}"#)).unwrap();
        assert_eq!(err.kind, ErrorKind::Protocol);
        assert!(err.message.contains("denied"));
        assert!(response_errors(&response("<html>")).is_some());
    }
}
