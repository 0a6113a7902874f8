use crate::query::QueryEngine;
use crate::source::{ItemError, ItemSource};
use pipesecret::protocol::{
    ErrorCode, GET_QUERY_ITEM, GetQueryItemParams, HEARTBEAT, HEARTBEAT_ACK, RpcError,
};
use pipesecret_relay::server::Handler;
use serde_json::Value;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Controller-side request handler: answers heartbeats and resolves
/// `getQueryItem` calls through an item source and a query engine.
pub struct SecretResolver<S, Q> {
    source: S,
    engine: Q,
}

impl<S: ItemSource, Q: QueryEngine> SecretResolver<S, Q> {
    pub fn new(source: S, engine: Q) -> Self {
        Self { source, engine }
    }

    async fn get_query_item(&self, params: Value) -> Result<Value, RpcError> {
        let params: GetQueryItemParams = serde_json::from_value(params).map_err(|e| {
            RpcError::new(
                ErrorCode::ParseError,
                format!("invalid getQueryItem params: {e}"),
            )
        })?;
        info!(item = %params.item, "resolving item");

        let document = match self.source.get_item(&params.item).await {
            Ok(document) => Zeroizing::new(document),
            Err(e @ ItemError::Unavailable(_)) => {
                return Err(RpcError::new(ErrorCode::InternalError, e.to_string()));
            }
            Err(e) => return Err(RpcError::new(ErrorCode::InvalidRequest, e.to_string())),
        };

        let result = self
            .engine
            .run(&params.query, &document)
            .map_err(|e| RpcError::new(ErrorCode::InvalidRequest, e.to_string()))?;
        Ok(Value::String(result))
    }
}

impl<S: ItemSource, Q: QueryEngine> Handler for SecretResolver<S, Q> {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            HEARTBEAT => {
                debug!("heartbeat");
                Ok(Value::from(HEARTBEAT_ACK))
            }
            GET_QUERY_ITEM => self.get_query_item(params).await,
            other => Err(RpcError::method_not_handled(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::JqEngine;
    use serde_json::json;
    use std::collections::HashMap;

    struct Items(HashMap<&'static str, &'static str>);

    impl ItemSource for Items {
        async fn get_item(&self, name: &str) -> Result<String, ItemError> {
            match name {
                "broken" => Err(ItemError::Execution("op exited with 1".to_string())),
                "offline" => Err(ItemError::Unavailable("op not found".to_string())),
                _ => self
                    .0
                    .get(name)
                    .map(|doc| doc.to_string())
                    .ok_or_else(|| ItemError::NotFound(name.to_string())),
            }
        }
    }

    fn resolver() -> SecretResolver<Items, JqEngine> {
        let items = HashMap::from([("db", r#"{"user":"admin","pass":"hunter2"}"#)]);
        SecretResolver::new(Items(items), JqEngine)
    }

    fn params(item: &str, query: &str) -> Value {
        json!({"Item": item, "Query": query})
    }

    async fn code_of(method: &str, params: Value) -> ErrorCode {
        resolver().handle(method, params).await.unwrap_err().code
    }

    #[tokio::test]
    async fn heartbeat_is_acknowledged() {
        let ack = resolver().handle(HEARTBEAT, Value::Null).await.unwrap();
        assert_eq!(ack, Value::from("ack"));
    }

    #[tokio::test]
    async fn get_query_item_returns_query_output_as_a_string() {
        let got = resolver()
            .handle(GET_QUERY_ITEM, params("db", "{username: .user}"))
            .await
            .unwrap();
        assert_eq!(got, Value::from("{\"username\":\"admin\"}\n"));
    }

    #[tokio::test]
    async fn failures_map_to_error_codes() {
        assert_eq!(
            code_of(GET_QUERY_ITEM, json!({"Item": "db"})).await,
            ErrorCode::ParseError
        );
        assert_eq!(
            code_of(GET_QUERY_ITEM, params("missing", ".")).await,
            ErrorCode::InvalidRequest
        );
        assert_eq!(
            code_of(GET_QUERY_ITEM, params("broken", ".")).await,
            ErrorCode::InvalidRequest
        );
        assert_eq!(
            code_of(GET_QUERY_ITEM, params("offline", ".")).await,
            ErrorCode::InternalError
        );
        assert_eq!(
            code_of(GET_QUERY_ITEM, params("db", ".[")).await,
            ErrorCode::InvalidRequest
        );
        assert_eq!(
            code_of("listItems", Value::Null).await,
            ErrorCode::MethodNotHandled
        );
    }
}
