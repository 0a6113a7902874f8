use jaq_interpret::{Ctx, FilterT, ParseCtx, RcIter, Val};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("failed to parse query: {0}")]
    Parse(String),
    #[error("failed to parse input: {0}")]
    Input(#[source] serde_json::Error),
    #[error("failed to process query: {0}")]
    Evaluation(String),
    #[error("failed to encode query result: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Projects fields out of an item document.
pub trait QueryEngine: Send + Sync {
    /// Run `query` over every JSON value in `document`, returning each
    /// output as one line of compact JSON.
    fn run(&self, query: &str, document: &str) -> Result<String, QueryError>;
}

/// jq, with the jq standard library.
#[derive(Debug, Default, Clone, Copy)]
pub struct JqEngine;

impl QueryEngine for JqEngine {
    fn run(&self, query: &str, document: &str) -> Result<String, QueryError> {
        let mut defs = ParseCtx::new(Vec::new());
        defs.insert_natives(jaq_core::core());
        defs.insert_defs(jaq_std::std());

        let (parsed, errs) = jaq_parse::parse(query, jaq_parse::main());
        let parsed = match parsed {
            Some(parsed) if errs.is_empty() => parsed,
            _ => return Err(QueryError::Parse(query.to_string())),
        };
        let filter = defs.compile(parsed);
        if !defs.errs.is_empty() {
            return Err(QueryError::Parse(query.to_string()));
        }

        let mut out = String::new();
        let inputs = RcIter::new(core::iter::empty());
        for doc in serde_json::Deserializer::from_str(document).into_iter::<Value>() {
            let doc = doc.map_err(QueryError::Input)?;
            for result in filter.run((Ctx::new([], &inputs), Val::from(doc))) {
                let val = result.map_err(|e| QueryError::Evaluation(e.to_string()))?;
                let line = serde_json::to_string(&Value::from(val)).map_err(QueryError::Encode)?;
                out.push_str(&line);
                out.push('\n');
            }
        }
        Ok(out)
    }
}
