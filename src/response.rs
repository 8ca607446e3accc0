use serde_json::{json, Value as JsonValue};

use crate::dispatch::Reply;
use crate::error::{DispatchError, ErrorReport};

/// JSON body for a successful dispatch.
///
/// A bulk reply is the array of per-call values. A single reply is the value
/// itself, except that a method returning nothing reads as a plain success.
pub fn render_reply(reply: &Reply) -> JsonValue {
    match reply {
        Reply::Bulk(values) => JsonValue::Array(values.clone()),
        Reply::Single { value, .. } if value.is_null() => json!({
            "result": "success",
            "message": "ok",
        }),
        Reply::Single { value, .. } => value.clone(),
    }
}

pub fn render_error(report: &ErrorReport) -> JsonValue {
    json!({
        "result": "error",
        "message": report.message,
        "module": report.module,
        "method": report.method,
    })
}

pub fn render_outcome(outcome: &Result<Reply, DispatchError>) -> JsonValue {
    match outcome {
        Ok(reply) => render_reply(reply),
        Err(err) => render_error(&err.report()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::MethodRef;

    #[test]
    fn bulk_reply_is_an_array() {
        let reply = Reply::Bulk(vec![json!(1), json!(null)]);
        assert_eq!(render_reply(&reply), json!([1, null]));
    }

    #[test]
    fn null_single_reply_reads_as_success() {
        let reply = Reply::Single {
            target: MethodRef::parse("A.m").unwrap(),
            value: JsonValue::Null,
        };
        assert_eq!(
            render_reply(&reply),
            json!({"result": "success", "message": "ok"})
        );

        let reply = Reply::Single {
            target: MethodRef::parse("A.m").unwrap(),
            value: json!({"x": 1}),
        };
        assert_eq!(render_reply(&reply), json!({"x": 1}));
    }

    #[test]
    fn errors_carry_module_and_method_hints() {
        let err = DispatchError::BackendCall {
            module: "A".to_string(),
            method: "m".to_string(),
            message: "down".to_string(),
        };
        assert_eq!(
            render_outcome(&Err(err)),
            json!({
                "result": "error",
                "message": "A.m failed: down",
                "module": "A",
                "method": "m",
            })
        );

        let err = DispatchError::InvalidMethodName {
            value: "NoDot".to_string(),
        };
        let body = render_outcome(&Err(err));
        assert_eq!(body["module"], JsonValue::Null);
        assert!(body["message"]
            .as_str()
            .unwrap()
            .starts_with("The method name is invalid"));
    }
}
