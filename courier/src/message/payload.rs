//! Request and reply payloads.

use crate::error::ReplyError;
use crate::message::RequestReplyId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A method call addressed to a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Method to invoke.
    pub method_name: String,
    /// Positional arguments.
    #[serde(default)]
    pub params: Vec<Value>,
    /// Declared type name of each argument, used for overload resolution.
    #[serde(default)]
    pub param_datatypes: Vec<String>,
    /// Correlation key echoed by the reply.
    pub request_reply_id: RequestReplyId,
}

impl Request {
    /// Build a request with a freshly generated correlation id.
    pub fn new(
        method_name: impl Into<String>,
        params: Vec<Value>,
        param_datatypes: Vec<String>,
    ) -> Self {
        Self {
            method_name: method_name.into(),
            params,
            param_datatypes,
            request_reply_id: RequestReplyId::generate(),
        }
    }

    /// Replace the correlation key.
    pub fn with_request_reply_id(mut self, id: impl Into<RequestReplyId>) -> Self {
        self.request_reply_id = id.into();
        self
    }
}

/// A method call that expects no reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneWayRequest {
    /// Method to invoke.
    pub method_name: String,
    /// Positional arguments.
    #[serde(default)]
    pub params: Vec<Value>,
    /// Declared type name of each argument.
    #[serde(default)]
    pub param_datatypes: Vec<String>,
}

impl OneWayRequest {
    /// Build a one-way request.
    pub fn new(
        method_name: impl Into<String>,
        params: Vec<Value>,
        param_datatypes: Vec<String>,
    ) -> Self {
        Self {
            method_name: method_name.into(),
            params,
            param_datatypes,
        }
    }
}

/// The answer to a [`Request`]: either response values or an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Correlation key copied from the request.
    pub request_reply_id: RequestReplyId,
    /// Returned values; empty when `error` is set.
    #[serde(default)]
    pub response: Vec<Value>,
    /// Failure, if the call did not succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

impl Reply {
    /// Successful reply.
    pub fn success(request_reply_id: RequestReplyId, response: Vec<Value>) -> Self {
        Self {
            request_reply_id,
            response,
            error: None,
        }
    }

    /// Failed reply.
    pub fn failure(request_reply_id: RequestReplyId, error: ReplyError) -> Self {
        Self {
            request_reply_id,
            response: Vec::new(),
            error: Some(error),
        }
    }

    /// Whether the reply carries an error.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Split into response values or error.
    pub fn into_result(self) -> Result<Vec<Value>, ReplyError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.response),
        }
    }
}
