use serde_json::Value;

use tracing::warn;

/// Status returned when no method matches or when the method payload is
/// not JSON.
pub const METHOD_NOT_FOUND: u16 = 404;

/// An inbound direct method invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRequest {
    /// Request identifier, used to route the response.
    pub request_id: String,
    /// Method name.
    pub name: String,
    /// Raw payload.
    pub payload: Vec<u8>,
}

impl MethodRequest {
    /// Creates a [`MethodRequest`].
    #[must_use]
    pub fn new(request_id: impl Into<String>, name: impl Into<String>, payload: &[u8]) -> Self {
        Self {
            request_id: request_id.into(),
            name: name.into(),
            payload: payload.to_vec(),
        }
    }
}

/// The response to a direct method.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodResponse {
    /// HTTP-like status.
    pub status: u16,
    /// Response body.
    pub body: Option<Value>,
}

impl MethodResponse {
    /// Creates a [`MethodResponse`].
    #[must_use]
    pub const fn new(status: u16, body: Option<Value>) -> Self {
        Self { status, body }
    }

    /// Creates a `200` [`MethodResponse`] with a body.
    #[must_use]
    pub const fn ok(body: Value) -> Self {
        Self::new(200, Some(body))
    }

    /// Creates a [`MethodResponse`] with no body.
    #[must_use]
    pub const fn empty(status: u16) -> Self {
        Self::new(status, None)
    }

    pub(crate) fn not_found() -> Self {
        Self::new(METHOD_NOT_FOUND, Some(Value::from("method not found")))
    }

    pub(crate) fn invalid_payload() -> Self {
        Self::new(METHOD_NOT_FOUND, Some(Value::from("invalid method payload")))
    }

    /// Serializes the body.
    ///
    /// A missing body is serialized as `null`. The buffer holds exactly the
    /// serialized document.
    #[must_use]
    pub fn body_bytes(&self) -> Vec<u8> {
        let body = self.body.as_ref().unwrap_or(&Value::Null);
        // Serializing a `Value` cannot fail.
        serde_json::to_vec(body).unwrap_or_else(|_| b"null".to_vec())
    }
}

/// Handles a direct method.
pub trait MethodHandler {
    /// Runs the method with its parsed parameters, `None` for an empty
    /// payload.
    fn invoke(&mut self, params: Option<&Value>) -> MethodResponse;
}

impl<F> MethodHandler for F
where
    F: FnMut(Option<&Value>) -> MethodResponse,
{
    fn invoke(&mut self, params: Option<&Value>) -> MethodResponse {
        self(params)
    }
}

/// An ordered table of direct methods.
#[derive(Default)]
pub struct MethodTable {
    entries: Vec<(String, Box<dyn MethodHandler>)>,
}

impl std::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(name, _)| name))
            .finish()
    }
}

impl MethodTable {
    /// Creates an empty [`MethodTable`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Adds a method.
    ///
    /// When two entries share a name, the first one wins.
    #[must_use]
    pub fn method(mut self, name: impl Into<String>, handler: impl MethodHandler + 'static) -> Self {
        self.entries.push((name.into(), Box::new(handler)));
        self
    }

    /// Returns the number of methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Checks whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs the method matching the request name.
    ///
    /// Names are matched as whole, case-sensitive strings.
    pub fn invoke(&mut self, request: &MethodRequest) -> MethodResponse {
        let Some((_, handler)) = self
            .entries
            .iter_mut()
            .find(|(name, _)| *name == request.name)
        else {
            warn!("Method `{}` not found", request.name);
            return MethodResponse::not_found();
        };

        if request.payload.is_empty() {
            return handler.invoke(None);
        }

        match serde_json::from_slice::<Value>(&request.payload) {
            Ok(params) => handler.invoke(Some(&params)),
            Err(e) => {
                warn!("Invalid payload for method `{}`: {e}", request.name);
                MethodResponse::invalid_payload()
            }
        }
    }
}
