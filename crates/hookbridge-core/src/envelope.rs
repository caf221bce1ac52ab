//! Execution envelope wrapped around caller-supplied code.
//!
//! The envelope evaluates the code in the script's global scope, buffers
//! console output while the synchronous part runs, and reports the outcome as
//! a single `execution_receipt` message:
//!
//! ```text
//! {"type": "execution_receipt", "result": <json>,
//!  "error": {"message", "stack"} | null, "logs": [..]}
//! ```

/// Payload `type` of the receipt message.
pub const RECEIPT_KIND: &str = "execution_receipt";

/// Variable the envelope binds the caller's source to.
pub const SOURCE_BINDING: &str = "__hbSource";

const DEFAULT_LOG_METHODS: [&str; 5] = ["log", "info", "warn", "error", "debug"];

const TEMPLATE: &str = r"(function () {
  var __hbLogs = [];
  var __hbSaved = {};
  var __hbMethods = __HB_METHODS__;
  function __hbFormat(value) {
    if (typeof value === 'string') return value;
    if (value === undefined) return 'undefined';
    try { return JSON.stringify(value); } catch (e) { return String(value); }
  }
  function __hbNormalize(value) {
    if (value === undefined) return null;
    try {
      var text = JSON.stringify(value);
      return text === undefined ? String(value) : JSON.parse(text);
    } catch (e) {
      return String(value);
    }
  }
  __hbMethods.forEach(function (name) {
    __hbSaved[name] = console[name];
    console[name] = function () {
      var parts = [];
      for (var i = 0; i < arguments.length; i++) parts.push(__hbFormat(arguments[i]));
      __hbLogs.push(parts.join(' '));
    };
  });
  var __hbResult = null;
  var __hbError = null;
  try {
    var __hbSource = __HB_SOURCE__;
    __hbResult = __hbNormalize((0, eval)(__hbSource));
  } catch (e) {
    __hbError = { message: String(e), stack: (e && e.stack) ? String(e.stack) : null };
  } finally {
    __hbMethods.forEach(function (name) { console[name] = __hbSaved[name]; });
  }
  send({ type: '__HB_KIND__', result: __hbResult, error: __hbError, logs: __hbLogs });
})();
";

/// Builder for the execution envelope.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    code: String,
    log_methods: Option<Vec<String>>,
}

impl EnvelopeBuilder {
    /// Create a builder for the given caller code.
    #[must_use]
    pub fn new<S: Into<String>>(code: S) -> Self {
        Self {
            code: code.into(),
            log_methods: None,
        }
    }

    /// Replace the set of intercepted console methods.
    #[must_use]
    pub fn log_methods<I>(mut self, methods: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.log_methods = Some(methods.into_iter().map(Into::into).collect());
        self
    }

    /// Leave the console untouched; `logs` in the receipt stays empty.
    #[must_use]
    pub fn without_log_capture(mut self) -> Self {
        self.log_methods = Some(Vec::new());
        self
    }

    /// Render the envelope source.
    #[must_use]
    pub fn build(&self) -> String {
        let methods: Vec<&str> = self.log_methods.as_ref().map_or_else(
            || DEFAULT_LOG_METHODS.to_vec(),
            |m| m.iter().map(String::as_str).collect(),
        );
        // Serializing a string or a list of strings cannot fail.
        let methods = serde_json::to_string(&methods).unwrap_or_else(|_| "[]".into());
        let source = serde_json::Value::String(self.code.clone()).to_string();

        TEMPLATE
            .replace("__HB_METHODS__", &methods)
            .replace("__HB_KIND__", RECEIPT_KIND)
            .replace("__HB_SOURCE__", &source)
    }
}

/// Recover the caller's code from a rendered envelope.
///
/// Returns `None` for sources that were not produced by [`EnvelopeBuilder`].
#[must_use]
pub fn user_code(envelope: &str) -> Option<String> {
    let prefix = format!("var {SOURCE_BINDING} = ");
    envelope.lines().find_map(|line| {
        let literal = line.trim().strip_prefix(&prefix)?.strip_suffix(';')?;
        serde_json::from_str(literal).ok()
    })
}
