// Token values driven by dashboard inputs
use std::collections::BTreeMap;

/// Current value of a named token.
///
/// Scalar tokens carry the text substituted for a bare `$name$` reference.
/// Structured tokens keep the raw input string for bare references and expose
/// derived sub-fields addressable as `$name.field$`; a time range token, for
/// example, exposes `earliest` and `latest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenValue {
    Scalar(String),
    Structured {
        raw: String,
        fields: BTreeMap<String, String>,
    },
}

impl TokenValue {
    pub fn scalar(value: impl Into<String>) -> Self {
        TokenValue::Scalar(value.into())
    }

    /// Build a time range value from its `earliest,latest` wire form, e.g.
    /// `-24h@h,now`. Relative-time modifier strings pass through untouched;
    /// interpreting them is the query backend's concern. A value without a
    /// comma is taken as the earliest bound, with `latest` defaulting to
    /// `now`.
    pub fn time_range(raw: &str) -> Self {
        let (earliest, latest) = match raw.split_once(',') {
            Some((earliest, latest)) => (earliest.trim().to_string(), latest.trim().to_string()),
            None => (raw.trim().to_string(), "now".to_string()),
        };
        let mut fields = BTreeMap::new();
        fields.insert("earliest".to_string(), earliest);
        fields.insert("latest".to_string(), latest);
        TokenValue::Structured {
            raw: raw.to_string(),
            fields,
        }
    }

    /// Textual form substituted for a bare `$name$` reference.
    pub fn render(&self) -> &str {
        match self {
            TokenValue::Scalar(value) => value,
            TokenValue::Structured { raw, .. } => raw,
        }
    }

    /// Sub-field of a structured value; `None` for scalars and absent fields.
    pub fn field(&self, name: &str) -> Option<&str> {
        match self {
            TokenValue::Scalar(_) => None,
            TokenValue::Structured { fields, .. } => fields.get(name).map(String::as_str),
        }
    }
}

/// Read access to current token values, implemented by the token store and by
/// plain maps in tests.
pub trait TokenLookup {
    fn value(&self, name: &str) -> Option<&TokenValue>;
}

impl TokenLookup for BTreeMap<String, TokenValue> {
    fn value(&self, name: &str) -> Option<&TokenValue> {
        self.get(name)
    }
}
