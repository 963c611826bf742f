// Parsed expression dialects.
//
// Two dialects appear in definition documents, evaluated at different times:
// - token templates (`$name$`, `$name.field$`, `$$` escapes a dollar) are
//   substituted against the token store before a query executes;
// - data-reference pipelines (`> role | seriesByName('x') | lastPoint()`)
//   extract values from a role's query result at render time.
//
// Both are parsed once at load into small trees. Parsing up front keeps
// dependency scanning exact (a template knows precisely which tokens it
// reads) and makes malformed expressions abort construction instead of
// surfacing mid-session. Parse functions return a plain reason string; the
// caller wraps it with the document context (which option, which source).

use crate::domain::error::DashboardError;
use crate::domain::result::{OptionValue, ResultSet};
use crate::domain::token::TokenLookup;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Ref { token: String, field: Option<String> },
}

/// A token template: literal text interleaved with token references.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(input: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut chars = input.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '$' {
                text.push(c);
                continue;
            }
            if chars.peek() == Some(&'$') {
                chars.next();
                text.push('$');
                continue;
            }
            let mut reference = String::new();
            let mut terminated = false;
            for rc in chars.by_ref() {
                if rc == '$' {
                    terminated = true;
                    break;
                }
                reference.push(rc);
            }
            if !terminated {
                return Err(format!("unterminated token reference `${reference}`"));
            }
            let (token, field) = match reference.split_once('.') {
                None => (reference.as_str(), None),
                Some((token, field)) => {
                    if field.contains('.') {
                        return Err(format!(
                            "more than one field level in `${reference}$`"
                        ));
                    }
                    (token, Some(field))
                }
            };
            if !valid_name(token) {
                return Err(format!("invalid token name `{token}`"));
            }
            if let Some(field) = field {
                if !valid_name(field) {
                    return Err(format!("invalid field name `{field}`"));
                }
            }
            if !text.is_empty() {
                segments.push(Segment::Text(std::mem::take(&mut text)));
            }
            segments.push(Segment::Ref {
                token: token.to_string(),
                field: field.map(str::to_string),
            });
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        Ok(Self {
            source: input.to_string(),
            segments,
        })
    }

    /// The template text as written in the definition.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Exact set of token names this template reads.
    pub fn deps(&self) -> BTreeSet<String> {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Ref { token, .. } => Some(token.clone()),
                Segment::Text(_) => None,
            })
            .collect()
    }

    pub fn has_refs(&self) -> bool {
        self.segments
            .iter()
            .any(|segment| matches!(segment, Segment::Ref { .. }))
    }

    /// Substitute every reference against the current token values.
    /// Substitution is textual and literal; there is no arithmetic or
    /// control flow.
    pub fn resolve(&self, tokens: &impl TokenLookup) -> Result<String, DashboardError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Ref { token, field } => {
                    let value = tokens.value(token).ok_or_else(|| {
                        DashboardError::UnresolvedToken { name: token.clone() }
                    })?;
                    match field {
                        None => out.push_str(value.render()),
                        Some(field) => match value.field(field) {
                            Some(text) => out.push_str(text),
                            None => {
                                return Err(DashboardError::InvalidFieldAccess {
                                    token: token.clone(),
                                    field: field.clone(),
                                });
                            }
                        },
                    }
                }
            }
        }
        Ok(out)
    }
}

/// One stage of a data-reference pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    SeriesByName(String),
    SeriesByIndex(usize),
    FirstPoint,
    LastPoint,
}

/// What a pipeline value is at a given point in the chain; used to reject
/// ill-ordered stages at parse time.
#[derive(Debug, Clone, Copy, PartialEq)]
enum StageInput {
    Frame,
    Series,
    Point,
}

impl Stage {
    fn parse(part: &str) -> Result<Self, String> {
        let Some(open) = part.find('(') else {
            return Err(format!("stage `{part}` is not a function call"));
        };
        if !part.ends_with(')') {
            return Err(format!("missing closing `)` in stage `{part}`"));
        }
        let name = part[..open].trim();
        let args = part[open + 1..part.len() - 1].trim();
        match name {
            "seriesByName" => Ok(Stage::SeriesByName(quoted_arg(name, args)?)),
            "seriesByIndex" => args
                .parse::<usize>()
                .map(Stage::SeriesByIndex)
                .map_err(|_| format!("seriesByIndex expects an integer, got `{args}`")),
            "firstPoint" | "lastPoint" => {
                if !args.is_empty() {
                    return Err(format!("{name} takes no arguments"));
                }
                Ok(if name == "firstPoint" {
                    Stage::FirstPoint
                } else {
                    Stage::LastPoint
                })
            }
            _ => Err(format!("unknown pipeline function `{name}`")),
        }
    }

    fn check(&self, input: StageInput) -> Result<StageInput, String> {
        match (self, input) {
            (Stage::SeriesByName(_) | Stage::SeriesByIndex(_), StageInput::Frame) => {
                Ok(StageInput::Series)
            }
            (Stage::FirstPoint | Stage::LastPoint, StageInput::Series) => Ok(StageInput::Point),
            (Stage::SeriesByName(_) | Stage::SeriesByIndex(_), _) => Err(format!(
                "stage `{}` must be applied directly to the result frame",
                self.name()
            )),
            (Stage::FirstPoint | Stage::LastPoint, _) => Err(format!(
                "stage `{}` requires a series input; select one first",
                self.name()
            )),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Stage::SeriesByName(_) => "seriesByName",
            Stage::SeriesByIndex(_) => "seriesByIndex",
            Stage::FirstPoint => "firstPoint",
            Stage::LastPoint => "lastPoint",
        }
    }
}

fn quoted_arg(stage: &str, args: &str) -> Result<String, String> {
    let inner = args
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
        .or_else(|| {
            args.strip_prefix('"')
                .and_then(|rest| rest.strip_suffix('"'))
        });
    match inner {
        Some(inner) if !inner.is_empty() => Ok(inner.to_string()),
        _ => Err(format!("{stage} expects a quoted series name")),
    }
}

/// A data-reference pipeline: a role name followed by extraction stages.
/// A bare `> role` yields the role's whole result frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    source: String,
    pub role: String,
    pub stages: Vec<Stage>,
}

impl Pipeline {
    /// Whether an option string is in the pipeline dialect at all. Strings
    /// that pass this test must then parse, or the load fails.
    pub fn looks_like(input: &str) -> bool {
        input.trim_start().starts_with('>')
    }

    pub fn parse(input: &str) -> Result<Self, String> {
        let Some(rest) = input.trim().strip_prefix('>') else {
            return Err("expected leading `>`".to_string());
        };
        let mut parts = rest.split('|');
        let role = parts.next().unwrap_or_default().trim();
        if !valid_name(role) {
            return Err(format!("invalid role name `{role}`"));
        }
        let mut stages = Vec::new();
        for part in parts {
            stages.push(Stage::parse(part.trim())?);
        }
        let mut input_kind = StageInput::Frame;
        for stage in &stages {
            input_kind = stage.check(input_kind)?;
        }
        Ok(Self {
            source: input.to_string(),
            role: role.to_string(),
            stages,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Run the stages against the role's current result frame.
    pub fn evaluate(&self, frame: &Arc<ResultSet>) -> Result<OptionValue, DashboardError> {
        let mut value = OptionValue::Frame(frame.clone());
        for stage in &self.stages {
            value = match (stage, value) {
                (Stage::SeriesByName(name), OptionValue::Frame(frame)) => {
                    let values = frame.series_by_name(name).ok_or_else(|| {
                        DashboardError::SeriesNotFound {
                            series: name.clone(),
                        }
                    })?;
                    OptionValue::Series {
                        name: name.clone(),
                        values,
                    }
                }
                (Stage::SeriesByIndex(index), OptionValue::Frame(frame)) => {
                    let (name, values) = frame.series_by_index(*index).ok_or_else(|| {
                        DashboardError::SeriesNotFound {
                            series: format!("#{index}"),
                        }
                    })?;
                    OptionValue::Series { name, values }
                }
                (Stage::FirstPoint, OptionValue::Series { values, .. }) => {
                    OptionValue::Point(values.first().cloned().unwrap_or(Value::Null))
                }
                (Stage::LastPoint, OptionValue::Series { values, .. }) => {
                    OptionValue::Point(values.last().cloned().unwrap_or(Value::Null))
                }
                // Remaining combinations are rejected by parse-time typing.
                (_, value) => value,
            };
        }
        Ok(value)
    }
}

fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::token::TokenValue;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn tokens() -> BTreeMap<String, TokenValue> {
        let mut map = BTreeMap::new();
        map.insert("text_mainSPL".to_string(), TokenValue::scalar("index=main"));
        map.insert(
            "global_time".to_string(),
            TokenValue::time_range("-24h@h,now"),
        );
        map
    }

    #[test]
    fn resolves_scalar_and_field_references() {
        let template =
            Template::parse("search $text_mainSPL$ earliest=$global_time.earliest$").unwrap();
        assert_eq!(
            template.resolve(&tokens()).unwrap(),
            "search index=main earliest=-24h@h"
        );
    }

    #[test]
    fn bare_reference_to_structured_token_uses_raw_form() {
        let template = Template::parse("range: $global_time$").unwrap();
        assert_eq!(template.resolve(&tokens()).unwrap(), "range: -24h@h,now");
    }

    #[test]
    fn dollar_escapes() {
        let template = Template::parse("cost: $$12 for $text_mainSPL$").unwrap();
        assert_eq!(
            template.resolve(&tokens()).unwrap(),
            "cost: $12 for index=main"
        );
        assert_eq!(template.deps().len(), 1);
    }

    #[test]
    fn deps_are_exact() {
        let template =
            Template::parse("$text_mainSPL$ $global_time.earliest$ $global_time.latest$").unwrap();
        let deps: Vec<String> = template.deps().into_iter().collect();
        assert_eq!(deps, ["global_time", "text_mainSPL"]);
    }

    #[test]
    fn unresolved_token_is_an_error() {
        let template = Template::parse("$missing$").unwrap();
        let err = template.resolve(&tokens()).unwrap_err();
        assert!(matches!(err, DashboardError::UnresolvedToken { name } if name == "missing"));
    }

    #[test]
    fn field_access_on_scalar_fails() {
        let template = Template::parse("$text_mainSPL.earliest$").unwrap();
        let err = template.resolve(&tokens()).unwrap_err();
        assert!(matches!(err, DashboardError::InvalidFieldAccess { .. }));
    }

    #[test]
    fn unknown_field_on_structured_token_fails() {
        let template = Template::parse("$global_time.middle$").unwrap();
        let err = template.resolve(&tokens()).unwrap_err();
        assert!(
            matches!(err, DashboardError::InvalidFieldAccess { token, field }
                if token == "global_time" && field == "middle")
        );
    }

    #[test]
    fn unterminated_reference_is_rejected() {
        assert!(Template::parse("search $text_mainSPL").is_err());
    }

    #[test]
    fn deep_field_paths_are_rejected() {
        assert!(Template::parse("$a.b.c$").is_err());
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert!(Template::parse("$1bad$").is_err());
        assert!(Template::parse("$ok.2bad$").is_err());
    }

    #[test]
    fn plain_text_has_no_deps() {
        let template = Template::parse("index=_internal | stats count").unwrap();
        assert!(!template.has_refs());
        assert_eq!(template.resolve(&tokens()).unwrap(), "index=_internal | stats count");
    }

    #[test]
    fn pipeline_parses_role_and_stages() {
        let pipeline = Pipeline::parse("> annotation | seriesByName('annotationColor')").unwrap();
        assert_eq!(pipeline.role, "annotation");
        assert_eq!(
            pipeline.stages,
            vec![Stage::SeriesByName("annotationColor".to_string())]
        );
    }

    #[test]
    fn bare_role_pipeline_yields_the_frame() {
        let pipeline = Pipeline::parse("> primary").unwrap();
        assert!(pipeline.stages.is_empty());
        let frame = Arc::new(ResultSet::new(vec!["a".into()], vec![vec![json!(1)]]));
        assert_eq!(
            pipeline.evaluate(&frame).unwrap(),
            OptionValue::Frame(frame.clone())
        );
    }

    #[test]
    fn pipeline_extracts_series_and_points() {
        let frame = Arc::new(ResultSet::new(
            vec!["_time".into(), "count".into()],
            vec![
                vec![json!("t0"), json!(3)],
                vec![json!("t1"), json!(9)],
            ],
        ));
        let series = Pipeline::parse("> primary | seriesByName('count')")
            .unwrap()
            .evaluate(&frame)
            .unwrap();
        assert_eq!(
            series,
            OptionValue::Series {
                name: "count".to_string(),
                values: vec![json!(3), json!(9)],
            }
        );
        let last = Pipeline::parse("> primary | seriesByName('count') | lastPoint()")
            .unwrap()
            .evaluate(&frame)
            .unwrap();
        assert_eq!(last, OptionValue::Point(json!(9)));
        let first = Pipeline::parse("> primary | seriesByIndex(0) | firstPoint()")
            .unwrap()
            .evaluate(&frame)
            .unwrap();
        assert_eq!(first, OptionValue::Point(json!("t0")));
    }

    #[test]
    fn missing_series_is_an_error() {
        let frame = Arc::new(ResultSet::new(vec!["a".into()], vec![]));
        let err = Pipeline::parse("> primary | seriesByName('missing')")
            .unwrap()
            .evaluate(&frame)
            .unwrap_err();
        assert!(matches!(err, DashboardError::SeriesNotFound { series } if series == "missing"));
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let frame = Arc::new(ResultSet::new(vec!["a".into()], vec![]));
        let err = Pipeline::parse("> primary | seriesByIndex(4)")
            .unwrap()
            .evaluate(&frame)
            .unwrap_err();
        assert!(matches!(err, DashboardError::SeriesNotFound { .. }));
    }

    #[test]
    fn ill_ordered_stages_are_rejected_at_parse_time() {
        assert!(Pipeline::parse("> primary | firstPoint()").is_err());
        assert!(Pipeline::parse("> primary | seriesByName('a') | seriesByName('b')").is_err());
        assert!(
            Pipeline::parse("> primary | seriesByName('a') | lastPoint() | firstPoint()").is_err()
        );
    }

    #[test]
    fn malformed_stages_are_rejected() {
        assert!(Pipeline::parse("> primary | seriesByName(annotationColor)").is_err());
        assert!(Pipeline::parse("> primary | seriesByIndex('zero')").is_err());
        assert!(Pipeline::parse("> primary | explode()").is_err());
        assert!(Pipeline::parse(">").is_err());
        assert!(Pipeline::parse("> two words").is_err());
    }
}
