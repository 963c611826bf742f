// Definition documents: the raw serde shape and the compiled, validated form.
//
// Two representations, like the template machinery: `DashboardDefinition` is
// the JSON document as authored, `CompiledDashboard` is what mounting
// consumes: every template parsed, every reference checked, type-level
// defaults folded into each data source's options. Compiling aborts on
// structural problems (dangling references, malformed expressions, unknown
// layouts, cycles); findings that should not block the dashboard are
// collected as warning strings for the caller to log.

use crate::domain::error::DashboardError;
use crate::domain::expr::{Pipeline, Template};
use crate::domain::result::ResultSet;
use crate::domain::token::TokenValue;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

pub type JsonMap = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DashboardDefinition {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputDef>,
    #[serde(default, rename = "dataSources")]
    pub data_sources: BTreeMap<String, DataSourceDef>,
    #[serde(default)]
    pub visualizations: BTreeMap<String, VisualizationDef>,
    #[serde(default)]
    pub defaults: DefaultsDef,
    #[serde(default)]
    pub layout: LayoutSectionDef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputDef {
    #[serde(rename = "type")]
    pub kind: InputKind,
    #[serde(default)]
    pub title: String,
    pub options: InputOptionsDef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum InputKind {
    #[serde(rename = "input.text")]
    Text,
    #[serde(rename = "input.timerange")]
    TimeRange,
    #[serde(rename = "input.dropdown")]
    Dropdown,
}

impl InputKind {
    /// Convert a raw user-entered value into the token value this input
    /// drives. Time range inputs produce structured tokens with
    /// `earliest`/`latest` fields; everything else is scalar.
    pub fn token_value(&self, raw: &str) -> TokenValue {
        match self {
            InputKind::TimeRange => TokenValue::time_range(raw),
            InputKind::Text | InputKind::Dropdown => TokenValue::scalar(raw),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputOptionsDef {
    pub token: String,
    #[serde(default, rename = "defaultValue")]
    pub default_value: Option<String>,
    #[serde(default)]
    pub items: Vec<DropdownItem>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DropdownItem {
    #[serde(default)]
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataSourceDef {
    #[serde(rename = "type")]
    pub kind: DataSourceKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub options: JsonMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum DataSourceKind {
    #[serde(rename = "ds.search")]
    Search,
    #[serde(rename = "ds.static")]
    Static,
    #[serde(rename = "ds.computed")]
    Computed,
}

impl DataSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSourceKind::Search => "ds.search",
            DataSourceKind::Static => "ds.static",
            DataSourceKind::Computed => "ds.computed",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VisualizationDef {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub options: JsonMap,
    #[serde(default, rename = "dataSources")]
    pub data_sources: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultsDef {
    #[serde(default, rename = "dataSources")]
    pub data_sources: BTreeMap<String, DefaultOptionsDef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultOptionsDef {
    #[serde(default)]
    pub options: JsonMap,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LayoutSectionDef {
    #[serde(default, rename = "globalInputs")]
    pub global_inputs: Vec<String>,
    #[serde(default, rename = "layoutDefinitions")]
    pub layout_definitions: BTreeMap<String, LayoutDefinitionDef>,
    #[serde(default)]
    pub tabs: TabsDef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LayoutDefinitionDef {
    #[serde(default = "default_layout_kind", rename = "type")]
    pub kind: String,
    pub options: CanvasOptionsDef,
    #[serde(default)]
    pub structure: Vec<LayoutItemDef>,
}

fn default_layout_kind() -> String {
    "grid".to_string()
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CanvasOptionsDef {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LayoutItemDef {
    pub item: String,
    #[serde(rename = "type")]
    pub kind: LayoutItemKind,
    pub position: Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum LayoutItemKind {
    #[serde(rename = "input")]
    Input,
    #[serde(rename = "block")]
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TabsDef {
    #[serde(default)]
    pub items: Vec<TabDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TabDef {
    #[serde(default)]
    pub label: String,
    #[serde(rename = "layoutId")]
    pub layout_id: String,
}

// ---------------------------------------------------------------------------
// Compiled form

#[derive(Debug, Clone)]
pub struct CompiledDashboard {
    pub title: String,
    pub description: String,
    pub inputs: BTreeMap<String, InputSpec>,
    pub sources: BTreeMap<String, SourceSpec>,
    pub visualizations: BTreeMap<String, VizSpec>,
    pub layouts: BTreeMap<String, LayoutSpec>,
    pub tabs: Vec<TabSpec>,
    pub global_inputs: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct InputSpec {
    pub id: String,
    pub kind: InputKind,
    pub title: String,
    pub token: String,
    pub default_value: Option<String>,
    pub items: Vec<DropdownItem>,
}

#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub id: String,
    pub name: String,
    pub kind: DataSourceKind,
    pub query: Option<Template>,
    pub parameters: BTreeMap<String, Template>,
    pub inline_data: Option<ResultSet>,
    pub computed_fields: Vec<String>,
    pub computed_rows: Vec<Vec<CellExpr>>,
    /// Exact set of token names this source reads, from the parsed templates.
    pub depends_on: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellExpr {
    Literal(Value),
    Template(Template),
}

#[derive(Debug, Clone)]
pub struct VizSpec {
    pub id: String,
    pub kind: String,
    /// Role name to data source id, as declared.
    pub roles: BTreeMap<String, String>,
    pub options: BTreeMap<String, OptionExpr>,
    /// Tokens referenced by template options, for direct re-evaluation on
    /// token change.
    pub token_deps: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OptionExpr {
    Literal(Value),
    Template(Template),
    Pipeline(Pipeline),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutKind {
    Grid,
    Flow,
}

#[derive(Debug, Clone)]
pub struct LayoutSpec {
    pub id: String,
    pub kind: LayoutKind,
    pub width: u32,
    pub height: u32,
    pub items: Vec<LayoutItemSpec>,
}

#[derive(Debug, Clone)]
pub struct LayoutItemSpec {
    pub id: String,
    pub kind: LayoutItemKind,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TabSpec {
    pub label: String,
    pub layout_id: String,
}

impl DashboardDefinition {
    /// Validate the document and produce the compiled form. Structural
    /// problems abort with an error; tolerated findings come back as
    /// warnings on the compiled dashboard.
    pub fn compile(&self) -> Result<CompiledDashboard, DashboardError> {
        let mut warnings = Vec::new();

        let mut inputs = BTreeMap::new();
        let mut token_owners: BTreeMap<&str, &str> = BTreeMap::new();
        for (id, def) in &self.inputs {
            if let Some(previous) = token_owners.insert(def.options.token.as_str(), id.as_str()) {
                warnings.push(format!(
                    "inputs `{previous}` and `{id}` both drive token `{}`; the later default wins",
                    def.options.token
                ));
            }
            inputs.insert(
                id.clone(),
                InputSpec {
                    id: id.clone(),
                    kind: def.kind,
                    title: def.title.clone(),
                    token: def.options.token.clone(),
                    default_value: def.options.default_value.clone(),
                    items: def.options.items.clone(),
                },
            );
        }

        let mut sources = BTreeMap::new();
        for (id, def) in &self.data_sources {
            let options = self.effective_options(def);
            sources.insert(id.clone(), compile_source(id, def, &options)?);
        }

        let mut visualizations = BTreeMap::new();
        for (id, def) in &self.visualizations {
            visualizations.insert(id.clone(), compile_visualization(id, def, &sources)?);
        }

        let mut layouts = BTreeMap::new();
        for (layout_id, def) in &self.layout.layout_definitions {
            let kind = match def.kind.as_str() {
                "grid" => LayoutKind::Grid,
                "flow" => LayoutKind::Flow,
                other => {
                    warnings.push(format!(
                        "layout `{layout_id}`: unknown layout type `{other}`; treating as grid"
                    ));
                    LayoutKind::Grid
                }
            };
            let mut items = Vec::new();
            for item in &def.structure {
                let actual_kind = if inputs.contains_key(&item.item) {
                    LayoutItemKind::Input
                } else if visualizations.contains_key(&item.item) {
                    LayoutItemKind::Block
                } else {
                    warnings.push(format!(
                        "layout `{layout_id}`: item `{}` does not match any input or visualization; it will not be rendered",
                        item.item
                    ));
                    continue;
                };
                if actual_kind != item.kind {
                    warnings.push(format!(
                        "layout `{layout_id}`: item `{}` is declared with the wrong kind",
                        item.item
                    ));
                }
                items.push(LayoutItemSpec {
                    id: item.item.clone(),
                    kind: actual_kind,
                    position: item.position,
                });
            }
            layouts.insert(
                layout_id.clone(),
                LayoutSpec {
                    id: layout_id.clone(),
                    kind,
                    width: def.options.width,
                    height: def.options.height,
                    items,
                },
            );
        }

        let mut tabs = Vec::new();
        for tab in &self.layout.tabs.items {
            if !layouts.contains_key(&tab.layout_id) {
                return Err(DashboardError::UnknownLayout {
                    tab: tab.label.clone(),
                    layout: tab.layout_id.clone(),
                });
            }
            tabs.push(TabSpec {
                label: tab.label.clone(),
                layout_id: tab.layout_id.clone(),
            });
        }
        if tabs.is_empty() {
            // A document with layouts but no tab list still gets one tab per
            // layout, in name order.
            for id in layouts.keys() {
                tabs.push(TabSpec {
                    label: id.clone(),
                    layout_id: id.clone(),
                });
            }
        }

        let mut global_inputs = Vec::new();
        for id in &self.layout.global_inputs {
            if inputs.contains_key(id) {
                global_inputs.push(id.clone());
            } else {
                warnings.push(format!("global input `{id}` is not a declared input; ignored"));
            }
        }

        let edges = reference_edges(&inputs, &sources, &visualizations);
        if let Some(path) = detect_cycle(&edges) {
            return Err(DashboardError::CycleDetected {
                path: path.join(" -> "),
            });
        }

        Ok(CompiledDashboard {
            title: self.title.clone(),
            description: self.description.clone(),
            inputs,
            sources,
            visualizations,
            layouts,
            tabs,
            global_inputs,
            warnings,
        })
    }

    /// A data source's options with the type-level defaults folded in. The
    /// source's own keys win; nested objects merge key-wise.
    fn effective_options(&self, def: &DataSourceDef) -> JsonMap {
        let mut merged = self
            .defaults
            .data_sources
            .get(def.kind.as_str())
            .map(|defaults| defaults.options.clone())
            .unwrap_or_default();
        merge_options(&mut merged, &def.options);
        merged
    }
}

fn merge_options(base: &mut JsonMap, overlay: &JsonMap) {
    for (key, overlay_value) in overlay {
        match (base.get_mut(key), overlay_value) {
            (Some(Value::Object(base_object)), Value::Object(overlay_object)) => {
                merge_options(base_object, overlay_object);
            }
            _ => {
                base.insert(key.clone(), overlay_value.clone());
            }
        }
    }
}

fn compile_source(
    id: &str,
    def: &DataSourceDef,
    options: &JsonMap,
) -> Result<SourceSpec, DashboardError> {
    let mut depends_on = BTreeSet::new();
    let mut query = None;
    let mut parameters = BTreeMap::new();
    let mut inline_data = None;
    let mut computed_fields = Vec::new();
    let mut computed_rows = Vec::new();

    match def.kind {
        DataSourceKind::Search => {
            let Some(Value::String(text)) = options.get("query") else {
                return Err(invalid_source(id, "search sources require a string `query` option"));
            };
            let template = parse_template(text, format!("data source `{id}` query"))?;
            depends_on.extend(template.deps());
            query = Some(template);

            if let Some(params) = options.get("queryParameters") {
                let Value::Object(map) = params else {
                    return Err(invalid_source(id, "`queryParameters` must be an object"));
                };
                for (name, value) in map {
                    let Value::String(text) = value else {
                        return Err(invalid_source(
                            id,
                            &format!("query parameter `{name}` must be a string"),
                        ));
                    };
                    let template =
                        parse_template(text, format!("data source `{id}` parameter `{name}`"))?;
                    depends_on.extend(template.deps());
                    parameters.insert(name.clone(), template);
                }
            }
        }
        DataSourceKind::Static => {
            let Some(data) = options.get("data") else {
                return Err(invalid_source(id, "static sources require a `data` option"));
            };
            let frame: ResultSet = serde_json::from_value(data.clone())
                .map_err(|e| invalid_source(id, &format!("invalid inline `data`: {e}")))?;
            inline_data = Some(frame);
        }
        DataSourceKind::Computed => {
            let Some(Value::Array(fields)) = options.get("fields") else {
                return Err(invalid_source(
                    id,
                    "computed sources require a `fields` array",
                ));
            };
            for field in fields {
                let Value::String(name) = field else {
                    return Err(invalid_source(id, "`fields` entries must be strings"));
                };
                computed_fields.push(name.clone());
            }
            let Some(Value::Array(rows)) = options.get("rows") else {
                return Err(invalid_source(id, "computed sources require a `rows` array"));
            };
            for (row_index, row) in rows.iter().enumerate() {
                let Value::Array(cells) = row else {
                    return Err(invalid_source(id, "`rows` entries must be arrays"));
                };
                if cells.len() != computed_fields.len() {
                    return Err(invalid_source(
                        id,
                        &format!(
                            "row {row_index} has {} cells, expected {}",
                            cells.len(),
                            computed_fields.len()
                        ),
                    ));
                }
                let mut compiled_row = Vec::new();
                for cell in cells {
                    let expr = match cell {
                        Value::String(text) => {
                            let template = parse_template(
                                text,
                                format!("data source `{id}` row {row_index}"),
                            )?;
                            depends_on.extend(template.deps());
                            if template.has_refs() {
                                CellExpr::Template(template)
                            } else {
                                CellExpr::Literal(cell.clone())
                            }
                        }
                        other => CellExpr::Literal(other.clone()),
                    };
                    compiled_row.push(expr);
                }
                computed_rows.push(compiled_row);
            }
        }
    }

    Ok(SourceSpec {
        id: id.to_string(),
        name: if def.name.is_empty() {
            id.to_string()
        } else {
            def.name.clone()
        },
        kind: def.kind,
        query,
        parameters,
        inline_data,
        computed_fields,
        computed_rows,
        depends_on,
    })
}

fn compile_visualization(
    id: &str,
    def: &VisualizationDef,
    sources: &BTreeMap<String, SourceSpec>,
) -> Result<VizSpec, DashboardError> {
    for (role, source) in &def.data_sources {
        if !sources.contains_key(source) {
            return Err(DashboardError::DanglingDataSourceReference {
                visualization: id.to_string(),
                role: role.clone(),
                source: source.clone(),
            });
        }
    }

    let mut token_deps = BTreeSet::new();
    let mut options = BTreeMap::new();
    for (name, value) in &def.options {
        let expr = match value {
            Value::String(text) if Pipeline::looks_like(text) => {
                let pipeline = Pipeline::parse(text).map_err(|reason| {
                    DashboardError::PipelineParse {
                        context: format!("visualization `{id}` option `{name}`"),
                        reason,
                    }
                })?;
                if !def.data_sources.contains_key(&pipeline.role) {
                    return Err(DashboardError::DanglingDataSourceReference {
                        visualization: id.to_string(),
                        role: pipeline.role.clone(),
                        source: pipeline.role.clone(),
                    });
                }
                OptionExpr::Pipeline(pipeline)
            }
            Value::String(text) => {
                let template =
                    parse_template(text, format!("visualization `{id}` option `{name}`"))?;
                if template.has_refs() {
                    token_deps.extend(template.deps());
                    OptionExpr::Template(template)
                } else {
                    OptionExpr::Literal(value.clone())
                }
            }
            other => OptionExpr::Literal(other.clone()),
        };
        options.insert(name.clone(), expr);
    }

    Ok(VizSpec {
        id: id.to_string(),
        kind: def.kind.clone(),
        roles: def.data_sources.clone(),
        options,
        token_deps,
    })
}

fn parse_template(text: &str, context: String) -> Result<Template, DashboardError> {
    Template::parse(text).map_err(|reason| DashboardError::TemplateParse { context, reason })
}

fn invalid_source(id: &str, reason: &str) -> DashboardError {
    DashboardError::InvalidDataSource {
        id: id.to_string(),
        reason: reason.to_string(),
    }
}

/// Directed reference edges between inputs, tokens, sources and
/// visualizations. With the shipped reference kinds this graph is layered by
/// construction, but the cycle check below walks it anyway so the property
/// is verified structurally rather than assumed.
fn reference_edges(
    inputs: &BTreeMap<String, InputSpec>,
    sources: &BTreeMap<String, SourceSpec>,
    visualizations: &BTreeMap<String, VizSpec>,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for input in inputs.values() {
        edges
            .entry(format!("input:{}", input.id))
            .or_default()
            .insert(format!("token:{}", input.token));
    }
    for source in sources.values() {
        let node = format!("source:{}", source.id);
        for token in &source.depends_on {
            edges
                .entry(format!("token:{token}"))
                .or_default()
                .insert(node.clone());
        }
        edges.entry(node).or_default();
    }
    for viz in visualizations.values() {
        let node = format!("visualization:{}", viz.id);
        for source in viz.roles.values() {
            edges
                .entry(format!("source:{source}"))
                .or_default()
                .insert(node.clone());
        }
        for token in &viz.token_deps {
            edges
                .entry(format!("token:{token}"))
                .or_default()
                .insert(node.clone());
        }
        edges.entry(node).or_default();
    }
    edges
}

/// DFS coloring over the reference edges; returns a path when a cycle
/// exists.
fn detect_cycle(edges: &BTreeMap<String, BTreeSet<String>>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Open,
        Done,
    }

    fn visit(
        node: &str,
        edges: &BTreeMap<String, BTreeSet<String>>,
        marks: &mut BTreeMap<String, Mark>,
        stack: &mut Vec<String>,
    ) -> bool {
        match marks.get(node) {
            Some(Mark::Done) => return false,
            Some(Mark::Open) => {
                stack.push(node.to_string());
                return true;
            }
            None => {}
        }
        marks.insert(node.to_string(), Mark::Open);
        stack.push(node.to_string());
        if let Some(next) = edges.get(node) {
            for successor in next {
                if visit(successor, edges, marks, stack) {
                    return true;
                }
            }
        }
        stack.pop();
        marks.insert(node.to_string(), Mark::Done);
        false
    }

    let mut marks = BTreeMap::new();
    for node in edges.keys() {
        let mut stack = Vec::new();
        if visit(node, edges, &mut marks, &mut stack) {
            return Some(stack);
        }
    }
    None
}
