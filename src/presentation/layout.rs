// Layout engine - Canvas planning for tabs of positioned items
use crate::domain::definition::{LayoutItemKind, LayoutItemSpec, LayoutKind, LayoutSpec, TabSpec};
use crate::domain::error::DashboardError;
use std::collections::{BTreeMap, BTreeSet};

/// One item placed on the canvas, geometry already clamped.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedItem {
    pub id: String,
    pub kind: LayoutItemKind,
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// The renderable plan for one layout: canvas size, placed items in
/// declaration order, plus the dashboard-level global inputs the host shows
/// above every tab.
#[derive(Debug, Clone, PartialEq)]
pub struct CanvasPlan {
    pub layout_id: String,
    pub width: u32,
    pub height: u32,
    pub items: Vec<PlacedItem>,
    pub global_inputs: Vec<String>,
}

/// Precomputed placement plans for every layout, and the tab list over them.
pub struct LayoutEngine {
    plans: BTreeMap<String, CanvasPlan>,
    tabs: Vec<TabSpec>,
    placed_blocks: BTreeSet<String>,
}

impl LayoutEngine {
    /// Build the plans and run the geometry checks. Items reaching outside
    /// the canvas are clipped with a warning; overlapping rectangles warn but
    /// stay placed.
    pub fn new(
        layouts: BTreeMap<String, LayoutSpec>,
        tabs: Vec<TabSpec>,
        global_inputs: Vec<String>,
    ) -> (Self, Vec<String>) {
        let mut warnings = Vec::new();
        let mut plans = BTreeMap::new();
        let mut placed_blocks = BTreeSet::new();
        for (id, layout) in &layouts {
            let plan = plan_layout(layout, &global_inputs, &mut warnings);
            for item in &plan.items {
                if item.kind == LayoutItemKind::Block {
                    placed_blocks.insert(item.id.clone());
                }
            }
            plans.insert(id.clone(), plan);
        }
        (
            Self {
                plans,
                tabs,
                placed_blocks,
            },
            warnings,
        )
    }

    pub fn tabs(&self) -> &[TabSpec] {
        &self.tabs
    }

    pub fn tab(&self, index: usize) -> Result<&TabSpec, DashboardError> {
        self.tabs
            .get(index)
            .ok_or(DashboardError::UnknownTab { index })
    }

    pub fn plan(&self, tab: &TabSpec) -> Result<CanvasPlan, DashboardError> {
        self.plans
            .get(&tab.layout_id)
            .cloned()
            .ok_or_else(|| DashboardError::UnknownLayout {
                tab: tab.label.clone(),
                layout: tab.layout_id.clone(),
            })
    }

    /// Visualization ids placed as blocks in at least one layout. Only these
    /// get renderer instances.
    pub fn placed_blocks(&self) -> &BTreeSet<String> {
        &self.placed_blocks
    }
}

fn plan_layout(
    layout: &LayoutSpec,
    global_inputs: &[String],
    warnings: &mut Vec<String>,
) -> CanvasPlan {
    let mut items = Vec::new();
    match layout.kind {
        LayoutKind::Grid => {
            for item in &layout.items {
                let (placed, clipped) = clamp_rect(item, layout.width, layout.height);
                if clipped {
                    warnings.push(format!(
                        "layout `{}`: item `{}` extends outside the {}x{} canvas; clipped",
                        layout.id, item.id, layout.width, layout.height
                    ));
                }
                items.push(placed);
            }
        }
        LayoutKind::Flow => {
            // Flow stacks items top to bottom in declaration order; declared
            // x/y are ignored, widths are clipped to the canvas.
            let mut cursor = 0u32;
            for item in &layout.items {
                let declared_h = item.position.h.max(0) as u32;
                let y = cursor.min(layout.height);
                let h = declared_h.min(layout.height - y);
                if h < declared_h {
                    warnings.push(format!(
                        "layout `{}`: item `{}` flows past the {}px canvas; clipped",
                        layout.id, item.id, layout.height
                    ));
                }
                items.push(PlacedItem {
                    id: item.id.clone(),
                    kind: item.kind,
                    x: 0,
                    y,
                    w: (item.position.w.max(0) as u32).min(layout.width),
                    h,
                });
                cursor = cursor.saturating_add(declared_h);
            }
        }
    }

    for i in 0..items.len() {
        for j in i + 1..items.len() {
            if rects_overlap(&items[i], &items[j]) {
                warnings.push(format!(
                    "layout `{}`: items `{}` and `{}` overlap",
                    layout.id, items[i].id, items[j].id
                ));
            }
        }
    }

    CanvasPlan {
        layout_id: layout.id.clone(),
        width: layout.width,
        height: layout.height,
        items,
        global_inputs: global_inputs.to_vec(),
    }
}

fn clamp_rect(item: &LayoutItemSpec, width: u32, height: u32) -> (PlacedItem, bool) {
    let x = (item.position.x as i64).clamp(0, width as i64) as u32;
    let y = (item.position.y as i64).clamp(0, height as i64) as u32;
    let w = (item.position.w.max(0) as u32).min(width - x);
    let h = (item.position.h.max(0) as u32).min(height - y);
    let clipped = item.position.x as i64 != x as i64
        || item.position.y as i64 != y as i64
        || item.position.w as i64 != w as i64
        || item.position.h as i64 != h as i64;
    (
        PlacedItem {
            id: item.id.clone(),
            kind: item.kind,
            x,
            y,
            w,
            h,
        },
        clipped,
    )
}

fn rects_overlap(a: &PlacedItem, b: &PlacedItem) -> bool {
    a.x < b.x + b.w && b.x < a.x + a.w && a.y < b.y + b.h && b.y < a.y + a.h
}
