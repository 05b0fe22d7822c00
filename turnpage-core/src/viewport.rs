use std::sync::Arc;

use tracing::info;

use crate::config::LayoutConfig;
use crate::engine::{Pagination, RenderOptions, Spread};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportSize {
    pub width: u32,
    pub height: u32,
}

/// Platform-specific layout rules, chosen once when the reader starts.
pub trait ViewportAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn render_options(&self, size: ViewportSize, layout: &LayoutConfig) -> RenderOptions;
}

/// Narrow screens: one page at a time.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompactViewport;

impl ViewportAdapter for CompactViewport {
    fn name(&self) -> &'static str {
        "compact"
    }

    fn render_options(&self, size: ViewportSize, layout: &LayoutConfig) -> RenderOptions {
        RenderOptions {
            width: size.width,
            height: size.height,
            pagination: Pagination::Paginated,
            spread: Spread::None,
            gap: layout.gap,
        }
    }
}

/// Wide screens: two-page spread.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpreadViewport;

impl ViewportAdapter for SpreadViewport {
    fn name(&self) -> &'static str {
        "spread"
    }

    fn render_options(&self, size: ViewportSize, layout: &LayoutConfig) -> RenderOptions {
        RenderOptions {
            width: size.width,
            height: size.height,
            pagination: Pagination::Paginated,
            spread: Spread::Both,
            gap: layout.gap * 2,
        }
    }
}

pub fn select_viewport_adapter(
    size: ViewportSize,
    layout: &LayoutConfig,
) -> Arc<dyn ViewportAdapter> {
    let adapter: Arc<dyn ViewportAdapter> = if size.width <= layout.compact_max_width {
        Arc::new(CompactViewport)
    } else {
        Arc::new(SpreadViewport)
    };
    info!(adapter = adapter.name(), width = size.width, "selected viewport adapter");
    adapter
}
