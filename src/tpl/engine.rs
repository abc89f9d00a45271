use std::fmt;
use std::time::Instant;

use log::{debug, trace};
use serde::Serialize;

use crate::Result;
use crate::registry::{REGISTRY, Registry};
use crate::tpl::ast::AstNode;
use crate::tpl::parser::parse_template;
use crate::tpl::render::Renderer;
use crate::tpl::render_context::Context;

const INLINE_NAME: &str = "<inline>";

/// A parsed template. Immutable once built, so one instance may be rendered
/// from many threads with independent contexts.
#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    nodes: Vec<AstNode>,
}

impl Template {
    /// Parses `source` with tags from the shared [`REGISTRY`].
    pub fn parse(source: &str) -> Result<Self> {
        Self::parse_named(INLINE_NAME, source, &REGISTRY)
    }

    pub fn parse_with(source: &str, registry: &Registry) -> Result<Self> {
        Self::parse_named(INLINE_NAME, source, registry)
    }

    /// Parses `source`, keeping `name` for diagnostics and log lines.
    pub fn parse_named(name: &str, source: &str, registry: &Registry) -> Result<Self> {
        let nodes = parse_template(source, registry)?;
        trace!("Parse: template={}, nodes={}", name, nodes.len());
        Ok(Self {
            name: name.to_string(),
            nodes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[AstNode] {
        &self.nodes
    }

    /// Executes against `ctx`, writing to `out`; filters come from the shared [`REGISTRY`].
    pub fn execute(&self, ctx: &mut Context, out: &mut dyn fmt::Write) -> Result<()> {
        self.execute_with(ctx, out, &REGISTRY)
    }

    pub fn execute_with(
        &self,
        ctx: &mut Context,
        out: &mut dyn fmt::Write,
        registry: &Registry,
    ) -> Result<()> {
        let start = Instant::now();
        let mut renderer = Renderer::new(registry, out);
        let result = renderer.render(&self.nodes, ctx);
        let elapsed = start.elapsed().as_millis();

        match &result {
            Ok(()) => debug!(
                "Render: template={}, bytes={}, elapsed={}ms",
                self.name,
                renderer.written(),
                elapsed
            ),
            Err(e) => debug!(
                "Render failed: template={}, bytes={}, elapsed={}ms, error={}",
                self.name,
                renderer.written(),
                elapsed,
                e
            ),
        }
        result
    }

    /// Executes against `ctx` and returns the produced text.
    pub fn render(&self, ctx: &mut Context) -> Result<String> {
        self.render_with(ctx, &REGISTRY)
    }

    pub fn render_with(&self, ctx: &mut Context, registry: &Registry) -> Result<String> {
        let mut out = String::new();
        self.execute_with(ctx, &mut out, registry)?;
        Ok(out)
    }
}

/// Parses `source`, binds `data` (which must serialize to a map) and renders it
/// with the shared [`REGISTRY`].
pub fn render<T: ?Sized + Serialize>(source: &str, data: &T) -> Result<String> {
    let template = Template::parse(source)?;
    let mut ctx = Context::from_serialize(data)?;
    template.render(&mut ctx)
}
