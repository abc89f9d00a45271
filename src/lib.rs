pub mod data;
pub mod error;
pub mod filters;
pub mod registry;
pub mod tags;
pub mod tpl;

#[doc(hidden)]
pub use ctor;
pub use utpl_macros::{filter, tag};

pub use data::serializer::to_value;
pub use data::value::{ToValue, Value};
pub use error::{ErrorKind, TplError};
pub use registry::{
    FilterFn, FilterResult, REGISTRY, Registry, TagParseFn, register_filter, register_tag,
};
pub use tpl::ast::{AstNode, Expr, Statement};
pub use tpl::engine::{Template, render};
pub use tpl::lexer::{Position, Token, TokenKind};
pub use tpl::parser::{ArgParser, Parser, TagHead};
pub use tpl::render::{Renderer, eval_expr};
pub use tpl::render_context::{Context, RenderOptions, Undefined};

pub type Result<T, E = TplError> = std::result::Result<T, E>;

/// Parses `source` with the shared [`REGISTRY`].
pub fn parse(source: &str) -> Result<Template> {
    Template::parse(source)
}

/// Renders `template` against `ctx` with the shared [`REGISTRY`].
pub fn execute(template: &Template, ctx: &mut Context) -> Result<String> {
    template.render(ctx)
}
