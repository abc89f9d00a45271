//! Built-in tags, registered the same way host extensions register theirs.

use std::sync::Arc;

use crate::Result;
use crate::registry::Registry;
use crate::tpl::ast::{AstNode, Expr, Statement};
use crate::tpl::lexer::{Position, Token, TokenKind};
use crate::tpl::parser::{ArgParser, Parser};
use crate::tpl::render::Renderer;
use crate::tpl::render_context::Context;

pub(crate) fn register_builtins(registry: &Registry) {
    registry.register_tag("set", parse_set);
    registry.register_tag("with", parse_with);
}

/// `{% set name = expr %}`
#[derive(Debug)]
pub struct SetStatement {
    name: String,
    value: Expr,
    pos: Position,
}

impl Statement for SetStatement {
    fn position(&self) -> Position {
        self.pos
    }

    fn describe(&self) -> String {
        format!("set {}", self.name)
    }

    fn execute(&self, ctx: &mut Context, renderer: &mut Renderer<'_>) -> Result<()> {
        let value = renderer.eval(&self.value, ctx)?;
        ctx.bind(self.name.clone(), value);
        Ok(())
    }
}

pub fn parse_set(
    _parser: &mut Parser<'_>,
    open: &Token,
    args: &mut ArgParser<'_>,
) -> Result<Arc<dyn Statement>> {
    let name = args.expect_ident()?;
    args.expect(TokenKind::Assign, None)?;
    let value = args.parse_expression()?;
    Ok(Arc::new(SetStatement {
        name,
        value,
        pos: open.pos(),
    }))
}

/// `{% with name = expr %} ... {% endwith %}`
#[derive(Debug)]
pub struct WithStatement {
    name: String,
    value: Expr,
    body: Vec<AstNode>,
    pos: Position,
}

impl Statement for WithStatement {
    fn position(&self) -> Position {
        self.pos
    }

    fn describe(&self) -> String {
        format!("with {}", self.name)
    }

    fn execute(&self, ctx: &mut Context, renderer: &mut Renderer<'_>) -> Result<()> {
        let value = renderer.eval(&self.value, ctx)?;
        ctx.with_scope([(self.name.clone(), value)], |ctx| {
            renderer.render(&self.body, ctx)
        })
    }
}

pub fn parse_with(
    parser: &mut Parser<'_>,
    open: &Token,
    args: &mut ArgParser<'_>,
) -> Result<Arc<dyn Statement>> {
    let name = args.expect_ident()?;
    args.expect(TokenKind::Assign, None)?;
    let value = args.parse_expression()?;
    args.finish()?;

    let (body, end) = parser.parse_block("with", open, &["endwith"])?;
    end.args.finish()?;
    Ok(Arc::new(WithStatement {
        name,
        value,
        body,
        pos: open.pos(),
    }))
}
