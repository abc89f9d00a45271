use crate::Result;
use crate::data::value::Value;
use crate::error::TplError;
use crate::tpl::lexer::Position;
use crate::tpl::render::Renderer;
use crate::tpl::render_context::Context;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Or => "or",
            BinaryOp::And => "and",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::In => "in",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// One step of a variable path after the root name.
#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    /// `.name` or `["name"]`
    Key(String),
    /// `[3]`, `[-1]` or `.3`
    Index(i64),
}

/// A dotted / bracket-indexed variable reference such as `user.tags[0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct VarPath {
    pub root: String,
    pub segments: Vec<PathSegment>,
}

impl VarPath {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            segments: Vec::new(),
        }
    }

    /// Parses the textual form accepted by [`Context::get`].
    ///
    /// `a.b`, `a[0]`, `a["key with spaces"]` and `a.0` are all accepted.
    pub fn parse(path: &str) -> Result<Self> {
        let invalid = |why: &str| TplError::runtime(format!("invalid variable path `{}`: {}", path, why));

        let root_end = path.find(|c: char| c == '.' || c == '[').unwrap_or(path.len());
        let root = path[..root_end].trim();
        if root.is_empty() {
            return Err(invalid("empty name"));
        }

        let mut var = VarPath::new(root);
        let mut rest = &path[root_end..];
        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('.') {
                let end = after.find(|c: char| c == '.' || c == '[').unwrap_or(after.len());
                let key = after[..end].trim();
                if key.is_empty() {
                    return Err(invalid("empty segment"));
                }
                var.segments.push(PathSegment::Key(key.to_string()));
                rest = &after[end..];
            } else if let Some(after) = rest.strip_prefix('[') {
                let end = after.find(']').ok_or_else(|| invalid("missing `]`"))?;
                let inner = after[..end].trim();
                let segment = if let Some(quoted) = inner
                    .strip_prefix('"')
                    .and_then(|s| s.strip_suffix('"'))
                    .or_else(|| inner.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
                {
                    PathSegment::Key(quoted.to_string())
                } else {
                    let index = inner
                        .parse::<i64>()
                        .map_err(|_| invalid("index must be an integer or a quoted key"))?;
                    PathSegment::Index(index)
                };
                var.segments.push(segment);
                rest = &after[end + 1..];
            } else {
                return Err(invalid("unexpected character"));
            }
        }
        Ok(var)
    }
}

impl fmt::Display for VarPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.root)?;
        for segment in &self.segments {
            match segment {
                PathSegment::Key(k) if k.chars().all(|c| c.is_alphanumeric() || c == '_') => {
                    write!(f, ".{}", k)?
                }
                PathSegment::Key(k) => write!(f, "[{:?}]", k)?,
                PathSegment::Index(i) => write!(f, "[{}]", i)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value, Position),
    Var(VarPath, Position),
    Unary(UnaryOp, Box<Expr>, Position),
    Binary(BinaryOp, Box<Expr>, Box<Expr>, Position),
    /// `base | name: arg, arg`; arguments are kept as raw token text.
    Filter {
        base: Box<Expr>,
        name: String,
        args: Vec<String>,
        pos: Position,
    },
}

impl Expr {
    pub fn pos(&self) -> Position {
        match self {
            Expr::Literal(_, pos)
            | Expr::Var(_, pos)
            | Expr::Unary(_, _, pos)
            | Expr::Binary(_, _, _, pos) => *pos,
            Expr::Filter { pos, .. } => *pos,
        }
    }
}

/// Capability contract for statements contributed by registered tags.
///
/// `execute` receives the live context of the enclosing block, so a statement may
/// bind variables that later sibling statements can see.
pub trait Statement: Send + Sync + fmt::Debug {
    fn position(&self) -> Position;

    /// Short human-readable description used in diagnostics.
    fn describe(&self) -> String;

    fn execute(&self, ctx: &mut Context, renderer: &mut Renderer<'_>) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct IfBranch {
    pub test: Expr,
    pub body: Vec<AstNode>,
}

#[derive(Debug, Clone)]
pub enum AstNode {
    Text {
        text: String,
        pos: Position,
    },
    Print {
        expr: Expr,
        pos: Position,
    },
    If {
        branches: Vec<IfBranch>,
        otherwise: Option<Vec<AstNode>>,
        pos: Position,
    },
    For {
        /// Item name, or key/index name when `second` is set.
        first: String,
        second: Option<String>,
        iterable: Expr,
        body: Vec<AstNode>,
        /// Rendered when the iterable is empty.
        otherwise: Option<Vec<AstNode>>,
        pos: Position,
    },
    Custom {
        name: String,
        statement: Arc<dyn Statement>,
        pos: Position,
    },
}

impl AstNode {
    pub fn pos(&self) -> Position {
        match self {
            AstNode::Text { pos, .. }
            | AstNode::Print { pos, .. }
            | AstNode::If { pos, .. }
            | AstNode::For { pos, .. }
            | AstNode::Custom { pos, .. } => *pos,
        }
    }
}
