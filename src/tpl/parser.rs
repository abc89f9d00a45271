use crate::Result;
use crate::data::value::Value;
use crate::error::TplError;
use crate::registry::Registry;
use crate::tpl::ast::{AstNode, BinaryOp, Expr, IfBranch, PathSegment, UnaryOp, VarPath};
use crate::tpl::lexer::{self, Position, Token, TokenKind};

/// Cursor over a bounded slice of tokens: the inside of one `{{ }}` or `{% %}`.
///
/// This is the sub-parser handed to tag parse-functions. It can never read past the
/// region it was created for.
#[derive(Debug, Clone)]
pub struct ArgParser<'a> {
    tokens: &'a [Token],
    pos: usize,
    /// Position reported once the region is exhausted (its closing delimiter).
    end: Position,
}

type OpTable = &'static [(TokenKind, &'static str, BinaryOp)];

const OR_OPS: OpTable = &[
    (TokenKind::Ident, "or", BinaryOp::Or),
    (TokenKind::Operator, "||", BinaryOp::Or),
];
const AND_OPS: OpTable = &[
    (TokenKind::Ident, "and", BinaryOp::And),
    (TokenKind::Operator, "&&", BinaryOp::And),
];
const EQUALITY_OPS: OpTable = &[
    (TokenKind::Operator, "==", BinaryOp::Eq),
    (TokenKind::Operator, "!=", BinaryOp::Ne),
];
const RELATIONAL_OPS: OpTable = &[
    (TokenKind::Operator, "<", BinaryOp::Lt),
    (TokenKind::Operator, "<=", BinaryOp::Le),
    (TokenKind::Operator, ">", BinaryOp::Gt),
    (TokenKind::Operator, ">=", BinaryOp::Ge),
    (TokenKind::Ident, "in", BinaryOp::In),
];
const ADDITIVE_OPS: OpTable = &[
    (TokenKind::Operator, "+", BinaryOp::Add),
    (TokenKind::Operator, "-", BinaryOp::Sub),
];
const MULTIPLICATIVE_OPS: OpTable = &[
    (TokenKind::Operator, "*", BinaryOp::Mul),
    (TokenKind::Operator, "/", BinaryOp::Div),
    (TokenKind::Operator, "%", BinaryOp::Rem),
];

const KEYWORDS: &[&str] = &["and", "or", "not", "in", "true", "false", "nil", "null", "none"];

impl<'a> ArgParser<'a> {
    pub fn new(tokens: &'a [Token], end: Position) -> Self {
        Self {
            tokens,
            pos: 0,
            end,
        }
    }

    pub fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    pub fn peek_is(&self, kind: TokenKind, value: Option<&str>) -> bool {
        self.peek().is_some_and(|t| t.is(kind, value))
    }

    pub fn next_token(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos)?;
        self.pos += 1;
        Some(token)
    }

    /// Consumes and returns the next token if it has `kind` (and `value`, when given).
    pub fn match_token(&mut self, kind: TokenKind, value: Option<&str>) -> Option<&'a Token> {
        if self.peek_is(kind, value) {
            self.next_token()
        } else {
            None
        }
    }

    pub fn expect(&mut self, kind: TokenKind, value: Option<&str>) -> Result<&'a Token> {
        if let Some(token) = self.match_token(kind, value) {
            return Ok(token);
        }
        let wanted = match value {
            Some(v) => format!("`{}`", v),
            None => kind.to_string(),
        };
        Err(self.error(format!("expected {}, found {}", wanted, self.describe_next())))
    }

    pub fn expect_ident(&mut self) -> Result<String> {
        self.expect(TokenKind::Ident, None).map(|t| t.value.clone())
    }

    /// Number of tokens not consumed yet.
    pub fn remaining(&self) -> usize {
        self.tokens.len() - self.pos
    }

    /// Builds a parse error at the next unconsumed token, or at the region end.
    pub fn error(&self, message: impl Into<String>) -> TplError {
        let pos = self.peek().map(Token::pos).unwrap_or(self.end);
        TplError::parse(message, pos)
    }

    /// Fails if any token of the region is left unconsumed.
    pub fn finish(&self) -> Result<()> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(TplError::parse(
                format!("unexpected tokens after expression: `{}`", token.value),
                token.pos(),
            )),
        }
    }

    fn describe_next(&self) -> String {
        match self.peek() {
            Some(t) if t.kind == TokenKind::Str => format!("string {:?}", t.value),
            Some(t) => format!("`{}`", t.value),
            None => "end of tag".to_string(),
        }
    }

    /// Parses one full expression, lowest precedence first.
    pub fn parse_expression(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr> {
        self.parse_left_assoc(OR_OPS, Self::parse_and)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        self.parse_left_assoc(AND_OPS, Self::parse_equality)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        self.parse_left_assoc(EQUALITY_OPS, Self::parse_relational)
    }

    fn parse_relational(&mut self) -> Result<Expr> {
        self.parse_left_assoc(RELATIONAL_OPS, Self::parse_additive)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        self.parse_left_assoc(ADDITIVE_OPS, Self::parse_multiplicative)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        self.parse_left_assoc(MULTIPLICATIVE_OPS, Self::parse_unary)
    }

    fn parse_left_assoc(
        &mut self,
        ops: OpTable,
        operand: fn(&mut Self) -> Result<Expr>,
    ) -> Result<Expr> {
        let mut left = operand(self)?;
        while let Some((op, pos)) = self.match_binary(ops) {
            let right = operand(self)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right), pos);
        }
        Ok(left)
    }

    fn match_binary(&mut self, ops: OpTable) -> Option<(BinaryOp, Position)> {
        let token = self.peek()?;
        let (_, _, op) = ops
            .iter()
            .find(|(kind, text, _)| token.is(*kind, Some(*text)))?;
        self.pos += 1;
        Some((*op, token.pos()))
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if let Some(token) = self.match_token(TokenKind::Operator, Some("-")) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(operand), token.pos()));
        }
        if let Some(token) = self
            .match_token(TokenKind::Operator, Some("!"))
            .or_else(|| self.match_token(TokenKind::Ident, Some("not")))
        {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand), token.pos()));
        }
        self.parse_filtered()
    }

    /// `primary ( '|' name ( ':' arg ( ',' arg )* )? )*`
    fn parse_filtered(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        while let Some(pipe) = self.match_token(TokenKind::Pipe, None) {
            let name = self.expect_ident()?;
            let mut args = Vec::new();
            if self.match_token(TokenKind::Colon, None).is_some() {
                args.push(self.parse_filter_arg()?);
                while self.match_token(TokenKind::Comma, None).is_some() {
                    args.push(self.parse_filter_arg()?);
                }
            }
            expr = Expr::Filter {
                base: Box::new(expr),
                name,
                args,
                pos: pipe.pos(),
            };
        }
        Ok(expr)
    }

    /// Filter arguments are raw token text, not expressions.
    fn parse_filter_arg(&mut self) -> Result<String> {
        if self.match_token(TokenKind::Operator, Some("-")).is_some() {
            let number = self.expect(TokenKind::Number, None)?;
            return Ok(format!("-{}", number.value));
        }
        match self.peek() {
            Some(t) if matches!(t.kind, TokenKind::Str | TokenKind::Number | TokenKind::Ident) => {
                self.pos += 1;
                Ok(t.value.clone())
            }
            _ => Err(self.error(format!(
                "expected filter argument, found {}",
                self.describe_next()
            ))),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let Some(token) = self.peek() else {
            return Err(self.error("expected expression, found end of tag"));
        };
        let pos = token.pos();

        match token.kind {
            TokenKind::Number => {
                self.pos += 1;
                Ok(Expr::Literal(parse_number(token)?, pos))
            }
            TokenKind::Str => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Str(token.value.clone()), pos))
            }
            TokenKind::LParen => {
                self.pos += 1;
                let inner = self.parse_expression()?;
                self.expect(TokenKind::RParen, None)?;
                Ok(inner)
            }
            TokenKind::Ident => match token.value.as_str() {
                "true" => {
                    self.pos += 1;
                    Ok(Expr::Literal(Value::Bool(true), pos))
                }
                "false" => {
                    self.pos += 1;
                    Ok(Expr::Literal(Value::Bool(false), pos))
                }
                "nil" | "null" | "none" => {
                    self.pos += 1;
                    Ok(Expr::Literal(Value::Null, pos))
                }
                kw if KEYWORDS.contains(&kw) => {
                    Err(self.error(format!("expected expression, found keyword `{}`", kw)))
                }
                _ => self.parse_path(),
            },
            _ => Err(self.error(format!(
                "expected expression, found {}",
                self.describe_next()
            ))),
        }
    }

    fn parse_path(&mut self) -> Result<Expr> {
        let root = self.expect(TokenKind::Ident, None)?;
        let mut path = VarPath::new(root.value.clone());

        loop {
            if self.match_token(TokenKind::Dot, None).is_some() {
                let segment = match self.next_token() {
                    Some(t) if t.kind == TokenKind::Ident => PathSegment::Key(t.value.clone()),
                    Some(t) if t.kind == TokenKind::Number => PathSegment::Index(parse_index(t)?),
                    Some(t) => {
                        return Err(TplError::parse(
                            format!("expected attribute name after `.`, found `{}`", t.value),
                            t.pos(),
                        ));
                    }
                    None => return Err(self.error("expected attribute name after `.`")),
                };
                path.segments.push(segment);
            } else if self.match_token(TokenKind::LBracket, None).is_some() {
                let negative = self.match_token(TokenKind::Operator, Some("-")).is_some();
                let segment = match self.next_token() {
                    Some(t) if t.kind == TokenKind::Number => {
                        let index = parse_index(t)?;
                        PathSegment::Index(if negative { -index } else { index })
                    }
                    Some(t) if t.kind == TokenKind::Str && !negative => {
                        PathSegment::Key(t.value.clone())
                    }
                    Some(t) => {
                        return Err(TplError::parse(
                            format!("expected index or quoted key, found `{}`", t.value),
                            t.pos(),
                        ));
                    }
                    None => return Err(self.error("expected index or quoted key")),
                };
                self.expect(TokenKind::RBracket, None)?;
                path.segments.push(segment);
            } else {
                break;
            }
        }
        Ok(Expr::Var(path, root.pos()))
    }
}

fn parse_number(token: &Token) -> Result<Value> {
    if let Ok(n) = token.value.parse::<i64>() {
        return Ok(Value::I64(n));
    }
    token
        .value
        .parse::<f64>()
        .map(Value::F64)
        .map_err(|_| TplError::parse(format!("invalid number `{}`", token.value), token.pos()))
}

fn parse_index(token: &Token) -> Result<i64> {
    token
        .value
        .parse::<i64>()
        .map_err(|_| TplError::parse(format!("invalid index `{}`", token.value), token.pos()))
}

/// The head of one `{% name args %}` tag.
#[derive(Debug, Clone)]
pub struct TagHead<'a> {
    pub name: String,
    /// The `{%` token.
    pub open: &'a Token,
    /// Tokens after the name, up to `%}`.
    pub args: ArgParser<'a>,
}

/// A block opened by a tag and not yet closed.
#[derive(Debug)]
struct OpenBlock {
    name: String,
    pos: Position,
}

/// Recursive-descent parser turning tokens into the statement tree.
///
/// Block tags push themselves on `block_stack` while their bodies are parsed, so a
/// stray or mismatched end tag can be reported against the block it failed to close.
pub struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    registry: &'a Registry,
    block_stack: Vec<OpenBlock>,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token], registry: &'a Registry) -> Self {
        Self {
            tokens,
            pos: 0,
            registry,
            block_stack: Vec::new(),
        }
    }

    pub fn registry(&self) -> &'a Registry {
        self.registry
    }

    /// Parses every token into the root statement list.
    pub fn parse(mut self) -> Result<Vec<AstNode>> {
        let (nodes, _) = self.parse_until(&[])?;
        Ok(nodes)
    }

    /// Parses the body of a block opened by `opener`, up to one of `terminators`.
    ///
    /// Returns the body and the terminating tag, whose `args` the caller must consume.
    /// Tag extensions with block semantics call this from their parse-function.
    pub fn parse_block(
        &mut self,
        name: &str,
        opener: &Token,
        terminators: &[&str],
    ) -> Result<(Vec<AstNode>, TagHead<'a>)> {
        self.block_stack.push(OpenBlock {
            name: name.to_string(),
            pos: opener.pos(),
        });
        let result = self.parse_body(terminators);
        self.block_stack.pop();
        result
    }

    fn parse_body(&mut self, terminators: &[&str]) -> Result<(Vec<AstNode>, TagHead<'a>)> {
        match self.parse_until(terminators)? {
            (nodes, Some(end)) => Ok((nodes, end)),
            (_, None) => Err(self.unclosed(terminators)),
        }
    }

    /// Parses sibling statements until EOF or a tag named in `terminators`.
    fn parse_until(
        &mut self,
        terminators: &[&str],
    ) -> Result<(Vec<AstNode>, Option<TagHead<'a>>)> {
        let tokens = self.tokens;
        let mut nodes = Vec::new();

        while let Some(token) = tokens.get(self.pos) {
            match token.kind {
                TokenKind::Text => {
                    self.pos += 1;
                    nodes.push(AstNode::Text {
                        text: token.value.clone(),
                        pos: token.pos(),
                    });
                }
                TokenKind::ExprOpen => {
                    let mut args = self.region(TokenKind::ExprClose)?;
                    if args.remaining() == 0 {
                        return Err(TplError::parse("empty expression `{{ }}`", token.pos()));
                    }
                    let expr = args.parse_expression()?;
                    args.finish()?;
                    nodes.push(AstNode::Print {
                        expr,
                        pos: token.pos(),
                    });
                }
                TokenKind::TagOpen => {
                    let head = self.read_tag()?;
                    if terminators.contains(&head.name.as_str()) {
                        return Ok((nodes, Some(head)));
                    }
                    if self.is_block_end(&head.name) {
                        return Err(self.mismatched(&head));
                    }
                    nodes.push(self.parse_tag(head)?);
                }
                _ => {
                    return Err(TplError::parse(
                        format!("unexpected {} outside of a block", token.kind),
                        token.pos(),
                    ));
                }
            }
        }

        Ok((nodes, None))
    }

    /// Consumes an opener through its matching `close` token and returns the
    /// tokens in between.
    fn region(&mut self, close: TokenKind) -> Result<ArgParser<'a>> {
        let tokens = self.tokens;
        let open = &tokens[self.pos];
        let start = self.pos + 1;
        let Some(offset) = tokens[start..].iter().position(|t| t.kind == close) else {
            return Err(TplError::parse(
                format!("unterminated `{}` block", open.value),
                open.pos(),
            ));
        };
        let end = start + offset;
        self.pos = end + 1;
        Ok(ArgParser::new(&tokens[start..end], tokens[end].pos()))
    }

    fn read_tag(&mut self) -> Result<TagHead<'a>> {
        let tokens = self.tokens;
        let open = &tokens[self.pos];
        let mut args = self.region(TokenKind::TagClose)?;
        let name = match args.match_token(TokenKind::Ident, None) {
            Some(t) => t.value.clone(),
            None => return Err(args.error("expected tag name")),
        };
        Ok(TagHead { name, open, args })
    }

    fn parse_tag(&mut self, head: TagHead<'a>) -> Result<AstNode> {
        match head.name.as_str() {
            "if" => self.parse_if(head),
            "for" => self.parse_for(head),
            _ => self.parse_custom(head),
        }
    }

    fn parse_custom(&mut self, head: TagHead<'a>) -> Result<AstNode> {
        let TagHead {
            name,
            open,
            mut args,
        } = head;
        let Some(parse_fn) = self.registry.tag(&name) else {
            return Err(TplError::parse(format!("unknown tag `{}`", name), open.pos()));
        };
        let statement = parse_fn(self, open, &mut args)?;
        args.finish()?;
        Ok(AstNode::Custom {
            name,
            statement,
            pos: open.pos(),
        })
    }

    fn parse_if(&mut self, head: TagHead<'a>) -> Result<AstNode> {
        let pos = head.open.pos();
        let mut args = head.args;
        let test = args.parse_expression()?;
        args.finish()?;

        self.block_stack.push(OpenBlock {
            name: "if".to_string(),
            pos,
        });
        let result = self.parse_if_branches(test, pos);
        self.block_stack.pop();
        result
    }

    fn parse_if_branches(&mut self, mut test: Expr, pos: Position) -> Result<AstNode> {
        let mut branches = Vec::new();
        loop {
            let (body, end) = self.parse_body(&["elif", "else", "endif"])?;
            branches.push(IfBranch { test, body });
            let mut end_args = end.args;
            match end.name.as_str() {
                "elif" => {
                    test = end_args.parse_expression()?;
                    end_args.finish()?;
                }
                "else" => {
                    end_args.finish()?;
                    let (otherwise, endif) = self.parse_body(&["endif"])?;
                    endif.args.finish()?;
                    return Ok(AstNode::If {
                        branches,
                        otherwise: Some(otherwise),
                        pos,
                    });
                }
                _ => {
                    end_args.finish()?;
                    return Ok(AstNode::If {
                        branches,
                        otherwise: None,
                        pos,
                    });
                }
            }
        }
    }

    fn parse_for(&mut self, head: TagHead<'a>) -> Result<AstNode> {
        let pos = head.open.pos();
        let mut args = head.args;
        let first = args.expect_ident()?;
        let second = match args.match_token(TokenKind::Comma, None) {
            Some(_) => Some(args.expect_ident()?),
            None => None,
        };
        args.expect(TokenKind::Ident, Some("in"))?;
        let iterable = args.parse_expression()?;
        args.finish()?;

        self.block_stack.push(OpenBlock {
            name: "for".to_string(),
            pos,
        });
        let bodies = self.parse_for_bodies();
        self.block_stack.pop();
        let (body, otherwise) = bodies?;

        Ok(AstNode::For {
            first,
            second,
            iterable,
            body,
            otherwise,
            pos,
        })
    }

    fn parse_for_bodies(&mut self) -> Result<(Vec<AstNode>, Option<Vec<AstNode>>)> {
        let (body, end) = self.parse_body(&["else", "endfor"])?;
        end.args.finish()?;
        if end.name != "else" {
            return Ok((body, None));
        }
        let (otherwise, endfor) = self.parse_body(&["endfor"])?;
        endfor.args.finish()?;
        Ok((body, Some(otherwise)))
    }

    /// Built-in continuations and `end*` names nobody registered close a block;
    /// a registered `endnote` is an ordinary tag.
    fn is_block_end(&self, name: &str) -> bool {
        match name {
            "else" | "elif" | "endif" | "endfor" => true,
            _ => name.starts_with("end") && !self.registry.has_tag(name),
        }
    }

    fn mismatched(&self, head: &TagHead<'a>) -> TplError {
        let message = match self.block_stack.last() {
            Some(open) => format!(
                "mismatched `{{% {} %}}` at {}: `{{% {} %}}` opened at {} is still open",
                head.name,
                head.open.pos(),
                open.name,
                open.pos
            ),
            None => format!("unexpected `{{% {} %}}` with no open block", head.name),
        };
        TplError::parse(message, head.open.pos())
    }

    fn unclosed(&self, terminators: &[&str]) -> TplError {
        let expected = terminators
            .iter()
            .map(|t| format!("`{{% {} %}}`", t))
            .collect::<Vec<_>>()
            .join(" or ");
        match self.block_stack.last() {
            Some(open) => TplError::parse(
                format!(
                    "unclosed `{{% {} %}}` opened at {}: expected {}",
                    open.name, open.pos, expected
                ),
                open.pos,
            ),
            None => {
                let pos = self.tokens.last().map(Token::pos).unwrap_or_default();
                TplError::parse(format!("unexpected end of template: expected {}", expected), pos)
            }
        }
    }
}


/// Tokenizes and parses `source` into root statements, dispatching custom tags
/// through `registry`.
pub fn parse_template(source: &str, registry: &Registry) -> Result<Vec<AstNode>> {
    let tokens = lexer::tokenize(source)?;
    Parser::new(&tokens, registry).parse()
}
