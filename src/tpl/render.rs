use std::cmp::Ordering;
use std::fmt;

use indexmap::IndexMap;

use crate::Result;
use crate::data::value::Value;
use crate::error::TplError;
use crate::registry::Registry;
use crate::tpl::ast::{AstNode, BinaryOp, Expr, UnaryOp};
use crate::tpl::lexer::Position;
use crate::tpl::render_context::Context;

/// Walks a statement tree, writing output to a forward-only sink.
///
/// Custom statements receive the renderer so they can write output and evaluate
/// expressions against the same registry.
pub struct Renderer<'r> {
    registry: &'r Registry,
    out: &'r mut dyn fmt::Write,
    written: usize,
    iterations: usize,
}

impl<'r> Renderer<'r> {
    pub fn new(registry: &'r Registry, out: &'r mut dyn fmt::Write) -> Self {
        Self {
            registry,
            out,
            written: 0,
            iterations: 0,
        }
    }

    pub fn registry(&self) -> &'r Registry {
        self.registry
    }

    /// Bytes written to the sink so far.
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn write_str(&mut self, s: &str) -> Result<()> {
        self.out.write_str(s)?;
        self.written += s.len();
        Ok(())
    }

    pub fn write_value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Str(s) => self.write_str(s),
            Value::Null => Ok(()),
            other => self.write_str(&other.to_string()),
        }
    }

    /// Evaluates `expr` against `ctx` using this renderer's registry.
    pub fn eval(&self, expr: &Expr, ctx: &Context) -> Result<Value> {
        eval_expr(expr, ctx, self.registry)
    }

    /// Executes `nodes` in document order. The first failure aborts the render;
    /// output already written stays written.
    pub fn render(&mut self, nodes: &[AstNode], ctx: &mut Context) -> Result<()> {
        for node in nodes {
            match node {
                AstNode::Text { text, .. } => self.write_str(text)?,
                AstNode::Print { expr, pos } => {
                    let value = self.eval(expr, ctx).map_err(|e| e.at(*pos))?;
                    self.write_value(&value)?;
                }
                AstNode::If {
                    branches,
                    otherwise,
                    pos,
                } => {
                    let mut matched = None;
                    for branch in branches {
                        let test = self.eval(&branch.test, ctx).map_err(|e| e.at(*pos))?;
                        if test.is_truthy() {
                            matched = Some(&branch.body);
                            break;
                        }
                    }
                    if let Some(body) = matched.or(otherwise.as_ref()) {
                        self.render(body, ctx)?;
                    }
                }
                AstNode::For {
                    first,
                    second,
                    iterable,
                    body,
                    otherwise,
                    pos,
                } => {
                    let iterable = self.eval(iterable, ctx).map_err(|e| e.at(*pos))?;
                    let is_map = matches!(iterable, Value::Map(_));
                    let items = iteration_items(iterable).map_err(|e| e.at(*pos))?;

                    if items.is_empty() {
                        if let Some(otherwise) = otherwise {
                            self.render(otherwise, ctx)?;
                        }
                        continue;
                    }

                    let length = items.len();
                    for (i, (key, item)) in items.into_iter().enumerate() {
                        self.count_iteration(ctx, *pos)?;

                        let mut bindings = Vec::with_capacity(3);
                        match second {
                            Some(second) => {
                                bindings.push((first.clone(), key));
                                bindings.push((second.clone(), item));
                            }
                            None if is_map => {
                                let mut pair = IndexMap::with_capacity(2);
                                pair.insert("key".to_string(), key);
                                pair.insert("value".to_string(), item);
                                bindings.push((first.clone(), Value::Map(pair)));
                            }
                            None => bindings.push((first.clone(), item)),
                        }
                        bindings.push(("loop".to_string(), loop_info(i, length)));

                        ctx.with_scope(bindings, |ctx| self.render(body, ctx))?;
                    }
                }
                AstNode::Custom { statement, pos, .. } => {
                    statement.execute(ctx, self).map_err(|e| e.at(*pos))?;
                }
            }
        }
        Ok(())
    }

    fn count_iteration(&mut self, ctx: &Context, pos: Position) -> Result<()> {
        self.iterations += 1;
        match ctx.options().max_iterations {
            Some(max) if self.iterations > max => Err(TplError::runtime(format!(
                "loop iteration limit of {} exceeded",
                max
            ))
            .at(pos)),
            _ => Ok(()),
        }
    }
}

/// `(index or key, item)` pairs of a `for` iterable.
fn iteration_items(iterable: Value) -> Result<Vec<(Value, Value)>> {
    match iterable {
        Value::List(items) => Ok(items
            .into_iter()
            .enumerate()
            .map(|(i, item)| (Value::I64(i as i64), item))
            .collect()),
        Value::Map(map) => Ok(map.into_iter().map(|(k, v)| (Value::Str(k), v)).collect()),
        Value::Str(s) => Ok(s
            .chars()
            .enumerate()
            .map(|(i, c)| (Value::I64(i as i64), Value::Str(c.to_string())))
            .collect()),
        other => Err(TplError::runtime(format!(
            "`for` expects a list, map or string, got {}",
            other.type_name()
        ))),
    }
}

fn loop_info(i: usize, length: usize) -> Value {
    let mut info = IndexMap::with_capacity(5);
    info.insert("index".to_string(), Value::I64(i as i64 + 1));
    info.insert("index0".to_string(), Value::I64(i as i64));
    info.insert("first".to_string(), Value::Bool(i == 0));
    info.insert("last".to_string(), Value::Bool(i + 1 == length));
    info.insert("length".to_string(), Value::I64(length as i64));
    Value::Map(info)
}

/// Evaluates an expression. Entry point for tag extensions that hold expressions.
pub fn eval_expr(expr: &Expr, ctx: &Context, registry: &Registry) -> Result<Value> {
    match expr {
        Expr::Literal(v, _) => Ok(v.clone()),
        Expr::Var(path, pos) => ctx.lookup(path).cloned().map_err(|e| e.at(*pos)),
        Expr::Unary(op, operand, pos) => {
            let v = eval_expr(operand, ctx, registry)?;
            unary_op(*op, v).map_err(|e| e.at(*pos))
        }
        Expr::Binary(BinaryOp::And, left, right, _) => {
            let l = eval_expr(left, ctx, registry)?;
            if !l.is_truthy() {
                return Ok(l);
            }
            eval_expr(right, ctx, registry)
        }
        Expr::Binary(BinaryOp::Or, left, right, _) => {
            let l = eval_expr(left, ctx, registry)?;
            if l.is_truthy() {
                return Ok(l);
            }
            eval_expr(right, ctx, registry)
        }
        Expr::Binary(op, left, right, pos) => {
            let l = eval_expr(left, ctx, registry)?;
            let r = eval_expr(right, ctx, registry)?;
            binary_op(*op, l, r).map_err(|e| e.at(*pos))
        }
        Expr::Filter {
            base,
            name,
            args,
            pos,
        } => {
            let input = eval_expr(base, ctx, registry)?;
            let Some(filter) = registry.filter(name) else {
                return Err(TplError::UnknownFilter {
                    name: name.clone(),
                    pos: Some(*pos),
                });
            };
            filter(&input, args).map_err(|message| TplError::Filter {
                name: name.clone(),
                message,
                pos: Some(*pos),
            })
        }
    }
}

fn unary_op(op: UnaryOp, v: Value) -> Result<Value> {
    match (op, v) {
        (UnaryOp::Not, v) => Ok(Value::Bool(!v.is_truthy())),
        (UnaryOp::Neg, Value::I64(n)) => n
            .checked_neg()
            .map(Value::I64)
            .ok_or_else(|| TplError::runtime("integer overflow in `-`")),
        (UnaryOp::Neg, Value::F64(n)) => Ok(Value::F64(-n)),
        (UnaryOp::Neg, other) => Err(TplError::type_mismatch(format!(
            "cannot negate a {}",
            other.type_name()
        ))),
    }
}

fn binary_op(op: BinaryOp, l: Value, r: Value) -> Result<Value> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(&l, &r))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(&l, &r))),
        BinaryOp::Lt => compare(op, &l, &r).map(|o| Value::Bool(o == Ordering::Less)),
        BinaryOp::Le => compare(op, &l, &r).map(|o| Value::Bool(o != Ordering::Greater)),
        BinaryOp::Gt => compare(op, &l, &r).map(|o| Value::Bool(o == Ordering::Greater)),
        BinaryOp::Ge => compare(op, &l, &r).map(|o| Value::Bool(o != Ordering::Less)),
        BinaryOp::In => contains(&r, &l).map(Value::Bool),
        BinaryOp::Add => add(l, r),
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => arithmetic(op, &l, &r),
        // Short-circuit operators never reach here.
        BinaryOp::And | BinaryOp::Or => Ok(r),
    }
}

/// Structural equality, with integers and floats comparing numerically.
fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::I64(a), Value::I64(b)) => a == b,
        (a, b) if a.is_number() && b.is_number() => a.as_f64() == b.as_f64(),
        (a, b) => a == b,
    }
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> Result<Ordering> {
    let ordering = match (l, r) {
        (Value::I64(a), Value::I64(b)) => Some(a.cmp(b)),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (a, b) if a.is_number() && b.is_number() => {
            a.as_f64().zip(b.as_f64()).and_then(|(x, y)| x.partial_cmp(&y))
        }
        _ => None,
    };
    ordering.ok_or_else(|| mismatch(op, l, r))
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool> {
    match (haystack, needle) {
        (Value::Str(s), Value::Str(sub)) => Ok(s.contains(sub.as_str())),
        (Value::List(items), needle) => Ok(items.iter().any(|item| values_equal(item, needle))),
        (Value::Map(map), Value::Str(key)) => Ok(map.contains_key(key)),
        _ => Err(mismatch(BinaryOp::In, needle, haystack)),
    }
}

fn add(l: Value, r: Value) -> Result<Value> {
    match (l, r) {
        (Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            Ok(Value::List(a))
        }
        (l @ Value::Str(_), r) | (l, r @ Value::Str(_)) => Ok(Value::Str(format!("{}{}", l, r))),
        (l, r) => arithmetic(BinaryOp::Add, &l, &r),
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    if matches!(op, BinaryOp::Div | BinaryOp::Rem) && r.as_f64() == Some(0.0) {
        return Err(TplError::runtime(if op == BinaryOp::Div {
            "division by zero"
        } else {
            "modulo by zero"
        }));
    }

    match (l, r) {
        (Value::I64(a), Value::I64(b)) => {
            let (a, b) = (*a, *b);
            let result = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Sub => a.checked_sub(b),
                BinaryOp::Mul => a.checked_mul(b),
                BinaryOp::Div if a.checked_rem(b).is_some_and(|m| m != 0) => {
                    return Ok(Value::F64(a as f64 / b as f64));
                }
                BinaryOp::Div => a.checked_div(b),
                BinaryOp::Rem => a.checked_rem(b),
                _ => None,
            };
            result.map(Value::I64).ok_or_else(|| {
                TplError::runtime(format!(
                    "integer overflow in `{} {} {}`",
                    a,
                    op.symbol(),
                    b
                ))
            })
        }
        (a, b) if a.is_number() && b.is_number() => {
            let (x, y) = a
                .as_f64()
                .zip(b.as_f64())
                .ok_or_else(|| mismatch(op, l, r))?;
            Ok(Value::F64(match op {
                BinaryOp::Add => x + y,
                BinaryOp::Sub => x - y,
                BinaryOp::Mul => x * y,
                BinaryOp::Div => x / y,
                _ => x % y,
            }))
        }
        _ => Err(mismatch(op, l, r)),
    }
}

fn mismatch(op: BinaryOp, l: &Value, r: &Value) -> TplError {
    TplError::type_mismatch(format!(
        "cannot apply `{}` to {} and {}",
        op.symbol(),
        l.type_name(),
        r.type_name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpl::parser::parse_template;

    fn render_with(source: &str, ctx: &mut Context, registry: &Registry) -> Result<String> {
        let nodes = parse_template(source, registry)?;
        let mut out = String::new();
        Renderer::new(registry, &mut out).render(&nodes, ctx)?;
        Ok(out)
    }

    fn render(source: &str, ctx: &mut Context) -> Result<String> {
        render_with(source, ctx, &Registry::with_builtins())
    }

    fn eval(source: &str) -> Result<Value> {
        let registry = Registry::with_builtins();
        let nodes = parse_template(&format!("{{{{ {} }}}}", source), &registry)?;
        match &nodes[0] {
            AstNode::Print { expr, .. } => eval_expr(expr, &Context::new(), &registry),
            other => panic!("expected a print statement, got {:?}", other),
        }
    }

    #[test]
    fn test_eval_expr_logic() {
        let mut ctx = Context::new();
        ctx.set("a", 10).unwrap();
        ctx.set("b", true).unwrap();
        ctx.set("name", "").unwrap();

        assert_eq!(render("{{ a == 10 }}", &mut ctx).unwrap(), "true");
        assert_eq!(render("{{ a > 5 and b }}", &mut ctx).unwrap(), "true");
        assert_eq!(render("{{ name or \"anon\" }}", &mut ctx).unwrap(), "anon");
        assert_eq!(render("{{ a and name }}", &mut ctx).unwrap(), "");
        assert_eq!(render("{{ !b }}", &mut ctx).unwrap(), "false");
    }

    #[test]
    fn test_short_circuit_skips_missing_variable() {
        let mut ctx = Context::new();
        ctx.set("flag", false).unwrap();
        assert_eq!(render("{{ flag and missing }}", &mut ctx).unwrap(), "false");
        assert!(render("{{ flag or missing }}", &mut ctx).is_err());
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("1 + 2 * 3").unwrap(), Value::I64(7));
        assert_eq!(eval("(1 + 2) * 3").unwrap(), Value::I64(9));
        assert_eq!(eval("7 / 2").unwrap(), Value::F64(3.5));
        assert_eq!(eval("8 / 2").unwrap(), Value::I64(4));
        assert_eq!(eval("7 % 3").unwrap(), Value::I64(1));
        assert_eq!(eval("1 + 0.5").unwrap(), Value::F64(1.5));
        assert_eq!(eval("-3 + 1").unwrap(), Value::I64(-2));
        assert_eq!(eval("\"a\" + 1").unwrap(), Value::Str("a1".into()));
    }

    #[test]
    fn test_arithmetic_errors() {
        let err = eval("1 / 0").unwrap_err();
        assert!(matches!(err, TplError::Runtime { .. }), "{:?}", err);
        assert!(eval("5 % 0").is_err());
        assert!(eval("9223372036854775807 + 1").is_err());

        let err = eval("true - 1").unwrap_err();
        assert!(matches!(err, TplError::TypeMismatch { .. }), "{:?}", err);
    }

    #[test]
    fn test_comparison_and_membership() {
        assert_eq!(eval("1 == 1.0").unwrap(), Value::Bool(true));
        assert_eq!(eval("2 < 10").unwrap(), Value::Bool(true));
        assert_eq!(eval("\"abc\" < \"abd\"").unwrap(), Value::Bool(true));
        assert_eq!(eval("\"ell\" in \"hello\"").unwrap(), Value::Bool(true));
        assert_eq!(eval("\"x\" != nil").unwrap(), Value::Bool(true));
        assert!(eval("1 < \"a\"").is_err());
        assert!(eval("1 in 2").is_err());
    }

    #[test]
    fn test_if_elif_else() {
        let source = "{% if n > 1 %}many{% elif n == 1 %}one{% else %}none{% endif %}";
        for (n, expected) in [(5, "many"), (1, "one"), (0, "none")] {
            let mut ctx = Context::new();
            ctx.set("n", n).unwrap();
            assert_eq!(render(source, &mut ctx).unwrap(), expected);
        }

        let mut ctx = Context::new();
        assert_eq!(
            render("[{% if false %}x{% elif 0 %}y{% endif %}]", &mut ctx).unwrap(),
            "[]"
        );
    }

    #[test]
    fn test_for_over_list_map_and_string() {
        let mut ctx = Context::new();
        ctx.set("xs", vec!["x", "y"]).unwrap();
        ctx.set("m.a", 1).unwrap();
        ctx.set("m.b", 2).unwrap();

        assert_eq!(
            render("{% for i, x in xs %}{{ i }}={{ x }};{% endfor %}", &mut ctx).unwrap(),
            "0=x;1=y;"
        );
        assert_eq!(
            render("{% for k, v in m %}{{ k }}={{ v }};{% endfor %}", &mut ctx).unwrap(),
            "a=1;b=2;"
        );
        assert_eq!(
            render("{% for e in m %}{{ e.key }}:{{ e.value }} {% endfor %}", &mut ctx).unwrap(),
            "a:1 b:2 "
        );
        assert_eq!(
            render("{% for c in \"hé\" %}[{{ c }}]{% endfor %}", &mut ctx).unwrap(),
            "[h][é]"
        );
    }

    #[test]
    fn test_for_loop_variable_and_else() {
        let mut ctx = Context::new();
        ctx.set("xs", vec![1, 2, 3]).unwrap();
        ctx.set("empty", Vec::<i64>::new()).unwrap();

        let source = "{% for x in xs %}{{ loop.index }}{% if not loop.last %},{% endif %}{% endfor %}";
        assert_eq!(render(source, &mut ctx).unwrap(), "1,2,3");
        assert_eq!(
            render("{% for x in empty %}{{ x }}{% else %}nothing{% endfor %}", &mut ctx).unwrap(),
            "nothing"
        );
        assert_eq!(render("{% for x in empty %}{{ x }}{% endfor %}", &mut ctx).unwrap(), "");
    }

    #[test]
    fn test_for_scope_is_popped() {
        let mut ctx = Context::new();
        ctx.set("xs", vec![1]).unwrap();
        assert_eq!(render("{% for x in xs %}{{ x }}{% endfor %}", &mut ctx).unwrap(), "1");
        assert_eq!(ctx.depth(), 1);
        assert!(ctx.get("x").is_err());

        let err = render("{% for x in xs %}{{ x.y }}{% endfor %}", &mut ctx).unwrap_err();
        assert!(matches!(err, TplError::TypeMismatch { .. }), "{:?}", err);
        assert_eq!(ctx.depth(), 1);
    }

    #[test]
    fn test_for_over_non_iterable() {
        let mut ctx = Context::new();
        ctx.set("n", 3).unwrap();
        let err = render("ab\n{% for x in n %}{% endfor %}", &mut ctx).unwrap_err();
        assert!(matches!(err, TplError::Runtime { .. }), "{:?}", err);
        assert_eq!(err.position(), Some(Position::new(2, 1)));
    }

    #[test]
    fn test_iteration_limit() {
        use crate::tpl::render_context::RenderOptions;

        let mut ctx = Context::with_options(RenderOptions::default().max_iterations(3));
        ctx.set("xs", vec![1, 2]).unwrap();
        let source = "{% for a in xs %}{% for b in xs %}.{% endfor %}{% endfor %}";
        let err = render(source, &mut ctx).unwrap_err();
        assert!(err.to_string().contains("iteration limit of 3"), "{}", err);
    }

    #[test]
    fn test_unknown_filter_is_positioned() {
        let mut ctx = Context::new();
        ctx.set("x", 1).unwrap();
        let err = render("a {{ x|nope }}", &mut ctx).unwrap_err();
        assert_eq!(
            err,
            TplError::UnknownFilter {
                name: "nope".to_string(),
                pos: Some(Position::new(1, 7)),
            }
        );
    }

    #[test]
    fn test_filter_failure() {
        let registry = Registry::new();
        registry.register_filter("fail", |_, _| Err("always".to_string()));
        let mut ctx = Context::new();
        let err = render_with("{{ 1|fail }}", &mut ctx, &registry).unwrap_err();
        assert!(matches!(&err, TplError::Filter { name, .. } if name == "fail"));
        assert!(err.to_string().contains("always"));
    }

    #[test]
    fn test_missing_variable_strict_and_lenient() {
        use crate::tpl::render_context::{RenderOptions, Undefined};

        let mut ctx = Context::new();
        let err = render("x\n  {{ who }}", &mut ctx).unwrap_err();
        assert_eq!(
            err,
            TplError::NotFound {
                path: "who".to_string(),
                pos: Some(Position::new(2, 6)),
            }
        );

        let mut ctx = Context::with_options(RenderOptions::default().undefined(Undefined::Lenient));
        assert_eq!(render("[{{ who }}]", &mut ctx).unwrap(), "[]");
    }

    #[test]
    fn test_partial_output_is_kept() {
        let registry = Registry::with_builtins();
        let nodes = parse_template("before {{ missing }} after", &registry).unwrap();
        let mut out = String::new();
        let mut renderer = Renderer::new(&registry, &mut out);
        assert!(renderer.render(&nodes, &mut Context::new()).is_err());
        assert_eq!(renderer.written(), 7);
        assert_eq!(out, "before ");
    }
}
