use serde::Serialize;
use std::collections::BTreeMap;
use utpl::{Context, ErrorKind, Position, Registry, Template, TplError, Value};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn number_arg(args: &[String]) -> Result<i64, String> {
    let raw = args.first().ok_or("missing argument")?;
    raw.parse::<i64>()
        .map_err(|_| format!("`{}` is not an integer", raw))
}

fn arithmetic_registry() -> Registry {
    let registry = Registry::with_builtins();
    registry.register_filter("addN", |value, args| match value {
        Value::I64(n) => Ok(Value::I64(n + number_arg(args)?)),
        other => Err(format!("expected integer, got {}", other.type_name())),
    });
    registry.register_filter("mulN", |value, args| match value {
        Value::I64(n) => Ok(Value::I64(n * number_arg(args)?)),
        other => Err(format!("expected integer, got {}", other.type_name())),
    });
    registry
}

#[test]
fn test_hello_world() {
    init_logger();
    let mut data = BTreeMap::new();
    data.insert("name", "World");
    assert_eq!(
        utpl::render("Hello, {{ name }}!", &data).unwrap(),
        "Hello, World!"
    );
}

#[test]
fn test_registered_repeat_filter() {
    init_logger();
    utpl::register_filter("repeat", |value, args| {
        let times = number_arg(args)?;
        let times = usize::try_from(times).map_err(|_| "count must not be negative".to_string())?;
        Ok(Value::Str(value.to_string().repeat(times)))
    });

    let mut data = BTreeMap::new();
    data.insert("word", "ha");
    assert_eq!(
        utpl::render("{{ word|repeat:3 }}", &data).unwrap(),
        "hahaha"
    );
}

#[derive(Serialize)]
struct Items {
    items: Vec<&'static str>,
}

#[test]
fn test_if_for_else() {
    init_logger();
    let source = "{% if items %}Items:\n{% for i, item in items %}  {{ i }}: {{ item }}\n{% endfor %}{% else %}No items.{% endif %}";
    let template = Template::parse(source).unwrap();

    let mut ctx = Context::from_serialize(&Items {
        items: vec!["foo", "bar", "baz"],
    })
    .unwrap();
    assert_eq!(
        template.render(&mut ctx).unwrap(),
        "Items:\n  0: foo\n  1: bar\n  2: baz\n"
    );

    let mut ctx = Context::from_serialize(&Items { items: vec![] }).unwrap();
    assert_eq!(template.render(&mut ctx).unwrap(), "No items.");
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct User {
    first_name: String,
    last_name: String,
}

#[derive(Serialize)]
struct Person {
    first_name: String,
    last_name: String,
}

#[test]
fn test_capitalized_names() {
    init_logger();
    let source = "{{ user.firstName|capitalize }} {{ user.lastName|capitalize }}";

    let mut data = BTreeMap::new();
    data.insert(
        "user",
        User {
            first_name: "john".into(),
            last_name: "doe".into(),
        },
    );
    assert_eq!(utpl::render(source, &data).unwrap(), "John Doe");

    // Keys match exactly; `firstName` does not find a `first_name` field.
    let mut data = BTreeMap::new();
    data.insert(
        "user",
        Person {
            first_name: "john".into(),
            last_name: "doe".into(),
        },
    );
    let err = utpl::render(source, &data).unwrap_err();
    assert_eq!(
        err,
        TplError::NotFound {
            path: "user.firstName".to_string(),
            pos: Some(Position::new(1, 4)),
        }
    );
    assert_eq!(
        utpl::render("{{ user.first_name|capitalize }}", &data).unwrap(),
        "John"
    );
}

#[test]
fn test_custom_set_tag_mutates_context() {
    init_logger();
    use std::sync::Arc;
    use utpl::{ArgParser, Expr, Parser, Renderer, Statement, Token, TokenKind};

    #[derive(Debug)]
    struct Assign {
        name: String,
        value: Expr,
        pos: Position,
    }

    impl Statement for Assign {
        fn position(&self) -> Position {
            self.pos
        }

        fn describe(&self) -> String {
            format!("assign {}", self.name)
        }

        fn execute(&self, ctx: &mut Context, renderer: &mut Renderer<'_>) -> utpl::Result<()> {
            let value = renderer.eval(&self.value, ctx)?;
            ctx.bind(self.name.clone(), value);
            Ok(())
        }
    }

    let registry = Registry::new();
    registry.register_tag(
        "set",
        |_parser: &mut Parser<'_>, open: &Token, args: &mut ArgParser<'_>| {
            let name = args.expect_ident()?;
            args.expect(TokenKind::Assign, None)?;
            let value = args.parse_expression()?;
            let statement: Arc<dyn Statement> = Arc::new(Assign {
                name,
                value,
                pos: open.pos(),
            });
            Ok(statement)
        },
    );

    let template =
        Template::parse_with("{% set greeting = \"Hello\" %}{{ greeting }}, World!", &registry)
            .unwrap();
    assert_eq!(
        template.render_with(&mut Context::new(), &registry).unwrap(),
        "Hello, World!"
    );
}

#[test]
fn test_filter_chain_is_left_to_right() {
    init_logger();
    let registry = arithmetic_registry();
    let template = Template::parse_with("{{ 2|addN:3|mulN:4 }}", &registry).unwrap();
    assert_eq!(
        template.render_with(&mut Context::new(), &registry).unwrap(),
        "20"
    );
}

#[test]
fn test_two_name_for_bindings() {
    init_logger();
    let mut ctx = Context::new();
    ctx.set("m.a", 1).unwrap();
    ctx.set("m.b", 2).unwrap();
    ctx.set("xs", vec!["x", "y"]).unwrap();

    let template = Template::parse("{% for k, v in m %}({{ k }},{{ v }}){% endfor %}").unwrap();
    assert_eq!(template.render(&mut ctx).unwrap(), "(a,1)(b,2)");

    let template = Template::parse("{% for i, x in xs %}({{ i }},{{ x }}){% endfor %}").unwrap();
    assert_eq!(template.render(&mut ctx).unwrap(), "(0,x)(1,y)");
}

#[test]
fn test_unregistered_names_are_positioned_errors() {
    init_logger();
    let registry = Registry::with_builtins();

    let err = Template::parse_with("ok\n {% frobnicate 1 %}", &registry).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parse);
    assert_eq!(err.position(), Some(Position::new(2, 2)));
    assert!(err.to_string().contains("unknown tag `frobnicate`"), "{}", err);

    // Filters are resolved at render time, so parsing succeeds.
    let template = Template::parse_with("{{ 1|frobnicate }}", &registry).unwrap();
    let err = template
        .render_with(&mut Context::new(), &registry)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Runtime);
    assert!(err.to_string().contains("unknown filter `frobnicate`"), "{}", err);
    assert_eq!(err.position(), Some(Position::new(1, 5)));
}

#[test]
fn test_filter_registered_after_parse() {
    init_logger();
    let registry = Registry::new();
    let template = Template::parse_with("{{ \"x\"|late }}", &registry).unwrap();
    assert!(template.render_with(&mut Context::new(), &registry).is_err());

    registry.register_filter("late", |_, _| Ok(Value::Str("on time".into())));
    assert_eq!(
        template.render_with(&mut Context::new(), &registry).unwrap(),
        "on time"
    );
}

#[test]
fn test_set_then_get() {
    let mut ctx = Context::new();
    let cases = [
        ("title", Value::Str("x".into())),
        ("a.b.c", Value::I64(3)),
        ("a.b.d", Value::F64(0.5)),
        ("flags", Value::List(vec![Value::Bool(true)])),
        ("flags[0]", Value::Bool(false)),
        ("nothing", Value::Null),
    ];
    for (path, value) in cases {
        ctx.set(path, value.clone()).unwrap();
        assert_eq!(ctx.get(path).unwrap(), &value, "path {}", path);
    }
}

#[test]
fn test_lex_and_parse_errors() {
    init_logger();
    let err = Template::parse("a {{ name").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Lex);
    assert_eq!(err.position(), Some(Position::new(1, 3)));

    let err = Template::parse("{{ \"open }}").unwrap_err();
    assert!(matches!(err, TplError::Lex { .. }), "{:?}", err);

    let err = Template::parse("{% for x in xs %}{% endif %}").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parse);
    let message = err.to_string();
    assert!(message.contains("endif"), "{}", message);
    assert!(message.contains("line 1, column 1"), "{}", message);
}

#[test]
fn test_display_forms() {
    let mut ctx = Context::new();
    ctx.set("n", 42).unwrap();
    ctx.set("f", 1.5).unwrap();
    ctx.set("b", false).unwrap();
    ctx.set("nothing", Value::Null).unwrap();
    ctx.set("xs", vec![1, 2]).unwrap();

    let template = Template::parse("{{ n }}|{{ f }}|{{ b }}|{{ nothing }}|{{ xs }}").unwrap();
    assert_eq!(template.render(&mut ctx).unwrap(), "42|1.5|false||[1, 2]");
}

#[test]
fn test_stray_comment_opener_is_literal() {
    init_logger();
    let data: BTreeMap<&str, &str> = BTreeMap::new();
    assert_eq!(utpl::render("a {# b", &data).unwrap(), "a {# b");
    assert_eq!(utpl::render("a {# b #}c", &data).unwrap(), "a c");
}
