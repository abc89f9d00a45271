use std::collections::BTreeMap;
use std::sync::Arc;

use utpl::{
    ArgParser, Context, FilterResult, Parser, Position, Renderer, Statement, Template, Token,
    Value,
};

#[utpl::filter]
fn exclaim(value: &Value, args: &[String]) -> FilterResult {
    let count = match args.first() {
        Some(raw) => raw.parse::<usize>().map_err(|_| format!("bad count `{}`", raw))?,
        None => 1,
    };
    Ok(Value::Str(format!("{}{}", value, "!".repeat(count))))
}

#[utpl::filter("wrap")]
fn wrap_in_brackets(value: &Value, _args: &[String]) -> FilterResult {
    Ok(Value::Str(format!("[{}]", value)))
}

#[derive(Debug)]
struct Greet {
    who: String,
    pos: Position,
}

impl Statement for Greet {
    fn position(&self) -> Position {
        self.pos
    }

    fn describe(&self) -> String {
        format!("greet {}", self.who)
    }

    fn execute(&self, ctx: &mut Context, renderer: &mut Renderer<'_>) -> utpl::Result<()> {
        let who = ctx.get(&self.who)?.to_string();
        renderer.write_str(&format!("Hello, {}", who))
    }
}

#[utpl::tag("greet")]
fn parse_greet(
    _parser: &mut Parser<'_>,
    open: &Token,
    args: &mut ArgParser<'_>,
) -> utpl::Result<Arc<dyn Statement>> {
    let who = args.expect_ident()?;
    Ok(Arc::new(Greet {
        who,
        pos: open.pos(),
    }))
}

#[test]
fn test_filters_registered_before_main() {
    let _ = env_logger::builder().is_test(true).try_init();
    assert!(utpl::REGISTRY.has_filter("exclaim"));
    assert!(utpl::REGISTRY.has_filter("wrap"));
    assert!(!utpl::REGISTRY.has_filter("wrap_in_brackets"));

    let mut data = BTreeMap::new();
    data.insert("w", "hey");
    assert_eq!(
        utpl::render("{{ w|exclaim:2|wrap }} {{ w|exclaim }}", &data).unwrap(),
        "[hey!!] hey!"
    );
}

#[test]
fn test_tag_registered_before_main() {
    let _ = env_logger::builder().is_test(true).try_init();
    assert!(utpl::REGISTRY.has_tag("greet"));

    let template = Template::parse("{% greet name %}!").unwrap();
    let mut ctx = Context::new();
    ctx.set("name", "World").unwrap();
    assert_eq!(template.render(&mut ctx).unwrap(), "Hello, World!");

    let err = template.render(&mut Context::new()).unwrap_err();
    assert_eq!(err.position(), Some(Position::new(1, 1)));
}

#[test]
fn test_annotated_functions_stay_callable() {
    assert_eq!(
        wrap_in_brackets(&Value::I64(1), &[]),
        Ok(Value::Str("[1]".into()))
    );
}
