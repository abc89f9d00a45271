mod registration;

use proc_macro::TokenStream;

/// Registers a filter function into `utpl::REGISTRY` before `main` runs.
///
/// ```ignore
/// #[utpl::filter("shout")]
/// fn shout(value: &Value, _args: &[String]) -> FilterResult {
///     Ok(Value::Str(format!("{}!", value)))
/// }
/// ```
///
/// Without a name the function's own name is used.
#[proc_macro_attribute]
pub fn filter(args: TokenStream, input: TokenStream) -> TokenStream {
    registration::register_impl(registration::Kind::Filter, args, input)
}

/// Registers a tag parse-function into `utpl::REGISTRY` before `main` runs.
#[proc_macro_attribute]
pub fn tag(args: TokenStream, input: TokenStream) -> TokenStream {
    registration::register_impl(registration::Kind::Tag, args, input)
}
