use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{ItemFn, LitStr, parse_macro_input};

#[derive(Clone, Copy)]
pub enum Kind {
    Filter,
    Tag,
}

impl Kind {
    fn label(self) -> &'static str {
        match self {
            Kind::Filter => "filter",
            Kind::Tag => "tag",
        }
    }
}

pub fn register_impl(kind: Kind, args: TokenStream, input: TokenStream) -> TokenStream {
    let func = parse_macro_input!(input as ItemFn);
    let ident = &func.sig.ident;

    // 1) Registered name: the string argument, or the function name.
    let name = if args.is_empty() {
        ident.to_string()
    } else {
        let lit = parse_macro_input!(args as LitStr);
        if lit.value().trim().is_empty() {
            return syn::Error::new(lit.span(), format!("{} name must not be empty", kind.label()))
                .to_compile_error()
                .into();
        }
        lit.value()
    };

    if func.sig.asyncness.is_some() || !func.sig.generics.params.is_empty() {
        return syn::Error::new_spanned(
            &func.sig,
            format!("a {} must be a plain, non-generic, non-async fn", kind.label()),
        )
        .to_compile_error()
        .into();
    }

    // 2) `#[utpl::ctor::ctor]` runs the registration at startup (before `main`).
    let register_fn = format_ident!("__utpl_register_{}_{}", kind.label(), ident);
    let register = match kind {
        Kind::Filter => quote! { utpl::REGISTRY.register_filter(#name, #ident); },
        Kind::Tag => quote! { utpl::REGISTRY.register_tag(#name, #ident); },
    };

    let output = quote! {
        #func

        #[doc(hidden)]
        #[utpl::ctor::ctor]
        fn #register_fn() {
            #register
        }
    };

    output.into()
}
