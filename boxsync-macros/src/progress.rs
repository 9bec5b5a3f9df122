use proc_macro::TokenStream;
use proc_macro2::{Delimiter, Group, TokenStream as TokenStream2, TokenTree};
use quote::quote;
use syn::parse::Parser;
use syn::{Attribute, Expr, ItemFn};

#[derive(Default)]
struct ProgressArgs {
    message: Option<Expr>,
    finished: Option<Expr>,
}

pub(crate) fn expand(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut args = ProgressArgs::default();
    let parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("message") {
            args.message = Some(meta.value()?.parse()?);
            Ok(())
        } else if meta.path.is_ident("finished") {
            args.finished = Some(meta.value()?.parse()?);
            Ok(())
        } else {
            Err(meta.error("expected `message` or `finished`"))
        }
    });
    if let Err(error) = parser.parse(attr) {
        return error.to_compile_error().into();
    }

    let mut func = match syn::parse::<ItemFn>(item) {
        Ok(func) => func,
        Err(error) => return error.to_compile_error().into(),
    };

    let (Some(message), Some(finished)) = (args.message, args.finished) else {
        return syn::Error::new_spanned(
            &func.sig.ident,
            "#[progress] requires both `message` and `finished`",
        )
        .to_compile_error()
        .into();
    };

    match func
        .attrs
        .iter_mut()
        .find(|attr| attr.path().is_ident("instrument"))
    {
        Some(instrument) => mark_progress_span(instrument),
        None => func
            .attrs
            .push(syn::parse_quote!(#[tracing::instrument(fields(progress = true))])),
    }

    let body = std::mem::take(&mut func.block.stmts);
    func.block = syn::parse_quote!({
        {
            use tracing_indicatif::span_ext::IndicatifSpanExt as _;
            let span = tracing::Span::current();
            span.pb_set_message(#message);
            span.pb_set_finish_message(&#finished);
        }
        #(#body)*
    });

    quote!(#func).into()
}

/// Rewrites an `#[instrument(...)]` attribute so its span declares `progress = true`.
fn mark_progress_span(attr: &mut Attribute) {
    let tokens = match &attr.meta {
        syn::Meta::List(list) => with_progress_field(list.tokens.clone()),
        syn::Meta::Path(_) => quote!(fields(progress = true)),
        syn::Meta::NameValue(_) => return,
    };
    *attr = syn::parse_quote!(#[instrument(#tokens)]);
}

fn with_progress_field(tokens: TokenStream2) -> TokenStream2 {
    let mut rewritten = Vec::new();
    let mut has_fields = false;
    let mut trees = tokens.into_iter().peekable();

    while let Some(tree) = trees.next() {
        let is_fields = matches!(&tree, TokenTree::Ident(ident) if ident == "fields");
        let next_is_group = matches!(
            trees.peek(),
            Some(TokenTree::Group(group)) if group.delimiter() == Delimiter::Parenthesis
        );
        rewritten.push(tree);
        if !(is_fields && next_is_group) {
            continue;
        }

        let Some(TokenTree::Group(group)) = trees.next() else {
            continue;
        };
        let inner = group.stream();
        let extended = if inner.is_empty() {
            quote!(progress = true)
        } else {
            quote!(#inner, progress = true)
        };
        rewritten.push(TokenTree::Group(Group::new(Delimiter::Parenthesis, extended)));
        has_fields = true;
    }

    let rewritten: TokenStream2 = rewritten.into_iter().collect();
    match (has_fields, rewritten.is_empty()) {
        (true, _) => rewritten,
        (false, true) => quote!(fields(progress = true)),
        (false, false) => quote!(#rewritten, fields(progress = true)),
    }
}
