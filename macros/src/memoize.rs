use syn::parse::{Parse, ParseStream};

use super::*;

/// The attribute's arguments: `name = "..."`, at most once.
pub struct Meta {
    name: Option<syn::LitStr>,
}

impl Parse for Meta {
    fn parse(input: ParseStream) -> Result<Self> {
        let mut meta = Meta { name: None };
        while !input.is_empty() {
            let key: syn::Ident = input.parse()?;
            let _: syn::Token![=] = input.parse()?;
            if key != "name" {
                bail!(key, "unknown argument `{}`", key);
            }
            if meta.name.is_some() {
                bail!(key, "`name` given twice");
            }

            let name: syn::LitStr = input.parse()?;
            if name.value().is_empty() {
                bail!(name, "name must not be empty");
            }
            meta.name = Some(name);

            if !input.is_empty() {
                let _: syn::Token![,] = input.parse()?;
            }
        }
        Ok(meta)
    }
}

/// Memoize a function.
pub fn expand(meta: Meta, mut func: syn::ItemFn) -> Result<proc_macro2::TokenStream> {
    if let Some(asyncness) = &func.sig.asyncness {
        bail!(asyncness, "async functions are not supported");
    }

    if !func.sig.generics.params.is_empty() {
        bail!(func.sig.generics, "generic functions are not supported");
    }

    let mut args = vec![];
    for input in &func.sig.inputs {
        let typed = match input {
            syn::FnArg::Typed(typed) => typed,
            syn::FnArg::Receiver(_) => {
                bail!(input, "methods are not supported")
            }
        };

        let name = match typed.pat.as_ref() {
            syn::Pat::Ident(syn::PatIdent {
                by_ref: None,
                mutability: None,
                ident,
                subpat: None,
                ..
            }) => ident,
            pat => bail!(pat, "only simple identifiers are supported"),
        };

        args.push(name);
    }

    // The token text doubles as the function's code fingerprint.
    let source = quote! { #func }.to_string();

    let ident = &func.sig.ident;
    let name = match &meta.name {
        Some(name) => quote! { #name },
        None => quote! { concat!(module_path!(), "::", stringify!(#ident)) },
    };

    let output = match &func.sig.output {
        syn::ReturnType::Default => quote! { () },
        syn::ReturnType::Type(_, ty) => quote! { #ty },
    };

    // Construct a tuple from all arguments.
    let arg_tuple = quote! { (#(#args,)*) };

    // Adjust the function's body.
    let body = &func.block;
    func.block = parse_quote! { {
        // Registered at link time, so callers know this function's
        // fingerprint before it runs.
        #[::incmemo::internal::linkme::distributed_slice(::incmemo::internal::CODE_UNITS)]
        #[linkme(crate = ::incmemo::internal::linkme)]
        static __INCMEMO_UNIT: ::incmemo::internal::CodeUnit = ::incmemo::internal::CodeUnit {
            name: #name,
            source: #source,
        };

        ::incmemo::internal::memoized(
            __INCMEMO_UNIT.name,
            __INCMEMO_UNIT.source,
            #arg_tuple,
            |#arg_tuple| -> #output #body,
        )
    } };

    Ok(quote! { #func })
}
