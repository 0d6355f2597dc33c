//! # Setter Derive
//!
//! `#[derive(Setters)]` for plain flag structs such as page-entry and mapping
//! flag sets, so they can be built fluently in `const` context:
//!
//! ```
//! use utils_accessors_derive::Setters;
//!
//! #[derive(Default, Setters)]
//! struct MapFlags {
//!     /// Allow writes.
//!     writable: bool,
//!     user: bool,
//!     #[setters(skip)]
//!     sealed: bool,
//! }
//!
//! const RW: MapFlags = MapFlags { writable: false, user: false, sealed: true }.with_writable(true);
//! assert!(RW.writable && RW.sealed);
//!
//! let mut f = MapFlags::default();
//! f.set_user(true).set_writable(true);
//! assert!(f.user && f.writable);
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{Attribute, Data, DeriveInput, Field, Fields, LitBool, parse_macro_input, spanned::Spanned};

/// Generates, for every named field `x: T` not marked `#[setters(skip)]`:
///
/// - `fn set_x(&mut self, value: T) -> &mut Self`
/// - `const fn with_x(mut self, value: T) -> Self`
///
/// Field doc comments are carried over to both methods.
#[proc_macro_derive(Setters, attributes(setters))]
pub fn derive_setters(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(&input).unwrap_or_else(syn::Error::into_compile_error).into()
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let fields = named_fields(input)?;

    let mut methods = Vec::with_capacity(fields.len());
    for field in fields {
        if is_skipped(&field.attrs)? {
            continue;
        }
        methods.push(setter_pair(field));
    }

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    Ok(quote! {
        impl #impl_generics #name #ty_generics #where_clause {
            #(#methods)*
        }
    })
}

fn named_fields(input: &DeriveInput) -> syn::Result<Vec<&Field>> {
    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new(input.ident.span(), "Setters can only be derived for structs"));
    };
    match &data.fields {
        Fields::Named(named) => Ok(named.named.iter().collect()),
        Fields::Unnamed(unnamed) => Err(syn::Error::new(
            unnamed.span(),
            "Setters needs named fields",
        )),
        Fields::Unit => Err(syn::Error::new(input.ident.span(), "Setters has nothing to set on a unit struct")),
    }
}

fn setter_pair(field: &Field) -> TokenStream2 {
    let Some(name) = &field.ident else {
        return TokenStream2::new();
    };
    let ty = &field.ty;
    let docs: Vec<&Attribute> = field.attrs.iter().filter(|a| a.path().is_ident("doc")).collect();
    let set = format_ident!("set_{}", name);
    let with = format_ident!("with_{}", name);

    quote! {
        #(#docs)*
        #[inline]
        pub fn #set(&mut self, value: #ty) -> &mut Self {
            self.#name = value;
            self
        }

        #(#docs)*
        #[inline]
        #[must_use]
        pub const fn #with(mut self, value: #ty) -> Self {
            self.#name = value;
            self
        }
    }
}

/// `#[setters(skip)]` or `#[setters(skip = true)]`.
fn is_skipped(attrs: &[Attribute]) -> syn::Result<bool> {
    let mut skip = false;
    for attr in attrs.iter().filter(|a| a.path().is_ident("setters")) {
        attr.parse_nested_meta(|meta| {
            if !meta.path.is_ident("skip") {
                return Err(meta.error("unknown setters option, expected `skip`"));
            }
            skip = if meta.input.is_empty() {
                true
            } else {
                meta.value()?.parse::<LitBool>()?.value
            };
            Ok(())
        })?;
    }
    Ok(skip)
}
