//! # Accessor Derive
//!
//! `#[derive(Setters)]` generates builder-style setters for plain attribute
//! and configuration structs (decoded page-table entries, per-level attribute
//! snapshots, run configuration).

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, LitBool, parse_macro_input, spanned::Spanned};

/// Derive to generate `.set_<field>(&mut self, value: Ty) -> &mut Self` and
/// `.with_<field>(mut self, value: Ty) -> Self` for each **named** field.
///
/// `with_*` is a `const fn` unless the field is marked `non_const` (needed for
/// field types with drop glue, such as `Vec` or `Box`).
///
/// - Skipping a field: `#[setters(skip)]` or `#[setters(skip = true)]`
/// - Non-const builder: `#[setters(non_const)]`
///
/// # Example
///
/// ```
/// use utils_accessors_derive::Setters;
///
/// #[derive(Default, Setters)]
/// struct LevelFlags {
///     valid: bool,
///     read_only: bool,
///     #[setters(non_const)]
///     label: String,
///     #[setters(skip)]
///     generation: u32,
/// }
///
/// let mut f = LevelFlags::default()
///     .with_valid(true)
///     .with_read_only(true)
///     .with_label("pte".into());
/// f.set_read_only(false).set_valid(false);
/// assert!(!f.valid && !f.read_only);
/// assert_eq!(f.label, "pte");
/// assert_eq!(f.generation, 0);
/// ```
#[proc_macro_derive(Setters, attributes(setters))]
pub fn derive_generate_setters(input: TokenStream) -> TokenStream {
    let DeriveInput {
        ident,
        generics,
        data,
        ..
    } = parse_macro_input!(input as DeriveInput);

    let fields = match data {
        Data::Struct(s) => match s.fields {
            Fields::Named(n) => n.named,
            Fields::Unnamed(u) => {
                return syn::Error::new(u.span(), "Setters only supports named fields")
                    .to_compile_error()
                    .into();
            }
            Fields::Unit => {
                return syn::Error::new(ident.span(), "Setters does not apply to unit structs")
                    .to_compile_error()
                    .into();
            }
        },
        _ => {
            return syn::Error::new(ident.span(), "Setters can only be derived for structs")
                .to_compile_error()
                .into();
        }
    };

    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let mut methods = Vec::new();

    for field in fields {
        let Some(fname) = &field.ident else { continue };
        let options = match FieldOptions::parse(&field.attrs) {
            Ok(o) => o,
            Err(e) => return e.to_compile_error().into(),
        };
        if options.skip {
            continue;
        }

        let ty = &field.ty;
        let set_name = format_ident!("set_{}", fname);
        let with_name = format_ident!("with_{}", fname);
        let constness = if options.non_const {
            quote! {}
        } else {
            quote! { const }
        };

        methods.push(quote! {
            #[inline]
            pub fn #set_name(&mut self, value: #ty) -> &mut Self {
                self.#fname = value;
                self
            }

            #[inline]
            #[must_use]
            pub #constness fn #with_name(mut self, value: #ty) -> Self {
                self.#fname = value;
                self
            }
        });
    }

    let expanded = quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            #(#methods)*
        }
    };

    TokenStream::from(expanded)
}

#[derive(Default)]
struct FieldOptions {
    skip: bool,
    non_const: bool,
}

impl FieldOptions {
    fn parse(attrs: &[syn::Attribute]) -> syn::Result<Self> {
        let mut options = Self::default();
        for attr in attrs {
            if !attr.path().is_ident("setters") {
                continue;
            }

            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("skip") {
                    options.skip = flag_value(&meta)?;
                    Ok(())
                } else if meta.path.is_ident("non_const") {
                    options.non_const = flag_value(&meta)?;
                    Ok(())
                } else {
                    Err(meta.error("expected `skip` or `non_const`"))
                }
            })?;
        }
        Ok(options)
    }
}

/// Accepts both `#[setters(flag)]` and `#[setters(flag = true)]`.
fn flag_value(meta: &syn::meta::ParseNestedMeta<'_>) -> syn::Result<bool> {
    if meta.input.is_empty() || meta.input.peek(syn::Token![,]) {
        return Ok(true);
    }
    Ok(meta.value()?.parse::<LitBool>()?.value)
}
