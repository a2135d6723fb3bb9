//! `#[derive(Config)]` for plain configuration structs.
//!
//! Every field carries a `#[config(...)]` attribute:
//!
//! - `default = <expr>`: value used when the key is absent (required unless
//!   `section`).
//! - `section`: the field is itself a `Config`, read from a sub-table.
//! - `hot_updated`: the field is replaced on reload.
//! - `min = <expr>` / `max = <expr>`: inclusive bounds checked by `validate`.
//!
//! On the struct, `#[config(check = <path>)]` names a
//! `fn(&Self) -> Result<(), ConfigError>` that `validate` runs after the
//! field bounds, for rules that span fields.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Expr, Fields, Type};

#[derive(Default)]
struct FieldAttrs {
    default: Option<TokenStream2>,
    hot_updated: bool,
    section: bool,
    min: Option<TokenStream2>,
    max: Option<TokenStream2>,
}

fn parse_field_attrs(attrs: &[syn::Attribute]) -> syn::Result<FieldAttrs> {
    let mut result = FieldAttrs::default();
    for attr in attrs {
        if !attr.path().is_ident("config") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("hot_updated") {
                result.hot_updated = true;
                return Ok(());
            }
            if meta.path.is_ident("section") {
                result.section = true;
                return Ok(());
            }
            if meta.path.is_ident("default") {
                let expr: Expr = meta.value()?.parse()?;
                result.default = Some(quote!(#expr));
                return Ok(());
            }
            if meta.path.is_ident("min") {
                let expr: Expr = meta.value()?.parse()?;
                result.min = Some(quote!(#expr));
                return Ok(());
            }
            if meta.path.is_ident("max") {
                let expr: Expr = meta.value()?.parse()?;
                result.max = Some(quote!(#expr));
                return Ok(());
            }
            Err(meta.error("unrecognized config attribute"))
        })?;
    }
    Ok(result)
}

fn parse_struct_check(attrs: &[syn::Attribute]) -> syn::Result<Option<TokenStream2>> {
    let mut check = None;
    for attr in attrs {
        if !attr.path().is_ident("config") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("check") {
                let expr: Expr = meta.value()?.parse()?;
                check = Some(quote!(#expr));
                return Ok(());
            }
            Err(meta.error("unrecognized config attribute"))
        })?;
    }
    Ok(check)
}

fn last_ident_is(ty: &Type, name: &str) -> bool {
    match ty {
        Type::Path(tp) => tp.path.segments.last().is_some_and(|seg| seg.ident == name),
        _ => false,
    }
}

fn is_float(ty: &Type) -> bool {
    last_ident_is(ty, "f64") || last_ident_is(ty, "f32")
}

#[proc_macro_derive(Config, attributes(config))]
pub fn derive_config(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand(input: DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let fields = match &input.data {
        Data::Struct(ds) => match &ds.fields {
            Fields::Named(named) => &named.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    name,
                    "Config derive only supports structs with named fields",
                ))
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                name,
                "Config derive only supports structs",
            ))
        }
    };

    let check_call = parse_struct_check(&input.attrs)?.map(|check| {
        quote! { (#check)(self)?; }
    });

    let mut default_fields = Vec::new();
    let mut from_toml_fields = Vec::new();
    let mut hot_update_fields = Vec::new();
    let mut render_fields = Vec::new();
    let mut validate_fields = Vec::new();

    for field in fields {
        let Some(field_name) = field.ident.as_ref() else {
            continue;
        };
        let key = field_name.to_string();
        let ty = &field.ty;
        let attrs = parse_field_attrs(&field.attrs)?;

        if attrs.section {
            default_fields.push(quote! { #field_name: <#ty as Default>::default(), });
            from_toml_fields.push(quote! {
                #field_name: match table.get(#key) {
                    Some(sub) => <#ty as ::sdp_config::Config>::from_toml(sub)?,
                    None => <#ty as Default>::default(),
                },
            });
            hot_update_fields.push(quote! {
                ::sdp_config::Config::hot_update(&mut self.#field_name, &other.#field_name);
            });
            render_fields.push(quote! {
                out.push_str(&format!("[{}]\n", #key));
                out.push_str(&::sdp_config::Config::render(&self.#field_name));
                out.push('\n');
            });
            validate_fields.push(quote! {
                ::sdp_config::Config::validate(&self.#field_name)?;
            });
            continue;
        }

        let Some(default_expr) = attrs.default else {
            return Err(syn::Error::new_spanned(
                field_name,
                "field needs #[config(default = ...)] or #[config(section)]",
            ));
        };

        if last_ident_is(ty, "String") {
            default_fields.push(quote! { #field_name: (#default_expr).to_string(), });
            from_toml_fields.push(quote! {
                #field_name: match table.get(#key) {
                    Some(v) => v
                        .as_str()
                        .ok_or_else(|| ::sdp_config::ConfigError::TypeMismatch {
                            field: #key.into(),
                            expected: "string".into(),
                        })?
                        .to_string(),
                    None => (#default_expr).to_string(),
                },
            });
            render_fields.push(quote! {
                out.push_str(&format!("{} = {:?}\n", #key, self.#field_name));
            });
        } else if last_ident_is(ty, "bool") {
            default_fields.push(quote! { #field_name: #default_expr, });
            from_toml_fields.push(quote! {
                #field_name: match table.get(#key) {
                    Some(v) => v.as_bool().ok_or_else(|| ::sdp_config::ConfigError::TypeMismatch {
                        field: #key.into(),
                        expected: "bool".into(),
                    })?,
                    None => #default_expr,
                },
            });
            render_fields.push(quote! {
                out.push_str(&format!("{} = {}\n", #key, self.#field_name));
            });
        } else {
            default_fields.push(quote! { #field_name: #default_expr, });
            from_toml_fields.push(quote! {
                #field_name: match table.get(#key) {
                    Some(v) => v
                        .as_integer()
                        .map(|n| n as #ty)
                        .or_else(|| v.as_float().map(|f| f as #ty))
                        .ok_or_else(|| ::sdp_config::ConfigError::TypeMismatch {
                            field: #key.into(),
                            expected: "number".into(),
                        })?,
                    None => #default_expr,
                },
            });
            render_fields.push(quote! {
                out.push_str(&format!("{} = {}\n", #key, self.#field_name));
            });
        }

        if attrs.hot_updated {
            hot_update_fields.push(quote! {
                self.#field_name = other.#field_name.clone();
            });
        }

        // Bounds compare in f64 for float fields and i128 otherwise, so u64
        // values above i64::MAX are not wrapped.
        let cmp_ty = if is_float(ty) { quote!(f64) } else { quote!(i128) };
        if let Some(min_expr) = attrs.min {
            validate_fields.push(quote! {
                if (self.#field_name as #cmp_ty) < (#min_expr as #cmp_ty) {
                    return Err(::sdp_config::ConfigError::OutOfRange {
                        field: #key.into(),
                        value: format!("{}", self.#field_name),
                        min: Some(format!("{}", #min_expr)),
                        max: None,
                    });
                }
            });
        }
        if let Some(max_expr) = attrs.max {
            validate_fields.push(quote! {
                if (self.#field_name as #cmp_ty) > (#max_expr as #cmp_ty) {
                    return Err(::sdp_config::ConfigError::OutOfRange {
                        field: #key.into(),
                        value: format!("{}", self.#field_name),
                        min: None,
                        max: Some(format!("{}", #max_expr)),
                    });
                }
            });
        }
    }

    Ok(quote! {
        impl #impl_generics Default for #name #ty_generics #where_clause {
            fn default() -> Self {
                Self {
                    #(#default_fields)*
                }
            }
        }

        impl #impl_generics ::sdp_config::Config for #name #ty_generics #where_clause {
            fn from_toml(value: &::sdp_config::toml::Value) -> Result<Self, ::sdp_config::ConfigError> {
                let table = value;
                Ok(Self {
                    #(#from_toml_fields)*
                })
            }

            fn hot_update(&mut self, other: &Self) {
                #(#hot_update_fields)*
            }

            fn render(&self) -> String {
                let mut out = String::new();
                #(#render_fields)*
                out
            }

            fn validate(&self) -> Result<(), ::sdp_config::ConfigError> {
                #(#validate_fields)*
                #check_call
                Ok(())
            }
        }
    })
}
