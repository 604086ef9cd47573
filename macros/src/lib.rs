use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields, LitStr};

/// 字段上的 `#[bind(...)]` 属性
enum FieldSpec {
    Scalar { key: LitStr, default: Option<LitStr> },
    Nested { prefix: LitStr },
    Skip,
}

fn parse_field_spec(field: &syn::Field) -> syn::Result<FieldSpec> {
    let mut key = None;
    let mut default = None;
    let mut prefix = None;
    let mut nested = false;
    let mut skip = false;

    for attr in field.attrs.iter().filter(|a| a.path().is_ident("bind")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("key") {
                key = Some(meta.value()?.parse::<LitStr>()?);
            } else if meta.path.is_ident("default") {
                default = Some(meta.value()?.parse::<LitStr>()?);
            } else if meta.path.is_ident("prefix") {
                prefix = Some(meta.value()?.parse::<LitStr>()?);
            } else if meta.path.is_ident("nested") {
                nested = true;
            } else if meta.path.is_ident("skip") {
                skip = true;
            } else {
                return Err(meta.error("expected `key`, `default`, `nested`, `prefix` or `skip`"));
            }
            Ok(())
        })?;
    }

    let span = field.ident.as_ref().map(|i| i.span()).unwrap_or_else(proc_macro2::Span::call_site);
    match (key, nested, skip) {
        (_, _, true) => Ok(FieldSpec::Skip),
        (Some(key), false, false) => {
            if prefix.is_some() {
                return Err(syn::Error::new(span, "`prefix` only applies to `nested` fields"));
            }
            Ok(FieldSpec::Scalar { key, default })
        }
        (None, true, false) => {
            if default.is_some() {
                return Err(syn::Error::new(span, "`default` does not apply to `nested` fields"));
            }
            Ok(FieldSpec::Nested {
                prefix: prefix.unwrap_or_else(|| LitStr::new("", span)),
            })
        }
        (Some(_), true, false) => Err(syn::Error::new(span, "a field cannot have both `key` and `nested`")),
        (None, false, false) => Err(syn::Error::new(
            span,
            "missing #[bind(key = \"...\")], #[bind(nested)] or #[bind(skip)]",
        )),
    }
}

fn expand(input: DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let struct_name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => &named.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    struct_name,
                    "Bind can only be derived for structs with named fields",
                ))
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                struct_name,
                "Bind can only be derived for structs",
            ))
        }
    };

    // 先逐个解码到局部变量，全部完成后再用 ? 组装，保证所有失败都被记录
    let mut decodes = Vec::new();
    let mut assigns = Vec::new();
    for field in fields {
        let ident = field.ident.as_ref().expect("named field");
        let ty = &field.ty;
        let name = ident.to_string();
        let decode = match parse_field_spec(field)? {
            FieldSpec::Scalar { key, default } => {
                let default = match default {
                    Some(lit) => quote! { ::std::option::Option::Some(#lit) },
                    None => quote! { ::std::option::Option::None },
                };
                quote! { let #ident = __decoder.field::<#ty>(#name, #key, #default); }
            }
            FieldSpec::Nested { prefix } => {
                quote! { let #ident = __decoder.nested::<#ty>(#name, #prefix); }
            }
            FieldSpec::Skip => {
                quote! { let #ident = ::std::option::Option::Some(<#ty as ::std::default::Default>::default()); }
            }
        };
        decodes.push(decode);
        assigns.push(quote! { #ident: #ident? });
    }

    Ok(quote! {
        impl #impl_generics ::dyncfg::cfg::bind::Bind for #struct_name #ty_generics #where_clause {
            fn decode(__decoder: &mut ::dyncfg::cfg::bind::Decoder<'_>) -> ::std::option::Option<Self> {
                #(#decodes)*
                ::std::option::Option::Some(Self { #(#assigns),* })
            }
        }
    })
}

/// 为结构体生成 `Bind` 实现
///
/// # 字段属性
/// - `#[bind(key = "HTTP_PORT")]`：必填字段
/// - `#[bind(key = "HTTP_PORT", default = "8080")]`：带默认值
/// - `#[bind(nested)]` / `#[bind(nested, prefix = "DB_")]`：嵌套结构体
/// - `#[bind(skip)]`：不绑定，使用 `Default::default()`
///
/// # 示例
/// ```ignore
/// use dyncfg::cfg::Bind;
///
/// #[derive(Bind)]
/// struct Server {
///     #[bind(key = "HTTP_PORT", default = "8080")]
///     port: u16,
/// }
/// ```
#[proc_macro_derive(Bind, attributes(bind))]
pub fn bind_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(e) => TokenStream::from(e.to_compile_error()),
    }
}
