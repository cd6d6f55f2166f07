use proc_macro::TokenStream;
use proc_macro2::{Ident, Span, TokenStream as TokenStream2};
use proc_macro_crate::{FoundCrate, crate_name};
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Field, Fields, LitStr, parse_macro_input};

/// Generates typed field lenses for a serde model.
///
/// Each named field gets a `{Model}{Field}Lens` implementing
/// `calmform::form::FieldLens`, reachable through `Model::fields()`. The lens
/// key is the field name, or the value of `#[form(key = "...")]` when the
/// serialized name differs.
#[proc_macro_derive(FormModel, attributes(form))]
pub fn derive_form_model(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    if !input.generics.params.is_empty() {
        return syn::Error::new_spanned(
            input.ident,
            "FormModel derive currently supports only non-generic structs",
        )
        .to_compile_error()
        .into();
    }

    let model_ident = input.ident;
    let fields_struct_ident = format_ident!("{model_ident}Fields");

    let named_fields = match input.data {
        Data::Struct(data) => match data.fields {
            Fields::Named(fields) => fields.named,
            _ => {
                return syn::Error::new(
                    Span::call_site(),
                    "FormModel derive requires a struct with named fields",
                )
                .to_compile_error()
                .into();
            }
        },
        _ => {
            return syn::Error::new(
                Span::call_site(),
                "FormModel derive is only supported on structs",
            )
            .to_compile_error()
            .into();
        }
    };

    let calmform = calmform_path();
    let mut lens_defs = Vec::new();
    let mut fields_methods = Vec::new();
    let mut keys = Vec::new();

    for field in named_fields {
        let key = match field_key(&field) {
            Ok(key) => key,
            Err(error) => return error.to_compile_error().into(),
        };
        let Some(field_ident) = field.ident else {
            continue;
        };
        let field_ty = field.ty;
        let field_name = field_ident.to_string();
        let lens_ident = format_ident!("{model_ident}{}Lens", to_pascal_case(&field_name));

        lens_defs.push(quote! {
            #[derive(Clone, Copy, Debug, Default)]
            pub struct #lens_ident;

            impl #calmform::form::FieldLens for #lens_ident {
                type Model = #model_ident;
                type Value = #field_ty;

                fn key(self) -> #calmform::form::FieldKey {
                    #calmform::form::FieldKey::new(#key)
                }
            }
        });

        fields_methods.push(quote! {
            pub const fn #field_ident(&self) -> #lens_ident {
                #lens_ident
            }
        });

        keys.push(quote! { #calmform::form::FieldKey::new(#key) });
    }

    quote! {
        #[derive(Clone, Copy, Debug, Default)]
        pub struct #fields_struct_ident;

        impl #fields_struct_ident {
            #(#fields_methods)*
        }

        impl #calmform::form::FormModel for #model_ident {
            type Fields = #fields_struct_ident;

            fn fields() -> Self::Fields {
                #fields_struct_ident
            }

            fn field_keys() -> &'static [#calmform::form::FieldKey] {
                const KEYS: &[#calmform::form::FieldKey] = &[#(#keys),*];
                KEYS
            }
        }

        #(#lens_defs)*
    }
    .into()
}

fn field_key(field: &Field) -> syn::Result<String> {
    let mut key = field.ident.as_ref().map(ToString::to_string);
    for attr in &field.attrs {
        if !attr.path().is_ident("form") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("key") {
                let value: LitStr = meta.value()?.parse()?;
                key = Some(value.value());
                Ok(())
            } else {
                Err(meta.error("unsupported form attribute, expected `key = \"...\"`"))
            }
        })?;
    }
    key.ok_or_else(|| syn::Error::new_spanned(field, "FormModel fields must be named"))
}

fn calmform_path() -> TokenStream2 {
    match crate_name("calmform") {
        Ok(FoundCrate::Name(name)) => {
            let ident = Ident::new(&name, Span::call_site());
            quote!(::#ident)
        }
        Ok(FoundCrate::Itself) => quote!(crate),
        Err(_) => quote!(::calmform),
    }
}

fn to_pascal_case(input: &str) -> String {
    let mut out = String::new();
    for segment in input.split('_') {
        if segment.is_empty() {
            continue;
        }
        let mut chars = segment.chars();
        if let Some(first) = chars.next() {
            out.push(first.to_ascii_uppercase());
            out.push_str(chars.as_str());
        }
    }
    out
}
