use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput};

#[proc_macro_derive(Bundle)]
pub fn derive_bundle_fn(input: TokenStream) -> TokenStream {
    let main_crate = quote!(::entity_store);

    let DeriveInput {
        ident,
        data,
        generics,
        ..
    } = parse_macro_input!(input as DeriveInput);

    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let fields = if let syn::Data::Struct(data) = data {
        data.fields
    } else {
        return syn::Error::new(ident.span(), "`Bundle` can only be derived for structs")
            .to_compile_error()
            .into();
    };

    let field_impls = fields
        .iter()
        .enumerate()
        .map(|(i, field)| {
            let field_ty = &field.ty;

            let offset = if let Some(field_ident) = &field.ident {
                quote! {
                    #main_crate::private::offset_of!(Self, #field_ident)
                }
            } else {
                let i = syn::Index::from(i);
                quote! {
                    #main_crate::private::offset_of!(Self, #i)
                }
            };

            quote! {
                #main_crate::BundleField {
                    descriptor: #main_crate::TypeDescriptor::of::<#field_ty>(),
                    offset: #offset,
                },
            }
        });

    let mut field_tokens = proc_macro2::TokenStream::new();
    field_tokens.extend(field_impls);

    quote! {
        unsafe impl #impl_generics #main_crate::Bundle for #ident #ty_generics #where_clause {
            fn fields() -> #main_crate::BundleFields {
                #main_crate::private::smallvec![#field_tokens]
            }
        }
    }
    .into()
}
