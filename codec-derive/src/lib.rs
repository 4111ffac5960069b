//! The Decode and Encode derive macros.
//!
//! ```
//! # use codec_derive::{Decode, Encode};
//! #
//! #[derive(Decode, Encode)]
//! # struct S;
//! ```
//!
//! Both macros support structs with named fields, tuple structs and unit
//! structs. Fields are encoded and decoded in declaration order. Message
//! discrimination does not happen here: on a CAN bus the frame type is
//! carried by the arbitration id, so there is no need for tagged enums.
extern crate proc_macro;

use proc_macro2::TokenStream;
use quote::{quote, quote_spanned};
use syn::spanned::Spanned;
use syn::{
    parse_macro_input, parse_quote, Data, DeriveInput, Error, Fields, GenericParam, Generics,
    Index, Result, TypeParamBound,
};

/// The `Decode` derive macro.
#[proc_macro_derive(Decode)]
pub fn decode_derive(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let mut input = parse_macro_input!(input as DeriveInput);

    let name = &input.ident;

    add_trait_bounds(&mut input.generics, &parse_quote!(::codec::Decode));
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    decode_data(&input)
        .map(|impl_decode| {
            quote! {
                impl #impl_generics ::codec::Decode for #name #ty_generics #where_clause {
                    fn decode<ReadBufferMacroInternal: ::codec::decode::ReadBuffer>(
                        read_buffer: &mut ReadBufferMacroInternal
                    ) -> Result<Self, ReadBufferMacroInternal::Error> {
                        #impl_decode
                    }
                }
            }
        })
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

/// The `Encode` derive macro.
#[proc_macro_derive(Encode)]
pub fn encode_derive(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let mut input = parse_macro_input!(input as DeriveInput);

    let name = &input.ident;

    add_trait_bounds(&mut input.generics, &parse_quote!(::codec::Encode));
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    encode_data(&input)
        .map(|impl_encode| {
            quote! {
                impl #impl_generics ::codec::Encode for #name #ty_generics #where_clause {
                    fn encode<WriteBufferMacroInternal: ::codec::encode::WriteBuffer>(
                        &self,
                        write_buffer: &mut WriteBufferMacroInternal
                    ) -> Result<usize, WriteBufferMacroInternal::Error> {
                        #impl_encode
                    }
                }
            }
        })
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

fn add_trait_bounds(generics: &mut Generics, bound: &TypeParamBound) {
    for param in &mut generics.params {
        if let GenericParam::Type(type_param) = param {
            type_param.bounds.push(bound.clone());
        }
    }
}

fn struct_fields(input: &DeriveInput) -> Result<&Fields> {
    match &input.data {
        Data::Struct(data) => Ok(&data.fields),
        Data::Enum(_) | Data::Union(_) => Err(Error::new(
            input.ident.span(),
            "Decode and Encode can only be derived for structs",
        )),
    }
}

fn decode_data(input: &DeriveInput) -> Result<TokenStream> {
    let name = &input.ident;

    match struct_fields(input)? {
        Fields::Named(fields) => {
            let impl_fields = fields.named.iter().map(|field| {
                let field_name = &field.ident;
                let field_ty = &field.ty;

                quote_spanned! { field.span() =>
                    #field_name: <#field_ty as ::codec::Decode>::decode(read_buffer)?
                }
            });

            Ok(quote! {
                Ok(#name {
                    #(#impl_fields),*
                })
            })
        }

        Fields::Unnamed(fields) => {
            let impl_fields = fields.unnamed.iter().map(|field| {
                let field_ty = &field.ty;

                quote_spanned! { field.span() =>
                    <#field_ty as ::codec::Decode>::decode(read_buffer)?
                }
            });

            Ok(quote! {
                Ok(#name(#(#impl_fields),*))
            })
        }

        Fields::Unit => Ok(quote!(Ok(#name))),
    }
}

fn encode_data(input: &DeriveInput) -> Result<TokenStream> {
    match struct_fields(input)? {
        Fields::Named(fields) => {
            let impl_fields = fields.named.iter().map(|field| {
                let field_name = &field.ident;

                quote_spanned! { field.span() =>
                    ::codec::Encode::encode(&self.#field_name, write_buffer)?
                }
            });

            Ok(quote! {
                Ok(0 #(+ #impl_fields)*)
            })
        }

        Fields::Unnamed(fields) => {
            let impl_fields = fields.unnamed.iter().enumerate().map(|(index, field)| {
                let index = Index::from(index);

                quote_spanned! { field.span() =>
                    ::codec::Encode::encode(&self.#index, write_buffer)?
                }
            });

            Ok(quote! {
                Ok(0 #(+ #impl_fields)*)
            })
        }

        Fields::Unit => Ok(quote!(Ok(0))),
    }
}
