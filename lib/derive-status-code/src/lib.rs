// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `#[derive(StatusCode)]` for fieldless error enums.
//!
//! Errors cross the boundary to the update orchestrator as plain integers.
//! The derive generates `From<E>` for `u16` and `u32`, plus `TryFrom<u32>`
//! going the other way. The enum must be fieldless, should carry a
//! `#[repr(u32)]`, and must also derive `num_derive::FromPrimitive` (the
//! reverse conversion is built on it, so the deriving crate needs
//! `num-traits` as a dependency).

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields};

#[proc_macro_derive(StatusCode)]
pub fn derive(input: TokenStream) -> TokenStream {
    let DeriveInput { ident, data, .. } = parse_macro_input!(input);

    let Data::Enum(e) = &data else {
        return syn::Error::new(
            ident.span(),
            "StatusCode can only be derived for enums",
        )
        .to_compile_error()
        .into();
    };
    if let Some(v) = e.variants.iter().find(|v| !matches!(v.fields, Fields::Unit))
    {
        return syn::Error::new(
            v.ident.span(),
            "StatusCode variants must not carry data",
        )
        .to_compile_error()
        .into();
    }

    let output = quote! {
        impl From<#ident> for u16 {
            fn from(v: #ident) -> Self {
                v as u16
            }
        }
        impl From<#ident> for u32 {
            fn from(v: #ident) -> Self {
                v as u32
            }
        }
        impl core::convert::TryFrom<u32> for #ident {
            type Error = ();
            fn try_from(v: u32) -> Result<Self, Self::Error> {
                <Self as ::num_traits::FromPrimitive>::from_u32(v).ok_or(())
            }
        }
    };
    output.into()
}
