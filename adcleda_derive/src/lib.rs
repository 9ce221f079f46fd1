use proc_macro::TokenStream;
use quote::quote;
use syn::{
    parse_macro_input,
    DeriveInput,
    LitInt,
};

#[proc_macro_derive(WordSerde)]
/// Derived on a packed_struct to move it over a transport as big-endian bytes.
/// Expects `Serialize`, `Deserialize` and `PackedStruct` to be in scope.
pub fn derive_word_serde(tokens: TokenStream) -> TokenStream {
    let input = parse_macro_input!(tokens as DeriveInput);
    let name = input.ident;
    let generated = quote! {
        impl Serialize for #name {
            type Chunk = <Self as PackedStruct>::ByteArray;

            fn serialize(&self) -> Result<Self::Chunk, ::packed_struct::PackingError> {
                self.pack()
            }
        }

        impl Deserialize for #name {
            type Chunk = <Self as PackedStruct>::ByteArray;

            fn deserialize(chunk: Self::Chunk) -> Result<Self, ::packed_struct::PackingError> {
                Self::unpack(&chunk)
            }
        }
    };
    TokenStream::from(generated)
}

#[proc_macro_attribute]
/// Attach the 8-bit serial register address to an ADC register struct.
/// Expects the `Address` trait to be in scope.
pub fn address(attr: TokenStream, item: TokenStream) -> TokenStream {
    let lit = parse_macro_input!(attr as LitInt);
    let addr = match lit.base10_parse::<u8>() {
        Ok(v) => v,
        Err(e) => return e.to_compile_error().into(),
    };
    let item = parse_macro_input!(item as DeriveInput);
    let ident = &item.ident;

    let generated = quote! {
        #item

        impl Address for #ident {
            const ADDRESS: u8 = #addr;
        }
    };
    TokenStream::from(generated)
}
