use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Data, DeriveInput, Fields, Ident, LitStr, Type, parse_macro_input, spanned::Spanned};

/// Derives `entityrepo::Entity` and `entityrepo::EntityModel`.
///
/// Struct attribute: `#[entity(table = "...")]` (defaults to the snake_case
/// struct name).
///
/// Field attribute: `#[sql(key)]`, `#[sql(key, identity)]`,
/// `#[sql(foreign_key)]`, `#[sql(column)]`, `#[sql(column = "...")]`.
/// Key fields are always mapped columns.
#[proc_macro_derive(Entity, attributes(entity, sql))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand_entity(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

struct EntityOptions {
    table_name: Option<String>,
}

#[derive(Default)]
struct SqlFieldOptions {
    key: bool,
    identity: bool,
    foreign_key: bool,
    column: bool,
    column_name: Option<String>,
}

struct EntityField {
    ident: Ident,
    ty: Type,
    options: SqlFieldOptions,
}

fn expand_entity(input: DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = input.ident;

    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            input.generics,
            "Entity does not support generic structs",
        ));
    }

    let entity_options = parse_entity_options(&input.attrs)?;

    let data_struct = match input.data {
        Data::Struct(data) => data,
        _ => {
            return Err(syn::Error::new(
                struct_name.span(),
                "Entity can only be derived for structs",
            ));
        }
    };

    let named_fields = match data_struct.fields {
        Fields::Named(fields) => fields,
        _ => {
            return Err(syn::Error::new(
                struct_name.span(),
                "Entity requires named fields",
            ));
        }
    };

    let mut fields = Vec::<EntityField>::new();
    for field in named_fields.named {
        let ident = field
            .ident
            .clone()
            .ok_or_else(|| syn::Error::new(field.span(), "Entity requires named fields"))?;
        let options = parse_sql_field_options(&field.attrs)?;
        fields.push(EntityField {
            ident,
            ty: field.ty,
            options,
        });
    }

    if fields.is_empty() {
        return Err(syn::Error::new(
            struct_name.span(),
            "Entity requires at least one field",
        ));
    }

    let entity_name = struct_name.to_string();
    let table_name = entity_options
        .table_name
        .unwrap_or_else(|| to_snake_case(&entity_name));

    let property_names: Vec<String> = fields.iter().map(|f| f.ident.to_string()).collect();
    let field_idents: Vec<&Ident> = fields.iter().map(|f| &f.ident).collect();
    let field_types: Vec<&Type> = fields.iter().map(|f| &f.ty).collect();

    let descriptors = fields.iter().zip(&property_names).map(|(field, name)| {
        let ty = &field.ty;
        let column = field
            .options
            .column_name
            .clone()
            .unwrap_or_else(|| name.clone());
        let key = field.options.key;
        let identity = field.options.identity;
        let foreign_key = field.options.foreign_key;
        let column_annotated = field.options.column || field.options.key;
        quote! {
            ::entityrepo::entity::PropertyDescriptor {
                name: #name,
                column: #column,
                data_type: <#ty as ::entityrepo::core::FieldValue>::DATA_TYPE,
                nullable: <#ty as ::entityrepo::core::FieldValue>::NULLABLE,
                key: #key,
                identity: #identity,
                foreign_key: #foreign_key,
                column_annotated: #column_annotated,
            }
        }
    });

    Ok(quote! {
        impl ::entityrepo::entity::Entity for #struct_name {
            fn entity_type(&self) -> &'static ::entityrepo::entity::EntityType {
                <Self as ::entityrepo::entity::EntityModel>::descriptor()
            }

            fn get_value(&self, property: &str) -> ::std::option::Option<::entityrepo::core::Value> {
                match property {
                    #(
                        #property_names => ::std::option::Option::Some(
                            ::entityrepo::core::FieldValue::to_value(&self.#field_idents)
                        ),
                    )*
                    _ => ::std::option::Option::None,
                }
            }

            fn set_value(
                &mut self,
                property: &str,
                value: ::entityrepo::core::Value,
            ) -> ::entityrepo::core::Result<()> {
                match property {
                    #(
                        #property_names => {
                            self.#field_idents =
                                <#field_types as ::entityrepo::core::FieldValue>::from_value(value)?;
                            ::std::result::Result::Ok(())
                        }
                    )*
                    _ => ::std::result::Result::Err(
                        ::entityrepo::core::RepoError::property_not_found(#entity_name, property)
                    ),
                }
            }

            fn clone_entity(&self) -> ::std::boxed::Box<dyn ::entityrepo::entity::Entity> {
                ::std::boxed::Box::new(::std::clone::Clone::clone(self))
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn into_any(self: ::std::boxed::Box<Self>) -> ::std::boxed::Box<dyn ::std::any::Any> {
                self
            }
        }

        impl ::entityrepo::entity::EntityModel for #struct_name {
            fn descriptor() -> &'static ::entityrepo::entity::EntityType {
                fn construct() -> ::std::boxed::Box<dyn ::entityrepo::entity::Entity> {
                    ::std::boxed::Box::new(<#struct_name as ::std::default::Default>::default())
                }

                static PROPERTIES: &[::entityrepo::entity::PropertyDescriptor] = &[
                    #( #descriptors, )*
                ];

                static ENTITY_TYPE: ::entityrepo::entity::EntityType =
                    ::entityrepo::entity::EntityType {
                        name: #entity_name,
                        table: #table_name,
                        properties: PROPERTIES,
                        construct,
                    };

                &ENTITY_TYPE
            }
        }
    })
}

fn parse_entity_options(attrs: &[syn::Attribute]) -> syn::Result<EntityOptions> {
    let mut options = EntityOptions { table_name: None };

    for attr in attrs {
        if !attr.path().is_ident("entity") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("table") {
                let value = meta.value()?;
                let lit: LitStr = value.parse()?;
                options.table_name = Some(lit.value());
                return Ok(());
            }

            Err(meta.error("Unsupported entity attribute. Supported: table = \"...\""))
        })?;
    }

    Ok(options)
}

fn parse_sql_field_options(attrs: &[syn::Attribute]) -> syn::Result<SqlFieldOptions> {
    let mut parsed = SqlFieldOptions::default();
    let mut seen = false;

    for attr in attrs {
        if !attr.path().is_ident("sql") {
            continue;
        }

        if seen {
            return Err(syn::Error::new(
                attr.span(),
                "Duplicate #[sql(...)] attribute on field",
            ));
        }
        seen = true;

        match &attr.meta {
            syn::Meta::List(list) => {
                list.parse_nested_meta(|meta| {
                    if meta.path.is_ident("key") {
                        parsed.key = true;
                        return Ok(());
                    }

                    if meta.path.is_ident("identity") {
                        parsed.identity = true;
                        return Ok(());
                    }

                    if meta.path.is_ident("foreign_key") {
                        parsed.foreign_key = true;
                        return Ok(());
                    }

                    if meta.path.is_ident("column") || meta.path.is_ident("name") {
                        parsed.column = true;
                        if meta.input.peek(syn::Token![=]) {
                            let value = meta.value()?;
                            let lit: LitStr = value.parse()?;
                            parsed.column_name = Some(lit.value());
                        }
                        return Ok(());
                    }

                    Err(meta.error(
                        "Unsupported #[sql(...)] option. Supported: key, identity, foreign_key, column, column = \"...\"",
                    ))
                })?;
            }
            _ => {
                return Err(syn::Error::new(
                    attr.span(),
                    "Use #[sql(key)], #[sql(key, identity)], #[sql(foreign_key)] or #[sql(column = \"...\")]",
                ));
            }
        }

        if parsed.identity && !parsed.key {
            return Err(syn::Error::new(
                attr.span(),
                "#[sql(identity)] is only valid together with key",
            ));
        }

        if parsed.key && parsed.foreign_key {
            return Err(syn::Error::new(
                attr.span(),
                "a field cannot be both key and foreign_key",
            ));
        }
    }

    Ok(parsed)
}

fn to_snake_case(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 4);
    for (index, ch) in value.chars().enumerate() {
        if ch.is_uppercase() {
            if index > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
