//! Rust declaration query

pub const DECLARATIONS: &str = r#"
; Free functions
(function_item
  name: (identifier) @name) @definition.function

; Methods and associated functions inside impl blocks
(impl_item
  body: (declaration_list
    (function_item
      name: (identifier) @name) @definition.method))

; Trait-provided methods
(trait_item
  body: (declaration_list
    (function_item
      name: (identifier) @name) @definition.method))

; ADTs
(struct_item
  name: (type_identifier) @name) @definition.struct

(enum_item
  name: (type_identifier) @name) @definition.enum

(union_item
  name: (type_identifier) @name) @definition.struct

; Type aliases
(type_item
  name: (type_identifier) @name) @definition.type_alias

; Traits
(trait_item
  name: (type_identifier) @name) @definition.trait

; Modules
(mod_item
  name: (identifier) @name) @definition.module

; Macros
(macro_definition
  name: (identifier) @name) @definition.macro

; Constants and statics
(const_item
  name: (identifier) @name) @definition.constant

(static_item
  name: (identifier) @name) @definition.variable
"#;
